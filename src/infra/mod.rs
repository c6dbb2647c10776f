//! Infrastructure - configuration, catalog and metrics
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `catalog` - Room and rule snapshots (reloadable)
//! - `metrics` - Lock-free metrics collection

pub mod catalog;
pub mod config;
pub mod metrics;

// Re-export commonly used types
pub use catalog::{Catalog, RoomConfigSource, RuleSource};
pub use config::{Config, ControlSettings};
pub use metrics::Metrics;
