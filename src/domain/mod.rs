//! Domain models - core business types
//!
//! This module contains the canonical data types used throughout the system:
//! - `DetectionRoom` - room configuration (cylinder tags, sensor, timeouts)
//! - `Rule` - box code to room routing rule
//! - `Job` - a declared box bound to its assigned room
//! - `ScanEvent` - raw scan from a room's scanner

pub mod job;
pub mod types;

pub use job::{Job, RoomStatus};
pub use types::{
    extract_box_code, find_rule, Cylinder, CylinderTags, DetectionRoom, Direction, JobId, RoomId,
    RoomTimeouts, Rule, ScanEvent,
};
