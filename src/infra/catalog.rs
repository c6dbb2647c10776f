//! Room and rule catalog
//!
//! Rooms and rules are owned by an external configuration service. The
//! engine only reads snapshots through `RoomConfigSource` / `RuleSource`;
//! the host replaces the snapshot when the configuration changes.

use crate::domain::types::{DetectionRoom, RoomId, Rule};
use crate::infra::config::Config;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// Read-only room snapshot provider
pub trait RoomConfigSource: Send + Sync {
    fn rooms(&self) -> Arc<Vec<DetectionRoom>>;

    fn room(&self, room_id: RoomId) -> Option<DetectionRoom> {
        self.rooms().iter().find(|r| r.id == room_id).cloned()
    }
}

/// Read-only rule snapshot provider
pub trait RuleSource: Send + Sync {
    fn rules(&self) -> Arc<Vec<Rule>>;
}

/// In-memory catalog backed by the TOML config
pub struct Catalog {
    rooms: RwLock<Arc<Vec<DetectionRoom>>>,
    rules: RwLock<Arc<Vec<Rule>>>,
}

impl Catalog {
    pub fn new(rooms: Vec<DetectionRoom>, rules: Vec<Rule>) -> Self {
        Self { rooms: RwLock::new(Arc::new(rooms)), rules: RwLock::new(Arc::new(rules)) }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.rooms().to_vec(), config.rules().to_vec())
    }

    /// Swap in a new snapshot; flows already running keep the old one
    pub fn replace(&self, rooms: Vec<DetectionRoom>, rules: Vec<Rule>) {
        let room_count = rooms.len();
        let rule_count = rules.len();
        *self.rooms.write() = Arc::new(rooms);
        *self.rules.write() = Arc::new(rules);
        info!(rooms = %room_count, rules = %rule_count, "catalog_replaced");
    }

    /// Re-read rooms and rules from a config file
    pub fn reload_from_file(&self, path: &str) -> anyhow::Result<()> {
        let config = Config::from_file(path)?;
        self.replace(config.rooms().to_vec(), config.rules().to_vec());
        Ok(())
    }
}

impl RoomConfigSource for Catalog {
    fn rooms(&self) -> Arc<Vec<DetectionRoom>> {
        self.rooms.read().clone()
    }
}

impl RuleSource for Catalog {
    fn rules(&self) -> Arc<Vec<Rule>> {
        self.rules.read().clone()
    }
}
