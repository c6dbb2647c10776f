//! Job data model: one physical box instance routed to one detection room

use crate::domain::types::{JobId, RoomId};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Detection status of a job in its assigned room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Undetected,
    Detecting,
    Complete,
}

impl RoomStatus {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Undetected => "undetected",
            RoomStatus::Detecting => "detecting",
            RoomStatus::Complete => "complete",
        }
    }
}

/// A declared box bound to its assigned room
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub box_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_order: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inspector_id: Option<String>,
    /// Set once at admission
    pub room_id: RoomId,
    pub room_name: String,
    pub rule_id: i64,
    pub status: RoomStatus,
    /// Scans seen at the assigned room
    pub scan_count: u32,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
}

impl Job {
    pub fn new(id: JobId, box_code: &str, room_id: RoomId, room_name: &str, rule_id: i64) -> Self {
        Self {
            id,
            box_code: box_code.to_string(),
            work_order: None,
            inspector_id: None,
            room_id,
            room_name: room_name.to_string(),
            rule_id,
            status: RoomStatus::Undetected,
            scan_count: 0,
            started_at: epoch_ms(),
            ended_at: None,
        }
    }

    pub fn with_work_order(mut self, work_order: Option<String>) -> Self {
        self.work_order = work_order;
        self
    }

    pub fn with_inspector(mut self, inspector_id: Option<String>) -> Self {
        self.inspector_id = inspector_id;
        self
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.status == RoomStatus::Complete
    }

    /// Counts toward the room's admission capacity
    #[inline]
    pub fn is_queued_at(&self, room_id: RoomId) -> bool {
        self.room_id == room_id && self.status == RoomStatus::Undetected
    }

    /// First scan: box is at the room, detection begins
    pub fn begin_detection(&mut self) {
        self.status = RoomStatus::Detecting;
        self.started_at = epoch_ms();
    }

    /// Second scan: detection finished
    pub fn complete(&mut self) {
        self.status = RoomStatus::Complete;
        self.ended_at = Some(epoch_ms());
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
