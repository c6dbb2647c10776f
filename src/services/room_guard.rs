//! Per-room control flow guard
//!
//! At most one control flow runs per room. A request that finds its room
//! busy is dropped, not queued. The single lock covers only the flag
//! check/set, never the actuation sequence itself.

use crate::domain::types::RoomId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct RoomGuard {
    busy: Mutex<FxHashMap<RoomId, bool>>,
}

impl RoomGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the room busy. Returns false if a flow already holds it.
    pub fn try_enter(&self, room_id: RoomId) -> bool {
        let mut busy = self.busy.lock();
        let flag = busy.entry(room_id).or_insert(false);
        if *flag {
            false
        } else {
            *flag = true;
            true
        }
    }

    pub fn exit(&self, room_id: RoomId) {
        if let Some(flag) = self.busy.lock().get_mut(&room_id) {
            *flag = false;
        }
    }

    pub fn is_busy(&self, room_id: RoomId) -> bool {
        self.busy.lock().get(&room_id).copied().unwrap_or(false)
    }

    /// Enter the room and get a permit that exits on drop (including when
    /// the owning task unwinds)
    pub fn try_acquire(self: &Arc<Self>, room_id: RoomId) -> Option<RoomPermit> {
        if self.try_enter(room_id) {
            Some(RoomPermit { guard: Arc::clone(self), room_id })
        } else {
            None
        }
    }
}

/// Held for the duration of one control flow
pub struct RoomPermit {
    guard: Arc<RoomGuard>,
    room_id: RoomId,
}

impl RoomPermit {
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }
}

impl Drop for RoomPermit {
    fn drop(&mut self) {
        self.guard.exit(self.room_id);
    }
}
