//! PLC link seam and the in-memory simulated PLC
//!
//! The engine only needs three operations from a PLC: a connection flag,
//! `read_bool` and `write_bool` on symbolic tag addresses. Real transports
//! plug in behind `PlcLink`; `SimulatedPlc` models the two cylinders and the
//! presence sensor of each registered room so the gateway and the
//! commissioning tool can run without hardware.

use crate::domain::types::{CylinderTags, DetectionRoom, Direction};
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Writes kept by `SimulatedPlc` unless configured otherwise
pub const DEFAULT_WRITE_LOG_CAPACITY: usize = 4096;

/// PLC transport failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlcError {
    #[error("plc not connected")]
    NotConnected,
    #[error("transport error on {address}: {message}")]
    Transport { address: String, message: String },
}

/// Binary tag access to the PLC
#[async_trait]
pub trait PlcLink: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Read a boolean tag. Transport failures are reported, never retried here.
    async fn read_bool(&self, address: &str) -> Result<bool, PlcError>;

    async fn write_bool(&self, address: &str, value: bool) -> Result<(), PlcError>;
}

/// A recorded write, used by the commissioning tool and tests
#[derive(Debug, Clone, PartialEq)]
pub struct TagWrite {
    pub address: String,
    pub value: bool,
    pub at: Instant,
}

/// Simulated double-acting cylinder with bistable valve behaviour:
/// it travels toward the last commanded direction and reaches it after
/// `travel_time`.
#[derive(Debug)]
struct SimCylinder {
    tags: CylinderTags,
    position: Option<Direction>,
    moving: Option<(Direction, Instant)>,
}

impl SimCylinder {
    fn new(tags: CylinderTags, position: Direction) -> Self {
        Self { tags, position: Some(position), moving: None }
    }

    fn command(&mut self, direction: Direction, now: Instant) {
        let already_heading = match self.moving {
            Some((dir, _)) => dir == direction,
            None => self.position == Some(direction),
        };
        if !already_heading {
            self.position = None;
            self.moving = Some((direction, now));
        }
    }

    fn settle(&mut self, now: Instant, travel_time: Duration) {
        if let Some((dir, since)) = self.moving {
            if now.duration_since(since) >= travel_time {
                self.position = Some(dir);
                self.moving = None;
            }
        }
    }

    fn feedback(&self, address: &str) -> Option<bool> {
        if self.tags.extend_feedback() == Some(address) {
            return Some(self.position == Some(Direction::Extend));
        }
        if self.tags.retract_feedback() == Some(address) {
            return Some(self.position == Some(Direction::Retract));
        }
        None
    }
}

/// Presence sensor that sees a box whenever its room's blocking cylinder is
/// retracted (the box rolls up to the sensor once released)
#[derive(Debug)]
struct SimSensor {
    address: String,
    blocking: usize,
}

#[derive(Debug, Default)]
struct SimState {
    tags: FxHashMap<String, bool>,
    forced: FxHashMap<String, bool>,
    failing: FxHashMap<String, String>,
    cylinders: Vec<SimCylinder>,
    sensors: Vec<SimSensor>,
    write_log: VecDeque<TagWrite>,
    write_log_capacity: usize,
    /// Sequence number of the last `true` write per address
    last_set: FxHashMap<String, u64>,
    write_seq: u64,
    reads: FxHashMap<String, u64>,
}

/// In-memory PLC
pub struct SimulatedPlc {
    connected: AtomicBool,
    travel_time: Duration,
    state: Mutex<SimState>,
}

impl SimulatedPlc {
    pub fn new(travel_time: Duration) -> Self {
        Self {
            connected: AtomicBool::new(true),
            travel_time,
            state: Mutex::new(SimState {
                write_log_capacity: DEFAULT_WRITE_LOG_CAPACITY,
                ..SimState::default()
            }),
        }
    }

    /// Keep at most `capacity` recent writes; 0 disables recording
    pub fn with_write_log_capacity(self, capacity: usize) -> Self {
        {
            let mut state = self.state.lock();
            state.write_log_capacity = capacity;
            while state.write_log.len() > capacity {
                state.write_log.pop_front();
            }
        }
        self
    }

    /// Register a room: blocking cylinder starts extended, push retracted
    pub fn with_room(self, room: &DetectionRoom) -> Self {
        self.add_room(room);
        self
    }

    pub fn add_room(&self, room: &DetectionRoom) {
        let mut state = self.state.lock();
        let blocking = state.cylinders.len();
        state.cylinders.push(SimCylinder::new(room.blocking.clone(), Direction::Extend));
        state.cylinders.push(SimCylinder::new(room.push.clone(), Direction::Retract));
        if let Some(sensor) = room.sensor() {
            state.sensors.push(SimSensor { address: sensor.to_string(), blocking });
        }
        debug!(room_id = %room.id, room = %room.name, "sim_plc_room_registered");
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Pin a tag to a fixed read value (jammed sensor, broken feedback switch)
    pub fn force(&self, address: &str, value: bool) {
        self.state.lock().forced.insert(address.to_string(), value);
    }

    pub fn release(&self, address: &str) {
        self.state.lock().forced.remove(address);
    }

    /// Make every read of `address` fail with a transport error
    pub fn fail_reads(&self, address: &str, message: &str) {
        self.state.lock().failing.insert(address.to_string(), message.to_string());
    }

    /// Last written value of an output tag
    pub fn output(&self, address: &str) -> Option<bool> {
        self.state.lock().tags.get(address).copied()
    }

    /// Recent writes, oldest first
    pub fn write_log(&self) -> Vec<TagWrite> {
        self.state.lock().write_log.iter().cloned().collect()
    }

    pub fn clear_write_log(&self) {
        self.state.lock().write_log.clear();
    }

    /// The output of a cylinder most recently written `true`
    pub fn last_commanded(&self, tags: &CylinderTags) -> Option<Direction> {
        let state = self.state.lock();
        let seq = |addr: Option<&str>| addr.and_then(|a| state.last_set.get(a).copied());
        match (seq(tags.extend()), seq(tags.retract())) {
            (Some(e), Some(r)) if e > r => Some(Direction::Extend),
            (Some(_), Some(_)) => Some(Direction::Retract),
            (Some(_), None) => Some(Direction::Extend),
            (None, Some(_)) => Some(Direction::Retract),
            (None, None) => None,
        }
    }

    /// Number of reads issued against `address`
    pub fn read_count(&self, address: &str) -> u64 {
        self.state.lock().reads.get(address).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PlcLink for SimulatedPlc {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn read_bool(&self, address: &str) -> Result<bool, PlcError> {
        if !self.is_connected() {
            return Err(PlcError::NotConnected);
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        *state.reads.entry(address.to_string()).or_insert(0) += 1;
        if let Some(message) = state.failing.get(address) {
            return Err(PlcError::Transport {
                address: address.to_string(),
                message: message.clone(),
            });
        }
        if let Some(&value) = state.forced.get(address) {
            return Ok(value);
        }

        for cylinder in state.cylinders.iter_mut() {
            cylinder.settle(now, self.travel_time);
        }

        if let Some(value) = state.cylinders.iter().find_map(|c| c.feedback(address)) {
            trace!(address = %address, value = %value, "sim_plc_feedback_read");
            return Ok(value);
        }

        if let Some(sensor) = state.sensors.iter().find(|s| s.address == address) {
            let blocking = &state.cylinders[sensor.blocking];
            return Ok(blocking.position == Some(Direction::Retract));
        }

        Ok(state.tags.get(address).copied().unwrap_or(false))
    }

    async fn write_bool(&self, address: &str, value: bool) -> Result<(), PlcError> {
        if !self.is_connected() {
            return Err(PlcError::NotConnected);
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        state.tags.insert(address.to_string(), value);
        state.write_seq += 1;
        if value {
            let seq = state.write_seq;
            state.last_set.insert(address.to_string(), seq);
        }
        if state.write_log_capacity > 0 {
            if state.write_log.len() == state.write_log_capacity {
                state.write_log.pop_front();
            }
            state.write_log.push_back(TagWrite { address: address.to_string(), value, at: now });
        }

        if value {
            for cylinder in state.cylinders.iter_mut() {
                if cylinder.tags.extend() == Some(address) {
                    cylinder.command(Direction::Extend, now);
                } else if cylinder.tags.retract() == Some(address) {
                    cylinder.command(Direction::Retract, now);
                }
            }
        }
        Ok(())
    }
}
