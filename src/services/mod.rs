//! Services - the routing and actuation engine
//!
//! - `actuator` - Pulse-then-hold cylinder protocol
//! - `sensor` - Presence sensor wait
//! - `room_guard` - One control flow per room
//! - `room_control` - Matched / unmatched release sequence
//! - `admission` - Rule matching and per-room capacity
//! - `job_store` - In-memory jobs and scan bookkeeping
//! - `dispatcher` - Scan event processor and manual declaration
//! - `status_monitor` - PLC and scanner connection polling

pub mod actuator;
pub mod admission;
pub mod dispatcher;
pub mod job_store;
pub mod room_control;
pub mod room_guard;
pub mod sensor;
pub mod status_monitor;

// Re-export commonly used types
pub use actuator::{actuate_cylinder, drive, CylinderStep};
pub use admission::{try_admit, AdmissionRejection, AssignedRoom};
pub use dispatcher::Dispatcher;
pub use job_store::{Declaration, JobStore, ScanDecision};
pub use room_control::{FlowKind, FlowOutcome, FlowPhase, RoomController};
pub use room_guard::{RoomGuard, RoomPermit};
pub use sensor::wait_for_sensor;
pub use status_monitor::{StatusMonitor, StatusSnapshot};
