//! IO modules - external system interfaces
//!
//! - `plc` - PLC link seam and the simulated PLC
//! - `scanner` - Serial barcode scanners feeding the scan channel
//! - `alarm` - Alarm sink and JSONL alarm writer
//! - `declare_listener` - TCP line protocol for manual box declaration

pub mod alarm;
pub mod declare_listener;
pub mod plc;
pub mod scanner;

// Re-export commonly used types
pub use alarm::{create_alarm_channel, Alarm, AlarmChannel, AlarmKind, AlarmSink, AlarmWriter, MemoryAlarmSink};
pub use declare_listener::{start_declare_listener, DeclareListenerConfig};
pub use plc::{PlcError, PlcLink, SimulatedPlc, TagWrite};
pub use scanner::{LineSplitter, ScannerPort};
