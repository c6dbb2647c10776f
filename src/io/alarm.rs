//! Operator alarms
//!
//! The engine raises alarms through `AlarmSink::record`, which must never
//! block or fail. The host wires `AlarmChannel`, a bounded queue drained by
//! `AlarmWriter` into a JSONL file (one alarm per line).

use crate::domain::types::RoomId;
use crate::infra::metrics::Metrics;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

/// Alarm classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    CylinderTimeout,
    SensorTimeout,
    /// Re-confirmation still shows the wrong position; release is unsafe
    SafetyInterlock,
    FlowError,
    NoRoomConfigured,
    RoomsFull,
    PlcDisconnected,
}

impl AlarmKind {
    pub fn severity(&self) -> Severity {
        match self {
            AlarmKind::SafetyInterlock | AlarmKind::FlowError => Severity::Critical,
            _ => Severity::Warning,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmKind::CylinderTimeout => "cylinder_timeout",
            AlarmKind::SensorTimeout => "sensor_timeout",
            AlarmKind::SafetyInterlock => "safety_interlock",
            AlarmKind::FlowError => "flow_error",
            AlarmKind::NoRoomConfigured => "no_room_configured",
            AlarmKind::RoomsFull => "rooms_full",
            AlarmKind::PlcDisconnected => "plc_disconnected",
        }
    }
}

/// An operator-facing fault record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alarm {
    pub kind: AlarmKind,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

impl Alarm {
    pub fn new(kind: AlarmKind, title: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.to_string(),
            message: message.into(),
            room_id: None,
            room_name: None,
            device_name: None,
            remark: None,
        }
    }

    pub fn with_room(mut self, room_id: RoomId, room_name: &str) -> Self {
        self.room_id = Some(room_id);
        self.room_name = Some(room_name.to_string());
        self
    }

    pub fn with_device(mut self, device_name: &str) -> Self {
        self.device_name = Some(device_name.to_string());
        self
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = Some(remark.into());
        self
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }
}

/// Fire-and-forget alarm recording
pub trait AlarmSink: Send + Sync {
    fn record(&self, alarm: Alarm);
}

/// Keeps alarms in memory (commissioning tool, tests)
#[derive(Default)]
pub struct MemoryAlarmSink {
    alarms: Mutex<Vec<Alarm>>,
}

impl MemoryAlarmSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alarms(&self) -> Vec<Alarm> {
        self.alarms.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.alarms.lock().len()
    }
}

impl AlarmSink for MemoryAlarmSink {
    fn record(&self, alarm: Alarm) {
        self.alarms.lock().push(alarm);
    }
}

/// Persisted alarm line
#[derive(Debug, Serialize)]
struct AlarmRecord<'a> {
    id: String,
    ts: String,
    severity: Severity,
    #[serde(flatten)]
    alarm: &'a Alarm,
}

/// Non-blocking alarm sink feeding the JSONL writer
#[derive(Clone)]
pub struct AlarmChannel {
    tx: mpsc::Sender<Alarm>,
    metrics: Arc<Metrics>,
}

impl AlarmSink for AlarmChannel {
    fn record(&self, alarm: Alarm) {
        self.metrics.record_alarm();
        match alarm.severity() {
            Severity::Critical => error!(
                kind = %alarm.kind.as_str(),
                title = %alarm.title,
                message = %alarm.message,
                room = %alarm.room_name.as_deref().unwrap_or("-"),
                device = %alarm.device_name.as_deref().unwrap_or("-"),
                "alarm_raised"
            ),
            Severity::Warning => warn!(
                kind = %alarm.kind.as_str(),
                title = %alarm.title,
                message = %alarm.message,
                room = %alarm.room_name.as_deref().unwrap_or("-"),
                device = %alarm.device_name.as_deref().unwrap_or("-"),
                "alarm_raised"
            ),
        }

        match self.tx.try_send(alarm) {
            Ok(()) => {}
            Err(TrySendError::Full(alarm)) => {
                self.metrics.record_alarm_dropped();
                warn!(title = %alarm.title, "alarm_dropped: channel full");
            }
            Err(TrySendError::Closed(alarm)) => {
                debug!(title = %alarm.title, "alarm_channel_closed");
            }
        }
    }
}

/// Drains alarms into a JSONL file
pub struct AlarmWriter {
    file_path: String,
    rx: mpsc::Receiver<Alarm>,
}

impl AlarmWriter {
    pub async fn run(mut self) {
        info!(file_path = %self.file_path, "alarm_writer_started");
        while let Some(alarm) = self.rx.recv().await {
            self.write_alarm(&alarm);
        }
        info!("alarm_writer_stopped");
    }

    /// Returns true if the line was written
    pub fn write_alarm(&self, alarm: &Alarm) -> bool {
        let record = AlarmRecord {
            id: Uuid::now_v7().to_string(),
            ts: Utc::now().to_rfc3339(),
            severity: alarm.severity(),
            alarm,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "alarm_serialize_failed");
                return false;
            }
        };
        match self.append_line(&line) {
            Ok(()) => true,
            Err(e) => {
                error!(file = %self.file_path, error = %e, "alarm_write_failed");
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "alarm_written");
        Ok(())
    }
}

/// Create the alarm channel and its writer
///
/// Returns the sink (for the engine) and the writer (to be spawned)
pub fn create_alarm_channel(
    file_path: &str,
    buffer_size: usize,
    metrics: Arc<Metrics>,
) -> (AlarmChannel, AlarmWriter) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (AlarmChannel { tx, metrics }, AlarmWriter { file_path: file_path.to_string(), rx })
}
