//! Shared types for the detection gateway

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Newtype wrapper for detection room IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RoomId(pub i32);

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for job IDs. Ids are assigned in creation order, so the
/// highest id for a box code is its most recent job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Treat empty strings as unset tag addresses
#[inline]
fn tag(addr: &Option<String>) -> Option<&str> {
    addr.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// PLC tag addresses for one pneumatic cylinder
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CylinderTags {
    #[serde(default)]
    pub extend: Option<String>,
    #[serde(default)]
    pub retract: Option<String>,
    #[serde(default)]
    pub extend_feedback: Option<String>,
    #[serde(default)]
    pub retract_feedback: Option<String>,
}

impl CylinderTags {
    pub fn extend(&self) -> Option<&str> {
        tag(&self.extend)
    }

    pub fn retract(&self) -> Option<&str> {
        tag(&self.retract)
    }

    pub fn extend_feedback(&self) -> Option<&str> {
        tag(&self.extend_feedback)
    }

    pub fn retract_feedback(&self) -> Option<&str> {
        tag(&self.retract_feedback)
    }

    /// Both command outputs are configured
    pub fn is_commandable(&self) -> bool {
        self.extend().is_some() && self.retract().is_some()
    }

    /// Feedback tag confirming the cylinder reached `direction`
    pub fn feedback_for(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Extend => self.extend_feedback(),
            Direction::Retract => self.retract_feedback(),
        }
    }
}

/// Travel direction of a binary cylinder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Extend,
    Retract,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Extend => "extend",
            Direction::Retract => "retract",
        }
    }
}

/// The two cylinders every detection room carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cylinder {
    /// Gate that holds boxes back while extended
    Blocking,
    /// Diverter that pushes a box into the room while extended
    Push,
}

impl Cylinder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cylinder::Blocking => "blocking_cylinder",
            Cylinder::Push => "push_cylinder",
        }
    }
}

/// Per-step timeouts in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct RoomTimeouts {
    #[serde(default = "default_cylinder_timeout_ms")]
    pub push_retract_ms: u64,
    #[serde(default = "default_cylinder_timeout_ms")]
    pub push_extend_ms: u64,
    #[serde(default = "default_cylinder_timeout_ms")]
    pub blocking_retract_ms: u64,
    #[serde(default = "default_cylinder_timeout_ms")]
    pub blocking_extend_ms: u64,
    #[serde(default = "default_sensor_detect_timeout_ms")]
    pub sensor_detect_ms: u64,
}

fn default_cylinder_timeout_ms() -> u64 {
    5000
}

fn default_sensor_detect_timeout_ms() -> u64 {
    15000
}

impl Default for RoomTimeouts {
    fn default() -> Self {
        Self {
            push_retract_ms: default_cylinder_timeout_ms(),
            push_extend_ms: default_cylinder_timeout_ms(),
            blocking_retract_ms: default_cylinder_timeout_ms(),
            blocking_extend_ms: default_cylinder_timeout_ms(),
            sensor_detect_ms: default_sensor_detect_timeout_ms(),
        }
    }
}

/// Detection room configuration, consumed read-only by the engine
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DetectionRoom {
    pub id: RoomId,
    pub name: String,
    /// Short room number printed on the station (e.g. "1", "A2")
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub push: CylinderTags,
    #[serde(default)]
    pub blocking: CylinderTags,
    #[serde(default)]
    pub sensor: Option<String>,
    #[serde(default)]
    pub timeouts: RoomTimeouts,
    #[serde(default = "default_passage_delay_ms")]
    pub passage_delay_ms: u64,
    #[serde(default = "default_sensor_confirm_delay_ms")]
    pub sensor_confirm_delay_ms: u64,
    /// Blocking retract is not feedback-confirmed (fixed dwell instead)
    #[serde(default)]
    pub tolerance_mode: bool,
}

fn default_passage_delay_ms() -> u64 {
    3000
}

fn default_sensor_confirm_delay_ms() -> u64 {
    500
}

impl DetectionRoom {
    pub fn new(id: i32, name: &str) -> Self {
        Self {
            id: RoomId(id),
            name: name.to_string(),
            number: None,
            push: CylinderTags::default(),
            blocking: CylinderTags::default(),
            sensor: None,
            timeouts: RoomTimeouts::default(),
            passage_delay_ms: default_passage_delay_ms(),
            sensor_confirm_delay_ms: default_sensor_confirm_delay_ms(),
            tolerance_mode: false,
        }
    }

    pub fn sensor(&self) -> Option<&str> {
        tag(&self.sensor)
    }

    pub fn tags(&self, cylinder: Cylinder) -> &CylinderTags {
        match cylinder {
            Cylinder::Blocking => &self.blocking,
            Cylinder::Push => &self.push,
        }
    }

    pub fn passage_delay(&self) -> Duration {
        Duration::from_millis(self.passage_delay_ms)
    }

    pub fn sensor_confirm_delay(&self) -> Duration {
        Duration::from_millis(self.sensor_confirm_delay_ms)
    }

    pub fn number(&self) -> Option<&str> {
        tag(&self.number)
    }
}

/// Routing rule: which box codes may go to which rooms
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Rule {
    pub id: i64,
    /// Room names (or numbers) in preference order
    #[serde(default)]
    pub rooms: Vec<String>,
    #[serde(default)]
    pub box_codes: Vec<String>,
}

impl Rule {
    pub fn matches(&self, box_code: &str) -> bool {
        self.box_codes.iter().any(|c| c == box_code)
    }
}

/// First rule (in listing order) that lists the box code
pub fn find_rule<'a>(rules: &'a [Rule], box_code: &str) -> Option<&'a Rule> {
    rules.iter().find(|r| r.matches(box_code))
}

/// Raw scan from a room's scanner
#[derive(Debug, Clone, PartialEq)]
pub struct ScanEvent {
    pub room_id: RoomId,
    pub room_name: String,
    pub scan_text: String,
}

impl ScanEvent {
    pub fn new(room_id: RoomId, room_name: &str, scan_text: &str) -> Self {
        Self { room_id, room_name: room_name.to_string(), scan_text: scan_text.to_string() }
    }
}

/// Strip scanner framing (control characters, whitespace) from a scan.
/// Returns None when nothing usable remains.
pub fn extract_box_code(scan_text: &str) -> Option<String> {
    let code = scan_text.trim_matches(|c: char| c.is_whitespace() || c.is_control());
    if code.is_empty() {
        None
    } else {
        Some(code.to_string())
    }
}
