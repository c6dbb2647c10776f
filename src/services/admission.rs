//! Admission control and rule matching
//!
//! Decides which room a newly declared box may enter. Each room accepts at
//! most `capacity` boxes that are declared but not yet detected, which keeps
//! the conveyor in front of a room from backing up.

use crate::domain::job::Job;
use crate::domain::types::{find_rule, DetectionRoom, JobId, RoomId, Rule};

/// Why a box was not admitted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionRejection {
    #[error("no rule lists box code {box_code}")]
    NoMatchingRule { box_code: String },
    #[error("box code {box_code} already has active job {job_id}")]
    AlreadyActive { box_code: String, job_id: JobId },
    #[error("rule {rule_id} names no configured room ({})", room_names.join(", "))]
    NoRoomConfigured { rule_id: i64, room_names: Vec<String> },
    #[error("all rooms full: {}", rooms.join(", "))]
    AllRoomsFull { rooms: Vec<String> },
}

impl AdmissionRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionRejection::NoMatchingRule { .. } => "no_matching_rule",
            AdmissionRejection::AlreadyActive { .. } => "already_active",
            AdmissionRejection::NoRoomConfigured { .. } => "no_room_configured",
            AdmissionRejection::AllRoomsFull { .. } => "all_rooms_full",
        }
    }

    /// Rejections that would strand a box on the line get an operator alarm
    pub fn needs_alarm(&self) -> bool {
        matches!(
            self,
            AdmissionRejection::NoRoomConfigured { .. } | AdmissionRejection::AllRoomsFull { .. }
        )
    }
}

/// Room picked for a box
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedRoom {
    pub room_id: RoomId,
    pub room_name: String,
    pub rule_id: i64,
}

/// Resolve a rule's room names to configured rooms, keeping rule order.
///
/// Each name matches, in order of precedence: a room with exactly that
/// name, a room with exactly that number, or the first room whose name
/// contains the rule name or is contained in it.
pub fn resolve_rooms<'a>(room_names: &[String], rooms: &'a [DetectionRoom]) -> Vec<&'a DetectionRoom> {
    let mut resolved: Vec<&DetectionRoom> = Vec::new();

    for name in room_names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
        let found = rooms
            .iter()
            .find(|r| r.name == name)
            .or_else(|| rooms.iter().find(|r| r.number() == Some(name)))
            .or_else(|| {
                rooms.iter().find(|r| {
                    !r.name.is_empty() && (r.name.contains(name) || name.contains(r.name.as_str()))
                })
            });

        if let Some(room) = found {
            if !resolved.iter().any(|r| r.id == room.id) {
                resolved.push(room);
            }
        }
    }
    resolved
}

/// Boxes declared for `room_id` and not yet seen at its scanner
pub fn occupancy(room_id: RoomId, jobs: &[Job]) -> usize {
    jobs.iter().filter(|j| j.is_queued_at(room_id)).count()
}

/// Pick a room for `box_code`.
///
/// Rules are matched first-listed-wins. A box with an incomplete job is
/// refused until that job completes. The first candidate room with fewer
/// than `capacity` undetected jobs is chosen.
pub fn try_admit(
    box_code: &str,
    rules: &[Rule],
    rooms: &[DetectionRoom],
    jobs: &[Job],
    capacity: usize,
) -> Result<AssignedRoom, AdmissionRejection> {
    let rule = find_rule(rules, box_code)
        .ok_or_else(|| AdmissionRejection::NoMatchingRule { box_code: box_code.to_string() })?;

    if let Some(active) = jobs.iter().filter(|j| j.box_code == box_code && !j.is_complete()).max_by_key(|j| j.id) {
        return Err(AdmissionRejection::AlreadyActive {
            box_code: box_code.to_string(),
            job_id: active.id,
        });
    }

    let candidates = resolve_rooms(&rule.rooms, rooms);
    if candidates.is_empty() {
        return Err(AdmissionRejection::NoRoomConfigured {
            rule_id: rule.id,
            room_names: rule.rooms.clone(),
        });
    }

    let available = candidates.iter().find(|room| occupancy(room.id, jobs) < capacity);
    match available {
        Some(room) => Ok(AssignedRoom {
            room_id: room.id,
            room_name: room.name.clone(),
            rule_id: rule.id,
        }),
        None => Err(AdmissionRejection::AllRoomsFull {
            rooms: candidates.iter().map(|r| r.name.clone()).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::RoomStatus;

    fn rooms() -> Vec<DetectionRoom> {
        let mut r1 = DetectionRoom::new(1, "Room 1");
        r1.number = Some("1".into());
        let mut r2 = DetectionRoom::new(2, "Room 2");
        r2.number = Some("2".into());
        let r3 = DetectionRoom::new(3, "Chemistry Lab");
        vec![r1, r2, r3]
    }

    fn rule(id: i64, rooms: &[&str], codes: &[&str]) -> Rule {
        Rule {
            id,
            rooms: rooms.iter().map(|s| s.to_string()).collect(),
            box_codes: codes.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn job(id: u64, code: &str, room: i32, status: RoomStatus) -> Job {
        let mut job = Job::new(JobId(id), code, RoomId(room), "", 1);
        job.status = status;
        job
    }

    #[test]
    fn test_resolve_precedence() {
        let rooms = rooms();
        let names = |v: Vec<&DetectionRoom>| v.iter().map(|r| r.id.0).collect::<Vec<_>>();

        assert_eq!(names(resolve_rooms(&["Room 2".into()], &rooms)), vec![2]);
        assert_eq!(names(resolve_rooms(&["1".into()], &rooms)), vec![1]);
        assert_eq!(names(resolve_rooms(&["Chemistry".into()], &rooms)), vec![3]);
        assert_eq!(names(resolve_rooms(&["Chemistry Lab East".into()], &rooms)), vec![3]);
        assert!(resolve_rooms(&["Warehouse".into(), "".into()], &rooms).is_empty());
    }

    #[test]
    fn test_resolve_keeps_rule_order_and_dedups() {
        let rooms = rooms();
        let resolved = resolve_rooms(&["2".into(), "Room 1".into(), "Room 2".into()], &rooms);
        let ids: Vec<i32> = resolved.iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn test_substring_match_is_loose_on_shared_prefixes() {
        // "Room 1" is contained in "Room 12": the first room listed wins
        let rooms = vec![DetectionRoom::new(1, "Room 1"), DetectionRoom::new(12, "Room 12 annex")];
        let resolved = resolve_rooms(&["Room 12".into()], &rooms);
        assert_eq!(resolved[0].id, RoomId(1));
    }

    #[test]
    fn test_admit_first_available_room() {
        let rules = vec![rule(1, &["Room 1", "Room 2"], &["B1"])];
        let assigned = try_admit("B1", &rules, &rooms(), &[], 3).unwrap();
        assert_eq!(assigned, AssignedRoom { room_id: RoomId(1), room_name: "Room 1".into(), rule_id: 1 });
    }

    #[test]
    fn test_no_matching_rule() {
        let rules = vec![rule(1, &["Room 1"], &["B1"])];
        let err = try_admit("B9", &rules, &rooms(), &[], 3).unwrap_err();
        assert_eq!(err, AdmissionRejection::NoMatchingRule { box_code: "B9".into() });
        assert!(!err.needs_alarm());
    }

    #[test]
    fn test_already_active_blocks_reentry() {
        let rules = vec![rule(1, &["Room 1"], &["B1"])];
        let jobs = vec![job(1, "B1", 1, RoomStatus::Complete), job(2, "B1", 1, RoomStatus::Detecting)];
        let err = try_admit("B1", &rules, &rooms(), &jobs, 3).unwrap_err();
        assert_eq!(err, AdmissionRejection::AlreadyActive { box_code: "B1".into(), job_id: JobId(2) });

        // Completed jobs allow re-entry
        let jobs = vec![job(1, "B1", 1, RoomStatus::Complete)];
        assert!(try_admit("B1", &rules, &rooms(), &jobs, 3).is_ok());
    }

    #[test]
    fn test_no_room_configured() {
        let rules = vec![rule(7, &["Warehouse"], &["B1"])];
        let err = try_admit("B1", &rules, &rooms(), &[], 3).unwrap_err();
        assert_eq!(err.as_str(), "no_room_configured");
        assert!(err.needs_alarm());
    }

    #[test]
    fn test_full_room_falls_through_to_next() {
        let rules = vec![rule(1, &["Room 1", "Room 2"], &["B1"])];
        let jobs: Vec<Job> = (1..=3).map(|i| job(i, &format!("X{i}"), 1, RoomStatus::Undetected)).collect();
        let assigned = try_admit("B1", &rules, &rooms(), &jobs, 3).unwrap();
        assert_eq!(assigned.room_id, RoomId(2));
    }

    #[test]
    fn test_all_rooms_full() {
        let rules = vec![rule(1, &["Room 1"], &["B2"])];
        let jobs: Vec<Job> = (1..=3).map(|i| job(i, &format!("X{i}"), 1, RoomStatus::Undetected)).collect();
        let err = try_admit("B2", &rules, &rooms(), &jobs, 3).unwrap_err();
        assert_eq!(err, AdmissionRejection::AllRoomsFull { rooms: vec!["Room 1".into()] });
        assert!(err.needs_alarm());
        assert_eq!(err.to_string(), "all rooms full: Room 1");
    }

    #[test]
    fn test_only_undetected_jobs_count() {
        let jobs = vec![
            job(1, "A", 1, RoomStatus::Undetected),
            job(2, "B", 1, RoomStatus::Detecting),
            job(3, "C", 1, RoomStatus::Complete),
            job(4, "D", 2, RoomStatus::Undetected),
        ];
        assert_eq!(occupancy(RoomId(1), &jobs), 1);
        assert_eq!(occupancy(RoomId(2), &jobs), 1);
    }
}
