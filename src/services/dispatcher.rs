//! Scan event processor
//!
//! Single consumer of the scan channel. Each scan is resolved against the
//! job store synchronously, and any flow it triggers is spawned as its own
//! task behind the room guard, so a slow room never holds up scans for the
//! others.

use crate::domain::job::Job;
use crate::domain::types::{extract_box_code, find_rule, RoomId, ScanEvent};
use crate::infra::catalog::{RoomConfigSource, RuleSource};
use crate::io::alarm::{Alarm, AlarmKind};
use crate::services::admission::AdmissionRejection;
use crate::services::job_store::{Declaration, JobStore, ScanDecision};
use crate::services::room_control::{FlowKind, FlowOutcome, RoomController};
use crate::services::room_guard::RoomGuard;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Dispatcher {
    controller: Arc<RoomController>,
    guard: Arc<RoomGuard>,
    jobs: Arc<JobStore>,
    rooms: Arc<dyn RoomConfigSource>,
    rules: Arc<dyn RuleSource>,
}

impl Dispatcher {
    pub fn new(
        controller: Arc<RoomController>,
        jobs: Arc<JobStore>,
        rooms: Arc<dyn RoomConfigSource>,
        rules: Arc<dyn RuleSource>,
    ) -> Self {
        Self {
            controller,
            guard: Arc::new(RoomGuard::new()),
            jobs,
            rooms,
            rules,
        }
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    pub fn guard(&self) -> &Arc<RoomGuard> {
        &self.guard
    }

    /// Consume scan events until every sender is gone
    pub async fn run(&self, mut scan_rx: mpsc::Receiver<ScanEvent>) {
        info!("dispatcher_started");
        while let Some(event) = scan_rx.recv().await {
            self.on_scan(&event);
        }
        info!("dispatcher_stopped");
    }

    /// Handle one scan. Returns the spawned flow, if any.
    pub fn on_scan(&self, event: &ScanEvent) -> Option<JoinHandle<FlowOutcome>> {
        self.controller.metrics().record_scan();

        let Some(box_code) = extract_box_code(&event.scan_text) else {
            debug!(room_id = %event.room_id, "scan_empty");
            return None;
        };
        info!(room_id = %event.room_id, room = %event.room_name, box_code = %box_code, "scan_received");

        let rules = self.rules.rules();
        if find_rule(&rules, &box_code).is_none() {
            debug!(box_code = %box_code, "scan_no_rule");
            return self.trigger(event.room_id, FlowKind::Unmatched);
        }

        match self.jobs.record_scan(&box_code, event.room_id) {
            ScanDecision::NoJob => {
                debug!(box_code = %box_code, "scan_no_job");
                self.trigger(event.room_id, FlowKind::Unmatched)
            }
            ScanDecision::AlreadyComplete(job_id) => {
                info!(box_code = %box_code, job_id = %job_id, "scan_ignored_job_complete");
                None
            }
            ScanDecision::WrongRoom { job_id, assigned } => {
                info!(
                    box_code = %box_code,
                    job_id = %job_id,
                    assigned_room_id = %assigned,
                    room_id = %event.room_id,
                    "scan_wrong_room"
                );
                self.trigger(event.room_id, FlowKind::Unmatched)
            }
            ScanDecision::FirstScan(_) => self.trigger(event.room_id, FlowKind::Matched),
            ScanDecision::SecondScan(_) => self.trigger(event.room_id, FlowKind::Unmatched),
            ScanDecision::Duplicate(job_id) => {
                debug!(box_code = %box_code, job_id = %job_id, "scan_duplicate");
                None
            }
        }
    }

    /// Start `kind` in a room unless a flow is already running there.
    /// A busy room drops the request.
    pub fn trigger(&self, room_id: RoomId, kind: FlowKind) -> Option<JoinHandle<FlowOutcome>> {
        let Some(room) = self.rooms.room(room_id) else {
            debug!(room_id = %room_id, flow = %kind.as_str(), "flow_skipped_unknown_room");
            return None;
        };

        let Some(permit) = self.guard.try_acquire(room_id) else {
            self.controller.metrics().record_flow_dropped_busy();
            info!(room_id = %room_id, room = %room.name, flow = %kind.as_str(), "flow_dropped_room_busy");
            return None;
        };

        let controller = Arc::clone(&self.controller);
        Some(tokio::spawn(async move {
            let _permit = permit;
            controller.run_isolated(room, kind).await
        }))
    }

    /// Manually declare a box: run admission and create its job.
    ///
    /// No cylinder moves here. The room's flows start from scans of the
    /// admitted box (first scan pushes, second scan releases), so declaring
    /// never pushes a box twice.
    ///
    /// Rejections that would strand the box (no room configured, every room
    /// full) are also raised as alarms.
    pub fn declare_box(&self, box_code: &str, declaration: Declaration) -> Result<Job, AdmissionRejection> {
        let Some(box_code) = extract_box_code(box_code) else {
            return Err(AdmissionRejection::NoMatchingRule { box_code: String::new() });
        };
        let rules = self.rules.rules();
        let rooms = self.rooms.rooms();
        let metrics = self.controller.metrics();

        match self.jobs.admit(&box_code, &rules, &rooms, declaration) {
            Ok(job) => {
                metrics.record_admission(true);
                Ok(job)
            }
            Err(rejection) => {
                metrics.record_admission(false);
                warn!(box_code = %box_code, reason = %rejection.as_str(), detail = %rejection, "admission_rejected");
                if let Some(alarm) = rejection_alarm(&box_code, &rejection) {
                    self.controller.alarms().record(alarm);
                }
                Err(rejection)
            }
        }
    }

    /// Latest job for a box code
    pub fn job_status(&self, box_code: &str) -> Option<Job> {
        extract_box_code(box_code).and_then(|code| self.jobs.latest_for_code(&code))
    }
}

fn rejection_alarm(box_code: &str, rejection: &AdmissionRejection) -> Option<Alarm> {
    let (kind, title) = match rejection {
        AdmissionRejection::NoRoomConfigured { .. } => {
            (AlarmKind::NoRoomConfigured, "no detection room configured")
        }
        AdmissionRejection::AllRoomsFull { .. } => (AlarmKind::RoomsFull, "detection rooms full"),
        _ => return None,
    };
    Some(Alarm::new(kind, title, rejection.to_string()).with_remark(format!("box_code={box_code}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::RoomStatus;
    use crate::domain::types::{CylinderTags, DetectionRoom, Direction, Rule};
    use crate::infra::catalog::Catalog;
    use crate::infra::config::ControlSettings;
    use crate::infra::metrics::Metrics;
    use crate::io::alarm::MemoryAlarmSink;
    use crate::io::plc::SimulatedPlc;
    use std::time::Duration;

    fn room(id: i32) -> DetectionRoom {
        let mut room = DetectionRoom::new(id, &format!("Room {id}"));
        let tags = |c: &str| CylinderTags {
            extend: Some(format!("R{id}.{c}.E")),
            retract: Some(format!("R{id}.{c}.R")),
            extend_feedback: Some(format!("R{id}.{c}.EF")),
            retract_feedback: Some(format!("R{id}.{c}.RF")),
        };
        room.push = tags("P");
        room.blocking = tags("B");
        room.sensor = Some(format!("R{id}.S"));
        room
    }

    struct Harness {
        plc: Arc<SimulatedPlc>,
        alarms: Arc<MemoryAlarmSink>,
        metrics: Arc<Metrics>,
        dispatcher: Dispatcher,
    }

    fn harness() -> Harness {
        let rooms = vec![room(1), room(2)];
        let rules = vec![Rule { id: 1, rooms: vec!["Room 1".into()], box_codes: vec!["B1".into(), "B2".into()] }];
        let plc = Arc::new(SimulatedPlc::new(Duration::from_millis(300)));
        for r in &rooms {
            plc.add_room(r);
        }
        let alarms = Arc::new(MemoryAlarmSink::new());
        let metrics = Arc::new(Metrics::new());
        let controller = Arc::new(RoomController::new(
            plc.clone(),
            alarms.clone(),
            ControlSettings::default(),
            metrics.clone(),
        ));
        let catalog = Arc::new(Catalog::new(rooms, rules));
        let dispatcher = Dispatcher::new(controller, Arc::new(JobStore::new(3)), catalog.clone(), catalog);
        Harness { plc, alarms, metrics, dispatcher }
    }

    fn scan(room_id: i32, text: &str) -> ScanEvent {
        ScanEvent::new(RoomId(room_id), &format!("Room {room_id}"), text)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_box_passes_through() {
        let h = harness();
        let handle = h.dispatcher.on_scan(&scan(1, "ZZZ\r\n")).unwrap();
        assert_eq!(handle.await.unwrap(), FlowOutcome::Completed);
        assert_eq!(h.plc.last_commanded(&room(1).push), Some(Direction::Extend));
        assert_eq!(h.plc.last_commanded(&room(1).blocking), Some(Direction::Extend));
        assert_eq!(h.metrics.scans_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rule_but_no_job_passes_through() {
        let h = harness();
        let handle = h.dispatcher.on_scan(&scan(1, "B1")).unwrap();
        assert_eq!(handle.await.unwrap(), FlowOutcome::Completed);
        assert!(h.dispatcher.job_status("B1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_declared_box_runs_matched_then_release() {
        let h = harness();
        let job = h.dispatcher.declare_box("B1", Declaration::default()).unwrap();
        assert_eq!(job.room_id, RoomId(1));
        // Declaring alone moves nothing
        tokio::task::yield_now().await;
        assert!(h.plc.write_log().is_empty());
        assert!(!h.dispatcher.guard().is_busy(RoomId(1)));

        let first = h.dispatcher.on_scan(&scan(1, "B1")).unwrap();
        assert_eq!(h.dispatcher.job_status("B1").unwrap().status, RoomStatus::Detecting);
        assert_eq!(first.await.unwrap(), FlowOutcome::Completed);

        let second = h.dispatcher.on_scan(&scan(1, "B1")).unwrap();
        assert_eq!(second.await.unwrap(), FlowOutcome::Completed);
        assert_eq!(h.dispatcher.job_status("B1").unwrap().status, RoomStatus::Complete);

        assert!(h.dispatcher.on_scan(&scan(1, "B1")).is_none());
        assert_eq!(h.alarms.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_room_drops_request() {
        let h = harness();
        let first = h.dispatcher.trigger(RoomId(1), FlowKind::Unmatched).unwrap();
        assert!(h.dispatcher.trigger(RoomId(1), FlowKind::Unmatched).is_none());
        assert_eq!(h.metrics.flows_dropped_busy(), 1);

        // Other rooms are unaffected
        let other = h.dispatcher.trigger(RoomId(2), FlowKind::Unmatched).unwrap();

        first.await.unwrap();
        other.await.unwrap();
        assert!(!h.dispatcher.guard().is_busy(RoomId(1)));
        assert!(h.dispatcher.trigger(RoomId(1), FlowKind::Unmatched).is_some());
    }

    #[tokio::test]
    async fn test_unknown_room_is_ignored() {
        let h = harness();
        assert!(h.dispatcher.trigger(RoomId(9), FlowKind::Unmatched).is_none());
        assert!(h.plc.write_log().is_empty());
    }

    #[tokio::test]
    async fn test_empty_scan_is_ignored() {
        let h = harness();
        assert!(h.dispatcher.on_scan(&scan(1, " \r\n")).is_none());
        assert!(h.plc.write_log().is_empty());
    }

    #[tokio::test]
    async fn test_plain_rejections_are_not_alarmed() {
        let h = harness();
        h.dispatcher.declare_box("B1", Declaration::default()).unwrap();

        let err = h.dispatcher.declare_box("B9", Declaration::default()).unwrap_err();
        assert!(matches!(err, AdmissionRejection::NoMatchingRule { .. }));
        let err = h.dispatcher.declare_box("B1", Declaration::default()).unwrap_err();
        assert!(matches!(err, AdmissionRejection::AlreadyActive { .. }));

        assert_eq!(h.alarms.count(), 0);
        assert_eq!(h.dispatcher.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_rooms_full_alarm() {
        let rooms = vec![room(1)];
        let codes: Vec<String> = (1..=4).map(|i| format!("B{i}")).collect();
        let rules = vec![Rule { id: 1, rooms: vec!["Room 1".into()], box_codes: codes }];
        let plc = Arc::new(SimulatedPlc::new(Duration::from_millis(300)));
        let alarms = Arc::new(MemoryAlarmSink::new());
        let controller = Arc::new(RoomController::new(
            plc,
            alarms.clone(),
            ControlSettings::default(),
            Arc::new(Metrics::new()),
        ));
        let catalog = Arc::new(Catalog::new(rooms, rules));
        let dispatcher = Dispatcher::new(controller, Arc::new(JobStore::new(3)), catalog.clone(), catalog);

        for code in ["B1", "B2", "B3"] {
            dispatcher.declare_box(code, Declaration::default()).unwrap();
        }
        let err = dispatcher.declare_box("B4", Declaration::default()).unwrap_err();
        assert_eq!(err, AdmissionRejection::AllRoomsFull { rooms: vec!["Room 1".into()] });
        assert_eq!(dispatcher.jobs().len(), 3);

        let raised = alarms.alarms();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, AlarmKind::RoomsFull);
        assert_eq!(raised[0].remark.as_deref(), Some("box_code=B4"));
    }

    #[tokio::test]
    async fn test_no_room_configured_alarm() {
        let rules = vec![Rule { id: 5, rooms: vec!["Warehouse".into()], box_codes: vec!["B1".into()] }];
        let alarms = Arc::new(MemoryAlarmSink::new());
        let controller = Arc::new(RoomController::new(
            Arc::new(SimulatedPlc::new(Duration::from_millis(300))),
            alarms.clone(),
            ControlSettings::default(),
            Arc::new(Metrics::new()),
        ));
        let catalog = Arc::new(Catalog::new(vec![room(1)], rules));
        let dispatcher = Dispatcher::new(controller, Arc::new(JobStore::new(3)), catalog.clone(), catalog);

        let err = dispatcher.declare_box("B1", Declaration::default()).unwrap_err();
        assert_eq!(err.as_str(), "no_room_configured");
        assert_eq!(alarms.alarms()[0].kind, AlarmKind::NoRoomConfigured);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_consumes_until_closed() {
        let h = harness();
        let (tx, rx) = mpsc::channel(8);
        tx.send(scan(1, "")).await.unwrap();
        tx.send(scan(2, "")).await.unwrap();
        drop(tx);

        h.dispatcher.run(rx).await;
        assert_eq!(h.metrics.scans_total(), 2);
    }
}
