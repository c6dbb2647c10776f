//! Room control state machine
//!
//! Both room flows are one release sequence:
//!
//! ```text
//! Idle -> PositioningPush -> RetractingBlock -> [WaitingSensor -> Pushing] -> RestoringBlock -> Idle
//! ```
//!
//! The matched flow (box belongs to this room) needs the push cylinder
//! retracted first, then waits for the box at the sensor and pushes it in.
//! The unmatched flow (pass-through) needs the push cylinder extended first
//! and just holds the gate open for the passage delay. Every failure path
//! raises exactly one alarm and then tries to put the blocking cylinder back
//! in its extended (blocking) position.

use crate::domain::types::{Cylinder, DetectionRoom, Direction};
use crate::infra::config::ControlSettings;
use crate::infra::metrics::Metrics;
use crate::io::alarm::{Alarm, AlarmKind, AlarmSink};
use crate::io::plc::{PlcError, PlcLink};
use crate::services::actuator::{at_position, drive, CylinderStep};
use crate::services::sensor::wait_for_sensor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

const SENSOR_DEVICE: &str = "presence_sensor";

/// Which flow to run in a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    /// Box belongs to this room: release, detect and push it in
    Matched,
    /// Box passes through: release and let it roll on
    Unmatched,
}

impl FlowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::Matched => "matched",
            FlowKind::Unmatched => "unmatched",
        }
    }

    fn variant(self) -> FlowVariant {
        match self {
            FlowKind::Matched => {
                FlowVariant { push_position: Direction::Retract, detect_and_push: true }
            }
            FlowKind::Unmatched => {
                FlowVariant { push_position: Direction::Extend, detect_and_push: false }
            }
        }
    }
}

/// Optional steps of the release sequence
#[derive(Debug, Clone, Copy)]
struct FlowVariant {
    /// Where the push cylinder must be before the gate opens
    push_position: Direction,
    /// Wait for the sensor and push the box in, instead of a fixed passage delay
    detect_and_push: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowPhase {
    PositioningPush,
    ConfirmingPush,
    RetractingBlock,
    WaitingSensor,
    Pushing,
    Passage,
    RestoringBlock,
}

impl FlowPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowPhase::PositioningPush => "positioning_push",
            FlowPhase::ConfirmingPush => "confirming_push",
            FlowPhase::RetractingBlock => "retracting_block",
            FlowPhase::WaitingSensor => "waiting_sensor",
            FlowPhase::Pushing => "pushing",
            FlowPhase::Passage => "passage",
            FlowPhase::RestoringBlock => "restoring_block",
        }
    }
}

/// How a flow ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    /// PLC down or room not commissioned; nothing was commanded
    Skipped,
    Completed,
    /// Box released, but the gate did not confirm closing again
    CompletedWithFault,
    /// A step timed out; safe-state restore was attempted
    Aborted(FlowPhase),
    /// Push cylinder position could not be confirmed; release refused
    Interlocked,
    /// PLC error or panic inside the flow
    Errored,
}

impl FlowOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FlowOutcome::Completed | FlowOutcome::CompletedWithFault)
    }
}

/// Runs control flows against the PLC
pub struct RoomController {
    plc: Arc<dyn PlcLink>,
    alarms: Arc<dyn AlarmSink>,
    settings: ControlSettings,
    metrics: Arc<Metrics>,
}

impl RoomController {
    pub fn new(
        plc: Arc<dyn PlcLink>,
        alarms: Arc<dyn AlarmSink>,
        settings: ControlSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { plc, alarms, settings, metrics }
    }

    pub fn alarms(&self) -> &Arc<dyn AlarmSink> {
        &self.alarms
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Whether `room` has every tag `kind` needs
    pub fn is_configured(room: &DetectionRoom, kind: FlowKind) -> bool {
        let cylinders = room.push.is_commandable() && room.blocking.is_commandable();
        match kind {
            FlowKind::Matched => cylinders && room.sensor().is_some(),
            FlowKind::Unmatched => cylinders,
        }
    }

    /// Run a flow inside its own task so a panic is contained and handled
    /// like any other flow error. The caller holds the room's permit.
    pub async fn run_isolated(self: Arc<Self>, room: DetectionRoom, kind: FlowKind) -> FlowOutcome {
        let controller = Arc::clone(&self);
        let flow_room = room.clone();
        let handle = tokio::spawn(async move { controller.run(&flow_room, kind).await });

        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(room = %room.name, flow = %kind.as_str(), error = %e, "flow_task_failed");
                self.alarm(
                    &room,
                    Alarm::new(AlarmKind::FlowError, "control flow error", "control flow task failed")
                        .with_remark(format!("{} flow: {e}", kind.as_str())),
                );
                self.restore_blocking(&room).await;
                self.metrics.record_flow_finished(false, 0);
                FlowOutcome::Errored
            }
        }
    }

    /// Run one flow to a terminal state. Never returns an error: failures are
    /// alarmed and the room is left in its safest reachable state.
    pub async fn run(&self, room: &DetectionRoom, kind: FlowKind) -> FlowOutcome {
        if !self.plc.is_connected() {
            debug!(room = %room.name, flow = %kind.as_str(), "flow_skipped_plc_disconnected");
            return FlowOutcome::Skipped;
        }
        if !Self::is_configured(room, kind) {
            debug!(room = %room.name, flow = %kind.as_str(), "flow_skipped_not_configured");
            return FlowOutcome::Skipped;
        }

        let started = Instant::now();
        self.metrics.record_flow_started(kind == FlowKind::Matched);
        info!(room_id = %room.id, room = %room.name, flow = %kind.as_str(), "flow_started");

        let outcome = match self.release_sequence(room, kind.variant()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(room = %room.name, flow = %kind.as_str(), error = %e, "flow_error");
                self.alarm(
                    room,
                    Alarm::new(AlarmKind::FlowError, "control flow error", e.to_string())
                        .with_remark(format!("{} flow: {e:?}", kind.as_str())),
                );
                self.restore_blocking(room).await;
                FlowOutcome::Errored
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.metrics.record_flow_finished(outcome.is_success(), duration_ms);
        info!(
            room_id = %room.id,
            room = %room.name,
            flow = %kind.as_str(),
            outcome = ?outcome,
            duration_ms = %duration_ms,
            "flow_finished"
        );
        outcome
    }

    async fn release_sequence(
        &self,
        room: &DetectionRoom,
        variant: FlowVariant,
    ) -> Result<FlowOutcome, PlcError> {
        let push_position = variant.push_position;

        self.enter(room, FlowPhase::PositioningPush);
        if !self.position_push(room, push_position).await? {
            let timeout_ms = self.push_timeout_ms(room, push_position);
            self.alarm(
                room,
                Alarm::new(
                    AlarmKind::CylinderTimeout,
                    &format!("push cylinder {} timeout", push_position.as_str()),
                    format!("no {} feedback within {} ms", push_position.as_str(), timeout_ms),
                )
                .with_device(Cylinder::Push.as_str()),
            );
            self.restore_blocking(room).await;
            return Ok(FlowOutcome::Aborted(FlowPhase::PositioningPush));
        }

        self.enter(room, FlowPhase::ConfirmingPush);
        if !self.confirm_push(room, push_position).await? {
            self.alarm(
                room,
                Alarm::new(
                    AlarmKind::SafetyInterlock,
                    &format!("push cylinder {} failed, safety interlock", push_position.as_str()),
                    "push cylinder position not confirmed, cannot guarantee safe release",
                )
                .with_device(Cylinder::Push.as_str())
                .with_remark(format!("retries={}", self.settings.interlock_retries)),
            );
            self.restore_blocking(room).await;
            return Ok(FlowOutcome::Interlocked);
        }

        self.enter(room, FlowPhase::RetractingBlock);
        let retracted = drive(
            self.plc.as_ref(),
            &self.settings,
            &room.blocking,
            Direction::Retract,
            self.blocking_retract_step(room),
        )
        .await?;
        if !retracted {
            self.alarm(
                room,
                Alarm::new(
                    AlarmKind::CylinderTimeout,
                    "blocking cylinder retract timeout",
                    format!("no retract feedback within {} ms", room.timeouts.blocking_retract_ms),
                )
                .with_device(Cylinder::Blocking.as_str()),
            );
            self.restore_blocking(room).await;
            return Ok(FlowOutcome::Aborted(FlowPhase::RetractingBlock));
        }

        if variant.detect_and_push {
            if let Some(outcome) = self.detect_and_push(room).await? {
                return Ok(outcome);
            }
        } else {
            self.enter(room, FlowPhase::Passage);
            sleep(room.passage_delay()).await;
        }

        self.enter(room, FlowPhase::RestoringBlock);
        let restored = drive(
            self.plc.as_ref(),
            &self.settings,
            &room.blocking,
            Direction::Extend,
            CylinderStep::confirmed_ms(room.timeouts.blocking_extend_ms),
        )
        .await?;
        if !restored {
            self.alarm(
                room,
                Alarm::new(
                    AlarmKind::CylinderTimeout,
                    "blocking cylinder extend timeout",
                    format!("no extend feedback within {} ms", room.timeouts.blocking_extend_ms),
                )
                .with_device(Cylinder::Blocking.as_str()),
            );
            return Ok(FlowOutcome::CompletedWithFault);
        }

        Ok(FlowOutcome::Completed)
    }

    /// Sensor wait, settle, push. Returns `Some(outcome)` if the flow aborted.
    async fn detect_and_push(&self, room: &DetectionRoom) -> Result<Option<FlowOutcome>, PlcError> {
        let Some(sensor) = room.sensor() else {
            return Ok(Some(FlowOutcome::Skipped));
        };

        self.enter(room, FlowPhase::WaitingSensor);
        let detect_timeout = Duration::from_millis(room.timeouts.sensor_detect_ms);
        if !wait_for_sensor(self.plc.as_ref(), sensor, true, detect_timeout, self.settings.poll_interval)
            .await
        {
            self.alarm(
                room,
                Alarm::new(
                    AlarmKind::SensorTimeout,
                    "sensor detect timeout",
                    format!("no box at the sensor within {} ms", room.timeouts.sensor_detect_ms),
                )
                .with_device(SENSOR_DEVICE)
                .with_remark(format!("sensor={sensor}")),
            );
            self.restore_blocking(room).await;
            return Ok(Some(FlowOutcome::Aborted(FlowPhase::WaitingSensor)));
        }

        sleep(room.sensor_confirm_delay()).await;

        self.enter(room, FlowPhase::Pushing);
        let pushed = drive(
            self.plc.as_ref(),
            &self.settings,
            &room.push,
            Direction::Extend,
            CylinderStep::confirmed_ms(room.timeouts.push_extend_ms),
        )
        .await?;
        if !pushed {
            self.alarm(
                room,
                Alarm::new(
                    AlarmKind::CylinderTimeout,
                    "push cylinder extend timeout",
                    format!("no extend feedback within {} ms", room.timeouts.push_extend_ms),
                )
                .with_device(Cylinder::Push.as_str()),
            );
            self.restore_blocking(room).await;
            return Ok(Some(FlowOutcome::Aborted(FlowPhase::Pushing)));
        }
        Ok(None)
    }

    /// Move the push cylinder to `direction` unless feedback says it is
    /// already there
    async fn position_push(&self, room: &DetectionRoom, direction: Direction) -> Result<bool, PlcError> {
        if at_position(self.plc.as_ref(), &room.push, direction).await == Some(true) {
            debug!(room = %room.name, position = %direction.as_str(), "push_already_in_position");
            return Ok(true);
        }
        drive(
            self.plc.as_ref(),
            &self.settings,
            &room.push,
            direction,
            CylinderStep::confirmed_ms(self.push_timeout_ms(room, direction)),
        )
        .await
    }

    /// Re-read the push cylinder position before opening the gate, retrying
    /// the move up to `interlock_retries` times
    async fn confirm_push(&self, room: &DetectionRoom, direction: Direction) -> Result<bool, PlcError> {
        if room.push.feedback_for(direction).is_none() {
            return Ok(true);
        }
        if at_position(self.plc.as_ref(), &room.push, direction).await == Some(true) {
            return Ok(true);
        }

        for attempt in 1..=self.settings.interlock_retries {
            warn!(
                room = %room.name,
                position = %direction.as_str(),
                attempt = %attempt,
                "push_position_unconfirmed_retrying"
            );
            let moved = drive(
                self.plc.as_ref(),
                &self.settings,
                &room.push,
                direction,
                CylinderStep::confirmed_ms(self.push_timeout_ms(room, direction)),
            )
            .await?;
            if moved && at_position(self.plc.as_ref(), &room.push, direction).await == Some(true) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn push_timeout_ms(&self, room: &DetectionRoom, direction: Direction) -> u64 {
        match direction {
            Direction::Extend => room.timeouts.push_extend_ms,
            Direction::Retract => room.timeouts.push_retract_ms,
        }
    }

    fn blocking_retract_step(&self, room: &DetectionRoom) -> CylinderStep {
        if room.tolerance_mode {
            CylinderStep::FireAndWait { dwell: self.settings.tolerance_dwell }
        } else {
            CylinderStep::confirmed_ms(room.timeouts.blocking_retract_ms)
        }
    }

    /// Best-effort: put the gate back in its blocking position. Failures are
    /// logged only; the failure that got us here has already been alarmed.
    async fn restore_blocking(&self, room: &DetectionRoom) {
        let result = drive(
            self.plc.as_ref(),
            &self.settings,
            &room.blocking,
            Direction::Extend,
            CylinderStep::confirmed_ms(room.timeouts.blocking_extend_ms),
        )
        .await;
        match result {
            Ok(true) => info!(room = %room.name, "blocking_restored"),
            Ok(false) => error!(room = %room.name, "blocking_restore_unconfirmed"),
            Err(e) => error!(room = %room.name, error = %e, "blocking_restore_failed"),
        }
    }

    fn enter(&self, room: &DetectionRoom, phase: FlowPhase) {
        debug!(room = %room.name, phase = %phase.as_str(), "flow_phase");
    }

    fn alarm(&self, room: &DetectionRoom, alarm: Alarm) {
        self.alarms.record(alarm.with_room(room.id, &room.name));
    }
}
