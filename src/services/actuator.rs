//! Cylinder actuation protocol
//!
//! Solenoid valves on the line may need the control bit held until the
//! cylinder finishes travel, so a confirmed move re-asserts the commanded
//! output on every poll until the feedback switch reports the target. Both
//! outputs are always cleared when the move ends, whatever the outcome.

use crate::domain::types::{CylinderTags, Direction};
use crate::infra::config::ControlSettings;
use crate::io::plc::{PlcError, PlcLink};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

/// How a single cylinder move is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CylinderStep {
    /// Hold the output until feedback confirms, or give up after `timeout`
    Confirmed { timeout: Duration },
    /// Hold the output for a fixed dwell and assume the move happened
    FireAndWait { dwell: Duration },
}

impl CylinderStep {
    pub fn confirmed_ms(timeout_ms: u64) -> Self {
        CylinderStep::Confirmed { timeout: Duration::from_millis(timeout_ms) }
    }
}

async fn clear_outputs(
    plc: &dyn PlcLink,
    extend_addr: &str,
    retract_addr: &str,
) -> Result<(), PlcError> {
    plc.write_bool(extend_addr, false).await?;
    plc.write_bool(retract_addr, false).await
}

/// Drive one cylinder in one direction.
///
/// Returns `Ok(true)` when `feedback_addr` read `target_feedback` before
/// `timeout` elapsed, `Ok(false)` on timeout. Without a feedback tag (or with
/// a zero timeout) the command is a plain pulse and counts as confirmed.
/// Only write failures are returned as errors; failed feedback reads just
/// count as "not yet".
#[allow(clippy::too_many_arguments)]
pub async fn actuate_cylinder(
    plc: &dyn PlcLink,
    timing: &ControlSettings,
    extend_addr: &str,
    retract_addr: &str,
    extend: bool,
    feedback_addr: Option<&str>,
    target_feedback: bool,
    timeout: Duration,
) -> Result<bool, PlcError> {
    let (command_addr, opposite_addr) =
        if extend { (extend_addr, retract_addr) } else { (retract_addr, extend_addr) };

    // Safety reset before commanding a direction
    clear_outputs(plc, extend_addr, retract_addr).await?;
    sleep(timing.reset_settle).await;

    plc.write_bool(command_addr, true).await?;

    let Some(feedback_addr) = feedback_addr.filter(|_| !timeout.is_zero()) else {
        clear_outputs(plc, extend_addr, retract_addr).await?;
        debug!(command = %command_addr, "cylinder_pulsed");
        return Ok(true);
    };

    let started = Instant::now();
    let held = hold_until_confirmed(
        plc,
        timing.poll_interval,
        command_addr,
        opposite_addr,
        feedback_addr,
        target_feedback,
        timeout,
    )
    .await;
    let cleared = clear_outputs(plc, extend_addr, retract_addr).await;

    let confirmed = held?;
    cleared?;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    if confirmed {
        debug!(command = %command_addr, feedback = %feedback_addr, elapsed_ms = %elapsed_ms, "cylinder_confirmed");
    } else {
        warn!(
            command = %command_addr,
            feedback = %feedback_addr,
            timeout_ms = %timeout.as_millis(),
            "cylinder_timeout"
        );
    }
    Ok(confirmed)
}

async fn hold_until_confirmed(
    plc: &dyn PlcLink,
    poll_interval: Duration,
    command_addr: &str,
    opposite_addr: &str,
    feedback_addr: &str,
    target_feedback: bool,
    timeout: Duration,
) -> Result<bool, PlcError> {
    let deadline = Instant::now() + timeout;
    loop {
        match plc.read_bool(feedback_addr).await {
            Ok(value) if value == target_feedback => return Ok(true),
            Ok(_) => {}
            Err(e) => debug!(feedback = %feedback_addr, error = %e, "cylinder_feedback_read_failed"),
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }

        // Re-assert in case the PLC program reset the output
        plc.write_bool(command_addr, true).await?;
        plc.write_bool(opposite_addr, false).await?;
        trace!(command = %command_addr, "cylinder_hold");
        sleep(poll_interval).await;
    }
}

/// Move a configured cylinder using the given strategy.
///
/// Returns `Ok(false)` without touching the PLC when the cylinder's command
/// outputs are not configured.
pub async fn drive(
    plc: &dyn PlcLink,
    timing: &ControlSettings,
    tags: &CylinderTags,
    direction: Direction,
    step: CylinderStep,
) -> Result<bool, PlcError> {
    let (Some(extend_addr), Some(retract_addr)) = (tags.extend(), tags.retract()) else {
        return Ok(false);
    };
    let extend = direction == Direction::Extend;

    match step {
        CylinderStep::Confirmed { timeout } => {
            actuate_cylinder(
                plc,
                timing,
                extend_addr,
                retract_addr,
                extend,
                tags.feedback_for(direction),
                true,
                timeout,
            )
            .await
        }
        CylinderStep::FireAndWait { dwell } => {
            let (command_addr, opposite_addr) =
                if extend { (extend_addr, retract_addr) } else { (retract_addr, extend_addr) };
            plc.write_bool(command_addr, true).await?;
            plc.write_bool(opposite_addr, false).await?;
            sleep(dwell).await;
            clear_outputs(plc, extend_addr, retract_addr).await?;
            debug!(command = %command_addr, dwell_ms = %dwell.as_millis(), "cylinder_fire_and_wait");
            Ok(true)
        }
    }
}

/// Read whether a cylinder's feedback shows it at `direction`.
/// `None` when no feedback tag is configured or the read failed.
pub async fn at_position(
    plc: &dyn PlcLink,
    tags: &CylinderTags,
    direction: Direction,
) -> Option<bool> {
    let addr = tags.feedback_for(direction)?;
    match plc.read_bool(addr).await {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(feedback = %addr, error = %e, "position_read_failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::DetectionRoom;
    use crate::io::plc::SimulatedPlc;

    fn room() -> DetectionRoom {
        let mut room = DetectionRoom::new(1, "Room 1");
        room.push = CylinderTags {
            extend: Some("P.E".into()),
            retract: Some("P.R".into()),
            extend_feedback: Some("P.EF".into()),
            retract_feedback: Some("P.RF".into()),
        };
        room
    }

    fn timing() -> ControlSettings {
        ControlSettings::default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_extend() {
        let room = room();
        let plc = SimulatedPlc::new(Duration::from_millis(300)).with_room(&room);

        let ok = drive(&plc, &timing(), &room.push, Direction::Extend, CylinderStep::confirmed_ms(2000))
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(plc.output("P.E"), Some(false));
        assert_eq!(plc.output("P.R"), Some(false));
        assert_eq!(plc.read_bool("P.EF").await, Ok(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_reset_comes_first() {
        let room = room();
        let plc = SimulatedPlc::new(Duration::from_millis(100)).with_room(&room);
        drive(&plc, &timing(), &room.push, Direction::Extend, CylinderStep::confirmed_ms(2000))
            .await
            .unwrap();

        let log = plc.write_log();
        assert_eq!((log[0].address.as_str(), log[0].value), ("P.E", false));
        assert_eq!((log[1].address.as_str(), log[1].value), ("P.R", false));
        assert_eq!((log[2].address.as_str(), log[2].value), ("P.E", true));
        assert!(log[2].at.duration_since(log[1].at) >= Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reasserts_and_clears() {
        let room = room();
        let plc = SimulatedPlc::new(Duration::from_millis(100)).with_room(&room);
        plc.force("P.EF", false);

        let started = Instant::now();
        let ok = drive(&plc, &timing(), &room.push, Direction::Extend, CylinderStep::confirmed_ms(1000))
            .await
            .unwrap();
        assert!(!ok);
        assert!(started.elapsed() >= Duration::from_millis(1000));

        let reasserts = plc.write_log().iter().filter(|w| w.address == "P.E" && w.value).count();
        assert!(reasserts >= 5, "expected the output to be held, got {reasserts} writes");
        assert_eq!(plc.output("P.E"), Some(false));
        assert_eq!(plc.output("P.R"), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_without_feedback() {
        let mut room = room();
        room.push.extend_feedback = None;
        let plc = SimulatedPlc::new(Duration::from_millis(100)).with_room(&room);

        let ok = drive(&plc, &timing(), &room.push, Direction::Extend, CylinderStep::confirmed_ms(1000))
            .await
            .unwrap();
        assert!(ok);
        // reset(2) + command(1) + clear(2)
        assert_eq!(plc.write_log().len(), 5);
        assert_eq!(plc.output("P.E"), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_is_pulse() {
        let room = room();
        let plc = SimulatedPlc::new(Duration::from_millis(100)).with_room(&room);
        plc.force("P.EF", false);

        let ok = actuate_cylinder(&plc, &timing(), "P.E", "P.R", true, Some("P.EF"), true, Duration::ZERO)
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feedback_read_errors_do_not_abort() {
        let room = room();
        let plc = SimulatedPlc::new(Duration::from_millis(100)).with_room(&room);
        plc.fail_reads("P.EF", "timeout");

        let ok = drive(&plc, &timing(), &room.push, Direction::Extend, CylinderStep::confirmed_ms(500))
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_and_wait() {
        let room = room();
        let plc = SimulatedPlc::new(Duration::from_millis(100)).with_room(&room);
        plc.force("P.RF", false);

        let started = Instant::now();
        let ok = drive(
            &plc,
            &timing(),
            &room.push,
            Direction::Retract,
            CylinderStep::FireAndWait { dwell: Duration::from_millis(500) },
        )
        .await
        .unwrap();
        assert!(ok);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(plc.output("P.R"), Some(false));
    }

    #[tokio::test]
    async fn test_unconfigured_cylinder_is_skipped() {
        let plc = SimulatedPlc::new(Duration::from_millis(10));
        let ok = drive(&plc, &timing(), &CylinderTags::default(), Direction::Extend, CylinderStep::confirmed_ms(100))
            .await
            .unwrap();
        assert!(!ok);
        assert!(plc.write_log().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let room = room();
        let plc = SimulatedPlc::new(Duration::from_millis(10)).with_room(&room);
        plc.set_connected(false);
        let result = drive(&plc, &timing(), &room.push, Direction::Extend, CylinderStep::confirmed_ms(100)).await;
        assert_eq!(result, Err(PlcError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_position() {
        let room = room();
        let plc = SimulatedPlc::new(Duration::from_millis(10)).with_room(&room);
        assert_eq!(at_position(&plc, &room.push, Direction::Retract).await, Some(true));
        assert_eq!(at_position(&plc, &room.push, Direction::Extend).await, Some(false));
        assert_eq!(at_position(&plc, &CylinderTags::default(), Direction::Extend).await, None);
    }
}
