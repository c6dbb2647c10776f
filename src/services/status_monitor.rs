//! Periodic device status polling
//!
//! Samples the PLC connection flag and every scanner's connection flag on a
//! fixed cadence. Runs beside the control flows and never touches the room
//! guard or any cylinder.

use crate::domain::types::RoomId;
use crate::infra::metrics::Metrics;
use crate::io::alarm::{Alarm, AlarmKind, AlarmSink};
use crate::io::plc::PlcLink;
use crate::services::job_store::JobStore;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, trace, warn};

/// One sample of device state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub plc_connected: bool,
    pub scanners: Vec<(RoomId, bool)>,
    pub jobs_outstanding: usize,
}

pub struct StatusMonitor {
    plc: Arc<dyn PlcLink>,
    alarms: Arc<dyn AlarmSink>,
    metrics: Arc<Metrics>,
    jobs: Arc<JobStore>,
    scanners: Vec<(RoomId, watch::Receiver<bool>)>,
    poll_interval: Duration,
    last_plc: Option<bool>,
    last_scanners: FxHashMap<RoomId, bool>,
}

impl StatusMonitor {
    pub fn new(
        plc: Arc<dyn PlcLink>,
        alarms: Arc<dyn AlarmSink>,
        metrics: Arc<Metrics>,
        jobs: Arc<JobStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            plc,
            alarms,
            metrics,
            jobs,
            scanners: Vec::new(),
            poll_interval,
            last_plc: None,
            last_scanners: FxHashMap::default(),
        }
    }

    pub fn watch_scanner(&mut self, room_id: RoomId, connected: watch::Receiver<bool>) {
        self.scanners.push((room_id, connected));
    }

    /// Take one sample, log transitions and alarm on PLC loss
    pub fn tick(&mut self) -> StatusSnapshot {
        let plc_connected = self.plc.is_connected();
        self.metrics.set_plc_connected(plc_connected);

        if self.last_plc != Some(plc_connected) {
            if plc_connected {
                info!("plc_connected");
            } else {
                warn!("plc_disconnected");
                self.alarms.record(Alarm::new(
                    AlarmKind::PlcDisconnected,
                    "PLC disconnected",
                    "PLC connection lost, room flows are skipped until it returns",
                ));
            }
            self.last_plc = Some(plc_connected);
        }

        let mut scanners = Vec::with_capacity(self.scanners.len());
        for (room_id, rx) in &self.scanners {
            let connected = *rx.borrow();
            let previous = self.last_scanners.insert(*room_id, connected);
            if previous != Some(connected) {
                if connected {
                    info!(room_id = %room_id, "scanner_connected");
                } else {
                    warn!(room_id = %room_id, "scanner_disconnected");
                }
            }
            scanners.push((*room_id, connected));
        }

        let jobs_outstanding = self.jobs.outstanding();
        self.metrics.set_jobs_outstanding(jobs_outstanding as u64);
        trace!(
            plc_connected = %plc_connected,
            jobs_outstanding = %jobs_outstanding,
            queued = ?self.jobs.queued_by_room(),
            "status_tick"
        );

        StatusSnapshot { plc_connected, scanners, jobs_outstanding }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = %self.poll_interval.as_millis(), "status_monitor_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("status_monitor_stopped");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::alarm::MemoryAlarmSink;
    use crate::io::plc::SimulatedPlc;

    fn monitor(plc: Arc<SimulatedPlc>, alarms: Arc<MemoryAlarmSink>) -> StatusMonitor {
        StatusMonitor::new(
            plc,
            alarms,
            Arc::new(Metrics::new()),
            Arc::new(JobStore::new(3)),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_plc_loss_alarms_once() {
        let plc = Arc::new(SimulatedPlc::new(Duration::from_millis(10)));
        let alarms = Arc::new(MemoryAlarmSink::new());
        let mut monitor = monitor(plc.clone(), alarms.clone());

        assert!(monitor.tick().plc_connected);
        plc.set_connected(false);
        assert!(!monitor.tick().plc_connected);
        monitor.tick();
        assert_eq!(alarms.count(), 1);
        assert_eq!(alarms.alarms()[0].kind, AlarmKind::PlcDisconnected);

        // Reconnect then lose it again
        plc.set_connected(true);
        monitor.tick();
        plc.set_connected(false);
        monitor.tick();
        assert_eq!(alarms.count(), 2);
    }

    #[test]
    fn test_scanner_flags_are_sampled() {
        let plc = Arc::new(SimulatedPlc::new(Duration::from_millis(10)));
        let mut monitor = monitor(plc, Arc::new(MemoryAlarmSink::new()));
        let (tx, rx) = watch::channel(false);
        monitor.watch_scanner(RoomId(1), rx);

        assert_eq!(monitor.tick().scanners, vec![(RoomId(1), false)]);
        tx.send(true).unwrap();
        assert_eq!(monitor.tick().scanners, vec![(RoomId(1), true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let plc = Arc::new(SimulatedPlc::new(Duration::from_millis(10)));
        plc.set_connected(false);
        let alarms = Arc::new(MemoryAlarmSink::new());
        let monitor = monitor(plc, alarms.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(monitor.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(3500)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(alarms.count(), 1);
    }
}
