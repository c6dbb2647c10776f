//! Barcode scanner serial source
//!
//! One `ScannerPort` per room scanner. Scanners send ASCII codes terminated
//! by CR, LF or CRLF; some models wrap the code in STX/ETX, which
//! `extract_box_code` strips later. The port is reopened after a delay when
//! it fails to open or the read side errors.

use crate::domain::types::{RoomId, ScanEvent};
use crate::infra::config::ScannerConfig;
use crate::infra::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, warn};

/// Longest line kept before the buffer is discarded as noise
const MAX_LINE_LEN: usize = 256;

const REOPEN_DELAY: Duration = Duration::from_secs(5);

/// Splits a byte stream into CR/LF-terminated lines.
/// Partial lines are kept until their terminator arrives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, get every completed non-empty line
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\r' || b == b'\n' {
                if !self.buffer.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.buffer).into_owned());
                    self.buffer.clear();
                }
            } else if self.buffer.len() >= MAX_LINE_LEN {
                debug!(discarded = self.buffer.len(), "scanner_line_overflow");
                self.buffer.clear();
                self.buffer.push(b);
            } else {
                self.buffer.push(b);
            }
        }
        lines
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

pub struct ScannerPort {
    room_id: RoomId,
    room_name: String,
    device: String,
    baud: u32,
    scan_tx: mpsc::Sender<ScanEvent>,
    metrics: Arc<Metrics>,
    connected: watch::Sender<bool>,
    reopen_delay: Duration,
}

impl ScannerPort {
    pub fn new(
        config: &ScannerConfig,
        room_name: &str,
        scan_tx: mpsc::Sender<ScanEvent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            room_id: config.room_id,
            room_name: room_name.to_string(),
            device: config.device.clone(),
            baud: config.baud,
            scan_tx,
            metrics,
            connected,
            reopen_delay: REOPEN_DELAY,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Connection flag for the status monitor
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Forward one scanned line. Returns false once the channel is closed.
    pub fn emit(&self, line: &str) -> bool {
        let event = ScanEvent::new(self.room_id, &self.room_name, line);
        match self.scan_tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.metrics.record_scan_dropped();
                warn!(room_id = %self.room_id, "scan_dropped: channel full");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(room_id = %self.room_id, "scan_channel_closed");
                false
            }
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }

    /// Read scans until shutdown, reopening the port as needed
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(room_id = %self.room_id, device = %self.device, baud = %self.baud, "scanner_started");

        loop {
            let port = tokio_serial::new(&self.device, self.baud)
                .timeout(Duration::from_millis(100))
                .open_native_async();

            match port {
                Ok(mut port) => {
                    info!(room_id = %self.room_id, device = %self.device, "scanner_port_opened");
                    self.set_connected(true);
                    let keep_going = self.read_loop(&mut port, &mut shutdown).await;
                    self.set_connected(false);
                    if !keep_going {
                        break;
                    }
                }
                Err(e) => {
                    error!(room_id = %self.room_id, device = %self.device, error = %e, "scanner_port_open_failed");
                    self.set_connected(false);
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = sleep(self.reopen_delay) => {}
            }
        }
        info!(room_id = %self.room_id, "scanner_stopped");
    }

    /// Returns false when the task should stop (shutdown or closed channel),
    /// true when the port failed and should be reopened
    async fn read_loop(
        &self,
        port: &mut tokio_serial::SerialStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut splitter = LineSplitter::new();
        let mut buf = [0u8; 128];
        let mut last_byte_at = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return false;
                    }
                }
                result = port.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            warn!(room_id = %self.room_id, "scanner_port_closed");
                            return true;
                        }
                        Ok(n) => {
                            last_byte_at = Instant::now();
                            for line in splitter.push(&buf[..n]) {
                                if !self.emit(&line) {
                                    return false;
                                }
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                            if splitter.pending() > 0 && last_byte_at.elapsed() > Duration::from_secs(1) {
                                debug!(room_id = %self.room_id, pending = splitter.pending(), "scanner_partial_line_stale");
                            }
                        }
                        Err(e) => {
                            warn!(room_id = %self.room_id, error = %e, "scanner_read_error");
                            return true;
                        }
                    }
                }
            }
        }
    }
}
