//! Presence sensor wait

use crate::io::plc::PlcLink;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

/// Wait until `address` reads `target`, polling every `poll_interval`.
///
/// A sensor already at the target returns immediately. Read failures count
/// as a miss for that tick. Returns false once `timeout` has elapsed.
pub async fn wait_for_sensor(
    plc: &dyn PlcLink,
    address: &str,
    target: bool,
    timeout: Duration,
    poll_interval: Duration,
) -> bool {
    let started = Instant::now();
    let deadline = started + timeout;

    loop {
        match plc.read_bool(address).await {
            Ok(value) if value == target => {
                debug!(
                    sensor = %address,
                    elapsed_ms = %started.elapsed().as_millis(),
                    "sensor_confirmed"
                );
                return true;
            }
            Ok(_) => trace!(sensor = %address, "sensor_poll"),
            Err(e) => debug!(sensor = %address, error = %e, "sensor_read_failed"),
        }

        if Instant::now() >= deadline {
            return false;
        }
        sleep(poll_interval).await;
    }
}
