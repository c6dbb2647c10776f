//! Declare TCP listener for manual box entry
//!
//! Line protocol, one request per line:
//! - `DECLARE <box_code> [work_order] [inspector_id]` -> `OK <job_id> <room_name>` or `REJECT <reason>`
//! - `STATUS <box_code>` -> `JOB <job_id> <status> <room_name>` or `NONE`
//!
//! Anything else gets `ERR <message>`.

use crate::services::dispatcher::Dispatcher;
use crate::services::job_store::Declaration;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DeclareListenerConfig {
    pub port: u16,
    pub enabled: bool,
}

impl Default for DeclareListenerConfig {
    fn default() -> Self {
        Self { port: 25900, enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Declare { box_code: String, declaration: Declaration },
    Status { box_code: String },
}

/// Parse one request line. `Err` carries the reply for a malformed line.
pub fn parse_request(line: &str) -> Result<Request, String> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Err("empty request".to_string());
    };

    match verb.to_ascii_uppercase().as_str() {
        "DECLARE" => {
            let box_code = parts.next().ok_or("missing box code")?.to_string();
            let declaration = Declaration {
                work_order: parts.next().map(str::to_string),
                inspector_id: parts.next().map(str::to_string),
            };
            Ok(Request::Declare { box_code, declaration })
        }
        "STATUS" => {
            let box_code = parts.next().ok_or("missing box code")?.to_string();
            Ok(Request::Status { box_code })
        }
        other => Err(format!("unknown command {other}")),
    }
}

/// Execute one request line and build the reply
pub fn handle_line(dispatcher: &Dispatcher, line: &str) -> String {
    match parse_request(line) {
        Ok(Request::Declare { box_code, declaration }) => {
            match dispatcher.declare_box(&box_code, declaration) {
                Ok(job) => format!("OK {} {}", job.id, job.room_name),
                Err(rejection) => format!("REJECT {}", rejection.as_str()),
            }
        }
        Ok(Request::Status { box_code }) => match dispatcher.job_status(&box_code) {
            Some(job) => format!("JOB {} {} {}", job.id, job.status.as_str(), job.room_name),
            None => "NONE".to_string(),
        },
        Err(message) => format!("ERR {message}"),
    }
}

/// Start the declare listener. Returns when shutdown is signalled.
pub async fn start_declare_listener(
    config: DeclareListenerConfig,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if !config.enabled {
        info!("declare_listener_disabled");
        return Ok(());
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    info!(port = %config.port, "declare_listener_started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("declare_listener_shutdown");
                    return Ok(());
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, peer)) => {
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            handle_connection(socket, peer, dispatcher).await;
                        });
                    }
                    Err(e) => error!(error = %e, "declare_listener_accept_failed"),
                }
            }
        }
    }
}

async fn handle_connection(socket: TcpStream, peer: SocketAddr, dispatcher: Arc<Dispatcher>) {
    debug!(peer = %peer, "declare_connection_accepted");
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = handle_line(&dispatcher, line);
        info!(peer = %peer, request = %line, reply = %reply, "declare_request");

        if let Err(e) = writer.write_all(format!("{reply}\n").as_bytes()).await {
            warn!(peer = %peer, error = %e, "declare_reply_failed");
            break;
        }
    }
    debug!(peer = %peer, "declare_connection_closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{DetectionRoom, Rule};
    use crate::infra::catalog::Catalog;
    use crate::infra::config::ControlSettings;
    use crate::infra::metrics::Metrics;
    use crate::io::alarm::MemoryAlarmSink;
    use crate::io::plc::SimulatedPlc;
    use crate::services::job_store::JobStore;
    use crate::services::room_control::RoomController;
    use std::time::Duration;

    fn dispatcher() -> Arc<Dispatcher> {
        let catalog = Arc::new(Catalog::new(
            vec![DetectionRoom::new(1, "Room 1")],
            vec![Rule { id: 1, rooms: vec!["Room 1".into()], box_codes: vec!["B1".into()] }],
        ));
        let controller = Arc::new(RoomController::new(
            Arc::new(SimulatedPlc::new(Duration::from_millis(100))),
            Arc::new(MemoryAlarmSink::new()),
            ControlSettings::default(),
            Arc::new(Metrics::new()),
        ));
        Arc::new(Dispatcher::new(controller, Arc::new(JobStore::new(3)), catalog.clone(), catalog))
    }

    #[test]
    fn test_parse_declare() {
        assert_eq!(
            parse_request("DECLARE B1 WO-9 insp-4"),
            Ok(Request::Declare {
                box_code: "B1".into(),
                declaration: Declaration {
                    work_order: Some("WO-9".into()),
                    inspector_id: Some("insp-4".into()),
                },
            })
        );
        assert_eq!(
            parse_request("declare B1"),
            Ok(Request::Declare { box_code: "B1".into(), declaration: Declaration::default() })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_request("").is_err());
        assert_eq!(parse_request("DECLARE"), Err("missing box code".to_string()));
        assert_eq!(parse_request("EJECT B1"), Err("unknown command EJECT".to_string()));
    }

    #[test]
    fn test_handle_line_replies() {
        let dispatcher = dispatcher();
        assert_eq!(handle_line(&dispatcher, "STATUS B1"), "NONE");
        assert_eq!(handle_line(&dispatcher, "DECLARE B1"), "OK 1 Room 1");
        assert_eq!(handle_line(&dispatcher, "DECLARE B1"), "REJECT already_active");
        assert_eq!(handle_line(&dispatcher, "DECLARE B7"), "REJECT no_matching_rule");
        assert_eq!(handle_line(&dispatcher, "STATUS B1"), "JOB 1 undetected Room 1");
        assert_eq!(handle_line(&dispatcher, "PING"), "ERR unknown command PING");
    }

    #[tokio::test]
    async fn test_listener_round_trip() {
        let dispatcher = dispatcher();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Find a free port first
        let free_port = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = free_port.local_addr().unwrap().port();
        drop(free_port);

        let config = DeclareListenerConfig { port, enabled: true };
        let server = tokio::spawn(start_declare_listener(config, dispatcher, shutdown_rx));

        let mut stream = None;
        for _ in 0..50 {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        let stream = stream.expect("listener did not come up");
        let (reader, mut writer) = stream.into_split();
        let mut replies = BufReader::new(reader).lines();

        writer.write_all(b"DECLARE B1 WO-1\n").await.unwrap();
        assert_eq!(replies.next_line().await.unwrap().as_deref(), Some("OK 1 Room 1"));
        writer.write_all(b"STATUS B1\n").await.unwrap();
        assert_eq!(replies.next_line().await.unwrap().as_deref(), Some("JOB 1 undetected Room 1"));

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disabled_listener_returns() {
        let (_tx, rx) = watch::channel(false);
        let config = DeclareListenerConfig { port: 0, enabled: false };
        assert!(start_declare_listener(config, dispatcher(), rx).await.is_ok());
    }
}
