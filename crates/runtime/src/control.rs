//! The operator control socket (C7): a Unix domain socket speaking
//! line-delimited JSON, mirroring the teacher's unified daemon socket
//! (`aigent-daemon::server::run_unified_daemon`) but scoped to the handful
//! of operator commands `conduit` the CLI needs: health, ping, shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{error, info};

use crate::process::AgentProcess;

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum ControlCommand {
    Health,
    Ping,
    Shutdown,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ControlEvent {
    Health { agent_id: String, mode: String, active_sessions: usize, uptime_secs: u64 },
    Ack { message: String },
}

pub async fn run_control_socket(
    socket_path: impl AsRef<Path>,
    process: Arc<AgentProcess>,
    started_at: std::time::Instant,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let socket_path: PathBuf = socket_path.as_ref().to_path_buf();
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    let listener = UnixListener::bind(&socket_path)?;
    info!(path = %socket_path.display(), "control socket listening");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                let (stream, _) = accept?;
                let process = process.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, process, started_at, shutdown_tx).await {
                        error!(%err, "control connection handler failed");
                    }
                });
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    process: Arc<AgentProcess>,
    started_at: std::time::Instant,
    shutdown_tx: watch::Sender<bool>,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let command: ControlCommand = serde_json::from_str(line.trim())?;
    match command {
        ControlCommand::Health => {
            let event = ControlEvent::Health {
                agent_id: process.config.agent.agent_id.clone(),
                mode: mode_str(&process).to_string(),
                active_sessions: process.agent_core.session_store().active_count().await,
                uptime_secs: started_at.elapsed().as_secs(),
            };
            send_event(&mut write_half, &event).await?;
        }
        ControlCommand::Ping => {
            send_event(&mut write_half, &ControlEvent::Ack { message: "pong".to_string() }).await?;
        }
        ControlCommand::Shutdown => {
            let _ = shutdown_tx.send(true);
            send_event(&mut write_half, &ControlEvent::Ack { message: "shutdown requested".to_string() }).await?;
        }
    }
    Ok(())
}

fn mode_str(process: &AgentProcess) -> &'static str {
    match process.config.mode {
        conduit_config::Mode::Voice => "voice",
        conduit_config::Mode::Text => "text",
        conduit_config::Mode::Hybrid => "hybrid",
    }
}

async fn send_event(writer: &mut tokio::net::unix::OwnedWriteHalf, event: &ControlEvent) -> anyhow::Result<()> {
    let encoded = serde_json::to_string(event)?;
    writer.write_all(encoded.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fake_process;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    async fn roundtrip(socket_path: &Path, command: &str) -> serde_json::Value {
        let mut stream = UnixStream::connect(socket_path).await.unwrap();
        stream.write_all(format!("{{\"command\":\"{command}\"}}\n").as_bytes()).await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    #[tokio::test]
    async fn ping_is_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("conduit-test.sock");
        let process = Arc::new(fake_process());
        let (tx, rx) = watch::channel(false);
        let handle =
            tokio::spawn(run_control_socket(socket_path.clone(), process, std::time::Instant::now(), tx.clone(), rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let reply = roundtrip(&socket_path, "ping").await;
        assert_eq!(reply["event"], "ack");
        assert_eq!(reply["message"], "pong");

        let _ = tx.send(true);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn health_reports_agent_id_and_active_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("conduit-test.sock");
        let process = Arc::new(fake_process());
        let (tx, rx) = watch::channel(false);
        let handle =
            tokio::spawn(run_control_socket(socket_path.clone(), process, std::time::Instant::now(), tx.clone(), rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let reply = roundtrip(&socket_path, "health").await;
        assert_eq!(reply["event"], "health");
        assert_eq!(reply["agent_id"], "test-agent");
        assert_eq!(reply["active_sessions"], 0);

        let _ = tx.send(true);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_command_flips_the_shutdown_signal() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("conduit-test.sock");
        let process = Arc::new(fake_process());
        let (tx, rx) = watch::channel(false);
        let mut shutdown_rx = tx.subscribe();
        let handle =
            tokio::spawn(run_control_socket(socket_path.clone(), process, std::time::Instant::now(), tx.clone(), rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let reply = roundtrip(&socket_path, "shutdown").await;
        assert_eq!(reply["message"], "shutdown requested");

        shutdown_rx.changed().await.unwrap();
        assert!(*shutdown_rx.borrow());
        handle.await.unwrap().unwrap();
    }
}
