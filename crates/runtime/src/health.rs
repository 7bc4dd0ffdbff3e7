//! A minimal `/health` endpoint for load balancer probes, hand-rolled over
//! a raw TCP listener rather than pulling in a web framework — the only
//! route this process serves over HTTP. Request parsing mirrors the
//! first-line-only idiom of a local OAuth callback listener elsewhere in
//! this codebase's lineage: read the request line, ignore everything else.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::process::AgentProcess;

pub async fn run_health_endpoint(
    addr: std::net::SocketAddr,
    process: Arc<AgentProcess>,
    started_at: Instant,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "health endpoint listening");

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
                tokio::spawn(async move {
                    if let Err(err) = serve_one(stream, &process, started_at).await {
                        warn!(%err, "health connection failed");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn serve_one(mut stream: tokio::net::TcpStream, process: &AgentProcess, started_at: Instant) -> anyhow::Result<()> {
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let first_line = request.lines().next().unwrap_or_default();
    let path = first_line.split_whitespace().nth(1).unwrap_or("/");

    let (status, body) = if path.starts_with("/health") {
        let payload = serde_json::json!({
            "agent_id": process.config.agent.agent_id,
            "active_sessions": process.agent_core.session_store().active_count().await,
            "uptime_secs": started_at.elapsed().as_secs(),
        });
        ("200 OK", payload.to_string())
    } else {
        ("404 Not Found", serde_json::json!({"error": "not found"}).to_string())
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
        len = body.len()
    );
    if let Err(err) = stream.write_all(response.as_bytes()).await {
        error!(%err, "failed writing health response");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fake_process;
    use tokio::net::TcpStream;

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(format!("GET {path} HTTP/1.1\r\n\r\n").as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    #[tokio::test]
    async fn health_path_returns_200_with_agent_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let process = Arc::new(fake_process());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.clone().changed() => { if changed.is_ok() && *rx.borrow() { break; } }
                    accept = listener.accept() => {
                        let (stream, _) = accept.unwrap();
                        let process = process.clone();
                        serve_one(stream, &process, Instant::now()).await.unwrap();
                    }
                }
            }
        });

        let response = get(addr, "/health").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"agent_id\":\"test-agent\""));

        let _ = tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn unknown_path_returns_404() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let process = Arc::new(fake_process());
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_one(stream, &process, Instant::now()).await.unwrap();
        });

        let response = get(addr, "/nope").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));

        let _ = handle.await;
    }
}
