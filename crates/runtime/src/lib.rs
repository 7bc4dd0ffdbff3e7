//! Unified Runtime (C7): the single process that owns one agent's client
//! stream listener, gateway registration/heartbeat, control socket, and
//! health endpoint, tying together every other collaborator built in
//! `process::AgentProcess::build`.

mod control;
mod gateway_tasks;
mod health;
pub mod process;
mod stream;
#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use conduit_config::AppConfig;
use conduit_gateway::GatewayClient;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

pub use process::{AgentProcess, StartupError, UnconfiguredSonicClient};

/// Assemble the process and run it to completion. Returns once a shutdown
/// is requested over the control socket or the process receives SIGINT.
pub async fn run(config: AppConfig, sonic: Arc<dyn conduit_voice::SonicClient>) -> anyhow::Result<()> {
    let started_at = Instant::now();
    let process = Arc::new(AgentProcess::build(config.clone(), sonic).await?);
    let gateway = GatewayClient::new(config.upstream.gateway_url.clone(), config.gateway_rpc_timeout());

    gateway_tasks::register_at_startup(&process, &gateway).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heartbeat_handle = tokio::spawn(gateway_tasks::heartbeat_loop(process.clone(), gateway.clone(), shutdown_rx.clone()));

    let health_addr: SocketAddr = format!("0.0.0.0:{}", config.agent.port + 1).parse()?;
    let health_handle = tokio::spawn(health::run_health_endpoint(health_addr, process.clone(), started_at, shutdown_rx.clone()));

    let control_path = format!("/tmp/conduit-{}.sock", config.agent.agent_id);
    let control_handle = tokio::spawn(control::run_control_socket(
        control_path,
        process.clone(),
        started_at,
        shutdown_tx.clone(),
        shutdown_rx.clone(),
    ));

    let stream_addr: SocketAddr = format!("0.0.0.0:{}", config.agent.port).parse()?;
    let listener = TcpListener::bind(stream_addr).await?;
    info!(%stream_addr, agent_id = %config.agent.agent_id, mode = ?config.mode, "client stream listening");

    let mut shutdown_rx_accept = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            changed = shutdown_rx_accept.changed() => {
                if changed.is_ok() && *shutdown_rx_accept.borrow() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received; shutting down");
                let _ = shutdown_tx.send(true);
                break;
            }
            accept = listener.accept() => {
                let (tcp, _) = accept?;
                let process = process.clone();
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    stream::handle_connection(tcp, process, gateway).await;
                });
            }
        }
    }

    info!("draining background tasks");
    let _ = shutdown_tx.send(true);
    for handle in [heartbeat_handle, health_handle, control_handle] {
        if let Err(err) = handle.await {
            error!(%err, "background task panicked during shutdown");
        }
    }
    info!(active_sessions = process.agent_core.session_store().active_count().await, "runtime stopped");
    Ok(())
}
