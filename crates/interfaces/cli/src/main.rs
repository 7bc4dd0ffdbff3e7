use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use conduit_config::AppConfig;
use conduit_runtime::{process, UnconfiguredSonicClient};

#[derive(Debug, Parser)]
#[command(name = "conduit", version, about = "Session and handoff control plane for a conversational banking agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the unified runtime: client stream listener, gateway
    /// registration and heartbeat, control socket, and health endpoint.
    Run,
    /// Load and validate a workflow graph file, then exit. Intended for CI.
    ValidateWorkflow {
        /// Path to the workflow JSON file. Defaults to the configured one.
        #[arg(long)]
        path: Option<String>,
    },
    /// Query the health of a running agent process over its control socket.
    Health {
        #[arg(long)]
        agent_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_agent().await,
        Commands::ValidateWorkflow { path } => validate_workflow(path).await,
        Commands::Health { agent_id } => query_health(agent_id).await,
    }
}

async fn run_agent() -> Result<()> {
    let config = AppConfig::load_default()?;
    let sonic = Arc::new(UnconfiguredSonicClient);
    conduit_runtime::run(config, sonic).await
}

async fn validate_workflow(path: Option<String>) -> Result<()> {
    let config = AppConfig::load_default().ok();
    let path = path
        .or_else(|| config.as_ref().map(|c| c.agent.workflow_file.clone()))
        .unwrap_or_else(|| "workflow.json".to_string());

    match process::load_workflow(&path) {
        Ok(workflow) => {
            println!("{path}: valid ({} nodes)", workflow.node_ids().count());
            Ok(())
        }
        Err(err) => bail!("{path}: {err}"),
    }
}

async fn query_health(agent_id: Option<String>) -> Result<()> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    let agent_id = agent_id
        .or_else(|| AppConfig::load_default().ok().map(|c| c.agent.agent_id))
        .unwrap_or_else(|| "agent".to_string());
    let socket_path = format!("/tmp/conduit-{agent_id}.sock");

    let mut stream = UnixStream::connect(&socket_path)
        .await
        .map_err(|err| anyhow::anyhow!("failed to connect to {socket_path}: {err}"))?;
    stream.write_all(b"{\"command\":\"health\"}\n").await?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    println!("{}", line.trim());
    Ok(())
}
