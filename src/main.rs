use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vigil::config::ServerConfig;
use vigil::node::Node;
use vigil::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(about = "Replicated risk-report server with primary/backup failover")]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Replica id (unique, >= 1; lower ids win elections)
    #[arg(long)]
    self_id: Option<u64>,

    /// Host advertised to peers and clients
    #[arg(long)]
    self_host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    self_port: Option<u16>,

    /// Ordered membership (comma-separated host:port, including self)
    #[arg(long)]
    initial_replica_addresses: Option<String>,

    /// SQLite database path
    #[arg(long)]
    db_path: Option<PathBuf>,

    #[arg(long)]
    heartbeat_interval_s: Option<f64>,

    #[arg(long)]
    lease_timeout_s: Option<f64>,

    /// Start as the cluster leader
    #[arg(long)]
    initial_leader: Option<bool>,
}

fn load_config(args: Args) -> Result<ServerConfig, String> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("reading {}: {e}", path.display()))?;
            serde_json::from_str::<ServerConfig>(&raw)
                .map_err(|e| format!("parsing {}: {e}", path.display()))?
        }
        None => {
            let self_id = args.self_id.ok_or("--self_id is required without --config")?;
            let self_port = args
                .self_port
                .ok_or("--self_port is required without --config")?;
            ServerConfig {
                self_id,
                self_host: "127.0.0.1".to_string(),
                self_port,
                initial_replica_addresses: Vec::new(),
                db_path: PathBuf::from(format!("vigil_{self_id}.db")),
                heartbeat_interval_s: 3.0,
                lease_timeout_s: 10.0,
                initial_leader: false,
            }
        }
    };

    if let Some(self_id) = args.self_id {
        config.self_id = self_id;
    }
    if let Some(self_host) = args.self_host {
        config.self_host = self_host;
    }
    if let Some(self_port) = args.self_port {
        config.self_port = self_port;
    }
    if let Some(addresses) = args.initial_replica_addresses {
        config.initial_replica_addresses = addresses
            .split(',')
            .map(|addr| addr.trim().to_string())
            .filter(|addr| !addr.is_empty())
            .collect();
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(heartbeat_interval_s) = args.heartbeat_interval_s {
        config.heartbeat_interval_s = heartbeat_interval_s;
    }
    if let Some(lease_timeout_s) = args.lease_timeout_s {
        config.lease_timeout_s = lease_timeout_s;
    }
    if let Some(initial_leader) = args.initial_leader {
        config.initial_leader = initial_leader;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match load_config(args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = install_shutdown_handler();
    match node.run(shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "replica exited with error");
            ExitCode::FAILURE
        }
    }
}
