//! RelayKV - Key-Value Server with Single-Leader Replication
//!
//! Runs a RelayKV node as leader, or as a follower of another node.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relaykv::config::RelayConfig;
use relaykv::error::Result;
use relaykv::node::Node;

/// RelayKV - Key-Value Server with Single-Leader Replication
#[derive(Parser)]
#[command(name = "relaykv")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "relaykv.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the RelayKV node
    Start {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind the listener on
        #[arg(long)]
        bind: Option<String>,

        /// Follow a leader, given as "host port" or "host:port"
        #[arg(long)]
        replicaof: Option<String>,

        /// Directory holding the snapshot file
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Snapshot file name
        #[arg(long)]
        dbfilename: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "relaykv.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            port,
            bind,
            replicaof,
            dir,
            dbfilename,
        } => {
            let mut config = load_or_default(&cli.config)?;
            if let Some(port) = port {
                config.node.port = port;
            }
            if let Some(bind) = bind {
                config.node.bind_address = bind;
            }
            if replicaof.is_some() {
                config.replication.replicaof = replicaof;
            }
            if let Some(dir) = dir {
                config.storage.dir = dir;
            }
            if let Some(dbfilename) = dbfilename {
                config.storage.dbfilename = dbfilename;
            }
            if let Some(level) = cli.log_level {
                config.logging.level = level;
            }

            init_logging(&config.logging.level, &config.logging.format);
            run_start(config).await
        }
        Commands::Init { output } => run_init(output),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        "compact" => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Load the config file, falling back to defaults when it does not exist
fn load_or_default(path: &Path) -> Result<RelayConfig> {
    if path.exists() {
        RelayConfig::from_file(path).map_err(|e| {
            eprintln!("Failed to load configuration from {:?}: {}", path, e);
            e
        })
    } else {
        Ok(RelayConfig::default())
    }
}

/// Start the node and run until Ctrl+C or a SHUTDOWN command
async fn run_start(config: RelayConfig) -> Result<()> {
    tracing::info!("Starting RelayKV node...");

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("Failed to start node: {}", e);
            return Err(e);
        }
    };

    tracing::info!(address = %node.local_addr(), role = %node.replication().role(), "Node ready");

    let shutdown = async {
        loop {
            if !node.is_running() {
                break;
            }
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl+C, shutting down...");
                    break;
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
            }
        }
    };
    shutdown.await;

    let result = node.stop().await;
    match &result {
        Ok(()) => tracing::info!("Node stopped"),
        Err(e) => tracing::error!("Node stopped with error: {}", e),
    }
    result
}

/// Write a commented default configuration file
fn run_init(output: PathBuf) -> Result<()> {
    let config_content = r#"# RelayKV Configuration
# Generated configuration file

[node]
bind_address = "127.0.0.1"
port = 6379

[replication]
# Follow a leader; leave unset to run as leader
# replicaof = "127.0.0.1 6379"
idle_backoff_ms = 1
link_backoff_ms = 5
# Unsolicited REPLCONF ACK interval on followers (0 disables)
ack_interval_ms = 1000
wait_grace_ms = 2000
max_ack_dispatch = 16
connect_timeout_ms = 5000

[storage]
dir = "."
dbfilename = "dump.rdb"

[logging]
level = "info"
format = "pretty"
"#;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: relaykv --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match RelayConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Listen Address: {}", config.listen_address());
            println!(
                "  Role: {}",
                config.replication.replicaof.as_deref().map_or("leader".to_string(), |r| format!("follower of {}", r))
            );
            println!("  Snapshot: {}", config.snapshot_path().display());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = RelayConfig::from_file(&config_path)?;

    println!("RelayKV Node Information");
    println!("========================");
    println!();
    println!("Listen Address:   {}", config.listen_address());
    println!("Snapshot:         {}", config.snapshot_path().display());
    println!();
    println!("Replication:");
    match config.leader_address()? {
        Some((host, port)) => println!("  Leader:         {}:{}", host, port),
        None => println!("  Leader:         (this node)"),
    }
    println!("  ACK Interval:   {} ms", config.replication.ack_interval_ms);
    println!("  WAIT Grace:     {} ms", config.replication.wait_grace_ms);
    println!("  GETACK Workers: {}", config.replication.max_ack_dispatch);
    println!("  Idle Backoff:   {} ms", config.replication.idle_backoff_ms);
    println!();
    println!("Logging:          {} ({})", config.logging.level, config.logging.format);

    Ok(())
}
