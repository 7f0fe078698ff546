//! RelayCtl - Command line tool for talking to RelayKV nodes
//!
//! Usage:
//!   relayctl exec SET k v       - Send one command and print the reply
//!   relayctl status             - Show replication status of a node
//!   relayctl wait 1 500         - Run WAIT and report how long it took
//!   relayctl check-config       - Validate a configuration file

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use relaykv::network::RespClient;
use relaykv::protocol::RespValue;
use relaykv::RelayConfig;

/// RelayKV Control Tool
#[derive(Parser)]
#[command(name = "relayctl")]
#[command(about = "Query and control RelayKV nodes", long_about = None)]
struct Cli {
    /// Path to config file, used to find the node when --address is absent
    #[arg(short, long, default_value = "relaykv.toml")]
    config: PathBuf,

    /// Node address (host:port); overrides config
    #[arg(short, long)]
    address: Option<String>,

    /// Connect and request timeout in milliseconds
    #[arg(short, long, default_value_t = 5000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a single command and print the reply
    Exec {
        /// Command name and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Show replication status of the node
    Status,
    /// Wait for followers to acknowledge all writes so far
    Wait {
        /// Number of followers required
        replicas: u64,
        /// Timeout in milliseconds
        timeout_ms: u64,
    },
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let address = match &cli.address {
        Some(a) => a.clone(),
        None => match RelayConfig::from_file(&cli.config) {
            Ok(config) => {
                let host = match config.node.bind_address.as_str() {
                    "0.0.0.0" => "127.0.0.1".to_string(),
                    other => other.to_string(),
                };
                format!("{}:{}", host, config.node.port)
            }
            Err(_) => "127.0.0.1:6379".to_string(),
        },
    };
    let limit = Duration::from_millis(cli.timeout_ms);

    let result = match &cli.command {
        Commands::Exec { args } => exec(&address, limit, args).await,
        Commands::Status => show_status(&address, limit).await,
        Commands::Wait { replicas, timeout_ms } => wait(&address, limit, *replicas, *timeout_ms).await,
        Commands::CheckConfig { file } => {
            let config_path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&config_path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

// ============ Commands ============

async fn connect(address: &str, limit: Duration) -> anyhow::Result<RespClient> {
    let client = RespClient::connect(address, limit)
        .await
        .with_context(|| format!("could not connect to {}", address))?;
    Ok(client.with_request_timeout(limit))
}

async fn exec(address: &str, limit: Duration, args: &[String]) -> anyhow::Result<()> {
    let mut client = connect(address, limit).await?;
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let reply = client.request(&args).await?;
    println!("{}", reply);

    if let RespValue::Error(_) = reply {
        std::process::exit(2);
    }
    Ok(())
}

async fn show_status(address: &str, limit: Duration) -> anyhow::Result<()> {
    let mut client = connect(address, limit).await?;
    let reply = client.request(&["INFO", "replication"]).await?;
    let Some(text) = reply.as_str() else {
        bail!("unexpected INFO reply: {}", reply);
    };

    println!();
    println!("Node Status ({}) (relayctl v{})", address, env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once(':') {
            println!("{:<28} {}", key, value);
        }
    }
    println!();
    Ok(())
}

async fn wait(address: &str, limit: Duration, replicas: u64, timeout_ms: u64) -> anyhow::Result<()> {
    // the request must outlive the WAIT itself
    let limit = limit + Duration::from_millis(timeout_ms);
    let mut client = connect(address, limit).await?;

    let started = Instant::now();
    let replicas = replicas.to_string();
    let timeout_ms = timeout_ms.to_string();
    let reply = client.request(&["WAIT", replicas.as_str(), timeout_ms.as_str()]).await?;

    match reply.as_integer() {
        Some(acked) => {
            println!(
                "{} of {} follower(s) acknowledged in {} ms",
                acked,
                replicas,
                started.elapsed().as_millis()
            );
            Ok(())
        }
        None => bail!("WAIT failed: {}", reply),
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = RelayConfig::from_file(path)
        .with_context(|| format!("invalid configuration in {}", path.display()))?;

    println!("✓ Configuration is valid: {}", path.display());
    println!("  Listen Address: {}", config.listen_address());
    match config.leader_address()? {
        Some((host, port)) => println!("  Follows:        {}:{}", host, port),
        None => println!("  Follows:        (leader)"),
    }
    println!("  Snapshot:       {}", config.snapshot_path().display());
    Ok(())
}
