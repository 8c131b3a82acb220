//! hostgridd: the hostgrid control plane daemon.
//!
//! Single binary that assembles the hostgrid subsystems:
//! - Resource ledger (redb)
//! - Workflow executor
//! - Convergence orchestrator
//! - Node agent gateway
//! - Migration coordinator
//! - REST API
//!
//! # Usage
//!
//! ```text
//! hostgridd serve --config /etc/hostgrid/hostgridd.toml --port 8480
//! hostgridd config --config /etc/hostgrid/hostgridd.toml
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use hostgridd::DaemonConfig;

const DEFAULT_FILTER: &str = "info,hostgridd=debug,hostgrid=debug";

#[derive(Parser)]
#[command(name = "hostgridd", about = "hostgrid control plane daemon")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the control API and node agent protocol.
    Serve {
        /// Address to bind.
        #[arg(long)]
        bind: Option<IpAddr>,

        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for the ledger.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Keep the ledger in memory.
        #[arg(long)]
        in_memory: bool,

        /// Seconds between in-flight reconcile sweeps.
        #[arg(long)]
        reconcile_interval: Option<u64>,
    },
    /// Print the effective configuration as TOML.
    Config,
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<DaemonConfig> {
    match path {
        Some(path) => DaemonConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("load config {}: {e}", path.display())),
        None => Ok(DaemonConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Serve {
            bind,
            port,
            data_dir,
            in_memory,
            reconcile_interval,
        } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.storage.data_dir = data_dir;
            }
            if in_memory {
                config.storage.in_memory = true;
            }
            if let Some(secs) = reconcile_interval {
                config.lifecycle.reconcile_interval_secs = secs;
            }
            hostgridd::run(config).await
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
