//! offsyncd: offline-first sync daemon
//!
//! Usage:
//!   offsyncd [--config /etc/offsync/config.toml] run
//!   offsyncd [--config /etc/offsync/config.toml] status [--json]
//!
//! Commands:
//!   run     - Keep the local queue and store in sync with the remote [default]
//!   status  - Print queue size, last sync time and device id from disk

mod daemon;
mod metrics;
mod status;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use offsync_core::config::OfsConfig;
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "offsyncd", version, about = "offline-first sync daemon")]
struct Cli {
    /// Path to offsync.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "OFFSYNC_CONFIG",
        default_value = "/etc/offsync/config.toml",
        global = true
    )]
    config: PathBuf,

    /// Log level or filter directive (overrides [daemon].log_level)
    #[arg(long, env = "OFFSYNC_LOG", global = true)]
    log: Option<String>,

    /// Log format (overrides [daemon].log_format)
    #[arg(long, env = "OFFSYNC_LOG_FORMAT", global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync daemon (default)
    Run {
        /// Session token attached to remote requests and the realtime handshake
        #[arg(long, env = "OFFSYNC_SESSION_TOKEN", hide_env_values = true)]
        session_token: String,

        /// Passphrase the payload key is derived from (required when crypto is enabled)
        #[arg(long, env = "OFFSYNC_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
    },
    /// Show persisted sync state
    Status {
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn from_config(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, found) = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| LogFormat::from_config(&config.daemon.log_format));
    init_logging(&level, &format);

    if !found {
        warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    let secrets = match cli.command {
        Some(Command::Status { json }) => {
            let report = status::collect(&config)?;
            return status::print(&report, json);
        }
        Some(Command::Run {
            session_token,
            passphrase,
        }) => daemon::Secrets {
            session_token: SecretString::from(session_token),
            passphrase: passphrase.map(SecretString::from),
        },
        None => daemon::Secrets {
            session_token: std::env::var("OFFSYNC_SESSION_TOKEN")
                .map(SecretString::from)
                .context("OFFSYNC_SESSION_TOKEN not set (or use `offsyncd run --session-token`)")?,
            passphrase: std::env::var("OFFSYNC_PASSPHRASE").ok().map(SecretString::from),
        },
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "offsyncd starting"
    );
    daemon::run(config, secrets).await
}

/// Returns the parsed config and whether the file existed.
async fn load_config(path: &Path) -> Result<(OfsConfig, bool)> {
    if !path.exists() {
        return Ok((OfsConfig::default(), false));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = toml::from_str(&content)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok((config, true))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
