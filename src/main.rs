use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use claude_usage_relay::config::{Config, SESSION_KEY_ENV};
use claude_usage_relay::display::{self, StatusBadge};
use claude_usage_relay::models::UsageSnapshot;
use claude_usage_relay::poller::UsagePoller;
use claude_usage_relay::relay::{shutdown_signal, LocalRelayServer};
use claude_usage_relay::relay_client::RelayClient;
use claude_usage_relay::store::EphemeralFileStore;
use claude_usage_relay::upstream::ClaudeWebClient;

#[derive(Parser)]
#[command(name = "claude-usage-relay", version, about)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the loopback relay and log every snapshot it receives
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Poll claude.ai and push snapshots to the relay
    Poll {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
        /// Seconds between cycles
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the cached snapshot without consuming it
    Show,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok()))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port } => {
            config.port = port.unwrap_or(config.port);
            serve(&config)
        }
        Commands::Poll {
            once,
            interval,
            port,
        } => {
            config.port = port.unwrap_or(config.port);
            config.poll_interval_secs = interval.unwrap_or(config.poll_interval_secs);
            poll(&config, once)
        }
        Commands::Show => show(&config),
    }
}

/// `RUST_LOG` when set and valid, `info` otherwise.
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn serve(config: &Config) -> Result<()> {
    let store = Arc::new(EphemeralFileStore::with_windows(
        config.data_file()?,
        config.grace(),
        config.freshness(),
    ));
    let subscriber = Arc::new(|snapshot: &UsageSnapshot| {
        tracing::info!("{}", display::status_line(snapshot, Utc::now()));
    });
    let server = LocalRelayServer::new(config.port, store, subscriber);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(async {
        let shutdown = shutdown_signal().context("Failed to install signal handlers")?;
        server.run(shutdown).await?;
        anyhow::Ok(())
    })
}

fn poll(config: &Config, once: bool) -> Result<()> {
    let session_key = config.session_key.clone().with_context(|| {
        format!("No session key configured; set {SESSION_KEY_ENV} or session_key in the config file")
    })?;
    let source = ClaudeWebClient::new(session_key)?;
    let mut poller = UsagePoller::new(source, RelayClient::new(config.port));

    loop {
        let result = poller.poll_once();
        if let Some(record) = poller.last() {
            let badge = StatusBadge::from_result(&record.result);
            tracing::info!(
                badge = %badge.text,
                severity = ?badge.severity,
                at = %record.at.with_timezone(&Local).format("%H:%M:%S"),
                "Poll complete"
            );
        }
        if once {
            return result.map(|_| ()).map_err(Into::into);
        }
        std::thread::sleep(config.poll_interval());
    }
}

fn show(config: &Config) -> Result<()> {
    let path = config.data_file()?;
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No usage data available");
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    let snapshot: UsageSnapshot = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    println!("{}", display::status_line(&snapshot, Utc::now()));
    if let Some(at) = snapshot.updated_at() {
        println!("Last updated: {}", at.with_timezone(&Local).format("%H:%M:%S"));
    }
    Ok(())
}
