use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use logcast::config::{Config, DEFAULT_CONFIG_PATH};
use logcast::logging::{init_logging, LogLevel};
use logcast::registry::{Settings, SourceRegistry};
use logcast::server;

/// Stream new lines of log files to WebSocket clients.
#[derive(Debug, Parser)]
#[command(name = "logcast", version, about)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Address to listen on, overrides `listen`
    #[arg(short, long)]
    listen: Option<String>,

    /// Lines of history replayed to new subscribers, overrides `historyLines`
    #[arg(long)]
    history: Option<usize>,

    /// Shared secret clients must present, overrides `secret`
    #[arg(long, env = "LOGCAST_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Log level, overrides `log.level`
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Exit as soon as any log file can no longer be followed
    #[arg(long)]
    fail_fast: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(history) = self.history {
            config.history_lines = history;
        }
        if let Some(secret) = &self.secret {
            config.secret = Some(secret.clone());
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    cli.apply(&mut config);

    init_logging(&config.log).context("failed to initialise logging")?;
    info!(config = %cli.config.display(), "loaded configuration");

    let addr = config.listen_addr()?;
    let specs = config.sources()?;
    if config.secret().is_none() {
        warn!("no secret configured, every client is accepted");
    }

    let (registry, mut faults) = SourceRegistry::start(specs, Settings::from(&config));
    info!(sources = registry.len(), "log sources started");

    let app = server::router(registry, config.secret(), &config.allowed_origins);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let server = server::serve(listener, app, shutdown_signal());
    tokio::pin!(server);

    loop {
        tokio::select! {
            res = &mut server => {
                res.context("server error")?;
                return Ok(());
            }
            Some(fault) = faults.recv() => {
                if cli.fail_fast {
                    bail!("log source {} failed: {}", fault.endpoint, fault.reason);
                }
            }
        }
    }
}
