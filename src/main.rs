use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use chorus_core::credentials::Credentials;
use chorus_engine::{build_registry, SessionPolicy, SessionStore};
use chorus_llm::{DashScopeConfig, DashScopeProvider};
use chorus_server::{ServerConfig, Services};
use chorus_settings::{ChorusSettings, ProviderSettings};
use chorus_telemetry::{init_telemetry, TelemetryConfig};

/// Multi-agent chat relay over websockets.
#[derive(Debug, Parser)]
#[command(name = "chorus", version)]
struct Cli {
    /// Settings file (defaults to ~/.chorus/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address.
    #[arg(long)]
    host: Option<String>,

    /// HTTP and websocket port.
    #[arg(long)]
    port: Option<u16>,

    /// Default log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut ChorusSettings) {
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level = level.clone();
        }
    }
}

fn provider_config(settings: &ProviderSettings) -> DashScopeConfig {
    DashScopeConfig {
        base_url: settings.base_url.clone(),
        model: settings.model.clone(),
        incremental_output: settings.incremental_output,
        connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
        idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
        request_timeout: (settings.request_timeout_secs > 0)
            .then(|| Duration::from_secs(settings.request_timeout_secs)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => chorus_settings::load_settings_from_path(path),
        None => chorus_settings::load_settings(),
    }
    .context("failed to load settings")?;
    cli.apply(&mut settings);

    let telemetry = init_telemetry(TelemetryConfig::from_levels(
        &settings.logging.level,
        settings
            .logging
            .modules
            .iter()
            .map(|(module, level)| (module.as_str(), level.as_str())),
        settings.logging.json,
    ));
    let metrics = telemetry.metrics();

    tracing::info!(model = %settings.provider.model, "starting chorus");

    let credentials = Arc::new(Credentials::from_option(settings.provider.api_key.clone()));
    if !credentials.is_set() {
        tracing::warn!("no API key configured; replies will report the missing key until one is set");
    }

    let provider = Arc::new(
        DashScopeProvider::new(provider_config(&settings.provider), Arc::clone(&credentials))
            .context("failed to build provider client")?,
    );

    let agents = build_registry(provider.clone(), &settings.agents, Some(metrics.clone()))
        .context("failed to build agent registry")?;
    agents
        .initialize_all()
        .await
        .context("agent initialization failed")?;

    let sessions = Arc::new(
        SessionStore::new(SessionPolicy::from_limits(
            settings.sessions.max_sessions,
            settings.sessions.idle_ttl_secs,
        ))
        .with_metrics(metrics.clone()),
    );
    let shutdown = CancellationToken::new();
    let sweeper = sessions.start_sweeper(
        Duration::from_secs(settings.sessions.sweep_interval_secs.max(1)),
        shutdown.clone(),
    );

    let services = Services {
        agents: Arc::new(agents),
        sessions,
        credentials,
        provider,
        metrics,
    };
    let handle = chorus_server::start(ServerConfig::from(&settings.server), services)
        .await
        .context("failed to start server")?;

    tracing::info!(addr = %handle.addr, "chorus ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    shutdown.cancel();
    handle.shutdown().await;
    let _ = sweeper.await;
    Ok(())
}
