use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use flowcast_core::settings::{load_settings_from_path, FlowcastSettings};
use flowcast_hub::{AppState, EventListener, HubConfig, ServerConfig, SseHub};
use flowcast_telemetry::{init_telemetry, TelemetryConfig};
use flowcast_upstream::{FlowSource, HttpFlowSource, ResilientClient};

#[derive(Parser, Debug)]
#[command(name = "flowcast")]
#[command(about = "Server-sent event hub for flow automation changes", long_about = None)]
struct Args {
    /// Settings file (JSON). Missing file means defaults.
    #[arg(short, long, env = "FLOWCAST_CONFIG", default_value = "flowcast.json")]
    config: PathBuf,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Base URL of the automation runtime API
    #[arg(long)]
    upstream_url: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn apply(&self, settings: &mut FlowcastSettings) {
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(url) = &self.upstream_url {
            settings.upstream.base_url = url.clone();
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = load_settings_from_path(&args.config)
        .with_context(|| format!("loading settings from {}", args.config.display()))?;
    args.apply(&mut settings);
    settings.validate()?;

    init_telemetry(&TelemetryConfig::from_settings(&settings.logging));
    tracing::info!(config = %args.config.display(), "starting flowcast");
    for warning in settings.hub.warnings() {
        tracing::warn!("{warning}");
    }

    let upstream = Arc::new(ResilientClient::from_settings(
        "upstream",
        &settings.breaker,
        &settings.retry,
    ));
    let flows: Arc<dyn FlowSource> = Arc::new(
        HttpFlowSource::new(&settings.upstream, Arc::clone(&upstream))
            .context("building upstream client")?,
    );

    let hub = SseHub::start(HubConfig::from_settings(&settings.hub));
    let poll_interval = std::time::Duration::from_millis(settings.upstream.poll_interval_ms);
    let _listener = EventListener::new(Arc::clone(&flows), Arc::clone(&hub), poll_interval).spawn();

    let state = AppState::new(Arc::clone(&hub)).with_upstream(upstream, flows);
    let server = flowcast_hub::start(ServerConfig::from_settings(&settings.server), state)
        .await
        .context("binding listener")?;

    tracing::info!(port = server.port, upstream = %settings.upstream.base_url, "flowcast ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    tracing::info!("shutting down");
    // Closing the hub ends every open event stream so the server can drain.
    hub.destroy();
    server.shutdown().await;
    Ok(())
}
