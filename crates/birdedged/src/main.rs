use anyhow::{Context, Result};
use birdconf::BirdConfig;
use birdedged::sink::{BusSink, FanoutSink, InfluxSink, PublishSink};
use birdedged::{
    telemetry, CommandLauncher, ConfigRenderer, Discovery, IniDocument, OutputRouter,
    SourceRegistry, Supervisor, SupervisorSettings,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// BirdEdge daemon - supervises the audio classification worker
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of ./birdedge.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker config template
    #[arg(short, long)]
    template: Option<PathBuf>,

    /// Where the rendered worker config is written
    #[arg(long)]
    export_path: Option<PathBuf>,

    /// Minimum seconds between two worker launches
    #[arg(long)]
    restart_interval: Option<u64>,

    /// Worker executable
    #[arg(long)]
    worker: Option<PathBuf>,

    #[arg(long)]
    influx_url: Option<String>,

    #[arg(long)]
    influx_token: Option<String>,

    #[arg(long)]
    influx_org: Option<String>,

    /// Do not write classifications to InfluxDB
    #[arg(long)]
    no_influx: bool,

    /// Publish classifications on a ZMQ PUB socket bound to this endpoint
    #[arg(long, value_name = "ENDPOINT")]
    bus: Option<String>,

    /// OTLP gRPC endpoint for OpenTelemetry
    #[arg(long, value_name = "HOST:PORT")]
    otlp_endpoint: Option<String>,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    fn apply(&self, config: &mut BirdConfig) {
        if let Some(template) = &self.template {
            config.paths.template = template.clone();
        }
        if let Some(export) = &self.export_path {
            config.paths.export = export.clone();
        }
        if let Some(secs) = self.restart_interval {
            config.worker.restart_interval_secs = secs;
        }
        if let Some(worker) = &self.worker {
            config.worker.executable = worker.clone();
        }
        if let Some(url) = &self.influx_url {
            config.influx.url = url.clone();
        }
        if let Some(token) = &self.influx_token {
            config.influx.token = token.clone();
        }
        if let Some(org) = &self.influx_org {
            config.influx.org = org.clone();
        }
        if self.no_influx {
            config.influx.enabled = false;
        }
        if let Some(endpoint) = &self.bus {
            config.bus.enabled = true;
            config.bus.endpoint = endpoint.clone();
        }
        if let Some(endpoint) = &self.otlp_endpoint {
            config.telemetry.otlp_endpoint = endpoint.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = BirdConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    cli.apply(&mut config);

    if cli.print_config {
        print!("{}", config.to_toml());
        return Ok(());
    }

    let level = telemetry::level_for_verbosity(cli.verbose, &config.telemetry.log_level);
    let telemetry = telemetry::init(&level, Some(config.telemetry.otlp_endpoint.as_str()))
        .context("Failed to initialize logging")?;

    for file in &sources.files {
        info!(path = %file.display(), "loaded config file");
    }
    for var in &sources.env_overrides {
        info!(%var, "config overridden from environment");
    }

    let result = run(config).await;
    if let Err(e) = &result {
        error!("birdedged stopped: {e:#}");
    }

    telemetry.shutdown();
    result
}

async fn run(config: BirdConfig) -> Result<()> {
    let sink = build_sink(&config)?;
    sink.ping()
        .await
        .context("Telemetry sink is not reachable")?;

    let template = IniDocument::load(&config.paths.template)
        .context("Failed to load worker config template")?;
    let registry = SourceRegistry::from_sources(template.sources());
    info!(
        template = %config.paths.template.display(),
        sources = registry.len(),
        "template loaded"
    );
    let renderer = ConfigRenderer::new(template, &config.paths.export);

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let (discovery_tx, discovery_rx) = mpsc::channel(64);
    let (discovery, _idle_discovery_tx) = if config.discovery.enabled {
        let discovery = Discovery::start(
            &config.discovery.service_type,
            discovery_tx,
            shutdown.clone(),
        )
        .context("Failed to subscribe to station discovery")?;
        (Some(discovery), None)
    } else {
        info!("discovery disabled, running template sources only");
        (None, Some(discovery_tx))
    };

    let mut supervisor = Supervisor::new(
        registry,
        renderer,
        OutputRouter::new(config.worker.background_label.clone()),
        sink,
        CommandLauncher::new(&config.worker),
        SupervisorSettings::from(&config.worker),
    );

    info!(worker = %config.worker.executable.display(), "birdedged ready");
    let result = supervisor.run(discovery_rx, shutdown.clone()).await;

    shutdown.cancel();
    if let Some(discovery) = discovery {
        discovery.shutdown().await;
    }

    info!("Shutdown complete");
    result
}

fn build_sink(config: &BirdConfig) -> Result<Arc<dyn PublishSink>> {
    let mut sinks: Vec<Box<dyn PublishSink>> = Vec::new();

    if config.influx.enabled {
        let influx = InfluxSink::new(&config.influx).context("Invalid InfluxDB settings")?;
        info!(url = %config.influx.url, bucket = %config.influx.bucket, "InfluxDB sink enabled");
        sinks.push(Box::new(influx));
    }
    if config.bus.enabled {
        let bus = BusSink::new(&config.bus).context("Failed to open message bus")?;
        info!(topic = %bus.topic(), "message bus sink enabled");
        sinks.push(Box::new(bus));
    }

    let fanout = FanoutSink::new(sinks);
    if fanout.is_empty() {
        warn!("no telemetry sink enabled, detections are only logged");
    }
    Ok(Arc::new(fanout))
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    shutdown.cancel();
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
