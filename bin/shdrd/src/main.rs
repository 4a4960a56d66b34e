//! ---
//! shdr_section: "05-daemon"
//! shdr_subsection: "binary"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Binary entrypoint for the SHDR daemon."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prometheus::{Encoder, Registry, TextEncoder};
use shdr_adapter::{AdapterMetrics, ShdrAdapter};
use shdr_agent::{
    ChannelSink, ClientEvent, ClientMetrics, DeviceModel, Ingested, LineRouter, ObservationSink,
    Routed, ShdrClient, StaticDevice,
};
use shdr_codec::{Asset, Observation};
use shdr_common::config::ShdrConfig;
use shdr_common::logging::{init_tracing, LogRole};
use shdr_common::time::now_micros;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "MTConnect SHDR adapter and agent client", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Serve an adapter fed from SHDR lines on stdin")]
    Adapter {
        #[arg(long, value_name = "ADDR", help = "Override the listen address")]
        listen: Option<SocketAddr>,
    },
    #[command(about = "Connect to an adapter and log decoded observations as JSON")]
    Agent {
        #[arg(long, help = "Override the adapter host")]
        host: Option<String>,
        #[arg(long, help = "Override the adapter port")]
        port: Option<u16>,
    },
}

/// Feeds relayed stdin lines into the adapter's store.
struct AdapterSink(ShdrAdapter);

impl ObservationSink for AdapterSink {
    fn add_observation(&self, observation: Observation) {
        self.0.add_observation(observation);
    }

    fn add_observations(&self, observations: Vec<Observation>) {
        self.0.add_observations(observations);
    }

    fn add_asset(&self, asset: Asset) {
        self.0.add_asset(asset);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/shdr.toml"));
    candidates.push(PathBuf::from("configs/shdr.example.toml"));

    let loaded = ShdrConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    let role = match cli.command {
        Commands::Adapter { .. } => LogRole::Adapter,
        Commands::Agent { .. } => LogRole::Agent,
    };
    init_tracing(role, &config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    let registry = Registry::new();
    let outcome = match cli.command {
        Commands::Adapter { listen } => {
            if let Some(listen) = listen {
                config.adapter.listen = listen;
            }
            run_adapter(config, &registry).await
        }
        Commands::Agent { host, port } => {
            if let Some(host) = host {
                config.agent.host = host;
            }
            if let Some(port) = port {
                config.agent.port = port;
            }
            config.validate()?;
            run_agent(config, &registry).await
        }
    };

    dump_metrics(&registry);
    outcome
}

async fn run_adapter(config: ShdrConfig, registry: &Registry) -> Result<()> {
    let metrics = AdapterMetrics::register(registry).context("registering adapter metrics")?;
    let adapter = ShdrAdapter::with_metrics(config.adapter.clone(), metrics);
    let handle = adapter.start().await?;
    info!(address = %handle.local_addr(), "adapter serving");

    let device: Arc<dyn DeviceModel> = Arc::new(StaticDevice::from_config(&config.agent.device));
    let mut router = LineRouter::new(device);
    let sink = AdapterSink(adapter.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("listening for ctrl-c")?;
                info!("shutdown requested");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => relay(&mut router, &sink, &line),
                None => {
                    info!("stdin closed; serving current state until ctrl-c");
                    signal::ctrl_c().await.context("listening for ctrl-c")?;
                    break;
                }
            },
        }
    }

    let marked = adapter.set_unavailable();
    info!(marked, "marked observations unavailable");
    tokio::time::sleep(config.adapter.interval).await;
    handle.stop().await?;
    Ok(())
}

fn relay(router: &mut LineRouter, sink: &AdapterSink, line: &str) {
    match router.route(line, now_micros()) {
        Routed::Observations(observations) => sink.add_observations(observations),
        Routed::Asset(asset) => sink.add_asset(asset),
        Routed::Pending | Routed::Control(_) => {}
        Routed::Dropped(reason) => debug!(?reason, line = %line, "stdin line dropped"),
    }
}

async fn run_agent(config: ShdrConfig, registry: &Registry) -> Result<()> {
    let metrics = ClientMetrics::register(registry).context("registering client metrics")?;
    let device: Arc<dyn DeviceModel> = Arc::new(StaticDevice::from_config(&config.agent.device));
    let (sink, mut ingested) = ChannelSink::new();
    let client = ShdrClient::new(config.agent.clone(), device, Arc::new(sink)).with_metrics(metrics);
    let mut events = client.subscribe();
    let handle = client.start();

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("listening for ctrl-c")?;
                info!("shutdown requested");
                break;
            }
            item = ingested.recv() => match item {
                Some(item) => log_ingested(&item)?,
                None => break,
            },
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "client event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    handle.stop().await?;
    while let Ok(item) = ingested.try_recv() {
        log_ingested(&item)?;
    }
    Ok(())
}

fn log_ingested(item: &Ingested) -> Result<()> {
    match item {
        Ingested::Observations(observations) => {
            for observation in observations {
                info!(observation = %serde_json::to_string(observation)?, "observation");
            }
        }
        Ingested::Asset(asset) => {
            info!(asset = %serde_json::to_string(asset)?, "asset");
        }
    }
    Ok(())
}

fn log_event(event: &ClientEvent) {
    match serde_json::to_string(event) {
        Ok(json) => info!(event = %json, "client event"),
        Err(err) => warn!(error = %err, "failed to encode client event"),
    }
}

fn dump_metrics(registry: &Registry) {
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&registry.gather(), &mut buffer).is_ok() {
        debug!(metrics = %String::from_utf8_lossy(&buffer), "final metrics");
    }
}
