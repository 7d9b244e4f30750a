//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the EMOP mediator daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use emop_common::{init_tracing, MediatorConfig};
use emop_metrics::{
    new_registry, spawn_http_server, DaemonMetrics, MediatorMetrics, RegistryMetrics,
};
use emop_net::{GrpcServerBuilder, MediatorService, MediatorSettings};
use emop_registry::{source_from_config, MeterRegistry};
use emop_transport::{TcpMeterTransport, TcpSettings};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "EMOP meter mediator daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Force debug logging")]
    verbose: bool,

    #[arg(long, value_name = "ADDR", help = "Override the gRPC listen address")]
    listen: Option<SocketAddr>,

    #[arg(long, value_name = "N", help = "Override the worker pool size")]
    workers: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        if !path.exists() {
            bail!("configuration file {} does not exist", path.display());
        }
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/emop-mediatord.toml"));
    candidates.push(PathBuf::from("/etc/emop/mediatord.toml"));

    let loaded = MediatorConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    config.apply_process_env()?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(workers) = cli.workers {
        config.server.workers = workers;
    }
    config.validate()?;

    init_tracing("emop-mediatord", &config.logging, cli.verbose)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; running on defaults and environment"),
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.workers)
        .thread_name("emop-worker")
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run_daemon(config))
}

async fn run_daemon(config: MediatorConfig) -> Result<()> {
    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"));
    let mediator_metrics = MediatorMetrics::new(&metrics_registry)?;
    let registry_metrics = RegistryMetrics::new(&metrics_registry)?;

    let source = source_from_config(&config.registry.source)?;
    let registry = Arc::new(
        MeterRegistry::from_config(source.clone(), &config.registry, config.meter.port)
            .with_metrics(registry_metrics),
    );
    match registry.refresh().await {
        Ok(summary) => info!(
            source = source.name(),
            meters = summary.total,
            "meter registry loaded"
        ),
        Err(err) => warn!(
            source = source.name(),
            error = %err,
            "initial registry load failed; retrying on first lookup"
        ),
    }

    let transport = Arc::new(TcpMeterTransport::new(TcpSettings::from_config(&config.meter)));
    let service = MediatorService::new(
        registry,
        transport,
        MediatorSettings::from_config(&config),
    )
    .with_metrics(mediator_metrics);

    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(daemon_metrics.registry(), config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let grpc = GrpcServerBuilder::from_config(&config.server, service)?
        .spawn()
        .await?;

    info!(
        address = %grpc.local_addr(),
        workers = config.server.workers,
        "mediator running; waiting for termination signal"
    );
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    grpc.shutdown().await?;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}
