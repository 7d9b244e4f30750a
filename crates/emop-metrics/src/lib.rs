//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder, TEXT_FORMAT,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address; resolves port 0 to the real port.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Process level metrics for the mediator daemon.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let build_info = GaugeVec::new(
            Opts::new(
                "emop_mediatord_build_info",
                "Build metadata for the running mediator binary",
            ),
            &["version"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn set_build_info(&self, version: &str) {
        self.build_info.with_label_values(&[version]).set(1.0);
    }
}

/// Per-operation request accounting for the mediator service.
#[derive(Clone, Debug)]
pub struct MediatorMetrics {
    requests: IntCounterVec,
    conversation_seconds: HistogramVec,
    lock_wait_seconds: Histogram,
}

impl MediatorMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new(
                "emop_mediator_requests_total",
                "Mediated meter requests by operation and outcome",
            ),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let buckets = prometheus::exponential_buckets(0.05, 2.0, 12)
            .context("failed to construct histogram buckets")?;
        let conversation_seconds = HistogramVec::new(
            HistogramOpts::new(
                "emop_mediator_conversation_seconds",
                "Time spent talking to a meter, spacing delay included",
            )
            .buckets(buckets.clone()),
            &["operation"],
        )?;
        registry.register(Box::new(conversation_seconds.clone()))?;

        let lock_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "emop_mediator_lock_wait_seconds",
                "Time spent waiting for a meter lock",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(lock_wait_seconds.clone()))?;

        Ok(Self {
            requests,
            conversation_seconds,
            lock_wait_seconds,
        })
    }

    pub fn record_outcome(&self, operation: &str, outcome: &str) {
        self.requests.with_label_values(&[operation, outcome]).inc();
    }

    pub fn observe_conversation(&self, operation: &str, elapsed: Duration) {
        self.conversation_seconds
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    pub fn observe_lock_wait(&self, elapsed: Duration) {
        self.lock_wait_seconds.observe(elapsed.as_secs_f64());
    }
}

/// Registry refresh accounting.
#[derive(Clone, Debug)]
pub struct RegistryMetrics {
    meters: IntGauge,
    refreshes: IntCounterVec,
}

impl RegistryMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let meters = IntGauge::with_opts(Opts::new(
            "emop_registry_meters",
            "Meters currently known to the registry",
        ))?;
        registry.register(Box::new(meters.clone()))?;

        let refreshes = IntCounterVec::new(
            Opts::new(
                "emop_registry_refresh_total",
                "Registry refresh attempts by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(refreshes.clone()))?;

        Ok(Self { meters, refreshes })
    }

    pub fn set_meter_count(&self, count: usize) {
        self.meters.set(count as i64);
    }

    pub fn record_refresh(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.refreshes.with_label_values(&[outcome]).inc();
    }
}

pub use prometheus;
