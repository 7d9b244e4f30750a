//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Config-driven mediator stack against local fake meters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use emop_codec::{Access, DataField, DefaultRecord, Frame};
use emop_common::MediatorConfig;
use emop_metrics::{new_registry, spawn_http_server, MediatorMetrics, MetricsServer, RegistryMetrics};
use emop_net::{GrpcServerBuilder, GrpcServerHandle, MediatorClient, MediatorClientError, MediatorService, MediatorSettings};
use emop_registry::{source_from_config, MeterRegistry};
use emop_transport::{TcpMeterTransport, TcpSettings};
use serde_json::Value;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const OBJECT_ID: u32 = 0x60_0100;

#[derive(Default)]
struct MeterStats {
    active: AtomicUsize,
    max_active: AtomicUsize,
    conversations: AtomicUsize,
}

/// A meter on localhost that answers reads with `value` after `delay`.
async fn spawn_meter(value: Vec<u8>, delay: Duration) -> (u16, Arc<MeterStats>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let stats = Arc::new(MeterStats::default());
    let shared = stats.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let stats = shared.clone();
            let value = value.clone();
            tokio::spawn(async move {
                let now = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
                stats.max_active.fetch_max(now, Ordering::SeqCst);

                let mut buf = [0u8; 256];
                let read = socket.read(&mut buf).await.unwrap_or(0);
                if let Ok(request) = Frame::decode(&buf[..read]) {
                    tokio::time::sleep(delay).await;
                    let data = match request.data {
                        DataField::Default(record) => DataField::Default(DefaultRecord {
                            object_id: record.object_id,
                            access: record.access,
                            payload: if record.access == Access::Read {
                                value
                            } else {
                                Vec::new()
                            },
                        }),
                        other => other,
                    };
                    let reply = Frame {
                        control: request.control,
                        destination: request.source,
                        source: request.destination,
                        data,
                    };
                    let _ = socket.write_all(&reply.encode().unwrap()).await;
                    stats.conversations.fetch_add(1, Ordering::SeqCst);
                }
                stats.active.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });
    (port, stats)
}

/// A port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn load_config(toml: &str) -> MediatorConfig {
    let dir = tempdir().unwrap();
    let path = dir.path().join("emop-mediatord.toml");
    std::fs::write(&path, toml).unwrap();
    let loaded = MediatorConfig::load_with_source(&[path.clone()]).unwrap();
    assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
    loaded.config
}

fn config_for(meters: &[(&str, u16)]) -> MediatorConfig {
    let meters = meters
        .iter()
        .map(|(serial, port)| {
            format!(r#"{{ serial = "{serial}", host = "127.0.0.1", port = {port} }}"#)
        })
        .collect::<Vec<_>>()
        .join(", ");
    load_config(&format!(
        r#"
[server]
listen = "127.0.0.1:0"
workers = 4

[meter]
connect_timeout = 1.0
io_timeout = 1.0
connect_attempts = 2

[access]
lock_timeout = 5.0
min_spacing = 0.05

[registry.source]
kind = "static"
meters = [{meters}]

[metrics]
enabled = true
listen = "127.0.0.1:0"
"#
    ))
}

struct Stack {
    grpc: GrpcServerHandle,
    metrics: MetricsServer,
}

impl Stack {
    async fn start(config: &MediatorConfig) -> anyhow::Result<Self> {
        let registry = new_registry();
        let source = source_from_config(&config.registry.source)?;
        let meters = Arc::new(
            MeterRegistry::from_config(source, &config.registry, config.meter.port)
                .with_metrics(RegistryMetrics::new(&registry)?),
        );
        meters.refresh().await?;
        let transport = Arc::new(TcpMeterTransport::new(TcpSettings::from_config(&config.meter)));
        let service = MediatorService::new(meters, transport, MediatorSettings::from_config(config))
            .with_metrics(MediatorMetrics::new(&registry)?);

        let metrics = spawn_http_server(registry, config.metrics.listen)?;
        let grpc = GrpcServerBuilder::from_config(&config.server, service)?
            .spawn()
            .await?;
        Ok(Self { grpc, metrics })
    }

    async fn client(&self) -> MediatorClient {
        MediatorClient::connect(format!("http://{}", self.grpc.local_addr()))
            .await
            .unwrap()
    }

    async fn stop(self) {
        self.grpc.shutdown().await.unwrap();
        self.metrics.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn config_driven_stack_reads_from_a_tcp_meter() {
    let (port, stats) = spawn_meter(vec![0x00, 0x00, 0x12, 0x34], Duration::ZERO).await;
    let config = config_for(&[("EML2137580826", port)]);
    assert_eq!(config.server.workers, 4);
    assert_eq!(config.access.min_spacing, Duration::from_millis(50));

    let stack = Stack::start(&config).await.unwrap();
    let mut client = stack.client().await;

    let value = client.read_element("EML2137580826", OBJECT_ID).await.unwrap();
    assert_eq!(value, vec![0x00, 0x00, 0x12, 0x34]);
    client
        .write_element("EML2137580826", OBJECT_ID, vec![0x01])
        .await
        .unwrap();
    assert_eq!(stats.conversations.load(Ordering::SeqCst), 2);

    let info: Value = serde_json::from_str(&client.get_info("EML2137580826").await.unwrap()).unwrap();
    assert_eq!(info["registry"]["host"], "127.0.0.1");
    assert_eq!(info["registry"]["port"], port);

    let body = reqwest::get(format!("http://{}/metrics", stack.metrics.addr()))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("emop_mediator_requests_total"));
    assert!(body.contains("emop_registry_meters 1"));

    stack.stop().await;
}

#[tokio::test]
async fn concurrent_clients_share_one_meter_safely() {
    let (port, stats) = spawn_meter(vec![0x42], Duration::from_millis(20)).await;
    let config = config_for(&[("EML1", port)]);
    let stack = Stack::start(&config).await.unwrap();

    let mut calls = Vec::new();
    for _ in 0..4 {
        let mut client = stack.client().await;
        calls.push(tokio::spawn(async move {
            client.read_element("EML1", OBJECT_ID).await
        }));
    }
    for call in calls {
        assert_eq!(call.await.unwrap().unwrap(), vec![0x42]);
    }

    assert_eq!(stats.conversations.load(Ordering::SeqCst), 4);
    assert_eq!(stats.max_active.load(Ordering::SeqCst), 1);

    stack.stop().await;
}

#[tokio::test]
async fn unreachable_meter_surfaces_connection_failure() {
    let port = closed_port().await;
    let config = config_for(&[("EML9", port)]);
    let stack = Stack::start(&config).await.unwrap();
    let mut client = stack.client().await;

    let err = client.read_element("EML9", OBJECT_ID).await.unwrap_err();
    assert!(
        matches!(err, MediatorClientError::ConnectionFailure(ref detail) if detail.contains("EML9")),
        "unexpected error {err:?}"
    );

    let missing = client.read_element("EML404", OBJECT_ID).await.unwrap_err();
    assert!(matches!(missing, MediatorClientError::NotFound(_)));

    stack.stop().await;
}
