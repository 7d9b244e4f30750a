//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics exporter scrape test."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use emop_metrics::{new_registry, spawn_http_server, DaemonMetrics, RegistryMetrics};

#[tokio::test]
async fn scrape_endpoint_serves_registered_metrics() {
    let registry = new_registry();
    let daemon = DaemonMetrics::new(registry.clone()).unwrap();
    daemon.set_build_info("0.1.0");
    let meters = RegistryMetrics::new(&registry).unwrap();
    meters.set_meter_count(7);

    let server = spawn_http_server(daemon.registry(), "127.0.0.1:0".parse().unwrap()).unwrap();
    let body = reqwest::get(format!("http://{}/metrics", server.addr()))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(body.contains("emop_registry_meters 7"));
    assert!(body.contains("emop_mediatord_build_info{version=\"0.1.0\"} 1"));
    server.shutdown().await.unwrap();
}
