//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Meter registry and per-meter access control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Where serial → address rows come from.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use emop_common::{RegistrySourceConfig, RestSourceConfig, StaticMeter};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::RegistryError;

/// One row reported by a metadata source. Rows missing a serial or host
/// are ignored by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MeterRecord {
    pub serial: Option<String>,
    pub host: Option<String>,
    /// Falls back to the registry default port when absent.
    pub port: Option<u16>,
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<MeterRecord>, RegistryError>;

    /// Short label for logs.
    fn name(&self) -> &'static str;
}

/// Build the configured source.
pub fn source_from_config(
    config: &RegistrySourceConfig,
) -> Result<Arc<dyn MetadataSource>, RegistryError> {
    Ok(match config {
        RegistrySourceConfig::Static { meters } => {
            Arc::new(StaticMetadataSource::from_config(meters))
        }
        RegistrySourceConfig::Rest(rest) => Arc::new(RestMetadataSource::new(rest)?),
    })
}

/// Fixed list, typically from the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadataSource {
    records: Vec<MeterRecord>,
}

impl StaticMetadataSource {
    pub fn new(records: Vec<MeterRecord>) -> Self {
        Self { records }
    }

    pub fn from_config(meters: &[StaticMeter]) -> Self {
        Self::new(
            meters
                .iter()
                .map(|meter| MeterRecord {
                    serial: Some(meter.serial.clone()),
                    host: Some(meter.host.clone()),
                    port: meter.port,
                })
                .collect(),
        )
    }
}

#[async_trait]
impl MetadataSource for StaticMetadataSource {
    async fn fetch(&self) -> Result<Vec<MeterRecord>, RegistryError> {
        Ok(self.records.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[derive(Debug, Deserialize)]
struct RegistryRow {
    serial: Option<String>,
    ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EscoRow {
    id: Value,
}

/// PostgREST client for the hosted meter registry table.
#[derive(Debug, Clone)]
pub struct RestMetadataSource {
    client: reqwest::Client,
    base: String,
    table: String,
    esco: Option<String>,
}

impl RestMetadataSource {
    pub fn new(config: &RestSourceConfig) -> Result<Self, RegistryError> {
        let parsed = Url::parse(&config.url)
            .map_err(|err| RegistryError::Source(format!("invalid registry url: {err}")))?;

        let mut headers = HeaderMap::new();
        headers.insert("apikey", header_value(&config.anon_key)?);
        headers.insert(
            AUTHORIZATION,
            header_value(&format!("Bearer {}", config.access_token))?,
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base: parsed.as_str().trim_end_matches('/').to_string(),
            table: config.table.clone(),
            esco: config.esco.clone(),
        })
    }

    fn endpoint(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base, table)
    }

    async fn resolve_esco(&self, code: &str) -> Result<String, RegistryError> {
        let filter = format!("ilike.{code}");
        let rows: Vec<EscoRow> = self
            .client
            .get(self.endpoint("escos"))
            .query(&[("select", "id"), ("code", filter.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| RegistryError::EscoNotFound(code.to_string()))?;
        Ok(match row.id {
            Value::String(id) => id,
            other => other.to_string(),
        })
    }
}

#[async_trait]
impl MetadataSource for RestMetadataSource {
    async fn fetch(&self) -> Result<Vec<MeterRecord>, RegistryError> {
        let mut query = vec![("select".to_string(), "serial,ip_address".to_string())];
        if let Some(code) = &self.esco {
            let id = self.resolve_esco(code).await?;
            debug!(esco = %code, esco_id = %id, "resolved ESCO filter");
            query.push(("esco".to_string(), format!("eq.{id}")));
        }

        let rows: Vec<RegistryRow> = self
            .client
            .get(self.endpoint(&self.table))
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!(rows = rows.len(), table = %self.table, "fetched meter registry rows");

        Ok(rows
            .into_iter()
            .map(|row| MeterRecord {
                serial: row.serial,
                host: row.ip_address,
                port: None,
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "rest"
    }
}

fn header_value(raw: &str) -> Result<HeaderValue, RegistryError> {
    HeaderValue::from_str(raw)
        .map_err(|_| RegistryError::Source("registry credentials are not valid header values".into()))
}
