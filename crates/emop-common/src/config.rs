//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration and logging primitives for the mediator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use tracing::debug;

use crate::logging::LogFormat;

/// Smallest buffer able to hold a frame with a one byte data field.
const MIN_RECEIVE_BUFFER: usize = 14;
const MAX_ADDRESS: u32 = 0x00FF_FFFF;

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 50051))
}

fn default_workers() -> usize {
    30
}

fn default_meter_port() -> u16 {
    8080
}

fn default_socket_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_receive_buffer() -> usize {
    128
}

fn default_control() -> u8 {
    0x05
}

fn default_source_address() -> u32 {
    0x21_AE42
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_min_spacing() -> Duration {
    Duration::from_secs(2)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_registry_table() -> String {
    "meter_registry".to_owned()
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_directive() -> String {
    "info".to_owned()
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Primary configuration object for the mediator process.
///
/// Built once at startup and handed by reference to the transport, registry
/// and mediator constructors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediatorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub meter: MeterConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where a [`MediatorConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: MediatorConfig,
    /// `None` when no file was found and defaults were used.
    pub source: Option<PathBuf>,
}

impl MediatorConfig {
    pub const ENV_CONFIG_PATH: &str = "EMOP_MEDIATOR_CONFIG";

    /// Load configuration, respecting the `EMOP_MEDIATOR_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// Mediators are usually deployed from environment variables alone, so
    /// a missing file is not an error: defaults are returned instead.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        Ok(LoadedConfig {
            config: MediatorConfig::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<MediatorConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply the environment variables understood by existing deployments.
    ///
    /// `lookup` abstracts the environment so tests can feed fixed values.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(raw) = var("EMLITE_TIMEOUT_SECONDS") {
            let seconds: f64 = raw
                .trim()
                .parse()
                .with_context(|| format!("EMLITE_TIMEOUT_SECONDS is not a number: {raw}"))?;
            let timeout = Duration::try_from_secs_f64(seconds)
                .with_context(|| format!("EMLITE_TIMEOUT_SECONDS out of range: {raw}"))?;
            self.meter.connect_timeout = timeout;
            self.meter.io_timeout = timeout;
        }

        if let Some(raw) = var("LISTEN_PORT") {
            let port: u16 = raw
                .trim()
                .parse()
                .with_context(|| format!("LISTEN_PORT is not a port number: {raw}"))?;
            self.server.listen.set_port(port);
        }

        if let Some(raw) = var("MAX_WORKERS") {
            self.server.workers = raw
                .trim()
                .parse()
                .with_context(|| format!("MAX_WORKERS is not a positive integer: {raw}"))?;
        }

        if let (Some(cert), Some(key), Some(ca)) = (
            var("MEDIATOR_SERVER_CERT"),
            var("MEDIATOR_SERVER_KEY"),
            var("MEDIATOR_CA_CERT"),
        ) {
            self.server.tls = Some(TlsConfig {
                cert: PemMaterial::Base64(cert),
                key: PemMaterial::Base64(key),
                client_ca: PemMaterial::Base64(ca),
            });
        }

        if let (Some(url), Some(anon_key), Some(access_token)) = (
            var("SUPABASE_URL"),
            var("SUPABASE_ANON_KEY"),
            var("SUPABASE_ACCESS_TOKEN"),
        ) {
            let (esco, table) = match &self.registry.source {
                RegistrySourceConfig::Rest(rest) => (rest.esco.clone(), rest.table.clone()),
                RegistrySourceConfig::Static { .. } => (None, default_registry_table()),
            };
            self.registry.source = RegistrySourceConfig::Rest(RestSourceConfig {
                url,
                anon_key,
                access_token,
                esco,
                table,
            });
        }

        if let Some(esco) = var("ESCO") {
            match &mut self.registry.source {
                RegistrySourceConfig::Rest(rest) => rest.esco = Some(esco),
                RegistrySourceConfig::Static { .. } => {
                    debug!(esco = %esco, "ESCO filter ignored for static meter registry")
                }
            }
        }

        self.validate()
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.meter.validate()?;
        self.access.validate()?;
        self.registry.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for MediatorConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: MediatorConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// RPC listener settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Plaintext listener for internal jobs, only served alongside TLS.
    #[serde(default)]
    pub private_listen: Option<SocketAddr>,
    /// Worker threads, also the bound on in-flight calls per connection.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Server side deadline after which the caller is answered with
    /// `DEADLINE_EXCEEDED`; the meter conversation itself keeps running.
    #[serde(default)]
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub rpc_deadline: Option<Duration>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Accepted bearer tokens. Empty disables token authentication.
    #[serde(default)]
    pub auth_tokens: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            private_listen: None,
            workers: default_workers(),
            rpc_deadline: None,
            tls: None,
            auth_tokens: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("server.workers must be greater than zero"));
        }
        if self.private_listen.is_some() && self.tls.is_none() {
            return Err(anyhow!("server.private_listen requires server.tls"));
        }
        if self.auth_tokens.iter().any(|token| token.trim().is_empty()) {
            return Err(anyhow!("server.auth_tokens must not contain empty tokens"));
        }
        Ok(())
    }
}

/// mTLS material for the RPC listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert: PemMaterial,
    pub key: PemMaterial,
    /// CA used to verify client certificates.
    pub client_ca: PemMaterial,
}

/// PEM encoded material, either on disk or inline as base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PemMaterial {
    Path(PathBuf),
    Base64(String),
}

impl PemMaterial {
    /// Resolve to the raw PEM bytes.
    pub fn load(&self) -> Result<Vec<u8>> {
        match self {
            PemMaterial::Path(path) => fs::read(path)
                .with_context(|| format!("unable to read pem file {}", path.display())),
            PemMaterial::Base64(encoded) => general_purpose::STANDARD
                .decode(encoded.trim())
                .with_context(|| "pem material is not valid base64"),
        }
    }
}

/// Per-meter socket and framing settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Port used when the metadata registry only supplies a host.
    #[serde(default = "default_meter_port")]
    pub port: u16,
    #[serde(default = "default_socket_timeout")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub connect_timeout: Duration,
    #[serde(default = "default_socket_timeout")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub io_timeout: Duration,
    /// Total connect attempts, including the first.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_receive_buffer")]
    pub receive_buffer: usize,
    #[serde(default = "default_control")]
    pub control: u8,
    #[serde(default)]
    pub source_device_type: u8,
    #[serde(default = "default_source_address")]
    pub source_address: u32,
    #[serde(default)]
    pub destination_device_type: u8,
    #[serde(default)]
    pub destination_address: u32,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            port: default_meter_port(),
            connect_timeout: default_socket_timeout(),
            io_timeout: default_socket_timeout(),
            connect_attempts: default_connect_attempts(),
            receive_buffer: default_receive_buffer(),
            control: default_control(),
            source_device_type: 0,
            source_address: default_source_address(),
            destination_device_type: 0,
            destination_address: 0,
        }
    }
}

impl MeterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connect_attempts == 0 {
            return Err(anyhow!("meter.connect_attempts must be at least 1"));
        }
        if self.receive_buffer < MIN_RECEIVE_BUFFER {
            return Err(anyhow!(
                "meter.receive_buffer must be at least {} bytes",
                MIN_RECEIVE_BUFFER
            ));
        }
        if self.source_address > MAX_ADDRESS || self.destination_address > MAX_ADDRESS {
            return Err(anyhow!("meter addresses must fit in 3 bytes"));
        }
        if self.connect_timeout.is_zero() || self.io_timeout.is_zero() {
            return Err(anyhow!("meter socket timeouts must be non-zero"));
        }
        Ok(())
    }
}

/// Per-meter access policy enforced by the mediator.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    #[serde(default = "default_lock_timeout")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub lock_timeout: Duration,
    /// Tuned against real hardware; change only after validating on meters.
    #[serde(default = "default_min_spacing")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub min_spacing: Duration,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            lock_timeout: default_lock_timeout(),
            min_spacing: default_min_spacing(),
        }
    }
}

impl AccessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout.is_zero() {
            return Err(anyhow!("access.lock_timeout must be non-zero"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_refresh_interval")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub refresh_interval: Duration,
    #[serde(default)]
    pub source: RegistrySourceConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            source: RegistrySourceConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        match &self.source {
            RegistrySourceConfig::Static { meters } => {
                let mut seen = HashSet::new();
                for meter in meters {
                    if meter.serial.trim().is_empty() {
                        return Err(anyhow!("registry meters must declare a serial"));
                    }
                    if !seen.insert(meter.serial.as_str()) {
                        return Err(anyhow!(
                            "registry meter '{}' declared more than once",
                            meter.serial
                        ));
                    }
                }
            }
            RegistrySourceConfig::Rest(rest) => {
                if rest.url.trim().is_empty() {
                    return Err(anyhow!("registry.source.url must not be empty"));
                }
            }
        }
        Ok(())
    }
}

/// Where the serial → address mapping comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistrySourceConfig {
    Static {
        #[serde(default)]
        meters: Vec<StaticMeter>,
    },
    Rest(RestSourceConfig),
}

impl Default for RegistrySourceConfig {
    fn default() -> Self {
        RegistrySourceConfig::Static { meters: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaticMeter {
    pub serial: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
}

/// PostgREST style metadata registry endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestSourceConfig {
    pub url: String,
    pub anon_key: String,
    pub access_token: String,
    /// Restrict the registry to meters of one ESCO code.
    #[serde(default)]
    pub esco: Option<String>,
    #[serde(default = "default_registry_table")]
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Rolling file output is disabled when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default = "default_log_directive")]
    pub default_directive: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
            default_directive: default_log_directive(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
