//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration and logging primitives for the mediator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the EMOP mediator workspace.
//! This crate exposes configuration loading and tracing setup consumed by
//! the transport, registry, networking and daemon crates.

pub mod config;
pub mod logging;

pub use config::{
    AccessConfig, LoadedConfig, LoggingConfig, MediatorConfig, MeterConfig, MetricsConfig,
    PemMaterial, RegistryConfig, RegistrySourceConfig, RestSourceConfig, ServerConfig,
    StaticMeter, TlsConfig,
};
pub use logging::{init_tracing, LogFormat};
