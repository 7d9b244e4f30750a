//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "RPC surface of the EMOP mediator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---

pub mod auth;
pub mod client;
pub mod grpc;
pub mod service;
pub mod status;

pub use auth::TokenAuthInterceptor;
pub use client::{ClientResult, MediatorClient, MediatorClientError};
pub use grpc::{proto, tls_from_config, GrpcServerBuilder, GrpcServerHandle};
pub use service::{MediatorError, MediatorService, MediatorSettings, Operation};
pub use status::{CONNECTION_FAILED_DETAIL, METER_FAILURE_DETAIL, PROTOCOL_EOF_DETAIL};
