//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "gRPC server for the mediator and info services."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;

use anyhow::Context;
use emop_common::{ServerConfig, TlsConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::transport::server::TcpIncoming;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::auth::TokenAuthInterceptor;
use crate::service::MediatorService;

#[allow(missing_docs)]
pub mod proto {
    tonic::include_proto!("emop.mediator");
}

use proto::emlite_mediator_service_server::{EmliteMediatorService, EmliteMediatorServiceServer};
use proto::info_service_server::{InfoService, InfoServiceServer};

/// Build the mutual TLS settings from PEM material.
pub fn tls_from_config(config: &TlsConfig) -> anyhow::Result<ServerTlsConfig> {
    let cert = config.cert.load().context("failed to load server certificate")?;
    let key = config.key.load().context("failed to load server key")?;
    let ca = config
        .client_ca
        .load()
        .context("failed to load client CA certificate")?;
    Ok(ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca)))
}

/// Configures and spawns the mediator gRPC server.
#[derive(Clone)]
pub struct GrpcServerBuilder {
    listen: SocketAddr,
    private_listen: Option<SocketAddr>,
    service: MediatorService,
    auth: TokenAuthInterceptor,
    tls: Option<ServerTlsConfig>,
    concurrency: Option<usize>,
}

impl GrpcServerBuilder {
    pub fn new(listen: SocketAddr, service: MediatorService) -> Self {
        Self {
            listen,
            private_listen: None,
            service,
            auth: TokenAuthInterceptor::default(),
            tls: None,
            concurrency: None,
        }
    }

    /// Apply listener, TLS, auth and concurrency settings from configuration.
    pub fn from_config(config: &ServerConfig, service: MediatorService) -> anyhow::Result<Self> {
        let mut builder = Self::new(config.listen, service)
            .with_auth(TokenAuthInterceptor::new(config.auth_tokens.iter().cloned()))
            .with_concurrency_limit(config.workers);
        match (&config.tls, config.private_listen) {
            (Some(tls), private) => {
                builder = builder.with_tls(tls_from_config(tls)?);
                if let Some(private) = private {
                    builder = builder.with_private_listener(private);
                }
            }
            (None, Some(private)) => {
                info!(address = %private, "public listener is plaintext; private listener not started");
            }
            (None, None) => {}
        }
        Ok(builder)
    }

    pub fn with_auth(mut self, auth: TokenAuthInterceptor) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_tls(mut self, tls: ServerTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Extra plaintext listener for internal jobs.
    pub fn with_private_listener(mut self, addr: SocketAddr) -> Self {
        self.private_listen = Some(addr);
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit.max(1));
        self
    }

    /// Spawn the gRPC server and return a handle for coordinated shutdown.
    pub async fn spawn(self) -> anyhow::Result<GrpcServerHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let listener = tokio::net::TcpListener::bind(self.listen)
            .await
            .with_context(|| format!("failed to bind grpc listener {}", self.listen))?;
        let local_addr = listener.local_addr()?;
        let mut server = self.base_server();
        if let Some(tls) = self.tls.clone() {
            server = server
                .tls_config(tls)
                .context("failed to apply grpc TLS configuration")?;
        }
        info!(
            address = %local_addr,
            tls = self.tls.is_some(),
            token_auth = self.auth.is_enabled(),
            "grpc api listening"
        );
        tasks.push(self.serve(server, listener, shutdown_rx.clone(), "public")?);

        let mut private_addr = None;
        if let Some(addr) = self.private_listen {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind private grpc listener {addr}"))?;
            let bound = listener.local_addr()?;
            info!(address = %bound, "private grpc api listening");
            tasks.push(self.serve(self.base_server(), listener, shutdown_rx.clone(), "private")?);
            private_addr = Some(bound);
        }

        Ok(GrpcServerHandle {
            address: local_addr,
            private_address: private_addr,
            shutdown: shutdown_tx,
            tasks,
        })
    }

    fn base_server(&self) -> Server {
        let server = Server::builder();
        match self.concurrency {
            Some(limit) => server.concurrency_limit_per_connection(limit),
            None => server,
        }
    }

    fn serve(
        &self,
        mut server: Server,
        listener: tokio::net::TcpListener,
        mut shutdown: watch::Receiver<bool>,
        label: &'static str,
    ) -> anyhow::Result<JoinHandle<()>> {
        let incoming = TcpIncoming::from_listener(listener, true, None)
            .map_err(|err| anyhow::anyhow!("failed to build grpc incoming listener: {err}"))?;
        let mediator = EmliteMediatorServiceServer::with_interceptor(
            MediatorSvc {
                service: self.service.clone(),
            },
            self.auth.clone(),
        );
        let info = InfoServiceServer::with_interceptor(
            InfoSvc {
                service: self.service.clone(),
            },
            self.auth.clone(),
        );

        Ok(tokio::spawn(async move {
            let result = server
                .add_service(mediator)
                .add_service(info)
                .serve_with_incoming_shutdown(incoming, async move {
                    let _ = shutdown.changed().await;
                })
                .await;
            if let Err(err) = result {
                warn!(listener = label, error = %err, "grpc server exited with error");
            }
        }))
    }
}

/// Handle returned when spawning the gRPC server.
pub struct GrpcServerHandle {
    address: SocketAddr,
    private_address: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl GrpcServerHandle {
    /// Socket address the public listener bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn private_addr(&self) -> Option<SocketAddr> {
        self.private_address
    }

    /// Signal shutdown and await every listener.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.await.map_err(|err| anyhow::anyhow!(err))?;
        }
        Ok(())
    }
}

struct MediatorSvc {
    service: MediatorService,
}

#[tonic::async_trait]
impl EmliteMediatorService for MediatorSvc {
    async fn read_element(
        &self,
        request: Request<proto::ReadElementRequest>,
    ) -> Result<Response<proto::ReadElementReply>, Status> {
        let request = request.into_inner();
        let response = self
            .service
            .read_element(&request.serial, request.object_id)
            .await?;
        Ok(Response::new(proto::ReadElementReply { response }))
    }

    async fn write_element(
        &self,
        request: Request<proto::WriteElementRequest>,
    ) -> Result<Response<proto::WriteElementReply>, Status> {
        let request = request.into_inner();
        self.service
            .write_element(&request.serial, request.object_id, request.payload)
            .await?;
        Ok(Response::new(proto::WriteElementReply {}))
    }

    async fn send_raw_message(
        &self,
        request: Request<proto::SendRawMessageRequest>,
    ) -> Result<Response<proto::SendRawMessageReply>, Status> {
        let request = request.into_inner();
        let response = self
            .service
            .send_raw_message(&request.serial, request.data_field)
            .await?;
        Ok(Response::new(proto::SendRawMessageReply { response }))
    }
}

struct InfoSvc {
    service: MediatorService,
}

#[tonic::async_trait]
impl InfoService for InfoSvc {
    async fn get_info(
        &self,
        request: Request<proto::GetInfoRequest>,
    ) -> Result<Response<proto::GetInfoReply>, Status> {
        let json_data = self.service.meter_info(&request.into_inner().serial).await?;
        Ok(Response::new(proto::GetInfoReply { json_data }))
    }

    async fn get_meters(
        &self,
        _request: Request<proto::GetMetersRequest>,
    ) -> Result<Response<proto::GetMetersReply>, Status> {
        let json_meters = self.service.meters()?;
        Ok(Response::new(proto::GetMetersReply { json_meters }))
    }
}
