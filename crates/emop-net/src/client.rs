//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Typed client for the mediator gRPC surface."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};
use thiserror::Error;

use crate::grpc::proto;
use crate::grpc::proto::emlite_mediator_service_client::EmliteMediatorServiceClient;
use crate::grpc::proto::info_service_client::InfoServiceClient;
use crate::status::{CONNECTION_FAILED_DETAIL, PROTOCOL_EOF_DETAIL};

/// Errors a caller can act on, recovered from the status code and detail.
#[derive(Debug, Error)]
pub enum MediatorClientError {
    #[error("meter not found: {0}")]
    NotFound(String),
    #[error("meter busy: {0}")]
    Busy(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("meter closed the conversation: {0}")]
    ProtocolEof(String),
    #[error("meter unreachable: {0}")]
    ConnectionFailure(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("rpc failed: {0}")]
    Rpc(Status),
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("invalid client setting: {0}")]
    Config(String),
}

impl From<Status> for MediatorClientError {
    fn from(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::NotFound => MediatorClientError::NotFound(message),
            Code::ResourceExhausted => MediatorClientError::Busy(message),
            Code::DeadlineExceeded => MediatorClientError::DeadlineExceeded(message),
            Code::InvalidArgument => MediatorClientError::InvalidArgument(message),
            Code::Unauthenticated => MediatorClientError::Unauthenticated(message),
            Code::Internal if message.starts_with(PROTOCOL_EOF_DETAIL) => {
                MediatorClientError::ProtocolEof(message)
            }
            Code::Internal if message.starts_with(CONNECTION_FAILED_DETAIL) => {
                MediatorClientError::ConnectionFailure(message)
            }
            _ => MediatorClientError::Rpc(status),
        }
    }
}

pub type ClientResult<T> = Result<T, MediatorClientError>;

/// Thin wrapper over the generated stubs that attaches the bearer token.
#[derive(Clone)]
pub struct MediatorClient {
    mediator: EmliteMediatorServiceClient<Channel>,
    info: InfoServiceClient<Channel>,
    token: Option<MetadataValue<Ascii>>,
}

impl MediatorClient {
    /// Connect to a mediator at `url`, e.g. `http://127.0.0.1:50051`.
    pub async fn connect(url: impl Into<String>) -> ClientResult<Self> {
        let endpoint = Endpoint::from_shared(url.into())?;
        let channel = endpoint.connect().await?;
        Ok(Self::from_channel(channel))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            mediator: EmliteMediatorServiceClient::new(channel.clone()),
            info: InfoServiceClient::new(channel),
            token: None,
        }
    }

    pub fn with_token(mut self, token: &str) -> ClientResult<Self> {
        let value = format!("Bearer {token}")
            .parse()
            .map_err(|_| MediatorClientError::Config("token is not valid header text".into()))?;
        self.token = Some(value);
        Ok(self)
    }

    pub async fn read_element(&mut self, serial: &str, object_id: u32) -> ClientResult<Vec<u8>> {
        let request = self.request(proto::ReadElementRequest {
            serial: serial.to_string(),
            object_id,
        });
        let reply = self.mediator.read_element(request).await?;
        Ok(reply.into_inner().response)
    }

    pub async fn write_element(
        &mut self,
        serial: &str,
        object_id: u32,
        payload: Vec<u8>,
    ) -> ClientResult<()> {
        let request = self.request(proto::WriteElementRequest {
            serial: serial.to_string(),
            object_id,
            payload,
        });
        self.mediator.write_element(request).await?;
        Ok(())
    }

    pub async fn send_raw_message(
        &mut self,
        serial: &str,
        data_field: Vec<u8>,
    ) -> ClientResult<Vec<u8>> {
        let request = self.request(proto::SendRawMessageRequest {
            serial: serial.to_string(),
            data_field,
        });
        let reply = self.mediator.send_raw_message(request).await?;
        Ok(reply.into_inner().response)
    }

    /// Registry view of one meter, as JSON text.
    pub async fn get_info(&mut self, serial: &str) -> ClientResult<String> {
        let request = self.request(proto::GetInfoRequest {
            serial: serial.to_string(),
        });
        Ok(self.info.get_info(request).await?.into_inner().json_data)
    }

    pub async fn get_meters(&mut self) -> ClientResult<String> {
        let request = self.request(proto::GetMetersRequest {});
        Ok(self.info.get_meters(request).await?.into_inner().json_meters)
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        if let Some(token) = &self.token {
            request.metadata_mut().insert("authorization", token.clone());
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_status_is_classified_by_prefix() {
        let eof = Status::internal(format!("{PROTOCOL_EOF_DETAIL}: meter=EML1: eof"));
        assert!(matches!(
            MediatorClientError::from(eof),
            MediatorClientError::ProtocolEof(_)
        ));

        let retries = Status::internal(format!("{CONNECTION_FAILED_DETAIL}: meter=EML1: refused"));
        assert!(matches!(
            MediatorClientError::from(retries),
            MediatorClientError::ConnectionFailure(_)
        ));

        let other = Status::internal("meter communication failed: meter=EML1: checksum");
        assert!(matches!(
            MediatorClientError::from(other),
            MediatorClientError::Rpc(status) if status.code() == Code::Internal
        ));
    }

    #[test]
    fn caller_codes_map_directly() {
        assert!(matches!(
            MediatorClientError::from(Status::resource_exhausted("busy")),
            MediatorClientError::Busy(_)
        ));
        assert!(matches!(
            MediatorClientError::from(Status::not_found("nope")),
            MediatorClientError::NotFound(_)
        ));
        assert!(matches!(
            MediatorClientError::from(Status::unauthenticated("token")),
            MediatorClientError::Unauthenticated(_)
        ));
    }
}
