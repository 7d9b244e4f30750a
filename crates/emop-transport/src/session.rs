//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "TCP transport and session for EMOP meters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use emop_codec::{DataField, DeviceAddress, Frame, ObjectId};
use emop_common::MeterConfig;
use tracing::debug;

use crate::error::MeterError;
use crate::{MeterAddress, MeterTransport};

type Result<T> = std::result::Result<T, MeterError>;

/// Envelope values stamped on every outgoing frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSettings {
    /// Control byte.
    pub control: u8,
    /// The meter end of the link.
    pub destination: DeviceAddress,
    /// The mediator end of the link.
    pub source: DeviceAddress,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self::from_config(&MeterConfig::default())
    }
}

impl FrameSettings {
    /// Envelope taken from the `[meter]` section.
    pub fn from_config(config: &MeterConfig) -> Self {
        Self {
            control: config.control,
            destination: DeviceAddress::new(
                config.destination_device_type,
                config.destination_address,
            ),
            source: DeviceAddress::new(config.source_device_type, config.source_address),
        }
    }

    fn frame(&self, data: DataField) -> Frame {
        Frame {
            control: self.control,
            destination: self.destination,
            source: self.source,
            data,
        }
    }
}

/// Request/response operations against one meter address.
///
/// Each call is exactly one conversation; the session never pipelines and
/// never retries. Mutual exclusion is the caller's concern.
#[derive(Clone)]
pub struct MeterSession {
    transport: Arc<dyn MeterTransport>,
    address: MeterAddress,
    settings: FrameSettings,
}

impl MeterSession {
    /// Session for `address` over `transport`.
    pub fn new(
        transport: Arc<dyn MeterTransport>,
        address: MeterAddress,
        settings: FrameSettings,
    ) -> Self {
        Self {
            transport,
            address,
            settings,
        }
    }

    /// Meter this session talks to.
    pub fn address(&self) -> &MeterAddress {
        &self.address
    }

    /// Read a register and return its raw value bytes.
    pub async fn read_element(&self, object_id: ObjectId) -> Result<Vec<u8>> {
        let reply = self.converse(DataField::read(object_id)).await?;
        Ok(reply.response_payload().to_vec())
    }

    /// Write a register. The reply is still decoded so a corrupt
    /// acknowledgement surfaces as an error.
    pub async fn write_element(&self, object_id: ObjectId, payload: &[u8]) -> Result<()> {
        self.converse(DataField::write(object_id, payload)).await?;
        Ok(())
    }

    /// Send a caller-encoded data field and return the reply payload.
    pub async fn send_raw_message(&self, data_field: &[u8]) -> Result<Vec<u8>> {
        let request = DataField::decode(data_field)?;
        let reply = self.converse(request).await?;
        Ok(reply.response_payload().to_vec())
    }

    async fn converse(&self, data: DataField) -> Result<DataField> {
        let format = data.format();
        let request = self.settings.frame(data).encode()?;
        let reply = self.transport.exchange(&self.address, &request).await?;
        let frame = Frame::decode_response(&reply)?;
        debug!(
            meter = %self.address,
            request_format = ?format,
            reply_format = ?frame.data.format(),
            source = %frame.source,
            "meter conversation complete"
        );
        Ok(frame.data)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use emop_codec::CodecError;

    use super::*;
    use crate::error::{FailureKind, TransportError};

    /// Replies with a canned frame and records requests.
    struct Scripted {
        reply: Vec<u8>,
        requests: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl MeterTransport for Scripted {
        async fn exchange(
            &self,
            _target: &MeterAddress,
            request: &[u8],
        ) -> std::result::Result<Vec<u8>, TransportError> {
            self.requests.lock().unwrap().push(request.to_vec());
            Ok(self.reply.clone())
        }
    }

    fn meter_reply(data: DataField) -> Vec<u8> {
        Frame {
            control: 0x05,
            destination: DeviceAddress::new(0, 0x21_AE42),
            source: DeviceAddress::new(0, 0),
            data,
        }
        .encode()
        .unwrap()
    }

    fn session(reply: Vec<u8>) -> (MeterSession, Arc<Scripted>) {
        let transport = Arc::new(Scripted {
            reply,
            requests: Mutex::new(Vec::new()),
        });
        let session = MeterSession::new(
            transport.clone(),
            MeterAddress::new("127.0.0.1", 8080),
            FrameSettings::default(),
        );
        (session, transport)
    }

    #[tokio::test]
    async fn read_element_returns_payload() {
        let oid = ObjectId::new(0x60_0100).unwrap();
        let (session, transport) = session(meter_reply(DataField::Default(
            emop_codec::DefaultRecord {
                object_id: oid,
                access: emop_codec::Access::Read,
                payload: vec![0x10, 0x27, 0x00, 0x00],
            },
        )));

        let value = session.read_element(oid).await.unwrap();
        assert_eq!(value, vec![0x10, 0x27, 0x00, 0x00]);

        let sent = transport.requests.lock().unwrap()[0].clone();
        let request = Frame::decode(&sent).unwrap();
        assert_eq!(request.control, 0x05);
        assert_eq!(request.source, DeviceAddress::new(0, 0x21_AE42));
        assert_eq!(request.destination, DeviceAddress::new(0, 0));
        assert_eq!(request.data, DataField::read(oid));
    }

    #[tokio::test]
    async fn write_element_validates_reply() {
        let oid = ObjectId::new(0x00_0201).unwrap();
        let mut reply = meter_reply(DataField::write(oid, vec![1]));
        let last = reply.len() - 1;
        reply[last] ^= 0xFF;
        let (session, _) = session(reply);

        let err = session.write_element(oid, &[1]).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::ChecksumMismatch);
    }

    #[tokio::test]
    async fn raw_message_is_validated_before_sending() {
        let (session, transport) = session(Vec::new());
        let err = session.send_raw_message(&[0x42, 0x00]).await.unwrap_err();
        assert!(matches!(err, MeterError::Codec(CodecError::UnknownFormat(0x42))));
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn three_phase_reply_shaped_like_a_request_is_returned_whole() {
        let mut block = vec![0x01; 9];
        block.extend_from_slice(&emop_codec::THREE_PHASE_TRAILER);
        let (session, transport) = session(meter_reply(DataField::ThreePhaseIntervals(
            emop_codec::ThreePhaseIntervals::Response(block.clone()),
        )));

        let request = DataField::ThreePhaseIntervals(emop_codec::ThreePhaseIntervals::Request {
            profile: 1,
            start: 1_700_000_000,
            end: 1_700_003_600,
        });
        let payload = session.send_raw_message(&request.to_bytes()).await.unwrap();
        assert_eq!(payload.len(), 13);
        assert_eq!(payload, block);

        let sent = transport.requests.lock().unwrap()[0].clone();
        assert_eq!(Frame::decode(&sent).unwrap().data, request);
    }

    #[tokio::test]
    async fn short_reply_is_protocol_eof() {
        let oid = ObjectId::new(1).unwrap();
        let full = meter_reply(DataField::read(oid));
        let (session, _) = session(full[..6].to_vec());
        let err = session.read_element(oid).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::ProtocolEof);
    }
}
