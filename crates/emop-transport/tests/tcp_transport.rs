//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "TCP transport tests against a local fake meter."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use emop_codec::{Access, DataField, DefaultRecord, DeviceAddress, Frame, ObjectId};
use emop_transport::{
    FailureKind, FrameSettings, MeterAddress, MeterError, MeterSession, MeterTransport,
    TcpMeterTransport, TcpSettings, TransportError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn fast_settings() -> TcpSettings {
    TcpSettings {
        connect_timeout: Duration::from_millis(500),
        io_timeout: Duration::from_millis(300),
        connect_attempts: 3,
        receive_buffer: 128,
    }
}

async fn listener() -> (TcpListener, MeterAddress) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, MeterAddress::new("127.0.0.1", port))
}

/// Answers every read request with the register value `value`.
async fn spawn_fake_meter(listener: TcpListener, value: Vec<u8>) {
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let value = value.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                let read = socket.read(&mut buf).await.unwrap();
                let request = Frame::decode(&buf[..read]).unwrap();
                let DataField::Default(record) = request.data else {
                    return;
                };
                let reply = Frame {
                    control: request.control,
                    destination: request.source,
                    source: request.destination,
                    data: DataField::Default(DefaultRecord {
                        object_id: record.object_id,
                        access: Access::Read,
                        payload: value,
                    }),
                };
                socket.write_all(&reply.encode().unwrap()).await.unwrap();
            });
        }
    });
}

#[tokio::test]
async fn session_round_trip_over_tcp() {
    let (listener, address) = listener().await;
    spawn_fake_meter(listener, vec![0x01, 0x02, 0x03, 0x04]).await;

    let session = MeterSession::new(
        Arc::new(TcpMeterTransport::new(fast_settings())),
        address,
        FrameSettings::default(),
    );
    let oid = ObjectId::new(0x60_0100).unwrap();
    assert_eq!(
        session.read_element(oid).await.unwrap(),
        vec![0x01, 0x02, 0x03, 0x04]
    );
    // One handshake per request.
    assert_eq!(
        session.read_element(oid).await.unwrap(),
        vec![0x01, 0x02, 0x03, 0x04]
    );
}

#[tokio::test]
async fn refused_connect_exhausts_attempts() {
    let (listener, address) = listener().await;
    drop(listener);

    let transport = TcpMeterTransport::new(fast_settings());
    let err = transport.exchange(&address, &[0x7E]).await.unwrap_err();
    match err {
        TransportError::ConnectionFailedAfterRetries { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, TransportError::Refused { .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn zero_byte_reply_is_protocol_eof() {
    let (listener, address) = listener().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let _ = socket.read(&mut buf).await;
        drop(socket);
    });

    let transport = TcpMeterTransport::new(fast_settings());
    let err = transport.exchange(&address, &[0x7E, 0x00]).await.unwrap_err();
    assert!(matches!(err, TransportError::ProtocolEof), "{err:?}");
    assert_eq!(err.kind(), FailureKind::ProtocolEof);
}

#[tokio::test]
async fn silent_meter_times_out() {
    let (listener, address) = listener().await;
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(socket);
    });

    let transport = TcpMeterTransport::new(fast_settings());
    let err = transport.exchange(&address, &[0x7E]).await.unwrap_err();
    assert!(
        matches!(err, TransportError::Timeout { phase: "receive", .. }),
        "{err:?}"
    );
}

#[tokio::test]
async fn partial_frame_surfaces_as_protocol_eof() {
    let (listener, address) = listener().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let _ = socket.read(&mut buf).await;
        let full = Frame {
            control: 0x05,
            destination: DeviceAddress::new(0, 0x21_AE42),
            source: DeviceAddress::new(0, 0),
            data: DataField::write(ObjectId::new(1).unwrap(), vec![9; 20]),
        }
        .encode()
        .unwrap();
        socket.write_all(&full[..8]).await.unwrap();
    });

    let session = MeterSession::new(
        Arc::new(TcpMeterTransport::new(fast_settings())),
        address,
        FrameSettings::default(),
    );
    let err = session
        .read_element(ObjectId::new(1).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, MeterError::Codec(_)));
    assert_eq!(err.kind(), FailureKind::ProtocolEof);
}
