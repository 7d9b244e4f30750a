//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "TCP transport and session for EMOP meters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use emop_common::MeterConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::error::Elapsed;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::{MeterAddress, MeterTransport};

type Result<T> = std::result::Result<T, TransportError>;

/// Socket limits applied to every meter conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSettings {
    /// Bound on each connect attempt.
    pub connect_timeout: Duration,
    /// Bound on the send and on the reply read.
    pub io_timeout: Duration,
    /// Total connect attempts, including the first.
    pub connect_attempts: u32,
    /// Upper bound for the single reply read.
    pub receive_buffer: usize,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self::from_config(&MeterConfig::default())
    }
}

impl TcpSettings {
    /// Limits from the `[meter]` section. At least one connect attempt is
    /// always made.
    pub fn from_config(config: &MeterConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            io_timeout: config.io_timeout,
            connect_attempts: config.connect_attempts.max(1),
            receive_buffer: config.receive_buffer,
        }
    }
}

/// Lifecycle of a [`MeterConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// Connect attempts in progress.
    Connecting,
    /// Socket open and idle.
    Connected,
    /// Writing the request.
    Sending,
    /// Waiting for the reply.
    Receiving,
}

/// Single-use TCP link to one meter.
///
/// Dropping the connection closes the socket, so every error path releases
/// it without further bookkeeping.
#[derive(Debug)]
pub struct MeterConnection {
    target: MeterAddress,
    settings: TcpSettings,
    state: ConnectionState,
    stream: Option<TcpStream>,
}

impl MeterConnection {
    /// Unconnected link; nothing is opened until [`connect`](Self::connect).
    pub fn new(target: MeterAddress, settings: TcpSettings) -> Self {
        Self {
            target,
            settings,
            state: ConnectionState::Disconnected,
            stream: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Open the socket, retrying up to `connect_attempts` times in total.
    pub async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;
        let attempts = self.settings.connect_attempts.max(1);
        let mut last = None;

        for attempt in 1..=attempts {
            match self.connect_once().await {
                Ok(stream) => {
                    debug!(meter = %self.target, attempt, "connected to meter");
                    self.stream = Some(stream);
                    self.state = ConnectionState::Connected;
                    return Ok(());
                }
                Err(err) => {
                    match &err {
                        TransportError::Refused { .. } => {
                            warn!(meter = %self.target, attempt, attempts, "meter refused connection");
                        }
                        TransportError::Timeout { .. } => {
                            info!(meter = %self.target, attempt, attempts, "meter connect timed out");
                        }
                        other => {
                            warn!(meter = %self.target, attempt, attempts, reason = %other, "meter connect failed");
                        }
                    }
                    last = Some(err);
                }
            }
        }

        self.state = ConnectionState::Disconnected;
        warn!(meter = %self.target, attempts, "giving up on meter connection");
        Err(TransportError::ConnectionFailedAfterRetries {
            attempts,
            last: Box::new(last.unwrap_or(TransportError::ProtocolEof)),
        })
    }

    async fn connect_once(&self) -> Result<TcpStream> {
        let connect = TcpStream::connect((self.target.host.as_str(), self.target.port));
        match timeout(self.settings.connect_timeout, connect).await {
            Err(_) => Err(TransportError::Timeout {
                phase: "connect",
                after: self.settings.connect_timeout,
            }),
            Ok(Err(err)) if err.kind() == io::ErrorKind::ConnectionRefused => {
                Err(TransportError::Refused {
                    target: self.target.to_string(),
                })
            }
            Ok(Err(err)) => Err(TransportError::Io(err)),
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
        }
    }

    /// Write the whole request.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let mut stream = self.take_stream()?;
        self.state = ConnectionState::Sending;
        let outcome = timeout(self.settings.io_timeout, stream.write_all(bytes)).await;
        self.settle(stream, "send", outcome)?;
        debug!(meter = %self.target, request = %hex::encode(bytes), "sent frame");
        Ok(())
    }

    /// Perform one read of at most `receive_buffer` bytes.
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        let mut stream = self.take_stream()?;
        self.state = ConnectionState::Receiving;
        let mut buf = vec![0u8; self.settings.receive_buffer];
        let outcome = timeout(self.settings.io_timeout, stream.read(&mut buf)).await;
        let read = self.settle(stream, "receive", outcome)?;
        if read == 0 {
            self.close();
            return Err(TransportError::ProtocolEof);
        }
        buf.truncate(read);
        debug!(meter = %self.target, reply = %hex::encode(&buf), "received frame");
        Ok(buf)
    }

    /// Drop the socket.
    pub fn close(&mut self) {
        self.stream = None;
        self.state = ConnectionState::Disconnected;
    }

    fn take_stream(&mut self) -> Result<TcpStream> {
        self.stream.take().ok_or_else(|| {
            TransportError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "meter connection is not open",
            ))
        })
    }

    /// Put the stream back after a successful operation; drop it otherwise.
    fn settle<T>(
        &mut self,
        stream: TcpStream,
        phase: &'static str,
        outcome: std::result::Result<io::Result<T>, Elapsed>,
    ) -> Result<T> {
        match outcome {
            Ok(Ok(value)) => {
                self.stream = Some(stream);
                self.state = ConnectionState::Connected;
                Ok(value)
            }
            Ok(Err(err)) => {
                self.close();
                Err(TransportError::Io(err))
            }
            Err(_) => {
                self.close();
                Err(TransportError::Timeout {
                    phase,
                    after: self.settings.io_timeout,
                })
            }
        }
    }
}

/// Production transport: a fresh TCP handshake per conversation.
#[derive(Debug, Clone, Default)]
pub struct TcpMeterTransport {
    settings: TcpSettings,
}

impl TcpMeterTransport {
    /// Transport applying `settings` to every exchange.
    pub fn new(settings: TcpSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TcpSettings {
        &self.settings
    }
}

#[async_trait]
impl MeterTransport for TcpMeterTransport {
    async fn exchange(&self, target: &MeterAddress, request: &[u8]) -> Result<Vec<u8>> {
        let mut connection = MeterConnection::new(target.clone(), self.settings.clone());
        connection.connect().await?;
        connection.send(request).await?;
        let reply = connection.receive().await?;
        connection.close();
        Ok(reply)
    }
}
