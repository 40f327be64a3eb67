//! MQTT Connection Handler
//!
//! One task per client connection. The task decodes packets from its read
//! buffer, drives the protocol state machine against the session's delivery
//! bookkeeping and writes encoded packets back to the stream. Deliveries
//! routed by other tasks arrive through the outbound channel registered with
//! the broker at CONNECT.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

#[cfg(test)]
mod tests;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Outbound};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{DecodeError, Packet, ProtocolError, Will};
use crate::session::Session;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Timeout,
    /// Connection ended by DISCONNECT or session takeover
    Shutdown,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Protocol(ProtocolError::Decode(e))
    }
}

impl From<crate::protocol::EncodeError> for ConnectionError {
    fn from(e: crate::protocol::EncodeError) -> Self {
        ConnectionError::Protocol(ProtocolError::Encode(e))
    }
}

/// State of an accepted client
pub(crate) struct Client {
    pub(crate) client_id: Arc<str>,
    pub(crate) session: Arc<Mutex<Session>>,
    pub(crate) clean_session: bool,
    pub(crate) username: Option<String>,
    pub(crate) will: Option<Will>,
    pub(crate) keep_alive: u16,
    /// Registry id of this connection
    pub(crate) connection_id: u64,
    pub(crate) outbound: mpsc::Receiver<Outbound>,
}

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    pub(crate) broker: Arc<Broker>,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, addr: SocketAddr, broker: Arc<Broker>) -> Self {
        let max_packet_size = broker.config().max_packet_size;
        Self {
            stream,
            addr,
            broker,
            decoder: Decoder::new().with_max_packet_size(max_packet_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Run the connection handler until the client goes away
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let connect_timeout = self.broker.config().connect_timeout;
        let mut client = match timeout(connect_timeout, self.read_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("Connect timeout from {}", self.addr);
                return Err(ConnectionError::Timeout);
            }
        };

        let result = self.run_connected(&mut client).await;
        let graceful = matches!(result, Ok(()));
        let taken_over = matches!(result, Err(ConnectionError::Shutdown));
        self.handle_disconnect(client, graceful, taken_over).await;

        match result {
            Err(ConnectionError::Shutdown) => Ok(()),
            other => other,
        }
    }

    /// Main loop. `Ok(())` means the client sent DISCONNECT.
    async fn run_connected(&mut self, client: &mut Client) -> Result<(), ConnectionError> {
        let keep_alive_secs = client.keep_alive.min(self.broker.config().max_keep_alive);
        // 1.5x keep alive; 0 disables the check
        let keep_alive = (keep_alive_secs > 0)
            .then(|| Duration::from_millis(u64::from(keep_alive_secs) * 1500));
        debug!(
            "Keep alive for {}: {}s -> timeout {:?}",
            client.client_id, keep_alive_secs, keep_alive
        );
        let mut keep_alive_deadline = keep_alive.map(|d| tokio::time::Instant::now() + d);

        // Packets that were read together with CONNECT
        if self.process_read_buf(client).await? {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            debug!("Connection closed by {}", client.client_id);
                            return Err(ConnectionError::Io(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "connection closed",
                            )));
                        }
                        Ok(_) => {
                            keep_alive_deadline = keep_alive.map(|d| tokio::time::Instant::now() + d);
                            if self.process_read_buf(client).await? {
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            debug!("Read error from {}: {}", client.client_id, e);
                            return Err(e.into());
                        }
                    }
                }

                outbound = client.outbound.recv() => {
                    match outbound {
                        Some(Outbound::Deliver { message, qos }) => {
                            self.deliver(client, message, qos).await?;
                            // The broker queues for us while this channel is full
                            self.drain_queue(client).await?;
                        }
                        Some(Outbound::Disconnect) => {
                            info!("Client {} taken over by a new connection", client.client_id);
                            return Err(ConnectionError::Shutdown);
                        }
                        None => return Err(ConnectionError::Shutdown),
                    }
                }

                _ = async {
                    match keep_alive_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    info!("Keep alive timeout for {} - disconnecting", client.client_id);
                    return Err(ConnectionError::Protocol(ProtocolError::KeepAliveTimeout));
                }
            }
        }
    }

    /// Decode and handle every complete packet in the read buffer.
    /// Returns true once DISCONNECT was received.
    async fn process_read_buf(&mut self, client: &mut Client) -> Result<bool, ConnectionError> {
        while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
            self.read_buf.advance(consumed);
            if self.handle_packet(client, packet).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Handle an incoming packet; returns true for DISCONNECT
    async fn handle_packet(
        &mut self,
        client: &mut Client,
        packet: Packet,
    ) -> Result<bool, ConnectionError> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(client, publish).await?,
            Packet::PubAck(puback) => self.handle_puback(client, puback.packet_id).await?,
            Packet::PubRec(pubrec) => self.handle_pubrec(client, pubrec.packet_id).await?,
            Packet::PubRel(pubrel) => self.handle_pubrel(client, pubrel.packet_id).await?,
            Packet::PubComp(pubcomp) => self.handle_pubcomp(client, pubcomp.packet_id).await?,
            Packet::Subscribe(subscribe) => self.handle_subscribe(client, subscribe).await?,
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client, unsubscribe).await?
            }
            Packet::PingReq => self.write_packet(&Packet::PingResp).await?,
            Packet::Disconnect => {
                debug!("DISCONNECT from {}", client.client_id);
                return Ok(true);
            }
            Packet::Connect(_) => {
                return Err(ProtocolError::ProtocolViolation("duplicate CONNECT").into());
            }
            other => {
                warn!(
                    "Unexpected {:?} from {}",
                    other.packet_type(),
                    client.client_id
                );
                return Err(ProtocolError::ProtocolViolation("unexpected packet type").into());
            }
        }
        Ok(false)
    }

    /// Encode and write one packet
    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }
}
