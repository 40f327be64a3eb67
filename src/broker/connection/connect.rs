//! CONNECT packet handling

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use super::{Client, Connection, ConnectionError};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolError,
};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read and process the CONNECT packet
    pub(crate) async fn read_connect(&mut self) -> Result<Client, ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    bytes::Buf::advance(&mut self.read_buf, consumed);

                    return match packet {
                        Packet::Connect(connect) => self.handle_connect(*connect).await,
                        _ => {
                            debug!("First packet from {} was not CONNECT", self.addr);
                            Err(ProtocolError::ProtocolViolation("first packet must be CONNECT").into())
                        }
                    };
                }
                Ok(None) => {}
                Err(DecodeError::InvalidProtocolVersion(level)) => {
                    debug!("Unsupported protocol level {} from {}", level, self.addr);
                    self.refuse(ConnectReturnCode::UnacceptableProtocolVersion)
                        .await?;
                    return Err(DecodeError::InvalidProtocolVersion(level).into());
                }
                Err(e) => return Err(e.into()),
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before CONNECT",
                )));
            }
        }
    }

    /// Send a refusing CONNACK
    async fn refuse(&mut self, return_code: ConnectReturnCode) -> Result<(), ConnectionError> {
        self.write_packet(&Packet::ConnAck(ConnAck::refused(return_code)))
            .await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<Client, ConnectionError> {
        // A zero-byte client ID requires a clean session
        if connect.client_id.is_empty() && !connect.clean_session {
            debug!(
                "Rejecting empty client ID with clean_session=false from {}",
                self.addr
            );
            self.refuse(ConnectReturnCode::IdentifierRejected).await?;
            return Err(ProtocolError::ConnectionRefused(
                ConnectReturnCode::IdentifierRejected as u8,
            )
            .into());
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            Arc::from(format!("vibemq-{}", uuid::Uuid::new_v4().simple()))
        } else {
            Arc::from(connect.client_id.as_str())
        };

        debug!(
            "CONNECT from {} (client_id: {}, {:?}, clean_session: {})",
            self.addr, client_id, connect.protocol_version, connect.clean_session
        );

        let hooks = Arc::clone(self.broker.hooks());
        match hooks
            .on_authenticate(
                &client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("Authentication failed for {}", client_id);
                self.refuse(ConnectReturnCode::BadUsernameOrPassword).await?;
                return Err(ProtocolError::NotAuthorized.into());
            }
            Err(e) => {
                error!("Authentication error for {}: {}", client_id, e);
                self.refuse(ConnectReturnCode::ServerUnavailable).await?;
                return Err(ProtocolError::ConnectionRefused(
                    ConnectReturnCode::ServerUnavailable as u8,
                )
                .into());
            }
        }

        // Take over any live connection before touching the session
        let (connection_id, outbound) = self.broker.register(&client_id);

        if connect.clean_session {
            self.broker.clean_session(&client_id);
        }
        let (session, session_present) = self
            .broker
            .sessions()
            .get_or_create(&client_id, connect.clean_session);
        let session_present = session_present && !connect.clean_session;

        let client = Client {
            client_id: Arc::clone(&client_id),
            session,
            clean_session: connect.clean_session,
            username: connect.username,
            will: connect.will,
            keep_alive: connect.keep_alive,
            connection_id,
            outbound,
        };

        if let Err(e) = self
            .write_packet(&Packet::ConnAck(ConnAck::accepted(session_present)))
            .await
        {
            self.broker.unregister(&client_id, connection_id);
            return Err(e);
        }
        debug!(
            "CONNACK to {} (session_present: {})",
            client_id, session_present
        );

        hooks
            .on_client_connected(&client_id, client.username.as_deref())
            .await;

        if session_present {
            self.resume_session(&client).await?;
        }

        Ok(client)
    }
}
