//! Inbound PUBLISH handling

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, trace};

use super::{Client, Connection, ConnectionError};
use crate::hooks::Access;
use crate::protocol::{Packet, ProtocolError, PubAck, PubRec, Publish, QoS};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Whether `client` may publish to `topic`. Hook errors deny.
    pub(crate) async fn may_publish(&self, client: &Client, topic: &str) -> bool {
        match self
            .broker
            .hooks()
            .on_authorize(&client.client_id, client.username.as_deref(), topic, Access::Write)
            .await
        {
            Ok(allowed) => allowed,
            Err(e) => {
                error!("Authorization error for {} on {}: {}", client.client_id, topic, e);
                false
            }
        }
    }

    /// Handle PUBLISH packet.
    ///
    /// QoS 0 and 1 are routed on receipt. QoS 2 is routed the first time its
    /// packet id is seen; a repeat before PUBREL is only acknowledged again.
    /// An unauthorized publish is acknowledged as usual but never routed.
    pub(crate) async fn handle_publish(
        &mut self,
        client: &Client,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        if publish.topic.is_empty() {
            return Err(ProtocolError::ProtocolViolation("empty topic name").into());
        }
        trace!(
            "PUBLISH from {} to {} ({:?}, {} bytes)",
            client.client_id,
            publish.topic,
            publish.qos,
            publish.payload.len()
        );

        let allowed = self.may_publish(client, &publish.topic).await;
        if !allowed {
            debug!("Publish to {} denied for {}", publish.topic, client.client_id);
        }

        match publish.qos {
            QoS::AtMostOnce => {
                if allowed {
                    self.broker.route(&publish);
                }
                Ok(())
            }
            QoS::AtLeastOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return Err(ProtocolError::ProtocolViolation("missing packet id").into());
                };
                if allowed {
                    self.broker.route(&publish);
                }
                self.write_packet(&Packet::PubAck(PubAck::new(packet_id)))
                    .await
            }
            QoS::ExactlyOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return Err(ProtocolError::ProtocolViolation("missing packet id").into());
                };
                let first = {
                    let mut s = client.session.lock();
                    let inserted = s.awaiting_release.insert(packet_id);
                    if inserted {
                        self.broker.sessions().sync(&s);
                    }
                    inserted
                };
                if !first {
                    debug!(packet_id, "Repeated QoS 2 PUBLISH from {}", client.client_id);
                } else if allowed {
                    self.broker.route(&publish);
                }
                self.write_packet(&Packet::PubRec(PubRec::new(packet_id)))
                    .await
            }
        }
    }
}
