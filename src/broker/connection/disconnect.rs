//! Disconnect handling and will message publishing

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{Client, Connection};
use crate::broker::Outbound;
use crate::protocol::{Publish, QoS};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Tear down a connected client.
    ///
    /// `graceful` is true when the client sent DISCONNECT; every other ending,
    /// takeover included, publishes the will. Session state is only touched
    /// while this connection is still the registered one for the client ID.
    pub(crate) async fn handle_disconnect(&mut self, mut client: Client, graceful: bool, taken_over: bool) {
        let current = self
            .broker
            .unregister(&client.client_id, client.connection_id);
        debug!(
            "Disconnect {} (graceful: {}, taken over: {}, current: {})",
            client.client_id, graceful, taken_over, current
        );

        self.salvage_outbound(&mut client);

        if current && client.clean_session {
            self.broker.clean_session(&client.client_id);
        }

        if !graceful {
            if let Some(will) = client.will.take() {
                if self.may_publish(&client, &will.topic).await {
                    debug!("Publishing will of {} to {}", client.client_id, will.topic);
                    let publish = Publish {
                        qos: will.qos,
                        retain: will.retain,
                        topic: Arc::from(will.topic),
                        payload: will.payload,
                        ..Default::default()
                    };
                    self.broker.route(&publish);
                } else {
                    debug!("Will of {} to {} denied", client.client_id, will.topic);
                }
            }
        }

        self.broker
            .hooks()
            .on_client_disconnected(&client.client_id, graceful)
            .await;
    }

    /// Deliveries still sitting in the outbound channel: QoS 1/2 ones move to
    /// the session queue when the session outlives this connection, the rest
    /// release their message
    fn salvage_outbound(&self, client: &mut Client) {
        client.outbound.close();
        let live = self
            .broker
            .sessions()
            .get(&client.client_id)
            .filter(|s| Arc::ptr_eq(s, &client.session));

        while let Ok(outbound) = client.outbound.try_recv() {
            let Outbound::Deliver { message, qos } = outbound else {
                continue;
            };
            let keep = match live {
                Some(ref session) if qos != QoS::AtMostOnce => {
                    let mut s = session.lock();
                    if s.clean_session {
                        false
                    } else {
                        if let Some(evicted) = s.delivery.enqueue(message.clone()) {
                            self.broker.messages().release(&evicted);
                        }
                        self.broker.sessions().sync(&s);
                        true
                    }
                }
                _ => false,
            };
            if keep {
                self.broker.messages().persist(&message);
            } else {
                self.broker.messages().release(&message);
            }
        }
    }
}
