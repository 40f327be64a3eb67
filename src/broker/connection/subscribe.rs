//! SUBSCRIBE and UNSUBSCRIBE packet handling

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error};

use super::{Client, Connection, ConnectionError};
use crate::hooks::Access;
use crate::protocol::{Packet, SubAck, SubAckReturnCode, Subscribe, UnsubAck, Unsubscribe};
use crate::topic::{parse_filter, ClientTopic};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle SUBSCRIBE packet. Each filter is validated and authorized on
    /// its own; a failing filter gets 0x80 without affecting the others.
    pub(crate) async fn handle_subscribe(
        &mut self,
        client: &Client,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());

        for sub in subscribe.subscriptions {
            if let Err(e) = parse_filter(&sub.filter) {
                debug!("Invalid filter {:?} from {}: {}", sub.filter, client.client_id, e);
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            let allowed = match self
                .broker
                .hooks()
                .on_authorize(
                    &client.client_id,
                    client.username.as_deref(),
                    &sub.filter,
                    Access::Read,
                )
                .await
            {
                Ok(allowed) => allowed,
                Err(e) => {
                    error!("Authorization error for {} on {}: {}", client.client_id, sub.filter, e);
                    false
                }
            };
            if !allowed {
                debug!("Subscribe to {} denied for {}", sub.filter, client.client_id);
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            let granted = sub.qos.min(self.broker.config().max_qos);
            let filter: Arc<str> = Arc::from(sub.filter);
            {
                let mut s = client.session.lock();
                s.add_subscription(Arc::clone(&filter), granted);
                self.broker.sessions().sync(&s);
            }
            let identity = ClientTopic::new(Arc::clone(&client.client_id), Arc::clone(&filter));
            if let Err(e) = self.broker.subscriptions().add(&identity) {
                // parse_filter accepted it above, so this is not expected
                error!("Failed to index {} for {}: {}", filter, client.client_id, e);
                client.session.lock().remove_subscription(&filter);
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            debug!("{} subscribed to {} ({:?})", client.client_id, filter, granted);
            return_codes.push(SubAckReturnCode::granted(granted));
        }

        self.write_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await
    }

    /// Handle UNSUBSCRIBE packet
    pub(crate) async fn handle_unsubscribe(
        &mut self,
        client: &Client,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in &unsubscribe.filters {
            {
                let mut s = client.session.lock();
                if s.remove_subscription(filter) {
                    self.broker.sessions().sync(&s);
                }
            }
            match self.broker.subscriptions().remove(filter, &client.client_id) {
                Ok(true) => debug!("{} unsubscribed from {}", client.client_id, filter),
                Ok(false) => debug!("{} was not subscribed to {}", client.client_id, filter),
                Err(e) => debug!("Invalid unsubscribe filter {:?} from {}: {}", filter, client.client_id, e),
            }
        }

        self.write_packet(&Packet::UnsubAck(UnsubAck::new(unsubscribe.packet_id)))
            .await
    }
}
