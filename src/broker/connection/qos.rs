//! Outbound deliveries and acknowledgment handling (PUBACK, PUBREC, PUBREL, PUBCOMP)

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use super::{Client, Connection, ConnectionError};
use crate::broker::Message;
use crate::protocol::{Packet, PubComp, PubRel, QoS};
use crate::session::{MessageRef, Session, SessionError};
use crate::topic::topic_matches_filter;

/// Delivery QoS for a queued or resent message: the message's own QoS capped
/// by the highest QoS among the session's filters matching its topic
fn delivery_qos(session: &Session, message: &Message) -> QoS {
    session
        .subscriptions
        .iter()
        .filter(|(filter, _)| topic_matches_filter(&message.topic, filter))
        .map(|(_, qos)| *qos)
        .max()
        .map_or(message.qos, |granted| message.qos.min(granted))
}

/// Next step for one delivery, decided under the session lock
enum Dispatch {
    /// Write now with this packet id (None for QoS 0)
    Send(Option<u16>),
    /// Parked in the queue
    Queued,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Deliver a routed message. This connection owns one holder of it.
    ///
    /// QoS 0 is written and released at once. QoS 1/2 deliveries take a
    /// packet id and stay in flight until acknowledged; when the in-flight
    /// window is full, or older deliveries are still queued, they join the
    /// queue instead.
    pub(crate) async fn deliver(
        &mut self,
        client: &Client,
        message_ref: MessageRef,
        qos: QoS,
    ) -> Result<(), ConnectionError> {
        let Some(message) = self.broker.messages().get(&message_ref) else {
            warn!(%message_ref, "delivery for missing message");
            return Ok(());
        };

        let max_inflight = usize::from(self.broker.config().max_inflight);
        let dispatch = {
            let mut s = client.session.lock();
            if qos == QoS::AtMostOnce {
                Dispatch::Send(None)
            } else if s.delivery.in_flight_len() >= max_inflight || s.delivery.queue_len() > 0 {
                if let Some(evicted) = s.delivery.enqueue(message_ref.clone()) {
                    self.broker.messages().release(&evicted);
                }
                self.broker.sessions().sync(&s);
                Dispatch::Queued
            } else {
                match s.delivery.next_packet_id() {
                    Ok(packet_id) => {
                        s.delivery.mark_in_flight(packet_id, message_ref.clone());
                        self.broker.sessions().sync(&s);
                        Dispatch::Send(Some(packet_id))
                    }
                    Err(e) => {
                        warn!("{} for {}, queueing delivery", e, client.client_id);
                        if let Some(evicted) = s.delivery.enqueue(message_ref.clone()) {
                            self.broker.messages().release(&evicted);
                        }
                        self.broker.sessions().sync(&s);
                        Dispatch::Queued
                    }
                }
            }
        };

        match dispatch {
            Dispatch::Send(None) => {
                self.broker.messages().release(&message_ref);
                let publish = message.to_publish(QoS::AtMostOnce, None, false);
                self.write_packet(&Packet::Publish(publish)).await
            }
            Dispatch::Send(Some(packet_id)) => {
                if !client.clean_session {
                    self.broker.messages().persist(&message_ref);
                }
                trace!("PUBLISH {} to {} (id {})", message.topic, client.client_id, packet_id);
                let publish = message.to_publish(qos, Some(packet_id), false);
                self.write_packet(&Packet::Publish(publish)).await
            }
            Dispatch::Queued => {
                if !client.clean_session {
                    self.broker.messages().persist(&message_ref);
                }
                self.drain_queue(client).await
            }
        }
    }

    /// Send queued deliveries while the in-flight window has room
    pub(crate) async fn drain_queue(&mut self, client: &Client) -> Result<(), ConnectionError> {
        let max_inflight = usize::from(self.broker.config().max_inflight);
        loop {
            let next = {
                let mut s = client.session.lock();
                if s.delivery.in_flight_len() >= max_inflight {
                    break;
                }
                let Some(message_ref) = s.delivery.dequeue() else {
                    break;
                };
                let Some(message) = self.broker.messages().get(&message_ref) else {
                    warn!(%message_ref, "queued delivery for missing message, skipping");
                    self.broker.sessions().sync(&s);
                    continue;
                };
                let qos = delivery_qos(&s, &message);
                if qos == QoS::AtMostOnce {
                    self.broker.sessions().sync(&s);
                    (message_ref, message, qos, None)
                } else {
                    match s.delivery.next_packet_id() {
                        Ok(packet_id) => {
                            s.delivery.mark_in_flight(packet_id, message_ref.clone());
                            self.broker.sessions().sync(&s);
                            (message_ref, message, qos, Some(packet_id))
                        }
                        Err(e) => {
                            debug!("{} for {}, queue drain paused", e, client.client_id);
                            s.delivery.requeue_front(message_ref);
                            break;
                        }
                    }
                }
            };

            let (message_ref, message, qos, packet_id) = next;
            if packet_id.is_none() {
                self.broker.messages().release(&message_ref);
            }
            let publish = message.to_publish(qos, packet_id, false);
            self.write_packet(&Packet::Publish(publish)).await?;
        }
        Ok(())
    }

    /// Resend unacknowledged deliveries of a resumed session, then drain its
    /// queue
    pub(crate) async fn resume_session(&mut self, client: &Client) -> Result<(), ConnectionError> {
        let (in_flight, second_phase) = {
            let s = client.session.lock();
            let in_flight: Vec<_> = s
                .delivery
                .in_flight()
                .map(|(packet_id, message_ref)| {
                    let resend = self.broker.messages().get(message_ref).map(|message| {
                        let qos = delivery_qos(&s, &message).max(QoS::AtLeastOnce);
                        message.to_publish(qos, Some(packet_id), true)
                    });
                    (packet_id, resend)
                })
                .collect();
            (in_flight, s.delivery.second_phase_ids())
        };

        debug!(
            "Resuming {}: {} in flight, {} awaiting PUBCOMP",
            client.client_id,
            in_flight.len(),
            second_phase.len()
        );

        for (packet_id, resend) in in_flight {
            match resend {
                Some(publish) => self.write_packet(&Packet::Publish(publish)).await?,
                None => {
                    warn!(packet_id, "in-flight delivery lost its message, dropping");
                    let mut s = client.session.lock();
                    match s.delivery.acknowledge(packet_id) {
                        Ok(_) => self.broker.sessions().sync(&s),
                        Err(e) => warn!(
                            "Dropping in-flight {} for {}: {}",
                            packet_id, client.client_id, e
                        ),
                    }
                }
            }
        }
        for packet_id in second_phase {
            self.write_packet(&Packet::PubRel(PubRel::new(packet_id)))
                .await?;
        }

        self.drain_queue(client).await
    }

    /// Complete a delivery and release its message
    fn complete(&self, client: &Client, packet_id: u16) -> Result<(), SessionError> {
        let mut s = client.session.lock();
        let message_ref = s.delivery.acknowledge(packet_id)?;
        self.broker.sessions().sync(&s);
        drop(s);
        self.broker.messages().release(&message_ref);
        Ok(())
    }

    /// Handle PUBACK packet (outbound QoS 1 complete)
    pub(crate) async fn handle_puback(
        &mut self,
        client: &Client,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        if let Err(e) = self.complete(client, packet_id) {
            debug!("PUBACK from {}: {}", client.client_id, e);
            return Ok(());
        }
        self.drain_queue(client).await
    }

    /// Handle PUBREC packet (outbound QoS 2, first phase complete)
    pub(crate) async fn handle_pubrec(
        &mut self,
        client: &Client,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        let repeated = client.session.lock().delivery.is_second_phase(packet_id);
        if !repeated {
            let mut s = client.session.lock();
            let acknowledged = s.delivery.acknowledge(packet_id);
            match acknowledged {
                Ok(message_ref) => {
                    s.delivery.mark_second_phase(packet_id);
                    self.broker.sessions().sync(&s);
                    drop(s);
                    self.broker.messages().release(&message_ref);
                }
                Err(e) => {
                    debug!("PUBREC from {}: {}", client.client_id, e);
                    return Ok(());
                }
            }
        }

        self.write_packet(&Packet::PubRel(PubRel::new(packet_id)))
            .await
    }

    /// Handle PUBREL packet (inbound QoS 2, release the packet id)
    pub(crate) async fn handle_pubrel(
        &mut self,
        client: &Client,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        {
            let mut s = client.session.lock();
            if s.awaiting_release.remove(&packet_id) {
                self.broker.sessions().sync(&s);
            } else {
                debug!(packet_id, "PUBREL for unknown packet id from {}", client.client_id);
            }
        }

        self.write_packet(&Packet::PubComp(PubComp::new(packet_id)))
            .await
    }

    /// Handle PUBCOMP packet (outbound QoS 2 complete)
    pub(crate) async fn handle_pubcomp(
        &mut self,
        client: &Client,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        let cleared = {
            let mut s = client.session.lock();
            let cleared = s.delivery.clear_second_phase(packet_id);
            if cleared {
                self.broker.sessions().sync(&s);
            }
            cleared
        };
        if !cleared {
            warn!(packet_id, "PUBCOMP for unknown packet id from {}", client.client_id);
            return Ok(());
        }
        self.drain_queue(client).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;

    fn message(topic: &str, qos: QoS) -> Message {
        Message {
            topic: Arc::from(topic),
            payload: Bytes::from_static(b"x"),
            qos,
            retain: false,
        }
    }

    #[test]
    fn test_delivery_qos_uses_highest_matching_filter() {
        let mut session = Session::new(Arc::from("c"), false);
        session.add_subscription(Arc::from("a/+"), QoS::AtMostOnce);
        session.add_subscription(Arc::from("a/#"), QoS::AtLeastOnce);
        session.add_subscription(Arc::from("b/#"), QoS::ExactlyOnce);

        assert_eq!(
            delivery_qos(&session, &message("a/b", QoS::ExactlyOnce)),
            QoS::AtLeastOnce
        );
        assert_eq!(
            delivery_qos(&session, &message("a/b", QoS::AtMostOnce)),
            QoS::AtMostOnce
        );
    }

    #[test]
    fn test_delivery_qos_without_match_keeps_message_qos() {
        let session = Session::new(Arc::from("c"), false);
        assert_eq!(
            delivery_qos(&session, &message("x", QoS::ExactlyOnce)),
            QoS::ExactlyOnce
        );
    }
}
