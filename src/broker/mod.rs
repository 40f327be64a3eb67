//! MQTT Broker Core
//!
//! The broker ties the subscription store, the session store and the
//! message store together and routes publishes between connection tasks.
//! Each connection task owns its socket; deliveries reach it through the
//! per-client outbound channel held in the connection registry.

pub mod connection;
mod messages;

pub use connection::{Connection, ConnectionError};
pub use messages::{Message, MessageStore};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::hooks::{DefaultHooks, Hooks};
use crate::persistence::{PersistenceError, PersistenceManager};
use crate::protocol::{Publish, QoS};
use crate::session::{MessageRef, SessionStore};
use crate::topic::SubscriptionStore;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum packet size
    pub max_packet_size: usize,
    /// Outbound QoS 1/2 window per client
    pub max_inflight: u16,
    /// Queue bound per client (0 = unbounded)
    pub max_queued_messages: usize,
    /// Capacity of each connection's outbound channel
    pub outbound_channel_capacity: usize,
    /// Time allowed between accept and CONNECT
    pub connect_timeout: Duration,
    /// Upper bound on the keep-alive honoured for a client
    pub max_keep_alive: u16,
    /// Highest QoS granted to subscriptions
    pub max_qos: QoS,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            max_inflight: 32,
            max_queued_messages: 1000,
            outbound_channel_capacity: 1024,
            connect_timeout: Duration::from_secs(60),
            max_keep_alive: u16::MAX,
            max_qos: QoS::ExactlyOnce,
        }
    }
}

impl From<&Config> for BrokerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_packet_size: config.limits.max_packet_size,
            max_inflight: config.limits.max_inflight,
            max_queued_messages: config.limits.max_queued_messages,
            outbound_channel_capacity: config.limits.outbound_channel_capacity,
            connect_timeout: config.session.connect_timeout(),
            max_keep_alive: config.session.max_keep_alive,
            max_qos: QoS::from_u8(config.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
        }
    }
}

/// Work handed to a connection task from elsewhere in the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Deliver a stored message at the given QoS. The receiver owns one
    /// holder of the message.
    Deliver { message: MessageRef, qos: QoS },
    /// Another connection took over this client ID
    Disconnect,
}

struct ConnectionHandle {
    id: u64,
    tx: mpsc::Sender<Outbound>,
}

/// The MQTT Broker
pub struct Broker {
    config: BrokerConfig,
    sessions: Arc<SessionStore>,
    subscriptions: SubscriptionStore,
    messages: MessageStore,
    /// Online clients (client_id -> outbound channel)
    connections: DashMap<Arc<str>, ConnectionHandle>,
    next_connection_id: AtomicU64,
    hooks: Arc<dyn Hooks>,
    persistence: Option<Arc<PersistenceManager>>,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        Self::build(config, hooks, None)
    }

    /// Create a broker whose persistent sessions and their messages are
    /// written through `persistence`
    pub fn with_persistence(
        config: BrokerConfig,
        hooks: Arc<dyn Hooks>,
        persistence: Arc<PersistenceManager>,
    ) -> Self {
        Self::build(config, hooks, Some(persistence))
    }

    fn build(
        config: BrokerConfig,
        hooks: Arc<dyn Hooks>,
        persistence: Option<Arc<PersistenceManager>>,
    ) -> Self {
        let mut sessions = SessionStore::new(config.max_queued_messages);
        let mut messages = MessageStore::new();
        if let Some(ref persistence) = persistence {
            sessions = sessions.with_persistence(Arc::clone(persistence));
            messages = messages.with_persistence(Arc::clone(persistence));
        }
        let sessions = Arc::new(sessions);
        let subscriptions = SubscriptionStore::new(sessions.clone());
        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            sessions,
            subscriptions,
            messages,
            connections: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            hooks,
            persistence,
            shutdown,
        }
    }

    /// Reload persisted sessions, their messages and subscriptions
    pub async fn restore(&self) -> Result<usize, PersistenceError> {
        let Some(ref persistence) = self.persistence else {
            return Ok(0);
        };
        let data = persistence.load_all().await?;
        let sessions = self.sessions.restore(data.sessions);
        let references = self.sessions.referenced_messages();
        let messages = self.messages.restore(data.messages, &references);
        self.subscriptions.reload();
        info!(
            "Restored {} sessions, {} messages, {} subscriptions",
            sessions,
            messages,
            self.subscriptions.len()
        );
        Ok(sessions)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn subscriptions(&self) -> &SubscriptionStore {
        &self.subscriptions
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn hooks(&self) -> &Arc<dyn Hooks> {
        &self.hooks
    }

    pub fn persistence(&self) -> Option<&Arc<PersistenceManager>> {
        self.persistence.as_ref()
    }

    // ========================================================================
    // Connection registry
    // ========================================================================

    /// Register the connection now serving `client_id`. A previous
    /// connection for the same ID is told to disconnect.
    pub fn register(&self, client_id: &Arc<str>) -> (u64, mpsc::Receiver<Outbound>) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.outbound_channel_capacity.max(1));
        if let Some(previous) = self
            .connections
            .insert(Arc::clone(client_id), ConnectionHandle { id, tx })
        {
            debug!("Session takeover for {}", client_id);
            let _ = previous.tx.try_send(Outbound::Disconnect);
        }
        (id, rx)
    }

    /// Remove the registration of connection `id`. Returns false when a newer
    /// connection has taken over the client ID.
    pub fn unregister(&self, client_id: &str, id: u64) -> bool {
        self.connections
            .remove_if(client_id, |_, handle| handle.id == id)
            .is_some()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.connections.contains_key(client_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Forget everything about `client_id`: its trie entries, its session
    /// and the messages its bookkeeping referenced
    pub fn clean_session(&self, client_id: &str) {
        self.subscriptions.remove_all_for_client(client_id);
        for message in self.sessions.wipe(client_id) {
            self.messages.release(&message);
        }
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Route a PUBLISH to every matching subscriber.
    ///
    /// Each subscriber receives one delivery at `min(publish QoS, highest
    /// matching subscription QoS)`. Online clients get it through their
    /// outbound channel; offline persistent sessions, and persistent
    /// sessions whose channel is full, queue QoS 1/2 deliveries. Returns the number of deliveries made.
    pub fn route(&self, publish: &Publish) -> usize {
        // No session lock may be held here: matching reads every session
        let subscribers = self.subscriptions.matches(&publish.topic);
        if subscribers.is_empty() {
            debug!("No subscribers for {}", publish.topic);
            return 0;
        }

        let message_ref = self
            .messages
            .insert(Message::from(publish), subscribers.len());

        let mut delivered = 0;
        for subscriber in subscribers {
            let qos = publish.qos.min(subscriber.qos);
            if self.deliver(&subscriber.client_id, &message_ref, qos) {
                delivered += 1;
            } else {
                self.messages.release(&message_ref);
            }
        }
        debug!(
            "Routed {} ({:?}) to {} subscribers",
            publish.topic, publish.qos, delivered
        );
        delivered
    }

    /// Publish a message originating from the broker itself
    pub fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> usize {
        let publish = Publish {
            qos,
            topic: Arc::from(topic),
            payload,
            ..Default::default()
        };
        self.route(&publish)
    }

    /// Hand one delivery to `client_id`; returns whether a holder was taken
    fn deliver(&self, client_id: &Arc<str>, message_ref: &MessageRef, qos: QoS) -> bool {
        if let Some(handle) = self.connections.get(client_id) {
            let outbound = Outbound::Deliver {
                message: message_ref.clone(),
                qos,
            };
            match handle.tx.try_send(outbound) {
                Ok(()) => return true,
                // Slow reader: QoS 1/2 waits in the session queue below and
                // goes out on the connection's next drain
                Err(mpsc::error::TrySendError::Full(_)) if qos == QoS::AtMostOnce => {
                    warn!("Outbound channel full for {}, dropping QoS 0 delivery", client_id);
                    return false;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Outbound channel full for {}, queueing delivery", client_id);
                }
                // Connection task is ending; treat the client as offline
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        if qos == QoS::AtMostOnce {
            return false;
        }
        let Some(session) = self.sessions.get(client_id) else {
            return false;
        };
        let mut s = session.lock();
        if s.clean_session {
            return false;
        }
        if let Some(evicted) = s.delivery.enqueue(message_ref.clone()) {
            self.messages.release(&evicted);
        }
        self.sessions.sync(&s);
        drop(s);
        self.messages.persist(message_ref);
        true
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Receiver that fires when [`Broker::shutdown`] is called
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Stop accepting and close every connection task
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
