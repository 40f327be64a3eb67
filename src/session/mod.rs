//! MQTT Session Management
//!
//! A [`Session`] owns everything the broker remembers about one client ID:
//! its subscriptions with their requested QoS, its delivery bookkeeping and
//! the inbound QoS 2 ids awaiting PUBREL. Sessions are created on first
//! reference, survive reconnects unless clean, and are destroyed by
//! [`SessionStore::wipe`].

pub mod delivery;

pub use delivery::{DeliveryState, MessageRef};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::persistence::{PersistenceManager, StoredSession};
use crate::protocol::QoS;
use crate::topic::{ClientTopic, SubscriptionLookup};

/// Errors raised by delivery bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Acknowledgement for a packet id that is not in flight
    UnknownAcknowledgement(u16),
    /// All 65,535 packet ids are in use
    PacketIdsExhausted,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAcknowledgement(id) => {
                write!(f, "acknowledgement for unknown packet id {}", id)
            }
            Self::PacketIdsExhausted => write!(f, "no free packet identifier"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Client session
#[derive(Debug)]
pub struct Session {
    pub client_id: Arc<str>,
    /// Clean sessions are never persisted and are wiped on disconnect
    pub clean_session: bool,
    /// Topic filter -> requested QoS
    pub subscriptions: HashMap<Arc<str>, QoS>,
    /// Outbound delivery bookkeeping
    pub delivery: DeliveryState,
    /// Inbound QoS 2 ids acknowledged with PUBREC, awaiting PUBREL
    pub awaiting_release: HashSet<u16>,
}

impl Session {
    pub fn new(client_id: Arc<str>, clean_session: bool) -> Self {
        Self {
            client_id,
            clean_session,
            subscriptions: HashMap::new(),
            delivery: DeliveryState::default(),
            awaiting_release: HashSet::new(),
        }
    }

    /// Record a subscription, replacing the QoS of an existing one
    pub fn add_subscription(&mut self, filter: Arc<str>, qos: QoS) {
        self.subscriptions.insert(filter, qos);
    }

    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }
}

/// Thread-safe session store
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<Mutex<Session>>>,
    max_queued_messages: usize,
    persistence: Option<Arc<PersistenceManager>>,
}

impl SessionStore {
    pub fn new(max_queued_messages: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_queued_messages,
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<PersistenceManager>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Get or create the session of `client_id`.
    ///
    /// Returns the session and whether it already existed. A clean session
    /// request never resumes: call [`SessionStore::wipe`] first.
    pub fn get_or_create(&self, client_id: &str, clean_session: bool) -> (Arc<Mutex<Session>>, bool) {
        if let Some(existing) = self.sessions.get(client_id) {
            let session = Arc::clone(existing.value());
            drop(existing);
            let changed = {
                let mut s = session.lock();
                let changed = s.clean_session != clean_session;
                s.clean_session = clean_session;
                changed
            };
            if changed {
                self.sync(&session.lock());
            }
            return (session, true);
        }

        let client_id: Arc<str> = Arc::from(client_id);
        let mut created = false;
        let session = self
            .sessions
            .entry(Arc::clone(&client_id))
            .or_insert_with(|| {
                created = true;
                let mut session = Session::new(Arc::clone(&client_id), clean_session);
                session.delivery.set_max_queued(self.max_queued_messages);
                Arc::new(Mutex::new(session))
            })
            .clone();

        if created {
            debug!(%client_id, clean_session, "session created");
            self.sync(&session.lock());
        }
        (session, !created)
    }

    /// Session of `client_id`, creating a persistent one on first reference
    fn session(&self, client_id: &str) -> Arc<Mutex<Session>> {
        match self.sessions.get(client_id) {
            Some(s) => Arc::clone(s.value()),
            None => self.get_or_create(client_id, false).0,
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(client_id).map(|r| Arc::clone(r.value()))
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Destroy the session of `client_id`, returning the messages its
    /// bookkeeping still referenced
    pub fn wipe(&self, client_id: &str) -> Vec<MessageRef> {
        let Some((_, session)) = self.sessions.remove(client_id) else {
            return Vec::new();
        };
        let released = session.lock().delivery.clear();
        if let Some(ref persistence) = self.persistence {
            persistence.write_all(StoredSession::delete_ops(client_id));
        }
        debug!(client_id, "session wiped");
        released
    }

    /// Persist the current state of a non-clean session
    pub fn sync(&self, session: &Session) {
        let Some(ref persistence) = self.persistence else {
            return;
        };
        if session.clean_session {
            return;
        }
        match StoredSession::from(session).to_ops() {
            Ok(ops) => persistence.write_all(ops),
            Err(e) => error!(client_id = %session.client_id, "failed to encode session: {}", e),
        }
    }

    /// Run `f` on the session of `client_id` and persist the result
    pub fn with_session<R>(&self, client_id: &str, f: impl FnOnce(&mut Session) -> R) -> R {
        let session = self.session(client_id);
        let mut guard = session.lock();
        let result = f(&mut guard);
        self.sync(&guard);
        result
    }

    // ========================================================================
    // Client-keyed bookkeeping
    // ========================================================================

    pub fn next_packet_id(&self, client_id: &str) -> Result<u16, SessionError> {
        self.with_session(client_id, |s| s.delivery.next_packet_id())
    }

    pub fn mark_in_flight(&self, client_id: &str, packet_id: u16, message: MessageRef) {
        self.with_session(client_id, |s| s.delivery.mark_in_flight(packet_id, message))
    }

    pub fn acknowledge(&self, client_id: &str, packet_id: u16) -> Result<MessageRef, SessionError> {
        self.with_session(client_id, |s| s.delivery.acknowledge(packet_id))
    }

    /// Queue a delivery; returns the entry evicted by the queue bound, if any
    pub fn enqueue(&self, client_id: &str, message: MessageRef) -> Option<MessageRef> {
        self.with_session(client_id, |s| s.delivery.enqueue(message))
    }

    pub fn dequeue_all(&self, client_id: &str) -> Vec<MessageRef> {
        self.with_session(client_id, |s| s.delivery.dequeue_all())
    }

    pub fn remove_enqueued(&self, client_id: &str, message: &MessageRef) -> bool {
        self.with_session(client_id, |s| s.delivery.remove_enqueued(message))
    }

    pub fn mark_second_phase(&self, client_id: &str, packet_id: u16) {
        self.with_session(client_id, |s| s.delivery.mark_second_phase(packet_id))
    }

    pub fn clear_second_phase(&self, client_id: &str, packet_id: u16) -> bool {
        self.with_session(client_id, |s| s.delivery.clear_second_phase(packet_id))
    }

    pub fn add_subscription(&self, client_id: &str, filter: &str, qos: QoS) {
        self.with_session(client_id, |s| s.add_subscription(Arc::from(filter), qos))
    }

    pub fn remove_subscription(&self, client_id: &str, filter: &str) -> bool {
        self.with_session(client_id, |s| s.remove_subscription(filter))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Install sessions loaded from storage. Clean sessions are discarded.
    pub fn restore(&self, stored: Vec<StoredSession>) -> usize {
        let mut restored = 0;
        for stored in stored {
            if stored.clean_session {
                continue;
            }
            let session = stored.into_session(self.max_queued_messages);
            self.sessions.insert(
                Arc::clone(&session.client_id),
                Arc::new(Mutex::new(session)),
            );
            restored += 1;
        }
        restored
    }

    /// Every message referenced by any session's bookkeeping
    pub fn referenced_messages(&self) -> Vec<MessageRef> {
        let mut refs = Vec::new();
        for entry in self.sessions.iter() {
            let s = entry.value().lock();
            refs.extend(s.delivery.in_flight().map(|(_, m)| m.clone()));
            refs.extend(s.delivery.queued().cloned());
        }
        refs
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SubscriptionLookup for SessionStore {
    fn subscription_qos(&self, client_id: &str, filter: &str) -> Option<QoS> {
        let session = self.get(client_id)?;
        let qos = session.lock().subscriptions.get(filter).copied();
        qos
    }

    fn all_subscriptions(&self) -> Vec<ClientTopic> {
        let mut all = Vec::new();
        for entry in self.sessions.iter() {
            let s = entry.value().lock();
            all.extend(
                s.subscriptions
                    .keys()
                    .map(|filter| ClientTopic::new(Arc::clone(&s.client_id), Arc::clone(filter))),
            );
        }
        all
    }
}
