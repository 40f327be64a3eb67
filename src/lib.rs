//! VibeMQ core - MQTT v3.1/v3.1.1 broker core
//!
//! Bit-exact packet codec, a copy-on-write subscription trie with
//! lock-free reads, and per-client delivery bookkeeping, wired into a
//! tokio broker with durable sessions.

pub mod acl;
pub mod auth;
pub mod broker;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod topic;
pub mod transport;

pub use acl::AclProvider;
pub use auth::AuthProvider;
pub use broker::{Broker, BrokerConfig};
pub use codec::{Decoder, Encoder};
pub use config::Config;
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use persistence::{FjallBackend, MemoryBackend, PersistenceManager, StorageBackend};
pub use protocol::{Packet, ProtocolVersion, QoS};
pub use session::{MessageRef, SessionStore};
pub use topic::{SubscriptionStore, SubscriptionTrie};
