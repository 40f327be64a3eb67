//! Broker extension points
//!
//! A [`Hooks`] implementation is consulted on CONNECT (authentication),
//! before every PUBLISH and SUBSCRIBE (authorization) and told about
//! connection lifecycle events. Every method defaults to allowing.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
mod tests;

/// A hook could not reach a decision
#[derive(Debug)]
pub enum HookError {
    Internal(String),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "hook failed: {}", msg),
        }
    }
}

impl std::error::Error for HookError {}

pub type HookResult<T> = Result<T, HookError>;

/// What an authorization check is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// SUBSCRIBE; the checked string is a topic filter
    Read,
    /// PUBLISH; the checked string is a topic name
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::Read => "read",
            Access::Write => "write",
        })
    }
}

#[async_trait]
pub trait Hooks: Send + Sync {
    /// `Ok(false)` refuses the CONNECT as bad username or password; an
    /// error refuses it as server unavailable.
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// A denied publish is acknowledged but not routed; a denied
    /// subscription is answered with the SUBACK failure code.
    async fn on_authorize(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _topic: &str,
        _access: Access,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// After an accepting CONNACK was written
    async fn on_client_connected(&self, _client_id: &str, _username: Option<&str>) {}

    /// After the connection task finished. `graceful` means the client
    /// sent DISCONNECT.
    async fn on_client_disconnected(&self, _client_id: &str, _graceful: bool) {}
}

/// Allows everything
#[derive(Debug, Default)]
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

#[async_trait]
impl<T: Hooks + ?Sized> Hooks for Arc<T> {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        T::on_authenticate(self, client_id, username, password).await
    }

    async fn on_authorize(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        access: Access,
    ) -> HookResult<bool> {
        T::on_authorize(self, client_id, username, topic, access).await
    }

    async fn on_client_connected(&self, client_id: &str, username: Option<&str>) {
        T::on_client_connected(self, client_id, username).await
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        T::on_client_disconnected(self, client_id, graceful).await
    }
}

/// Runs hooks in insertion order. A check passes only when every hook
/// allows it, stopping at the first refusal or error. Lifecycle events
/// reach all hooks.
#[derive(Default)]
pub struct CompositeHooks {
    chain: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.chain.push(Box::new(hooks));
    }

    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        for link in &self.chain {
            if !link.on_authenticate(client_id, username, password).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_authorize(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        access: Access,
    ) -> HookResult<bool> {
        for link in &self.chain {
            if !link.on_authorize(client_id, username, topic, access).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_client_connected(&self, client_id: &str, username: Option<&str>) {
        for link in &self.chain {
            link.on_client_connected(client_id, username).await;
        }
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        for link in &self.chain {
            link.on_client_disconnected(client_id, graceful).await;
        }
    }
}
