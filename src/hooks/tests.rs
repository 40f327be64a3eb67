use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::*;

#[tokio::test]
async fn test_default_hooks_allow_all() {
    let hooks = DefaultHooks;

    assert!(hooks
        .on_authenticate("client1", Some("user"), Some(b"pass"))
        .await
        .unwrap());
    assert!(hooks
        .on_authorize("client1", Some("user"), "test/topic", Access::Write)
        .await
        .unwrap());
    assert!(hooks
        .on_authorize("client1", None, "test/#", Access::Read)
        .await
        .unwrap());
}

/// Denies writes below `readonly/`, counts lifecycle events
#[derive(Default)]
struct ReadOnlyHooks {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

#[async_trait]
impl Hooks for ReadOnlyHooks {
    async fn on_authorize(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        topic: &str,
        access: Access,
    ) -> HookResult<bool> {
        Ok(!(access == Access::Write && topic.starts_with("readonly/")))
    }

    async fn on_client_connected(&self, _client_id: &str, _username: Option<&str>) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_client_disconnected(&self, _client_id: &str, _graceful: bool) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

struct DenyHooks;

#[async_trait]
impl Hooks for DenyHooks {
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(false)
    }
}

struct FailingHooks;

#[async_trait]
impl Hooks for FailingHooks {
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Err(HookError::Internal("backend offline".into()))
    }
}

#[tokio::test]
async fn test_composite_hooks_all_must_allow() {
    let hooks = CompositeHooks::new()
        .with(DefaultHooks)
        .with(ReadOnlyHooks::default());
    assert_eq!(hooks.len(), 2);

    assert!(hooks.on_authenticate("c", None, None).await.unwrap());
    assert!(hooks
        .on_authorize("c", None, "data/x", Access::Write)
        .await
        .unwrap());
    assert!(!hooks
        .on_authorize("c", None, "readonly/x", Access::Write)
        .await
        .unwrap());
    assert!(hooks
        .on_authorize("c", None, "readonly/x", Access::Read)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_composite_hooks_one_deny_fails() {
    let hooks = CompositeHooks::new().with(DefaultHooks).with(DenyHooks);
    assert!(!hooks.on_authenticate("c", None, None).await.unwrap());
}

#[tokio::test]
async fn test_composite_hooks_propagate_errors() {
    let hooks = CompositeHooks::new().with(FailingHooks);
    assert!(hooks.on_authenticate("c", None, None).await.is_err());
}

#[tokio::test]
async fn test_events_reach_arc_wrapped_hooks() {
    let inner = Arc::new(ReadOnlyHooks::default());
    let hooks = CompositeHooks::new().with(inner.clone());

    hooks.on_client_connected("c", Some("u")).await;
    hooks.on_client_disconnected("c", true).await;
    hooks.on_client_disconnected("c", false).await;

    assert_eq!(inner.connected.load(Ordering::SeqCst), 1);
    assert_eq!(inner.disconnected.load(Ordering::SeqCst), 2);
}

#[test]
fn test_display() {
    assert_eq!(
        HookError::Internal("boom".into()).to_string(),
        "hook failed: boom"
    );
    assert_eq!(Access::Read.to_string(), "read");
    assert_eq!(Access::Write.to_string(), "write");
}
