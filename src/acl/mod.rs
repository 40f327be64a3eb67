//! Topic access control
//!
//! Each role grants publish and subscribe patterns. Patterns use the MQTT
//! wildcards plus two placeholders: `%c` (client id) and `%u` (username).
//! A client whose user has no role, anonymous ones included, gets the
//! `[acl.default]` grants; a client with a role gets those on top of its
//! own.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::auth::AuthProvider;
use crate::config::{AclConfig, AclPermissions};
use crate::hooks::{Access, HookResult, Hooks};
use crate::topic::{parse_filter, parse_topic, Token};


/// Publish and subscribe patterns of one role
struct Grants {
    publish: Vec<String>,
    subscribe: Vec<String>,
}

impl Grants {
    fn new(publish: &[String], subscribe: &[String]) -> Self {
        Self {
            publish: publish.to_vec(),
            subscribe: subscribe.to_vec(),
        }
    }

    fn for_access(&self, access: Access) -> &[String] {
        match access {
            Access::Write => &self.publish,
            Access::Read => &self.subscribe,
        }
    }

    fn allows(&self, access: Access, topic: &str, client_id: &str, username: Option<&str>) -> bool {
        self.for_access(access)
            .iter()
            .any(|pattern| AclProvider::matches_pattern(pattern, topic, client_id, username))
    }
}

pub struct AclProvider {
    enabled: bool,
    roles: HashMap<String, Grants>,
    default: Grants,
    /// Source of authenticated usernames and user roles
    auth_provider: Arc<AuthProvider>,
}

impl AclProvider {
    pub fn new(config: &AclConfig, auth_provider: Arc<AuthProvider>) -> Self {
        let AclPermissions { publish, subscribe } = &config.default;
        Self {
            enabled: config.enabled,
            roles: config
                .roles
                .iter()
                .map(|role| (role.name.clone(), Grants::new(&role.publish, &role.subscribe)))
                .collect(),
            default: Grants::new(publish, subscribe),
            auth_provider,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Expand `%c`/`%u` in `pattern`, then test `topic` against it. An
    /// identity that is empty or contains `/`, `+` or `#` makes the pattern
    /// match nothing, so nobody can widen a grant through their own name.
    fn matches_pattern(
        pattern: &str,
        topic: &str,
        client_id: &str,
        username: Option<&str>,
    ) -> bool {
        let mut expanded = pattern.to_owned();
        if expanded.contains("%c") {
            if !Self::is_plain_segment(client_id) {
                return false;
            }
            expanded = expanded.replace("%c", client_id);
        }
        if expanded.contains("%u") {
            match username.filter(|u| Self::is_plain_segment(u)) {
                Some(u) => expanded = expanded.replace("%u", u),
                None => return false,
            }
        }
        Self::mqtt_pattern_match(&expanded, topic)
    }

    fn is_plain_segment(value: &str) -> bool {
        !value.is_empty() && !value.contains(['/', '+', '#'])
    }

    /// A `+` or `#` level in `topic` (a requested subscription filter) is
    /// only covered by a pattern wildcard at least as wide.
    fn mqtt_pattern_match(pattern: &str, topic: &str) -> bool {
        match parse_filter(pattern) {
            Ok(pattern) => Self::covers(&pattern, &parse_topic(topic)),
            Err(_) => false,
        }
    }

    fn covers(pattern: &[Token], topic: &[Token]) -> bool {
        match (pattern.split_first(), topic.split_first()) {
            (Some((Token::MultiLevel, _)), _) => true,
            (None, None) => true,
            (Some((Token::SingleLevel, p_rest)), Some((level, t_rest))) => {
                let multi = matches!(level, Token::Literal(s) if s.as_str() == "#");
                !multi && Self::covers(p_rest, t_rest)
            }
            (Some((p, p_rest)), Some((level, t_rest))) => {
                p == level && Self::covers(p_rest, t_rest)
            }
            _ => false,
        }
    }

    fn role_of(&self, username: Option<&str>) -> Option<&Grants> {
        let role = self.auth_provider.get_user_role(username?)?;
        self.roles.get(role)
    }
}

#[async_trait]
impl Hooks for AclProvider {
    async fn on_authorize(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        access: Access,
    ) -> HookResult<bool> {
        if !self.enabled {
            return Ok(true);
        }

        // The login recorded at CONNECT outranks the username passed in
        let authenticated = self.auth_provider.get_client_username(client_id);
        let username = authenticated.as_deref().or(username);

        let allowed = self
            .role_of(username)
            .is_some_and(|grants| grants.allows(access, topic, client_id, username))
            || self.default.allows(access, topic, client_id, username);

        if !allowed {
            debug!(
                "ACL denied {} on '{}' for {} (user {:?})",
                access, topic, client_id, username
            );
        }
        Ok(allowed)
    }
}
