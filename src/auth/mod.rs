//! Static user authentication
//!
//! Users come from `[[auth.users]]`, each with a plaintext password or an
//! argon2 PHC hash. The provider also remembers which username each
//! connected client logged in with, so ACL checks use the authenticated
//! identity rather than whatever a later packet claims.

use std::collections::HashMap;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::hooks::{HookResult, Hooks};


enum Credential {
    Plaintext(String),
    /// argon2 PHC string
    Hash(String),
}

impl Credential {
    fn verify(&self, password: &[u8]) -> bool {
        match self {
            Credential::Plaintext(expected) => expected.as_bytes() == password,
            Credential::Hash(phc) => match PasswordHash::new(phc) {
                Ok(hash) => Argon2::default().verify_password(password, &hash).is_ok(),
                Err(e) => {
                    warn!("Unusable password hash: {}", e);
                    false
                }
            },
        }
    }
}

struct Account {
    credential: Credential,
    role: Option<String>,
}

pub struct AuthProvider {
    enabled: bool,
    allow_anonymous: bool,
    accounts: HashMap<String, Account>,
    /// client id -> username it authenticated as (None for anonymous)
    logins: RwLock<HashMap<String, Option<String>>>,
}

impl AuthProvider {
    /// Entries without any credential are skipped; config validation
    /// rejects them when auth is enabled.
    pub fn new(config: &AuthConfig) -> Self {
        let accounts = config
            .users
            .iter()
            .filter_map(|user| {
                let credential = match (&user.password_hash, &user.password) {
                    (Some(hash), _) => Credential::Hash(hash.clone()),
                    (None, Some(password)) => Credential::Plaintext(password.clone()),
                    (None, None) => {
                        warn!("Ignoring user '{}' without credential", user.username);
                        return None;
                    }
                };
                let account = Account {
                    credential,
                    role: user.role.clone(),
                };
                Some((user.username.clone(), account))
            })
            .collect();

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            accounts,
            logins: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// ACL role configured for `username`
    pub fn get_user_role(&self, username: &str) -> Option<&str> {
        self.accounts.get(username)?.role.as_deref()
    }

    /// Username `client_id` authenticated with, if it is logged in under one
    pub fn get_client_username(&self, client_id: &str) -> Option<String> {
        self.logins.read().get(client_id).cloned().flatten()
    }

    pub fn remove_client_username(&self, client_id: &str) {
        self.logins.write().remove(client_id);
    }

    fn record_login(&self, client_id: &str, username: Option<&str>) {
        self.logins
            .write()
            .insert(client_id.to_owned(), username.map(str::to_owned));
    }

    fn check(&self, username: Option<&str>, password: Option<&[u8]>) -> bool {
        if !self.enabled {
            return true;
        }
        match username {
            None => self.allow_anonymous,
            Some(name) => self
                .accounts
                .get(name)
                .is_some_and(|account| account.credential.verify(password.unwrap_or_default())),
        }
    }
}

#[async_trait]
impl Hooks for AuthProvider {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        let accepted = self.check(username, password);
        if accepted {
            self.record_login(client_id, username);
        } else {
            debug!("Rejected credentials for {} (user {:?})", client_id, username);
        }
        Ok(accepted)
    }

    async fn on_client_disconnected(&self, client_id: &str, _graceful: bool) {
        self.remove_client_username(client_id);
    }
}
