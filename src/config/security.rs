//! `[auth]` and `[acl]` sections

use std::collections::HashSet;

use serde::Deserialize;

use super::ConfigError;

/// `[auth]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// When false every CONNECT is accepted
    pub enabled: bool,
    /// Accept CONNECTs without a username while auth is enabled
    pub allow_anonymous: bool,
    pub users: Vec<UserConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

impl AuthConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        self.users.iter().try_for_each(UserConfig::validate)
    }
}

/// One `[[auth.users]]` entry. Exactly one of `password` and
/// `password_hash` must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    /// Plaintext secret
    #[serde(default)]
    pub password: Option<String>,
    /// Argon2 PHC string (`$argon2id$v=19$...`)
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Name of an `[[acl.roles]]` entry
    #[serde(default)]
    pub role: Option<String>,
}

impl UserConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let problem = match (self.password.as_deref(), self.password_hash.as_deref()) {
            (None, None) => "must have either 'password' or 'password_hash'",
            (Some(_), Some(_)) => "cannot have both 'password' and 'password_hash'",
            (Some(""), None) => "has empty password",
            (None, Some(hash)) if !hash.starts_with("$argon2") => {
                "has invalid password_hash format (must be argon2 PHC format)"
            }
            _ => return Ok(()),
        };
        Err(ConfigError::invalid(format!(
            "User '{}' {}",
            self.username, problem
        )))
    }
}

/// `[acl]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    /// When false every publish and subscribe is authorized
    pub enabled: bool,
    pub roles: Vec<AclRole>,
    /// Grants for users without a role, anonymous clients included
    pub default: AclPermissions,
}

impl AclConfig {
    /// Every role a user names must be defined
    pub(super) fn check_role_references(&self, users: &[UserConfig]) -> Result<(), ConfigError> {
        let known: HashSet<&str> = self.roles.iter().map(|r| r.name.as_str()).collect();
        for user in users {
            if let Some(role) = user.role.as_deref() {
                if !known.contains(role) {
                    return Err(ConfigError::invalid(format!(
                        "User '{}' references unknown role '{}'",
                        user.username, role
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One `[[acl.roles]]` entry. Patterns may use `+`, `#`, `%c` (client id)
/// and `%u` (username).
#[derive(Debug, Clone, Deserialize)]
pub struct AclRole {
    pub name: String,
    #[serde(default)]
    pub publish: Vec<String>,
    #[serde(default)]
    pub subscribe: Vec<String>,
}

/// `[acl.default]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AclPermissions {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}
