//! Client authentication
//!
//! The pooler terminates the client's login itself. Backend credentials come
//! from the route, so client and backend authentication are independent.

use std::collections::HashMap;

use tracing::debug;

use crate::config::{AuthConfig, AuthMode};

/// What the client presented during login
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    Reject(String),
}

/// Pluggable client authentication
pub trait Authenticator: Send + Sync {
    /// Whether the router should ask the client for a cleartext password
    fn needs_password(&self) -> bool;

    fn authenticate(&self, user: &str, database: &str, credentials: &Credentials) -> AuthDecision;
}

/// Accepts every client
#[derive(Debug, Default)]
pub struct TrustAuthenticator;

impl Authenticator for TrustAuthenticator {
    fn needs_password(&self) -> bool {
        false
    }

    fn authenticate(&self, _user: &str, _database: &str, _credentials: &Credentials) -> AuthDecision {
        AuthDecision::Accept
    }
}

/// Checks cleartext passwords against a static user list
#[derive(Debug, Default)]
pub struct PasswordAuthenticator {
    users: HashMap<String, String>,
}

impl PasswordAuthenticator {
    pub fn new(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: users.into_iter().collect(),
        }
    }
}

impl Authenticator for PasswordAuthenticator {
    fn needs_password(&self) -> bool {
        true
    }

    fn authenticate(&self, user: &str, _database: &str, credentials: &Credentials) -> AuthDecision {
        match (self.users.get(user), credentials.password.as_deref()) {
            (Some(expected), Some(given)) if expected == given => AuthDecision::Accept,
            (None, _) => {
                debug!(user = %user, "Unknown user");
                AuthDecision::Reject(format!("password authentication failed for user \"{}\"", user))
            }
            _ => AuthDecision::Reject(format!("password authentication failed for user \"{}\"", user)),
        }
    }
}

/// Build the authenticator described by the `[auth]` section
pub fn from_config(config: &AuthConfig) -> Box<dyn Authenticator> {
    match config.mode {
        AuthMode::Trust => Box::new(TrustAuthenticator),
        AuthMode::Password => Box::new(PasswordAuthenticator::new(
            config.users.iter().map(|u| (u.name.clone(), u.password.clone())),
        )),
    }
}
