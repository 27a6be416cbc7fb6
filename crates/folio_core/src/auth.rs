//! Credential sources for the transport handshake.
//!
//! Tokens are fetched on every transport open and never cached by the
//! callers, so a refreshed session is picked up on the next reconnect.

use std::path::PathBuf;
use std::sync::RwLock;

use crate::BoxFuture;
use crate::config::Config;

/// Supplies the opaque credential sent as the first transport frame.
pub trait AuthTokenSource: Send + Sync {
    /// The current credential, or `None` when the user is signed out.
    fn token(&self) -> BoxFuture<'_, Option<String>>;
}

/// A token held in memory. Can be replaced at runtime.
#[derive(Debug, Default)]
pub struct StaticTokenSource {
    token: RwLock<Option<String>>,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    /// A source that never yields a credential.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn set(&self, token: Option<String>) {
        *self.token.write().unwrap() = token;
    }
}

impl AuthTokenSource for StaticTokenSource {
    fn token(&self) -> BoxFuture<'_, Option<String>> {
        let token = self.token.read().unwrap().clone();
        Box::pin(async move { token.filter(|t| !t.is_empty()) })
    }
}

/// Reads `session_token` from the config file on every request.
#[derive(Debug, Clone)]
pub struct ConfigTokenSource {
    path: PathBuf,
}

impl ConfigTokenSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AuthTokenSource for ConfigTokenSource {
    fn token(&self) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move {
            match Config::load_from(&self.path) {
                Ok(config) => config.session_token.filter(|t| !t.is_empty()),
                Err(e) => {
                    log::warn!("[Auth] Could not read session token: {}", e);
                    None
                }
            }
        })
    }
}
