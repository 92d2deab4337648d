//! Explicit per-login session context.
//!
//! Every engine entry point takes a [`Session`] instead of reading a global
//! "current user". Its lifetime is tied to login/logout.

use crate::defaults::LIBRARY_KEY_PREFIX;
use crate::error::{Error, Result};

/// Authenticated user context.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    user_id: String,
    auth_token: String,
}

impl Session {
    /// Create a session. The user id must be non-empty and free of `:`,
    /// which is the key namespace separator.
    pub fn new(user_id: impl Into<String>, auth_token: impl Into<String>) -> Result<Self> {
        let user_id = user_id.into();
        if user_id.is_empty() || user_id.contains(':') {
            return Err(Error::InvalidInput(format!(
                "user id must be non-empty and must not contain ':' (got {:?})",
                user_id
            )));
        }
        Ok(Self {
            user_id,
            auth_token: auth_token.into(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    /// Key of this user's library record in the durable local store.
    pub fn library_key(&self) -> String {
        format!("{}:{}", LIBRARY_KEY_PREFIX, self.user_id)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("auth_token", &"<redacted>")
            .finish()
    }
}
