//! Token types
//!
//! [`TokenSet`] is the only state the client persists across restarts. Its
//! `Debug` output redacts token material so it can be logged safely.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Access and refresh tokens with expiry
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Bearer token attached to API requests
    pub access_token: String,

    /// Refresh token for obtaining new access tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Absolute expiration timestamp (UTC). `None` means the server gave no
    /// lifetime and the token is treated as valid until rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenSet {
    /// Create a token set whose expiry is `expires_in` seconds from now.
    ///
    /// Non-positive or missing lifetimes leave `expires_at` unset.
    #[must_use]
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in: Option<i64>,
    ) -> Self {
        let expires_at =
            expires_in.filter(|secs| *secs > 0).map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        Self { access_token: access_token.into(), refresh_token, expires_at }
    }

    /// Create a token set with an explicit expiry timestamp.
    #[must_use]
    pub fn with_expiry(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self { access_token: access_token.into(), refresh_token, expires_at }
    }

    /// Whether the access token is expired or expires within `margin`.
    #[must_use]
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        self.needs_refresh_at(Utc::now(), margin)
    }

    /// [`needs_refresh`](Self::needs_refresh) against an explicit `now`.
    #[must_use]
    pub fn needs_refresh_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let Ok(margin) = chrono::Duration::from_std(margin) else {
                    return true;
                };
                now.checked_add_signed(margin).map_or(true, |deadline| deadline >= expires_at)
            }
            None => false,
        }
    }

    /// Get seconds until token expiration
    #[must_use]
    pub fn seconds_until_expiry(&self) -> Option<i64> {
        self.expires_at.map(|expires_at| (expires_at - Utc::now()).num_seconds())
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
