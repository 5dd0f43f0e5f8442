mod sweeper;

pub use self::sweeper::SessionSweeper;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::metrics::{
    record_session_created, record_session_destroyed, record_sessions_swept, set_active_sessions,
};

/// Returned to the caller on login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

/// Bearer tokens with a fixed expiry. Expired entries stay in the map until
/// the next sweep but never check as valid.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Instant>>,
    lifetime: Duration,
}

impl SessionStore {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            lifetime,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn create(&self) -> Result<SessionGrant> {
        self.insert_token(Uuid::new_v4().to_string())
    }

    /// Fails with [`Error::SessionCollision`] if `token` is already stored,
    /// expired or not.
    pub(crate) fn insert_token(&self, token: String) -> Result<SessionGrant> {
        let out_of_range =
            || Error::Internal(format!("Session lifetime {:?} out of range", self.lifetime));
        let expires = Instant::now().checked_add(self.lifetime).ok_or_else(out_of_range)?;
        let expires_at = chrono::Duration::from_std(self.lifetime)
            .ok()
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(out_of_range)?;

        let count = {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&token) {
                return Err(Error::SessionCollision);
            }
            sessions.insert(token.clone(), expires);
            sessions.len()
        };

        record_session_created();
        set_active_sessions(count);
        debug!(sessions = count, "Session created");

        Ok(SessionGrant {
            token,
            expires_at,
            expires_in: self.lifetime.as_secs(),
        })
    }

    pub fn check(&self, token: &str) -> bool {
        self.sessions
            .read()
            .get(token)
            .is_some_and(|expires| *expires > Instant::now())
    }

    /// Removes a valid session. Returns false when there was nothing to remove.
    pub fn logout(&self, token: &str) -> bool {
        let count = {
            let mut sessions = self.sessions.write();
            match sessions.get(token) {
                Some(expires) if *expires > Instant::now() => {
                    sessions.remove(token);
                    sessions.len()
                }
                _ => return false,
            }
        };

        record_session_destroyed();
        set_active_sessions(count);
        true
    }

    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let (removed, remaining) = {
            let mut sessions = self.sessions.write();
            let before = sessions.len();
            sessions.retain(|_, expires| *expires > now);
            (before - sessions.len(), sessions.len())
        };

        if removed > 0 {
            record_sessions_swept(removed);
        }
        set_active_sessions(remaining);
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
