//! Session identity and lifecycle
//!
//! A session groups events across screens: `start_session` is called on
//! every screen entry and `stop_session` on every exit, and the id only
//! rolls over once the configured timeout has elapsed between a stop and
//! the next start. Rapid navigation therefore keeps one session id.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

/// Result of a `start_session` call
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
    /// True when a fresh id was generated, signalling the one-time
    /// device/user info events
    pub is_new: bool,
}

/// Tracks the current session id and its expiry schedule
pub struct SessionManager {
    user_id: String,
    timeout: Duration,
    session_id: Option<String>,
    end_time: Option<DateTime<Utc>>,
    started: bool,
}

impl SessionManager {
    pub fn new(user_id: String, timeout_ms: u64) -> Self {
        Self {
            user_id,
            timeout: Duration::milliseconds(timeout_ms as i64),
            session_id: None,
            end_time: None,
            started: false,
        }
    }

    /// Mark the session started, generating a new id when none exists or
    /// the previous one expired.
    pub fn start_session(&mut self) -> SessionHandle {
        self.start_session_at(Utc::now())
    }

    pub(crate) fn start_session_at(&mut self, now: DateTime<Utc>) -> SessionHandle {
        self.started = true;

        let expired = matches!(self.end_time, Some(end) if now > end);
        match (&self.session_id, expired) {
            (Some(id), false) => SessionHandle {
                id: id.clone(),
                is_new: false,
            },
            _ => {
                let id = derive_session_id(&self.user_id, now);
                tracing::info!(session_id = %id, "starting new session");
                self.session_id = Some(id.clone());
                SessionHandle { id, is_new: true }
            }
        }
    }

    /// Schedule session expiry `timeout` from now
    pub fn stop_session(&mut self) {
        self.stop_session_at(Utc::now());
    }

    pub(crate) fn stop_session_at(&mut self, now: DateTime<Utc>) {
        self.end_time = Some(now + self.timeout);
        self.started = false;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Update the user id future session ids are derived from
    pub fn set_user_id(&mut self, user_id: String) {
        self.user_id = user_id;
    }
}

/// Session id: truncated hex digest of user id + wall-clock time
fn derive_session_id(user_id: &str, now: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(now.timestamp_millis().to_string().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}
