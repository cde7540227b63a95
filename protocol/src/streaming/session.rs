//! # Stream Sessions
//!
//! Per client key (`ip:link_id`) there is at most one live session. A
//! session owns exactly one stream slot on its link from the moment it is
//! opened until it ends, and it ends exactly once: by expiry (noticed
//! lazily on the next lookup or by [`SessionTable::sweep`]) or by
//! [`SessionTable::close`] when its delivery finishes. A session carries
//! at most one delivery at a time: [`SessionTable::claim`] marks it as
//! delivering, so a token shared between viewers cannot fan one slot out
//! into several live streams.
//!
//! Both indexes live under one mutex so a session can never be visible in
//! one and missing from the other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::catalog::{LinkRegistry, SlotError};

/// Identifies a viewer of one link.
pub fn client_key(client_ip: &str, link_id: &str) -> String {
    format!("{}:{}", client_ip, link_id)
}

/// How the session was earned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "campaign")]
pub enum SessionGrant {
    Owner,
    Premium,
    Ad(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamSession {
    pub token: String,
    pub link_id: String,
    pub client_key: String,
    /// Unix seconds.
    pub expires_at: i64,
    pub grant: SessionGrant,
}

impl StreamSession {
    pub fn is_live(&self, now: i64) -> bool {
        now < self.expires_at
    }
}

/// Why a token could not start a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimError {
    /// Unknown, expired or issued for another link.
    Invalid,
    /// The session is already delivering.
    InUse,
}

#[derive(Default)]
struct Sessions {
    by_token: HashMap<String, StreamSession>,
    by_client: HashMap<String, String>,
    delivering: HashSet<String>,
}

impl Sessions {
    fn remove(&mut self, token: &str) -> Option<StreamSession> {
        let session = self.by_token.remove(token)?;
        self.delivering.remove(token);
        if self.by_client.get(&session.client_key).map(String::as_str) == Some(token) {
            self.by_client.remove(&session.client_key);
        }
        Some(session)
    }
}

pub struct SessionTable {
    links: Arc<LinkRegistry>,
    duration: Duration,
    inner: Mutex<Sessions>,
}

impl SessionTable {
    pub fn new(links: Arc<LinkRegistry>, duration: Duration) -> Self {
        Self {
            links,
            duration,
            inner: Mutex::new(Sessions::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opens a session for `client_key` on `link_id`, taking one stream
    /// slot. An existing live session for the same client is returned as
    /// is and takes no extra slot.
    pub fn open(
        &self,
        link_id: &str,
        client_key: &str,
        grant: SessionGrant,
        now: i64,
    ) -> Result<StreamSession, SlotError> {
        let mut inner = self.inner.lock();

        if let Some(token) = inner.by_client.get(client_key).cloned() {
            let existing = inner
                .by_token
                .get(&token)
                .filter(|s| s.is_live(now) && s.link_id == link_id)
                .cloned();
            if let Some(existing) = existing {
                return Ok(existing);
            }
            if let Some(ended) = inner.remove(&token) {
                self.release(&ended, "expired");
            }
        }

        self.links.try_acquire_stream(link_id)?;
        let session = StreamSession {
            token: uuid::Uuid::new_v4().simple().to_string(),
            link_id: link_id.to_string(),
            client_key: client_key.to_string(),
            expires_at: now.saturating_add(i64::try_from(self.duration.as_secs()).unwrap_or(i64::MAX)),
            grant,
        };
        inner
            .by_client
            .insert(session.client_key.clone(), session.token.clone());
        inner.by_token.insert(session.token.clone(), session.clone());
        debug!(link = %link_id, client = %client_key, expires_at = session.expires_at, "session opened");
        Ok(session)
    }

    /// The live session for a client, ending it if it has expired.
    pub fn live_for_client(&self, client_key: &str, now: i64) -> Option<StreamSession> {
        let mut inner = self.inner.lock();
        let token = inner.by_client.get(client_key)?.clone();
        self.check(&mut inner, &token, now)
    }

    /// The live session behind `token` for `link_id`, ending it if it has
    /// expired.
    pub fn validate(&self, token: &str, link_id: &str, now: i64) -> Option<StreamSession> {
        let mut inner = self.inner.lock();
        self.check(&mut inner, token, now)
            .filter(|s| s.link_id == link_id)
    }

    /// Validates `token` for `link_id` and marks its session as
    /// delivering. The mark is cleared when the session ends.
    pub fn claim(&self, token: &str, link_id: &str, now: i64) -> Result<StreamSession, ClaimError> {
        let mut inner = self.inner.lock();
        let session = self
            .check(&mut inner, token, now)
            .filter(|s| s.link_id == link_id)
            .ok_or(ClaimError::Invalid)?;
        if !inner.delivering.insert(session.token.clone()) {
            return Err(ClaimError::InUse);
        }
        Ok(session)
    }

    fn check(&self, inner: &mut Sessions, token: &str, now: i64) -> Option<StreamSession> {
        let session = inner.by_token.get(token)?;
        if session.is_live(now) {
            return Some(session.clone());
        }
        if let Some(ended) = inner.remove(token) {
            self.release(&ended, "expired");
        }
        None
    }

    /// Ends a session now. Returns `false` if it had already ended.
    pub fn close(&self, token: &str) -> bool {
        let ended = self.inner.lock().remove(token);
        match ended {
            Some(session) => {
                self.release(&session, "closed");
                true
            }
            None => false,
        }
    }

    /// Ends every expired session. Returns how many ended.
    pub fn sweep(&self, now: i64) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .by_token
            .values()
            .filter(|s| !s.is_live(now))
            .map(|s| s.token.clone())
            .collect();
        for token in &expired {
            if let Some(ended) = inner.remove(token) {
                self.release(&ended, "expired");
            }
        }
        expired.len()
    }

    fn release(&self, session: &StreamSession, why: &str) {
        let remaining = self.links.release_stream(&session.link_id);
        debug!(link = %session.link_id, client = %session.client_key, remaining, why, "session ended");
    }
}

/// Ends its session when dropped, which covers a client that disconnects
/// mid-delivery.
pub struct StreamGuard {
    sessions: Arc<SessionTable>,
    token: String,
}

impl StreamGuard {
    pub fn new(sessions: Arc<SessionTable>, token: impl Into<String>) -> Self {
        Self {
            sessions,
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for StreamGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamGuard").field("token", &self.token).finish_non_exhaustive()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.sessions.close(&self.token);
    }
}
