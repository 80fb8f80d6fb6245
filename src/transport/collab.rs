//! Seams to the layers above the transport.
//!
//! The engine never interprets what users type. Chat goes to a
//! [`CommandProcessor`], credentials go to an [`Authenticator`], and session
//! lifetimes belong to a [`SessionManager`]. The loopback implementations here
//! are enough to exercise a radio end to end without a BBS behind it.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use tokio::time::Instant;

use crate::transport::envelope::{InboundEnvelope, OutboundEnvelope, SessionId, INACTIVITY_TEXT};

pub trait CommandProcessor: Send + Sync + 'static {
    /// Handle one chat unit and return zero or more replies.
    fn process(
        &self,
        envelope: InboundEnvelope,
    ) -> impl Future<Output = anyhow::Result<Vec<OutboundEnvelope>>> + Send;
}

pub trait Authenticator: Send + Sync + 'static {
    /// Handle one credential unit. Implementations must not log its text.
    fn login(
        &self,
        envelope: InboundEnvelope,
    ) -> impl Future<Output = anyhow::Result<Vec<OutboundEnvelope>>> + Send;
}

/// Session lifetimes. Calls are synchronous and must not block for long;
/// the engine invokes them while holding a per-node lock.
pub trait SessionManager: Send + Sync + 'static {
    fn create_session(&self, identity_hint: &str) -> anyhow::Result<SessionId>;
    fn touch(&self, session: &SessionId);
    fn expire(&self, session: &SessionId);
    fn is_active(&self, session: &SessionId) -> bool;

    /// Parting text for a session found inactive, sent before teardown.
    fn farewell(&self, _session: &SessionId) -> Option<String> {
        None
    }
}

struct SessionRecord {
    identity_hint: String,
    created_at: DateTime<Utc>,
    last_activity: Instant,
}

/// Sessions held in memory with a fixed inactivity timeout.
pub struct MemorySessionManager {
    timeout: Duration,
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl MemorySessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_count(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .values()
            .filter(|r| r.last_activity.elapsed() < self.timeout)
            .count()
    }

    pub fn created_at(&self, session: &SessionId) -> Option<DateTime<Utc>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(session).map(|r| r.created_at)
    }
}

impl SessionManager for MemorySessionManager {
    fn create_session(&self, identity_hint: &str) -> anyhow::Result<SessionId> {
        let id = SessionId::new(uuid::Uuid::new_v4().to_string());
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(
            id.clone(),
            SessionRecord {
                identity_hint: identity_hint.to_string(),
                created_at: Utc::now(),
                last_activity: Instant::now(),
            },
        );
        debug!("created session {} for {}", id, identity_hint);
        Ok(id)
    }

    fn touch(&self, session: &SessionId) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = sessions.get_mut(session) {
            record.last_activity = Instant::now();
        }
    }

    fn expire(&self, session: &SessionId) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = sessions.remove(session) {
            debug!("expired session {} for {}", session, record.identity_hint);
        }
    }

    fn is_active(&self, session: &SessionId) -> bool {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session)
            .map(|r| r.last_activity.elapsed() < self.timeout)
            .unwrap_or(false)
    }

    fn farewell(&self, session: &SessionId) -> Option<String> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session)
            .filter(|r| r.last_activity.elapsed() >= self.timeout)
            .map(|_| INACTIVITY_TEXT.to_string())
    }
}

/// Echoes chat back with the link quality it arrived on.
#[derive(Debug, Default, Clone)]
pub struct LoopbackProcessor;

impl CommandProcessor for LoopbackProcessor {
    async fn process(&self, envelope: InboundEnvelope) -> anyhow::Result<Vec<OutboundEnvelope>> {
        let mut replies = Vec::new();
        if envelope.fresh_session {
            replies.push(OutboundEnvelope::text(
                envelope.session.clone(),
                format!("Connected as {}.", envelope.origin),
            ));
        }
        let hops = match envelope.quality.hops {
            Some(h) => format!("{} hop(s)", h),
            None => "flood".to_string(),
        };
        let snr = envelope
            .quality
            .snr
            .map(|s| format!(", snr {:.1}", s))
            .unwrap_or_default();
        replies.push(OutboundEnvelope::text(
            envelope.session,
            format!("[{}{}] {}", hops, snr, envelope.text),
        ));
        Ok(replies)
    }
}

/// Accepts any credential; reports only its length.
#[derive(Debug, Default, Clone)]
pub struct LoopbackAuthenticator;

impl Authenticator for LoopbackAuthenticator {
    async fn login(&self, envelope: InboundEnvelope) -> anyhow::Result<Vec<OutboundEnvelope>> {
        Ok(vec![OutboundEnvelope::text(
            envelope.session,
            format!("Credential received ({} bytes).", envelope.text.len()),
        )])
    }
}
