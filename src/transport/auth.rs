//! Routing of inbound units to the processor or the authenticator.
//!
//! Credentials travel as a distinct packet type and go straight to the
//! authenticator. Their text is never logged; the `security` target only
//! records that one arrived, from whom, and how long it was.
use std::sync::Arc;

use log::{info, warn};

use crate::logutil::truncate_for_log;
use crate::transport::collab::{Authenticator, CommandProcessor};
use crate::transport::envelope::{
    ErrorClass, InboundEnvelope, OutboundEnvelope, PayloadKind, AUTH_ERROR_TEXT, PROCESSING_ERROR_TEXT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Credential,
    Chat,
    /// The cancel keyword; stops pending output for the session.
    Cancel,
}

/// Decide where an inbound unit goes. The cancel keyword is matched on
/// trimmed, case-insensitive chat text only.
pub fn classify(kind: PayloadKind, text: &str, cancel_keyword: &str) -> Route {
    match kind {
        PayloadKind::Credential => Route::Credential,
        PayloadKind::Chat if !cancel_keyword.is_empty() && text.trim().eq_ignore_ascii_case(cancel_keyword) => {
            Route::Cancel
        }
        PayloadKind::Chat => Route::Chat,
    }
}

pub struct AuthRouter<P, A> {
    processor: Arc<P>,
    authenticator: Arc<A>,
}

impl<P, A> Clone for AuthRouter<P, A> {
    fn clone(&self) -> Self {
        Self {
            processor: self.processor.clone(),
            authenticator: self.authenticator.clone(),
        }
    }
}

impl<P: CommandProcessor, A: Authenticator> AuthRouter<P, A> {
    pub fn new(processor: Arc<P>, authenticator: Arc<A>) -> Self {
        Self {
            processor,
            authenticator,
        }
    }

    /// Hand `envelope` to whichever collaborator owns its kind. Failures
    /// become a generic error reply for the same session.
    pub async fn route(&self, envelope: InboundEnvelope) -> Vec<OutboundEnvelope> {
        let session = envelope.session.clone();
        let origin = envelope.origin;
        match envelope.kind {
            PayloadKind::Credential => {
                info!(
                    target: "security",
                    "credential packet from {} ({} bytes) for session {}",
                    origin,
                    envelope.text.len(),
                    session
                );
                match self.authenticator.login(envelope).await {
                    Ok(replies) => replies,
                    Err(e) => {
                        warn!(target: "security", "authentication for {} failed: {}", origin, e);
                        vec![OutboundEnvelope::error(session, AUTH_ERROR_TEXT, ErrorClass::Authentication)]
                    }
                }
            }
            PayloadKind::Chat => {
                let preview = truncate_for_log(&envelope.text, 64);
                match self.processor.process(envelope).await {
                    Ok(replies) => replies,
                    Err(e) => {
                        warn!("command from {} ('{}') failed: {}", origin, preview, e);
                        vec![OutboundEnvelope::error(session, PROCESSING_ERROR_TEXT, ErrorClass::Processing)]
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::envelope::{LinkQuality, SessionId};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl CommandProcessor for Recorder {
        async fn process(&self, env: InboundEnvelope) -> anyhow::Result<Vec<OutboundEnvelope>> {
            self.seen.lock().unwrap().push(env.text.clone());
            if self.fail {
                anyhow::bail!("storage offline");
            }
            Ok(vec![OutboundEnvelope::text(env.session, "ok")])
        }
    }

    impl Authenticator for Recorder {
        async fn login(&self, env: InboundEnvelope) -> anyhow::Result<Vec<OutboundEnvelope>> {
            self.seen.lock().unwrap().push(format!("login:{}", env.text.len()));
            if self.fail {
                anyhow::bail!("bad hash");
            }
            Ok(vec![OutboundEnvelope::text(env.session, "welcome")])
        }
    }

    fn env(kind: PayloadKind, text: &str) -> InboundEnvelope {
        InboundEnvelope {
            session: SessionId::new("s1"),
            fresh_session: false,
            origin: "abc123def456".parse().unwrap(),
            sender_timestamp: 1,
            text: text.into(),
            quality: LinkQuality::default(),
            kind,
        }
    }

    #[test]
    fn cancel_keyword_only_matches_chat() {
        assert_eq!(classify(PayloadKind::Chat, "  STOP ", "stop"), Route::Cancel);
        assert_eq!(classify(PayloadKind::Chat, "stop it", "stop"), Route::Chat);
        assert_eq!(classify(PayloadKind::Credential, "stop", "stop"), Route::Credential);
        assert_eq!(classify(PayloadKind::Chat, "", ""), Route::Chat);
    }

    #[tokio::test]
    async fn credentials_bypass_the_processor() {
        let processor = Arc::new(Recorder::default());
        let auth = Arc::new(Recorder::default());
        let router = AuthRouter::new(processor.clone(), auth.clone());
        let out = router.route(env(PayloadKind::Credential, "s3cret")).await;
        assert_eq!(out[0].text, "welcome");
        assert!(processor.seen.lock().unwrap().is_empty());
        assert_eq!(auth.seen.lock().unwrap().as_slice(), ["login:6"]);

        router.route(env(PayloadKind::Chat, "read 1")).await;
        assert_eq!(processor.seen.lock().unwrap().as_slice(), ["read 1"]);
    }

    #[tokio::test]
    async fn failures_become_error_replies() {
        let failing = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let router = AuthRouter::new(failing.clone(), failing);
        let out = router.route(env(PayloadKind::Chat, "list")).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_error);
        assert_eq!(out[0].text, PROCESSING_ERROR_TEXT);
        assert_eq!(out[0].session, SessionId::new("s1"));

        let out = router.route(env(PayloadKind::Credential, "pw")).await;
        assert_eq!(out[0].text, AUTH_ERROR_TEXT);
        assert_eq!(out[0].error_class, Some(ErrorClass::Authentication));
    }
}
