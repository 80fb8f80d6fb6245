//! Envelopes exchanged with the command-processing layer.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::meshcore::protocol::{ContactMessage, TextType};
use crate::meshcore::NodeId;

/// Identity of a logical session, independent of any node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinkQuality {
    /// Signal-to-noise ratio in dB, when the firmware reports it.
    pub snr: Option<f32>,
    /// Hop count; `None` for flood-routed messages.
    pub hops: Option<u8>,
}

/// Which pipeline an inbound unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Ordinary chat text, including registration answers.
    Chat,
    /// A login credential. Never enters chat history or content logs.
    Credential,
}

impl PayloadKind {
    pub fn from_text_type(t: TextType) -> Self {
        match t {
            TextType::CliData => PayloadKind::Credential,
            _ => PayloadKind::Chat,
        }
    }
}

/// One received unit, bound to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub session: SessionId,
    /// Set when this unit created the session.
    pub fresh_session: bool,
    pub origin: NodeId,
    pub sender_timestamp: u32,
    pub text: String,
    pub quality: LinkQuality,
    pub kind: PayloadKind,
}

impl InboundEnvelope {
    pub fn from_message(session: SessionId, fresh_session: bool, msg: ContactMessage) -> Self {
        Self {
            session,
            fresh_session,
            origin: msg.origin,
            sender_timestamp: msg.sender_timestamp,
            quality: LinkQuality {
                snr: msg.snr,
                hops: (msg.path_len != 0xff).then_some(msg.path_len),
            },
            kind: PayloadKind::from_text_type(msg.text_type),
            text: msg.text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hint {
    /// The next inbound unit is expected to be a password.
    PasswordPrompt,
    /// Selectable options, rendered after the text.
    Options {
        choices: Vec<String>,
        default: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The command processor failed.
    Processing,
    /// The authenticator failed.
    Authentication,
    /// A dependency is down.
    Unavailable,
    /// Reported by the command processor itself.
    User,
}

/// Content for one session, owned by its outbound queue until delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub session: SessionId,
    pub text: String,
    pub hints: Vec<Hint>,
    pub is_error: bool,
    pub error_class: Option<ErrorClass>,
}

pub const PROCESSING_ERROR_TEXT: &str = "Command processing error. Please try again.";
pub const AUTH_ERROR_TEXT: &str = "Authentication error. Please try again.";
pub const UNAVAILABLE_TEXT: &str = "System temporarily unavailable. Please try later.";
pub const INACTIVITY_TEXT: &str = "You have been logged out due to inactivity.";

impl OutboundEnvelope {
    pub fn text(session: SessionId, text: impl Into<String>) -> Self {
        Self {
            session,
            text: text.into(),
            hints: Vec::new(),
            is_error: false,
            error_class: None,
        }
    }

    pub fn error(session: SessionId, text: impl Into<String>, class: ErrorClass) -> Self {
        Self {
            session,
            text: text.into(),
            hints: Vec::new(),
            is_error: true,
            error_class: Some(class),
        }
    }

    pub fn with_hint(mut self, hint: Hint) -> Self {
        self.hints.push(hint);
        self
    }

    /// Text as it goes on air.
    pub fn render(&self) -> String {
        let mut out = self.text.clone();
        for hint in &self.hints {
            if let Hint::Options { choices, default } = hint {
                if choices.is_empty() {
                    continue;
                }
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push('[');
                for (i, choice) in choices.iter().enumerate() {
                    if i > 0 {
                        out.push('/');
                    }
                    if default.as_deref() == Some(choice.as_str()) {
                        out.push('*');
                    }
                    out.push_str(choice);
                }
                out.push(']');
            }
        }
        out
    }
}
