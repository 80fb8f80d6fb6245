//! # MeshCore companion-radio link
//!
//! Everything that touches the radio lives here. The host talks to a MeshCore
//! companion device over a serial line using small length-prefixed frames;
//! this module turns that byte stream into typed [`protocol::InboundUnit`]s
//! and turns typed [`protocol::Command`]s back into frames.
//!
//! ```text
//!   serial bytes ──► framer::FrameDecoder ──► protocol::InboundUnit::decode
//!                                                     │
//!                                      link::LinkSupervisor (single task)
//!                                       │  handshake / keepalive / watchdog
//!                                       │  command FIFO / ack correlation
//!                                       ▼
//!                              LinkEvent stream ──► transport engine
//! ```
//!
//! - [`framer`] is a pure codec with marker resynchronization.
//! - [`protocol`] knows command and response codes and payload layouts.
//! - [`link`] owns the connection lifecycle and reconnects with backoff.
//! - [`contacts`] mirrors the radio's own contact table and keeps it below its limit.
//! - [`nodes`] records what adverts told us about other nodes.
//! - `serial` opens a real port (feature `serial`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod contacts;
pub mod framer;
pub mod link;
pub mod nodes;
pub mod protocol;
#[cfg(feature = "serial")]
pub mod serial;

pub use link::{Connector, LinkConfig, LinkEvent, LinkHandle, LinkIo, LinkState, LinkSupervisor};

/// Wall-clock seconds as the radio counts them.
pub fn epoch_secs() -> u32 {
    chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
}

/// Length of the public-key prefix used to address nodes in direct messages.
pub const NODE_PREFIX_LEN: usize = 6;

/// A mesh node identity: the first six bytes of its public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_PREFIX_LEN]);

impl NodeId {
    pub const fn new(bytes: [u8; NODE_PREFIX_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive the prefix from a full (or longer) public key.
    pub fn from_public_key(key: &[u8]) -> Option<Self> {
        let prefix: [u8; NODE_PREFIX_LEN] = key.get(..NODE_PREFIX_LEN)?.try_into().ok()?;
        Some(Self(prefix))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_PREFIX_LEN] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseNodeIdError(String);

impl fmt::Display for ParseNodeIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node id '{}': expected 12 hex digits", self.0)
    }
}

impl std::error::Error for ParseNodeIdError {}

impl FromStr for NodeId {
    type Err = ParseNodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != NODE_PREFIX_LEN * 2 || !s.is_ascii() {
            return Err(ParseNodeIdError(s.to_string()));
        }
        let mut out = [0u8; NODE_PREFIX_LEN];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| ParseNodeIdError(s.to_string()))?;
        }
        Ok(Self(out))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Expected-ack code returned by the device for each transmitted text.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckCode(pub [u8; 4]);

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_snippet(&self.0, 4))
    }
}

impl fmt::Debug for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AckCode({})", self)
    }
}

/// Hex dump of the first `max` bytes, for trace logging of raw frames.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    data.iter()
        .take(max.min(data.len()))
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join("")
}
