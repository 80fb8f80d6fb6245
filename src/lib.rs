//! # Meshcitadel - mesh transport for a BBS on MeshCore radios
//!
//! Meshcitadel carries a bulletin-board conversation over a MeshCore LoRa mesh.
//! A companion radio hangs off a USB serial port; the crate speaks its framed
//! protocol, turns direct messages into session-bound envelopes for a command
//! processor, and delivers the replies back one acknowledged chunk at a time.
//!
//! ## Features
//!
//! - **Companion link**: framing, handshake, message sync, keepalive and a
//!   watchdog that restarts a wedged device with jittered backoff.
//! - **Reliable delivery**: word-boundary chunking, one chunk in flight per
//!   session, ack tracking with exponential retry and abandonment.
//! - **Duplicate suppression**: retransmitted units are dropped within a
//!   configurable window.
//! - **Sessions**: nodes bind to sessions; a session may span several nodes
//!   and replies follow the most recently active one.
//! - **Credential routing**: login packets bypass chat and never reach logs.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshcitadel::config::Config;
//! use meshcitadel::meshcore::{LinkConfig, LinkSupervisor};
//! use meshcitadel::meshcore::serial::SerialConnector;
//! use meshcitadel::transport::{
//!     EngineConfig, LoopbackAuthenticator, LoopbackProcessor, MemorySessionManager, TransportEngine,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let connector = SerialConnector::new(&config.meshcore.port, config.meshcore.baud_rate);
//!     let (link, handle, events) = LinkSupervisor::new(connector, LinkConfig::from(&config.meshcore));
//!     tokio::spawn(link.run());
//!
//!     let sessions = Arc::new(MemorySessionManager::new(config.session.timeout()));
//!     let engine = TransportEngine::new(
//!         EngineConfig::from(&config),
//!         handle,
//!         Arc::new(LoopbackProcessor),
//!         sessions,
//!         Arc::new(LoopbackAuthenticator),
//!     );
//!     engine.run(events).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`meshcore`] - frame codec, companion protocol, link supervisor, node directory
//! - [`transport`] - dedup, chunking, reliability, outboxes, bindings, routing
//! - [`config`] - configuration loading and validation
//! - [`metrics`] - delivery and link counters
//! - [`error`] - error types per layer
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │ Command processor / │ ← collaborators (not in this crate)
//! │ authenticator       │
//! └─────────────────────┘
//!           │ envelopes
//! ┌─────────────────────┐
//! │ Transport engine    │ ← dedup, bindings, outboxes, retries
//! └─────────────────────┘
//!           │ commands / events
//! ┌─────────────────────┐
//! │ Link supervisor     │ ← framing, handshake, watchdog
//! └─────────────────────┘
//!           │ bytes
//! ┌─────────────────────┐
//! │ Companion radio     │
//! └─────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod logutil;
pub mod meshcore;
pub mod metrics;
pub mod transport;
