//! Per-unit delivery state and the retry schedule.
//!
//! ```text
//! Queued ──transmit──► Sent ──ack──► Acknowledged
//!                       │  ▲
//!              deadline │  │ transmit
//!                       ▼  │
//!                     Retrying ──retries exhausted──► Abandoned
//! ```
//!
//! After `flood_after` unacknowledged direct attempts the route to the
//! destination is reset so later attempts flood; flooded attempts have their
//! own ceiling.
use std::time::Duration;

use tokio::time::Instant;

use crate::config::DeliveryConfig;
use crate::meshcore::AckCode;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub ack_timeout: Duration,
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    /// 0 never resets the route.
    pub flood_after: u32,
    /// 0 leaves only `max_retries`.
    pub max_flood_attempts: u32,
}

impl RetryPolicy {
    /// How long to wait for an acknowledgment after the transmission that
    /// follows `retries` earlier timeouts.
    pub fn wait_for(&self, retries: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(retries.min(32) as i32);
        let secs = self.ack_timeout.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff.max(self.ack_timeout);
        }
        Duration::from_secs_f64(secs)
    }
}

impl From<&DeliveryConfig> for RetryPolicy {
    fn from(cfg: &DeliveryConfig) -> Self {
        Self {
            ack_timeout: cfg.ack_timeout(),
            max_retries: cfg.max_retries,
            backoff_factor: cfg.backoff_factor,
            max_backoff: std::time::Duration::from_millis(cfg.max_backoff_ms),
            flood_after: cfg.flood_after,
            max_flood_attempts: cfg.max_flood_attempts,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Queued,
    Sent,
    Acknowledged,
    Retrying,
    Abandoned,
}

/// One chunk awaiting confirmed delivery.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    /// 1-based position within its envelope.
    pub sequence: usize,
    pub total: usize,
    pub content: String,
    pub state: DeliveryState,
    /// Timeouts so far. Never exceeds the policy's `max_retries`.
    pub retries: u32,
    pub first_sent_at: Option<Instant>,
    pub last_sent_at: Option<Instant>,
    pub deadline: Option<Instant>,
    /// Ack codes handed out by the device, one per transmission.
    pub ack_codes: Vec<AckCode>,
    /// Fixed at the first transmission; receivers dedup on it.
    pub sender_timestamp: Option<u32>,
    pub path_reset_tried: bool,
    /// Transmissions that went out without a learned route.
    pub flood_attempts: u32,
    flooding: bool,
}

impl PendingDelivery {
    pub fn new(sequence: usize, total: usize, content: String) -> Self {
        Self {
            sequence,
            total,
            content,
            state: DeliveryState::Queued,
            retries: 0,
            first_sent_at: None,
            last_sent_at: None,
            deadline: None,
            ack_codes: Vec::new(),
            sender_timestamp: None,
            path_reset_tried: false,
            flood_attempts: 0,
            flooding: false,
        }
    }

    /// Timestamp for the next transmission; `now` is only used the first time.
    pub fn timestamp(&mut self, now: u32) -> u32 {
        *self.sender_timestamp.get_or_insert(now)
    }

    /// Direct attempts are used up and the route has not been reset yet.
    pub fn needs_path_reset(&self, policy: &RetryPolicy) -> bool {
        policy.flood_after > 0 && !self.path_reset_tried && self.retries >= policy.flood_after
    }

    /// Record a route reset. Only a successful one makes later attempts flood.
    pub fn path_reset(&mut self, succeeded: bool) {
        self.path_reset_tried = true;
        self.flooding |= succeeded;
    }

    /// Attempt number as the device expects it in the send command.
    pub fn attempt(&self) -> u8 {
        self.retries.min(u8::MAX as u32) as u8
    }

    /// Total transmissions made so far.
    pub fn transmissions(&self) -> u32 {
        self.ack_codes.len() as u32
    }

    /// Record a transmission at `now`. `ack` is `None` when the device
    /// refused the send; the deadline still runs so the failure counts as
    /// an attempt. `flood` is the device's report that no route was used.
    pub fn mark_sent(&mut self, now: Instant, policy: &RetryPolicy, ack: Option<AckCode>, flood: bool) {
        self.state = DeliveryState::Sent;
        if flood || self.flooding {
            self.flood_attempts += 1;
        }
        self.first_sent_at.get_or_insert(now);
        self.last_sent_at = Some(now);
        self.deadline = Some(now + policy.wait_for(self.retries));
        if let Some(ack) = ack {
            self.ack_codes.push(ack);
        }
    }

    /// Apply a confirmation. Returns true when it belongs to this unit.
    pub fn acknowledge(&mut self, ack: AckCode) -> bool {
        if self.state == DeliveryState::Sent && self.ack_codes.contains(&ack) {
            self.state = DeliveryState::Acknowledged;
            self.deadline = None;
            return true;
        }
        false
    }

    /// The deadline passed without an acknowledgment.
    pub fn on_deadline(&mut self, policy: &RetryPolicy) -> DeliveryState {
        self.deadline = None;
        let floods_spent = policy.max_flood_attempts > 0 && self.flood_attempts >= policy.max_flood_attempts;
        if self.retries >= policy.max_retries || floods_spent {
            self.state = DeliveryState::Abandoned;
        } else {
            self.retries += 1;
            self.state = DeliveryState::Retrying;
        }
        self.state
    }

    /// Time from first transmission until `now`.
    pub fn latency(&self, now: Instant) -> Option<Duration> {
        self.first_sent_at.map(|t| now.duration_since(t))
    }
}
