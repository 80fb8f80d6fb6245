//! Suppress re-delivery of retransmitted inbound units.
//!
//! The radio gives no sequence numbers, so a retransmission is recognised by
//! its (origin, sender timestamp, content) tuple alone. Keys are SHA-256
//! digests of that tuple; entries live for one window and a periodic sweep
//! removes expired ones regardless of traffic.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::trace;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::meshcore::NodeId;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DedupKey([u8; 32]);

impl DedupKey {
    pub fn new(origin: &NodeId, sender_timestamp: u32, content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(origin.as_bytes());
        hasher.update(sender_timestamp.to_le_bytes());
        hasher.update(content.as_bytes());
        Self(hasher.finalize().into())
    }
}

pub struct DedupCache {
    window: Duration,
    seen: Mutex<HashMap<DedupKey, Instant>>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// True if `key` was first seen less than one window ago; the record is
    /// left untouched. Otherwise records `key` as first seen now.
    pub fn is_duplicate(&self, key: DedupKey) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        match seen.get(&key) {
            Some(first) if now.duration_since(*first) < self.window => true,
            _ => {
                seen.insert(key, now);
                false
            }
        }
    }

    /// Drop every record at least one window old. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let before = seen.len();
        seen.retain(|_, first| now.duration_since(*first) < self.window);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run [`DedupCache::sweep`] every `every` until the handle is aborted.
pub fn spawn_sweeper(cache: Arc<DedupCache>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tick.tick().await;
            let removed = cache.sweep();
            if removed > 0 {
                trace!("dedup sweep removed {} record(s), {} left", removed, cache.len());
            }
        }
    })
}
