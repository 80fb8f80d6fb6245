//! Per-session outbound queue.
//!
//! Each session gets one drain task. It splits envelopes into chunks and
//! keeps at most one chunk in flight: the next chunk is not transmitted until
//! the current one is acknowledged or abandoned. Commands (new envelopes,
//! cancel, close) are accepted while a chunk waits for its acknowledgment, so
//! a cancel empties the queue at once and takes effect at the next chunk
//! boundary.
//!
//! The destination is looked up at every transmission, so a session that
//! moves to another node keeps its queue. Every transmission of a chunk
//! carries the timestamp of its first one, and once the direct attempts are
//! used up the route is reset so the rest flood.
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};

use crate::config::DeliveryConfig;
use crate::error::TransportError;
use crate::meshcore::link::Confirmation;
use crate::meshcore::protocol::SentReceipt;
use crate::meshcore::{epoch_secs, LinkHandle, NodeId};
use crate::metrics;
use crate::transport::binding::BindingRegistry;
use crate::transport::chunker::{chunk_text, chunk_with_markers};
use crate::transport::envelope::{OutboundEnvelope, SessionId};
use crate::transport::reliability::{DeliveryState, PendingDelivery, RetryPolicy};

/// Where chunks go. The link handle is the production sink.
pub trait ChunkSink: Clone + Send + Sync + 'static {
    /// Hand one chunk to the radio. Confirmations for the returned ack code
    /// arrive on `confirm`.
    fn transmit(
        &self,
        destination: NodeId,
        text: String,
        attempt: u8,
        timestamp: u32,
        confirm: mpsc::UnboundedSender<Confirmation>,
    ) -> impl Future<Output = Result<SentReceipt, TransportError>> + Send;

    /// Drop the learned route to `destination` so later sends flood.
    fn reset_path(&self, destination: NodeId) -> impl Future<Output = Result<(), TransportError>> + Send;
}

impl ChunkSink for LinkHandle {
    async fn transmit(
        &self,
        destination: NodeId,
        text: String,
        attempt: u8,
        timestamp: u32,
        confirm: mpsc::UnboundedSender<Confirmation>,
    ) -> Result<SentReceipt, TransportError> {
        self.send_text(destination, text, attempt, timestamp, confirm).await
    }

    async fn reset_path(&self, destination: NodeId) -> Result<(), TransportError> {
        LinkHandle::reset_path(self, destination).await
    }
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub max_payload: usize,
    pub chunk_markers: bool,
    pub inter_packet_delay: Duration,
    pub policy: RetryPolicy,
}

impl From<&DeliveryConfig> for OutboxConfig {
    fn from(cfg: &DeliveryConfig) -> Self {
        Self {
            max_payload: cfg.max_payload,
            chunk_markers: cfg.chunk_markers,
            inter_packet_delay: cfg.inter_packet_delay(),
            policy: RetryPolicy::from(cfg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxEvent {
    /// A chunk ran out of retries. The queue has been emptied and the drain
    /// has stopped.
    Abandoned {
        session: SessionId,
        node: NodeId,
        attempts: u32,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub queued_envelopes: usize,
    pub queued_chunks: usize,
    /// (sequence, total) of the chunk awaiting acknowledgment.
    pub in_flight: Option<(usize, usize)>,
    pub delivered: u64,
    pub cancelled: u64,
}

enum OutboxCommand {
    Enqueue(OutboundEnvelope),
    Cancel,
    Stats(oneshot::Sender<OutboxStats>),
    Close {
        farewell: Option<OutboundEnvelope>,
        fallback: Option<NodeId>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct OutboxHandle {
    tx: mpsc::UnboundedSender<OutboxCommand>,
}

impl std::fmt::Debug for OutboxCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutboxCommand::Enqueue(_) => f.write_str("Enqueue"),
            OutboxCommand::Cancel => f.write_str("Cancel"),
            OutboxCommand::Stats(_) => f.write_str("Stats"),
            OutboxCommand::Close { .. } => f.write_str("Close"),
            OutboxCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl OutboxHandle {
    /// False when the drain has stopped.
    pub fn enqueue(&self, envelope: OutboundEnvelope) -> bool {
        self.tx.send(OutboxCommand::Enqueue(envelope)).is_ok()
    }

    /// Drop everything not yet transmitted.
    pub fn cancel(&self) -> bool {
        self.tx.send(OutboxCommand::Cancel).is_ok()
    }

    /// Queue `farewell`, finish what is queued, then stop. `fallback` is
    /// the destination once the session has no bound node left.
    pub fn close(&self, farewell: Option<OutboundEnvelope>, fallback: Option<NodeId>) {
        let _ = self.tx.send(OutboxCommand::Close { farewell, fallback });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(OutboxCommand::Shutdown);
    }

    pub async fn stats(&self) -> Option<OutboxStats> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(OutboxCommand::Stats(tx)).ok()?;
        rx.await.ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn spawn_outbox<S: ChunkSink>(
    session: SessionId,
    sink: S,
    registry: Arc<BindingRegistry>,
    cfg: OutboxConfig,
    events: mpsc::UnboundedSender<OutboxEvent>,
) -> OutboxHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let drain = Drain {
        session,
        sink,
        registry,
        cfg,
        rx,
        events,
        envelopes: VecDeque::new(),
        chunks: VecDeque::new(),
        closing: false,
        fallback: None,
        stats: OutboxStats::default(),
    };
    tokio::spawn(drain.run());
    OutboxHandle { tx }
}

enum Step {
    Continue,
    Stop,
}

enum Delivery {
    Acked,
    Abandoned { node: NodeId, attempts: u32 },
    NoRoute,
    Stopped,
}

struct Drain<S> {
    session: SessionId,
    sink: S,
    registry: Arc<BindingRegistry>,
    cfg: OutboxConfig,
    rx: mpsc::UnboundedReceiver<OutboxCommand>,
    events: mpsc::UnboundedSender<OutboxEvent>,
    envelopes: VecDeque<OutboundEnvelope>,
    chunks: VecDeque<PendingDelivery>,
    closing: bool,
    fallback: Option<NodeId>,
    stats: OutboxStats,
}

impl<S: ChunkSink> Drain<S> {
    async fn run(mut self) {
        loop {
            if self.chunks.is_empty() {
                if let Some(envelope) = self.envelopes.pop_front() {
                    self.load(envelope);
                    continue;
                }
                if self.closing {
                    break;
                }
                match self.rx.recv().await {
                    Some(cmd) => {
                        if let Step::Stop = self.handle(cmd) {
                            break;
                        }
                    }
                    None => break,
                }
                continue;
            }

            let Some(unit) = self.chunks.pop_front() else {
                continue;
            };
            match self.deliver(unit).await {
                Delivery::Acked => {
                    if self.pace().await {
                        break;
                    }
                }
                Delivery::Abandoned { node, attempts } => {
                    let dropped = self.discard();
                    warn!(
                        "{}; session {} loses {} queued item(s)",
                        TransportError::DeliveryAbandoned { node, attempts },
                        self.session,
                        dropped
                    );
                    let _ = self.events.send(OutboxEvent::Abandoned {
                        session: self.session.clone(),
                        node,
                        attempts,
                    });
                    break;
                }
                Delivery::NoRoute => {
                    let dropped = self.discard();
                    warn!("session {} has no bound node; dropped {} queued item(s)", self.session, dropped + 1);
                }
                Delivery::Stopped => break,
            }
        }
        debug!("outbox for session {} stopped", self.session);
    }

    fn handle(&mut self, cmd: OutboxCommand) -> Step {
        match cmd {
            OutboxCommand::Enqueue(envelope) => self.envelopes.push_back(envelope),
            OutboxCommand::Cancel => {
                let dropped = self.discard();
                self.stats.cancelled += dropped;
                info!("session {} cancelled output ({} queued item(s) dropped)", self.session, dropped);
            }
            OutboxCommand::Stats(reply) => {
                let _ = reply.send(self.snapshot());
            }
            OutboxCommand::Close { farewell, fallback } => {
                self.closing = true;
                self.fallback = fallback;
                self.envelopes.extend(farewell);
            }
            OutboxCommand::Shutdown => return Step::Stop,
        }
        Step::Continue
    }

    fn snapshot(&self) -> OutboxStats {
        OutboxStats {
            queued_envelopes: self.envelopes.len(),
            queued_chunks: self.chunks.len(),
            ..self.stats.clone()
        }
    }

    fn discard(&mut self) -> u64 {
        let dropped = self.chunks.len() + self.envelopes.len();
        self.chunks.clear();
        self.envelopes.clear();
        dropped as u64
    }

    fn load(&mut self, envelope: OutboundEnvelope) {
        let text = envelope.render();
        let pieces = if self.cfg.chunk_markers {
            chunk_with_markers(&text, self.cfg.max_payload)
        } else {
            chunk_text(&text, self.cfg.max_payload)
        };
        let total = pieces.len();
        for (i, piece) in pieces.into_iter().enumerate() {
            self.chunks.push_back(PendingDelivery::new(i + 1, total, piece));
        }
        if total > 1 {
            debug!("session {}: reply split into {} chunks", self.session, total);
        }
    }

    fn destination(&self) -> Option<NodeId> {
        match self.registry.primary_node(&self.session) {
            Some(node) => Some(node),
            None if self.closing => self.fallback,
            None => None,
        }
    }

    /// Sleep between chunks, still taking commands. True means stop.
    async fn pace(&mut self) -> bool {
        if self.cfg.inter_packet_delay.is_zero() {
            return false;
        }
        let until = sleep(self.cfg.inter_packet_delay);
        tokio::pin!(until);
        loop {
            tokio::select! {
                _ = &mut until => return false,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Step::Stop = self.handle(cmd) {
                            return true;
                        }
                    }
                    None => return true,
                },
            }
        }
    }

    async fn deliver(&mut self, mut unit: PendingDelivery) -> Delivery {
        let policy = self.cfg.policy.clone();
        // One channel for every attempt, so a late ack for an earlier
        // transmission still lands here.
        let (confirm_tx, mut confirm_rx) = mpsc::unbounded_channel::<Confirmation>();
        self.stats.in_flight = Some((unit.sequence, unit.total));

        let outcome = loop {
            let Some(node) = self.destination() else {
                break Delivery::NoRoute;
            };
            if unit.needs_path_reset(&policy) {
                match self.sink.reset_path(node).await {
                    Ok(()) => {
                        debug!("chunk {}/{}: route to {} reset, flooding", unit.sequence, unit.total, node);
                        unit.path_reset(true);
                    }
                    Err(e) => {
                        debug!("chunk {}/{}: route to {} kept: {}", unit.sequence, unit.total, node, e);
                        unit.path_reset(false);
                    }
                }
            }
            let timestamp = unit.timestamp(epoch_secs());
            let now = Instant::now();
            match self
                .sink
                .transmit(node, unit.content.clone(), unit.attempt(), timestamp, confirm_tx.clone())
                .await
            {
                Ok(receipt) => {
                    if unit.retries == 0 {
                        metrics::inc_reliable_sent();
                    } else {
                        metrics::inc_reliable_retries();
                    }
                    debug!(
                        "chunk {}/{} to {} sent (attempt {}, ack {})",
                        unit.sequence,
                        unit.total,
                        node,
                        unit.retries + 1,
                        receipt.ack
                    );
                    unit.mark_sent(now, &policy, Some(receipt.ack), receipt.flood);
                }
                Err(e) => {
                    warn!(
                        "chunk {}/{} to {} not accepted (attempt {}): {}",
                        unit.sequence,
                        unit.total,
                        node,
                        unit.retries + 1,
                        e
                    );
                    unit.mark_sent(now, &policy, None, false);
                }
            }

            let Some(deadline) = unit.deadline else {
                break Delivery::NoRoute;
            };
            let acked = loop {
                tokio::select! {
                    Some(confirmation) = confirm_rx.recv() => {
                        if unit.acknowledge(confirmation.ack) {
                            break true;
                        }
                        debug!("stray confirmation {} for session {}", confirmation.ack, self.session);
                    }
                    cmd = self.rx.recv() => match cmd {
                        Some(cmd) => {
                            if let Step::Stop = self.handle(cmd) {
                                self.stats.in_flight = None;
                                return Delivery::Stopped;
                            }
                        }
                        None => {
                            self.stats.in_flight = None;
                            return Delivery::Stopped;
                        }
                    },
                    _ = sleep_until(deadline) => break false,
                }
            };

            if acked {
                metrics::inc_reliable_acked();
                if let Some(sent) = unit.last_sent_at {
                    metrics::observe_ack_latency(sent.elapsed());
                }
                if let Some(total) = unit.latency(Instant::now()) {
                    debug!(
                        "chunk {}/{} to {} acknowledged {:?} after first transmission",
                        unit.sequence, unit.total, node, total
                    );
                }
                self.stats.delivered += 1;
                break Delivery::Acked;
            }

            let waited = policy.wait_for(unit.retries);
            match unit.on_deadline(&policy) {
                DeliveryState::Abandoned => {
                    metrics::inc_reliable_failed();
                    break Delivery::Abandoned {
                        node,
                        attempts: unit.retries + 1,
                    };
                }
                _ => {
                    debug!(
                        "chunk {}/{} to {}: {}; retry {}/{}",
                        unit.sequence,
                        unit.total,
                        node,
                        TransportError::AckTimeout(waited),
                        unit.retries,
                        policy.max_retries
                    );
                }
            }
        };
        self.stats.in_flight = None;
        outcome
    }
}
