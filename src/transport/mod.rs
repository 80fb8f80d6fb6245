//! Mesh transport engine.
//!
//! ```text
//!  LinkEvent::Message ──► dedup ──► per-node worker ──► binding ──► route
//!                                                                    │
//!                       ┌────────────── processor / authenticator ◄──┘
//!                       ▼
//!                 EngineCommand::Deliver ──► per-session outbox ──► LinkHandle
//!                                                 │
//!                   abandoned ◄───────────────────┘  (tears the session down)
//! ```
//!
//! The engine task owns the table of outboxes and the per-node inbound
//! workers. Workers resolve bindings and call the collaborators; everything
//! they produce comes back to the engine as [`EngineCommand`]s, so only the
//! engine ever creates or tears down an outbox. Collaborators that want to
//! push output or log a user out later use an [`EngineHandle`].
//!
//! A worker lives while its node is bound or has units in hand; idle workers
//! of released nodes are dropped at teardown and by the session sweep.
pub mod auth;
pub mod binding;
pub mod chunker;
pub mod collab;
pub mod dedup;
pub mod envelope;
pub mod outbox;
pub mod reliability;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::Config;
use crate::error::TransportError;
use crate::logutil::truncate_for_log;
use crate::meshcore::nodes::NodeDirectory;
use crate::meshcore::protocol::ContactMessage;
use crate::meshcore::{LinkEvent, LinkState, NodeId};
use crate::metrics;

pub use auth::{classify, AuthRouter, Route};
pub use binding::{BindingRegistry, Resolution};
pub use collab::{
    Authenticator, CommandProcessor, LoopbackAuthenticator, LoopbackProcessor, MemorySessionManager, SessionManager,
};
pub use dedup::{DedupCache, DedupKey};
pub use envelope::{ErrorClass, Hint, InboundEnvelope, LinkQuality, OutboundEnvelope, PayloadKind, SessionId};
pub use outbox::{ChunkSink, OutboxConfig, OutboxHandle};
pub use reliability::RetryPolicy;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub outbox: OutboxConfig,
    pub dedup_window: Duration,
    pub dedup_sweep: Duration,
    pub session_sweep: Duration,
    pub cancel_keyword: String,
    pub announce_multi_reply: bool,
    /// Where the node directory is kept; `None` keeps it in memory only.
    pub node_cache: Option<PathBuf>,
    pub node_cache_max_age_days: u32,
    pub node_cache_save_interval: Duration,
}

impl From<&Config> for EngineConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            outbox: OutboxConfig::from(&cfg.delivery),
            dedup_window: cfg.dedup.window(),
            dedup_sweep: cfg.dedup.sweep_interval(),
            session_sweep: cfg.session.sweep_interval(),
            cancel_keyword: cfg.delivery.cancel_keyword.clone(),
            announce_multi_reply: cfg.delivery.announce_multi_reply,
            node_cache: Some(cfg.storage.node_cache_path()),
            node_cache_max_age_days: cfg.storage.node_cache_max_age_days,
            node_cache_save_interval: Duration::from_secs(300),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut cfg = Self::from(&Config::default());
        cfg.node_cache = None;
        cfg
    }
}

#[derive(Debug)]
pub enum EngineCommand {
    Deliver(OutboundEnvelope),
    Cancel(SessionId),
    Logout(SessionId),
    Shutdown,
}

/// Cloneable access to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    /// Queue output for a session. Output for inactive sessions is dropped.
    pub fn deliver(&self, envelope: OutboundEnvelope) -> bool {
        self.tx.send(EngineCommand::Deliver(envelope)).is_ok()
    }

    pub fn cancel(&self, session: SessionId) -> bool {
        self.tx.send(EngineCommand::Cancel(session)).is_ok()
    }

    /// End a session: its queue is cancelled and its nodes are unbound.
    pub fn logout(&self, session: SessionId) -> bool {
        self.tx.send(EngineCommand::Logout(session)).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(EngineCommand::Shutdown);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Abandoned,
    Inactive,
    Logout,
}

/// Engine side of a per-node worker.
struct NodeWorker {
    tx: mpsc::UnboundedSender<ContactMessage>,
    /// Units handed over and not yet fully handled.
    backlog: Arc<AtomicUsize>,
}

impl NodeWorker {
    fn is_idle(&self) -> bool {
        self.backlog.load(Ordering::Acquire) == 0
    }
}

struct WorkerContext<P, S, A> {
    registry: Arc<BindingRegistry>,
    sessions: Arc<S>,
    router: AuthRouter<P, A>,
    engine: EngineHandle,
    cancel_keyword: String,
    announce_multi_reply: bool,
}

pub struct TransportEngine<K, P, S, A> {
    cfg: EngineConfig,
    sink: K,
    sessions: Arc<S>,
    registry: Arc<BindingRegistry>,
    dedup: Arc<DedupCache>,
    context: Arc<WorkerContext<P, S, A>>,
    outboxes: HashMap<SessionId, OutboxHandle>,
    workers: HashMap<NodeId, NodeWorker>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    handle: EngineHandle,
    outbox_events_tx: mpsc::UnboundedSender<outbox::OutboxEvent>,
    outbox_events: mpsc::UnboundedReceiver<outbox::OutboxEvent>,
}

impl<K, P, S, A> TransportEngine<K, P, S, A>
where
    K: ChunkSink,
    P: CommandProcessor,
    S: SessionManager,
    A: Authenticator,
{
    pub fn new(cfg: EngineConfig, sink: K, processor: Arc<P>, sessions: Arc<S>, authenticator: Arc<A>) -> Self {
        let directory = load_directory(&cfg);
        let registry = Arc::new(BindingRegistry::with_directory(directory));
        let (tx, commands) = mpsc::unbounded_channel();
        let handle = EngineHandle { tx };
        let (outbox_events_tx, outbox_events) = mpsc::unbounded_channel();
        let context = Arc::new(WorkerContext {
            registry: registry.clone(),
            sessions: sessions.clone(),
            router: AuthRouter::new(processor, authenticator),
            engine: handle.clone(),
            cancel_keyword: cfg.cancel_keyword.clone(),
            announce_multi_reply: cfg.announce_multi_reply,
        });
        Self {
            dedup: Arc::new(DedupCache::new(cfg.dedup_window)),
            cfg,
            sink,
            sessions,
            registry,
            context,
            outboxes: HashMap::new(),
            workers: HashMap::new(),
            commands,
            handle,
            outbox_events_tx,
            outbox_events,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn registry(&self) -> Arc<BindingRegistry> {
        self.registry.clone()
    }

    pub fn dedup(&self) -> Arc<DedupCache> {
        self.dedup.clone()
    }

    /// Serve link events until shutdown, the link going away, or a fatal
    /// link failure (returned as an error).
    pub async fn run(mut self, mut link_events: mpsc::UnboundedReceiver<LinkEvent>) -> Result<(), TransportError> {
        let sweeper = dedup::spawn_sweeper(self.dedup.clone(), self.cfg.dedup_sweep);
        let mut session_sweep = interval(self.cfg.session_sweep);
        session_sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        session_sweep.tick().await;
        let mut persist = interval(self.cfg.node_cache_save_interval);
        persist.set_missed_tick_behavior(MissedTickBehavior::Skip);
        persist.tick().await;

        let result = loop {
            tokio::select! {
                event = link_events.recv() => match event {
                    Some(LinkEvent::Fatal { attempts, reason }) => {
                        error!(target: "link", "device link is gone for good: {}", reason);
                        break Err(TransportError::Fatal { attempts, last: reason });
                    }
                    Some(event) => self.on_link_event(event),
                    None => {
                        info!("link event stream closed; stopping transport");
                        break Ok(());
                    }
                },
                Some(cmd) = self.commands.recv() => match cmd {
                    EngineCommand::Deliver(envelope) => self.deliver(envelope),
                    EngineCommand::Cancel(session) => self.cancel(&session),
                    EngineCommand::Logout(session) => self.teardown(&session, Teardown::Logout),
                    EngineCommand::Shutdown => {
                        info!("transport shutting down");
                        break Ok(());
                    }
                },
                Some(event) = self.outbox_events.recv() => match event {
                    outbox::OutboxEvent::Abandoned { session, node, attempts } => {
                        warn!("node {} stopped acknowledging after {} attempt(s)", node, attempts);
                        self.teardown(&session, Teardown::Abandoned);
                    }
                },
                _ = session_sweep.tick() => self.sweep_sessions(),
                _ = persist.tick() => self.persist_nodes(),
            }
        };

        sweeper.abort();
        for (_, outbox) in self.outboxes.drain() {
            outbox.shutdown();
        }
        self.workers.clear();
        self.persist_nodes();
        result
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::State(state) => match state {
                LinkState::Ready => info!("device link ready"),
                LinkState::Degraded => warn!("device link degraded; outbound delivery paused"),
                LinkState::Disconnected => info!("device link disconnected"),
                LinkState::Handshaking => debug!("device link handshaking"),
            },
            LinkEvent::Connected {
                self_info,
                device,
                protocol_version,
            } => info!(
                "radio '{}' ({}) online, protocol v{}",
                self_info.name, device.model, protocol_version
            ),
            LinkEvent::Message(msg) => self.on_message(msg),
            LinkEvent::Advert {
                node,
                name,
                public_key,
                kind,
            } => {
                if self.registry.record_advert(node, name.as_deref(), &public_key, kind) {
                    info!("discovered node {} '{}'", node, name.as_deref().unwrap_or(""));
                } else {
                    trace!("advert from {}", node);
                }
            }
            LinkEvent::Fatal { reason, .. } => error!(target: "link", "device link failure: {}", reason),
        }
    }

    fn on_message(&mut self, msg: ContactMessage) {
        let key = DedupKey::new(&msg.origin, msg.sender_timestamp, &msg.text);
        if self.dedup.is_duplicate(key) {
            metrics::inc_duplicates_suppressed();
            debug!("duplicate from {} (ts {}) suppressed", msg.origin, msg.sender_timestamp);
            return;
        }
        let node = msg.origin;
        self.registry.note_heard(node);

        let msg = match self.workers.get(&node) {
            Some(worker) => {
                worker.backlog.fetch_add(1, Ordering::AcqRel);
                match worker.tx.send(msg) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(msg)) => {
                        worker.backlog.fetch_sub(1, Ordering::AcqRel);
                        msg
                    }
                }
            }
            None => msg,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(1));
        let _ = tx.send(msg);
        tokio::spawn(node_worker(node, rx, backlog.clone(), self.context.clone()));
        self.workers.insert(node, NodeWorker { tx, backlog });
    }

    fn deliver(&mut self, envelope: OutboundEnvelope) {
        let session = envelope.session.clone();
        if !self.outboxes.contains_key(&session) {
            if !self.sessions.is_active(&session) {
                debug!("dropping output for inactive session {}", session);
                return;
            }
            let outbox = outbox::spawn_outbox(
                session.clone(),
                self.sink.clone(),
                self.registry.clone(),
                self.cfg.outbox.clone(),
                self.outbox_events_tx.clone(),
            );
            self.outboxes.insert(session.clone(), outbox);
        }
        if let Some(outbox) = self.outboxes.get(&session) {
            if !outbox.enqueue(envelope) {
                debug!("outbox for session {} has stopped; output dropped", session);
            }
        }
    }

    fn cancel(&mut self, session: &SessionId) {
        match self.outboxes.get(session) {
            Some(outbox) => {
                outbox.cancel();
            }
            None => debug!("cancel for session {} with nothing queued", session),
        }
    }

    fn sweep_sessions(&mut self) {
        let mut known: HashSet<SessionId> = self.outboxes.keys().cloned().collect();
        known.extend(self.registry.active_sessions());
        for session in known {
            if !self.sessions.is_active(&session) {
                self.teardown(&session, Teardown::Inactive);
            }
        }
        let registry = &self.registry;
        self.workers
            .retain(|node, w| !w.tx.is_closed() && !(w.is_idle() && registry.binding(node).is_none()));
    }

    /// Cancel the session's queue, release its nodes and expire it.
    fn teardown(&mut self, session: &SessionId, reason: Teardown) {
        let farewell = match reason {
            Teardown::Inactive => self
                .sessions
                .farewell(session)
                .map(|text| OutboundEnvelope::text(session.clone(), text)),
            _ => None,
        };
        let fallback = self.registry.primary_node(session);

        match self.outboxes.remove(session) {
            Some(outbox) => {
                outbox.cancel();
                if farewell.is_some() {
                    outbox.close(farewell, fallback);
                } else {
                    outbox.shutdown();
                }
            }
            None if farewell.is_some() => {
                let outbox = outbox::spawn_outbox(
                    session.clone(),
                    self.sink.clone(),
                    self.registry.clone(),
                    self.cfg.outbox.clone(),
                    self.outbox_events_tx.clone(),
                );
                outbox.close(farewell, fallback);
            }
            None => {}
        }

        let released = self.registry.release_session(session);
        for node in &released {
            // A busy worker finishes its units in order; the sweep drops it later.
            if self.workers.get(node).is_some_and(NodeWorker::is_idle) {
                self.workers.remove(node);
            }
        }
        self.sessions.expire(session);
        match reason {
            Teardown::Abandoned => {
                metrics::inc_sessions_abandoned();
                warn!(
                    "session {} torn down after abandoned delivery; released {} node(s)",
                    session,
                    released.len()
                );
            }
            Teardown::Inactive => info!("session {} expired after inactivity", session),
            Teardown::Logout => info!("session {} logged out", session),
        }
    }

    fn persist_nodes(&self) {
        let Some(path) = &self.cfg.node_cache else {
            return;
        };
        let max_age = self.cfg.node_cache_max_age_days;
        let result = self.registry.with_directory_mut(|dir| {
            let pruned = dir.remove_stale_nodes(max_age);
            if pruned > 0 {
                debug!("pruned {} stale node(s)", pruned);
            }
            dir.save_to_file(path)
        });
        if let Err(e) = result {
            warn!("unable to save node cache {}: {}", path.display(), e);
        }
    }
}

fn load_directory(cfg: &EngineConfig) -> NodeDirectory {
    let Some(path) = &cfg.node_cache else {
        return NodeDirectory::new();
    };
    if !path.exists() {
        return NodeDirectory::new();
    }
    match NodeDirectory::load_from_file(path) {
        Ok(mut dir) => {
            dir.remove_stale_nodes(cfg.node_cache_max_age_days);
            info!("loaded {} cached node(s) from {}", dir.len(), path.display());
            dir
        }
        Err(e) => {
            warn!("ignoring unreadable node cache {}: {}", path.display(), e);
            NodeDirectory::new()
        }
    }
}

/// Handles one node's units strictly in arrival order.
async fn node_worker<P, S, A>(
    node: NodeId,
    mut inbox: mpsc::UnboundedReceiver<ContactMessage>,
    backlog: Arc<AtomicUsize>,
    ctx: Arc<WorkerContext<P, S, A>>,
) where
    P: CommandProcessor,
    S: SessionManager,
    A: Authenticator,
{
    while let Some(msg) = inbox.recv().await {
        handle_unit(node, msg, &ctx).await;
        backlog.fetch_sub(1, Ordering::AcqRel);
    }
    trace!("worker for {} stopped", node);
}

async fn handle_unit<P, S, A>(node: NodeId, msg: ContactMessage, ctx: &WorkerContext<P, S, A>)
where
    P: CommandProcessor,
    S: SessionManager,
    A: Authenticator,
{
    let resolution = match ctx.registry.resolve(node, ctx.sessions.as_ref()) {
        Ok(r) => r,
        Err(e) => {
            error!("unable to open a session for {}: {}", node, e);
            return;
        }
    };
    if resolution.fresh {
        info!("node {} bound to new session {}", node, resolution.session);
    }
    let session = resolution.session.clone();
    let envelope = InboundEnvelope::from_message(resolution.session, resolution.fresh, msg);

    match classify(envelope.kind, &envelope.text, &ctx.cancel_keyword) {
        Route::Cancel => {
            debug!("node {} asked to stop output for session {}", node, session);
            ctx.engine.cancel(session);
            return;
        }
        Route::Chat => trace!("chat from {}: '{}'", node, truncate_for_log(&envelope.text, 80)),
        Route::Credential => {}
    }

    let mut replies = ctx.router.route(envelope).await;
    if replies.len() > 1 && ctx.announce_multi_reply {
        let header = format!(
            "Displaying {} messages. Send '{}' to stop.",
            replies.len(),
            ctx.cancel_keyword
        );
        replies.insert(0, OutboundEnvelope::text(session, header));
    }
    for reply in replies {
        ctx.engine.deliver(reply);
    }
}
