//! Device link session: one task that owns the companion radio connection.
//!
//! ```text
//!  Disconnected ──connect──► Handshaking ──ok──► Ready ──watchdog──► Degraded
//!       ▲                        │                 │                    │
//!       └────── backoff ◄────────┴──── io error ───┴────────────────────┘
//! ```
//!
//! The supervisor is the only reader and writer of the serial stream. Other
//! tasks talk to it through a [`LinkHandle`]; it talks back through a stream
//! of [`LinkEvent`]s. The companion answers commands strictly in order, so
//! each response resolves the oldest pending command it can answer. Commands
//! queued ahead of it lost their answer and fail. Delivery confirmations are
//! matched to the ack code announced in the preceding `Sent` response. Both
//! tables live inside the task, so nothing here is shared behind a lock.
//!
//! The supervisor also mirrors the radio's contact table (see
//! [`super::contacts`]) so that it can add advertising chat nodes, evict the
//! stalest contact when the table fills, and reset a contact's route on
//! request.
//!
//! A watchdog is fed by every parsed frame. If it starves the connection is
//! torn down and re-established; after `max_reconnect_attempts` consecutive
//! failures the supervisor reports [`LinkEvent::Fatal`] and stops.
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};

use crate::config::MeshCoreConfig;
use crate::error::TransportError;
use crate::logutil::escape_log;
use crate::meshcore::contacts::{ContactChange, ContactTable};
use crate::meshcore::framer::{encode_frame, Decoded, Direction, FrameDecoder};
use crate::meshcore::protocol::{
    Command, ContactMessage, DeviceInfo, InboundUnit, SelfInfo, SentReceipt, TextType, UnitCategory,
};
use crate::meshcore::{epoch_secs, hex_snippet, AckCode, NodeId};
use crate::metrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Handshaking,
    Ready,
    Degraded,
}

/// Byte pipes to and from a connected device.
///
/// `incoming` yields raw chunks as they are read; an `Err` or a closed
/// channel means the interface failed. Frames written to `outgoing` are
/// written to the device in order.
pub struct LinkIo {
    pub incoming: mpsc::UnboundedReceiver<std::io::Result<Vec<u8>>>,
    pub outgoing: mpsc::UnboundedSender<Bytes>,
}

/// Opens a fresh connection to the device each time it is called.
pub trait Connector: Send + 'static {
    fn connect(&mut self) -> impl Future<Output = Result<LinkIo, TransportError>> + Send;
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub app_name: String,
    pub protocol_version: u8,
    pub max_frame: usize,
    pub node_name: Option<String>,
    pub sync_time: bool,
    pub handshake_timeout: Duration,
    pub command_timeout: Duration,
    pub watchdog_interval: Duration,
    pub keepalive_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_reconnect_attempts: u32,
    /// `None` disables self-advertisement.
    pub advert_interval: Option<Duration>,
    pub advert_flood: bool,
    pub manage_contacts: bool,
    /// 0 uses the size the device reports.
    pub max_device_contacts: usize,
    pub contact_limit_buffer: usize,
}

impl From<&MeshCoreConfig> for LinkConfig {
    fn from(cfg: &MeshCoreConfig) -> Self {
        Self {
            app_name: cfg.app_name.clone(),
            protocol_version: cfg.protocol_version,
            max_frame: cfg.max_frame_size,
            node_name: cfg.node_name.clone(),
            sync_time: cfg.sync_time,
            handshake_timeout: cfg.handshake_timeout(),
            command_timeout: cfg.command_timeout(),
            watchdog_interval: cfg.watchdog_interval(),
            keepalive_interval: cfg.keepalive_interval(),
            reconnect_base: Duration::from_secs(cfg.reconnect_base_secs),
            reconnect_max: Duration::from_secs(cfg.reconnect_max_secs),
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            advert_interval: cfg.advert_interval(),
            advert_flood: cfg.advert_flood,
            manage_contacts: cfg.manage_contacts,
            max_device_contacts: cfg.max_device_contacts,
            contact_limit_buffer: cfg.contact_limit_buffer,
        }
    }
}

impl LinkConfig {
    /// Delay before reconnect attempt `failures` (1-based), with up to 20% jitter.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let base = self.reconnect_base.saturating_mul(1u32 << exp).min(self.reconnect_max);
        let jitter_ms = (base.as_millis() as u64) / 5;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// A delivery confirmation for one transmitted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub ack: AckCode,
    pub round_trip: Duration,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    State(LinkState),
    Connected {
        self_info: SelfInfo,
        device: DeviceInfo,
        protocol_version: u8,
    },
    Message(ContactMessage),
    Advert {
        node: NodeId,
        name: Option<String>,
        public_key: Vec<u8>,
        kind: u8,
    },
    /// Reconnect attempts exhausted; every session is affected.
    Fatal { attempts: u32, reason: String },
}

type Reply = oneshot::Sender<Result<InboundUnit, TransportError>>;

enum LinkRequest {
    Command {
        command: Command,
        reply: Option<Reply>,
        confirm: Option<mpsc::UnboundedSender<Confirmation>>,
    },
    ResetPath {
        node: NodeId,
        reply: Reply,
    },
    Shutdown,
}

impl LinkRequest {
    /// Answer the request without touching the device.
    fn refuse(self, err: TransportError) {
        match self {
            LinkRequest::Command { reply: Some(reply), .. } | LinkRequest::ResetPath { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            _ => {}
        }
    }
}

/// Cheap, cloneable access to the link task.
#[derive(Clone, Debug)]
pub struct LinkHandle {
    tx: mpsc::UnboundedSender<LinkRequest>,
}

impl std::fmt::Debug for LinkRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkRequest::Command { command, .. } => write!(f, "Command({})", command.name()),
            LinkRequest::ResetPath { node, .. } => write!(f, "ResetPath({})", node),
            LinkRequest::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl LinkHandle {
    /// Write a command and wait for the device's answer to it.
    pub async fn request(&self, command: Command) -> Result<InboundUnit, TransportError> {
        self.submit(command, None).await
    }

    /// Transmit a direct text. Confirmations for the returned ack code are
    /// delivered on `confirm` by the link task.
    pub async fn send_text(
        &self,
        destination: NodeId,
        text: String,
        attempt: u8,
        timestamp: u32,
        confirm: mpsc::UnboundedSender<Confirmation>,
    ) -> Result<SentReceipt, TransportError> {
        let command = Command::SendText {
            text_type: TextType::Plain,
            attempt,
            timestamp,
            destination,
            text,
        };
        match self.submit(command, Some(confirm)).await? {
            InboundUnit::Sent(receipt) => Ok(receipt),
            other => Err(TransportError::UnexpectedResponse {
                command: "send text",
                got: format!("{:?}", other),
            }),
        }
    }

    /// Forget the radio's learned route to `node` so the next text to it
    /// floods. Fails with `UnknownContact` when the radio does not hold it.
    pub async fn reset_path(&self, node: NodeId) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LinkRequest::ResetPath { node, reply })
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::LinkDown)?.map(|_| ())
    }

    /// Ask the link task to close the connection and stop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(LinkRequest::Shutdown);
    }

    async fn submit(
        &self,
        command: Command,
        confirm: Option<mpsc::UnboundedSender<Confirmation>>,
    ) -> Result<InboundUnit, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LinkRequest::Command {
                command,
                reply: Some(reply),
                confirm,
            })
            .map_err(|_| TransportError::Closed)?;
        // A dropped reply means the connection went away with the command queued.
        rx.await.map_err(|_| TransportError::LinkDown)?
    }
}

struct Pending {
    name: &'static str,
    code: u8,
    sent_at: Instant,
    reply: Option<Reply>,
    confirm: Option<mpsc::UnboundedSender<Confirmation>>,
}

/// One live connection: decoder, command FIFO and ack waiters.
struct Connection {
    io: LinkIo,
    decoder: FrameDecoder,
    max_frame: usize,
    pending: VecDeque<Pending>,
    ack_waiters: HashMap<AckCode, mpsc::UnboundedSender<Confirmation>>,
    last_frame: Instant,
    last_keepalive: Instant,
    syncing: bool,
}

impl Connection {
    fn new(io: LinkIo, max_frame: usize) -> Self {
        let now = Instant::now();
        Self {
            io,
            decoder: FrameDecoder::new(Direction::FromDevice, max_frame),
            max_frame,
            pending: VecDeque::new(),
            ack_waiters: HashMap::new(),
            last_frame: now,
            last_keepalive: now,
            syncing: false,
        }
    }

    /// Next decoded unit. Malformed frames are counted, logged and skipped.
    async fn next_unit(&mut self) -> Result<InboundUnit, TransportError> {
        loop {
            match self.decoder.decode() {
                Ok(Decoded::Frame(frame)) => {
                    self.last_frame = Instant::now();
                    match InboundUnit::decode(&frame) {
                        Ok(unit) => return Ok(unit),
                        Err(e) => {
                            metrics::inc_frames_discarded();
                            debug!(target: "link", "discarding frame {}: {}", hex_snippet(&frame, 16), e);
                        }
                    }
                }
                Ok(Decoded::NeedMoreData) => match self.io.incoming.recv().await {
                    Some(Ok(chunk)) => {
                        trace!(target: "link", "rx {} bytes: {}", chunk.len(), hex_snippet(&chunk, 32));
                        self.decoder.push(&chunk);
                    }
                    Some(Err(e)) => return Err(TransportError::Io(e)),
                    None => return Err(TransportError::Link("device stream closed".into())),
                },
                Err(e) => {
                    metrics::inc_frames_discarded();
                    debug!(target: "link", "framing: {}", e);
                }
            }
        }
    }

    fn write(&mut self, command: &Command) -> Result<(), TransportError> {
        let frame = encode_frame(Direction::ToDevice, &command.encode(), self.max_frame)?;
        trace!(target: "link", "tx {}: {}", command.name(), hex_snippet(&frame, 32));
        self.io
            .outgoing
            .send(frame)
            .map_err(|_| TransportError::Link("device writer closed".into()))
    }

    /// Write a command and queue it for its answer.
    fn enqueue(
        &mut self,
        command: Command,
        reply: Option<Reply>,
        confirm: Option<mpsc::UnboundedSender<Confirmation>>,
    ) -> Result<(), TransportError> {
        match self.write(&command) {
            Ok(()) => {}
            Err(TransportError::Framing(fe)) => {
                // Too large to frame: only this request fails.
                if let Some(reply) = reply {
                    let _ = reply.send(Err(TransportError::Framing(fe)));
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        if matches!(command, Command::SyncNextMessage) {
            self.syncing = true;
        }
        self.pending.push_back(Pending {
            name: command.name(),
            code: command.code(),
            sent_at: Instant::now(),
            reply,
            confirm,
        });
        Ok(())
    }

    /// Write a command and wait for its direct answer, used before the
    /// FIFO is in service. Pushes seen meanwhile go to `on_push`.
    async fn exchange(
        &mut self,
        command: Command,
        wait: Duration,
        mut on_push: impl FnMut(InboundUnit),
    ) -> Result<InboundUnit, TransportError> {
        let name = command.name();
        self.write(&command)?;
        let deadline = Instant::now() + wait;
        loop {
            let unit = match timeout(deadline.saturating_duration_since(Instant::now()), self.next_unit()).await {
                Ok(unit) => unit?,
                Err(_) => return Err(TransportError::HandshakeTimeout(name)),
            };
            if unit.is_push() {
                on_push(unit);
                continue;
            }
            if let InboundUnit::Error { code } = unit {
                return Err(TransportError::DeviceRejected {
                    command: name,
                    code: code.unwrap_or(0),
                });
            }
            return Ok(unit);
        }
    }
}

/// How a served connection ended.
enum Outcome {
    Shutdown,
    /// Watchdog starved while Ready.
    Wedged,
    /// The interface failed after the link had been Ready.
    Dropped(TransportError),
}

pub struct LinkSupervisor<C: Connector> {
    connector: C,
    cfg: LinkConfig,
    requests: mpsc::UnboundedReceiver<LinkRequest>,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: LinkState,
    next_advert: Option<Instant>,
    contacts: ContactTable,
}

impl<C: Connector> LinkSupervisor<C> {
    pub fn new(
        connector: C,
        cfg: LinkConfig,
    ) -> (Self, LinkHandle, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, requests) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let contacts = ContactTable::new(
            cfg.manage_contacts,
            cfg.max_device_contacts,
            cfg.contact_limit_buffer,
        );
        let sup = Self {
            connector,
            cfg,
            requests,
            events,
            state: LinkState::Disconnected,
            next_advert: None,
            contacts,
        };
        (sup, LinkHandle { tx }, events_rx)
    }

    /// Keep the link up until shutdown or until reconnects are exhausted.
    pub async fn run(mut self) -> Result<(), TransportError> {
        let mut failures: u32 = 0;
        loop {
            match self.connect_and_serve().await {
                Ok(Outcome::Shutdown) => {
                    self.set_state(LinkState::Disconnected);
                    info!(target: "link", "link shut down");
                    return Ok(());
                }
                Ok(Outcome::Wedged) => {
                    failures = 1;
                    self.set_state(LinkState::Degraded);
                    metrics::inc_link_restarts();
                    warn!(
                        target: "link",
                        "no frames for {:?}; restarting device link",
                        self.cfg.watchdog_interval
                    );
                }
                Ok(Outcome::Dropped(e)) => {
                    failures = 1;
                    metrics::inc_link_restarts();
                    warn!(target: "link", "device link lost: {}", e);
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        target: "link",
                        "device link attempt {}/{} failed: {}",
                        failures,
                        self.cfg.max_reconnect_attempts,
                        e
                    );
                    if failures >= self.cfg.max_reconnect_attempts {
                        self.set_state(LinkState::Disconnected);
                        error!(
                            target: "link",
                            "device link failed permanently after {} attempts; all sessions are affected",
                            failures
                        );
                        let _ = self.events.send(LinkEvent::Fatal {
                            attempts: failures,
                            reason: e.to_string(),
                        });
                        return Err(TransportError::Fatal {
                            attempts: failures,
                            last: e.to_string(),
                        });
                    }
                }
            }
            self.set_state(LinkState::Disconnected);
            let delay = self.cfg.backoff(failures);
            debug!(target: "link", "reconnecting in {:?}", delay);
            if self.wait_out(delay).await {
                info!(target: "link", "link shut down while reconnecting");
                return Ok(());
            }
        }
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            debug!(target: "link", "link state {:?} -> {:?}", self.state, state);
            self.state = state;
            let _ = self.events.send(LinkEvent::State(state));
        }
    }

    /// Sleep through a backoff, failing requests that arrive meanwhile.
    /// Returns true when shutdown was requested.
    async fn wait_out(&mut self, delay: Duration) -> bool {
        let until = sleep(delay);
        tokio::pin!(until);
        loop {
            tokio::select! {
                _ = &mut until => return false,
                req = self.requests.recv() => match req {
                    Some(LinkRequest::Shutdown) | None => return true,
                    Some(req) => req.refuse(TransportError::LinkDown),
                },
            }
        }
    }

    async fn connect_and_serve(&mut self) -> Result<Outcome, TransportError> {
        let io = self.connector.connect().await?;
        let mut conn = Connection::new(io, self.cfg.max_frame);
        self.set_state(LinkState::Handshaking);
        self.handshake(&mut conn).await?;
        self.set_state(LinkState::Ready);
        match self.serve(&mut conn).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Ok(Outcome::Dropped(e)),
        }
    }

    async fn handshake(&mut self, conn: &mut Connection) -> Result<(), TransportError> {
        let wait = self.cfg.handshake_timeout;
        let events = self.events.clone();
        // Waiting-message pushes need no action here; the queue is drained once Ready.
        let mut on_push = |unit: InboundUnit| forward_advert(&events, unit);

        let self_info = match conn
            .exchange(
                Command::AppStart {
                    app_version: self.cfg.protocol_version,
                    app_name: self.cfg.app_name.clone(),
                },
                wait,
                &mut on_push,
            )
            .await?
        {
            InboundUnit::SelfInfo(info) => info,
            other => return Err(unexpected("app start", &other)),
        };

        let device = match conn
            .exchange(
                Command::DeviceQuery {
                    app_target_version: self.cfg.protocol_version,
                },
                wait,
                &mut on_push,
            )
            .await?
        {
            InboundUnit::DeviceInfo(info) => info,
            other => return Err(unexpected("device query", &other)),
        };
        self.contacts.learn_capacity(device.max_contacts);

        if self.cfg.sync_time {
            let epoch_secs = epoch_secs();
            match conn
                .exchange(Command::SetDeviceTime { epoch_secs }, wait, &mut on_push)
                .await
            {
                Ok(_) => debug!(target: "link", "device clock set to {}", epoch_secs),
                Err(TransportError::HandshakeTimeout(what)) => {
                    return Err(TransportError::HandshakeTimeout(what))
                }
                Err(e) => warn!(target: "link", "unable to sync device time: {}", e),
            }
        }

        if let Some(name) = self.cfg.node_name.clone() {
            if name != self_info.name {
                match conn.exchange(Command::SetAdvertName { name: name.clone() }, wait, &mut on_push).await {
                    Ok(_) => info!(target: "link", "node name set to '{}'", name),
                    Err(TransportError::HandshakeTimeout(what)) => {
                        return Err(TransportError::HandshakeTimeout(what))
                    }
                    Err(e) => warn!(target: "link", "unable to set node name: {}", e),
                }
            }
        }

        // Seed node discovery and the contact mirror from the device's table.
        match conn.exchange(Command::GetContacts { since: None }, wait, &mut on_push).await {
            Ok(InboundUnit::ContactsStart { count }) => {
                let mut listed = Vec::new();
                loop {
                    let unit = match timeout(wait, conn.next_unit()).await {
                        Ok(unit) => unit?,
                        Err(_) => return Err(TransportError::HandshakeTimeout("end of contacts")),
                    };
                    match unit {
                        InboundUnit::Contact(rec) => {
                            listed.push(rec.clone());
                            forward_advert(&self.events, InboundUnit::Contact(rec));
                        }
                        InboundUnit::EndOfContacts => break,
                        other if other.is_push() => on_push(other),
                        other => {
                            debug!(target: "link", "ignoring {:?} inside contact listing", other);
                        }
                    }
                }
                debug!(target: "link", "device lists {} contact(s), received {}", count, listed.len());
                self.contacts.replace(listed);
            }
            Ok(other) => debug!(target: "link", "contact query answered with {:?}", other),
            Err(TransportError::HandshakeTimeout(what)) => return Err(TransportError::HandshakeTimeout(what)),
            Err(e) => warn!(target: "link", "contact query failed: {}", e),
        }

        if self.contacts.is_managed() {
            match conn.exchange(Command::SetManualAddContacts(true), wait, &mut on_push).await {
                Ok(_) => info!(
                    target: "link",
                    "managing device contacts: {} held, limit {}",
                    self.contacts.len(),
                    self.contacts.limit().map_or_else(|| "unknown".to_string(), |n| n.to_string())
                ),
                Err(TransportError::HandshakeTimeout(what)) => return Err(TransportError::HandshakeTimeout(what)),
                Err(e) => warn!(target: "link", "unable to enable manual contact adds: {}", e),
            }
        }

        let negotiated = self.cfg.protocol_version.min(device.firmware_version.max(1));
        info!(
            target: "link",
            "companion ready: '{}' model='{}' fw={} build='{}' protocol v{}",
            self_info.name, device.model, device.firmware_version, device.firmware_build, negotiated
        );
        let _ = self.events.send(LinkEvent::Connected {
            self_info,
            device,
            protocol_version: negotiated,
        });
        // Drain whatever the device queued while we were away.
        conn.enqueue(Command::SyncNextMessage, None, None)?;
        if self.next_advert.is_none() {
            if let Some(every) = self.cfg.advert_interval {
                self.advertise(conn, every)?;
            }
        }
        Ok(())
    }

    async fn serve(&mut self, conn: &mut Connection) -> Result<Outcome, TransportError> {
        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                unit = conn.next_unit() => {
                    let unit = unit?;
                    self.dispatch(conn, unit)?;
                }
                req = self.requests.recv() => match req {
                    Some(LinkRequest::Command { command, reply, confirm }) => {
                        conn.enqueue(command, reply, confirm)?;
                    }
                    Some(LinkRequest::ResetPath { node, reply }) => match self.contacts.public_key(&node) {
                        Some(key) => {
                            let public_key = key.to_vec();
                            debug!(target: "link", "resetting path to {}", node);
                            conn.enqueue(Command::ResetPath { public_key }, Some(reply), None)?;
                        }
                        None => {
                            let _ = reply.send(Err(TransportError::UnknownContact(node)));
                        }
                    },
                    Some(LinkRequest::Shutdown) | None => return Ok(Outcome::Shutdown),
                },
                _ = tick.tick() => {
                    if conn.last_frame.elapsed() >= self.cfg.watchdog_interval {
                        return Ok(Outcome::Wedged);
                    }
                    self.housekeeping(conn)?;
                }
            }
        }
    }

    fn housekeeping(&mut self, conn: &mut Connection) -> Result<(), TransportError> {
        while let Some(head) = conn.pending.front() {
            if head.sent_at.elapsed() < self.cfg.command_timeout {
                break;
            }
            if let Some(p) = conn.pending.pop_front() {
                warn!(target: "link", "no answer to {} within {:?}", p.name, self.cfg.command_timeout);
                if p.code == Command::SyncNextMessage.code() {
                    conn.syncing = false;
                }
                if let Some(reply) = p.reply {
                    let _ = reply.send(Err(TransportError::CommandTimeout(p.name)));
                }
            }
        }
        conn.ack_waiters.retain(|_, tx| !tx.is_closed());
        let idle = conn.last_frame.elapsed();
        if idle >= self.cfg.keepalive_interval && conn.last_keepalive.elapsed() >= self.cfg.keepalive_interval {
            trace!(target: "link", "idle {:?}; probing device", idle);
            conn.last_keepalive = Instant::now();
            conn.enqueue(Command::GetDeviceTime, None, None)?;
        }
        if let (Some(every), Some(due)) = (self.cfg.advert_interval, self.next_advert) {
            if Instant::now() >= due {
                self.advertise(conn, every)?;
            }
        }
        Ok(())
    }

    fn advertise(&mut self, conn: &mut Connection, every: Duration) -> Result<(), TransportError> {
        debug!(target: "link", "sending self advert (flood: {})", self.cfg.advert_flood);
        conn.enqueue(
            Command::SendSelfAdvert {
                flood: self.cfg.advert_flood,
            },
            None,
            None,
        )?;
        self.next_advert = Some(Instant::now() + every);
        Ok(())
    }

    /// The single classification step for every unit received while Ready.
    fn dispatch(&mut self, conn: &mut Connection, unit: InboundUnit) -> Result<(), TransportError> {
        if unit.is_push() {
            match unit {
                InboundUnit::SendConfirmed { ack, round_trip } => match conn.ack_waiters.remove(&ack) {
                    Some(tx) => {
                        let _ = tx.send(Confirmation { ack, round_trip });
                    }
                    None => debug!(target: "link", "confirmation {} matches no pending delivery", ack),
                },
                InboundUnit::MessageWaiting => {
                    if !conn.syncing {
                        conn.enqueue(Command::SyncNextMessage, None, None)?;
                    }
                }
                InboundUnit::PathUpdated { node } => debug!(target: "link", "path to {} updated", node),
                InboundUnit::NewAdvert(rec) => {
                    let changes = self.contacts.admit(rec.clone());
                    forward_advert(&self.events, InboundUnit::NewAdvert(rec));
                    self.write_contact_changes(conn, changes)?;
                }
                InboundUnit::Advert { node, public_key } => {
                    self.contacts.heard(node, epoch_secs());
                    forward_advert(&self.events, InboundUnit::Advert { node, public_key });
                }
                other if other.category() == UnitCategory::Advert => forward_advert(&self.events, other),
                other => trace!(target: "link", "ignoring push {:?}", other),
            }
            return Ok(());
        }

        match unit {
            // Contact listings span several frames; only the end answers the command.
            InboundUnit::ContactsStart { .. } => return Ok(()),
            InboundUnit::Contact(rec) => {
                self.contacts.observe(&rec);
                forward_advert(&self.events, InboundUnit::Contact(rec));
                return Ok(());
            }
            _ => {}
        }

        let head = match conn.pending.iter().position(|p| unit.answers(p.code)) {
            Some(at) => {
                for lost in conn.pending.drain(..at) {
                    warn!(target: "link", "{} lost its answer; device moved on to {:?}", lost.name, unit.category());
                    if lost.code == Command::SyncNextMessage.code() {
                        conn.syncing = false;
                    }
                    if let Some(reply) = lost.reply {
                        let _ = reply.send(Err(unexpected(lost.name, &unit)));
                    }
                }
                conn.pending.pop_front()
            }
            None => None,
        };
        let was_sync = head
            .as_ref()
            .map(|p| p.code == Command::SyncNextMessage.code())
            .unwrap_or(false);

        match &unit {
            InboundUnit::Message(msg) => {
                let _ = self.events.send(LinkEvent::Message(msg.clone()));
                // Keep pulling until the device says it is empty.
                conn.syncing = false;
                conn.enqueue(Command::SyncNextMessage, None, None)?;
            }
            InboundUnit::NoMoreMessages => conn.syncing = false,
            InboundUnit::Error { .. } if was_sync => conn.syncing = false,
            _ => {}
        }

        let Some(p) = head else {
            trace!(target: "link", "unsolicited response {:?}", unit);
            return Ok(());
        };
        if let InboundUnit::Sent(receipt) = &unit {
            if let Some(confirm) = p.confirm {
                conn.ack_waiters.insert(receipt.ack, confirm);
            }
        }
        let result = match unit {
            InboundUnit::Error { code } => Err(TransportError::DeviceRejected {
                command: p.name,
                code: code.unwrap_or(0),
            }),
            other => Ok(other),
        };
        match (p.reply, result) {
            (Some(reply), result) => {
                let _ = reply.send(result);
            }
            (None, Err(e)) if !was_sync => warn!(target: "link", "{}", e),
            (None, _) => {}
        }
        Ok(())
    }

    fn write_contact_changes(
        &mut self,
        conn: &mut Connection,
        changes: Vec<ContactChange>,
    ) -> Result<(), TransportError> {
        for change in changes {
            match change {
                ContactChange::Remove { node, public_key } => {
                    info!(target: "link", "contact table full; removing {}", node);
                    conn.enqueue(Command::RemoveContact { public_key }, None, None)?;
                }
                ContactChange::Add(rec) => {
                    info!(target: "link", "adding contact {} '{}'", rec.node, escape_log(&rec.name));
                    conn.enqueue(Command::AddUpdateContact(rec), None, None)?;
                }
            }
        }
        Ok(())
    }
}

fn forward_advert(events: &mpsc::UnboundedSender<LinkEvent>, unit: InboundUnit) {
    let event = match unit {
        InboundUnit::Advert { node, public_key } => LinkEvent::Advert {
            node,
            name: None,
            public_key,
            kind: 0,
        },
        InboundUnit::NewAdvert(rec) | InboundUnit::Contact(rec) => LinkEvent::Advert {
            node: rec.node,
            name: Some(rec.name),
            public_key: rec.public_key,
            kind: rec.kind,
        },
        other => {
            trace!(target: "link", "ignoring {:?}", other);
            return;
        }
    };
    let _ = events.send(event);
}

fn unexpected(command: &'static str, got: &InboundUnit) -> TransportError {
    TransportError::UnexpectedResponse {
        command,
        got: format!("{:?}", got),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LinkConfig {
        LinkConfig::from(&MeshCoreConfig::default())
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = cfg();
        let first = cfg.backoff(1);
        assert!(first >= Duration::from_secs(2) && first <= Duration::from_millis(2400));
        let third = cfg.backoff(3);
        assert!(third >= Duration::from_secs(8) && third <= Duration::from_millis(9600));
        let capped = cfg.backoff(30);
        assert!(capped >= Duration::from_secs(60) && capped <= Duration::from_secs(72));
    }

    #[tokio::test]
    async fn request_fails_when_link_task_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let handle = LinkHandle { tx };
        let err = handle.request(Command::GetDeviceTime).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
