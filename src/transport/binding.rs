//! Node ↔ session relation.
//!
//! A node is bound to at most one session at a time; a session may be
//! reachable through several nodes. Bindings live in a slot arena indexed
//! both ways, so unbinding from either side is a couple of map removals and
//! nothing keeps a back-pointer.
//!
//! Session creation for a node is serialised by a per-node lock: two units
//! from the same unbound node that race here still produce one session.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::meshcore::nodes::NodeDirectory;
use crate::meshcore::NodeId;
use crate::transport::collab::SessionManager;
use crate::transport::envelope::SessionId;

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub node: NodeId,
    pub session: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Monotonic activity stamp; the highest wins when picking a route.
    activity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub session: SessionId,
    /// True when this call created the session.
    pub fresh: bool,
}

#[derive(Default)]
struct Relations {
    slots: Vec<Option<Binding>>,
    free: Vec<usize>,
    by_node: HashMap<NodeId, usize>,
    by_session: HashMap<SessionId, HashSet<usize>>,
    clock: u64,
}

impl Relations {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, node: NodeId, session: SessionId) {
        let now = Utc::now();
        let activity = self.tick();
        let binding = Binding {
            node,
            session: session.clone(),
            created_at: now,
            last_active_at: now,
            activity,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(binding);
                slot
            }
            None => {
                self.slots.push(Some(binding));
                self.slots.len() - 1
            }
        };
        self.by_node.insert(node, slot);
        self.by_session.entry(session).or_default().insert(slot);
    }

    fn remove_node(&mut self, node: &NodeId) -> Option<Binding> {
        let slot = self.by_node.remove(node)?;
        let binding = self.slots.get_mut(slot)?.take()?;
        self.free.push(slot);
        if let Some(slots) = self.by_session.get_mut(&binding.session) {
            slots.remove(&slot);
            if slots.is_empty() {
                self.by_session.remove(&binding.session);
            }
        }
        Some(binding)
    }

    fn get(&self, node: &NodeId) -> Option<&Binding> {
        let slot = *self.by_node.get(node)?;
        self.slots.get(slot)?.as_ref()
    }

    fn session_bindings(&self, session: &SessionId) -> impl Iterator<Item = &Binding> {
        self.by_session
            .get(session)
            .into_iter()
            .flatten()
            .filter_map(|slot| self.slots.get(*slot).and_then(Option::as_ref))
    }

    fn touch(&mut self, node: &NodeId) {
        let activity = self.tick();
        if let Some(slot) = self.by_node.get(node).copied() {
            if let Some(Some(b)) = self.slots.get_mut(slot) {
                b.last_active_at = Utc::now();
                b.activity = activity;
            }
        }
    }
}

pub struct BindingRegistry {
    relations: Mutex<Relations>,
    node_locks: Mutex<HashMap<NodeId, Arc<Mutex<()>>>>,
    directory: Mutex<NodeDirectory>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::with_directory(NodeDirectory::new())
    }

    pub fn with_directory(directory: NodeDirectory) -> Self {
        Self {
            relations: Mutex::new(Relations::default()),
            node_locks: Mutex::new(HashMap::new()),
            directory: Mutex::new(directory),
        }
    }

    fn relations(&self) -> MutexGuard<'_, Relations> {
        self.relations.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn node_lock(&self, node: NodeId) -> Arc<Mutex<()>> {
        let mut locks = self.node_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(node).or_default().clone()
    }

    /// Session for a unit arriving from `node`, creating one if the node is
    /// unbound or its session is no longer active.
    pub fn resolve<M: SessionManager + ?Sized>(&self, node: NodeId, sessions: &M) -> anyhow::Result<Resolution> {
        let lock = self.node_lock(node);
        let _serial = lock.lock().unwrap_or_else(|e| e.into_inner());

        let current = self.relations().get(&node).map(|b| b.session.clone());
        if let Some(session) = current {
            if sessions.is_active(&session) {
                self.relations().touch(&node);
                sessions.touch(&session);
                return Ok(Resolution { session, fresh: false });
            }
            self.unbind_node(&node);
        }

        let session = sessions.create_session(&node.to_string())?;
        self.bind(node, session.clone());
        Ok(Resolution { session, fresh: true })
    }

    /// Bind `node` to `session`. Idempotent; a node bound elsewhere moves.
    pub fn bind(&self, node: NodeId, session: SessionId) {
        let mut rel = self.relations();
        if rel.get(&node).map(|b| b.session == session).unwrap_or(false) {
            rel.touch(&node);
            return;
        }
        rel.remove_node(&node);
        rel.insert(node, session);
    }

    pub fn unbind_node(&self, node: &NodeId) -> Option<Binding> {
        self.relations().remove_node(node)
    }

    /// Drop every binding of `session`. Returns the nodes that were bound.
    pub fn release_session(&self, session: &SessionId) -> Vec<NodeId> {
        let released: Vec<NodeId> = {
            let mut rel = self.relations();
            let nodes: Vec<NodeId> = rel.session_bindings(session).map(|b| b.node).collect();
            for node in &nodes {
                rel.remove_node(node);
            }
            nodes
        };
        let mut locks = self.node_locks.lock().unwrap_or_else(|e| e.into_inner());
        for node in &released {
            if locks.get(node).map(|l| Arc::strong_count(l) == 1).unwrap_or(false) {
                locks.remove(node);
            }
        }
        released
    }

    pub fn sessions_for(&self, node: &NodeId) -> Vec<SessionId> {
        self.relations().get(node).map(|b| vec![b.session.clone()]).unwrap_or_default()
    }

    pub fn nodes_for(&self, session: &SessionId) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.relations().session_bindings(session).map(|b| b.node).collect();
        nodes.sort();
        nodes
    }

    /// The node most recently heard from on `session`.
    pub fn primary_node(&self, session: &SessionId) -> Option<NodeId> {
        self.relations()
            .session_bindings(session)
            .max_by_key(|b| b.activity)
            .map(|b| b.node)
    }

    pub fn binding(&self, node: &NodeId) -> Option<Binding> {
        self.relations().get(node).cloned()
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.relations().by_session.keys().cloned().collect()
    }

    pub fn binding_count(&self) -> usize {
        self.relations().by_node.len()
    }

    /// Record an advert in the node directory. True for a newly seen node.
    pub fn record_advert(&self, node: NodeId, name: Option<&str>, public_key: &[u8], kind: u8) -> bool {
        let mut dir = self.directory.lock().unwrap_or_else(|e| e.into_inner());
        dir.record_advert(node, name, public_key, kind)
    }

    pub fn note_heard(&self, node: NodeId) {
        let mut dir = self.directory.lock().unwrap_or_else(|e| e.into_inner());
        dir.touch(node);
    }

    /// Run `f` against the node directory.
    pub fn with_directory_mut<R>(&self, f: impl FnOnce(&mut NodeDirectory) -> R) -> R {
        let mut dir = self.directory.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut dir)
    }
}

impl Default for BindingRegistry {
    fn default() -> Self {
        Self::new()
    }
}
