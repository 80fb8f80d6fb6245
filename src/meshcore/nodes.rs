//! Node directory built from adverts and contact listings.
//!
//! Adverts only ever update this table; they never touch sessions or block
//! message delivery. The directory is persisted as pretty JSON, staged beside
//! the target and renamed over it.
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meshcore::{hex_snippet, NodeId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnownNode {
    pub node: NodeId,
    #[serde(default)]
    pub name: String,
    /// Full public key, hex encoded, when an advert carried it.
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub kind: u8,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub adverts: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeDirectory {
    pub nodes: HashMap<NodeId, KnownNode>,
    pub last_updated: DateTime<Utc>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        // NUL padding can precede the JSON after a power cut.
        let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
        serde_json::from_slice(&raw[start..]).with_context(|| format!("parsing {}", path.display()))
    }

    /// Write the directory to `path`. Readers see either the old file or the
    /// complete new one.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_vec_pretty(self)?;
        replace_file(path, &json).with_context(|| format!("writing {}", path.display()))
    }

    /// Record an advert or contact entry. Returns true for a node not seen before.
    pub fn record_advert(&mut self, node: NodeId, name: Option<&str>, public_key: &[u8], kind: u8) -> bool {
        let now = Utc::now();
        let key_hex = if public_key.is_empty() {
            String::new()
        } else {
            hex_snippet(public_key, public_key.len())
        };
        let mut is_new = false;
        self.nodes
            .entry(node)
            .and_modify(|n| {
                if let Some(name) = name.filter(|s| !s.is_empty()) {
                    n.name = name.to_string();
                }
                if !key_hex.is_empty() {
                    n.public_key = key_hex.clone();
                }
                n.kind = kind;
                n.last_seen = now;
                n.adverts = n.adverts.saturating_add(1);
            })
            .or_insert_with(|| {
                is_new = true;
                KnownNode {
                    node,
                    name: name.unwrap_or_default().to_string(),
                    public_key: key_hex.clone(),
                    kind,
                    first_seen: now,
                    last_seen: now,
                    adverts: 1,
                }
            });
        self.last_updated = now;
        is_new
    }

    /// Note that a node was heard from through a message.
    pub fn touch(&mut self, node: NodeId) {
        let now = Utc::now();
        self.nodes
            .entry(node)
            .and_modify(|n| n.last_seen = now)
            .or_insert_with(|| KnownNode {
                node,
                name: String::new(),
                public_key: String::new(),
                kind: 0,
                first_seen: now,
                last_seen: now,
                adverts: 0,
            });
        self.last_updated = now;
    }

    pub fn get(&self, node: &NodeId) -> Option<&KnownNode> {
        self.nodes.get(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn remove_stale_nodes(&mut self, max_age_days: u32) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days as i64);
        let initial_count = self.nodes.len();
        self.nodes.retain(|_, node| node.last_seen > cutoff);
        let removed = initial_count - self.nodes.len();
        if removed > 0 {
            self.last_updated = Utc::now();
        }
        removed
    }
}

impl Default for NodeDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage `bytes` beside `path`, flush them to disk, then rename over `path`.
fn replace_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let folder = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(folder)?;

    let mut staged = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    staged.push(format!(".{}.partial", std::process::id()));
    let staged = PathBuf::from(folder).join(staged);

    let written = File::create(&staged).and_then(|mut f| {
        f.write_all(bytes)?;
        f.sync_all()
    });
    if let Err(e) = written.and_then(|()| fs::rename(&staged, path)) {
        let _ = fs::remove_file(&staged);
        return Err(e);
    }
    // Persist the rename itself; not every platform can open a directory.
    if let Ok(d) = File::open(folder) {
        let _ = d.sync_all();
    }
    Ok(())
}
