//! Mirror of the companion radio's contact table.
//!
//! The radio only decrypts direct messages from nodes it holds as contacts,
//! and its table is small. When managed, the device runs in manual-add mode:
//! unknown advertisers arrive as `NewAdvert` pushes, chat nodes among them
//! are written back with `AddUpdateContact`, and the contact with the oldest
//! advert is removed first whenever the table is at its limit.

use std::collections::HashMap;

use super::protocol::ContactRecord;
use super::NodeId;

/// Advert type of a chat (companion) node.
pub const CHAT_NODE: u8 = 1;

/// A change the supervisor should write to the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactChange {
    Remove { node: NodeId, public_key: Vec<u8> },
    Add(ContactRecord),
}

#[derive(Debug, Clone)]
struct Entry {
    public_key: Vec<u8>,
    last_advert: u32,
}

#[derive(Debug)]
pub struct ContactTable {
    entries: HashMap<NodeId, Entry>,
    managed: bool,
    /// Configured size; `None` until the device reports one.
    capacity: Option<usize>,
    buffer: usize,
}

impl ContactTable {
    /// `capacity` of 0 means "use what the device reports".
    pub fn new(managed: bool, capacity: usize, buffer: usize) -> Self {
        Self {
            entries: HashMap::new(),
            managed,
            capacity: (capacity > 0).then_some(capacity),
            buffer,
        }
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    /// Size reported by the device query. A configured size wins.
    pub fn learn_capacity(&mut self, reported: Option<u16>) {
        if self.capacity.is_none() {
            self.capacity = reported.map(usize::from).filter(|&n| n > 0);
        }
    }

    /// Entries allowed before an add evicts; at least one.
    pub fn limit(&self) -> Option<usize> {
        self.capacity.map(|c| c.saturating_sub(self.buffer).max(1))
    }

    /// Replace the mirror with a full listing from the device.
    pub fn replace(&mut self, listing: Vec<ContactRecord>) {
        self.entries = listing
            .into_iter()
            .map(|rec| {
                (
                    rec.node,
                    Entry {
                        public_key: rec.public_key,
                        last_advert: rec.last_advert,
                    },
                )
            })
            .collect();
    }

    /// A contact the device reported outside a full listing.
    pub fn observe(&mut self, rec: &ContactRecord) {
        self.entries.insert(
            rec.node,
            Entry {
                public_key: rec.public_key.clone(),
                last_advert: rec.last_advert,
            },
        );
    }

    /// Advert from a node already on the device.
    pub fn heard(&mut self, node: NodeId, when: u32) {
        if let Some(entry) = self.entries.get_mut(&node) {
            entry.last_advert = entry.last_advert.max(when);
        }
    }

    pub fn public_key(&self, node: &NodeId) -> Option<&[u8]> {
        self.entries.get(node).map(|e| e.public_key.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decide what to write for an advertiser the device does not hold.
    /// Returns nothing when unmanaged, for non-chat nodes, or when the node
    /// is already present.
    pub fn admit(&mut self, rec: ContactRecord) -> Vec<ContactChange> {
        if !self.managed || rec.kind != CHAT_NODE {
            return Vec::new();
        }
        if let Some(entry) = self.entries.get_mut(&rec.node) {
            entry.last_advert = entry.last_advert.max(rec.last_advert);
            return Vec::new();
        }

        let mut changes = Vec::new();
        if let Some(limit) = self.limit() {
            while self.entries.len() >= limit {
                let Some(oldest) = self
                    .entries
                    .iter()
                    .min_by_key(|(node, e)| (e.last_advert, **node))
                    .map(|(node, _)| *node)
                else {
                    break;
                };
                if let Some(entry) = self.entries.remove(&oldest) {
                    changes.push(ContactChange::Remove {
                        node: oldest,
                        public_key: entry.public_key,
                    });
                }
            }
        }
        self.observe(&rec);
        changes.push(ContactChange::Add(rec));
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(tag: u8, kind: u8, last_advert: u32) -> ContactRecord {
        let key = vec![tag; 32];
        ContactRecord {
            node: NodeId::from_public_key(&key).unwrap(),
            public_key: key,
            kind,
            flags: 0,
            out_path_len: -1,
            out_path: Vec::new(),
            name: format!("node-{tag}"),
            last_advert,
        }
    }

    #[test]
    fn full_table_evicts_the_oldest_advert() {
        let mut table = ContactTable::new(true, 4, 1);
        table.replace(vec![contact(1, 1, 300), contact(2, 2, 100), contact(3, 1, 200)]);
        assert_eq!(table.limit(), Some(3));

        let changes = table.admit(contact(9, 1, 400));
        assert_eq!(changes.len(), 2);
        assert!(matches!(&changes[0], ContactChange::Remove { node, .. } if node.as_bytes() == &[2; 6]));
        assert!(matches!(&changes[1], ContactChange::Add(rec) if rec.name == "node-9"));
        assert_eq!(table.len(), 3);
        assert!(table.public_key(&contact(9, 1, 0).node).is_some());
    }

    #[test]
    fn refreshed_advert_protects_a_contact() {
        let mut table = ContactTable::new(true, 3, 1);
        table.replace(vec![contact(1, 1, 100), contact(2, 1, 200)]);
        table.heard(contact(1, 1, 0).node, 500);

        let changes = table.admit(contact(7, 1, 600));
        assert!(matches!(&changes[0], ContactChange::Remove { node, .. } if node.as_bytes() == &[2; 6]));
    }

    #[test]
    fn only_new_chat_nodes_are_admitted() {
        let mut table = ContactTable::new(true, 10, 1);
        assert!(table.admit(contact(5, 2, 10)).is_empty());
        assert_eq!(table.admit(contact(6, 1, 10)).len(), 1);
        assert!(table.admit(contact(6, 1, 20)).is_empty());
        assert_eq!(table.len(), 1);

        let mut unmanaged = ContactTable::new(false, 10, 1);
        assert!(unmanaged.admit(contact(6, 1, 10)).is_empty());
    }

    #[test]
    fn device_capacity_applies_when_not_configured() {
        let mut table = ContactTable::new(true, 0, 10);
        assert_eq!(table.limit(), None);
        table.learn_capacity(Some(350));
        assert_eq!(table.limit(), Some(340));

        let mut fixed = ContactTable::new(true, 50, 10);
        fixed.learn_capacity(Some(350));
        assert_eq!(fixed.limit(), Some(40));
    }
}
