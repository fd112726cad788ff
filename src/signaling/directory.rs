//! In-memory directory of joined peers

use super::protocol::{Peer, PeerId};
use chrono::{DateTime, Utc};

/// Directory record for one joined connection
#[derive(Debug, Clone)]
pub struct Entry {
    pub peer: Peer,
    pub joined_at: DateTime<Utc>,
}

/// Joined peers in join order
///
/// Owned by the hub task; never shared across tasks.
#[derive(Debug, Default)]
pub struct Directory {
    entries: Vec<Entry>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `id`, or renames it in place if it already joined
    pub fn register(&mut self, id: PeerId, name: String) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.peer.id == id) {
            entry.peer.name = name;
            return;
        }
        self.entries.push(Entry {
            peer: Peer { id, name },
            joined_at: Utc::now(),
        });
    }

    /// Removes `id`; `None` if it never joined
    pub fn remove(&mut self, id: &PeerId) -> Option<Entry> {
        let pos = self.entries.iter().position(|e| &e.peer.id == id)?;
        Some(self.entries.remove(pos))
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.entries.iter().any(|e| &e.peer.id == id)
    }

    pub fn name_of(&self, id: &PeerId) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| &e.peer.id == id)
            .map(|e| e.peer.name.as_str())
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.entries.iter().map(|e| e.peer.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
