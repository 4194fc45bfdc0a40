// src/core/routing.rs

//! The route table: maps identifier space onto backend ids. The table is an
//! input to the dispatcher; its content is learned from local backend
//! attachment and from ROUTE_LIST exchanges with peers.

use crate::core::protocol::Key;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One interval start in the identifier ring. A backend owns the key range
/// from its prefix up to the next entry, wrapping at the ring end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub prefix: u64,
    pub backend_id: i32,
}

/// The interval table itself, keyed by the leading eight identifier bytes.
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: RwLock<BTreeMap<u64, i32>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Resolves the backend owning `key`, ring-wrapping below the first
    /// entry. Empty table resolves to nothing and the dispatcher answers
    /// the peer with an error status.
    pub fn lookup(&self, key: &Key) -> Option<i32> {
        let entries = self.entries.read();
        if entries.is_empty() {
            return None;
        }
        let prefix = key.route_prefix();
        entries
            .range(..=prefix)
            .next_back()
            .or_else(|| entries.iter().next_back())
            .map(|(_, backend_id)| *backend_id)
    }

    pub fn insert(&self, entry: RouteEntry) {
        self.entries.write().insert(entry.prefix, entry.backend_id);
    }

    pub fn merge(&self, entries: &[RouteEntry]) {
        let mut table = self.entries.write();
        for e in entries {
            table.insert(e.prefix, e.backend_id);
        }
    }

    pub fn remove_backend(&self, backend_id: i32) {
        self.entries
            .write()
            .retain(|_, owner| *owner != backend_id);
    }

    /// Snapshot for ROUTE_LIST serialization.
    pub fn entries(&self) -> Vec<RouteEntry> {
        self.entries
            .read()
            .iter()
            .map(|(&prefix, &backend_id)| RouteEntry { prefix, backend_id })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
