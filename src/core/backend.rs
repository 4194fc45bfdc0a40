// src/core/backend.rs

//! The backend seam: storage engines plug into the node through the
//! `Backend` capability set. The node core treats handlers as opaque; only
//! the routing category of a command is its business.

use crate::core::NodeError;
use crate::core::protocol::{CommandHeader, Key};
use crate::core::request::Payload;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Result of a backend `lookup` capability call.
#[derive(Debug, Clone, Serialize)]
pub struct RecordInfo {
    pub size: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DefragState {
    Idle,
    Running,
}

/// The capability set every storage engine provides. Only `command` is
/// mandatory; the rest default to unsupported so thin engines stay thin.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Processes one command and produces the reply payload. Errors are
    /// placed verbatim into the reply's status as a negative errno.
    async fn command(&self, header: &CommandHeader, payload: &Bytes)
    -> Result<Payload, NodeError>;

    async fn iterate(&self) -> Result<Payload, NodeError> {
        Err(NodeError::Unsupported)
    }

    fn defrag_start(&self) -> Result<(), NodeError> {
        Err(NodeError::Unsupported)
    }

    fn defrag_stop(&self) -> Result<(), NodeError> {
        Err(NodeError::Unsupported)
    }

    fn defrag_status(&self) -> Result<DefragState, NodeError> {
        Err(NodeError::Unsupported)
    }

    fn inspect_start(&self) -> Result<(), NodeError> {
        Err(NodeError::Unsupported)
    }

    fn inspect_stop(&self) -> Result<(), NodeError> {
        Err(NodeError::Unsupported)
    }

    fn inspect_status(&self) -> Result<bool, NodeError> {
        Err(NodeError::Unsupported)
    }

    async fn checksum(&self, _key: &Key) -> Result<Bytes, NodeError> {
        Err(NodeError::Unsupported)
    }

    async fn lookup(&self, _key: &Key) -> Result<RecordInfo, NodeError> {
        Err(NodeError::Unsupported)
    }

    fn total_elements(&self) -> u64 {
        0
    }

    fn storage_stat_json(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    fn dir(&self) -> Option<PathBuf> {
        None
    }

    /// Invoked once when the backend is detached or the node shuts down.
    async fn cleanup(&self) {}
}

struct BackendEntry {
    backend: Arc<dyn Backend>,
    enabled: AtomicBool,
}

/// All backends attached to this node, by integer id.
#[derive(Default)]
pub struct BackendRegistry {
    entries: DashMap<i32, BackendEntry>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn attach(&self, backend_id: i32, backend: Arc<dyn Backend>) {
        self.entries.insert(
            backend_id,
            BackendEntry {
                backend,
                enabled: AtomicBool::new(true),
            },
        );
    }

    pub fn detach(&self, backend_id: i32) -> Option<Arc<dyn Backend>> {
        self.entries.remove(&backend_id).map(|(_, e)| e.backend)
    }

    /// Resolves an enabled backend; a disabled one behaves as absent.
    pub fn get(&self, backend_id: i32) -> Option<Arc<dyn Backend>> {
        self.entries.get(&backend_id).and_then(|e| {
            if e.enabled.load(Ordering::Acquire) {
                Some(e.backend.clone())
            } else {
                None
            }
        })
    }

    pub fn set_enabled(&self, backend_id: i32, enabled: bool) -> bool {
        match self.entries.get(&backend_id) {
            Some(e) => {
                e.enabled.store(enabled, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, backend_id: i32) -> bool {
        self.entries
            .get(&backend_id)
            .map(|e| e.enabled.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn ids(&self) -> Vec<i32> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
