// src/core/state.rs

//! Defines the central `NodeState` struct, holding all shared node-wide
//! state. There is no ambient global other than the logger: everything a
//! subcomponent needs hangs off this one value.

use crate::config::Config;
use crate::connection::Connection;
use crate::core::admission::AdmissionController;
use crate::core::backend::BackendRegistry;
use crate::core::pool::IoPools;
use crate::core::routing::RouteTable;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::info;

/// Why a peer address sits in the reconnect set, and when to try it next.
#[derive(Debug, Clone)]
pub struct ReconnectEntry {
    /// Whether the lost peer had joined the cluster (vs. a plain client).
    pub join: bool,
    pub next_attempt: Instant,
    pub backoff: Duration,
}

/// Success/error tallies per command opcode.
#[derive(Debug, Default, Serialize, Clone)]
pub struct OpcodeStat {
    pub count: u64,
    pub errors: u64,
}

/// Node-wide statistics, surfaced through MONITOR_STAT and prometheus.
#[derive(Debug, Default)]
pub struct NodeStats {
    per_opcode: DashMap<&'static str, OpcodeStat>,
    pub connections_total: AtomicU64,
}

impl NodeStats {
    pub fn count_command(&self, opcode: &'static str, failed: bool) {
        let mut entry = self.per_opcode.entry(opcode).or_default();
        entry.count += 1;
        if failed {
            entry.errors += 1;
        }
    }

    pub fn snapshot(&self) -> HashMap<String, OpcodeStat> {
        self.per_opcode
            .iter()
            .map(|e| (e.key().to_string(), e.value().clone()))
            .collect()
    }
}

/// The central struct holding all shared, node-wide state. Wrapped in an
/// `Arc` and passed explicitly to every task and connection handler.
pub struct NodeState {
    pub config: Config,
    pub started_at: Instant,

    need_exit: Arc<AtomicBool>,
    /// Broadcast observed by every connection task and background loop.
    pub shutdown_tx: broadcast::Sender<()>,

    pub admission: Arc<AdmissionController>,
    pub pools: IoPools,
    pub backends: BackendRegistry,
    pub routes: RouteTable,

    /// Every live connection, by session id. A connection is reachable from
    /// here exactly while its reset has not run.
    pub connections: DashMap<u64, Arc<Connection>>,
    /// Session ids of connections this node dialed, for reuse by the client
    /// request path.
    pub outbound_index: DashMap<SocketAddr, u64>,

    next_session_id: AtomicU64,
    next_trans_id: AtomicU64,

    /// Peers to re-dial after a reset, with per-address backoff.
    pub reconnects: Mutex<HashMap<SocketAddr, ReconnectEntry>>,
    /// The address this node listens on, once bound.
    pub local_addr: RwLock<Option<SocketAddr>>,

    pub stats: NodeStats,
}

impl NodeState {
    /// Builds the shared state and its global pools. The pools spawn worker
    /// tasks, so this must run inside the runtime.
    pub fn initialize(config: Config) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let state = Arc::new(Self {
            started_at: Instant::now(),
            need_exit: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            admission: Arc::new(AdmissionController::new()),
            pools: IoPools::new(),
            backends: BackendRegistry::new(),
            routes: RouteTable::new(),
            connections: DashMap::new(),
            outbound_index: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            next_trans_id: AtomicU64::new(1),
            reconnects: Mutex::new(HashMap::new()),
            local_addr: RwLock::new(None),
            stats: NodeStats::default(),
            config,
        });

        state.pools.init_global(
            &state,
            state.config.io_thread_num,
            state.config.nonblocking_io_thread_num,
            state.config.queue_limit,
        );
        info!(
            "Node state initialized: {} blocking / {} non-blocking global workers",
            state.config.io_thread_num, state.config.nonblocking_io_thread_num
        );
        state
    }

    pub fn need_exit(&self) -> bool {
        self.need_exit.load(Ordering::Acquire)
    }

    /// The shared exit flag, cloned into every connection so parked
    /// producers can observe node shutdown without a reference cycle.
    pub(crate) fn need_exit_flag(&self) -> Arc<AtomicBool> {
        self.need_exit.clone()
    }

    /// Flags the node for exit and wakes everything that might be parked.
    pub fn set_need_exit(&self) {
        if !self.need_exit.swap(true, Ordering::AcqRel) {
            let _ = self.shutdown_tx.send(());
            self.admission.wake();
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn next_trans_id(&self) -> u64 {
        self.next_trans_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.config.wait_timeout)
    }

    /// Records a lost peer for the reconnector, preserving whether it was a
    /// joined-cluster peer. Fresh records start with a one-second backoff.
    pub fn record_reconnect(&self, addr: SocketAddr, join: bool) {
        let mut reconnects = self.reconnects.lock();
        let entry = reconnects.entry(addr).or_insert_with(|| ReconnectEntry {
            join,
            next_attempt: Instant::now(),
            backoff: Duration::from_secs(1),
        });
        entry.join |= join;
    }

    /// Pulls up to `batch` due addresses out of the reconnect set. Callers
    /// re-record failures with doubled backoff.
    pub fn take_due_reconnects(&self, batch: usize, now: Instant) -> Vec<(SocketAddr, ReconnectEntry)> {
        let mut reconnects = self.reconnects.lock();
        let due: Vec<SocketAddr> = reconnects
            .iter()
            .filter(|(_, e)| e.next_attempt <= now)
            .map(|(addr, _)| *addr)
            .take(batch)
            .collect();
        due.into_iter()
            .filter_map(|addr| reconnects.remove(&addr).map(|e| (addr, e)))
            .collect()
    }

    /// JSON statistics snapshot served by MONITOR_STAT.
    pub fn monitor_snapshot(&self) -> serde_json::Value {
        let (queued, workers) = self.pools.aggregate();
        serde_json::json!({
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "connections": self.connections.len(),
            "connections_total": self.stats.connections_total.load(Ordering::Relaxed),
            "io": {
                "queued": queued,
                "workers": workers,
                "blocked": self.admission.is_blocked(),
            },
            "backends": self.backends.ids(),
            "routes": self.routes.len(),
            "commands": self.stats.snapshot(),
        })
    }
}
