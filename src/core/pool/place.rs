// src/core/pool/place.rs

//! Pool places: swappable slots holding the current work pool for a
//! (backend, class) pair, plus the two global slots for backendless work.

use super::{PoolMode, WorkPool};
use crate::core::state::NodeState;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// A guarded slot holding the current pool for one (backend, class). Pools
/// can be swapped atomically, which is what makes graceful backend reload
/// possible while the dispatcher keeps running.
#[derive(Default)]
pub struct PoolPlace {
    pool: RwLock<Option<Arc<WorkPool>>>,
}

impl PoolPlace {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self) -> Option<Arc<WorkPool>> {
        self.pool.read().clone()
    }

    pub fn install(&self, pool: Arc<WorkPool>) -> Option<Arc<WorkPool>> {
        self.pool.write().replace(pool)
    }

    pub fn take(&self) -> Option<Arc<WorkPool>> {
        self.pool.write().take()
    }
}

/// The blocking and non-blocking places of one backend (or of the node
/// itself, for the global slot).
#[derive(Default)]
pub struct PoolPair {
    pub blocking: PoolPlace,
    pub nonblocking: PoolPlace,
}

impl PoolPair {
    fn place(&self, nonblocking: bool) -> &PoolPlace {
        if nonblocking {
            &self.nonblocking
        } else {
            &self.blocking
        }
    }
}

/// The dispatch table from backend id to pool places. Backend id `-1`
/// addresses the global pair serving backendless commands.
#[derive(Default)]
pub struct IoPools {
    global: PoolPair,
    backends: DashMap<i32, Arc<PoolPair>>,
}

impl IoPools {
    pub fn new() -> Self {
        Default::default()
    }

    /// Resolves the pool currently installed for `(backend_id, class)`.
    /// `-1` selects the global slot.
    pub fn place(&self, backend_id: i32, nonblocking: bool) -> Option<Arc<WorkPool>> {
        if backend_id < 0 {
            self.global.place(nonblocking).get()
        } else {
            self.backends
                .get(&backend_id)
                .and_then(|pair| pair.place(nonblocking).get())
        }
    }

    /// Allocates and installs the two global pools. Called once at node init.
    pub fn init_global(
        &self,
        state: &Arc<NodeState>,
        io_workers: usize,
        nonblocking_workers: usize,
        queue_limit: usize,
    ) {
        let blocking = WorkPool::alloc(
            "sys",
            PoolMode::Blocking,
            queue_limit,
            state.admission.clone(),
        );
        blocking.grow(state, io_workers);
        self.global.blocking.install(blocking);

        let nonblocking = WorkPool::alloc(
            "sys",
            PoolMode::NonBlocking,
            queue_limit,
            state.admission.clone(),
        );
        nonblocking.grow(state, nonblocking_workers);
        self.global.nonblocking.install(nonblocking);
    }

    /// Creates the pool pair for a newly attached backend.
    pub fn attach_backend(
        &self,
        state: &Arc<NodeState>,
        backend_id: i32,
        io_workers: usize,
        nonblocking_workers: usize,
        queue_limit: usize,
    ) {
        let pair = Arc::new(PoolPair::default());
        let pool_id = backend_id.to_string();

        let blocking = WorkPool::alloc(
            pool_id.clone(),
            PoolMode::Blocking,
            queue_limit,
            state.admission.clone(),
        );
        blocking.grow(state, io_workers);
        pair.blocking.install(blocking);

        let nonblocking = WorkPool::alloc(
            pool_id,
            PoolMode::NonBlocking,
            queue_limit,
            state.admission.clone(),
        );
        nonblocking.grow(state, nonblocking_workers);
        pair.nonblocking.install(nonblocking);

        self.backends.insert(backend_id, pair);
        info!("Attached pool pair for backend {}", backend_id);
    }

    /// Removes a backend's pool pair, returning the undrained requests of
    /// both pools so the caller can fail them toward their peers.
    pub async fn detach_backend(&self, backend_id: i32) -> Vec<crate::core::request::IoRequest> {
        let mut leftovers = Vec::new();
        if let Some((_, pair)) = self.backends.remove(&backend_id) {
            for place in [&pair.blocking, &pair.nonblocking] {
                if let Some(pool) = place.take() {
                    leftovers.extend(pool.stop().await);
                }
            }
            info!("Detached pool pair for backend {}", backend_id);
        }
        leftovers
    }

    /// Aggregate queued-request and worker counts across every installed
    /// pool, used by monitoring snapshots.
    pub fn aggregate(&self) -> (u64, u64) {
        let mut queued = 0u64;
        let mut workers = 0u64;
        let mut count = |pool: Option<Arc<WorkPool>>| {
            if let Some(p) = pool {
                queued += p.queue_len() as u64;
                workers += p.worker_count() as u64;
            }
        };
        count(self.global.blocking.get());
        count(self.global.nonblocking.get());
        for pair in self.backends.iter() {
            count(pair.blocking.get());
            count(pair.nonblocking.get());
        }
        (queued, workers)
    }

    /// Lists every installed pool, global pair first.
    pub fn all_pools(&self) -> Vec<Arc<WorkPool>> {
        let mut pools = Vec::new();
        if let Some(p) = self.global.blocking.get() {
            pools.push(p);
        }
        if let Some(p) = self.global.nonblocking.get() {
            pools.push(p);
        }
        for pair in self.backends.iter() {
            if let Some(p) = pair.blocking.get() {
                pools.push(p);
            }
            if let Some(p) = pair.nonblocking.get() {
                pools.push(p);
            }
        }
        pools
    }

    pub fn backend_ids(&self) -> Vec<i32> {
        self.backends.iter().map(|e| *e.key()).collect()
    }

    /// Stops every pool in shutdown order: backend pools first, then the
    /// global non-blocking pool, then the global blocking pool.
    pub async fn stop_all(&self) -> Vec<crate::core::request::IoRequest> {
        let mut leftovers = Vec::new();
        for backend_id in self.backend_ids() {
            leftovers.extend(self.detach_backend(backend_id).await);
        }
        if let Some(pool) = self.global.nonblocking.take() {
            leftovers.extend(pool.stop().await);
        }
        if let Some(pool) = self.global.blocking.take() {
            leftovers.extend(pool.stop().await);
        }
        leftovers
    }
}
