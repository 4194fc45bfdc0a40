// src/core/pool/mod.rs

//! Work pools: sets of worker tasks consuming a shared request queue. One
//! pool exists per (backend, service class) plus two global pools for
//! commands that do not touch a backend.

mod place;
mod queue;

pub use place::{IoPools, PoolPair, PoolPlace};
pub use queue::RequestQueue;

use crate::core::admission::AdmissionController;
use crate::core::request::IoRequest;
use crate::core::state::NodeState;
use crate::core::{handler, metrics};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// The service discipline of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Strict FIFO; commands here may block on storage.
    Blocking,
    /// Strict FIFO; commands here must never block, which keeps recursive
    /// reverse commands from deadlocking a blocking handler.
    NonBlocking,
    /// Non-blocking reverse discipline, favoring the freshest recursive work.
    Lifo,
}

impl PoolMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PoolMode::Blocking => "BLOCKING",
            PoolMode::NonBlocking => "NONBLOCKING",
            PoolMode::Lifo => "LIFO",
        }
    }

    /// Lowercase marker used in per-pool statistic ids.
    pub fn stat_marker(self) -> &'static str {
        match self {
            PoolMode::Blocking => "blocking",
            PoolMode::NonBlocking => "nonblocking",
            PoolMode::Lifo => "lifo",
        }
    }

    pub fn is_nonblocking(self) -> bool {
        matches!(self, PoolMode::NonBlocking | PoolMode::Lifo)
    }
}

struct Worker {
    handle: Option<JoinHandle<()>>,
}

/// A pool of worker tasks plus its request queue. Workers run exactly while
/// the exit flag is clear; the queue bound, if set, makes producers fail
/// fast instead of blocking.
pub struct WorkPool {
    pool_id: String,
    mode: PoolMode,
    need_exit: AtomicBool,
    queue: Mutex<RequestQueue<IoRequest>>,
    queue_notify: Notify,
    workers: Mutex<Vec<Worker>>,
    admission: Arc<AdmissionController>,
}

impl WorkPool {
    pub fn alloc(
        pool_id: impl Into<String>,
        mode: PoolMode,
        queue_limit: usize,
        admission: Arc<AdmissionController>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool_id: pool_id.into(),
            mode,
            need_exit: AtomicBool::new(false),
            queue: Mutex::new(RequestQueue::new(queue_limit)),
            queue_notify: Notify::new(),
            workers: Mutex::new(Vec::new()),
            admission,
        })
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// Per-pool statistic id, `<pool>.<mode>`.
    pub fn stat_id(&self) -> String {
        format!("{}.{}", self.pool_id, self.mode.stat_marker())
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn need_exit(&self) -> bool {
        self.need_exit.load(Ordering::Acquire)
    }

    /// Adds `num` workers under the pool lock.
    pub fn grow(self: &Arc<Self>, state: &Arc<NodeState>, num: usize) {
        let mut workers = self.workers.lock();
        let before = workers.len();
        for index in 0..num {
            let pool = Arc::clone(self);
            let state = Arc::clone(state);
            let handle = tokio::spawn(run_worker(pool, state, before + index));
            workers.push(Worker {
                handle: Some(handle),
            });
        }
        self.admission.add_workers(num as u64);
        info!(
            "Grew {} pool '{}' by: {} -> {} workers",
            self.mode.as_str(),
            self.pool_id,
            before,
            before + num
        );
    }

    /// Enqueues a request under the pool's discipline. A full bounded queue
    /// hands the request back so the dispatcher can answer the peer.
    pub fn push(&self, req: IoRequest) -> Result<(), IoRequest> {
        if self.need_exit() {
            return Err(req);
        }
        {
            let mut queue = self.queue.lock();
            queue.push(req)?;
            metrics::INPUT_QUEUE_SIZE.inc();
        }
        self.admission.on_enqueue();
        self.queue_notify.notify_one();
        Ok(())
    }

    fn take_next(&self) -> Option<IoRequest> {
        let req = self.queue.lock().pop(self.mode);
        if req.is_some() {
            metrics::INPUT_QUEUE_SIZE.dec();
            self.admission.on_dequeue();
        }
        req
    }

    /// Flags every worker to exit and wakes them. Idempotent.
    pub fn begin_shutdown(&self) {
        self.need_exit.store(true, Ordering::Release);
        self.queue_notify.notify_waiters();
    }

    /// Joins every worker that has not been joined yet. Idempotent under
    /// partial failures: each worker is joined at most once.
    pub async fn join_workers(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock();
            workers.iter_mut().filter_map(|w| w.handle.take()).collect()
        };
        let joined = handles.len();
        for handle in handles {
            let _ = handle.await;
        }
        if joined > 0 {
            self.admission.remove_workers(joined as u64);
            debug!("Joined {} workers of pool '{}'", joined, self.stat_id());
        }
    }

    /// Empties the queue, handing the remaining requests to the caller for
    /// completion. Used on pool cleanup after the workers have exited.
    pub fn drain(&self) -> Vec<IoRequest> {
        let drained = self.queue.lock().drain();
        for _ in &drained {
            metrics::INPUT_QUEUE_SIZE.dec();
            self.admission.on_dequeue();
        }
        drained
    }

    /// Full stop: flag, join, drain. The drained requests are returned so
    /// the caller can fail them toward their peers.
    pub async fn stop(&self) -> Vec<IoRequest> {
        self.begin_shutdown();
        self.join_workers().await;
        self.drain()
    }
}

/// The worker loop: pop per discipline, account queue-wait time, process,
/// release. The exit flags are observed between requests.
async fn run_worker(pool: Arc<WorkPool>, state: Arc<NodeState>, index: usize) {
    let stat_id = pool.stat_id();
    debug!(pool = %stat_id, index, "started io worker");

    loop {
        if state.need_exit() || pool.need_exit() {
            break;
        }

        match pool.take_next() {
            Some(req) => {
                // Popping freed a queue slot: suspended receive paths may resume.
                state.admission.wake();

                let queue_time = req.queue_time();
                metrics::QUEUE_WAIT_SECONDS.observe(queue_time.as_secs_f64());

                handler::process(&state, &pool, req, queue_time).await;

                metrics::COMMANDS_PROCESSED_TOTAL.inc();
                state.admission.wake();
            }
            None => {
                let notified = pool.queue_notify.notified();
                if pool.need_exit() || state.need_exit() {
                    break;
                }
                let _ = tokio::time::timeout(Duration::from_secs(1), notified).await;
            }
        }
    }

    debug!(pool = %stat_id, index, "finished io worker");
}
