// src/core/admission.rs

//! Global admission control: the receive paths stop reading when the
//! aggregate queued work outgrows the worker population, which exerts
//! TCP-level backpressure on peers.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::info;

/// Queued requests tolerated per worker before receives are suspended.
pub const QUEUE_FACTOR: u64 = 1000;

/// Aggregate queued-request and worker counters across every pool, plus the
/// wakeup used to unpark suspended receive paths.
#[derive(Debug, Default)]
pub struct AdmissionController {
    queued: AtomicU64,
    workers: AtomicU64,
    blocked: AtomicBool,
    notify: Notify,
    last_suspend_log: Mutex<Option<Instant>>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Default::default()
    }

    /// Admission predicate: queued work must not exceed `workers * QUEUE_FACTOR`.
    pub fn allows(&self) -> bool {
        self.queued.load(Ordering::Acquire) <= self.workers.load(Ordering::Acquire) * QUEUE_FACTOR
    }

    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Acquire)
    }

    pub fn workers(&self) -> u64 {
        self.workers.load(Ordering::Acquire)
    }

    /// True while at least one receive path is parked on this controller.
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub fn on_enqueue(&self) {
        self.queued.fetch_add(1, Ordering::AcqRel);
    }

    pub fn on_dequeue(&self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn add_workers(&self, n: u64) {
        self.workers.fetch_add(n, Ordering::AcqRel);
    }

    pub fn remove_workers(&self, n: u64) {
        self.workers.fetch_sub(n, Ordering::AcqRel);
    }

    /// Wakes parked receive paths. Broadcast whenever a worker completes a
    /// request or a send completes, the two events that can re-open admission.
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Parks until the admission predicate holds again or `need_exit`
    /// reports shutdown. Waits are bounded to one second, and the
    /// suspension is logged at most once per second.
    pub async fn wait_until_open(&self, need_exit: impl Fn() -> bool) {
        if self.allows() {
            return;
        }

        self.blocked.store(true, Ordering::Release);
        while !need_exit() && !self.allows() {
            self.log_suspension();
            let notified = self.notify.notified();
            if self.allows() {
                break;
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), notified).await;
        }
        self.blocked.store(false, Ordering::Release);
    }

    fn log_suspension(&self) {
        let mut last = self.last_suspend_log.lock();
        let due = match *last {
            Some(t) => t.elapsed() >= Duration::from_secs(1),
            None => true,
        };
        if due {
            info!(
                queued = self.queued(),
                workers = self.workers(),
                "Net pool is suspended because io pool queues are full"
            );
            *last = Some(Instant::now());
        }
    }
}
