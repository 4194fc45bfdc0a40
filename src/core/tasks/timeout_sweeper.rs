// src/core/tasks/timeout_sweeper.rs

//! Walks every connection's timer index once per second and completes
//! expired transactions with a timeout status. Connections accumulating
//! timeouts past the stall count are reset outright.

use crate::core::metrics;
use crate::core::protocol::status;
use crate::core::state::NodeState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

pub struct TimeoutSweeper {
    state: Arc<NodeState>,
}

impl TimeoutSweeper {
    pub fn new(state: Arc<NodeState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let stall_count = self.state.config.stall_count;
        let mut interval = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once(stall_count);
                }
                _ = shutdown_rx.recv() => {
                    info!("Timeout sweeper shutting down.");
                    return;
                }
            }
        }
    }

    fn sweep_once(&self, stall_count: u32) {
        let now = Instant::now();
        let connections: Vec<_> = self
            .state
            .connections
            .iter()
            .map(|e| e.value().clone())
            .collect();

        for conn in connections {
            let expired = conn.transactions.sweep(now);
            if expired == 0 {
                continue;
            }
            metrics::TRANSACTIONS_TIMED_OUT_TOTAL.inc_by(expired as u64);

            let stalled = conn.note_timeouts(expired);
            if stall_count > 0 && stalled >= stall_count {
                warn!(
                    session = conn.session_id,
                    addr = %conn.addr,
                    stalled,
                    "connection stalled past the stall count, resetting"
                );
                conn.reset(&self.state, -status::ETIMEDOUT);
            }
        }
    }
}
