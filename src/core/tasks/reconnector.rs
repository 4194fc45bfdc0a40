// src/core/tasks/reconnector.rs

//! Re-dials peers lost to resets. Each sweep takes a bounded, shuffled
//! batch out of the reconnect set; failures go back with doubled backoff.

use crate::core::session::Session;
use crate::core::state::{NodeState, ReconnectEntry};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Backoff ceiling between attempts for one address.
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);

pub struct Reconnector {
    state: Arc<NodeState>,
}

impl Reconnector {
    pub fn new(state: Arc<NodeState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = Duration::from_secs(self.state.config.check_timeout.max(1));
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reconnect_batch().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Reconnector shutting down.");
                    return;
                }
            }
        }
    }

    async fn reconnect_batch(&self) {
        let mut batch = self
            .state
            .take_due_reconnects(self.state.config.reconnect_batch_size, Instant::now());
        if batch.is_empty() {
            return;
        }
        batch.shuffle(&mut rand::rng());

        let session = Session::new(self.state.clone());
        for (addr, entry) in batch {
            if self.state.need_exit() {
                return;
            }
            match session.connect(addr).await {
                Ok(_conn) => {
                    debug!(%addr, join = entry.join, "reconnected to peer");
                    if entry.join {
                        match session.fetch_route_list(addr).await {
                            Ok(entries) => self.state.routes.merge(&entries),
                            Err(e) => {
                                warn!(%addr, error = %e, "route list refresh after reconnect failed");
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(%addr, error = %e, "reconnect attempt failed");
                    let backoff = (entry.backoff * 2).min(RECONNECT_BACKOFF_MAX);
                    let mut reconnects = self.state.reconnects.lock();
                    reconnects.insert(
                        addr,
                        ReconnectEntry {
                            join: entry.join,
                            next_attempt: Instant::now() + backoff,
                            backoff,
                        },
                    );
                }
            }
        }
    }
}
