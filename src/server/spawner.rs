// src/server/spawner.rs

//! Spawns all of the node's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use crate::core::session::Session;
use crate::core::tasks::reconnector::Reconnector;
use crate::core::tasks::timeout_sweeper::TimeoutSweeper;
use anyhow::Result;
use tracing::{info, warn};

/// Spawns all critical background tasks into the context's JoinSet.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let state = &ctx.state;

    // --- Metrics Server ---
    if state.config.metrics.enabled {
        let metrics_state = state.clone();
        let shutdown_rx = state.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_state, shutdown_rx).await;
            Ok(())
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    // --- Transaction timeout sweeper ---
    let sweeper = TimeoutSweeper::new(state.clone());
    let shutdown_rx_sweep = state.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        sweeper.run(shutdown_rx_sweep).await;
        Ok(())
    });

    // --- Peer reconnector ---
    let reconnector = Reconnector::new(state.clone());
    let shutdown_rx_reconnect = state.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        reconnector.run(shutdown_rx_reconnect).await;
        Ok(())
    });

    // --- Initial remotes ---
    if !state.config.remotes.is_empty() {
        let dial_state = state.clone();
        ctx.background_tasks.spawn(async move {
            let session = Session::new(dial_state.clone());
            for remote in &dial_state.config.remotes {
                let addrs = match tokio::net::lookup_host(remote.as_str()).await {
                    Ok(addrs) => addrs,
                    Err(e) => {
                        warn!(remote = %remote, error = %e, "Failed to resolve remote address");
                        continue;
                    }
                };
                for addr in addrs {
                    match session.connect(addr).await {
                        Ok(_) => {
                            match session.fetch_route_list(addr).await {
                                Ok(entries) => dial_state.routes.merge(&entries),
                                Err(e) => warn!(%addr, error = %e, "Route list download failed"),
                            }
                            if dial_state.config.join {
                                if let Err(e) = session.join(addr).await {
                                    warn!(%addr, error = %e, "Join announcement failed");
                                }
                            }
                            break;
                        }
                        Err(e) => {
                            warn!(%addr, error = %e, "Failed to connect to remote, recording for reconnect");
                            dial_state.record_reconnect(addr, dial_state.config.join);
                        }
                    }
                }
            }
            Ok(())
        });
    }

    info!("All background tasks have been spawned.");
    Ok(())
}
