// src/server/connection_loop.rs

//! Contains the accept loop, signal handling for the standalone binary, and
//! the ordered node shutdown sequence.

use super::context::ServerContext;
use crate::connection::{ConnKind, Connection};
use crate::core::protocol::status;
use crate::core::state::NodeState;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

// Platform-specific signal handling imports
#[cfg(windows)]
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Waits for a shutdown signal based on the operating system.
/// On Unix, it listens for SIGINT and SIGTERM.
/// On Windows, it listens for Ctrl+C.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");

    #[cfg(windows)]
    let mut ctrl_c = signal::ctrl_c().expect("Failed to create Ctrl+C stream");

    tokio::select! {
        _ = async { #[cfg(unix)] { sigint.recv().await; info!("SIGINT received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(unix)] { sigterm.recv().await; info!("SIGTERM received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(windows)] { ctrl_c.await; info!("Ctrl-C received, initiating graceful shutdown."); } } => {},
    }
}

/// The accept loop: admits new peers into the global connection set until
/// shutdown. Used both by the standalone binary and by embedders.
pub async fn run_accept_loop(state: Arc<NodeState>, listener: TcpListener) {
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            res = listener.accept() => {
                if !handle_accept(&state, res) {
                    break;
                }
            }
        }
    }
    info!("Accept loop finished.");
}

/// Admits one accepted socket. Returns false on a fatal listener error.
fn handle_accept(
    state: &Arc<NodeState>,
    res: std::io::Result<(TcpStream, std::net::SocketAddr)>,
) -> bool {
    match res {
        Ok((socket, addr)) => {
            match Connection::spawn(state, socket, ConnKind::Accepted) {
                Ok(conn) => {
                    info!(
                        session = conn.session_id,
                        addr = %conn.addr,
                        "Accepted new connection"
                    );
                }
                Err(e) => warn!(%addr, error = %e, "Failed to set up accepted connection"),
            }
            true
        }
        Err(e) => {
            if is_retriable_accept_error(&e) {
                warn!("Failed to accept new client, retrying: {}", e);
                true
            } else {
                error!("FATAL: Can't recover from accept error: {}", e);
                state.set_need_exit();
                false
            }
        }
    }
}

/// Resource exhaustion on accept is survivable; the listener keeps going.
fn is_retriable_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
    ) || matches!(e.raw_os_error(), Some(os) if os == 24 || os == 23 || os == 12 || os == 105)
}

/// Ordered node shutdown: flag every loop, stop the pools, then reset every
/// connection still in the global set. Outstanding transactions complete
/// with a shutdown error and DESTROY.
pub async fn shutdown_node(state: &Arc<NodeState>) {
    state.set_need_exit();

    let leftovers = state.pools.stop_all().await;
    if !leftovers.is_empty() {
        info!(
            "Dropped {} queued requests during pool shutdown",
            leftovers.len()
        );
    }
    drop(leftovers);
    info!("All work pools stopped.");

    let connections: Vec<_> = state
        .connections
        .iter()
        .map(|e| e.value().clone())
        .collect();
    for conn in connections {
        conn.reset(state, -status::ESHUTDOWN);
    }
    info!("All connections reset.");
}

/// The main loop of the standalone binary: accept until a signal arrives,
/// then run the graceful shutdown sequence.
pub async fn run(mut ctx: ServerContext) {
    let state = ctx.state.clone();
    let accept_task = tokio::spawn(run_accept_loop(state.clone(), ctx.listener));

    loop {
        tokio::select! {
            biased;

            _ = await_shutdown_signal() => {
                break;
            },

            // Monitor background tasks for unexpected termination.
            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => info!("A background task has completed."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },
        }
    }

    info!("Shutting down. Sending signal to all tasks.");
    shutdown_node(&state).await;
    let _ = accept_task.await;

    if tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    }
    info!("Node shutdown complete.");
}
