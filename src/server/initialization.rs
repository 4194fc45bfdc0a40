// src/server/initialization.rs

//! Handles node initialization: configuration validation, shared state and
//! pool construction, and binding the listening socket.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::state::NodeState;
use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::info;

/// Initializes all node components before starting the accept loop.
pub async fn setup(config: Config) -> Result<ServerContext> {
    config.validate()?;
    log_startup_info(&config);

    let state = NodeState::initialize(config);

    let bind_addr = (state.config.host.as_str(), state.config.port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}:{}", state.config.host, state.config.port))?;
    let local_addr = listener.local_addr()?;
    *state.local_addr.write() = Some(local_addr);
    info!("Node listening on {}", local_addr);

    Ok(ServerContext {
        state,
        listener,
        background_tasks: JoinSet::new(),
    })
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        "Node configured with {} net threads, {} blocking / {} non-blocking io threads",
        config.net_thread_num, config.io_thread_num, config.nonblocking_io_thread_num
    );
    info!(
        "Timeouts: wait {}s, check {}s, queue {}s; stall count {}; send limit {}",
        config.wait_timeout,
        config.check_timeout,
        config.queue_timeout,
        config.stall_count,
        config.send_limit
    );
    if config.queue_limit > 0 {
        info!("Pool queues bounded at {} requests", config.queue_limit);
    }
    if config.join {
        info!("Node will join the cluster as a storage peer");
    }
}
