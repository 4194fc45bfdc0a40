// src/server/context.rs

use crate::core::state::NodeState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

/// Holds all the initialized state required to run the node's main loop.
pub struct ServerContext {
    pub state: Arc<NodeState>,
    pub listener: TcpListener,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
}
