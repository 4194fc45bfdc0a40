// src/node.rs

//! The embedder surface: construct a node, attach backends, add remotes,
//! issue client requests and destroy it. The standalone binary is a thin
//! wrapper that adds signal handling on top of this.

use crate::config::Config;
use crate::core::backend::Backend;
use crate::core::routing::RouteEntry;
use crate::core::session::Session;
use crate::core::state::NodeState;
use crate::core::NodeError;
use crate::server;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::warn;

/// A running node. Dropping it does not stop anything; call [`Node::shutdown`]
/// for the ordered teardown.
pub struct Node {
    state: Arc<NodeState>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    background_tasks: JoinSet<Result<(), anyhow::Error>>,
}

impl Node {
    /// Builds the node state and pools, binds the listener and spawns the
    /// accept loop plus background tasks.
    pub async fn start(config: Config) -> Result<Node> {
        let mut ctx = server::setup(config).await?;
        server::spawn_all(&mut ctx).await?;

        let local_addr = ctx.listener.local_addr()?;
        let state = ctx.state.clone();
        let accept_task = tokio::spawn(server::run_accept_loop(state.clone(), ctx.listener));

        Ok(Node {
            state,
            local_addr,
            accept_task,
            background_tasks: ctx.background_tasks,
        })
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A fresh client session over this node's state.
    pub fn session(&self) -> Session {
        Session::new(self.state.clone())
    }

    /// Plugs a storage engine into the node: registers it, creates its pool
    /// pair and claims the given identifier-space prefixes in the route
    /// table.
    pub fn attach_backend(
        &self,
        backend_id: i32,
        backend: Arc<dyn Backend>,
        route_prefixes: &[u64],
    ) {
        self.state.backends.attach(backend_id, backend);
        self.state.pools.attach_backend(
            &self.state,
            backend_id,
            self.state.config.io_thread_num,
            self.state.config.nonblocking_io_thread_num,
            self.state.config.queue_limit,
        );
        for &prefix in route_prefixes {
            self.state.routes.insert(RouteEntry { prefix, backend_id });
        }
    }

    /// Connects to a remote node, downloads its route table and, when this
    /// node is a joined storage peer, announces our backends.
    pub async fn add_remote(&self, addr: SocketAddr) -> Result<(), NodeError> {
        let session = self.session();
        session.connect(addr).await?;
        let entries = session.fetch_route_list(addr).await?;
        self.state.routes.merge(&entries);
        if self.state.config.join {
            session.join(addr).await?;
        }
        Ok(())
    }

    /// The ordered teardown: pools stop and drain, every connection resets
    /// with a shutdown error, background tasks join.
    pub async fn shutdown(mut self) {
        server::shutdown_node(&self.state).await;
        let _ = self.accept_task.await;

        if tokio::time::timeout(Duration::from_secs(10), async {
            while self.background_tasks.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("Timed out waiting for background tasks during node shutdown.");
        }
    }
}
