// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;

mod connection_loop;
mod context;
mod initialization;
mod metrics_server;
mod spawner;

pub use connection_loop::{run_accept_loop, shutdown_node};
pub use context::ServerContext;
pub use initialization::setup;
pub use spawner::spawn_all;

/// The main node startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Initialize node state, pools and the listener.
    let mut server_context = initialization::setup(config).await?;

    // 2. Spawn all background tasks.
    spawner::spawn_all(&mut server_context).await?;

    // 3. Start the accept loop. This function runs until shutdown.
    connection_loop::run(server_context).await;

    Ok(())
}
