// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard that guarantees a connection is
//! reset no matter how its reader task exits.

use super::state::Connection;
use crate::core::protocol::status;
use crate::core::state::NodeState;
use std::sync::Arc;

/// Held by the reader task for the lifetime of its loop. Dropping it runs
/// the reset path with the recorded status, so panics and early returns
/// cannot leak a connection out of the global set.
pub struct ConnectionGuard {
    state: Arc<NodeState>,
    conn: Arc<Connection>,
    wire_status: i32,
}

impl ConnectionGuard {
    pub(crate) fn new(state: Arc<NodeState>, conn: Arc<Connection>) -> Self {
        Self {
            state,
            conn,
            wire_status: -status::ECONNRESET,
        }
    }

    /// Records the status the eventual reset will carry.
    pub(crate) fn set_status(&mut self, wire_status: i32) {
        self.wire_status = wire_status;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.conn.reset(&self.state, self.wire_status);
    }
}
