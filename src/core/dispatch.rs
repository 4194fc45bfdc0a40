// src/core/dispatch.rs

//! The dispatcher: classifies a parsed request into (backend, service
//! class), stamps the routing decision into the header and pushes the
//! request into the matching work pool. The dispatcher is the only producer
//! to a pool; workers are the only consumers.

use crate::core::metrics;
use crate::core::protocol::{CommandFlags, status};
use crate::core::request::{IoRequest, OutboundFrame, Payload};
use crate::core::state::NodeState;
use crate::core::NodeError;
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes one request into a pool. Replies never come through here; they
/// complete on the receive path. Full bounded queues answer the peer with a
/// retriable failure instead of resetting anything.
pub async fn schedule_io(state: &Arc<NodeState>, mut req: IoRequest) -> Result<(), NodeError> {
    let nonblocking = req.header.flags.contains(CommandFlags::NOLOCK);

    let backend_id: i32 = if req.header.flags.contains(CommandFlags::DIRECT_BACKEND) {
        req.header.backend_id
    } else if req.header.opcode.is_backendless() {
        -1
    } else {
        state.routes.lookup(&req.header.key).unwrap_or(-1)
    };

    // Stamp the request with the resolved backend so replies route back to
    // the same place on the peer.
    req.header.backend_id = backend_id;

    let pool = state
        .pools
        .place(backend_id, nonblocking)
        .or_else(|| state.pools.place(-1, nonblocking))
        .ok_or(NodeError::Shutdown)?;

    debug!(
        session = req.conn.session_id,
        cmd = req.header.opcode.name(),
        trans = req.header.trans_id,
        backend = backend_id,
        pool = %pool.stat_id(),
        nonblocking,
        "scheduling io"
    );

    match pool.push(req) {
        Ok(()) => Ok(()),
        Err(rejected) => {
            metrics::REQUESTS_REJECTED_TOTAL.inc();
            warn!(
                session = rejected.conn.session_id,
                cmd = rejected.header.opcode.name(),
                trans = rejected.header.trans_id,
                pool = %pool.stat_id(),
                "pool queue overloaded, rejecting request"
            );
            let mut header = rejected.header;
            header.flags = (header.flags & CommandFlags::NOLOCK)
                | CommandFlags::REPLY
                | CommandFlags::DESTROY;
            header.status = -status::ENOBUFS;
            let conn = rejected.conn.clone();
            drop(rejected);
            conn.enqueue_send(OutboundFrame::new(header, Payload::Empty))
                .await
        }
    }
}
