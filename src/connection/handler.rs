// src/connection/handler.rs

//! The connection reader task: framed receive, admission gating, reply
//! demux and hand-off to the dispatcher. Frames are delivered to the
//! dispatcher in receive order.

use super::guard::ConnectionGuard;
use super::state::Connection;
use crate::core::dispatch;
use crate::core::protocol::{CommandFlags, FrameCodec, codec::DecodedFrame, status};
use crate::core::request::IoRequest;
use crate::core::state::NodeState;
use crate::core::NodeError;
use futures::StreamExt;
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

pub(super) async fn run_reader(
    state: Arc<NodeState>,
    conn: Arc<Connection>,
    read_half: OwnedReadHalf,
) {
    let mut guard = ConnectionGuard::new(state.clone(), conn.clone());
    let mut framed = FramedRead::new(
        read_half,
        FrameCodec::new(state.config.max_payload_size),
    );
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    'main: loop {
        if conn.is_closed() {
            guard.set_status(conn.exit_status());
            break;
        }

        // A receive is serviced only if the admission controller permits it;
        // denied readers park, which pushes backpressure onto the peer's TCP
        // window. Send-side work is never gated.
        if !state.admission.allows() {
            let conn = conn.clone();
            let state_ref = state.clone();
            state
                .admission
                .wait_until_open(move || state_ref.need_exit() || conn.is_closed())
                .await;
            continue;
        }

        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!(session = conn.session_id, "reader received shutdown signal");
                guard.set_status(-status::ESHUTDOWN);
                break 'main;
            }
            next = framed.next() => match next {
                Some(Ok(decoded)) => {
                    if let Err(e) = process_frame(&state, &conn, decoded).await {
                        warn!(
                            session = conn.session_id,
                            addr = %conn.addr,
                            error = %e,
                            "frame processing failed, resetting connection"
                        );
                        guard.set_status(e.wire_status());
                        break 'main;
                    }
                }
                Some(Err(e)) => {
                    if is_normal_disconnect(&e) {
                        debug!(session = conn.session_id, addr = %conn.addr, "peer disconnected: {e}");
                    } else {
                        warn!(session = conn.session_id, addr = %conn.addr, "receive error: {e}");
                    }
                    guard.set_status(e.wire_status());
                    break 'main;
                }
                None => {
                    debug!(session = conn.session_id, addr = %conn.addr, "peer closed the connection");
                    guard.set_status(-status::ECONNRESET);
                    break 'main;
                }
            }
        }
    }
}

/// Transaction-side demux plus dispatch. Runs on the reader, so frames of
/// one connection reach the dispatcher in receive order.
async fn process_frame(
    state: &Arc<NodeState>,
    conn: &Arc<Connection>,
    decoded: DecodedFrame,
) -> Result<(), NodeError> {
    let header = decoded.frame.header;

    debug!(
        session = conn.session_id,
        cmd = header.opcode.name(),
        size = header.size,
        trans = header.trans_id,
        flags = ?header.flags,
        status = header.status,
        recv_time_us = decoded.recv_time.as_micros() as u64,
        "RECV"
    );

    if header.flags.contains(CommandFlags::REPLY) {
        // Refresh the transaction and pull it off the timer index so the
        // sweeper cannot complete it underneath us, then deliver. Completing
        // replies here keeps them in receive order for their transaction.
        if !conn.transactions.match_reply(header.trans_id, header.size) {
            warn!(
                session = conn.session_id,
                trans = header.trans_id,
                cmd = header.opcode.name(),
                "dropping stray reply for unknown transaction"
            );
            return Ok(());
        }
        conn.clear_stall();
        conn.transactions
            .complete_reply(&header, &decoded.frame.payload);
        return Ok(());
    }

    let req = IoRequest::from_frame(decoded.frame, conn.clone(), decoded.recv_time);
    dispatch::schedule_io(state, req).await
}

/// Disconnects that are part of normal peer churn and only worth a debug line.
fn is_normal_disconnect(e: &NodeError) -> bool {
    matches!(e, NodeError::Io(arc_err) if matches!(
        arc_err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionAborted
    ))
}
