// src/connection/writer.rs

//! The connection writer task: drains the send queue in enqueue order,
//! streams file-region payloads, applies the fairness cap and feeds the
//! watermark and admission wakeups.

use super::state::Connection;
use crate::core::request::Payload;
use crate::core::state::NodeState;
use crate::core::NodeError;
use bytes::BytesMut;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tracing::{trace, warn};

pub(super) async fn run_writer(
    state: Arc<NodeState>,
    conn: Arc<Connection>,
    mut write_half: OwnedWriteHalf,
) {
    let send_limit = state.config.send_limit;
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let mut header_buf = BytesMut::with_capacity(256);
    let mut sent_in_row: u32 = 0;

    loop {
        if conn.is_closed() || state.need_exit() {
            break;
        }

        match conn.pop_send() {
            Some(frame) => {
                if let Err(e) = write_frame(&mut write_half, &mut header_buf, &frame).await {
                    warn!(
                        session = conn.session_id,
                        addr = %conn.addr,
                        error = %e,
                        "failed to send frame, resetting connection"
                    );
                    conn.on_frame_sent();
                    conn.reset(&state, e.wire_status());
                    break;
                }

                conn.on_frame_sent();
                // A completed send may re-open admission.
                state.admission.wake();

                sent_in_row += 1;
                if send_limit > 0 && sent_in_row >= send_limit {
                    trace!(
                        session = conn.session_id,
                        limit = send_limit,
                        "send limit for one connection reached in a row, yielding"
                    );
                    sent_in_row = 0;
                    tokio::task::yield_now().await;
                }
            }
            None => {
                sent_in_row = 0;
                let wakeup = conn.writer_wakeup().notified();
                if conn.send_queue_len() > 0 {
                    continue;
                }
                tokio::select! {
                    _ = wakeup => {}
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }

    conn.clear_send_queue();
}

async fn write_frame(
    write_half: &mut OwnedWriteHalf,
    header_buf: &mut BytesMut,
    frame: &crate::core::request::OutboundFrame,
) -> Result<(), NodeError> {
    header_buf.clear();
    frame.header.encode(header_buf);
    write_half.write_all(header_buf).await?;

    match &frame.payload {
        Payload::Empty => {}
        Payload::Bytes(bytes) => {
            write_half.write_all(bytes).await?;
        }
        Payload::FileRegion { file, offset, len } => {
            let std_file = file
                .try_clone()
                .map_err(|e| NodeError::Io(Arc::new(e)))?;
            let mut f = tokio::fs::File::from_std(std_file);
            f.seek(SeekFrom::Start(*offset)).await?;
            let mut region = tokio::io::AsyncReadExt::take(f, *len);
            let copied = tokio::io::copy(&mut region, write_half).await?;
            if copied != *len {
                return Err(NodeError::Internal(format!(
                    "short file region write: {copied} of {len} bytes"
                )));
            }
        }
    }

    write_half.flush().await?;
    Ok(())
}
