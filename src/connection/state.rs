// src/connection/state.rs

//! The `Connection` itself: one peer socket, its send queue and watermark
//! accounting, and its transaction registry. Shared by the reader task, the
//! writer task, workers holding in-flight requests and the timeout sweeper;
//! the last clone dropped frees it.

use super::{canonical_addr, handler, writer};
use crate::core::metrics;
use crate::core::request::OutboundFrame;
use crate::core::state::NodeState;
use crate::core::transaction::TransactionRegistry;
use crate::core::{NodeError, protocol::status};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Send-queue depth at which producers park.
pub const SEND_WATERMARK_HIGH: usize = 1024 * 100;
/// Depth at which parked producers are woken again.
pub const SEND_WATERMARK_LOW: usize = 512 * 100;

/// Who initiated the connection. Only dialed peers are recorded for
/// reconnection after a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Accepted,
    Dialed,
}

pub struct Connection {
    pub session_id: u64,
    pub addr: SocketAddr,
    pub kind: ConnKind,

    /// Zero while running; the wire status of the reset afterwards.
    need_exit: AtomicI32,
    /// The node's exit flag, shared so parked producers wake on shutdown.
    node_need_exit: Arc<AtomicBool>,
    joined: AtomicBool,
    authenticated: AtomicBool,
    version: Mutex<[u32; 4]>,

    send_queue: Mutex<VecDeque<OutboundFrame>>,
    send_queue_size: AtomicUsize,
    /// Broadcast when the queue crosses below the low watermark.
    send_space: Notify,
    writer_wakeup: Notify,

    pub transactions: TransactionRegistry,
    /// Consecutive transaction timeouts; reset by any successful reply.
    stall: AtomicU32,

    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Builds a connection over an established stream, registers it in the
    /// global set and spawns its reader and writer tasks. The returned
    /// reference is the caller's; the global set holds its own.
    pub fn spawn(
        state: &Arc<NodeState>,
        stream: TcpStream,
        kind: ConnKind,
    ) -> Result<Arc<Connection>, NodeError> {
        let addr = canonical_addr(stream.peer_addr()?);
        apply_sockopts(state, &stream)?;

        let session_id = state.next_session_id();
        let conn = Arc::new(Connection {
            session_id,
            addr,
            kind,
            need_exit: AtomicI32::new(0),
            node_need_exit: state.need_exit_flag(),
            joined: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            version: Mutex::new([0; 4]),
            send_queue: Mutex::new(VecDeque::new()),
            send_queue_size: AtomicUsize::new(0),
            send_space: Notify::new(),
            writer_wakeup: Notify::new(),
            transactions: TransactionRegistry::new(),
            stall: AtomicU32::new(0),
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
        });

        state.connections.insert(session_id, conn.clone());
        if kind == ConnKind::Dialed {
            state.outbound_index.insert(addr, session_id);
        }
        metrics::CONNECTED_PEERS.inc();
        metrics::CONNECTIONS_RECEIVED_TOTAL.inc();
        state
            .stats
            .connections_total
            .fetch_add(1, Ordering::Relaxed);

        let (read_half, write_half) = stream.into_split();
        *conn.reader_task.lock() = Some(tokio::spawn(handler::run_reader(
            state.clone(),
            conn.clone(),
            read_half,
        )));
        *conn.writer_task.lock() = Some(tokio::spawn(writer::run_writer(
            state.clone(),
            conn.clone(),
            write_half,
        )));

        debug!(session = session_id, %addr, ?kind, "connection established");
        Ok(conn)
    }

    pub fn is_closed(&self) -> bool {
        self.need_exit.load(Ordering::Acquire) != 0
    }

    /// The wire status this connection was reset with, or zero.
    pub fn exit_status(&self) -> i32 {
        self.need_exit.load(Ordering::Acquire)
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::Acquire)
    }

    pub fn set_joined(&self) {
        self.joined.store(true, Ordering::Release);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_authenticated(&self, version: [u32; 4]) {
        *self.version.lock() = version;
        self.authenticated.store(true, Ordering::Release);
    }

    pub fn peer_version(&self) -> [u32; 4] {
        *self.version.lock()
    }

    pub fn send_queue_len(&self) -> usize {
        self.send_queue_size.load(Ordering::Acquire)
    }

    /// Appends a frame to the send queue, parking at the high watermark
    /// until the writer drains the queue below the low one. Insertion order
    /// is preserved; the writer sends strictly in enqueue order.
    pub async fn enqueue_send(&self, frame: OutboundFrame) -> Result<(), NodeError> {
        loop {
            if self.is_closed() {
                return Err(NodeError::from_wire_status(self.exit_status()));
            }
            if self.node_need_exit.load(Ordering::Acquire) {
                return Err(NodeError::Shutdown);
            }
            if self.send_queue_size.load(Ordering::Acquire) < SEND_WATERMARK_HIGH {
                break;
            }
            let notified = self.send_space.notified();
            if self.send_queue_size.load(Ordering::Acquire) < SEND_WATERMARK_HIGH
                || self.is_closed()
            {
                continue;
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), notified).await;
        }

        self.send_queue.lock().push_back(frame);
        self.send_queue_size.fetch_add(1, Ordering::AcqRel);
        metrics::OUTPUT_QUEUE_SIZE.inc();
        self.writer_wakeup.notify_one();
        Ok(())
    }

    /// Writer side: takes the next frame to put on the wire.
    pub(super) fn pop_send(&self) -> Option<OutboundFrame> {
        self.send_queue.lock().pop_front()
    }

    /// Writer side: accounts a fully written frame and wakes producers when
    /// the queue crosses below the low watermark.
    pub(super) fn on_frame_sent(&self) {
        let prev = self.send_queue_size.fetch_sub(1, Ordering::AcqRel);
        metrics::OUTPUT_QUEUE_SIZE.dec();
        if prev.saturating_sub(1) == SEND_WATERMARK_LOW {
            debug!(
                session = self.session_id,
                addr = %self.addr,
                "send queue reached low watermark, waking producers"
            );
            self.send_space.notify_waiters();
        }
    }

    pub(super) fn writer_wakeup(&self) -> &Notify {
        &self.writer_wakeup
    }

    /// Drops whatever is still queued. Used when the writer exits.
    pub(super) fn clear_send_queue(&self) {
        let mut queue = self.send_queue.lock();
        let n = queue.len();
        queue.clear();
        if n > 0 {
            self.send_queue_size.fetch_sub(n, Ordering::AcqRel);
            metrics::OUTPUT_QUEUE_SIZE.sub(n as i64);
        }
        self.send_space.notify_waiters();
    }

    /// Waits, bounded, for the writer to put everything queued on the wire.
    /// Used when a frame must reach the peer before a deliberate reset.
    pub async fn drain_send_queue(&self, timeout: Duration) {
        let deadline = std::time::Instant::now() + timeout;
        while self.send_queue_len() > 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Adds swept-out transactions to the stall counter, returning the new
    /// total. The sweeper resets the connection once it crosses the
    /// configured stall count.
    pub fn note_timeouts(&self, n: usize) -> u32 {
        self.stall.fetch_add(n as u32, Ordering::AcqRel) + n as u32
    }

    pub fn clear_stall(&self) {
        self.stall.store(0, Ordering::Release);
    }

    /// Graceful reset: marks the connection dead with `wire_status`,
    /// completes every outstanding transaction with that status, records
    /// reconnect intent for dialed peers, removes the global-set reference
    /// and stops both I/O tasks. Idempotent; in-flight requests held by
    /// workers are unaffected and fail naturally when they try to send.
    pub fn reset(self: &Arc<Self>, state: &Arc<NodeState>, wire_status: i32) {
        let wire_status = if wire_status == 0 {
            -status::ECONNRESET
        } else {
            wire_status
        };
        if self
            .need_exit
            .compare_exchange(0, wire_status, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let failed = self.transactions.fail_all(wire_status);
        if failed > 0 {
            warn!(
                session = self.session_id,
                addr = %self.addr,
                failed,
                status = wire_status,
                "resetting connection with outstanding transactions"
            );
        } else {
            debug!(
                session = self.session_id,
                addr = %self.addr,
                status = wire_status,
                "resetting connection"
            );
        }

        // Unblock anything parked on this connection.
        self.send_space.notify_waiters();
        self.writer_wakeup.notify_waiters();

        if state.connections.remove(&self.session_id).is_some() {
            metrics::CONNECTED_PEERS.dec();
        }
        if self.kind == ConnKind::Dialed {
            state.outbound_index.remove(&self.addr);
            if !state.need_exit() {
                state.record_reconnect(self.addr, self.is_joined());
            }
        }

        if let Some(handle) = self.writer_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.reader_task.lock().take() {
            handle.abort();
        }
    }
}

/// Socket options applied to every peer socket: no delay plus the
/// configured keepalive probing.
fn apply_sockopts(state: &Arc<NodeState>, stream: &TcpStream) -> Result<(), NodeError> {
    stream.set_nodelay(true)?;
    let ka = &state.config.keepalive;
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(ka.idle))
        .with_interval(Duration::from_secs(ka.interval))
        .with_retries(ka.count);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}
