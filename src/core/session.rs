// src/core/session.rs

//! The client request surface: issue a command toward a remote node and
//! complete through a transaction handle. A blocking call is a thin wrapper
//! that parks on the handle until the terminal frame arrives.

use crate::connection::{ConnKind, Connection, canonical_addr};
use crate::core::handler::AuthPayload;
use crate::core::protocol::{
    CommandFlags, CommandHeader, Key, Opcode, PROTOCOL_VERSION,
};
use crate::core::request::OutboundFrame;
use crate::core::routing::RouteEntry;
use crate::core::state::NodeState;
use crate::core::transaction::Completion;
use crate::core::NodeError;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// One reply frame delivered to a transaction handle.
#[derive(Debug, Clone)]
pub struct ReplyFrame {
    pub header: CommandHeader,
    pub payload: Bytes,
}

impl ReplyFrame {
    pub fn is_terminal(&self) -> bool {
        self.header.flags.contains(CommandFlags::DESTROY)
    }
}

/// Everything a completed transaction produced, terminal frame included.
#[derive(Debug, Clone)]
pub struct Reply {
    pub frames: Vec<ReplyFrame>,
}

impl Reply {
    /// The status of the terminal frame.
    pub fn status(&self) -> i32 {
        self.frames.last().map(|f| f.header.status).unwrap_or(0)
    }

    /// The first non-empty reply body, if the command produced one.
    pub fn data(&self) -> Bytes {
        self.frames
            .iter()
            .find(|f| !f.payload.is_empty())
            .map(|f| f.payload.clone())
            .unwrap_or_default()
    }
}

/// The completion handle of one issued request. Frames arrive in reply
/// order and end exactly once in a DESTROY-flagged frame.
pub struct TransactionHandle {
    pub trans_id: u64,
    rx: mpsc::UnboundedReceiver<ReplyFrame>,
}

impl TransactionHandle {
    pub async fn next_frame(&mut self) -> Option<ReplyFrame> {
        self.rx.recv().await
    }

    /// Parks until the terminal frame, then returns the collected reply.
    /// A negative terminal status becomes the corresponding error.
    pub async fn complete(mut self) -> Result<Reply, NodeError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.rx.recv().await {
            let terminal = frame.is_terminal();
            frames.push(frame);
            if terminal {
                let st = frames.last().map(|f| f.header.status).unwrap_or(0);
                return if st < 0 {
                    Err(NodeError::from_wire_status(st))
                } else {
                    Ok(Reply { frames })
                };
            }
        }
        // The channel closing without a terminal frame means the
        // transaction's registry vanished with its connection.
        Err(NodeError::ConnectionReset)
    }
}

/// A client session: per-session timeout, trace id and command flags over
/// the shared node state.
#[derive(Clone)]
pub struct Session {
    state: Arc<NodeState>,
    wait_timeout: Duration,
    trace_id: u64,
    flags: CommandFlags,
}

impl Session {
    pub fn new(state: Arc<NodeState>) -> Self {
        let wait_timeout = state.wait_timeout();
        Self {
            state,
            wait_timeout,
            trace_id: 0,
            flags: CommandFlags::empty(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_trace_id(mut self, trace_id: u64) -> Self {
        self.trace_id = trace_id;
        self.flags |= CommandFlags::TRACE_BIT;
        self
    }

    /// Issues through the non-blocking service class.
    pub fn nonblocking(mut self) -> Self {
        self.flags |= CommandFlags::NOLOCK;
        self
    }

    /// Returns a live connection to `addr`, reusing a dialed one or
    /// performing the connect + AUTH exchange.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Arc<Connection>, NodeError> {
        let addr = canonical_addr(addr);

        if let Some(session_id) = self.state.outbound_index.get(&addr).map(|e| *e.value()) {
            if let Some(conn) = self
                .state
                .connections
                .get(&session_id)
                .map(|e| e.value().clone())
            {
                if !conn.is_closed() {
                    return Ok(conn);
                }
            }
        }

        debug!(%addr, "dialing remote node");
        let stream = TcpStream::connect(addr).await?;
        let conn = Connection::spawn(&self.state, stream, ConnKind::Dialed)?;

        let auth = AuthPayload {
            cookie: self.state.config.auth_cookie.clone(),
            version: PROTOCOL_VERSION,
        };
        let payload = Bytes::from(serde_json::to_vec(&auth)?);
        let handle = self
            .request_on(&conn, Opcode::Auth, Key::default(), payload)
            .await?;

        match handle.complete().await {
            Ok(reply) => {
                if let Ok(server) = serde_json::from_slice::<AuthPayload>(&reply.data()) {
                    conn.set_authenticated(server.version);
                }
                Ok(conn)
            }
            Err(e) => {
                conn.reset(&self.state, e.wire_status());
                Err(e)
            }
        }
    }

    /// Issues a request on an already established connection. The returned
    /// handle completes through the node's reply path; this call itself
    /// only blocks on the connection's send watermark.
    pub async fn request_on(
        &self,
        conn: &Arc<Connection>,
        opcode: Opcode,
        key: Key,
        payload: Bytes,
    ) -> Result<TransactionHandle, NodeError> {
        if conn.is_closed() {
            return Err(NodeError::from_wire_status(conn.exit_status()));
        }

        let trans_id = self.state.next_trans_id();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut header = CommandHeader::new(key, opcode);
        header.flags = self.flags;
        header.trans_id = trans_id;
        header.trace_id = self.trace_id;
        header.size = payload.len() as u64;

        let completion: Completion = Box::new(move |h, p| {
            let _ = tx.send(ReplyFrame {
                header: *h,
                payload: p.clone(),
            });
        });
        conn.transactions
            .issue(trans_id, header, self.wait_timeout, completion);

        if let Err(e) = conn
            .enqueue_send(OutboundFrame::new(header, payload.into()))
            .await
        {
            conn.transactions
                .destroy_with_status(trans_id, e.wire_status());
            return Err(e);
        }

        Ok(TransactionHandle { trans_id, rx })
    }

    /// Connects (if needed) and issues in one step.
    pub async fn request(
        &self,
        addr: SocketAddr,
        opcode: Opcode,
        key: Key,
        payload: Bytes,
    ) -> Result<TransactionHandle, NodeError> {
        let conn = self.connect(addr).await?;
        self.request_on(&conn, opcode, key, payload).await
    }

    /// The synchronous shape: issue and park until completion.
    pub async fn call(
        &self,
        addr: SocketAddr,
        opcode: Opcode,
        key: Key,
        payload: Bytes,
    ) -> Result<Reply, NodeError> {
        self.request(addr, opcode, key, payload)
            .await?
            .complete()
            .await
    }

    /// Downloads the peer's route table.
    pub async fn fetch_route_list(&self, addr: SocketAddr) -> Result<Vec<RouteEntry>, NodeError> {
        let reply = self
            .call(addr, Opcode::RouteList, Key::default(), Bytes::new())
            .await?;
        let entries: Vec<RouteEntry> = serde_json::from_slice(&reply.data())
            .map_err(|e| NodeError::InvalidRequest(format!("bad route list payload: {e}")))?;
        Ok(entries)
    }

    /// Announces this node's backends to a remote peer.
    pub async fn join(&self, addr: SocketAddr) -> Result<(), NodeError> {
        let entries = self.state.routes.entries();
        let payload = Bytes::from(serde_json::to_vec(&entries)?);
        self.call(addr, Opcode::Join, Key::default(), payload)
            .await?;
        Ok(())
    }
}
