// src/core/request.rs

//! The I/O request: the unit of work handed from the receive path to the
//! worker pools, and the outbound frame queued for sending.

use crate::core::protocol::{CommandHeader, Frame};
use crate::connection::Connection;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A request or reply payload. Replies served straight from backend files
/// carry a file region that the connection writer streams without copying
/// the data through an intermediate buffer.
#[derive(Debug, Clone)]
pub enum Payload {
    Empty,
    Bytes(Bytes),
    FileRegion {
        file: Arc<std::fs::File>,
        offset: u64,
        len: u64,
    },
}

impl Payload {
    pub fn len(&self) -> u64 {
        match self {
            Payload::Empty => 0,
            Payload::Bytes(b) => b.len() as u64,
            Payload::FileRegion { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> Bytes {
        match self {
            Payload::Empty => Bytes::new(),
            Payload::Bytes(b) => b.clone(),
            Payload::FileRegion { .. } => Bytes::new(),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        if b.is_empty() {
            Payload::Empty
        } else {
            Payload::Bytes(b)
        }
    }
}

/// An outbound frame sitting in a connection's send queue.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub header: CommandHeader,
    pub payload: Payload,
}

impl OutboundFrame {
    pub fn new(mut header: CommandHeader, payload: Payload) -> Self {
        header.size = payload.len();
        Self { header, payload }
    }
}

/// The unit exchanged between the receive path and a worker: the parsed
/// header, the payload, receive timing and a reference back to the owning
/// connection. Ownership transfers with the request through the pool queue.
pub struct IoRequest {
    pub header: CommandHeader,
    pub payload: Bytes,
    pub conn: Arc<Connection>,
    /// Time from the first header byte to payload completion.
    pub recv_time: Duration,
    /// Set by the dispatcher when the request enters a pool queue.
    pub queued_at: Instant,
}

impl IoRequest {
    pub fn from_frame(frame: Frame, conn: Arc<Connection>, recv_time: Duration) -> Self {
        Self {
            header: frame.header,
            payload: frame.payload,
            conn,
            recv_time,
            queued_at: Instant::now(),
        }
    }

    /// Time this request has spent in a pool queue so far.
    pub fn queue_time(&self) -> Duration {
        self.queued_at.elapsed()
    }
}
