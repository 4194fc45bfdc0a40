// src/core/transaction.rs

//! The per-connection transaction registry: outstanding requests indexed by
//! transaction id for reply demultiplexing and by deadline for timeout
//! sweeps. Completion callbacks for one transaction are serialized by the
//! registry lock and end exactly once in a DESTROY-flagged frame.

use crate::core::protocol::{CommandFlags, CommandHeader, status};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Invoked for every reply frame of a transaction, the terminal one included.
pub type Completion = Box<dyn Fn(&CommandHeader, &Bytes) + Send + Sync>;

/// Per-transaction accounting, mirrored into monitoring snapshots.
#[derive(Debug, Default, Clone)]
pub struct TransStats {
    pub recv_replies: usize,
    pub recv_size: u64,
}

/// One outstanding request. Owned by the registry; the timer and reply
/// paths look it up under the registry lock.
pub struct Transaction {
    pub id: u64,
    /// The request header, echoed into synthesized terminal replies.
    pub cmd: CommandHeader,
    pub issued: Instant,
    pub deadline: Instant,
    completion: Completion,
    stats: Mutex<TransStats>,
}

impl Transaction {
    pub fn stats(&self) -> TransStats {
        self.stats.lock().clone()
    }

    /// Builds the synthesized terminal header carrying `wire_status`.
    fn terminal_header(&self, wire_status: i32) -> CommandHeader {
        let mut header = self.cmd;
        header.flags = (header.flags & CommandFlags::NOLOCK)
            | CommandFlags::REPLY
            | CommandFlags::DESTROY;
        header.status = wire_status;
        header.size = 0;
        header.trans_id = self.id;
        header
    }
}

/// What became of a reply frame handed to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Delivered to the completion callback; more frames will follow.
    Delivered,
    /// Delivered as the terminal frame; the transaction is gone.
    Terminal,
    /// No transaction with that id; the frame was dropped.
    Stray,
}

#[derive(Default)]
struct TransactionTable {
    by_id: HashMap<u64, Arc<Transaction>>,
    timers: BTreeMap<(Instant, u64), u64>,
}

/// The registry itself, one per connection.
#[derive(Default)]
pub struct TransactionRegistry {
    inner: Mutex<TransactionTable>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a freshly issued request under both indices.
    pub fn issue(
        &self,
        id: u64,
        cmd: CommandHeader,
        timeout: Duration,
        completion: Completion,
    ) -> Arc<Transaction> {
        let now = Instant::now();
        let trans = Arc::new(Transaction {
            id,
            cmd,
            issued: now,
            deadline: now + timeout,
            completion,
            stats: Mutex::new(TransStats::default()),
        });

        let mut table = self.inner.lock();
        table.timers.insert((trans.deadline, id), id);
        table.by_id.insert(id, trans.clone());
        trans
    }

    /// Reply demux, receive side: refreshes the transaction and pulls it out
    /// of the timer index so the sweeper cannot complete it underneath the
    /// worker that will process the frame. The id index keeps the entry
    /// until the terminal frame.
    pub fn match_reply(&self, id: u64, reply_size: u64) -> bool {
        let mut table = self.inner.lock();
        match table.by_id.get(&id).cloned() {
            Some(trans) => {
                let mut stats = trans.stats.lock();
                stats.recv_replies += 1;
                stats.recv_size += reply_size;
                drop(stats);
                table.timers.remove(&(trans.deadline, id));
                true
            }
            None => false,
        }
    }

    /// Delivers a reply frame to the completion callback. A frame with
    /// DESTROY set, or with MORE clear, is terminal and removes the
    /// transaction from both indices first, which makes a second terminal
    /// impossible: later frames for the same id are strays.
    pub fn complete_reply(&self, header: &CommandHeader, payload: &Bytes) -> ReplyOutcome {
        let mut table = self.inner.lock();
        let terminal = header.flags.contains(CommandFlags::DESTROY)
            || !header.flags.contains(CommandFlags::MORE);

        if terminal {
            match table.by_id.remove(&header.trans_id) {
                Some(trans) => {
                    table.timers.remove(&(trans.deadline, trans.id));
                    let mut terminal_header = *header;
                    terminal_header.flags |= CommandFlags::REPLY | CommandFlags::DESTROY;
                    (trans.completion)(&terminal_header, payload);
                    ReplyOutcome::Terminal
                }
                None => ReplyOutcome::Stray,
            }
        } else {
            match table.by_id.get(&header.trans_id) {
                Some(trans) => {
                    (trans.completion)(header, payload);
                    ReplyOutcome::Delivered
                }
                None => ReplyOutcome::Stray,
            }
        }
    }

    /// Tears one transaction down with a synthesized terminal reply.
    pub fn destroy_with_status(&self, id: u64, wire_status: i32) -> bool {
        let trans = {
            let mut table = self.inner.lock();
            match table.by_id.remove(&id) {
                Some(t) => {
                    table.timers.remove(&(t.deadline, t.id));
                    Some(t)
                }
                None => None,
            }
        };
        match trans {
            Some(t) => {
                let header = t.terminal_header(wire_status);
                (t.completion)(&header, &Bytes::new());
                true
            }
            None => false,
        }
    }

    /// Walks the timer index from the earliest deadline and completes every
    /// expired transaction with `-ETIMEDOUT | DESTROY`. Returns how many
    /// expired, which feeds the connection's stall counter.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<Arc<Transaction>> = {
            let mut table = self.inner.lock();
            let mut out = Vec::new();
            while let Some((&(deadline, id), _)) = table.timers.iter().next() {
                if deadline > now {
                    break;
                }
                table.timers.remove(&(deadline, id));
                if let Some(trans) = table.by_id.remove(&id) {
                    out.push(trans);
                }
            }
            out
        };

        for trans in &expired {
            warn!(
                trans = trans.id,
                cmd = trans.cmd.opcode.name(),
                elapsed_ms = trans.issued.elapsed().as_millis() as u64,
                "transaction timed out"
            );
            let header = trans.terminal_header(-status::ETIMEDOUT);
            (trans.completion)(&header, &Bytes::new());
        }
        expired.len()
    }

    /// Completes every outstanding transaction with the given status. Used
    /// on connection reset and node shutdown.
    pub fn fail_all(&self, wire_status: i32) -> usize {
        let drained: Vec<Arc<Transaction>> = {
            let mut table = self.inner.lock();
            table.timers.clear();
            table.by_id.drain().map(|(_, t)| t).collect()
        };
        for trans in &drained {
            let header = trans.terminal_header(wire_status);
            (trans.completion)(&header, &Bytes::new());
        }
        drained.len()
    }
}
