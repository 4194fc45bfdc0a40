// src/core/handler.rs

//! Worker-side command processing: reply completion, the backendless
//! command set served by the node core, backend hand-off, and the reply/ack
//! send helpers.

use crate::core::backend::Backend;
use crate::core::pool::WorkPool;
use crate::core::protocol::{
    CommandFlags, CommandHeader, Key, Opcode, PROTOCOL_VERSION, status,
};
use crate::core::request::{IoRequest, OutboundFrame, Payload};
use crate::core::routing::RouteEntry;
use crate::core::state::NodeState;
use crate::core::NodeError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The AUTH exchange payload: shared cookie plus protocol version. Sent by
/// the dialing side as the first frame, echoed by the serving side with its
/// own version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub cookie: String,
    pub version: [u32; 4],
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendAction {
    Enable,
    Disable,
    DefragStart,
    DefragStop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendControlRequest {
    pub backend_id: i32,
    pub action: BackendAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkKey {
    pub id: Vec<u8>,
    pub group_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkOpStatus {
    pub status: i32,
    pub size: u64,
}

/// Entry point of the worker loop for one request or reply.
pub(crate) async fn process(
    state: &Arc<NodeState>,
    pool: &Arc<WorkPool>,
    req: IoRequest,
    queue_time: Duration,
) {
    let header = req.header;
    debug!(
        session = req.conn.session_id,
        cmd = header.opcode.name(),
        trans = header.trans_id,
        backend = header.backend_id,
        trace = header.trace_id,
        pool = %pool.stat_id(),
        queue_time_us = queue_time.as_micros() as u64,
        "got IO event"
    );

    // Requests that sat in the queue past the configured bound are failed
    // without touching the handler; the peer retries elsewhere.
    let queue_timeout = state.config.queue_timeout;
    if queue_timeout > 0 && queue_time >= Duration::from_secs(queue_timeout) {
        warn!(
            session = req.conn.session_id,
            cmd = header.opcode.name(),
            trans = header.trans_id,
            queue_time_ms = queue_time.as_millis() as u64,
            "request exceeded queue timeout"
        );
        state.stats.count_command(header.opcode.name(), true);
        let _ = send_ack(&req, -status::ETIMEDOUT).await;
        return;
    }

    let result = route_command(state, &req).await;
    let failed = result.is_err();

    match result {
        Ok(payload) => {
            if !payload.is_empty() && send_reply(&req, payload, true).await.is_err() {
                return;
            }
            let _ = send_ack(&req, 0).await;
        }
        Err(e) => {
            debug!(
                session = req.conn.session_id,
                cmd = header.opcode.name(),
                trans = header.trans_id,
                error = %e,
                "command failed"
            );
            let wire_status = e.wire_status();
            let _ = send_ack(&req, wire_status).await;
            // A failed AUTH is not a peer worth keeping. The ack gets a
            // bounded chance to reach the wire first.
            if matches!(e, NodeError::AuthFailed(_)) {
                req.conn.drain_send_queue(Duration::from_secs(1)).await;
                req.conn.reset(state, wire_status);
            }
        }
    }
    state.stats.count_command(header.opcode.name(), failed);
}

/// Sends a data reply frame. `more` keeps the transaction open on the peer;
/// the final ack clears it.
pub async fn send_reply(req: &IoRequest, payload: Payload, more: bool) -> Result<(), NodeError> {
    let mut header = req.header;
    header.flags = (header.flags & (CommandFlags::NOLOCK | CommandFlags::TRACE_BIT))
        | CommandFlags::REPLY
        | if more {
            CommandFlags::MORE
        } else {
            CommandFlags::empty()
        };
    header.status = 0;
    req.conn
        .enqueue_send(OutboundFrame::new(header, payload))
        .await
}

/// Sends the terminal acknowledgement of a request, carrying `wire_status`.
pub async fn send_ack(req: &IoRequest, wire_status: i32) -> Result<(), NodeError> {
    let mut header = req.header;
    header.flags = (header.flags & (CommandFlags::NOLOCK | CommandFlags::TRACE_BIT))
        | CommandFlags::REPLY
        | CommandFlags::DESTROY;
    header.status = wire_status;
    req.conn
        .enqueue_send(OutboundFrame::new(header, Payload::Empty))
        .await
}

fn backend_for(state: &Arc<NodeState>, req: &IoRequest) -> Result<Arc<dyn Backend>, NodeError> {
    state
        .backends
        .get(req.header.backend_id)
        .ok_or(NodeError::UnknownBackend(req.header.backend_id))
}

async fn route_command(state: &Arc<NodeState>, req: &IoRequest) -> Result<Payload, NodeError> {
    match req.header.opcode {
        op if op.is_backendless() => core_command(state, req).await,
        Opcode::Iterator => backend_for(state, req)?.iterate().await,
        _ => {
            backend_for(state, req)?
                .command(&req.header, &req.payload)
                .await
        }
    }
}

/// The command set served without a backend: authentication, status,
/// route-list exchange, join, monitoring and backend control.
async fn core_command(state: &Arc<NodeState>, req: &IoRequest) -> Result<Payload, NodeError> {
    match req.header.opcode {
        Opcode::Auth => handle_auth(state, req),
        Opcode::Status => {
            let local = *state.local_addr.read();
            let body = serde_json::to_vec(&serde_json::json!({
                "address": local.map(|a| a.to_string()),
                "version": PROTOCOL_VERSION,
                "uptime_seconds": state.started_at.elapsed().as_secs(),
                "need_exit": state.need_exit(),
            }))?;
            Ok(Payload::Bytes(body.into()))
        }
        Opcode::ReverseLookup => {
            let addrs: Vec<String> = state
                .local_addr
                .read()
                .iter()
                .map(|a| a.to_string())
                .collect();
            Ok(Payload::Bytes(serde_json::to_vec(&addrs)?.into()))
        }
        Opcode::Join => {
            let entries: Vec<RouteEntry> = if req.payload.is_empty() {
                Vec::new()
            } else {
                serde_json::from_slice(&req.payload)
                    .map_err(|e| NodeError::InvalidRequest(format!("bad join payload: {e}")))?
            };
            state.routes.merge(&entries);
            req.conn.set_joined();
            debug!(
                session = req.conn.session_id,
                routes = entries.len(),
                "peer joined the cluster"
            );
            Ok(Payload::Empty)
        }
        Opcode::RouteList => {
            let entries = state.routes.entries();
            Ok(Payload::Bytes(serde_json::to_vec(&entries)?.into()))
        }
        Opcode::MonitorStat => {
            let mut snapshot = state.monitor_snapshot();
            if state.config.route_list_on_stat {
                snapshot["route_entries"] = serde_json::to_value(state.routes.entries())?;
            }
            Ok(Payload::Bytes(serde_json::to_vec(&snapshot)?.into()))
        }
        Opcode::BackendControl => handle_backend_control(state, req).await,
        Opcode::BackendStatus => {
            let mut backends = Vec::new();
            for id in state.backends.ids() {
                let enabled = state.backends.is_enabled(id);
                let total = state
                    .backends
                    .get(id)
                    .map(|b| b.total_elements())
                    .unwrap_or(0);
                backends.push(serde_json::json!({
                    "backend_id": id,
                    "enabled": enabled,
                    "total_elements": total,
                }));
            }
            Ok(Payload::Bytes(serde_json::to_vec(&backends)?.into()))
        }
        Opcode::BulkReadNew => bulk_op(state, req, Opcode::Read).await,
        Opcode::BulkRemoveNew => bulk_op(state, req, Opcode::Remove).await,
        other => Err(NodeError::UnknownOpcode(other as u32)),
    }
}

fn handle_auth(state: &Arc<NodeState>, req: &IoRequest) -> Result<Payload, NodeError> {
    let auth: AuthPayload = serde_json::from_slice(&req.payload)
        .map_err(|e| NodeError::AuthFailed(format!("unreadable auth payload: {e}")))?;

    if auth.cookie != state.config.auth_cookie {
        return Err(NodeError::AuthFailed("cookie mismatch".into()));
    }
    if auth.version[0] != PROTOCOL_VERSION[0] || auth.version[1] != PROTOCOL_VERSION[1] {
        return Err(NodeError::AuthFailed(format!(
            "protocol version mismatch: {:?} vs {:?}",
            auth.version, PROTOCOL_VERSION
        )));
    }

    req.conn.set_authenticated(auth.version);
    let echo = AuthPayload {
        cookie: String::new(),
        version: PROTOCOL_VERSION,
    };
    Ok(Payload::Bytes(serde_json::to_vec(&echo)?.into()))
}

async fn handle_backend_control(
    state: &Arc<NodeState>,
    req: &IoRequest,
) -> Result<Payload, NodeError> {
    let ctl: BackendControlRequest = serde_json::from_slice(&req.payload)
        .map_err(|e| NodeError::InvalidRequest(format!("bad backend control payload: {e}")))?;

    let backend = state.backends.get(ctl.backend_id);

    match ctl.action {
        BackendAction::Enable => {
            if !state.backends.set_enabled(ctl.backend_id, true) {
                return Err(NodeError::UnknownBackend(ctl.backend_id));
            }
            if state.pools.place(ctl.backend_id, false).is_none() {
                state.pools.attach_backend(
                    state,
                    ctl.backend_id,
                    state.config.io_thread_num,
                    state.config.nonblocking_io_thread_num,
                    state.config.queue_limit,
                );
            }
            Ok(Payload::Empty)
        }
        BackendAction::Disable => {
            if !state.backends.set_enabled(ctl.backend_id, false) {
                return Err(NodeError::UnknownBackend(ctl.backend_id));
            }
            let leftovers = state.pools.detach_backend(ctl.backend_id).await;
            for leftover in leftovers {
                let _ = send_ack(&leftover, -status::EAGAIN).await;
            }
            Ok(Payload::Empty)
        }
        BackendAction::DefragStart => {
            backend
                .ok_or(NodeError::UnknownBackend(ctl.backend_id))?
                .defrag_start()?;
            Ok(Payload::Empty)
        }
        BackendAction::DefragStop => {
            backend
                .ok_or(NodeError::UnknownBackend(ctl.backend_id))?
                .defrag_stop()?;
            Ok(Payload::Empty)
        }
    }
}

/// Serves a bulk operation: per-key backend resolution and invocation, with
/// a per-key status vector as the reply body.
async fn bulk_op(
    state: &Arc<NodeState>,
    req: &IoRequest,
    per_key_op: Opcode,
) -> Result<Payload, NodeError> {
    let keys: Vec<BulkKey> = serde_json::from_slice(&req.payload)
        .map_err(|e| NodeError::InvalidRequest(format!("bad bulk payload: {e}")))?;

    let mut results = Vec::with_capacity(keys.len());
    for bulk_key in keys {
        let key = Key::from_prefix(&bulk_key.id, bulk_key.group_id);
        let resolved = state
            .routes
            .lookup(&key)
            .and_then(|id| state.backends.get(id).map(|b| (id, b)));

        let entry = match resolved {
            Some((backend_id, backend)) => {
                let mut sub = CommandHeader::new(key, per_key_op);
                sub.backend_id = backend_id;
                sub.trace_id = req.header.trace_id;
                match backend.command(&sub, &Bytes::new()).await {
                    Ok(payload) => BulkOpStatus {
                        status: 0,
                        size: payload.len(),
                    },
                    Err(e) => BulkOpStatus {
                        status: e.wire_status(),
                        size: 0,
                    },
                }
            }
            None => BulkOpStatus {
                status: -status::ENXIO,
                size: 0,
            },
        };
        results.push(entry);
    }

    Ok(Payload::Bytes(serde_json::to_vec(&results)?.into()))
}
