// tests/integration/test_helpers.rs

//! Shared fixtures for the integration suite: a memory-backed storage
//! engine, node startup helpers and a raw frame-level client.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use riptide::Node;
use riptide::config::Config;
use riptide::core::NodeError;
use riptide::core::backend::Backend;
use riptide::core::handler::AuthPayload;
use riptide::core::protocol::{
    CommandFlags, CommandHeader, Frame, FrameCodec, Key, Opcode, PROTOCOL_VERSION, status,
};
use riptide::core::request::Payload;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// A memory-backed storage engine: enough semantics to drive the node core.
/// An optional gate keeps workers busy for backpressure scenarios.
#[derive(Default)]
pub struct MemoryBackend {
    store: DashMap<Vec<u8>, Bytes>,
    gated: AtomicBool,
    /// Artificial per-command latency, for slow-backend scenarios.
    pub delay: Option<Duration>,
}

impl MemoryBackend {
    pub fn gated() -> Arc<Self> {
        let backend = Self::default();
        backend.gated.store(true, Ordering::SeqCst);
        Arc::new(backend)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn release(&self) {
        self.gated.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn command(
        &self,
        header: &CommandHeader,
        payload: &Bytes,
    ) -> Result<Payload, NodeError> {
        while self.gated.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let id = header.key.id.to_vec();
        match header.opcode {
            Opcode::Write => {
                self.store.insert(id, payload.clone());
                Ok(Payload::Empty)
            }
            Opcode::Read => match self.store.get(&id) {
                Some(entry) => Ok(Payload::Bytes(entry.value().clone())),
                // Unknown objects read as a fixed 64-byte record.
                None => Ok(Payload::Bytes(Bytes::from(vec![0u8; 64]))),
            },
            Opcode::Remove => {
                if self.store.remove(&id).is_some() {
                    Ok(Payload::Empty)
                } else {
                    Err(NodeError::Remote {
                        status: -status::ENOENT,
                    })
                }
            }
            Opcode::Lookup => match self.store.get(&id) {
                Some(entry) => {
                    let info = serde_json::json!({ "size": entry.value().len() });
                    Ok(Payload::Bytes(serde_json::to_vec(&info).unwrap().into()))
                }
                None => Err(NodeError::Remote {
                    status: -status::ENOENT,
                }),
            },
            _ => Err(NodeError::Unsupported),
        }
    }

    fn total_elements(&self) -> u64 {
        self.store.len() as u64
    }
}

/// Starts a node on an ephemeral port with test-friendly timeouts.
pub async fn start_node(configure: impl FnOnce(&mut Config)) -> Node {
    let mut config = Config::default();
    config.port = 0;
    config.wait_timeout = 2;
    config.check_timeout = 1;
    config.io_thread_num = 2;
    config.nonblocking_io_thread_num = 2;
    configure(&mut config);
    Node::start(config).await.expect("node must start")
}

/// Attaches a backend owning the whole identifier space.
pub fn attach_backend(node: &Node, backend_id: i32, backend: Arc<dyn Backend>) {
    node.attach_backend(backend_id, backend, &[0]);
}

pub fn test_key(name: &[u8]) -> Key {
    Key::from_prefix(name, 1)
}

/// A frame-level client speaking the wire protocol directly, for tests that
/// assert exact frames.
pub struct RawClient {
    framed: Framed<TcpStream, FrameCodec>,
    next_trans: u64,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            framed: Framed::new(stream, FrameCodec::default()),
            next_trans: 1,
        }
    }

    /// Performs the AUTH exchange and asserts it succeeds.
    pub async fn auth(&mut self, cookie: &str) {
        let frames = self.auth_raw(cookie).await;
        let last = frames.last().expect("auth terminal frame");
        assert_eq!(last.header.status, 0, "auth should succeed");
    }

    /// Performs the AUTH exchange, returning all reply frames.
    pub async fn auth_raw(&mut self, cookie: &str) -> Vec<Frame> {
        let payload = serde_json::to_vec(&AuthPayload {
            cookie: cookie.to_string(),
            version: PROTOCOL_VERSION,
        })
        .unwrap();
        self.request(Opcode::Auth, Key::default(), payload.into())
            .await
    }

    pub fn make_request(&mut self, opcode: Opcode, key: Key, payload: Bytes) -> Frame {
        let mut header = CommandHeader::new(key, opcode);
        header.trans_id = self.next_trans;
        self.next_trans += 1;
        Frame::new(header, payload)
    }

    pub async fn send(&mut self, frame: Frame) {
        self.framed.send(frame).await.expect("send frame");
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        match self.framed.next().await {
            Some(Ok(decoded)) => Some(decoded.frame),
            _ => None,
        }
    }

    /// Collects reply frames for `trans_id` until its terminal frame.
    pub async fn collect_reply(&mut self, trans_id: u64) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), self.next_frame())
                .await
                .expect("reply within timeout")
                .expect("connection stays open");
            if frame.header.trans_id != trans_id {
                continue;
            }
            let terminal = frame.header.flags.contains(CommandFlags::DESTROY);
            frames.push(frame);
            if terminal {
                return frames;
            }
        }
    }

    /// Sends one request and collects its reply frames.
    pub async fn request(&mut self, opcode: Opcode, key: Key, payload: Bytes) -> Vec<Frame> {
        let frame = self.make_request(opcode, key, payload);
        let trans_id = frame.header.trans_id;
        self.send(frame).await;
        self.collect_reply(trans_id).await
    }
}
