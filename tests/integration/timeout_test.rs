// tests/integration/timeout_test.rs

//! Transaction timeouts, stray replies and stall detection.

use super::test_helpers::*;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use riptide::core::NodeError;
use riptide::core::protocol::{
    CommandFlags, Frame, FrameCodec, Key, Opcode,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

/// A peer that completes the AUTH exchange and then ignores every frame.
/// Returns the address it listens on.
async fn spawn_silent_peer() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, FrameCodec::default());
                while let Some(Ok(decoded)) = framed.next().await {
                    let header = decoded.frame.header;
                    if header.opcode == Opcode::Auth
                        && !header.flags.contains(CommandFlags::REPLY)
                    {
                        let mut ack = header;
                        ack.flags = CommandFlags::REPLY | CommandFlags::DESTROY;
                        ack.status = 0;
                        ack.size = 0;
                        let _ = framed.send(Frame::header_only(ack)).await;
                    }
                    // Everything else is swallowed.
                }
            });
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unanswered_request_times_out() {
    let peer = spawn_silent_peer().await;
    let client = start_node(|c| {
        c.wait_timeout = 1;
        c.stall_count = 100;
    })
    .await;

    let started = std::time::Instant::now();
    let err = client
        .session()
        .call(peer, Opcode::Read, test_key(b"void"), Bytes::new())
        .await
        .expect_err("request must time out");
    assert_eq!(err, NodeError::Timeout);
    assert!(
        started.elapsed() < Duration::from_secs(8),
        "timeout should fire near wait_timeout, not hang"
    );

    // The swept transaction left both indices.
    let conn = client.session().connect(peer).await.unwrap();
    assert!(conn.transactions.is_empty());

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_connection_is_reset() {
    let peer = spawn_silent_peer().await;
    let client = start_node(|c| {
        c.wait_timeout = 1;
        c.stall_count = 2;
        // Keep the reconnector out of the way so the reconnect record stays
        // observable.
        c.check_timeout = 600;
    })
    .await;

    let session = client.session();
    let conn = session.connect(peer).await.unwrap();
    let session_id = conn.session_id;

    // Two consecutive timeouts cross the stall count.
    for _ in 0..2 {
        let _ = session
            .call(peer, Opcode::Read, test_key(b"stall"), Bytes::new())
            .await;
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let gone = !client.state().connections.contains_key(&session_id);
        if gone {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "stalled connection should have been reset"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // The lost peer is recorded for the reconnector.
    assert!(client.state().reconnects.lock().contains_key(&peer));

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stray_reply_is_dropped_without_damage() {
    let node = start_node(|_| {}).await;
    let mut client = RawClient::connect(node.local_addr()).await;
    client.auth("").await;

    // A reply for a transaction this node never issued.
    let mut header = riptide::core::protocol::CommandHeader::new(Key::default(), Opcode::Read);
    header.flags = CommandFlags::REPLY | CommandFlags::DESTROY;
    header.trans_id = 0xdead;
    client.send(Frame::header_only(header)).await;

    // The connection keeps working afterwards.
    let frames = client
        .request(Opcode::Status, Key::default(), Bytes::new())
        .await;
    assert_eq!(frames.last().unwrap().header.status, 0);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_timeout_fails_stale_requests() {
    let node = start_node(|c| {
        c.queue_timeout = 1;
        c.io_thread_num = 1;
        c.nonblocking_io_thread_num = 1;
    })
    .await;
    // One worker, held for longer than the queue timeout.
    let backend = MemoryBackend::slow(Duration::from_millis(1500));
    attach_backend(&node, 1, backend);

    let mut client = RawClient::connect(node.local_addr()).await;
    client.auth("").await;

    // The first request occupies the single worker; the second ages out in
    // the queue and is failed without touching the backend.
    let first = client.make_request(Opcode::Read, test_key(b"held"), Bytes::new());
    let first_id = first.header.trans_id;
    let second = client.make_request(Opcode::Read, test_key(b"stale"), Bytes::new());
    let second_id = second.header.trans_id;
    client.send(first).await;
    client.send(second).await;

    let first_reply = client.collect_reply(first_id).await;
    assert_eq!(first_reply.last().unwrap().header.status, 0);
    let second_reply = client.collect_reply(second_id).await;
    assert_eq!(
        second_reply.last().unwrap().header.status,
        -riptide::core::protocol::status::ETIMEDOUT
    );

    node.shutdown().await;
}
