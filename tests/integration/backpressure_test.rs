// tests/integration/backpressure_test.rs

//! Flow control: pool overload replies, send-queue watermarks and global
//! admission backpressure.

use super::test_helpers::*;
use bytes::Bytes;
use riptide::config::Config;
use riptide::connection::{
    ConnKind, Connection, SEND_WATERMARK_HIGH, SEND_WATERMARK_LOW,
};
use riptide::core::NodeState;
use riptide::core::protocol::{CommandFlags, CommandHeader, Key, Opcode, status};
use riptide::core::request::{OutboundFrame, Payload};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bounded_pool_answers_enobufs() {
    let node = start_node(|c| {
        c.queue_limit = 1;
        c.io_thread_num = 1;
        c.nonblocking_io_thread_num = 1;
    })
    .await;
    attach_backend(&node, 1, MemoryBackend::slow(Duration::from_millis(300)));

    let mut client = RawClient::connect(node.local_addr()).await;
    client.auth("").await;

    let mut ids = Vec::new();
    for i in 0..8u8 {
        let frame = client.make_request(Opcode::Read, test_key(&[b'k', i]), Bytes::new());
        ids.push(frame.header.trans_id);
        client.send(frame).await;
    }

    let mut ok = 0;
    let mut overloaded = 0;
    for id in ids {
        let frames = client.collect_reply(id).await;
        match frames.last().unwrap().header.status {
            0 => ok += 1,
            st if st == -status::ENOBUFS => overloaded += 1,
            other => panic!("unexpected terminal status {other}"),
        }
    }

    assert!(ok >= 1, "the worker must serve at least one request");
    assert!(overloaded >= 1, "the bounded queue must reject at least one");

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_send_watermark_parks_and_wakes_producer() {
    // A peer that accepts and initially refuses to read.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = listener.local_addr().unwrap();
    let (sock_tx, sock_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = sock_tx.send(stream);
    });

    let mut config = Config::default();
    config.send_limit = 0;
    let state = NodeState::initialize(config);
    let stream = tokio::net::TcpStream::connect(peer_addr).await.unwrap();
    let conn = Connection::spawn(&state, stream, ConnKind::Dialed).unwrap();
    let mut peer = sock_rx.await.unwrap();

    let producer = {
        let conn = conn.clone();
        // Frames big enough that socket buffers cannot absorb the queue.
        let body = bytes::Bytes::from(vec![0u8; 1024]);
        tokio::spawn(async move {
            for i in 0..(SEND_WATERMARK_HIGH + 10) {
                let mut header = CommandHeader::new(Key::default(), Opcode::Status);
                header.trans_id = i as u64;
                conn.enqueue_send(OutboundFrame::new(
                    header,
                    Payload::Bytes(body.clone()),
                ))
                .await
                .unwrap();
            }
        })
    };

    // With the peer not reading, the producer must park at the high
    // watermark instead of queueing without bound.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!producer.is_finished(), "producer should park at the high watermark");
    let depth = conn.send_queue_len();
    assert!(depth <= SEND_WATERMARK_HIGH, "queue depth {depth} above high watermark");
    assert!(depth > SEND_WATERMARK_LOW, "queue should be holding near the watermark");

    // Draining the peer lets the writer cross the low watermark and wake
    // the producer within bounded time.
    let drain = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match peer.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::time::timeout(Duration::from_secs(30), producer)
        .await
        .expect("producer should unblock after the low watermark")
        .unwrap();

    conn.reset(&state, -status::ESHUTDOWN);
    state.set_need_exit();
    drain.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_admission_suspends_receives_until_pools_drain() {
    let node = start_node(|c| {
        c.io_thread_num = 1;
        c.nonblocking_io_thread_num = 1;
        c.wait_timeout = 120;
        c.stall_count = 0;
    })
    .await;
    // Global pools 1+1 plus the backend pair 1+1: four workers, so the
    // admission watermark sits at 4000 queued requests.
    let backend = MemoryBackend::gated();
    attach_backend(&node, 1, backend.clone());

    const CLIENTS: usize = 4;
    const PER_CLIENT: usize = 1101;
    let addr = node.local_addr();

    let mut tasks = tokio::task::JoinSet::new();
    for c in 0..CLIENTS {
        tasks.spawn(async move {
            let mut client = RawClient::connect(addr).await;
            client.auth("").await;
            for i in 0..PER_CLIENT {
                let frame = client.make_request(
                    Opcode::Read,
                    test_key(&[b'c', c as u8, (i % 251) as u8, (i / 251) as u8]),
                    Bytes::new(),
                );
                client.send(frame).await;
            }
            // Count terminal acks; every request must complete.
            let mut acks = 0;
            while acks < PER_CLIENT {
                let frame = tokio::time::timeout(Duration::from_secs(60), client.next_frame())
                    .await
                    .expect("acks keep flowing")
                    .expect("connection stays open");
                if frame.header.flags.contains(CommandFlags::DESTROY) {
                    assert_eq!(frame.header.status, 0);
                    acks += 1;
                }
            }
            acks
        });
    }

    // The gated backend clogs its pool; admission must close and park the
    // receive paths.
    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    while !node.state().admission.is_blocked() {
        assert!(
            std::time::Instant::now() < deadline,
            "admission should deny while pools are clogged"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    backend.release();

    let mut total = 0;
    while let Some(res) = tasks.join_next().await {
        total += res.expect("client task");
    }
    assert_eq!(total, CLIENTS * PER_CLIENT, "no request may be dropped");

    node.shutdown().await;
}
