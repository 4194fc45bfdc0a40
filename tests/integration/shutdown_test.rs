// tests/integration/shutdown_test.rs

//! Node shutdown: ordered teardown, transaction completion under load and
//! clean lifecycle.

use super::test_helpers::*;
use bytes::Bytes;
use riptide::core::protocol::Opcode;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_under_load_completes_every_transaction() {
    let server = start_node(|c| {
        c.io_thread_num = 2;
        c.nonblocking_io_thread_num = 1;
    })
    .await;
    attach_backend(&server, 1, MemoryBackend::slow(Duration::from_millis(50)));

    let client = start_node(|c| c.wait_timeout = 30).await;
    let addr = server.local_addr();

    let mut calls = tokio::task::JoinSet::new();
    for i in 0..100u8 {
        let session = client.session();
        calls.spawn(async move {
            session
                .call(addr, Opcode::Read, test_key(&[b'l', i]), Bytes::new())
                .await
        });
    }

    // Let part of the load get in flight, then pull the node down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    tokio::time::timeout(Duration::from_secs(15), server.shutdown())
        .await
        .expect("shutdown must not hang");

    // Every issued transaction completes, successfully or with an error;
    // none may hang past its completion handle.
    let mut completed = 0;
    while let Some(res) = tokio::time::timeout(Duration::from_secs(30), calls.join_next())
        .await
        .expect("calls must complete after shutdown")
    {
        let _ = res.expect("call task must not panic");
        completed += 1;
    }
    assert_eq!(completed, 100);

    // The client noticed the peer loss.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !client.state().connections.is_empty() {
        assert!(std::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_resets_accepted_peers() {
    let server = start_node(|_| {}).await;
    attach_backend(&server, 1, Arc::new(MemoryBackend::default()));

    let mut client = RawClient::connect(server.local_addr()).await;
    client.auth("").await;
    assert_eq!(server.state().connections.len(), 1);

    server.shutdown().await;

    // The peer sees the socket close rather than a hang.
    let eof = tokio::time::timeout(Duration::from_secs(5), client.next_frame())
        .await
        .expect("connection should close on shutdown");
    assert!(eof.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clean_lifecycle() {
    let node = start_node(|_| {}).await;
    assert!(node.local_addr().port() > 0);
    tokio::time::timeout(Duration::from_secs(10), node.shutdown())
        .await
        .expect("idle node shuts down promptly");
}
