// tests/integration/roundtrip_test.rs

//! Request/reply roundtrips over real sockets: exact frame sequences,
//! session-level calls, backendless commands and the accept path.

use super::test_helpers::*;
use bytes::Bytes;
use riptide::core::protocol::{CommandFlags, Key, Opcode, status};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_roundtrip_is_exactly_two_frames() {
    let node = start_node(|_| {}).await;
    attach_backend(&node, 1, Arc::new(MemoryBackend::default()));

    let mut client = RawClient::connect(node.local_addr()).await;
    client.auth("").await;

    let key = test_key(b"roundtrip-object");
    let body = Bytes::from(vec![7u8; 64]);
    let frames = client.request(Opcode::Write, key, body.clone()).await;
    assert_eq!(frames.last().unwrap().header.status, 0);

    let frames = client.request(Opcode::Read, key, Bytes::new()).await;
    assert_eq!(frames.len(), 2, "one data frame plus one ack");

    let data = &frames[0];
    assert!(data.header.flags.contains(CommandFlags::REPLY));
    assert!(data.header.flags.contains(CommandFlags::MORE));
    assert_eq!(data.payload, body);

    let ack = &frames[1];
    assert!(ack.header.flags.contains(CommandFlags::REPLY));
    assert!(ack.header.flags.contains(CommandFlags::DESTROY));
    assert_eq!(ack.header.size, 0);
    assert_eq!(ack.header.status, 0);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_write_then_read() {
    let server = start_node(|_| {}).await;
    attach_backend(&server, 1, Arc::new(MemoryBackend::default()));
    let client = start_node(|_| {}).await;

    let session = client.session();
    let key = test_key(b"session-object");
    let body = Bytes::from_static(b"stored through a session");

    session
        .call(server.local_addr(), Opcode::Write, key, body.clone())
        .await
        .expect("write should succeed");
    let reply = session
        .call(server.local_addr(), Opcode::Read, key, Bytes::new())
        .await
        .expect("read should succeed");
    assert_eq!(reply.data(), body);
    assert_eq!(reply.status(), 0);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unrouted_key_answers_enxio() {
    // No backend attached: key resolution fails and the request is answered
    // with a device-not-configured status rather than a reset.
    let server = start_node(|_| {}).await;
    let mut client = RawClient::connect(server.local_addr()).await;
    client.auth("").await;

    let frames = client
        .request(Opcode::Read, test_key(b"nowhere"), Bytes::new())
        .await;
    assert_eq!(frames.last().unwrap().header.status, -status::ENXIO);

    // The connection survives and keeps serving.
    let frames = client
        .request(Opcode::Status, Key::default(), Bytes::new())
        .await;
    assert_eq!(frames.last().unwrap().header.status, 0);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_auth_cookie_mismatch_resets_connection() {
    let server = start_node(|c| c.auth_cookie = "the-cluster-secret".into()).await;

    let mut client = RawClient::connect(server.local_addr()).await;
    let frames = client.auth_raw("wrong-cookie").await;
    assert_eq!(frames.last().unwrap().header.status, -status::EPERM);

    // The node drops the peer after a failed exchange.
    let eof = tokio::time::timeout(Duration::from_secs(5), client.next_frame())
        .await
        .expect("connection should close promptly");
    assert!(eof.is_none());

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nolock_requests_are_served() {
    let node = start_node(|_| {}).await;
    attach_backend(&node, 1, Arc::new(MemoryBackend::default()));

    let mut client = RawClient::connect(node.local_addr()).await;
    client.auth("").await;

    let mut frame = client.make_request(Opcode::Read, test_key(b"nb-object"), Bytes::new());
    frame.header.flags |= CommandFlags::NOLOCK;
    let trans_id = frame.header.trans_id;
    client.send(frame).await;
    let frames = client.collect_reply(trans_id).await;

    // Replies preserve the service class of the request.
    assert!(frames.last().unwrap().header.flags.contains(CommandFlags::NOLOCK));
    assert_eq!(frames.last().unwrap().header.status, 0);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_accept_storm_all_peers_served() {
    let node = start_node(|_| {}).await;
    let addr = node.local_addr();

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..100 {
        tasks.spawn(async move {
            let mut client = RawClient::connect(addr).await;
            client.auth("").await;
            client
        });
    }

    let mut clients = Vec::new();
    while let Some(res) = tasks.join_next().await {
        clients.push(res.expect("client task"));
    }
    assert_eq!(clients.len(), 100);
    assert_eq!(node.state().connections.len(), 100);

    drop(clients);
    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_monitor_stat_snapshot() {
    let server = start_node(|_| {}).await;
    attach_backend(&server, 5, Arc::new(MemoryBackend::default()));
    let client = start_node(|_| {}).await;

    let reply = client
        .session()
        .call(
            server.local_addr(),
            Opcode::MonitorStat,
            Key::default(),
            Bytes::new(),
        )
        .await
        .expect("monitor stat");
    let snapshot: serde_json::Value = serde_json::from_slice(&reply.data()).unwrap();

    assert!(snapshot["io"]["workers"].as_u64().unwrap() > 0);
    assert_eq!(snapshot["backends"][0], 5);
    // route_list_on_stat defaults to on, so the route table rides along.
    assert!(snapshot["route_entries"].is_array());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_region_payload_is_streamed() {
    use futures::StreamExt;
    use riptide::config::Config;
    use riptide::connection::{ConnKind, Connection};
    use riptide::core::NodeState;
    use riptide::core::protocol::{CommandHeader, FrameCodec};
    use riptide::core::request::{OutboundFrame, Payload};
    use std::io::Write;
    use tokio_util::codec::Framed;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = listener.local_addr().unwrap();
    let (sock_tx, sock_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = sock_tx.send(stream);
    });

    let state = NodeState::initialize(Config::default());
    let stream = tokio::net::TcpStream::connect(peer_addr).await.unwrap();
    let conn = Connection::spawn(&state, stream, ConnKind::Dialed).unwrap();

    // A file whose middle region becomes the frame payload.
    let content: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&content).unwrap();
    tmp.flush().unwrap();
    let file = Arc::new(tmp.reopen().unwrap());

    let mut header = CommandHeader::new(Key::default(), Opcode::Read);
    header.flags = CommandFlags::REPLY | CommandFlags::MORE;
    conn.enqueue_send(OutboundFrame::new(
        header,
        Payload::FileRegion {
            file,
            offset: 100,
            len: 4096,
        },
    ))
    .await
    .unwrap();

    let peer = sock_rx.await.unwrap();
    let mut framed = Framed::new(peer, FrameCodec::default());
    let decoded = tokio::time::timeout(Duration::from_secs(10), framed.next())
        .await
        .expect("frame arrives")
        .unwrap()
        .unwrap();
    assert_eq!(decoded.frame.header.size, 4096);
    assert_eq!(&decoded.frame.payload[..], &content[100..100 + 4096]);

    conn.reset(&state, -status::ESHUTDOWN);
    state.set_need_exit();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_remote_downloads_route_table() {
    let server = start_node(|_| {}).await;
    attach_backend(&server, 9, Arc::new(MemoryBackend::default()));
    let client = start_node(|_| {}).await;

    assert!(client.state().routes.is_empty());
    client
        .add_remote(server.local_addr())
        .await
        .expect("add remote");
    assert_eq!(client.state().routes.len(), 1);

    client.shutdown().await;
    server.shutdown().await;
}
