//! Integration tests against a scripted mock SAM bridge
//!
//! Each test binds a local listener that plays the bridge side of the SAM
//! dialogue, then drives the library against it.

use sam_core::encoding::{i2p_base64_decode, i2p_base64_encode};
use sam_core::{
    default_session_options, Connection, ConnectionState, SamError, SamService, Transport,
    TRANSIENT_DESTINATION,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

/// Serialised identity length of keys produced by `generate_private_key`
const IDENTITY_LEN: usize = 391;

/// Spawn a bridge that accepts one connection and runs `script` on it.
async fn start_bridge<F, Fut>(script: F) -> SocketAddr
where
    F: FnOnce(BufReader<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        script(BufReader::new(stream)).await;
    });
    addr
}

async fn expect_line(bridge: &mut BufReader<TcpStream>, prefix: &str) -> String {
    let mut line = String::new();
    bridge.read_line(&mut line).await.unwrap();
    assert!(
        line.starts_with(prefix),
        "expected a {:?} line, got {:?}",
        prefix,
        line
    );
    line
}

async fn send(bridge: &mut BufReader<TcpStream>, data: &[u8]) {
    bridge.get_mut().write_all(data).await.unwrap();
}

/// Answer the client's HELLO.
async fn handshake(bridge: &mut BufReader<TcpStream>) {
    expect_line(bridge, "HELLO VERSION").await;
    send(bridge, b"HELLO REPLY RESULT=OK VERSION=3.2\n").await;
}

/// A fresh peer identity: (public base64, expected .b32.i2p address)
fn test_peer() -> (String, String) {
    let (private_key, b32_address) = sam_core::generate_key_and_identity();
    let blob = i2p_base64_decode(&private_key).unwrap();
    let public_b64 = i2p_base64_encode(&blob[..IDENTITY_LEN]);
    (public_b64, b32_address)
}

/// Bring a connect-side data connection up against a scripted bridge.
async fn connected_stream<F, Fut>(script: F) -> sam_core::StreamSetup
where
    F: FnOnce(BufReader<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let addr = start_bridge(script).await;
    let service = SamService::new("127.0.0.1", addr.port());
    service
        .connect_to_peer_via_new_connection("test", "peer.b32.i2p", &Default::default())
        .await
        .unwrap()
}

async fn connect_preamble(bridge: &mut BufReader<TcpStream>) {
    handshake(bridge).await;
    expect_line(bridge, "STREAM CONNECT ID=").await;
    send(bridge, b"STREAM STATUS RESULT=OK\n").await;
}

#[tokio::test]
async fn test_establish_control_session() {
    let (session_priv, expected_b32) = sam_core::generate_key_and_identity();
    let addr = start_bridge(move |mut bridge| async move {
        handshake(&mut bridge).await;
        let create = expect_line(&mut bridge, "SESSION CREATE").await;
        assert!(create.contains("STYLE=STREAM"));
        assert!(create.contains("ID=echo"));
        assert!(create.contains("DESTINATION=TRANSIENT"));
        assert!(create.contains("i2p.streaming.profile=INTERACTIVE"));
        let status = format!("SESSION STATUS RESULT=OK DESTINATION={}\n", session_priv);
        send(&mut bridge, status.as_bytes()).await;
        // Hold the control connection open
        sleep(Duration::from_secs(5)).await;
    })
    .await;

    let service = SamService::new("127.0.0.1", addr.port());
    let session = service
        .establish_control_session(
            "echo",
            TRANSIENT_DESTINATION,
            "",
            &default_session_options(),
        )
        .await
        .unwrap();

    assert_eq!(session.session_id, "echo");
    assert_eq!(session.local_b32_address, expected_b32);
    assert!(session.local_b32_address.ends_with(".b32.i2p"));
    assert!(!session.raw_destination_reply.is_empty());
    // The mock answered instantly, which a real bridge cannot do
    assert!(session.maybe_unreliable);

    assert!(service.is_open());
    assert_eq!(service.control_session_id().as_deref(), Some("echo"));
    service.shutdown();
    assert!(!service.is_open());
}

#[tokio::test]
async fn test_establish_not_flagged_when_session_takes_time() {
    let (session_priv, _) = sam_core::generate_key_and_identity();
    let addr = start_bridge(move |mut bridge| async move {
        handshake(&mut bridge).await;
        expect_line(&mut bridge, "SESSION CREATE").await;
        // Cross the 2s plausibility threshold before answering
        sleep(Duration::from_millis(2100)).await;
        let status = format!("SESSION STATUS RESULT=OK DESTINATION={}\n", session_priv);
        send(&mut bridge, status.as_bytes()).await;
        sleep(Duration::from_secs(5)).await;
    })
    .await;

    let service = SamService::new("127.0.0.1", addr.port());
    let session = service
        .establish_control_session("slow", TRANSIENT_DESTINATION, "", &Default::default())
        .await
        .unwrap();

    assert!(!session.maybe_unreliable);
    assert!(session.creation_duration >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_establish_fails_on_duplicated_id() {
    let addr = start_bridge(|mut bridge| async move {
        handshake(&mut bridge).await;
        expect_line(&mut bridge, "SESSION CREATE").await;
        send(&mut bridge, b"SESSION STATUS RESULT=DUPLICATED_ID MESSAGE=taken\n").await;
    })
    .await;

    let service = SamService::new("127.0.0.1", addr.port());
    let err = service
        .establish_control_session("dup", TRANSIENT_DESTINATION, "", &Default::default())
        .await
        .unwrap_err();

    match err {
        SamError::Protocol(message) => assert!(message.contains("DUPLICATED_ID")),
        other => panic!("expected protocol error, got {:?}", other),
    }
    assert!(!service.is_open());
}

#[tokio::test]
async fn test_establish_fails_on_hello_rejection() {
    let addr = start_bridge(|mut bridge| async move {
        expect_line(&mut bridge, "HELLO VERSION").await;
        send(&mut bridge, b"HELLO REPLY RESULT=NOVERSION\n").await;
    })
    .await;

    let service = SamService::new("127.0.0.1", addr.port());
    let err = service
        .establish_control_session("x", TRANSIENT_DESTINATION, "", &Default::default())
        .await
        .unwrap_err();

    match err {
        SamError::Protocol(message) => assert!(message.contains("NOVERSION")),
        other => panic!("expected protocol error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_accept_with_inline_from_destination() {
    let (peer_pub, peer_b32) = test_peer();
    let addr = start_bridge(move |mut bridge| async move {
        handshake(&mut bridge).await;
        expect_line(&mut bridge, "STREAM ACCEPT ID=test SILENT=false").await;
        // Status line and first payload bytes arrive in one segment; the
        // bytes past the newline must not be lost.
        let reply = format!(
            "STREAM STATUS RESULT=OK FROM_DESTINATION={}\nhello there",
            peer_pub
        );
        send(&mut bridge, reply.as_bytes()).await;
        // Then echo whatever the client sends
        let mut buf = [0u8; 64];
        let n = bridge.read(&mut buf).await.unwrap();
        bridge.get_mut().write_all(&buf[..n]).await.unwrap();
    })
    .await;

    let service = SamService::new("127.0.0.1", addr.port());
    let stream = service.accept_stream_via_new_connection("test").await.unwrap();
    assert_eq!(stream.remote_peer_b32_address, peer_b32);
    assert_eq!(stream.connection.state(), ConnectionState::DataStream);

    // Buffered leftover first
    let mut buf = [0u8; 64];
    let n = stream
        .connection
        .stream_read(&mut buf, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(&buf[..n], b"hello there");

    // Then a write/read roundtrip over the socket
    stream
        .connection
        .stream_write(b"pong", Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let n = stream
        .connection
        .stream_read(&mut buf, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(&buf[..n], b"pong");
}

#[tokio::test]
async fn test_accept_with_deferred_from_destination() {
    let (peer_pub, peer_b32) = test_peer();
    let addr = start_bridge(move |mut bridge| async move {
        handshake(&mut bridge).await;
        expect_line(&mut bridge, "STREAM ACCEPT").await;
        send(&mut bridge, b"STREAM STATUS RESULT=OK\n").await;
        // The peer shows up later; the bridge pushes its destination then
        sleep(Duration::from_millis(500)).await;
        let line = format!("{}\n", peer_pub);
        send(&mut bridge, line.as_bytes()).await;
        send(&mut bridge, b"ping").await;
    })
    .await;

    let service = SamService::new("127.0.0.1", addr.port());
    let stream = service.accept_stream_via_new_connection("test").await.unwrap();
    assert_eq!(stream.remote_peer_b32_address, peer_b32);

    let mut buf = [0u8; 16];
    let n = stream
        .connection
        .stream_read(&mut buf, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(&buf[..n], b"ping");
}

#[tokio::test]
async fn test_accept_rejects_unparseable_peer_destination() {
    let addr = start_bridge(|mut bridge| async move {
        handshake(&mut bridge).await;
        expect_line(&mut bridge, "STREAM ACCEPT").await;
        send(&mut bridge, b"STREAM STATUS RESULT=OK FROM_DESTINATION=AAAA\n").await;
    })
    .await;

    let service = SamService::new("127.0.0.1", addr.port());
    let err = service
        .accept_stream_via_new_connection("test")
        .await
        .unwrap_err();
    assert!(matches!(err, SamError::InvalidDestination(_)));
}

#[tokio::test]
async fn test_connect_to_peer_roundtrip() {
    let stream = connected_stream(|mut bridge| async move {
        handshake(&mut bridge).await;
        let connect = expect_line(&mut bridge, "STREAM CONNECT").await;
        assert!(connect.contains("ID=test"));
        assert!(connect.contains("DESTINATION=peer.b32.i2p"));
        assert!(connect.contains("SILENT=false"));
        send(&mut bridge, b"STREAM STATUS RESULT=OK\n").await;

        let mut buf = [0u8; 64];
        let n = bridge.read(&mut buf).await.unwrap();
        bridge.get_mut().write_all(&buf[..n]).await.unwrap();
    })
    .await;

    assert_eq!(stream.remote_peer_b32_address, "peer.b32.i2p");
    stream
        .connection
        .stream_write(b"echo me", Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let n = stream
        .connection
        .stream_read(&mut buf, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(&buf[..n], b"echo me");
}

#[tokio::test]
async fn test_connect_fails_when_peer_unreachable() {
    let addr = start_bridge(|mut bridge| async move {
        handshake(&mut bridge).await;
        expect_line(&mut bridge, "STREAM CONNECT").await;
        send(&mut bridge, b"STREAM STATUS RESULT=CANT_REACH_PEER\n").await;
    })
    .await;

    let service = SamService::new("127.0.0.1", addr.port());
    let err = service
        .connect_to_peer_via_new_connection("test", "gone.b32.i2p", &Default::default())
        .await
        .unwrap_err();

    match err {
        SamError::Protocol(message) => assert!(message.contains("CANT_REACH_PEER")),
        other => panic!("expected protocol error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_read_times_out_against_silent_peer() {
    let stream = connected_stream(|mut bridge| async move {
        connect_preamble(&mut bridge).await;
        // Say nothing, keep the socket open
        sleep(Duration::from_secs(10)).await;
    })
    .await;

    let started = Instant::now();
    let mut buf = [0u8; 16];
    let err = stream
        .connection
        .stream_read(&mut buf, Some(Duration::from_millis(300)))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, SamError::Timeout));
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);
    // A read timeout does not close the connection
    assert!(stream.connection.is_open());
    assert_eq!(stream.connection.state(), ConnectionState::DataStream);
}

#[tokio::test]
async fn test_close_cancels_pending_read() {
    let stream = connected_stream(|mut bridge| async move {
        connect_preamble(&mut bridge).await;
        sleep(Duration::from_secs(10)).await;
    })
    .await;

    let connection = Arc::new(stream.connection);
    let reader = {
        let connection = connection.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            connection.stream_read(&mut buf, None).await
        })
    };

    sleep(Duration::from_millis(100)).await;
    let closed_at = Instant::now();
    connection.close();
    let result = reader.await.unwrap();

    assert!(matches!(result, Err(SamError::Cancelled)));
    assert!(closed_at.elapsed() < Duration::from_millis(500));
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_cancel_read_operations_leaves_connection_usable() {
    let stream = connected_stream(|mut bridge| async move {
        connect_preamble(&mut bridge).await;
        // First payload comes only after the client asks twice
        sleep(Duration::from_millis(400)).await;
        send(&mut bridge, b"late").await;
        sleep(Duration::from_secs(5)).await;
    })
    .await;

    let connection = Arc::new(stream.connection);
    let reader = {
        let connection = connection.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            connection.stream_read(&mut buf, None).await
        })
    };

    sleep(Duration::from_millis(100)).await;
    connection.cancel_read_operations();
    let result = reader.await.unwrap();
    assert!(matches!(result, Err(SamError::Cancelled)));

    // The socket stayed open; the next read sees the late payload
    assert!(connection.is_open());
    let mut buf = [0u8; 16];
    let n = connection
        .stream_read(&mut buf, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(&buf[..n], b"late");
}

#[tokio::test]
async fn test_close_aborts_pending_write() {
    let stream = connected_stream(|mut bridge| async move {
        connect_preamble(&mut bridge).await;
        // Never read: the client's kernel buffers fill and its write stalls
        sleep(Duration::from_secs(10)).await;
    })
    .await;

    let connection = Arc::new(stream.connection);
    let writer = {
        let connection = connection.clone();
        tokio::spawn(async move {
            let data = vec![0x5au8; 32 * 1024 * 1024];
            connection.stream_write(&data, None).await
        })
    };

    sleep(Duration::from_millis(100)).await;
    let closed_at = Instant::now();
    connection.close();
    let result = writer.await.unwrap();

    assert!(matches!(result, Err(SamError::Cancelled)));
    assert!(closed_at.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_close_aborts_pending_control_command() {
    let addr = start_bridge(|mut bridge| async move {
        handshake(&mut bridge).await;
        // Never read the command and never reply
        sleep(Duration::from_secs(10)).await;
    })
    .await;

    let connection = Arc::new(Connection::new(Transport::Tcp));
    connection
        .connect("127.0.0.1", addr.port(), Duration::from_secs(5))
        .await
        .unwrap();
    connection.perform_hello(Duration::from_secs(5)).await.unwrap();

    let command = {
        let connection = connection.clone();
        tokio::spawn(async move {
            // A command big enough that the write itself stalls in the
            // kernel buffers while the bridge refuses to read
            let command = format!(
                "SESSION CREATE STYLE=STREAM ID=big DESTINATION={}",
                "A".repeat(32 * 1024 * 1024)
            );
            connection
                .send_command_and_wait_reply(&command, Duration::from_secs(30))
                .await
        })
    };

    sleep(Duration::from_millis(100)).await;
    let closed_at = Instant::now();
    connection.close();
    let result = command.await.unwrap();

    assert!(matches!(result, Err(SamError::Cancelled)));
    assert!(closed_at.elapsed() < Duration::from_secs(1));
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_concurrent_writes_are_not_interleaved() {
    const CHUNK: usize = 16 * 1024;

    let stream = connected_stream(|mut bridge| async move {
        connect_preamble(&mut bridge).await;
        let mut received = vec![0u8; 2 * CHUNK];
        bridge.read_exact(&mut received).await.unwrap();
        // Send everything back for the client to inspect
        bridge.get_mut().write_all(&received).await.unwrap();
    })
    .await;

    let connection = Arc::new(stream.connection);
    let a = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .stream_write(&[b'a'; CHUNK], Some(Duration::from_secs(10)))
                .await
        })
    };
    let b = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .stream_write(&[b'b'; CHUNK], Some(Duration::from_secs(10)))
                .await
        })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let mut received = Vec::with_capacity(2 * CHUNK);
    let mut buf = [0u8; 8192];
    while received.len() < 2 * CHUNK {
        let n = connection
            .stream_read(&mut buf, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        received.extend_from_slice(&buf[..n]);
    }

    let mut a_then_b = vec![b'a'; CHUNK];
    a_then_b.extend_from_slice(&[b'b'; CHUNK]);
    let mut b_then_a = vec![b'b'; CHUNK];
    b_then_a.extend_from_slice(&[b'a'; CHUNK]);
    assert!(
        received == a_then_b || received == b_then_a,
        "writes were interleaved"
    );
}

#[tokio::test]
async fn test_stream_read_reports_eof() {
    let stream = connected_stream(|mut bridge| async move {
        connect_preamble(&mut bridge).await;
        // Bridge closes the data connection cleanly
    })
    .await;

    let mut buf = [0u8; 16];
    let err = stream
        .connection
        .stream_read(&mut buf, Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, SamError::Eof));
}

#[tokio::test]
async fn test_naming_lookup() {
    let (peer_pub, peer_b32) = test_peer();
    let addr = start_bridge(move |mut bridge| async move {
        handshake(&mut bridge).await;
        expect_line(&mut bridge, "NAMING LOOKUP NAME=example.i2p").await;
        let reply = format!("NAMING REPLY RESULT=OK NAME=example.i2p VALUE={}\n", peer_pub);
        send(&mut bridge, reply.as_bytes()).await;
    })
    .await;

    let service = SamService::new("127.0.0.1", addr.port());
    let resolved = service
        .lookup_name_via_new_connection("example.i2p")
        .await
        .unwrap();

    assert_eq!(resolved.name, "example.i2p");
    assert_eq!(resolved.b32_address, peer_b32);
    assert!(!resolved.destination.is_empty());
}

#[tokio::test]
async fn test_naming_lookup_key_not_found() {
    let addr = start_bridge(|mut bridge| async move {
        handshake(&mut bridge).await;
        expect_line(&mut bridge, "NAMING LOOKUP").await;
        send(&mut bridge, b"NAMING REPLY RESULT=KEY_NOT_FOUND NAME=nope.i2p\n").await;
    })
    .await;

    let service = SamService::new("127.0.0.1", addr.port());
    let err = service
        .lookup_name_via_new_connection("nope.i2p")
        .await
        .unwrap_err();
    match err {
        SamError::Protocol(message) => assert!(message.contains("KEY_NOT_FOUND")),
        other => panic!("expected protocol error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dest_generate() {
    let addr = start_bridge(|mut bridge| async move {
        handshake(&mut bridge).await;
        expect_line(&mut bridge, "DEST GENERATE SIGNATURE_TYPE=7").await;
        send(&mut bridge, b"DEST REPLY PUB=AAAApub PRIV=BBBBpriv\n").await;
    })
    .await;

    let service = SamService::new("127.0.0.1", addr.port());
    let generated = service
        .generate_destination_via_new_connection()
        .await
        .unwrap();
    assert_eq!(generated.pub_key, "AAAApub");
    assert_eq!(generated.priv_key, "BBBBpriv");
}
