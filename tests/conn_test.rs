//! Connection lifecycle tests over real loopback sockets
//!
//! Run with: cargo test --test conn_test

use slsk::proto::frame::{MessageBuilder, MessageReader};
use slsk::proto::ServerCode;
use slsk::{Connection, ConnectionEvent, ConnectionOptions, Error, TokenBucket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (client, server)
}

fn options() -> ConnectionOptions {
    ConnectionOptions::default()
}

// =============================================================================
// CONNECT AND FRAME EXCHANGE
// =============================================================================

#[tokio::test]
async fn test_connect_and_exchange_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // read one frame: 4-byte length then body
        let mut prefix = [0u8; 4];
        stream.read_exact(&mut prefix).await.unwrap();
        let mut body = vec![0u8; u32::from_le_bytes(prefix) as usize];
        stream.read_exact(&mut body).await.unwrap();

        // echo a ping frame back
        let frame = MessageBuilder::server(ServerCode::Ping).build();
        stream.write_all(&frame).await.unwrap();
        body
    });

    let cancel = CancellationToken::new();
    let conn = Connection::new(addr, options(), None);
    conn.connect(&cancel).await.unwrap();
    assert!(conn.is_connected());

    let frame = MessageBuilder::server(ServerCode::SetListenPort)
        .u32(2234)
        .build();
    conn.write(&frame, &cancel).await.unwrap();

    let received = server.await.unwrap();
    let mut reader = MessageReader::new(received.into());
    reader
        .expect_code_u32(ServerCode::SetListenPort as u32)
        .unwrap();
    assert_eq!(reader.u32().unwrap(), 2234);

    let body = conn.read_frame(&cancel).await.unwrap();
    let mut reader = MessageReader::new(body);
    assert_eq!(reader.code_u32().unwrap(), ServerCode::Ping as u32);

    conn.disconnect("done").await;
}

#[tokio::test]
async fn test_write_requires_connected_state() {
    let conn = Connection::new("127.0.0.1:1".parse().unwrap(), options(), None);
    let cancel = CancellationToken::new();
    assert!(matches!(
        conn.write(b"data", &cancel).await,
        Err(Error::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_empty_write_is_rejected() {
    let (client, _server) = socket_pair().await;
    let conn = Connection::adopt(client, options(), None);
    let cancel = CancellationToken::new();
    assert!(matches!(
        conn.write(b"", &cancel).await,
        Err(Error::InvalidState(_))
    ));
}

// =============================================================================
// DISCONNECT SEMANTICS
// =============================================================================

#[tokio::test]
async fn test_disconnected_event_fires_exactly_once() {
    let (client, _server) = socket_pair().await;
    let disconnects = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&disconnects);
    let conn = Connection::adopt(
        client,
        options(),
        Some(Box::new(move |event| {
            if matches!(event, ConnectionEvent::Disconnected { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })),
    );

    let (a, b) = (Arc::clone(&conn), Arc::clone(&conn));
    let t1 = tokio::spawn(async move { a.disconnect("first").await });
    let t2 = tokio::spawn(async move { b.disconnect("second").await });
    t1.await.unwrap();
    t2.await.unwrap();
    conn.disconnect("third").await;

    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(conn.wait_for_disconnect().await, "first");
}

#[tokio::test]
async fn test_remote_close_fails_reads() {
    let (client, server) = socket_pair().await;
    let conn = Connection::adopt(client, options(), None);
    drop(server);

    let cancel = CancellationToken::new();
    assert!(matches!(
        conn.read_frame(&cancel).await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_inactivity_timeout_disconnects() {
    let (client, _server) = socket_pair().await;
    let conn = Connection::adopt(
        client,
        ConnectionOptions {
            inactivity_timeout_ms: 200,
            ..options()
        },
        None,
    );

    let reason = tokio::time::timeout(Duration::from_secs(3), conn.wait_for_disconnect())
        .await
        .expect("watchdog should have fired");
    assert_eq!(reason, "inactivity timeout");
}

// =============================================================================
// WRITE QUEUE
// =============================================================================

#[tokio::test]
async fn test_full_write_queue_drops_connection() {
    let (client, _server) = socket_pair().await;
    let conn = Connection::adopt(
        client,
        ConnectionOptions {
            write_queue_size: 1,
            ..options()
        },
        None,
    );

    // a bucket that never grants keeps the streaming write parked on the
    // only queue slot
    let stalled = TokenBucket::new(0, Duration::from_secs(3600));
    let cancel = CancellationToken::new();
    let streamer = Arc::clone(&conn);
    let stream_cancel = cancel.clone();
    tokio::spawn(async move {
        let payload = [0u8; 64];
        let _ = streamer
            .write_stream(64, &mut &payload[..], &stalled, None, &stream_cancel)
            .await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = conn.write(b"overflow", &cancel).await;
    assert!(matches!(result, Err(Error::WriteDropped(_))));
    assert_eq!(conn.wait_for_disconnect().await, "write buffer full");
}

// =============================================================================
// GOVERNED STREAMS
// =============================================================================

/// A 10 KB read through a 1024 bytes / 100 ms bucket needs ten refills, so
/// it cannot complete in under ~900 ms, and the byte counts delivered to the
/// progress reporter must account for every byte exactly once.
#[tokio::test]
async fn test_rate_limited_read() {
    const PAYLOAD: usize = 10 * 1024;

    let (client, mut server) = socket_pair().await;
    let conn = Connection::adopt(client, options(), None);

    tokio::spawn(async move {
        let data = vec![0xA5u8; PAYLOAD];
        server.write_all(&data).await.unwrap();
        // keep the socket open until the reader is done
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let bucket = TokenBucket::new(1024, Duration::from_millis(100));
    let cancel = CancellationToken::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    let mut file = tokio::fs::File::create(&path).await.unwrap();

    let last_reported = Arc::new(AtomicU32::new(0));
    let reporter = Arc::clone(&last_reported);
    let progress = move |done: u64, total: u64| {
        assert_eq!(total, PAYLOAD as u64);
        reporter.store(done as u32, Ordering::SeqCst);
    };

    let start = Instant::now();
    let received = conn
        .read_stream(
            PAYLOAD as u64,
            &mut file,
            &bucket,
            Some(&progress as &slsk::ProgressFn),
            &cancel,
        )
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(received, PAYLOAD as u64);
    assert_eq!(last_reported.load(Ordering::SeqCst) as usize, PAYLOAD);
    assert!(
        elapsed >= Duration::from_millis(900),
        "completed too fast: {elapsed:?}"
    );
    assert_eq!(
        tokio::fs::metadata(&path).await.unwrap().len(),
        PAYLOAD as u64
    );
}

#[tokio::test]
async fn test_write_stream_moves_exact_length() {
    const PAYLOAD: usize = 64 * 1024;

    let (client, mut server) = socket_pair().await;
    let conn = Connection::adopt(client, options(), None);

    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; PAYLOAD];
        server.read_exact(&mut buf).await.unwrap();
        buf
    });

    let payload: Vec<u8> = (0..PAYLOAD).map(|i| (i % 251) as u8).collect();
    let cancel = CancellationToken::new();
    let sent = conn
        .write_stream(
            PAYLOAD as u64,
            &mut payload.as_slice(),
            &slsk::Unlimited,
            None,
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(sent, PAYLOAD as u64);
    assert_eq!(reader.await.unwrap(), payload);
}

#[tokio::test]
async fn test_governor_wait_is_cancellable() {
    let (client, _server) = socket_pair().await;
    let conn = Connection::adopt(client, options(), None);
    let empty = TokenBucket::new(0, Duration::from_secs(3600));
    let cancel = CancellationToken::new();

    let c = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        c.cancel();
    });
    let payload = [0u8; 16];
    let result = conn
        .write_stream(16, &mut &payload[..], &empty, None, &cancel)
        .await;
    assert!(matches!(result, Err(Error::Cancelled)));
}

// =============================================================================
// HANDOFF
// =============================================================================

#[tokio::test]
async fn test_handoff_releases_socket_without_events() {
    let (client, mut server) = socket_pair().await;
    let events = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&events);
    let conn = Connection::adopt(
        client,
        options(),
        Some(Box::new(move |event| {
            if matches!(event, ConnectionEvent::Disconnected { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })),
    );

    let mut stream = conn.handoff().unwrap();
    stream.write_all(b"alive").await.unwrap();

    let mut buf = [0u8; 5];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"alive");

    // further operations on the husk fail, and no event ever fired
    let cancel = CancellationToken::new();
    assert!(conn.write(b"x", &cancel).await.is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(events.load(Ordering::SeqCst), 0);
}
