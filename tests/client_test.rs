//! End-to-end scenarios against loopback endpoints
//!
//! Run with: cargo test --test client_test

use slsk::net::peer_manager::PeerFrame;
use slsk::net::{slots, DistributedManager, Listener, PeerConnectionManager};
use slsk::proto::distributed::{DistributedMessage, DistributedSearch};
use slsk::proto::frame::{MessageBuilder, MessageReader};
use slsk::proto::peer::PeerInitMessage;
use slsk::proto::server::{ServerRequest, ServerResponse};
use slsk::proto::{ConnectionType, ServerCode};
use slsk::{
    ClientEvent, ClientOptions, ConnectionOptions, Error, EventBus, NoShareHost, SoulseekClient,
    TokenFactory, WaitKey, Waiter,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

async fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await.ok()?;
    let mut body = vec![0u8; u32::from_le_bytes(prefix) as usize];
    stream.read_exact(&mut body).await.ok()?;
    Some(body)
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn quiet_options() -> ClientOptions {
    ClientOptions {
        enable_listener: false,
        enable_distributed_network: false,
        accept_distributed_children: false,
        ..ClientOptions::default()
    }
}

/// Accept one session and answer its login, then drain whatever else the
/// client writes until it hangs up.
fn spawn_fake_server(listener: TcpListener, accept_login: bool) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let body = read_frame(&mut stream).await.expect("login frame");
        let mut reader = MessageReader::new(body.into());
        reader.expect_code_u32(ServerCode::Login as u32).unwrap();
        let username = reader.string().unwrap();
        let password = reader.string().unwrap();
        let _version = reader.u32().unwrap();
        let hash = reader.string().unwrap();
        assert_eq!(
            hash,
            format!("{:x}", md5::compute(format!("{username}{password}")))
        );

        let reply = if accept_login {
            MessageBuilder::server(ServerCode::Login)
                .bool(true)
                .string("Welcome to soulseek!")
                .ip(Ipv4Addr::new(127, 0, 0, 1))
                .build()
        } else {
            MessageBuilder::server(ServerCode::Login)
                .bool(false)
                .string("INVALIDPASS")
                .build()
        };
        stream.write_all(&reply).await.unwrap();

        while read_frame(&mut stream).await.is_some() {}
    })
}

// =============================================================================
// LOGIN
// =============================================================================

#[tokio::test]
async fn test_login_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    spawn_fake_server(listener, true);

    let client = SoulseekClient::new(quiet_options(), Arc::new(NoShareHost)).unwrap();
    client.connect(&addr.to_string()).await.unwrap();
    let greeting = client.login("u", "p").await.unwrap();
    assert_eq!(greeting, "Welcome to soulseek!");
    client.disconnect("test over").await;
}

#[tokio::test]
async fn test_login_rejected_surfaces_reason() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    spawn_fake_server(listener, false);

    let client = SoulseekClient::new(quiet_options(), Arc::new(NoShareHost)).unwrap();
    client.connect(&addr.to_string()).await.unwrap();
    match client.login("u", "wrong").await {
        Err(Error::LoginRejected(reason)) => assert_eq!(reason, "INVALIDPASS"),
        other => panic!("unexpected login outcome: {other:?}"),
    }
    client.disconnect("test over").await;
}

// =============================================================================
// INBOUND CLASSIFICATION
// =============================================================================

#[tokio::test]
async fn test_pierce_firewall_resolves_solicitation_wait() {
    let port = free_port();
    let waiter = Waiter::new(Duration::from_secs(5));
    let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
    let _listener = Listener::bind(port, ConnectionOptions::default(), waiter.clone(), inbound_tx)
        .await
        .unwrap();

    let wait = waiter.wait::<TcpStream>(
        WaitKey::named(slots::SOLICITED_CONNECTION).with(77u32),
        Some(Duration::from_secs(2)),
        None,
    );

    let mut dialer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    dialer
        .write_all(&PeerInitMessage::PierceFirewall { token: 77 }.to_bytes())
        .await
        .unwrap();

    let mut adopted = wait.await.expect("pierce should resolve the wait");

    // the socket is live in both directions after the handoff
    adopted.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    dialer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn test_pierce_with_unknown_token_is_dropped() {
    let port = free_port();
    let waiter = Waiter::new(Duration::from_secs(5));
    let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
    let _listener = Listener::bind(port, ConnectionOptions::default(), waiter.clone(), inbound_tx)
        .await
        .unwrap();

    let mut dialer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    dialer
        .write_all(&PeerInitMessage::PierceFirewall { token: 9999 }.to_bytes())
        .await
        .unwrap();

    // nobody is waiting for that token, so the socket just closes
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), dialer.read(&mut buf))
        .await
        .expect("expected the listener to close the socket")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_inbound_peer_init_supersedes_previous_connection() {
    let listen_port = free_port();
    let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server_listener.local_addr().unwrap();
    spawn_fake_server(server_listener, true);

    let options = ClientOptions {
        enable_listener: true,
        listen_port,
        enable_distributed_network: false,
        accept_distributed_children: false,
        ..ClientOptions::default()
    };
    let client = SoulseekClient::new(options, Arc::new(NoShareHost)).unwrap();
    let mut events = client.subscribe();
    client.connect(&server_addr.to_string()).await.unwrap();
    client.login("me", "pw").await.unwrap();

    let init = PeerInitMessage::PeerInit {
        username: "c".into(),
        kind: ConnectionType::Peer,
        token: 0,
    }
    .to_bytes();

    let mut first = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    first.write_all(&init).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut second = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    second.write_all(&init).await.unwrap();

    // the older connection is closed out from under the remote
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(3), first.read(&mut buf))
        .await
        .expect("expected the superseded socket to close")
        .unwrap();
    assert_eq!(n, 0);

    // and the supersession is observable
    let saw_supersession = tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(event) = events.recv().await {
            if let ClientEvent::PeerConnectionSuperseded { username } = event {
                return username;
            }
        }
        String::new()
    })
    .await
    .unwrap();
    assert_eq!(saw_supersession, "c");

    client.disconnect("test over").await;
}

// =============================================================================
// DISTRIBUTED STATUS
// =============================================================================

fn make_distributed(
    server_tx: mpsc::UnboundedSender<ServerRequest>,
    search_tx: mpsc::UnboundedSender<DistributedSearch>,
) -> DistributedManager {
    let waiter = Waiter::new(Duration::from_secs(5));
    let tokens = Arc::new(TokenFactory::new(0));
    let events = Arc::new(EventBus::new());
    let (frame_tx, _frame_rx) = mpsc::unbounded_channel::<PeerFrame>();
    let peers = PeerConnectionManager::new(
        waiter.clone(),
        tokens,
        server_tx.clone(),
        frame_tx,
        Arc::clone(&events),
        ConnectionOptions::default(),
        ConnectionOptions::default(),
        16,
        Duration::from_secs(5),
    );
    DistributedManager::new(
        waiter,
        peers,
        server_tx,
        search_tx,
        events,
        true,
        true,
        10,
        ConnectionOptions::default(),
    )
}

#[tokio::test]
async fn test_status_payload_is_a_pure_function_of_state() {
    let (tx_a, _rx_a) = mpsc::unbounded_channel();
    let (tx_b, _rx_b) = mpsc::unbounded_channel();
    let (search_a, _ra) = mpsc::unbounded_channel();
    let (search_b, _rb) = mpsc::unbounded_channel();

    let a = make_distributed(tx_a, search_a);
    let b = make_distributed(tx_b, search_b);
    a.set_username("me");
    b.set_username("me");

    let bytes_a: Vec<Vec<u8>> = a
        .status_payload()
        .iter()
        .map(|r| r.to_bytes().to_vec())
        .collect();
    let bytes_b: Vec<Vec<u8>> = b
        .status_payload()
        .iter()
        .map(|r| r.to_bytes().to_vec())
        .collect();
    assert_eq!(bytes_a, bytes_b);

    // parentless invariants: level 0, root is ourselves
    let payload = a.status_payload();
    assert_eq!(payload[0], ServerRequest::HaveNoParents(true));
    assert!(payload.contains(&ServerRequest::BranchLevel(0)));
    assert!(payload.contains(&ServerRequest::BranchRoot("me".into())));
}

#[tokio::test]
async fn test_status_updates_are_debounced() {
    let (server_tx, mut server_rx) = mpsc::unbounded_channel();
    let (search_tx, _search_rx) = mpsc::unbounded_channel();
    let dist = make_distributed(server_tx, search_tx);
    dist.set_username("me");

    // a burst of topology pokes within one second
    for _ in 0..10 {
        dist.poke_status();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_secs(6)).await;

    let mut payload_count = 0;
    while let Ok(request) = server_rx.try_recv() {
        if matches!(request, ServerRequest::HaveNoParents(_)) {
            payload_count += 1;
        }
    }
    assert!(payload_count >= 1, "at least the immediate send");
    assert!(payload_count <= 2, "burst must coalesce, saw {payload_count}");
}

#[tokio::test]
async fn test_embedded_server_search_is_unwrapped() {
    let (server_tx, _server_rx) = mpsc::unbounded_channel();
    let (search_tx, mut search_rx) = mpsc::unbounded_channel();
    let dist = make_distributed(server_tx, search_tx);
    dist.set_username("me");

    let search = DistributedSearch {
        username: "a".into(),
        token: 42,
        query: "hello".into(),
    };
    let frame = DistributedMessage::ServerSearchRequest(search.clone()).to_bytes();
    dist.handle_embedded(frame.slice(4..));

    let delivered = tokio::time::timeout(Duration::from_secs(2), search_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered, search);
}

// =============================================================================
// SERVER RESPONSES OBSERVED THROUGH THE CLIENT
// =============================================================================

#[tokio::test]
async fn test_cant_connect_to_peer_parses() {
    // regression guard for the solicitation-failure path
    let frame = MessageBuilder::server(ServerCode::CantConnectToPeer)
        .u32(5)
        .string("ghost")
        .build();
    let parsed = ServerResponse::parse(frame.slice(4..)).unwrap();
    assert_eq!(
        parsed,
        ServerResponse::CantConnectToPeer {
            token: 5,
            username: "ghost".into()
        }
    );
}
