//! Wire codec tests
//!
//! Run with: cargo test --test codec_test

use bytes::Bytes;
use slsk::proto::distributed::{DistributedMessage, DistributedSearch};
use slsk::proto::frame::{compress, decompress, MessageBuilder, MessageReader};
use slsk::proto::peer::{
    BrowseResponse, Directory, FileAttribute, FileEntry, PeerInitMessage, PeerMessage,
    SearchResponse, UserInfo,
};
use slsk::proto::server::{ServerRequest, ServerResponse, CLIENT_MINOR_VERSION, CLIENT_VERSION};
use slsk::proto::{ConnectionType, PeerCode, ServerCode};
use slsk::{Error, TransferDirection};
use std::net::Ipv4Addr;

fn body(frame: Bytes) -> Bytes {
    frame.slice(4..)
}

fn files() -> Vec<FileEntry> {
    vec![
        FileEntry {
            filename: "@@shared\\album\\01 - opener.flac".into(),
            size: 48_171_002,
            extension: "flac".into(),
            attributes: vec![
                FileAttribute { kind: 0, value: 1021 },
                FileAttribute { kind: 1, value: 249 },
                FileAttribute { kind: 4, value: 44100 },
            ],
        },
        FileEntry {
            filename: "@@shared\\album\\folder.jpg".into(),
            size: 84_113,
            extension: "jpg".into(),
            attributes: vec![],
        },
    ]
}

// =============================================================================
// FRAME LAYOUT
// =============================================================================

#[test]
fn test_length_prefix_counts_opcode_and_payload() {
    let frame = MessageBuilder::server(ServerCode::SetListenPort).u32(2234).build();
    let declared = u32::from_le_bytes(frame[0..4].try_into().unwrap());
    assert_eq!(declared as usize, frame.len() - 4);
    // 4-byte opcode + 4-byte field
    assert_eq!(declared, 8);
}

#[test]
fn test_distributed_opcode_is_one_byte() {
    let frame = DistributedMessage::BranchLevel(3).to_bytes();
    let declared = u32::from_le_bytes(frame[0..4].try_into().unwrap());
    // 1-byte opcode + 4-byte level
    assert_eq!(declared, 5);
    assert_eq!(frame[4], 4); // BranchLevel opcode
}

#[test]
fn test_ip_field_uses_reversed_octets() {
    let frame = MessageBuilder::server(ServerCode::ParentIp)
        .ip(Ipv4Addr::new(1, 2, 3, 4))
        .build();
    // after 4-byte length and 4-byte opcode: reversed octets
    assert_eq!(&frame[8..12], &[4, 3, 2, 1]);
    let mut reader = MessageReader::new(body(frame));
    reader.code_u32().unwrap();
    assert_eq!(reader.ip().unwrap(), Ipv4Addr::new(1, 2, 3, 4));
}

// =============================================================================
// SERVER CHANNEL
// =============================================================================

#[test]
fn test_login_frame_layout() {
    let frame = ServerRequest::Login {
        username: "u".into(),
        password: "p".into(),
    }
    .to_bytes();
    let mut reader = MessageReader::new(body(frame));
    reader.expect_code_u32(ServerCode::Login as u32).unwrap();
    assert_eq!(reader.string().unwrap(), "u");
    assert_eq!(reader.string().unwrap(), "p");
    assert_eq!(reader.u32().unwrap(), CLIENT_VERSION);
    assert_eq!(reader.string().unwrap(), format!("{:x}", md5::compute("up")));
    assert_eq!(reader.u32().unwrap(), CLIENT_MINOR_VERSION);
}

#[test]
fn test_server_responses_parse() {
    let cases: Vec<(Bytes, ServerResponse)> = vec![
        (
            MessageBuilder::server(ServerCode::Login)
                .bool(false)
                .string("INVALIDPASS")
                .build(),
            ServerResponse::LoginRejected {
                reason: "INVALIDPASS".into(),
            },
        ),
        (
            MessageBuilder::server(ServerCode::GetPeerAddress)
                .string("alice")
                .ip(Ipv4Addr::new(10, 1, 2, 3))
                .u32(2234)
                .build(),
            ServerResponse::GetPeerAddress {
                username: "alice".into(),
                ip: Ipv4Addr::new(10, 1, 2, 3),
                port: 2234,
            },
        ),
        (
            MessageBuilder::server(ServerCode::CantConnectToPeer)
                .u32(99)
                .string("bob")
                .build(),
            ServerResponse::CantConnectToPeer {
                token: 99,
                username: "bob".into(),
            },
        ),
    ];
    for (frame, expected) in cases {
        assert_eq!(ServerResponse::parse(body(frame)).unwrap(), expected);
    }
}

#[test]
fn test_distributed_status_submessages_encode() {
    let requests = [
        ServerRequest::HaveNoParents(true),
        ServerRequest::ParentIp(Ipv4Addr::new(4, 4, 4, 4)),
        ServerRequest::BranchLevel(2),
        ServerRequest::BranchRoot("root".into()),
        ServerRequest::ChildDepth(1),
        ServerRequest::AcceptChildren(true),
    ];
    let codes = [71u32, 73, 126, 127, 129, 100];
    for (request, code) in requests.iter().zip(codes) {
        let frame = request.to_bytes();
        let mut reader = MessageReader::new(frame.slice(4..));
        assert_eq!(reader.code_u32().unwrap(), code);
    }
}

// =============================================================================
// PEER CHANNEL
// =============================================================================

#[test]
fn test_peer_init_round_trips() {
    for message in [
        PeerInitMessage::PierceFirewall { token: 0 },
        PeerInitMessage::PierceFirewall { token: u32::MAX },
        PeerInitMessage::PeerInit {
            username: "someone".into(),
            kind: ConnectionType::Transfer,
            token: 12,
        },
    ] {
        let frame = message.to_bytes();
        assert_eq!(PeerInitMessage::parse(body(frame)).unwrap(), message);
    }
}

#[test]
fn test_every_peer_message_round_trips() {
    let messages = vec![
        PeerMessage::SharesRequest,
        PeerMessage::SharesResponse(BrowseResponse {
            directories: vec![Directory {
                name: "@@shared\\album".into(),
                files: files(),
            }],
        }),
        PeerMessage::SearchResponse(SearchResponse {
            username: "me".into(),
            token: 7,
            files: files(),
            has_free_slots: true,
            upload_speed: 250_000,
            queue_length: 0,
        }),
        PeerMessage::UserInfoRequest,
        PeerMessage::UserInfoResponse(UserInfo {
            description: "hi".into(),
            picture: None,
            upload_slots: 3,
            queue_length: 0,
            has_free_slots: true,
        }),
        PeerMessage::FolderContentsRequest {
            token: 3,
            directory: "@@shared\\album".into(),
        },
        PeerMessage::FolderContentsResponse {
            token: 3,
            directory: "@@shared\\album".into(),
            directories: vec![Directory {
                name: "@@shared\\album".into(),
                files: files(),
            }],
        },
        PeerMessage::TransferRequest {
            direction: TransferDirection::Upload,
            token: 31,
            filename: "@@shared\\album\\01 - opener.flac".into(),
            size: Some(48_171_002),
        },
        PeerMessage::TransferResponse {
            token: 31,
            allowed: false,
            size: None,
            reason: Some("Queued".into()),
        },
        PeerMessage::QueueDownload {
            filename: "x".into(),
        },
        PeerMessage::PlaceInQueueRequest {
            filename: "x".into(),
        },
        PeerMessage::PlaceInQueueResponse {
            filename: "x".into(),
            place: 4,
        },
        PeerMessage::UploadFailed {
            filename: "x".into(),
        },
        PeerMessage::QueueFailed {
            filename: "x".into(),
            reason: "Queue full.".into(),
        },
    ];
    for message in messages {
        let frame = message.to_bytes().unwrap();
        assert_eq!(PeerMessage::parse(body(frame)).unwrap(), message);
    }
}

#[test]
fn test_search_response_is_compressed_on_the_wire() {
    let message = PeerMessage::SearchResponse(SearchResponse {
        username: "me".into(),
        token: 7,
        files: files(),
        has_free_slots: true,
        upload_speed: 1,
        queue_length: 0,
    });
    let frame = message.to_bytes().unwrap();
    let mut reader = MessageReader::new(body(frame));
    reader.expect_code_u32(PeerCode::SearchResponse as u32).unwrap();
    // the remainder must be a valid zlib stream, not plaintext
    let remainder = reader.bytes(reader.remaining()).unwrap();
    assert!(decompress(&remainder).is_ok());
}

// =============================================================================
// DISTRIBUTED CHANNEL
// =============================================================================

#[test]
fn test_distributed_round_trips() {
    for message in [
        DistributedMessage::Ping,
        DistributedMessage::SearchRequest(DistributedSearch {
            username: "a".into(),
            token: 42,
            query: "hello".into(),
        }),
        DistributedMessage::BranchLevel(0),
        DistributedMessage::BranchRoot("r".into()),
        DistributedMessage::ChildDepth(9),
    ] {
        let frame = message.to_bytes();
        assert_eq!(DistributedMessage::parse(body(frame)).unwrap(), message);
    }
}

// =============================================================================
// FAILURE MODES
// =============================================================================

#[test]
fn test_truncated_fields_fail_with_message_read() {
    let frame = MessageBuilder::peer(PeerCode::QueueDownload)
        .u32(500)
        .raw(b"short")
        .build();
    assert!(matches!(
        PeerMessage::parse(body(frame)),
        Err(Error::MessageRead { .. })
    ));
}

#[test]
fn test_corrupt_compressed_payload_fails() {
    let frame = MessageBuilder::peer(PeerCode::SharesResponse)
        .raw(&[0x12, 0x34, 0x56])
        .build();
    assert!(matches!(
        PeerMessage::parse(body(frame)),
        Err(Error::Compression(_))
    ));
}

#[test]
fn test_compression_helpers_round_trip_large_payload() {
    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 7) as u8).collect();
    let deflated = compress(&payload).unwrap();
    assert!(deflated.len() < payload.len() / 10);
    assert_eq!(decompress(&deflated).unwrap(), payload);
}
