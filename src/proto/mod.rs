//! Wire protocol: opcode tables, framing, and message schemas
//!
//! Every frame on the wire is `u32 length (LE) | opcode | payload`. The
//! opcode width depends on the channel: server and peer channels use a
//! 4-byte opcode, the distributed channel and the peer-init prologue use a
//! single byte. Payloads are positional; each opcode fixes its own schema.

pub mod distributed;
pub mod frame;
pub mod peer;
pub mod server;

use crate::error::{Error, Result};

/// Width in bytes of a frame's length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Upper bound on a single frame body. Anything larger is treated as a
/// corrupt stream and disconnects the connection.
pub const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

/// Server channel opcodes (4 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ServerCode {
    Login = 1,
    SetListenPort = 2,
    GetPeerAddress = 3,
    WatchUser = 5,
    ConnectToPeer = 18,
    MessageUser = 22,
    AckMessageUser = 23,
    FileSearch = 26,
    Ping = 32,
    Relogged = 41,
    HaveNoParents = 71,
    ParentIp = 73,
    CheckPrivileges = 92,
    /// A distributed message wrapped for delivery over the server channel.
    EmbeddedMessage = 93,
    AcceptChildren = 100,
    NetInfo = 102,
    WishlistInterval = 104,
    NotifyPrivileges = 124,
    AckNotifyPrivileges = 125,
    BranchLevel = 126,
    BranchRoot = 127,
    ChildDepth = 129,
    ResetDistributed = 130,
    CantConnectToPeer = 1001,
}

impl ServerCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::Login,
            2 => Self::SetListenPort,
            3 => Self::GetPeerAddress,
            5 => Self::WatchUser,
            18 => Self::ConnectToPeer,
            22 => Self::MessageUser,
            23 => Self::AckMessageUser,
            26 => Self::FileSearch,
            32 => Self::Ping,
            41 => Self::Relogged,
            71 => Self::HaveNoParents,
            73 => Self::ParentIp,
            92 => Self::CheckPrivileges,
            93 => Self::EmbeddedMessage,
            100 => Self::AcceptChildren,
            102 => Self::NetInfo,
            104 => Self::WishlistInterval,
            124 => Self::NotifyPrivileges,
            125 => Self::AckNotifyPrivileges,
            126 => Self::BranchLevel,
            127 => Self::BranchRoot,
            129 => Self::ChildDepth,
            130 => Self::ResetDistributed,
            1001 => Self::CantConnectToPeer,
            _ => return None,
        })
    }
}

/// Peer channel opcodes (4 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PeerCode {
    SharesRequest = 4,
    SharesResponse = 5,
    SearchResponse = 9,
    UserInfoRequest = 15,
    UserInfoResponse = 16,
    FolderContentsRequest = 36,
    FolderContentsResponse = 37,
    TransferRequest = 40,
    TransferResponse = 41,
    QueueDownload = 43,
    PlaceInQueueResponse = 44,
    UploadFailed = 46,
    QueueFailed = 50,
    PlaceInQueueRequest = 51,
}

impl PeerCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            4 => Self::SharesRequest,
            5 => Self::SharesResponse,
            9 => Self::SearchResponse,
            15 => Self::UserInfoRequest,
            16 => Self::UserInfoResponse,
            36 => Self::FolderContentsRequest,
            37 => Self::FolderContentsResponse,
            40 => Self::TransferRequest,
            41 => Self::TransferResponse,
            43 => Self::QueueDownload,
            44 => Self::PlaceInQueueResponse,
            46 => Self::UploadFailed,
            50 => Self::QueueFailed,
            51 => Self::PlaceInQueueRequest,
            _ => return None,
        })
    }
}

/// Peer-init prologue opcodes (1 byte on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PeerInitCode {
    PierceFirewall = 0,
    PeerInit = 1,
}

impl PeerInitCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::PierceFirewall),
            1 => Some(Self::PeerInit),
            _ => None,
        }
    }
}

/// Distributed channel opcodes (1 byte on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DistributedCode {
    Ping = 0,
    SearchRequest = 3,
    BranchLevel = 4,
    BranchRoot = 5,
    ChildDepth = 7,
    ServerSearchRequest = 93,
}

impl DistributedCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Ping,
            3 => Self::SearchRequest,
            4 => Self::BranchLevel,
            5 => Self::BranchRoot,
            7 => Self::ChildDepth,
            93 => Self::ServerSearchRequest,
            _ => return None,
        })
    }
}

/// The declared purpose of a peer connection, carried in `PeerInit` and
/// `ConnectToPeer` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Peer message connection ("P").
    Peer,
    /// File transfer connection ("F").
    Transfer,
    /// Distributed network connection ("D").
    Distributed,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Peer => "P",
            ConnectionType::Transfer => "F",
            ConnectionType::Distributed => "D",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "P" => Ok(ConnectionType::Peer),
            "F" => Ok(ConnectionType::Transfer),
            "D" => Ok(ConnectionType::Distributed),
            other => Err(Error::MessageFormat(format!(
                "unknown connection type {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
