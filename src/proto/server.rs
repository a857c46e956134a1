//! Server channel messages
//!
//! Requests are messages the client produces; responses are messages it
//! consumes. The distributed status sub-messages (`HaveNoParents`,
//! `ParentIp`, `BranchLevel`, `BranchRoot`, `ChildDepth`, `AcceptChildren`)
//! are ordinary server requests that happen to be sent as a batch.

use crate::error::{Error, Result};
use crate::proto::frame::{MessageBuilder, MessageReader};
use crate::proto::{ConnectionType, ServerCode};
use bytes::Bytes;
use std::net::Ipv4Addr;

/// Protocol version advertised at login.
pub const CLIENT_VERSION: u32 = 160;

/// Minor protocol version advertised at login.
pub const CLIENT_MINOR_VERSION: u32 = 1;

/// A parent candidate from a `NetInfo` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentCandidate {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Messages the client writes to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRequest {
    Login {
        username: String,
        password: String,
    },
    SetListenPort(u16),
    GetPeerAddress(String),
    WatchUser(String),
    ConnectToPeer {
        token: u32,
        username: String,
        kind: ConnectionType,
    },
    AckMessageUser(u32),
    FileSearch {
        token: u32,
        query: String,
    },
    Ping,
    CheckPrivileges,
    AckNotifyPrivileges(u32),
    HaveNoParents(bool),
    ParentIp(Ipv4Addr),
    AcceptChildren(bool),
    BranchLevel(u32),
    BranchRoot(String),
    ChildDepth(u32),
}

impl ServerRequest {
    pub fn to_bytes(&self) -> Bytes {
        match self {
            ServerRequest::Login { username, password } => {
                let hash = format!("{:x}", md5::compute(format!("{username}{password}")));
                MessageBuilder::server(ServerCode::Login)
                    .string(username)
                    .string(password)
                    .u32(CLIENT_VERSION)
                    .string(&hash)
                    .u32(CLIENT_MINOR_VERSION)
                    .build()
            }
            ServerRequest::SetListenPort(port) => MessageBuilder::server(ServerCode::SetListenPort)
                .u32(u32::from(*port))
                .build(),
            ServerRequest::GetPeerAddress(username) => {
                MessageBuilder::server(ServerCode::GetPeerAddress)
                    .string(username)
                    .build()
            }
            ServerRequest::WatchUser(username) => MessageBuilder::server(ServerCode::WatchUser)
                .string(username)
                .build(),
            ServerRequest::ConnectToPeer {
                token,
                username,
                kind,
            } => MessageBuilder::server(ServerCode::ConnectToPeer)
                .u32(*token)
                .string(username)
                .string(kind.as_str())
                .build(),
            ServerRequest::AckMessageUser(id) => MessageBuilder::server(ServerCode::AckMessageUser)
                .u32(*id)
                .build(),
            ServerRequest::FileSearch { token, query } => {
                MessageBuilder::server(ServerCode::FileSearch)
                    .u32(*token)
                    .string(query)
                    .build()
            }
            ServerRequest::Ping => MessageBuilder::server(ServerCode::Ping).build(),
            ServerRequest::CheckPrivileges => {
                MessageBuilder::server(ServerCode::CheckPrivileges).build()
            }
            ServerRequest::AckNotifyPrivileges(token) => {
                MessageBuilder::server(ServerCode::AckNotifyPrivileges)
                    .u32(*token)
                    .build()
            }
            ServerRequest::HaveNoParents(v) => MessageBuilder::server(ServerCode::HaveNoParents)
                .bool(*v)
                .build(),
            ServerRequest::ParentIp(ip) => MessageBuilder::server(ServerCode::ParentIp)
                .ip(*ip)
                .build(),
            ServerRequest::AcceptChildren(v) => MessageBuilder::server(ServerCode::AcceptChildren)
                .bool(*v)
                .build(),
            ServerRequest::BranchLevel(level) => MessageBuilder::server(ServerCode::BranchLevel)
                .u32(*level)
                .build(),
            ServerRequest::BranchRoot(root) => MessageBuilder::server(ServerCode::BranchRoot)
                .string(root)
                .build(),
            ServerRequest::ChildDepth(depth) => MessageBuilder::server(ServerCode::ChildDepth)
                .u32(*depth)
                .build(),
        }
    }
}

/// Messages the client reads from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerResponse {
    LoginAccepted {
        greeting: String,
        ip: Ipv4Addr,
        /// md5 of the password, echoed by newer servers.
        password_hash: Option<String>,
    },
    LoginRejected {
        reason: String,
    },
    GetPeerAddress {
        username: String,
        ip: Ipv4Addr,
        port: u16,
    },
    /// A remote peer asked the server to have us dial it back.
    ConnectToPeer {
        username: String,
        kind: ConnectionType,
        ip: Ipv4Addr,
        port: u16,
        token: u32,
        privileged: bool,
    },
    MessageUser {
        id: u32,
        timestamp: u32,
        username: String,
        message: String,
        is_admin: bool,
    },
    Relogged,
    CheckPrivileges {
        seconds_remaining: u32,
    },
    NetInfo(Vec<ParentCandidate>),
    WishlistInterval(u32),
    ResetDistributed,
    /// A distributed frame body relayed over the server channel.
    EmbeddedDistributed {
        body: Bytes,
    },
    NotifyPrivileges {
        token: u32,
        username: String,
    },
    /// The server could not relay our `ConnectToPeer` solicitation.
    CantConnectToPeer {
        token: u32,
        username: String,
    },
    /// An opcode the core does not interpret; kept for diagnostics.
    Unknown {
        code: u32,
        length: usize,
    },
}

impl ServerResponse {
    /// Parse one server frame body (length prefix stripped).
    pub fn parse(body: Bytes) -> Result<Self> {
        let mut reader = MessageReader::new(body);
        let raw = reader.code_u32()?;
        let Some(code) = ServerCode::from_u32(raw) else {
            return Ok(ServerResponse::Unknown {
                code: raw,
                length: reader.remaining(),
            });
        };

        match code {
            ServerCode::Login => {
                if reader.bool()? {
                    let greeting = reader.string()?;
                    let ip = reader.ip()?;
                    let password_hash = if reader.has_remaining() {
                        Some(reader.string()?)
                    } else {
                        None
                    };
                    Ok(ServerResponse::LoginAccepted {
                        greeting,
                        ip,
                        password_hash,
                    })
                } else {
                    Ok(ServerResponse::LoginRejected {
                        reason: reader.string()?,
                    })
                }
            }
            ServerCode::GetPeerAddress => {
                let username = reader.string()?;
                let ip = reader.ip()?;
                let port = reader.u32()? as u16;
                Ok(ServerResponse::GetPeerAddress { username, ip, port })
            }
            ServerCode::ConnectToPeer => {
                let username = reader.string()?;
                let kind = ConnectionType::parse(&reader.string()?)?;
                let ip = reader.ip()?;
                let port = reader.u32()? as u16;
                let token = reader.u32()?;
                let privileged = if reader.has_remaining() {
                    reader.bool()?
                } else {
                    false
                };
                Ok(ServerResponse::ConnectToPeer {
                    username,
                    kind,
                    ip,
                    port,
                    token,
                    privileged,
                })
            }
            ServerCode::MessageUser => {
                let id = reader.u32()?;
                let timestamp = reader.u32()?;
                let username = reader.string()?;
                let message = reader.string()?;
                let is_admin = if reader.has_remaining() {
                    reader.bool()?
                } else {
                    false
                };
                Ok(ServerResponse::MessageUser {
                    id,
                    timestamp,
                    username,
                    message,
                    is_admin,
                })
            }
            ServerCode::Relogged => Ok(ServerResponse::Relogged),
            ServerCode::CheckPrivileges => Ok(ServerResponse::CheckPrivileges {
                seconds_remaining: reader.u32()?,
            }),
            ServerCode::NetInfo => {
                let count = reader.u32()? as usize;
                let mut candidates = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let username = reader.string()?;
                    let ip = reader.ip()?;
                    let port = reader.u32()? as u16;
                    candidates.push(ParentCandidate { username, ip, port });
                }
                Ok(ServerResponse::NetInfo(candidates))
            }
            ServerCode::WishlistInterval => Ok(ServerResponse::WishlistInterval(reader.u32()?)),
            ServerCode::ResetDistributed => Ok(ServerResponse::ResetDistributed),
            ServerCode::EmbeddedMessage => {
                let remaining = reader.remaining();
                Ok(ServerResponse::EmbeddedDistributed {
                    body: Bytes::from(reader.bytes(remaining)?),
                })
            }
            ServerCode::NotifyPrivileges => {
                let token = reader.u32()?;
                let username = reader.string()?;
                Ok(ServerResponse::NotifyPrivileges { token, username })
            }
            ServerCode::CantConnectToPeer => {
                let token = reader.u32()?;
                let username = reader.string()?;
                Ok(ServerResponse::CantConnectToPeer { token, username })
            }
            // Opcodes we only send; receiving one means the stream is skewed.
            other => Err(Error::MessageFormat(format!(
                "unexpected server opcode {:?} inbound",
                other
            ))),
        }
    }
}
