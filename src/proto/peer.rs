//! Peer channel messages and the peer-init prologue
//!
//! Peer messages are symmetric: the client both produces and consumes every
//! one of them, so each carries `to_bytes` and `parse`. Share listings and
//! search responses are zlib-compressed after the opcode.

use crate::error::{Error, Result};
use crate::proto::frame::{MessageBuilder, MessageReader};
use crate::proto::{ConnectionType, PeerCode, PeerInitCode};
use crate::transfer::TransferDirection;
use bytes::Bytes;

/// The first frame on any outbound or inbound peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerInitMessage {
    /// Dial-back in response to a `ConnectToPeer` solicitation.
    PierceFirewall { token: u32 },
    /// Unsolicited connection announcing who we are and why we dialled.
    PeerInit {
        username: String,
        kind: ConnectionType,
        token: u32,
    },
}

impl PeerInitMessage {
    pub fn to_bytes(&self) -> Bytes {
        match self {
            PeerInitMessage::PierceFirewall { token } => {
                MessageBuilder::peer_init(PeerInitCode::PierceFirewall)
                    .u32(*token)
                    .build()
            }
            PeerInitMessage::PeerInit {
                username,
                kind,
                token,
            } => MessageBuilder::peer_init(PeerInitCode::PeerInit)
                .string(username)
                .string(kind.as_str())
                .u32(*token)
                .build(),
        }
    }

    pub fn parse(body: Bytes) -> Result<Self> {
        let mut reader = MessageReader::new(body);
        let raw = reader.code_u8()?;
        match PeerInitCode::from_u8(raw) {
            Some(PeerInitCode::PierceFirewall) => Ok(PeerInitMessage::PierceFirewall {
                token: reader.u32()?,
            }),
            Some(PeerInitCode::PeerInit) => {
                let username = reader.string()?;
                let kind = ConnectionType::parse(&reader.string()?)?;
                let token = reader.u32()?;
                Ok(PeerInitMessage::PeerInit {
                    username,
                    kind,
                    token,
                })
            }
            None => Err(Error::MessageFormat(format!(
                "unknown peer-init opcode {raw}"
            ))),
        }
    }
}

/// One attribute of a shared file (bitrate, duration, sample rate, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttribute {
    pub kind: u32,
    pub value: u32,
}

/// One shared file inside a directory listing or search response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub filename: String,
    pub size: i64,
    pub extension: String,
    pub attributes: Vec<FileAttribute>,
}

/// One shared directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    pub name: String,
    pub files: Vec<FileEntry>,
}

/// The full share listing a peer returns to a browse request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrowseResponse {
    pub directories: Vec<Directory>,
}

/// Self-description a peer returns to a `UserInfoRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserInfo {
    pub description: String,
    pub picture: Option<Vec<u8>>,
    pub upload_slots: u32,
    pub queue_length: u32,
    pub has_free_slots: bool,
}

/// Files a peer sends back for a search it can satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub username: String,
    pub token: u32,
    pub files: Vec<FileEntry>,
    pub has_free_slots: bool,
    pub upload_speed: u32,
    pub queue_length: i64,
}

fn put_file(builder: MessageBuilder, file: &FileEntry) -> MessageBuilder {
    let mut b = builder
        .u8(1)
        .string(&file.filename)
        .i64(file.size)
        .string(&file.extension)
        .u32(file.attributes.len() as u32);
    for attribute in &file.attributes {
        b = b.u32(attribute.kind).u32(attribute.value);
    }
    b
}

fn read_file(reader: &mut MessageReader) -> Result<FileEntry> {
    let _code = reader.u8()?;
    let filename = reader.string()?;
    let size = reader.i64()?;
    let extension = reader.string()?;
    let attribute_count = reader.u32()? as usize;
    let mut attributes = Vec::with_capacity(attribute_count.min(64));
    for _ in 0..attribute_count {
        attributes.push(FileAttribute {
            kind: reader.u32()?,
            value: reader.u32()?,
        });
    }
    Ok(FileEntry {
        filename,
        size,
        extension,
        attributes,
    })
}

fn put_directory(builder: MessageBuilder, directory: &Directory) -> MessageBuilder {
    let mut b = builder
        .string(&directory.name)
        .u32(directory.files.len() as u32);
    for file in &directory.files {
        b = put_file(b, file);
    }
    b
}

fn read_directory(reader: &mut MessageReader) -> Result<Directory> {
    let name = reader.string()?;
    let file_count = reader.u32()? as usize;
    let mut files = Vec::with_capacity(file_count.min(4096));
    for _ in 0..file_count {
        files.push(read_file(reader)?);
    }
    Ok(Directory { name, files })
}

/// Messages exchanged over a "P" peer message connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    SharesRequest,
    SharesResponse(BrowseResponse),
    SearchResponse(SearchResponse),
    UserInfoRequest,
    UserInfoResponse(UserInfo),
    FolderContentsRequest {
        token: u32,
        directory: String,
    },
    FolderContentsResponse {
        token: u32,
        directory: String,
        directories: Vec<Directory>,
    },
    TransferRequest {
        direction: TransferDirection,
        token: u32,
        filename: String,
        /// Present when the sender is offering an upload.
        size: Option<i64>,
    },
    TransferResponse {
        token: u32,
        allowed: bool,
        /// Present when allowed and the responder knows the size.
        size: Option<i64>,
        /// Present when not allowed.
        reason: Option<String>,
    },
    QueueDownload {
        filename: String,
    },
    PlaceInQueueRequest {
        filename: String,
    },
    PlaceInQueueResponse {
        filename: String,
        place: u32,
    },
    UploadFailed {
        filename: String,
    },
    QueueFailed {
        filename: String,
        reason: String,
    },
}

impl PeerMessage {
    pub fn code(&self) -> PeerCode {
        match self {
            PeerMessage::SharesRequest => PeerCode::SharesRequest,
            PeerMessage::SharesResponse(_) => PeerCode::SharesResponse,
            PeerMessage::SearchResponse(_) => PeerCode::SearchResponse,
            PeerMessage::UserInfoRequest => PeerCode::UserInfoRequest,
            PeerMessage::UserInfoResponse(_) => PeerCode::UserInfoResponse,
            PeerMessage::FolderContentsRequest { .. } => PeerCode::FolderContentsRequest,
            PeerMessage::FolderContentsResponse { .. } => PeerCode::FolderContentsResponse,
            PeerMessage::TransferRequest { .. } => PeerCode::TransferRequest,
            PeerMessage::TransferResponse { .. } => PeerCode::TransferResponse,
            PeerMessage::QueueDownload { .. } => PeerCode::QueueDownload,
            PeerMessage::PlaceInQueueRequest { .. } => PeerCode::PlaceInQueueRequest,
            PeerMessage::PlaceInQueueResponse { .. } => PeerCode::PlaceInQueueResponse,
            PeerMessage::UploadFailed { .. } => PeerCode::UploadFailed,
            PeerMessage::QueueFailed { .. } => PeerCode::QueueFailed,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(match self {
            PeerMessage::SharesRequest => MessageBuilder::peer(PeerCode::SharesRequest).build(),
            PeerMessage::SharesResponse(response) => {
                let mut b = MessageBuilder::peer(PeerCode::SharesResponse)
                    .u32(response.directories.len() as u32);
                for directory in &response.directories {
                    b = put_directory(b, directory);
                }
                b.compress()?.build()
            }
            PeerMessage::SearchResponse(response) => {
                let mut b = MessageBuilder::peer(PeerCode::SearchResponse)
                    .string(&response.username)
                    .u32(response.token)
                    .u32(response.files.len() as u32);
                for file in &response.files {
                    b = put_file(b, file);
                }
                b.bool(response.has_free_slots)
                    .u32(response.upload_speed)
                    .i64(response.queue_length)
                    .compress()?
                    .build()
            }
            PeerMessage::UserInfoRequest => MessageBuilder::peer(PeerCode::UserInfoRequest).build(),
            PeerMessage::UserInfoResponse(info) => {
                let mut b =
                    MessageBuilder::peer(PeerCode::UserInfoResponse).string(&info.description);
                match &info.picture {
                    Some(picture) => {
                        b = b.bool(true).u32(picture.len() as u32).raw(picture);
                    }
                    None => b = b.bool(false),
                }
                b.u32(info.upload_slots)
                    .u32(info.queue_length)
                    .bool(info.has_free_slots)
                    .build()
            }
            PeerMessage::FolderContentsRequest { token, directory } => {
                MessageBuilder::peer(PeerCode::FolderContentsRequest)
                    .u32(*token)
                    .string(directory)
                    .build()
            }
            PeerMessage::FolderContentsResponse {
                token,
                directory,
                directories,
            } => {
                let mut b = MessageBuilder::peer(PeerCode::FolderContentsResponse)
                    .u32(*token)
                    .string(directory)
                    .u32(directories.len() as u32);
                for dir in directories {
                    b = put_directory(b, dir);
                }
                b.compress()?.build()
            }
            PeerMessage::TransferRequest {
                direction,
                token,
                filename,
                size,
            } => {
                let mut b = MessageBuilder::peer(PeerCode::TransferRequest)
                    .u32(direction.to_u32())
                    .u32(*token)
                    .string(filename);
                if let Some(size) = size {
                    b = b.i64(*size);
                }
                b.build()
            }
            PeerMessage::TransferResponse {
                token,
                allowed,
                size,
                reason,
            } => {
                let mut b = MessageBuilder::peer(PeerCode::TransferResponse)
                    .u32(*token)
                    .bool(*allowed);
                if *allowed {
                    // i64 is canonical for the current protocol; older peers
                    // sent u32 here and the parser still accepts that shape.
                    if let Some(size) = size {
                        b = b.i64(*size);
                    }
                } else if let Some(reason) = reason {
                    b = b.string(reason);
                }
                b.build()
            }
            PeerMessage::QueueDownload { filename } => {
                MessageBuilder::peer(PeerCode::QueueDownload)
                    .string(filename)
                    .build()
            }
            PeerMessage::PlaceInQueueRequest { filename } => {
                MessageBuilder::peer(PeerCode::PlaceInQueueRequest)
                    .string(filename)
                    .build()
            }
            PeerMessage::PlaceInQueueResponse { filename, place } => {
                MessageBuilder::peer(PeerCode::PlaceInQueueResponse)
                    .string(filename)
                    .u32(*place)
                    .build()
            }
            PeerMessage::UploadFailed { filename } => MessageBuilder::peer(PeerCode::UploadFailed)
                .string(filename)
                .build(),
            PeerMessage::QueueFailed { filename, reason } => {
                MessageBuilder::peer(PeerCode::QueueFailed)
                    .string(filename)
                    .string(reason)
                    .build()
            }
        })
    }

    /// Parse one peer frame body (length prefix stripped).
    pub fn parse(body: Bytes) -> Result<Self> {
        let mut reader = MessageReader::new(body);
        let raw = reader.code_u32()?;
        let Some(code) = PeerCode::from_u32(raw) else {
            return Err(Error::MessageFormat(format!("unknown peer opcode {raw}")));
        };

        match code {
            PeerCode::SharesRequest => Ok(PeerMessage::SharesRequest),
            PeerCode::SharesResponse => {
                reader.decompress()?;
                let directory_count = reader.u32()? as usize;
                let mut directories = Vec::with_capacity(directory_count.min(4096));
                for _ in 0..directory_count {
                    directories.push(read_directory(&mut reader)?);
                }
                Ok(PeerMessage::SharesResponse(BrowseResponse { directories }))
            }
            PeerCode::SearchResponse => {
                reader.decompress()?;
                let username = reader.string()?;
                let token = reader.u32()?;
                let file_count = reader.u32()? as usize;
                let mut files = Vec::with_capacity(file_count.min(4096));
                for _ in 0..file_count {
                    files.push(read_file(&mut reader)?);
                }
                let has_free_slots = reader.bool()?;
                let upload_speed = reader.u32()?;
                let queue_length = reader.i64()?;
                Ok(PeerMessage::SearchResponse(SearchResponse {
                    username,
                    token,
                    files,
                    has_free_slots,
                    upload_speed,
                    queue_length,
                }))
            }
            PeerCode::UserInfoRequest => Ok(PeerMessage::UserInfoRequest),
            PeerCode::UserInfoResponse => {
                let description = reader.string()?;
                let picture = if reader.bool()? {
                    let len = reader.u32()? as usize;
                    Some(reader.bytes(len)?)
                } else {
                    None
                };
                let upload_slots = reader.u32()?;
                let queue_length = reader.u32()?;
                let has_free_slots = reader.bool()?;
                Ok(PeerMessage::UserInfoResponse(UserInfo {
                    description,
                    picture,
                    upload_slots,
                    queue_length,
                    has_free_slots,
                }))
            }
            PeerCode::FolderContentsRequest => {
                let token = reader.u32()?;
                let directory = reader.string()?;
                Ok(PeerMessage::FolderContentsRequest { token, directory })
            }
            PeerCode::FolderContentsResponse => {
                reader.decompress()?;
                let token = reader.u32()?;
                let directory = reader.string()?;
                let directory_count = reader.u32()? as usize;
                let mut directories = Vec::with_capacity(directory_count.min(4096));
                for _ in 0..directory_count {
                    directories.push(read_directory(&mut reader)?);
                }
                Ok(PeerMessage::FolderContentsResponse {
                    token,
                    directory,
                    directories,
                })
            }
            PeerCode::TransferRequest => {
                let direction = TransferDirection::from_u32(reader.u32()?)
                    .ok_or_else(|| Error::MessageFormat("transfer direction out of range".into()))?;
                let token = reader.u32()?;
                let filename = reader.string()?;
                let size = match reader.remaining() {
                    0 => None,
                    8 => Some(reader.i64()?),
                    4 => Some(i64::from(reader.u32()?)),
                    n => {
                        return Err(Error::MessageRead {
                            needed: 8,
                            remaining: n,
                        })
                    }
                };
                Ok(PeerMessage::TransferRequest {
                    direction,
                    token,
                    filename,
                    size,
                })
            }
            PeerCode::TransferResponse => {
                let token = reader.u32()?;
                let allowed = reader.bool()?;
                let mut size = None;
                let mut reason = None;
                if allowed {
                    // allowed responses may omit the size entirely
                    size = match reader.remaining() {
                        0 => None,
                        8 => Some(reader.i64()?),
                        4 => Some(i64::from(reader.u32()?)),
                        n => {
                            return Err(Error::MessageRead {
                                needed: 8,
                                remaining: n,
                            })
                        }
                    };
                } else if reader.has_remaining() {
                    reason = Some(reader.string()?);
                }
                Ok(PeerMessage::TransferResponse {
                    token,
                    allowed,
                    size,
                    reason,
                })
            }
            PeerCode::QueueDownload => Ok(PeerMessage::QueueDownload {
                filename: reader.string()?,
            }),
            PeerCode::PlaceInQueueRequest => Ok(PeerMessage::PlaceInQueueRequest {
                filename: reader.string()?,
            }),
            PeerCode::PlaceInQueueResponse => {
                let filename = reader.string()?;
                let place = reader.u32()?;
                Ok(PeerMessage::PlaceInQueueResponse { filename, place })
            }
            PeerCode::UploadFailed => Ok(PeerMessage::UploadFailed {
                filename: reader.string()?,
            }),
            PeerCode::QueueFailed => {
                let filename = reader.string()?;
                let reason = reader.string()?;
                Ok(PeerMessage::QueueFailed { filename, reason })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: PeerMessage) -> PeerMessage {
        let frame = message.to_bytes().unwrap();
        PeerMessage::parse(frame.slice(4..)).unwrap()
    }

    fn sample_files() -> Vec<FileEntry> {
        vec![
            FileEntry {
                filename: "@@music\\artist\\track.flac".into(),
                size: 31_337_422,
                extension: "flac".into(),
                attributes: vec![
                    FileAttribute { kind: 0, value: 980 },
                    FileAttribute { kind: 1, value: 213 },
                ],
            },
            FileEntry {
                filename: "@@music\\artist\\cover.jpg".into(),
                size: 120_003,
                extension: "jpg".into(),
                attributes: vec![],
            },
        ]
    }

    #[test]
    fn test_peer_init_round_trip() {
        for message in [
            PeerInitMessage::PierceFirewall { token: 314 },
            PeerInitMessage::PeerInit {
                username: "alice".into(),
                kind: ConnectionType::Distributed,
                token: 0,
            },
        ] {
            let frame = message.to_bytes();
            assert_eq!(PeerInitMessage::parse(frame.slice(4..)).unwrap(), message);
        }
    }

    #[test]
    fn test_shares_response_round_trip() {
        let message = PeerMessage::SharesResponse(BrowseResponse {
            directories: vec![
                Directory {
                    name: "@@music\\artist".into(),
                    files: sample_files(),
                },
                Directory {
                    name: "@@music\\empty".into(),
                    files: vec![],
                },
            ],
        });
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_search_response_round_trip() {
        let message = PeerMessage::SearchResponse(SearchResponse {
            username: "alice".into(),
            token: 42,
            files: sample_files(),
            has_free_slots: true,
            upload_speed: 125_000,
            queue_length: 3,
        });
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_transfer_negotiation_round_trips() {
        for message in [
            PeerMessage::TransferRequest {
                direction: TransferDirection::Download,
                token: 9,
                filename: "a\\b.mp3".into(),
                size: None,
            },
            PeerMessage::TransferRequest {
                direction: TransferDirection::Upload,
                token: 10,
                filename: "a\\b.mp3".into(),
                size: Some(1024),
            },
            PeerMessage::TransferResponse {
                token: 9,
                allowed: true,
                size: Some(1024),
                reason: None,
            },
            PeerMessage::TransferResponse {
                token: 9,
                allowed: false,
                size: None,
                reason: Some("Queued".into()),
            },
            PeerMessage::QueueDownload {
                filename: "a\\b.mp3".into(),
            },
            PeerMessage::PlaceInQueueResponse {
                filename: "a\\b.mp3".into(),
                place: 7,
            },
        ] {
            assert_eq!(round_trip(message.clone()), message);
        }
    }

    #[test]
    fn test_legacy_u32_transfer_size_accepted() {
        // a response with a 4-byte size field, as older clients send
        let frame = MessageBuilder::peer(PeerCode::TransferResponse)
            .u32(5)
            .bool(true)
            .u32(9999)
            .build();
        let parsed = PeerMessage::parse(frame.slice(4..)).unwrap();
        assert_eq!(
            parsed,
            PeerMessage::TransferResponse {
                token: 5,
                allowed: true,
                size: Some(9999),
                reason: None,
            }
        );
    }

    #[test]
    fn test_user_info_round_trip_with_picture() {
        let message = PeerMessage::UserInfoResponse(UserInfo {
            description: "sharing lossless only".into(),
            picture: Some(vec![0xFF, 0xD8, 0xFF]),
            upload_slots: 2,
            queue_length: 14,
            has_free_slots: false,
        });
        assert_eq!(round_trip(message.clone()), message);
    }
}
