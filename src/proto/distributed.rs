//! Distributed channel messages
//!
//! Frames received from the parent are rebroadcast to children verbatim, so
//! handlers work with both the decoded form and the original bytes.

use crate::error::{Error, Result};
use crate::proto::frame::{MessageBuilder, MessageReader};
use crate::proto::DistributedCode;
use bytes::Bytes;

/// A search travelling down the distribution tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedSearch {
    pub username: String,
    pub token: u32,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributedMessage {
    Ping,
    /// Search relayed by our parent (or synthesised from a server search).
    SearchRequest(DistributedSearch),
    /// Search the server hands directly to branch roots.
    ServerSearchRequest(DistributedSearch),
    BranchLevel(u32),
    BranchRoot(String),
    ChildDepth(u32),
}

impl DistributedMessage {
    pub fn to_bytes(&self) -> Bytes {
        match self {
            DistributedMessage::Ping => MessageBuilder::distributed(DistributedCode::Ping).build(),
            DistributedMessage::SearchRequest(search) => {
                MessageBuilder::distributed(DistributedCode::SearchRequest)
                    .u32(0)
                    .string(&search.username)
                    .u32(search.token)
                    .string(&search.query)
                    .build()
            }
            DistributedMessage::ServerSearchRequest(search) => {
                MessageBuilder::distributed(DistributedCode::ServerSearchRequest)
                    .u32(0)
                    .string(&search.username)
                    .u32(search.token)
                    .string(&search.query)
                    .build()
            }
            DistributedMessage::BranchLevel(level) => {
                MessageBuilder::distributed(DistributedCode::BranchLevel)
                    .u32(*level)
                    .build()
            }
            DistributedMessage::BranchRoot(root) => {
                MessageBuilder::distributed(DistributedCode::BranchRoot)
                    .string(root)
                    .build()
            }
            DistributedMessage::ChildDepth(depth) => {
                MessageBuilder::distributed(DistributedCode::ChildDepth)
                    .u32(*depth)
                    .build()
            }
        }
    }

    /// Parse one distributed frame body (length prefix stripped).
    pub fn parse(body: Bytes) -> Result<Self> {
        let mut reader = MessageReader::new(body);
        let raw = reader.code_u8()?;
        let Some(code) = DistributedCode::from_u8(raw) else {
            return Err(Error::MessageFormat(format!(
                "unknown distributed opcode {raw}"
            )));
        };

        match code {
            DistributedCode::Ping => Ok(DistributedMessage::Ping),
            DistributedCode::SearchRequest => {
                let _unknown = reader.u32()?;
                let username = reader.string()?;
                let token = reader.u32()?;
                let query = reader.string()?;
                Ok(DistributedMessage::SearchRequest(DistributedSearch {
                    username,
                    token,
                    query,
                }))
            }
            DistributedCode::ServerSearchRequest => {
                let _unknown = reader.u32()?;
                let username = reader.string()?;
                let token = reader.u32()?;
                let query = reader.string()?;
                Ok(DistributedMessage::ServerSearchRequest(DistributedSearch {
                    username,
                    token,
                    query,
                }))
            }
            DistributedCode::BranchLevel => Ok(DistributedMessage::BranchLevel(reader.u32()?)),
            DistributedCode::BranchRoot => Ok(DistributedMessage::BranchRoot(reader.string()?)),
            DistributedCode::ChildDepth => Ok(DistributedMessage::ChildDepth(reader.u32()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trips() {
        for message in [
            DistributedMessage::Ping,
            DistributedMessage::SearchRequest(DistributedSearch {
                username: "a".into(),
                token: 42,
                query: "hello".into(),
            }),
            DistributedMessage::ServerSearchRequest(DistributedSearch {
                username: "root".into(),
                token: 7,
                query: "flac".into(),
            }),
            DistributedMessage::BranchLevel(3),
            DistributedMessage::BranchRoot("rootuser".into()),
            DistributedMessage::ChildDepth(2),
        ] {
            let frame = message.to_bytes();
            assert_eq!(
                DistributedMessage::parse(frame.slice(4..)).unwrap(),
                message
            );
        }
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let body = Bytes::from_static(&[0xEE]);
        assert!(matches!(
            DistributedMessage::parse(body),
            Err(Error::MessageFormat(_))
        ));
    }
}
