// Copyright 2022, The Sprout Developers
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! The sprout wire protocol.
//!
//! Every message is one ASCII header line `<verb> <message id> <fields...>\n`,
//! optionally followed by a body of one record per line (`query` carries hash
//! lines, `announce` and `response` carry node lines). A node line is
//! `<qualified hash> <base64url of the node's binary encoding>\n` with no
//! padding; the hash must match the encoding or the message is rejected.

mod error;
mod reader;

pub use error::ProtocolError;
pub use reader::MessageReader;

use std::fmt::{self, Write as _};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sprout_forest::{Node, NodeType, QualifiedHash};

/// Protocol version spoken by this implementation. Equal majors are
/// compatible; minors may differ.
pub const PROTOCOL_MAJOR: u16 = 0;
pub const PROTOCOL_MINOR: u16 = 0;

/// Upper bound on records in a single `query`, `announce` or `response` body.
pub const MAX_RECORDS_PER_MESSAGE: usize = 4096;

/// Per-connection identifier correlating a request with its
/// `response`/`status`. Allocated monotonically by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome codes carried by `status` messages. Wire values are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Malformed,
    ProtocolTooOld,
    ProtocolTooNew,
    UnknownNode,
}

impl StatusCode {
    pub fn as_u8(self) -> u8 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Malformed => 1,
            StatusCode::ProtocolTooOld => 2,
            StatusCode::ProtocolTooNew => 3,
            StatusCode::UnknownNode => 4,
        }
    }

    pub fn from_u8(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::Malformed),
            2 => Ok(StatusCode::ProtocolTooOld),
            3 => Ok(StatusCode::ProtocolTooNew),
            4 => Ok(StatusCode::UnknownNode),
            other => Err(ProtocolError::UnknownStatusCode(other)),
        }
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    fn description(self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::Malformed => "malformed protocol message",
            StatusCode::ProtocolTooOld => "protocol too old",
            StatusCode::ProtocolTooNew => "protocol too new",
            StatusCode::UnknownNode => "referenced unknown node",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status code {} ({})", self.as_u8(), self.description())
    }
}

/// One parsed protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version {
        id: MessageId,
        major: u16,
        minor: u16,
    },
    List {
        id: MessageId,
        node_type: NodeType,
        quantity: usize,
    },
    Query {
        id: MessageId,
        node_ids: Vec<QualifiedHash>,
    },
    Ancestry {
        id: MessageId,
        node_id: QualifiedHash,
        levels: usize,
    },
    LeavesOf {
        id: MessageId,
        node_id: QualifiedHash,
        quantity: usize,
    },
    Subscribe {
        id: MessageId,
        community: QualifiedHash,
    },
    Unsubscribe {
        id: MessageId,
        community: QualifiedHash,
    },
    Announce {
        id: MessageId,
        nodes: Vec<Node>,
    },
    /// Answers the request with message id `target`.
    Response {
        target: MessageId,
        nodes: Vec<Node>,
    },
    /// Answers the request with message id `target`.
    Status {
        target: MessageId,
        code: StatusCode,
    },
}

impl Message {
    pub fn verb(&self) -> &'static str {
        match self {
            Message::Version { .. } => "version",
            Message::List { .. } => "list",
            Message::Query { .. } => "query",
            Message::Ancestry { .. } => "ancestry",
            Message::LeavesOf { .. } => "leaves_of",
            Message::Subscribe { .. } => "subscribe",
            Message::Unsubscribe { .. } => "unsubscribe",
            Message::Announce { .. } => "announce",
            Message::Response { .. } => "response",
            Message::Status { .. } => "status",
        }
    }

    /// The wire form of this message, header line plus body lines.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        // writing to a String cannot fail
        let _ = match self {
            Message::Version { id, major, minor } => {
                writeln!(out, "version {} {}.{}", id, major, minor)
            },
            Message::List {
                id,
                node_type,
                quantity,
            } => writeln!(out, "list {} {} {}", id, node_type.as_u8(), quantity),
            Message::Query { id, node_ids } => {
                let _ = writeln!(out, "query {} {}", id, node_ids.len());
                for node_id in node_ids {
                    let _ = writeln!(out, "{}", node_id);
                }
                Ok(())
            },
            Message::Ancestry { id, node_id, levels } => {
                writeln!(out, "ancestry {} {} {}", id, node_id, levels)
            },
            Message::LeavesOf {
                id,
                node_id,
                quantity,
            } => writeln!(out, "leaves_of {} {} {}", id, node_id, quantity),
            Message::Subscribe { id, community } => {
                writeln!(out, "subscribe {} {}", id, community)
            },
            Message::Unsubscribe { id, community } => {
                writeln!(out, "unsubscribe {} {}", id, community)
            },
            Message::Announce { id, nodes } => {
                let _ = writeln!(out, "announce {} {}", id, nodes.len());
                put_node_lines(&mut out, nodes);
                Ok(())
            },
            Message::Response { target, nodes } => {
                let _ = writeln!(out, "response {} {}", target, nodes.len());
                put_node_lines(&mut out, nodes);
                Ok(())
            },
            Message::Status { target, code } => {
                writeln!(out, "status {} {}", target, code.as_u8())
            },
        };
        out
    }
}

fn put_node_lines(out: &mut String, nodes: &[Node]) {
    for node in nodes {
        let _ = writeln!(out, "{} {}", node.id(), URL_SAFE_NO_PAD.encode(node.encode()));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn nodes() -> Vec<Node> {
        let community = Node::new(NodeType::Community, None, 1_000, &b"birds"[..]).unwrap();
        let conversation = Node::new(
            NodeType::Conversation,
            Some(*community.id()),
            2_000,
            &b"migration"[..],
        )
        .unwrap();
        vec![community, conversation]
    }

    async fn round_trip(message: Message) {
        let encoded = message.encode();
        let mut reader = MessageReader::new(encoded.as_bytes());
        let decoded = reader.read_message().await.unwrap();
        assert_eq!(decoded, message, "wire form was: {:?}", encoded);
    }

    #[tokio::test]
    async fn round_trips_every_verb() {
        let nodes = nodes();
        let hash = *nodes[0].id();
        let other = *nodes[1].id();
        round_trip(Message::Version {
            id: MessageId(0),
            major: 0,
            minor: 7,
        })
        .await;
        round_trip(Message::List {
            id: MessageId(9),
            node_type: NodeType::Identity,
            quantity: 1024,
        })
        .await;
        round_trip(Message::Query {
            id: MessageId(1),
            node_ids: vec![],
        })
        .await;
        round_trip(Message::Query {
            id: MessageId(2),
            node_ids: vec![hash, other],
        })
        .await;
        round_trip(Message::Ancestry {
            id: MessageId(3),
            node_id: hash,
            levels: 5,
        })
        .await;
        round_trip(Message::LeavesOf {
            id: MessageId(4),
            node_id: hash,
            quantity: 10,
        })
        .await;
        round_trip(Message::Subscribe {
            id: MessageId(5),
            community: hash,
        })
        .await;
        round_trip(Message::Unsubscribe {
            id: MessageId(6),
            community: hash,
        })
        .await;
        round_trip(Message::Announce {
            id: MessageId(7),
            nodes: nodes.clone(),
        })
        .await;
        round_trip(Message::Response {
            target: MessageId(8),
            nodes,
        })
        .await;
        for code in [
            StatusCode::Ok,
            StatusCode::Malformed,
            StatusCode::ProtocolTooOld,
            StatusCode::ProtocolTooNew,
            StatusCode::UnknownNode,
        ] {
            round_trip(Message::Status {
                target: MessageId(11),
                code,
            })
            .await;
        }
    }

    #[tokio::test]
    async fn reads_consecutive_messages() {
        let first = Message::Version {
            id: MessageId(0),
            major: 0,
            minor: 0,
        };
        let second = Message::Status {
            target: MessageId(0),
            code: StatusCode::Ok,
        };
        let wire = format!("{}{}", first.encode(), second.encode());
        let mut reader = MessageReader::new(wire.as_bytes());
        assert_eq!(reader.read_message().await.unwrap(), first);
        assert_eq!(reader.read_message().await.unwrap(), second);
        assert!(matches!(
            reader.read_message().await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn header_lines_match_the_wire_format() {
        assert_eq!(
            Message::Version {
                id: MessageId(0),
                major: 0,
                minor: 0
            }
            .encode(),
            "version 0 0.0\n"
        );
        assert_eq!(
            Message::Status {
                target: MessageId(3),
                code: StatusCode::UnknownNode
            }
            .encode(),
            "status 3 4\n"
        );
        assert_eq!(
            Message::List {
                id: MessageId(1),
                node_type: NodeType::Identity,
                quantity: 10
            }
            .encode(),
            "list 1 1 10\n"
        );
    }

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(StatusCode::Ok.as_u8(), 0);
        assert_eq!(StatusCode::Malformed.as_u8(), 1);
        assert_eq!(StatusCode::ProtocolTooOld.as_u8(), 2);
        assert_eq!(StatusCode::ProtocolTooNew.as_u8(), 3);
        assert_eq!(StatusCode::UnknownNode.as_u8(), 4);
    }
}
