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

//! The forest node record and its canonical binary encoding.

use std::{
    fmt,
    hash::{Hash, Hasher},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::fields::{FieldError, NodeType, QualifiedHash};

/// Upper bound on a single node's payload. Nodes are chat records, not blobs.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node field error: {0}")]
    Field(#[from] FieldError),
    #[error("node data truncated")]
    Truncated,
    #[error("{0} bytes trailing after node encoding")]
    TrailingBytes(usize),
    #[error("{node_type} nodes must not reference a parent")]
    RootWithParent { node_type: NodeType },
    #[error("{node_type} nodes must reference a parent")]
    MissingParent { node_type: NodeType },
    #[error("payload of {got} bytes exceeds the {max} byte maximum")]
    PayloadTooLarge { got: usize, max: usize },
}

/// One immutable record in the forest.
///
/// The identifier is derived from the canonical encoding of the remaining
/// fields, so every accessor returns data covered by the content address.
/// Equality and hashing go by identifier alone.
#[derive(Clone)]
pub struct Node {
    id: QualifiedHash,
    node_type: NodeType,
    parent: Option<QualifiedHash>,
    created: i64,
    payload: Bytes,
}

impl Node {
    /// Construct a node, computing its content address. Fails if the parent
    /// reference does not fit the node type or the payload is oversized.
    pub fn new(
        node_type: NodeType,
        parent: Option<QualifiedHash>,
        created: i64,
        payload: impl Into<Bytes>,
    ) -> Result<Self, NodeError> {
        let payload = payload.into();
        if node_type.is_root() && parent.is_some() {
            return Err(NodeError::RootWithParent { node_type });
        }
        if !node_type.is_root() && parent.is_none() {
            return Err(NodeError::MissingParent { node_type });
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(NodeError::PayloadTooLarge {
                got: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        let encoding = encode_fields(node_type, parent.as_ref(), created, &payload);
        Ok(Self {
            id: QualifiedHash::digest_of(&encoding),
            node_type,
            parent,
            created,
            payload,
        })
    }

    /// Reassemble a node from previously stored parts without recomputing the
    /// content address. Stores re-verify the address on ingest.
    pub fn from_parts(
        id: QualifiedHash,
        node_type: NodeType,
        parent: Option<QualifiedHash>,
        created: i64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id,
            node_type,
            parent,
            created,
            payload: payload.into(),
        }
    }

    /// Decode the canonical binary form, rejecting structural violations.
    /// The returned node's id is computed from the bytes themselves.
    pub fn decode(data: &[u8]) -> Result<Self, NodeError> {
        let mut buf = data;
        if buf.remaining() < 1 + 8 {
            return Err(NodeError::Truncated);
        }
        let node_type = NodeType::from_u8(buf.get_u8()).map_err(FieldError::from)?;
        let created = buf.get_i64();
        let parent = QualifiedHash::get_opt(&mut buf)?;
        if buf.remaining() < 4 {
            return Err(NodeError::Truncated);
        }
        let payload_len = buf.get_u32() as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(NodeError::PayloadTooLarge {
                got: payload_len,
                max: MAX_PAYLOAD_LEN,
            });
        }
        if buf.remaining() < payload_len {
            return Err(NodeError::Truncated);
        }
        let payload = Bytes::copy_from_slice(&buf[..payload_len]);
        buf.advance(payload_len);
        if buf.has_remaining() {
            return Err(NodeError::TrailingBytes(buf.remaining()));
        }
        Self::new(node_type, parent, created, payload)
    }

    /// The canonical binary encoding the content address is derived from.
    pub fn encode(&self) -> Bytes {
        encode_fields(self.node_type, self.parent.as_ref(), self.created, &self.payload)
    }

    /// Recompute the content address from the current field values.
    pub fn computed_id(&self) -> QualifiedHash {
        QualifiedHash::digest_of(&self.encode())
    }

    pub fn id(&self) -> &QualifiedHash {
        &self.id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn parent(&self) -> Option<&QualifiedHash> {
        self.parent.as_ref()
    }

    /// Creation time in milliseconds since the unix epoch, as claimed by the
    /// node author.
    pub fn created(&self) -> i64 {
        self.created
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id.to_string())
            .field("node_type", &self.node_type)
            .field("parent", &self.parent.map(|p| p.to_string()))
            .field("created", &self.created)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

fn encode_fields(
    node_type: NodeType,
    parent: Option<&QualifiedHash>,
    created: i64,
    payload: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 8 + 2 + 32 + 4 + payload.len());
    buf.put_u8(node_type.as_u8());
    buf.put_i64(created);
    QualifiedHash::put_opt(parent, &mut buf);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Milliseconds since the unix epoch, saturating at zero for clocks set
/// before 1970.
pub fn timestamp_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    fn identity() -> Node {
        Node::new(NodeType::Identity, None, 1_000, &b"alice"[..]).unwrap()
    }

    #[test]
    fn encode_decode_round_trip() {
        let community =
            Node::new(NodeType::Community, None, 2_000, &b"rustaceans"[..]).unwrap();
        let conversation = Node::new(
            NodeType::Conversation,
            Some(*community.id()),
            3_000,
            &b"topic"[..],
        )
        .unwrap();

        for node in [identity(), community, conversation] {
            let decoded = Node::decode(&node.encode()).unwrap();
            assert_eq!(decoded, node);
            assert_eq!(decoded.id(), node.id());
            assert_eq!(decoded.parent(), node.parent());
            assert_eq!(decoded.created(), node.created());
            assert_eq!(decoded.payload(), node.payload());
        }
    }

    #[test]
    fn id_covers_every_field() {
        let a = Node::new(NodeType::Identity, None, 1_000, &b"alice"[..]).unwrap();
        let b = Node::new(NodeType::Identity, None, 1_001, &b"alice"[..]).unwrap();
        let c = Node::new(NodeType::Identity, None, 1_000, &b"alicia"[..]).unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn structural_rules() {
        let identity = identity();
        assert!(matches!(
            Node::new(NodeType::Identity, Some(*identity.id()), 0, &b""[..]),
            Err(NodeError::RootWithParent { .. })
        ));
        assert!(matches!(
            Node::new(NodeType::Reply, None, 0, &b"hi"[..]),
            Err(NodeError::MissingParent { .. })
        ));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let node = identity();
        let mut bytes = node.encode().to_vec();
        bytes.push(0);
        assert!(matches!(Node::decode(&bytes), Err(NodeError::TrailingBytes(1))));
    }

    #[test]
    fn decode_rejects_truncation() {
        let node = identity();
        let bytes = node.encode();
        for len in 0..bytes.len() {
            assert!(Node::decode(&bytes[..len]).is_err(), "accepted prefix of {} bytes", len);
        }
    }

    #[test]
    fn tampered_payload_changes_id() {
        let node = identity();
        let mut bytes = node.encode().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = Node::decode(&bytes).unwrap();
        assert_ne!(tampered.id(), node.id());
    }
}
