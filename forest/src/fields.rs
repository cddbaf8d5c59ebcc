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

//! Primitive field types shared by every node: hash algorithms, qualified
//! hashes and the node type discriminant.

use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::{Buf, BufMut};
use sha2::{Digest, Sha512_256};
use thiserror::Error;

/// Separator between the algorithm prefix and the digest in the text form of
/// a [`QualifiedHash`].
const TEXT_SEPARATOR: &str = "__";

/// Wire code reserved for the null reference (a root node's absent parent).
const NULL_ALGORITHM_CODE: u8 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("unknown hash algorithm code {0}")]
    UnknownHashAlgorithm(u8),
    #[error("unexpected digest length: expected {expected}, got {got}")]
    UnexpectedDigestLength { expected: usize, got: usize },
    #[error("unknown node type code {0}")]
    UnknownNodeType(u8),
    #[error("malformed text encoding `{0}`")]
    MalformedTextEncoding(String),
    #[error("field data truncated")]
    Truncated,
}

/// Hash algorithms usable for content addressing. Only one exists today; the
/// qualified encoding leaves room for more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgorithm {
    Sha512_256,
}

impl HashAlgorithm {
    pub fn code(self) -> u8 {
        match self {
            HashAlgorithm::Sha512_256 => 1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, FieldError> {
        match code {
            1 => Ok(HashAlgorithm::Sha512_256),
            other => Err(FieldError::UnknownHashAlgorithm(other)),
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha512_256 => 32,
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            HashAlgorithm::Sha512_256 => "sha512_256",
        }
    }
}

/// A hash digest qualified by the algorithm that produced it. Serves as a
/// node's identity; two nodes are equal iff their qualified hashes are.
///
/// Text form is `<algorithm>__<base64url digest, no padding>`; binary form is
/// `[algorithm code][digest length][digest]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedHash {
    algorithm: HashAlgorithm,
    digest: [u8; 32],
}

impl QualifiedHash {
    /// Hash `data` with the current default algorithm.
    pub fn digest_of(data: &[u8]) -> Self {
        let digest = Sha512_256::digest(data);
        Self {
            algorithm: HashAlgorithm::Sha512_256,
            digest: digest.into(),
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Abbreviated form for log lines.
    pub fn short_str(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.digest[..6])
    }

    /// Append the binary form to `buf`.
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.algorithm.code());
        buf.put_u8(self.digest.len() as u8);
        buf.put_slice(&self.digest);
    }

    /// Append the binary form of an optional reference, writing the null
    /// reference when `hash` is `None`.
    pub fn put_opt(hash: Option<&QualifiedHash>, buf: &mut impl BufMut) {
        match hash {
            Some(hash) => hash.put(buf),
            None => {
                buf.put_u8(NULL_ALGORITHM_CODE);
                buf.put_u8(0);
            },
        }
    }

    /// Read an optional reference in binary form. The null reference decodes
    /// to `None`.
    pub fn get_opt(buf: &mut impl Buf) -> Result<Option<QualifiedHash>, FieldError> {
        if buf.remaining() < 2 {
            return Err(FieldError::Truncated);
        }
        let code = buf.get_u8();
        let len = buf.get_u8() as usize;
        if code == NULL_ALGORITHM_CODE {
            if len != 0 {
                return Err(FieldError::UnexpectedDigestLength { expected: 0, got: len });
            }
            return Ok(None);
        }
        let algorithm = HashAlgorithm::from_code(code)?;
        if len != algorithm.digest_len() {
            return Err(FieldError::UnexpectedDigestLength {
                expected: algorithm.digest_len(),
                got: len,
            });
        }
        if buf.remaining() < len {
            return Err(FieldError::Truncated);
        }
        let mut digest = [0u8; 32];
        buf.copy_to_slice(&mut digest);
        Ok(Some(QualifiedHash { algorithm, digest }))
    }
}

impl fmt::Display for QualifiedHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.algorithm.prefix(),
            TEXT_SEPARATOR,
            URL_SAFE_NO_PAD.encode(self.digest)
        )
    }
}

impl fmt::Debug for QualifiedHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QualifiedHash({})", self)
    }
}

impl FromStr for QualifiedHash {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, encoded) = s
            .split_once(TEXT_SEPARATOR)
            .ok_or_else(|| FieldError::MalformedTextEncoding(s.to_string()))?;
        let algorithm = match prefix {
            "sha512_256" => HashAlgorithm::Sha512_256,
            _ => return Err(FieldError::MalformedTextEncoding(s.to_string())),
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| FieldError::MalformedTextEncoding(s.to_string()))?;
        if bytes.len() != algorithm.digest_len() {
            return Err(FieldError::UnexpectedDigestLength {
                expected: algorithm.digest_len(),
                got: bytes.len(),
            });
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes);
        Ok(QualifiedHash { algorithm, digest })
    }
}

/// Discriminant for the four node kinds of the forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Identity,
    Community,
    Conversation,
    Reply,
}

impl NodeType {
    pub const ALL: [NodeType; 4] = [
        NodeType::Identity,
        NodeType::Community,
        NodeType::Conversation,
        NodeType::Reply,
    ];

    pub fn as_u8(self) -> u8 {
        match self {
            NodeType::Identity => 1,
            NodeType::Community => 2,
            NodeType::Conversation => 3,
            NodeType::Reply => 4,
        }
    }

    pub fn from_u8(code: u8) -> Result<Self, FieldError> {
        match code {
            1 => Ok(NodeType::Identity),
            2 => Ok(NodeType::Community),
            3 => Ok(NodeType::Conversation),
            4 => Ok(NodeType::Reply),
            other => Err(FieldError::UnknownNodeType(other)),
        }
    }

    /// Roots may not reference a parent.
    pub fn is_root(self) -> bool {
        matches!(self, NodeType::Identity | NodeType::Community)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Identity => "identity",
            NodeType::Community => "community",
            NodeType::Conversation => "conversation",
            NodeType::Reply => "reply",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn text_round_trip() {
        let hash = QualifiedHash::digest_of(b"some content");
        let parsed = hash.to_string().parse::<QualifiedHash>().unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn text_rejects_garbage() {
        assert!("sha512_256".parse::<QualifiedHash>().is_err());
        assert!("md5__AAAA".parse::<QualifiedHash>().is_err());
        assert!("sha512_256__!!!not-base64!!!".parse::<QualifiedHash>().is_err());
        // valid base64, wrong digest size
        assert!("sha512_256__AAAA".parse::<QualifiedHash>().is_err());
    }

    #[test]
    fn binary_round_trip() {
        let hash = QualifiedHash::digest_of(b"other content");
        let mut buf = BytesMut::new();
        hash.put(&mut buf);
        let read = QualifiedHash::get_opt(&mut buf.freeze()).unwrap();
        assert_eq!(read, Some(hash));
    }

    #[test]
    fn binary_null_reference() {
        let mut buf = BytesMut::new();
        QualifiedHash::put_opt(None, &mut buf);
        assert_eq!(QualifiedHash::get_opt(&mut buf.freeze()).unwrap(), None);
    }

    #[test]
    fn binary_rejects_truncation() {
        let hash = QualifiedHash::digest_of(b"content");
        let mut buf = BytesMut::new();
        hash.put(&mut buf);
        let truncated = buf.freeze().slice(..10);
        assert_eq!(
            QualifiedHash::get_opt(&mut truncated.clone()),
            Err(FieldError::Truncated)
        );
    }

    #[test]
    fn node_type_codes() {
        for node_type in NodeType::ALL {
            assert_eq!(NodeType::from_u8(node_type.as_u8()).unwrap(), node_type);
        }
        assert!(NodeType::from_u8(0).is_err());
        assert!(NodeType::from_u8(5).is_err());
    }
}
