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

use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sprout_forest::{Node, NodeType, QualifiedHash};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::{Message, MessageId, ProtocolError, StatusCode, MAX_RECORDS_PER_MESSAGE};

/// Longest line the reader will buffer. Sized for a node line carrying a
/// maximum-size payload in base64.
const MAX_LINE_LEN: u64 = 2 * 1024 * 1024;

/// Reads sprout protocol messages off a buffered byte stream, one at a time.
///
/// The reader makes no policy decisions: it parses or it fails, and every
/// failure other than a clean close means the stream position can no longer
/// be trusted.
pub struct MessageReader<R> {
    inner: R,
}

impl<R: AsyncBufRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read and parse one message, blocking until a full message is
    /// available.
    pub async fn read_message(&mut self) -> Result<Message, ProtocolError> {
        let line = self.read_line().await?;
        let mut tokens = line.split_ascii_whitespace();
        let verb = match tokens.next() {
            Some(verb) => verb,
            None => return Err(ProtocolError::malformed("message", "empty header line")),
        };

        match verb {
            "version" => {
                let id = parse_id("version", tokens.next())?;
                let version = required("version", tokens.next(), "version number")?;
                let (major, minor) = version
                    .split_once('.')
                    .ok_or_else(|| ProtocolError::malformed("version", "version is not <major>.<minor>"))?;
                let major = parse_int::<u16>("version", Some(major), "major")?;
                let minor = parse_int::<u16>("version", Some(minor), "minor")?;
                end_of_header("version", tokens)?;
                Ok(Message::Version { id, major, minor })
            },
            "list" => {
                let id = parse_id("list", tokens.next())?;
                let type_code = parse_int::<u8>("list", tokens.next(), "node type")?;
                let node_type = NodeType::from_u8(type_code)
                    .map_err(|err| ProtocolError::malformed("list", err.to_string()))?;
                let quantity = parse_int::<usize>("list", tokens.next(), "quantity")?;
                end_of_header("list", tokens)?;
                Ok(Message::List {
                    id,
                    node_type,
                    quantity,
                })
            },
            "query" => {
                let id = parse_id("query", tokens.next())?;
                let count = parse_count("query", tokens.next())?;
                end_of_header("query", tokens)?;
                let mut node_ids = Vec::with_capacity(count);
                for _ in 0..count {
                    let line = self.read_body_line("query").await?;
                    let hash = QualifiedHash::from_str(line.trim_end())
                        .map_err(|err| ProtocolError::malformed("query", err.to_string()))?;
                    node_ids.push(hash);
                }
                Ok(Message::Query { id, node_ids })
            },
            "ancestry" => {
                let id = parse_id("ancestry", tokens.next())?;
                let node_id = parse_hash("ancestry", tokens.next())?;
                let levels = parse_int::<usize>("ancestry", tokens.next(), "levels")?;
                end_of_header("ancestry", tokens)?;
                Ok(Message::Ancestry { id, node_id, levels })
            },
            "leaves_of" => {
                let id = parse_id("leaves_of", tokens.next())?;
                let node_id = parse_hash("leaves_of", tokens.next())?;
                let quantity = parse_int::<usize>("leaves_of", tokens.next(), "quantity")?;
                end_of_header("leaves_of", tokens)?;
                Ok(Message::LeavesOf {
                    id,
                    node_id,
                    quantity,
                })
            },
            "subscribe" => {
                let id = parse_id("subscribe", tokens.next())?;
                let community = parse_hash("subscribe", tokens.next())?;
                end_of_header("subscribe", tokens)?;
                Ok(Message::Subscribe { id, community })
            },
            "unsubscribe" => {
                let id = parse_id("unsubscribe", tokens.next())?;
                let community = parse_hash("unsubscribe", tokens.next())?;
                end_of_header("unsubscribe", tokens)?;
                Ok(Message::Unsubscribe { id, community })
            },
            "announce" => {
                let id = parse_id("announce", tokens.next())?;
                let count = parse_count("announce", tokens.next())?;
                end_of_header("announce", tokens)?;
                let nodes = self.read_node_lines("announce", count).await?;
                Ok(Message::Announce { id, nodes })
            },
            "response" => {
                let target = parse_id("response", tokens.next())?;
                let count = parse_count("response", tokens.next())?;
                end_of_header("response", tokens)?;
                let nodes = self.read_node_lines("response", count).await?;
                Ok(Message::Response { target, nodes })
            },
            "status" => {
                let target = parse_id("status", tokens.next())?;
                let code = parse_int::<u8>("status", tokens.next(), "status code")?;
                let code = StatusCode::from_u8(code)?;
                end_of_header("status", tokens)?;
                Ok(Message::Status { target, code })
            },
            other => Err(ProtocolError::UnknownVerb(other.to_string())),
        }
    }

    /// Read one LF-terminated line, without the terminator. A clean close
    /// before the first byte is [`ProtocolError::ConnectionClosed`].
    async fn read_line(&mut self) -> Result<String, ProtocolError> {
        let mut buf = Vec::new();
        let n = (&mut self.inner)
            .take(MAX_LINE_LEN)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        match buf.pop() {
            Some(b'\n') => {},
            _ => {
                let detail = if n as u64 == MAX_LINE_LEN {
                    "line exceeds maximum length"
                } else {
                    "line not terminated with newline"
                };
                return Err(ProtocolError::malformed("message", detail));
            },
        }
        if !buf.is_ascii() {
            return Err(ProtocolError::malformed("message", "non-ascii bytes in line"));
        }
        // ascii checked above, so utf8 conversion cannot fail
        String::from_utf8(buf)
            .map_err(|_| ProtocolError::malformed("message", "non-ascii bytes in line"))
    }

    /// Like [`read_line`], but a close mid-body is a short read, not a clean
    /// disconnect.
    async fn read_body_line(&mut self, verb: &'static str) -> Result<String, ProtocolError> {
        match self.read_line().await {
            Err(ProtocolError::ConnectionClosed) => {
                Err(ProtocolError::malformed(verb, "stream ended inside message body"))
            },
            other => other,
        }
    }

    async fn read_node_lines(
        &mut self,
        verb: &'static str,
        count: usize,
    ) -> Result<Vec<Node>, ProtocolError> {
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            let line = self.read_body_line(verb).await?;
            let (id_text, encoded) = line
                .split_once(' ')
                .ok_or_else(|| ProtocolError::malformed(verb, "node line is not `<id> <data>`"))?;
            let declared = QualifiedHash::from_str(id_text)
                .map_err(|err| ProtocolError::malformed(verb, err.to_string()))?;
            let data = URL_SAFE_NO_PAD
                .decode(encoded.trim_end())
                .map_err(|err| ProtocolError::malformed(verb, format!("node data: {}", err)))?;
            let node = Node::decode(&data)
                .map_err(|err| ProtocolError::malformed(verb, format!("node encoding: {}", err)))?;
            if node.id() != &declared {
                return Err(ProtocolError::NodeIntegrity {
                    declared,
                    computed: *node.id(),
                });
            }
            nodes.push(node);
        }
        Ok(nodes)
    }
}

fn required<'a>(
    verb: &'static str,
    token: Option<&'a str>,
    what: &'static str,
) -> Result<&'a str, ProtocolError> {
    token.ok_or_else(|| ProtocolError::malformed(verb, format!("missing {}", what)))
}

fn parse_int<T: FromStr>(
    verb: &'static str,
    token: Option<&str>,
    what: &'static str,
) -> Result<T, ProtocolError> {
    required(verb, token, what)?
        .parse::<T>()
        .map_err(|_| ProtocolError::malformed(verb, format!("{} is not a valid integer", what)))
}

fn parse_id(verb: &'static str, token: Option<&str>) -> Result<MessageId, ProtocolError> {
    parse_int::<u64>(verb, token, "message id").map(MessageId)
}

fn parse_hash(verb: &'static str, token: Option<&str>) -> Result<QualifiedHash, ProtocolError> {
    QualifiedHash::from_str(required(verb, token, "node id")?)
        .map_err(|err| ProtocolError::malformed(verb, err.to_string()))
}

fn parse_count(verb: &'static str, token: Option<&str>) -> Result<usize, ProtocolError> {
    let count = parse_int::<usize>(verb, token, "record count")?;
    if count > MAX_RECORDS_PER_MESSAGE {
        return Err(ProtocolError::TooManyRecords {
            got: count,
            max: MAX_RECORDS_PER_MESSAGE,
        });
    }
    Ok(count)
}

fn end_of_header<'a>(
    verb: &'static str,
    mut tokens: impl Iterator<Item = &'a str>,
) -> Result<(), ProtocolError> {
    match tokens.next() {
        Some(extra) => Err(ProtocolError::malformed(
            verb,
            format!("unexpected trailing field `{}`", extra),
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn read_one(wire: &str) -> Result<Message, ProtocolError> {
        MessageReader::new(wire.as_bytes()).read_message().await
    }

    #[tokio::test]
    async fn rejects_unknown_verbs() {
        assert!(matches!(
            read_one("query_any 0 1\n").await,
            Err(ProtocolError::UnknownVerb(v)) if v == "query_any"
        ));
    }

    #[tokio::test]
    async fn rejects_malformed_headers() {
        for wire in [
            "version 0\n",
            "version 0 00\n",
            "version zero 0.0\n",
            "list 0 1\n",
            "list 0 9 10\n",
            "status 0 200\n",
            "subscribe 0 not-a-hash\n",
            "version 0 0.0 extra\n",
            "\n",
        ] {
            assert!(read_one(wire).await.is_err(), "accepted: {:?}", wire);
        }
    }

    #[tokio::test]
    async fn rejects_unterminated_lines() {
        assert!(matches!(
            read_one("version 0 0.0").await,
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_short_bodies() {
        let hash = QualifiedHash::digest_of(b"x");
        let wire = format!("query 0 2\n{}\n", hash);
        assert!(matches!(
            read_one(&wire).await,
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_excessive_record_counts() {
        let wire = format!("announce 0 {}\n", MAX_RECORDS_PER_MESSAGE + 1);
        assert!(matches!(
            read_one(&wire).await,
            Err(ProtocolError::TooManyRecords { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_node_line_integrity_mismatch() {
        let node = Node::new(NodeType::Identity, None, 1_000, &b"carol"[..]).unwrap();
        let declared = QualifiedHash::digest_of(b"some other node");
        let wire = format!(
            "announce 0 1\n{} {}\n",
            declared,
            URL_SAFE_NO_PAD.encode(node.encode())
        );
        match read_one(&wire).await {
            Err(ProtocolError::NodeIntegrity { computed, .. }) => {
                assert_eq!(computed, *node.id());
            },
            other => panic!("expected integrity failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_stream_is_a_clean_close() {
        assert!(matches!(
            read_one("").await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }
}
