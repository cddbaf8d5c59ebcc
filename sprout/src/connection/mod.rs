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

//! One sprout connection over a duplex byte stream.
//!
//! The stream is split: a single reader drives [`Connection::read_message`]
//! in a loop, while any number of tasks send through clones of the
//! [`MessageSender`]. Inbound `response`/`status` messages complete the
//! pending-reply slot they target; every other verb is dispatched to the
//! installed [`MessageHandler`].
//!
//! Handlers run on the reader task. A handler must never wait for a reply
//! from the peer on its own connection: the reader that would deliver the
//! reply is the task running the handler. Work that needs a round trip is
//! dispatched to a separate task holding a `MessageSender` clone.

mod pending;
mod sender;

pub use pending::{PeerReply, ReplyReceiver};
pub use sender::MessageSender;

use std::fmt;

use async_trait::async_trait;
use log::*;
use sprout_forest::{Node, NodeType, QualifiedHash};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadHalf};

use crate::proto::{Message, MessageId, MessageReader, ProtocolError, StatusCode};

const LOG_TARGET: &str = "sprout::connection";

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for a reply")]
    ReplyTimeout,
    #[error("peer answered with {0}")]
    Status(StatusCode),
    #[error("peer sent a response where only a status fits, or the reverse")]
    UnexpectedResponse,
}

/// Which side initiated the underlying transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDirection::Inbound => write!(f, "inbound"),
            ConnectionDirection::Outbound => write!(f, "outbound"),
        }
    }
}

/// Receives every inbound request verb. `response` and `status` never reach
/// the handler; they resolve pending replies inside the connection.
///
/// One method per verb keeps "no handler installed" unrepresentable.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_version(
        &self,
        message_id: MessageId,
        major: u16,
        minor: u16,
    ) -> Result<(), ConnectionError>;

    async fn handle_list(
        &self,
        message_id: MessageId,
        node_type: NodeType,
        quantity: usize,
    ) -> Result<(), ConnectionError>;

    async fn handle_query(
        &self,
        message_id: MessageId,
        node_ids: Vec<QualifiedHash>,
    ) -> Result<(), ConnectionError>;

    async fn handle_ancestry(
        &self,
        message_id: MessageId,
        node_id: QualifiedHash,
        levels: usize,
    ) -> Result<(), ConnectionError>;

    async fn handle_leaves_of(
        &self,
        message_id: MessageId,
        node_id: QualifiedHash,
        quantity: usize,
    ) -> Result<(), ConnectionError>;

    async fn handle_subscribe(
        &self,
        message_id: MessageId,
        community: QualifiedHash,
    ) -> Result<(), ConnectionError>;

    async fn handle_unsubscribe(
        &self,
        message_id: MessageId,
        community: QualifiedHash,
    ) -> Result<(), ConnectionError>;

    async fn handle_announce(
        &self,
        message_id: MessageId,
        nodes: Vec<Node>,
    ) -> Result<(), ConnectionError>;
}

/// A sprout connection over any reliable duplex byte transport.
pub struct Connection<TSocket> {
    reader: MessageReader<BufReader<ReadHalf<TSocket>>>,
    sender: MessageSender<TSocket>,
}

impl<TSocket> Connection<TSocket>
where TSocket: AsyncRead + AsyncWrite
{
    pub fn new(socket: TSocket) -> Self {
        let (read_half, write_half) = tokio::io::split(socket);
        Self {
            reader: MessageReader::new(BufReader::new(read_half)),
            sender: MessageSender::new(write_half),
        }
    }

    /// A clonable handle for sending on this connection.
    pub fn sender(&self) -> MessageSender<TSocket> {
        self.sender.clone()
    }

    /// Read one message and dispatch it. Replies resolve their pending slot;
    /// request verbs are passed to `handler` on this task.
    ///
    /// Errors from parsing or the transport are fatal to the connection; a
    /// reply targeting an id nobody is waiting for is reported here and
    /// survived, since a cancelled request may legitimately be answered late.
    pub async fn read_message<H>(&mut self, handler: &H) -> Result<(), ConnectionError>
    where H: MessageHandler {
        let message = self.reader.read_message().await?;
        trace!(target: LOG_TARGET, "Received {} message", message.verb());
        match message {
            Message::Response { target, nodes } => {
                self.complete(target, PeerReply::Response(nodes));
                Ok(())
            },
            Message::Status { target, code } => {
                self.complete(target, PeerReply::Status(code));
                Ok(())
            },
            Message::Version { id, major, minor } => handler.handle_version(id, major, minor).await,
            Message::List {
                id,
                node_type,
                quantity,
            } => handler.handle_list(id, node_type, quantity).await,
            Message::Query { id, node_ids } => handler.handle_query(id, node_ids).await,
            Message::Ancestry { id, node_id, levels } => {
                handler.handle_ancestry(id, node_id, levels).await
            },
            Message::LeavesOf {
                id,
                node_id,
                quantity,
            } => handler.handle_leaves_of(id, node_id, quantity).await,
            Message::Subscribe { id, community } => handler.handle_subscribe(id, community).await,
            Message::Unsubscribe { id, community } => {
                handler.handle_unsubscribe(id, community).await
            },
            Message::Announce { id, nodes } => handler.handle_announce(id, nodes).await,
        }
    }

    /// Fail outstanding requests and close the write side. The read side
    /// closes when the connection is dropped.
    pub async fn close(&self) {
        self.sender.close().await;
    }

    fn complete(&self, target: MessageId, reply: PeerReply) {
        if !self.sender.pending().complete(target, reply) {
            warn!(
                target: LOG_TARGET,
                "Discarding reply to message #{}: no request is waiting on it", target
            );
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::{io::DuplexStream, time};

    use super::*;
    use crate::proto::PROTOCOL_MAJOR;

    /// Handler for connection ends that are not expected to receive any
    /// request verbs during a test.
    struct RejectAll;

    macro_rules! reject {
        () => {
            panic!("this test peer does not expect to handle requests")
        };
    }

    #[async_trait]
    impl MessageHandler for RejectAll {
        async fn handle_version(&self, _: MessageId, _: u16, _: u16) -> Result<(), ConnectionError> {
            reject!()
        }

        async fn handle_list(
            &self,
            _: MessageId,
            _: NodeType,
            _: usize,
        ) -> Result<(), ConnectionError> {
            reject!()
        }

        async fn handle_query(
            &self,
            _: MessageId,
            _: Vec<QualifiedHash>,
        ) -> Result<(), ConnectionError> {
            reject!()
        }

        async fn handle_ancestry(
            &self,
            _: MessageId,
            _: QualifiedHash,
            _: usize,
        ) -> Result<(), ConnectionError> {
            reject!()
        }

        async fn handle_leaves_of(
            &self,
            _: MessageId,
            _: QualifiedHash,
            _: usize,
        ) -> Result<(), ConnectionError> {
            reject!()
        }

        async fn handle_subscribe(
            &self,
            _: MessageId,
            _: QualifiedHash,
        ) -> Result<(), ConnectionError> {
            reject!()
        }

        async fn handle_unsubscribe(
            &self,
            _: MessageId,
            _: QualifiedHash,
        ) -> Result<(), ConnectionError> {
            reject!()
        }

        async fn handle_announce(&self, _: MessageId, _: Vec<Node>) -> Result<(), ConnectionError> {
            reject!()
        }
    }

    /// Replies to every request with `status ok` and records versions seen.
    struct OkPeer {
        sender: MessageSender<DuplexStream>,
    }

    #[async_trait]
    impl MessageHandler for OkPeer {
        async fn handle_version(
            &self,
            message_id: MessageId,
            major: u16,
            _minor: u16,
        ) -> Result<(), ConnectionError> {
            assert_eq!(major, PROTOCOL_MAJOR);
            self.sender.send_status(message_id, StatusCode::Ok).await
        }

        async fn handle_list(
            &self,
            message_id: MessageId,
            node_type: NodeType,
            quantity: usize,
        ) -> Result<(), ConnectionError> {
            assert_eq!(node_type, NodeType::Identity);
            let nodes: Vec<Node> = (0..quantity as i64)
                .map(|n| Node::new(NodeType::Identity, None, n, format!("user-{}", n).into_bytes()).unwrap())
                .collect();
            self.sender.send_response(message_id, nodes).await
        }

        async fn handle_query(
            &self,
            message_id: MessageId,
            _: Vec<QualifiedHash>,
        ) -> Result<(), ConnectionError> {
            self.sender.send_status(message_id, StatusCode::UnknownNode).await
        }

        async fn handle_ancestry(
            &self,
            message_id: MessageId,
            _: QualifiedHash,
            _: usize,
        ) -> Result<(), ConnectionError> {
            self.sender.send_status(message_id, StatusCode::Ok).await
        }

        async fn handle_leaves_of(
            &self,
            message_id: MessageId,
            _: QualifiedHash,
            _: usize,
        ) -> Result<(), ConnectionError> {
            self.sender.send_response(message_id, vec![]).await
        }

        async fn handle_subscribe(
            &self,
            message_id: MessageId,
            _: QualifiedHash,
        ) -> Result<(), ConnectionError> {
            self.sender.send_status(message_id, StatusCode::Ok).await
        }

        async fn handle_unsubscribe(
            &self,
            message_id: MessageId,
            _: QualifiedHash,
        ) -> Result<(), ConnectionError> {
            self.sender.send_status(message_id, StatusCode::Ok).await
        }

        async fn handle_announce(&self, _: MessageId, _: Vec<Node>) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    fn connected_pair() -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let (ours, theirs) = tokio::io::duplex(1024 * 1024);
        (Connection::new(ours), Connection::new(theirs))
    }

    fn spawn_ok_peer(mut connection: Connection<DuplexStream>) {
        let handler = OkPeer {
            sender: connection.sender(),
        };
        tokio::spawn(async move {
            while connection.read_message(&handler).await.is_ok() {}
        });
    }

    #[tokio::test]
    async fn message_ids_are_allocated_monotonically() {
        let (ours, _theirs) = connected_pair();
        let sender = ours.sender();
        let first = sender.send_version().await.unwrap();
        let second = sender.send_version().await.unwrap();
        let third = sender
            .send_list(NodeType::Identity, 10)
            .await
            .unwrap();
        assert_eq!(first, MessageId(0));
        assert_eq!(second, MessageId(1));
        assert_eq!(third, MessageId(2));
    }

    #[tokio::test]
    async fn replies_correlate_by_message_id() {
        let (mut ours, theirs) = connected_pair();
        spawn_ok_peer(theirs);

        let sender = ours.sender();
        let reader = tokio::spawn(async move {
            while ours.read_message(&RejectAll).await.is_ok() {}
        });

        // several requests in flight on the same stream
        let (version_rx, _) = sender.send_version_async().await.unwrap();
        let nodes = sender
            .send_list_wait(NodeType::Identity, 3, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(nodes.len(), 3);
        assert!(matches!(
            version_rx.await,
            Ok(PeerReply::Status(StatusCode::Ok))
        ));
        assert_eq!(sender.pending_count(), 0);

        sender.close().await;
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn status_errors_map_to_connection_errors() {
        let (mut ours, theirs) = connected_pair();
        spawn_ok_peer(theirs);
        let sender = ours.sender();
        tokio::spawn(async move { while ours.read_message(&RejectAll).await.is_ok() {} });

        let unknown = QualifiedHash::digest_of(b"nope");
        let err = sender
            .send_query_wait(vec![unknown], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Status(StatusCode::UnknownNode)));
    }

    #[tokio::test]
    async fn ok_status_in_place_of_a_response_is_rejected() {
        let (mut ours, theirs) = connected_pair();
        spawn_ok_peer(theirs);
        let sender = ours.sender();
        tokio::spawn(async move { while ours.read_message(&RejectAll).await.is_ok() {} });

        let some_node = QualifiedHash::digest_of(b"node");
        let err = sender
            .send_ancestry_wait(some_node, 4, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::UnexpectedResponse));
    }

    #[tokio::test]
    async fn timeout_cancels_the_pending_slot() {
        // the peer never reads and never answers
        let (ours, _theirs) = connected_pair();
        let sender = ours.sender();
        let err = sender
            .send_version_wait(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::ReplyTimeout));
        assert_eq!(sender.pending_count(), 0);
    }

    #[tokio::test]
    async fn late_reply_after_cancel_is_discarded() {
        let (mut ours, theirs) = connected_pair();
        let their_sender = theirs.sender();

        let sender = ours.sender();
        let (rx, id) = sender.send_version_async().await.unwrap();
        sender.cancel(id);
        assert_eq!(sender.pending_count(), 0);
        drop(rx);

        // peer answers anyway; the reader drops the reply and carries on
        their_sender.send_status(id, StatusCode::Ok).await.unwrap();
        ours.read_message(&RejectAll).await.unwrap();
        assert_eq!(sender.pending_count(), 0);
    }

    #[tokio::test]
    async fn close_fails_outstanding_requests() {
        let (ours, _theirs) = connected_pair();
        let sender = ours.sender();
        let (rx, _) = sender.send_version_async().await.unwrap();
        sender.close().await;
        assert!(rx.await.is_err());
        assert_eq!(sender.pending_count(), 0);
    }

    #[tokio::test]
    async fn peer_disconnect_surfaces_as_connection_closed() {
        let (mut ours, theirs) = connected_pair();
        drop(theirs);
        let err = ours.read_message(&RejectAll).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn malformed_input_is_a_parse_error() {
        let (ours, mut write) = tokio::io::duplex(1024 * 1024);
        let mut ours = Connection::new(ours);
        use tokio::io::AsyncWriteExt;
        write.write_all(b"grow 1 2\n").await.unwrap();
        let err = ours.read_message(&RejectAll).await.unwrap_err();
        match err {
            ConnectionError::Protocol(err) => assert!(err.is_parse_error()),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn writes_are_serialized_across_tasks() {
        let (ours, mut theirs) = connected_pair();
        let sender = ours.sender();
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let sender = sender.clone();
                tokio::spawn(async move { sender.send_version().await.unwrap() })
            })
            .collect();
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.sort();
        let expected: Vec<_> = (0..8).map(MessageId).collect();
        assert_eq!(ids, expected);

        // every message must arrive intact, one per line
        let counter = CountVersions::default();
        for _ in 0..8 {
            time::timeout(Duration::from_secs(5), theirs.read_message(&counter))
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(counter.seen.load(Ordering::SeqCst), 8);
    }

    #[derive(Default)]
    struct CountVersions {
        seen: AtomicUsize,
    }

    // only the version handler is expected to fire
    #[async_trait]
    impl MessageHandler for CountVersions {
        async fn handle_version(&self, _: MessageId, _: u16, _: u16) -> Result<(), ConnectionError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn handle_list(&self, _: MessageId, _: NodeType, _: usize) -> Result<(), ConnectionError> {
            reject!()
        }

        async fn handle_query(
            &self,
            _: MessageId,
            _: Vec<QualifiedHash>,
        ) -> Result<(), ConnectionError> {
            reject!()
        }

        async fn handle_ancestry(
            &self,
            _: MessageId,
            _: QualifiedHash,
            _: usize,
        ) -> Result<(), ConnectionError> {
            reject!()
        }

        async fn handle_leaves_of(
            &self,
            _: MessageId,
            _: QualifiedHash,
            _: usize,
        ) -> Result<(), ConnectionError> {
            reject!()
        }

        async fn handle_subscribe(
            &self,
            _: MessageId,
            _: QualifiedHash,
        ) -> Result<(), ConnectionError> {
            reject!()
        }

        async fn handle_unsubscribe(
            &self,
            _: MessageId,
            _: QualifiedHash,
        ) -> Result<(), ConnectionError> {
            reject!()
        }

        async fn handle_announce(&self, _: MessageId, _: Vec<Node>) -> Result<(), ConnectionError> {
            reject!()
        }
    }
}
