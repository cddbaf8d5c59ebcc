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

use std::{sync::Arc, time::Duration};

use log::*;
use sprout_forest::{Node, NodeType, QualifiedHash};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, WriteHalf},
    sync::Mutex,
    time,
};

use super::{
    pending::{PeerReply, PendingReplies, ReplyReceiver},
    ConnectionError,
};
use crate::proto::{Message, MessageId, StatusCode};

const LOG_TARGET: &str = "sprout::connection::sender";

/// Clonable write handle for one connection.
///
/// Allocating a message id, registering the reply slot and flushing the bytes
/// happen inside a single critical section on the write lock, so concurrent
/// senders are globally ordered and a reply can never arrive before its slot
/// exists.
pub struct MessageSender<TSocket> {
    inner: Arc<SenderShared<TSocket>>,
}

impl<TSocket> Clone for MessageSender<TSocket> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(super) struct SenderShared<TSocket> {
    writer: Mutex<WriteState<TSocket>>,
    pending: PendingReplies,
}

struct WriteState<TSocket> {
    sink: WriteHalf<TSocket>,
    next_id: u64,
}

impl<TSocket: AsyncWrite> MessageSender<TSocket> {
    pub(super) fn new(sink: WriteHalf<TSocket>) -> Self {
        Self {
            inner: Arc::new(SenderShared {
                writer: Mutex::new(WriteState { sink, next_id: 0 }),
                pending: PendingReplies::new(),
            }),
        }
    }

    pub(super) fn pending(&self) -> &PendingReplies {
        &self.inner.pending
    }

    /// Number of requests currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Forget the request with the given id. A late reply from the peer will
    /// be dropped with a warning.
    pub fn cancel(&self, message_id: MessageId) {
        self.inner.pending.cancel(message_id);
    }

    /// Fail all outstanding requests and close the write side.
    pub async fn close(&self) {
        self.inner.pending.drain();
        let mut writer = self.inner.writer.lock().await;
        if let Err(err) = writer.sink.shutdown().await {
            debug!(target: LOG_TARGET, "Error shutting down write half: {}", err);
        }
    }

    /// Write a request, allocating its message id. When `register` is set the
    /// reply slot is installed before any bytes are written.
    async fn send_request(
        &self,
        register: bool,
        make: impl FnOnce(MessageId) -> Message,
    ) -> Result<(Option<ReplyReceiver>, MessageId), ConnectionError> {
        let mut writer = self.inner.writer.lock().await;
        let message_id = MessageId(writer.next_id);
        writer.next_id += 1;
        let message = make(message_id);
        let receiver = register.then(|| self.inner.pending.register(message_id));
        trace!(target: LOG_TARGET, "Sending {} request #{}", message.verb(), message_id);
        if let Err(err) = write_message(&mut writer, &message).await {
            self.inner.pending.cancel(message_id);
            return Err(err);
        }
        Ok((receiver, message_id))
    }

    /// Write a reply to the peer's request `target`. No id is allocated.
    async fn send_reply(&self, message: Message) -> Result<(), ConnectionError> {
        let mut writer = self.inner.writer.lock().await;
        trace!(target: LOG_TARGET, "Sending {} reply", message.verb());
        write_message(&mut writer, &message).await
    }

    /// Wait for the reply to `message_id`, cancelling the request when
    /// `timeout` elapses first.
    async fn wait_reply(
        &self,
        receiver: ReplyReceiver,
        message_id: MessageId,
        timeout: Duration,
    ) -> Result<PeerReply, ConnectionError> {
        match time::timeout(timeout, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ConnectionError::ConnectionClosed),
            Err(_) => {
                self.cancel(message_id);
                Err(ConnectionError::ReplyTimeout)
            },
        }
    }

    // --- version ---

    pub async fn send_version(&self) -> Result<MessageId, ConnectionError> {
        let (_, id) = self.send_request(false, version_message).await?;
        Ok(id)
    }

    pub async fn send_version_async(&self) -> Result<(ReplyReceiver, MessageId), ConnectionError> {
        let (rx, id) = self.send_request(true, version_message).await?;
        Ok((rx.expect("reply slot was registered"), id))
    }

    /// Announce our protocol version and wait for the peer to accept it.
    pub async fn send_version_wait(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let (rx, id) = self.send_version_async().await?;
        expect_ok_status(self.wait_reply(rx, id, timeout).await?)
    }

    // --- list ---

    pub async fn send_list(
        &self,
        node_type: NodeType,
        quantity: usize,
    ) -> Result<MessageId, ConnectionError> {
        let (_, id) = self
            .send_request(false, |id| Message::List {
                id,
                node_type,
                quantity,
            })
            .await?;
        Ok(id)
    }

    pub async fn send_list_async(
        &self,
        node_type: NodeType,
        quantity: usize,
    ) -> Result<(ReplyReceiver, MessageId), ConnectionError> {
        let (rx, id) = self
            .send_request(true, |id| Message::List {
                id,
                node_type,
                quantity,
            })
            .await?;
        Ok((rx.expect("reply slot was registered"), id))
    }

    /// Request up to `quantity` recent nodes of one type and wait for them.
    pub async fn send_list_wait(
        &self,
        node_type: NodeType,
        quantity: usize,
        timeout: Duration,
    ) -> Result<Vec<Node>, ConnectionError> {
        let (rx, id) = self.send_list_async(node_type, quantity).await?;
        expect_response(self.wait_reply(rx, id, timeout).await?)
    }

    // --- query ---

    pub async fn send_query(&self, node_ids: Vec<QualifiedHash>) -> Result<MessageId, ConnectionError> {
        let (_, id) = self
            .send_request(false, |id| Message::Query { id, node_ids })
            .await?;
        Ok(id)
    }

    pub async fn send_query_async(
        &self,
        node_ids: Vec<QualifiedHash>,
    ) -> Result<(ReplyReceiver, MessageId), ConnectionError> {
        let (rx, id) = self
            .send_request(true, |id| Message::Query { id, node_ids })
            .await?;
        Ok((rx.expect("reply slot was registered"), id))
    }

    /// Request the nodes with the given ids; the peer answers with all of
    /// them, in request order, or an error status.
    pub async fn send_query_wait(
        &self,
        node_ids: Vec<QualifiedHash>,
        timeout: Duration,
    ) -> Result<Vec<Node>, ConnectionError> {
        let (rx, id) = self.send_query_async(node_ids).await?;
        expect_response(self.wait_reply(rx, id, timeout).await?)
    }

    // --- ancestry ---

    pub async fn send_ancestry(
        &self,
        node_id: QualifiedHash,
        levels: usize,
    ) -> Result<MessageId, ConnectionError> {
        let (_, id) = self
            .send_request(false, |id| Message::Ancestry { id, node_id, levels })
            .await?;
        Ok(id)
    }

    pub async fn send_ancestry_async(
        &self,
        node_id: QualifiedHash,
        levels: usize,
    ) -> Result<(ReplyReceiver, MessageId), ConnectionError> {
        let (rx, id) = self
            .send_request(true, |id| Message::Ancestry { id, node_id, levels })
            .await?;
        Ok((rx.expect("reply slot was registered"), id))
    }

    pub async fn send_ancestry_wait(
        &self,
        node_id: QualifiedHash,
        levels: usize,
        timeout: Duration,
    ) -> Result<Vec<Node>, ConnectionError> {
        let (rx, id) = self.send_ancestry_async(node_id, levels).await?;
        expect_response(self.wait_reply(rx, id, timeout).await?)
    }

    // --- leaves_of ---

    pub async fn send_leaves_of(
        &self,
        node_id: QualifiedHash,
        quantity: usize,
    ) -> Result<MessageId, ConnectionError> {
        let (_, id) = self
            .send_request(false, |id| Message::LeavesOf {
                id,
                node_id,
                quantity,
            })
            .await?;
        Ok(id)
    }

    pub async fn send_leaves_of_async(
        &self,
        node_id: QualifiedHash,
        quantity: usize,
    ) -> Result<(ReplyReceiver, MessageId), ConnectionError> {
        let (rx, id) = self
            .send_request(true, |id| Message::LeavesOf {
                id,
                node_id,
                quantity,
            })
            .await?;
        Ok((rx.expect("reply slot was registered"), id))
    }

    pub async fn send_leaves_of_wait(
        &self,
        node_id: QualifiedHash,
        quantity: usize,
        timeout: Duration,
    ) -> Result<Vec<Node>, ConnectionError> {
        let (rx, id) = self.send_leaves_of_async(node_id, quantity).await?;
        expect_response(self.wait_reply(rx, id, timeout).await?)
    }

    // --- subscribe / unsubscribe ---

    pub async fn send_subscribe(&self, community: QualifiedHash) -> Result<MessageId, ConnectionError> {
        let (_, id) = self
            .send_request(false, |id| Message::Subscribe { id, community })
            .await?;
        Ok(id)
    }

    pub async fn send_subscribe_async(
        &self,
        community: QualifiedHash,
    ) -> Result<(ReplyReceiver, MessageId), ConnectionError> {
        let (rx, id) = self
            .send_request(true, |id| Message::Subscribe { id, community })
            .await?;
        Ok((rx.expect("reply slot was registered"), id))
    }

    pub async fn send_subscribe_wait(
        &self,
        community: QualifiedHash,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        let (rx, id) = self.send_subscribe_async(community).await?;
        expect_ok_status(self.wait_reply(rx, id, timeout).await?)
    }

    pub async fn send_unsubscribe(&self, community: QualifiedHash) -> Result<MessageId, ConnectionError> {
        let (_, id) = self
            .send_request(false, |id| Message::Unsubscribe { id, community })
            .await?;
        Ok(id)
    }

    pub async fn send_unsubscribe_async(
        &self,
        community: QualifiedHash,
    ) -> Result<(ReplyReceiver, MessageId), ConnectionError> {
        let (rx, id) = self
            .send_request(true, |id| Message::Unsubscribe { id, community })
            .await?;
        Ok((rx.expect("reply slot was registered"), id))
    }

    pub async fn send_unsubscribe_wait(
        &self,
        community: QualifiedHash,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        let (rx, id) = self.send_unsubscribe_async(community).await?;
        expect_ok_status(self.wait_reply(rx, id, timeout).await?)
    }

    // --- announce ---

    pub async fn send_announce(&self, nodes: Vec<Node>) -> Result<MessageId, ConnectionError> {
        let (_, id) = self
            .send_request(false, |id| Message::Announce { id, nodes })
            .await?;
        Ok(id)
    }

    pub async fn send_announce_async(
        &self,
        nodes: Vec<Node>,
    ) -> Result<(ReplyReceiver, MessageId), ConnectionError> {
        let (rx, id) = self
            .send_request(true, |id| Message::Announce { id, nodes })
            .await?;
        Ok((rx.expect("reply slot was registered"), id))
    }

    // --- replies ---

    /// Answer the peer's request `target` with nodes.
    pub async fn send_response(
        &self,
        target: MessageId,
        nodes: Vec<Node>,
    ) -> Result<(), ConnectionError> {
        self.send_reply(Message::Response { target, nodes }).await
    }

    /// Answer the peer's request `target` with a status code.
    pub async fn send_status(
        &self,
        target: MessageId,
        code: StatusCode,
    ) -> Result<(), ConnectionError> {
        self.send_reply(Message::Status { target, code }).await
    }
}

fn version_message(id: MessageId) -> Message {
    Message::Version {
        id,
        major: crate::proto::PROTOCOL_MAJOR,
        minor: crate::proto::PROTOCOL_MINOR,
    }
}

async fn write_message<TSocket: AsyncWrite>(
    writer: &mut WriteState<TSocket>,
    message: &Message,
) -> Result<(), ConnectionError> {
    let encoded = message.encode();
    writer.sink.write_all(encoded.as_bytes()).await?;
    writer.sink.flush().await?;
    Ok(())
}

/// A request that expects `status ok`: anything else is an error.
fn expect_ok_status(reply: PeerReply) -> Result<(), ConnectionError> {
    match reply {
        PeerReply::Status(code) if code.is_ok() => Ok(()),
        PeerReply::Status(code) => Err(ConnectionError::Status(code)),
        PeerReply::Response(_) => Err(ConnectionError::UnexpectedResponse),
    }
}

/// A request that expects a node `response`: an ok status in its place is as
/// much a protocol violation as an error status is an error.
fn expect_response(reply: PeerReply) -> Result<Vec<Node>, ConnectionError> {
    match reply {
        PeerReply::Response(nodes) => Ok(nodes),
        PeerReply::Status(code) if code.is_ok() => Err(ConnectionError::UnexpectedResponse),
        PeerReply::Status(code) => Err(ConnectionError::Status(code)),
    }
}
