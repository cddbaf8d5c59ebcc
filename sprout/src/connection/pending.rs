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

use std::{collections::HashMap, sync::Mutex};

use sprout_forest::Node;
use tokio::sync::oneshot;

use crate::proto::{MessageId, StatusCode};

/// What a peer sent back for one of our requests.
#[derive(Debug)]
pub enum PeerReply {
    Response(Vec<Node>),
    Status(StatusCode),
}

/// Resolves with the peer's reply to a single request. Dropping the matching
/// slot (cancel or connection close) makes the receiver fail.
pub type ReplyReceiver = oneshot::Receiver<PeerReply>;

/// The table of requests awaiting a `response` or `status` from the peer,
/// keyed by message id. A slot is registered before the request's bytes reach
/// the wire and removed by exactly one of: reply delivery, cancellation, or
/// connection close.
#[derive(Debug, Default)]
pub(crate) struct PendingReplies {
    slots: Mutex<HashMap<MessageId, oneshot::Sender<PeerReply>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Default::default()
    }

    /// Open a slot for `message_id` and hand back its receiver.
    pub fn register(&self, message_id: MessageId) -> ReplyReceiver {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(message_id, tx);
        rx
    }

    /// Deliver a reply to the matching slot, removing it. Returns false when
    /// no request was waiting, which the caller reports but survives.
    pub fn complete(&self, message_id: MessageId, reply: PeerReply) -> bool {
        match self.lock().remove(&message_id) {
            // the receiver may have given up; delivery failure is equivalent
            // to a cancelled request
            Some(slot) => slot.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop the slot for `message_id`. Unknown ids are a no-op.
    pub fn cancel(&self, message_id: MessageId) {
        self.lock().remove(&message_id);
    }

    /// Drop every slot, failing all outstanding receivers. Used on
    /// connection close.
    pub fn drain(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MessageId, oneshot::Sender<PeerReply>>> {
        self.slots.lock().expect("pending reply table lock poisoned")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn complete_resolves_the_registered_receiver() {
        let pending = PendingReplies::new();
        let rx = pending.register(MessageId(4));
        assert!(pending.complete(MessageId(4), PeerReply::Status(StatusCode::Ok)));
        assert_eq!(pending.len(), 0);
        assert!(matches!(rx.await, Ok(PeerReply::Status(StatusCode::Ok))));
    }

    #[tokio::test]
    async fn complete_without_a_slot_reports_failure() {
        let pending = PendingReplies::new();
        assert!(!pending.complete(MessageId(9), PeerReply::Status(StatusCode::Ok)));
    }

    #[tokio::test]
    async fn cancel_drops_the_slot() {
        let pending = PendingReplies::new();
        let rx = pending.register(MessageId(7));
        pending.cancel(MessageId(7));
        assert_eq!(pending.len(), 0);
        assert!(rx.await.is_err());
        // late reply for the cancelled id has nowhere to go
        assert!(!pending.complete(MessageId(7), PeerReply::Status(StatusCode::Ok)));
        // cancelling an id that never existed is fine
        pending.cancel(MessageId(1000));
    }

    #[tokio::test]
    async fn drain_fails_every_receiver() {
        let pending = PendingReplies::new();
        let first = pending.register(MessageId(0));
        let second = pending.register(MessageId(1));
        pending.drain();
        assert!(first.await.is_err());
        assert!(second.await.is_err());
        assert_eq!(pending.len(), 0);
    }
}
