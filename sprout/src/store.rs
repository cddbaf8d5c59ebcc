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

//! A node store decorated with a subscriber registry.
//!
//! Every connection worker subscribes for the lifetime of its connection and
//! receives each freshly ingested node exactly once, in commit order. Events
//! are dispatched while the store's write lock is held, so the order every
//! subscriber observes is the order adds committed in; per-subscriber queues
//! are unbounded, so a briefly stalled consumer delays nobody and loses
//! nothing.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock, RwLockReadGuard,
    },
};

use log::*;
use sprout_forest::{
    community_of, AddResult, Node, NodeStore, NodeType, QualifiedHash, StoreError,
};
use tokio::sync::mpsc;

const LOG_TARGET: &str = "sprout::store";

/// Handle identifying one subscriber; passing it to
/// [`SubscriberStore::unsubscribe`] stops delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared, subscribable wrapper around any [`NodeStore`].
///
/// Reads take the read lock; `add` takes the write lock and delivers the
/// event before releasing it. One instance exists per store, shared by every
/// worker via `Arc`.
pub struct SubscriberStore<S> {
    inner: RwLock<S>,
    subscribers: Mutex<Vec<(SubscriberId, mpsc::UnboundedSender<Arc<Node>>)>>,
    next_subscriber_id: AtomicU64,
}

impl<S: NodeStore> SubscriberStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: RwLock::new(inner),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    /// Ingest a node and, if it was fresh, hand it to every subscriber in
    /// registration order before the commit is visible to later adds.
    pub fn add(&self, node: Node) -> Result<AddResult, StoreError> {
        let mut store = self.inner.write().map_err(|_| {
            StoreError::Access("write lock on node store failed".into())
        })?;
        let result = store.add(node.clone())?;
        if result == AddResult::Inserted {
            self.dispatch(Arc::new(node));
        }
        Ok(result)
    }

    /// Register for node-added events. The receiver yields every node
    /// committed after this call, in commit order, until unsubscribed.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<Arc<Node>>) {
        let id = SubscriberId(self.next_subscriber_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_subscribers().push((id, tx));
        debug!(target: LOG_TARGET, "Subscriber {} registered", id);
        (id, rx)
    }

    /// Stop delivery to the given subscriber. Its receiver sees the channel
    /// close after any already queued events.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.lock_subscribers().retain(|(sub_id, _)| *sub_id != id);
        debug!(target: LOG_TARGET, "Subscriber {} deregistered", id);
    }

    pub fn get(&self, id: &QualifiedHash) -> Option<Node> {
        self.read_access()?.get(id)
    }

    pub fn contains(&self, id: &QualifiedHash) -> bool {
        self.read_access().map(|s| s.contains(id)).unwrap_or(false)
    }

    pub fn recent(&self, node_type: NodeType, limit: usize) -> Vec<Node> {
        self.read_access()
            .map(|s| s.recent(node_type, limit))
            .unwrap_or_default()
    }

    pub fn leaves_of(&self, root: &QualifiedHash, limit: usize) -> Vec<Node> {
        self.read_access()
            .map(|s| s.leaves_of(root, limit))
            .unwrap_or_default()
    }

    pub fn ancestry(&self, id: &QualifiedHash, levels: usize) -> Vec<Node> {
        self.read_access()
            .map(|s| s.ancestry(id, levels))
            .unwrap_or_default()
    }

    pub fn communities(&self) -> Vec<QualifiedHash> {
        self.read_access()
            .map(|s| s.communities())
            .unwrap_or_default()
    }

    /// The community `node` belongs to, if its chain is stored.
    pub fn community_of(&self, node: &Node) -> Option<QualifiedHash> {
        let store = self.read_access()?;
        community_of(node, &*store)
    }

    fn dispatch(&self, node: Arc<Node>) {
        let mut subscribers = self.lock_subscribers();
        // subscribers whose receiver is gone are dropped on the way through
        subscribers.retain(|(id, tx)| match tx.send(node.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!(
                    target: LOG_TARGET,
                    "Dropping subscriber {}: receiver is gone", id
                );
                false
            },
        });
    }

    fn read_access(&self) -> Option<RwLockReadGuard<'_, S>> {
        match self.inner.read() {
            Ok(guard) => Some(guard),
            Err(_) => {
                error!(target: LOG_TARGET, "Read lock on node store failed");
                None
            },
        }
    }

    fn lock_subscribers(
        &self,
    ) -> std::sync::MutexGuard<'_, Vec<(SubscriberId, mpsc::UnboundedSender<Arc<Node>>)>> {
        self.subscribers.lock().expect("subscriber registry lock poisoned")
    }
}

#[cfg(test)]
mod test {
    use sprout_forest::MemoryStore;

    use super::*;

    fn store() -> SubscriberStore<MemoryStore> {
        SubscriberStore::new(MemoryStore::new())
    }

    fn identity(created: i64, name: &str) -> Node {
        Node::new(NodeType::Identity, None, created, name.as_bytes().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn fresh_adds_reach_every_subscriber_in_commit_order() {
        let store = store();
        let (_first_id, mut first) = store.subscribe();
        let (_second_id, mut second) = store.subscribe();

        let nodes = [identity(1, "a"), identity(2, "b"), identity(3, "c")];
        for node in &nodes {
            store.add(node.clone()).unwrap();
        }

        for rx in [&mut first, &mut second] {
            for expected in &nodes {
                let got = rx.recv().await.unwrap();
                assert_eq!(got.id(), expected.id());
            }
        }
    }

    #[tokio::test]
    async fn duplicate_add_emits_no_event() {
        let store = store();
        let (_id, mut events) = store.subscribe();
        let node = identity(1, "a");
        assert_eq!(store.add(node.clone()).unwrap(), AddResult::Inserted);
        assert_eq!(store.add(node.clone()).unwrap(), AddResult::AlreadyPresent);

        let first = events.recv().await.unwrap();
        assert_eq!(first.id(), node.id());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_add_emits_no_event() {
        let store = store();
        let (_id, mut events) = store.subscribe();
        let orphan = Node::new(
            NodeType::Conversation,
            Some(QualifiedHash::digest_of(b"missing")),
            1,
            &b"topic"[..],
        )
        .unwrap();
        assert!(store.add(orphan).is_err());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let store = store();
        let (id, mut events) = store.subscribe();
        store.add(identity(1, "a")).unwrap();
        store.unsubscribe(id);
        store.add(identity(2, "b")).unwrap();

        assert!(events.recv().await.is_some());
        // channel closes once the queued event is drained
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned() {
        let store = store();
        let (_id, events) = store.subscribe();
        drop(events);
        store.add(identity(1, "a")).unwrap();
        assert!(store.lock_subscribers().is_empty());
    }

    #[test]
    fn reads_pass_through() {
        let store = store();
        let node = identity(5, "carol");
        store.add(node.clone()).unwrap();
        assert!(store.contains(node.id()));
        assert_eq!(store.get(node.id()), Some(node.clone()));
        assert_eq!(store.recent(NodeType::Identity, 10), vec![node]);
        assert!(store.communities().is_empty());
    }
}
