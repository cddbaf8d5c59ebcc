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

//! The relay worker: one per connection, for the connection's lifetime.
//!
//! The worker answers peer requests from the local store, ingests announced
//! nodes (pulling missing ancestors from the same peer first), announces
//! local additions the peer subscribed to, and on outbound connections runs
//! the bootstrap exchange that catches the local store up with the peer.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use log::*;
use sprout_forest::{Node, NodeStore, NodeType, QualifiedHash, StoreError};
use sprout_shutdown::{Shutdown, ShutdownSignal};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};

use crate::{
    connection::{
        Connection, ConnectionDirection, ConnectionError, MessageHandler, MessageSender,
    },
    proto::{MessageId, ProtocolError, StatusCode, PROTOCOL_MAJOR},
    store::SubscriberStore,
};

const LOG_TARGET: &str = "sprout::worker";

/// Tunables for one relay connection.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Quantity used for bootstrap `list`/`leaves_of` requests, and the cap
    /// applied to the peer's own quantities.
    pub list_quantity: usize,
    /// How long to wait for the reply to any single request.
    pub request_timeout: Duration,
    /// Most ancestor round trips a single ingested node may trigger.
    pub max_recovery_fetches: usize,
    /// Levels asked for when pulling a node's ancestry, and the cap applied
    /// to the peer's `ancestry` requests.
    pub max_ancestry_levels: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            list_quantity: 1024,
            request_timeout: Duration::from_secs(5),
            max_recovery_fetches: 32,
            max_ancestry_levels: 1024,
        }
    }
}

/// Drives one sprout connection against the shared local store.
pub struct Worker<TSocket, TStore> {
    connection: Connection<TSocket>,
    session: Arc<RelaySession<TSocket, TStore>>,
    direction: ConnectionDirection,
    shutdown_signal: ShutdownSignal,
}

impl<TSocket, TStore> Worker<TSocket, TStore>
where
    TSocket: AsyncRead + AsyncWrite + Send + 'static,
    TStore: NodeStore + 'static,
{
    pub fn new(
        socket: TSocket,
        store: Arc<SubscriberStore<TStore>>,
        config: RelayConfig,
        direction: ConnectionDirection,
        peer: String,
        shutdown_signal: ShutdownSignal,
    ) -> Self {
        let connection = Connection::new(socket);
        let session = Arc::new(RelaySession {
            sender: connection.sender(),
            store,
            subscriptions: RwLock::new(HashSet::new()),
            config,
            close: Mutex::new(Shutdown::new()),
            peer,
        });
        Self {
            connection,
            session,
            direction,
            shutdown_signal,
        }
    }

    /// A send handle onto this worker's connection.
    pub fn sender(&self) -> MessageSender<TSocket> {
        self.session.sender.clone()
    }

    /// Run until the peer disconnects, the protocol is violated, or shutdown
    /// is signalled.
    pub async fn run(mut self) {
        let session = self.session.clone();
        let peer = session.peer.clone();
        let mut shutdown_signal = self.shutdown_signal.clone();
        let mut close_signal = session.close_signal();
        let direction = self.direction;

        info!(
            target: LOG_TARGET,
            "Worker for {} connection to {} starting", direction, peer
        );

        // Fan local additions out to the peer for as long as we run
        let (subscriber_id, events) = session.store.subscribe();
        tokio::spawn(fan_out(session.clone(), events, session.close_signal()));

        // Both sides must announce their version before anything else; the
        // dialing side follows up by catching its store up with the peer
        tokio::spawn({
            let session = session.clone();
            async move {
                match session
                    .sender
                    .send_version_wait(session.config.request_timeout)
                    .await
                {
                    Ok(()) => {
                        debug!(
                            target: LOG_TARGET,
                            "Peer {} accepted protocol version {}", session.peer, PROTOCOL_MAJOR
                        );
                        if direction == ConnectionDirection::Outbound {
                            session.bootstrap().await;
                        }
                    },
                    Err(err) => {
                        warn!(
                            target: LOG_TARGET,
                            "Version negotiation with {} failed: {}", session.peer, err
                        );
                        session.trigger_close();
                    },
                }
            }
        });

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_signal => {
                    debug!(target: LOG_TARGET, "Worker for {} shutting down", peer);
                    break;
                },
                _ = &mut close_signal => {
                    debug!(target: LOG_TARGET, "Worker for {} closing", peer);
                    break;
                },
                result = self.connection.read_message(&session) => match result {
                    Ok(()) => {},
                    Err(ConnectionError::Protocol(ProtocolError::ConnectionClosed)) => {
                        debug!(target: LOG_TARGET, "Peer {} disconnected", peer);
                        break;
                    },
                    Err(ConnectionError::Protocol(err)) if err.is_parse_error() => {
                        warn!(
                            target: LOG_TARGET,
                            "Closing connection to {} after parse error: {}", peer, err
                        );
                        // Best effort; the stream cannot be resynchronized
                        let _ = session
                            .sender
                            .send_status(MessageId(0), StatusCode::Malformed)
                            .await;
                        break;
                    },
                    Err(err) => {
                        warn!(target: LOG_TARGET, "Connection to {} failed: {}", peer, err);
                        break;
                    },
                },
            }
        }

        session.store.unsubscribe(subscriber_id);
        session.trigger_close();
        self.connection.close().await;
        info!(target: LOG_TARGET, "Worker for {} exited", peer);
    }
}

/// Per-connection state shared between the reader task, the fan-out task and
/// spawned ingest tasks.
struct RelaySession<TSocket, TStore> {
    sender: MessageSender<TSocket>,
    store: Arc<SubscriberStore<TStore>>,
    /// Communities the peer subscribed to on this connection.
    subscriptions: RwLock<HashSet<QualifiedHash>>,
    config: RelayConfig,
    close: Mutex<Shutdown>,
    peer: String,
}

impl<TSocket, TStore> RelaySession<TSocket, TStore>
where
    TSocket: AsyncRead + AsyncWrite + Send + 'static,
    TStore: NodeStore + 'static,
{
    fn close_signal(&self) -> ShutdownSignal {
        self.close.lock().expect("close trigger lock poisoned").to_signal()
    }

    fn trigger_close(&self) {
        self.close.lock().expect("close trigger lock poisoned").trigger();
    }

    fn is_subscribed(&self, community: &QualifiedHash) -> bool {
        self.subscriptions
            .read()
            .expect("subscription set lock poisoned")
            .contains(community)
    }

    /// Add a node, querying the peer for missing ancestors as they surface.
    /// Every failure to obtain an ancestor collapses to `UnknownAncestor` for
    /// the node that needed it.
    async fn ingest_with_recovery(&self, node: Node) -> Result<(), StoreError> {
        let mut stack = vec![node];
        let mut fetches = 0;
        while let Some(next) = stack.last().cloned() {
            match self.store.add(next) {
                Ok(_) => {
                    stack.pop();
                },
                Err(StoreError::UnknownAncestor(missing)) => {
                    if fetches >= self.config.max_recovery_fetches {
                        debug!(
                            target: LOG_TARGET,
                            "Giving up ancestor recovery after {} fetches from {}",
                            fetches,
                            self.peer
                        );
                        return Err(StoreError::UnknownAncestor(missing));
                    }
                    fetches += 1;
                    let fetched = self
                        .sender
                        .send_query_wait(vec![missing], self.config.request_timeout)
                        .await
                        .map_err(|err| {
                            debug!(
                                target: LOG_TARGET,
                                "Query for missing ancestor {} of peer {} failed: {}",
                                missing,
                                self.peer,
                                err
                            );
                            StoreError::UnknownAncestor(missing)
                        })?;
                    let ancestor = fetched
                        .into_iter()
                        .find(|n| n.id() == &missing)
                        .ok_or(StoreError::UnknownAncestor(missing))?;
                    stack.push(ancestor);
                },
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Ingest the nodes of one `announce`, returning the status reported for
    /// the announce as a whole.
    async fn ingest_announced(&self, nodes: Vec<Node>) -> StatusCode {
        let mut outcome = StatusCode::Ok;
        for node in nodes {
            let node_id = *node.id();
            match self.ingest_with_recovery(node).await {
                Ok(()) => {},
                Err(StoreError::UnknownAncestor(missing)) => {
                    debug!(
                        target: LOG_TARGET,
                        "Announced node {} dropped: ancestor {} unavailable", node_id, missing
                    );
                    outcome = worst(outcome, StatusCode::UnknownNode);
                },
                Err(
                    err @ (StoreError::Integrity { .. }
                    | StoreError::InvalidParentType { .. }
                    | StoreError::Node(_)),
                ) => {
                    warn!(
                        target: LOG_TARGET,
                        "Announced node {} from {} dropped: {}", node_id, self.peer, err
                    );
                    outcome = worst(outcome, StatusCode::Malformed);
                },
                Err(err) => {
                    error!(
                        target: LOG_TARGET,
                        "Storing announced node {} failed: {}", node_id, err
                    );
                    outcome = worst(outcome, StatusCode::UnknownNode);
                },
            }
        }
        outcome
    }

    /// Catch the local store up with the peer: subscribe to known
    /// communities, pull recent roots and conversations, then complete every
    /// conversation down to its leaves. Individual failures abandon their
    /// branch and nothing else.
    async fn bootstrap(&self) {
        let timeout = self.config.request_timeout;
        info!(target: LOG_TARGET, "Starting catch-up with {}", self.peer);

        let known = self.store.communities();
        for community in &known {
            if let Err(err) = self.sender.send_subscribe_wait(*community, timeout).await {
                warn!(
                    target: LOG_TARGET,
                    "Subscribing to community {} at {} failed: {}", community, self.peer, err
                );
            }
        }

        self.sync_recent(NodeType::Identity).await;
        self.sync_recent(NodeType::Community).await;

        // Subscribe to communities we only just learned about
        for community in self.store.communities() {
            if !known.contains(&community) {
                if let Err(err) = self.sender.send_subscribe_wait(community, timeout).await {
                    warn!(
                        target: LOG_TARGET,
                        "Subscribing to community {} at {} failed: {}", community, self.peer, err
                    );
                }
            }
        }

        self.sync_recent(NodeType::Conversation).await;

        for conversation in self
            .store
            .recent(NodeType::Conversation, self.config.list_quantity)
        {
            let leaves = match self
                .sender
                .send_leaves_of_wait(*conversation.id(), self.config.list_quantity, timeout)
                .await
            {
                Ok(leaves) => leaves,
                Err(err) => {
                    debug!(
                        target: LOG_TARGET,
                        "leaves_of {} at {} failed: {}",
                        conversation.id(),
                        self.peer,
                        err
                    );
                    continue;
                },
            };
            for leaf in leaves {
                let leaf_id = *leaf.id();
                if let Err(err) = self.ingest_leaf(leaf).await {
                    debug!(
                        target: LOG_TARGET,
                        "Skipping leaf {} from {}: {}", leaf_id, self.peer, err
                    );
                }
            }
        }

        info!(target: LOG_TARGET, "Catch-up with {} complete", self.peer);
    }

    async fn sync_recent(&self, node_type: NodeType) {
        match self
            .sender
            .send_list_wait(node_type, self.config.list_quantity, self.config.request_timeout)
            .await
        {
            Ok(nodes) => {
                for node in nodes {
                    let node_id = *node.id();
                    if let Err(err) = self.ingest_with_recovery(node).await {
                        debug!(
                            target: LOG_TARGET,
                            "Skipping {} node {} from {}: {}", node_type, node_id, self.peer, err
                        );
                    }
                }
            },
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    "Listing {} nodes at {} failed: {}", node_type, self.peer, err
                );
            },
        }
    }

    /// Ingest one leaf returned by `leaves_of`, pulling its whole ancestor
    /// chain in a single round trip when anything is missing. Stragglers the
    /// chain did not cover fall back to per-node queries.
    async fn ingest_leaf(&self, leaf: Node) -> Result<(), StoreError> {
        match self.store.add(leaf.clone()) {
            Err(StoreError::UnknownAncestor(_)) => {},
            other => return other.map(|_| ()),
        }

        match self
            .sender
            .send_ancestry_wait(
                *leaf.id(),
                self.config.max_ancestry_levels,
                self.config.request_timeout,
            )
            .await
        {
            Ok(chain) => {
                // eldest first, so each add finds its parent already stored
                for ancestor in chain.into_iter().rev() {
                    match self.store.add(ancestor) {
                        Ok(_) => {},
                        Err(StoreError::UnknownAncestor(_)) => break,
                        Err(err) => {
                            debug!(
                                target: LOG_TARGET,
                                "Dropping ancestor from {}: {}", self.peer, err
                            );
                            break;
                        },
                    }
                }
            },
            Err(err) => {
                debug!(
                    target: LOG_TARGET,
                    "Ancestry of {} at {} failed: {}",
                    leaf.id(),
                    self.peer,
                    err
                );
            },
        }

        self.ingest_with_recovery(leaf).await
    }
}

fn worst(current: StatusCode, new: StatusCode) -> StatusCode {
    fn rank(code: StatusCode) -> u8 {
        match code {
            StatusCode::Ok => 0,
            StatusCode::UnknownNode => 1,
            _ => 2,
        }
    }
    if rank(new) > rank(current) {
        new
    } else {
        current
    }
}

#[async_trait]
impl<TSocket, TStore> MessageHandler for Arc<RelaySession<TSocket, TStore>>
where
    TSocket: AsyncRead + AsyncWrite + Send + 'static,
    TStore: NodeStore + 'static,
{
    async fn handle_version(
        &self,
        message_id: MessageId,
        major: u16,
        minor: u16,
    ) -> Result<(), ConnectionError> {
        debug!(
            target: LOG_TARGET,
            "Peer {} speaks protocol {}.{}", self.peer, major, minor
        );
        if major == PROTOCOL_MAJOR {
            return self.sender.send_status(message_id, StatusCode::Ok).await;
        }
        let code = if major < PROTOCOL_MAJOR {
            StatusCode::ProtocolTooOld
        } else {
            StatusCode::ProtocolTooNew
        };
        warn!(
            target: LOG_TARGET,
            "Closing connection to {}: peer speaks protocol {}.{}, we speak {}.{}",
            self.peer,
            major,
            minor,
            PROTOCOL_MAJOR,
            crate::proto::PROTOCOL_MINOR
        );
        let result = self.sender.send_status(message_id, code).await;
        self.trigger_close();
        result
    }

    async fn handle_list(
        &self,
        message_id: MessageId,
        node_type: NodeType,
        quantity: usize,
    ) -> Result<(), ConnectionError> {
        let nodes = self
            .store
            .recent(node_type, quantity.min(self.config.list_quantity));
        self.sender.send_response(message_id, nodes).await
    }

    async fn handle_query(
        &self,
        message_id: MessageId,
        node_ids: Vec<QualifiedHash>,
    ) -> Result<(), ConnectionError> {
        let mut nodes = Vec::with_capacity(node_ids.len());
        for node_id in &node_ids {
            match self.store.get(node_id) {
                Some(node) => nodes.push(node),
                None => {
                    return self
                        .sender
                        .send_status(message_id, StatusCode::UnknownNode)
                        .await;
                },
            }
        }
        self.sender.send_response(message_id, nodes).await
    }

    async fn handle_ancestry(
        &self,
        message_id: MessageId,
        node_id: QualifiedHash,
        levels: usize,
    ) -> Result<(), ConnectionError> {
        if !self.store.contains(&node_id) {
            return self
                .sender
                .send_status(message_id, StatusCode::UnknownNode)
                .await;
        }
        let chain = self
            .store
            .ancestry(&node_id, levels.min(self.config.max_ancestry_levels));
        self.sender.send_response(message_id, chain).await
    }

    async fn handle_leaves_of(
        &self,
        message_id: MessageId,
        node_id: QualifiedHash,
        quantity: usize,
    ) -> Result<(), ConnectionError> {
        let leaves = self
            .store
            .leaves_of(&node_id, quantity.min(self.config.list_quantity));
        self.sender.send_response(message_id, leaves).await
    }

    async fn handle_subscribe(
        &self,
        message_id: MessageId,
        community: QualifiedHash,
    ) -> Result<(), ConnectionError> {
        self.subscriptions
            .write()
            .expect("subscription set lock poisoned")
            .insert(community);
        debug!(
            target: LOG_TARGET,
            "Peer {} subscribed to community {}", self.peer, community
        );
        self.sender.send_status(message_id, StatusCode::Ok).await
    }

    async fn handle_unsubscribe(
        &self,
        message_id: MessageId,
        community: QualifiedHash,
    ) -> Result<(), ConnectionError> {
        self.subscriptions
            .write()
            .expect("subscription set lock poisoned")
            .remove(&community);
        debug!(
            target: LOG_TARGET,
            "Peer {} unsubscribed from community {}", self.peer, community
        );
        self.sender.send_status(message_id, StatusCode::Ok).await
    }

    async fn handle_announce(
        &self,
        message_id: MessageId,
        nodes: Vec<Node>,
    ) -> Result<(), ConnectionError> {
        // Recovery of missing ancestors awaits replies on this connection, so
        // the ingest must leave the reader task before it can wait
        let session = self.clone();
        tokio::spawn(async move {
            let outcome = session.ingest_announced(nodes).await;
            if let Err(err) = session.sender.send_status(message_id, outcome).await {
                debug!(
                    target: LOG_TARGET,
                    "Reporting announce outcome to {} failed: {}", session.peer, err
                );
            }
        });
        Ok(())
    }
}

/// Forwards store events to the peer for as long as the connection lives.
/// A node is announced when its community is in the peer's subscription set.
async fn fan_out<TSocket, TStore>(
    session: Arc<RelaySession<TSocket, TStore>>,
    mut events: mpsc::UnboundedReceiver<Arc<Node>>,
    mut close_signal: ShutdownSignal,
) where
    TSocket: AsyncRead + AsyncWrite + Send + 'static,
    TStore: NodeStore + 'static,
{
    loop {
        tokio::select! {
            biased;
            _ = &mut close_signal => break,
            event = events.recv() => {
                let Some(node) = event else { break };
                let Some(community) = session.store.community_of(&node) else { continue };
                if !session.is_subscribed(&community) {
                    continue;
                }
                trace!(
                    target: LOG_TARGET,
                    "Announcing node {} to {}",
                    node.id(),
                    session.peer
                );
                if let Err(err) = session.sender.send_announce(vec![(*node).clone()]).await {
                    debug!(
                        target: LOG_TARGET,
                        "Announcing to {} failed: {}", session.peer, err
                    );
                    break;
                }
            },
        }
    }
}
