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

//! Node storage: the [`NodeStore`] interface, deep validation and the
//! reference in-memory implementation.
//!
//! A store only ever grows. `add` admits a node after its content address
//! checks out and every ancestor it references is already stored, so the set
//! of stored nodes is closed under ancestry at all times.

use std::collections::HashMap;

use thiserror::Error;

use crate::{
    fields::{NodeType, QualifiedHash},
    node::{Node, NodeError},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node declares id {declared} but its encoding hashes to {computed}")]
    Integrity {
        declared: QualifiedHash,
        computed: QualifiedHash,
    },
    #[error("referenced ancestor {0} is not stored")]
    UnknownAncestor(QualifiedHash),
    #[error("{child_type} node {child} has {parent_type} parent {parent}")]
    InvalidParentType {
        child: QualifiedHash,
        child_type: NodeType,
        parent: QualifiedHash,
        parent_type: NodeType,
    },
    #[error("malformed node: {0}")]
    Node(#[from] NodeError),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage access failed: {0}")]
    Access(String),
}

/// Outcome of a successful `add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    Inserted,
    /// The node was already stored; adding again is a no-op.
    AlreadyPresent,
}

/// Interface every node store presents to the relay.
pub trait NodeStore: Send + Sync {
    /// Ingest a node. Checks the content address, demands that all referenced
    /// ancestors are stored, and is idempotent for already stored nodes.
    fn add(&mut self, node: Node) -> Result<AddResult, StoreError>;

    fn get(&self, id: &QualifiedHash) -> Option<Node>;

    fn contains(&self, id: &QualifiedHash) -> bool;

    /// Up to `limit` nodes of the given type, most recently created first.
    fn recent(&self, node_type: NodeType, limit: usize) -> Vec<Node>;

    /// Up to `limit` stored descendants of `root` that have no children of
    /// their own in this store.
    fn leaves_of(&self, root: &QualifiedHash, limit: usize) -> Vec<Node>;

    /// The ancestor chain of `id`, nearest first, at most `levels` long.
    /// Empty when `id` is unknown or a root.
    fn ancestry(&self, id: &QualifiedHash, levels: usize) -> Vec<Node>;

    /// Ids of all stored community nodes.
    fn communities(&self) -> Vec<QualifiedHash>;
}

/// Check that `child` may hang off `parent`.
fn check_parent_type(child: &Node, parent: &Node) -> Result<(), StoreError> {
    let ok = match child.node_type() {
        NodeType::Identity | NodeType::Community => false,
        NodeType::Conversation => parent.node_type() == NodeType::Community,
        NodeType::Reply => matches!(
            parent.node_type(),
            NodeType::Conversation | NodeType::Reply
        ),
    };
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidParentType {
            child: *child.id(),
            child_type: child.node_type(),
            parent: *parent.id(),
            parent_type: parent.node_type(),
        })
    }
}

/// Validate `node` against `store`: every referenced ancestor must be stored
/// and the parent/child type pairing must hold along the whole chain up to
/// the root.
pub fn validate_deep(node: &Node, store: &impl NodeStore) -> Result<(), StoreError> {
    let mut child = node.clone();
    while let Some(parent_id) = child.parent().copied() {
        let parent = store
            .get(&parent_id)
            .ok_or(StoreError::UnknownAncestor(parent_id))?;
        check_parent_type(&child, &parent)?;
        child = parent;
    }
    Ok(())
}

/// The community a node belongs to: a community node belongs to itself,
/// conversations and replies to the community at the top of their ancestor
/// chain. Identities belong to none.
pub fn community_of(node: &Node, store: &impl NodeStore) -> Option<QualifiedHash> {
    let mut current = node.clone();
    loop {
        match current.node_type() {
            NodeType::Community => return Some(*current.id()),
            NodeType::Identity => return None,
            _ => {},
        }
        let parent_id = current.parent()?;
        current = store.get(parent_id)?;
    }
}

/// In-memory store, also used as the index half of the on-disk grove.
#[derive(Default)]
pub struct MemoryStore {
    nodes: HashMap<QualifiedHash, Node>,
    // insertion order, for stable iteration
    order: Vec<QualifiedHash>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn descends_from(&self, node: &Node, root: &QualifiedHash) -> bool {
        let mut current = node.parent();
        while let Some(parent_id) = current {
            if parent_id == root {
                return true;
            }
            current = self.nodes.get(parent_id).and_then(|n| n.parent());
        }
        false
    }
}

impl NodeStore for MemoryStore {
    fn add(&mut self, node: Node) -> Result<AddResult, StoreError> {
        let computed = node.computed_id();
        if computed != *node.id() {
            return Err(StoreError::Integrity {
                declared: *node.id(),
                computed,
            });
        }
        validate_deep(&node, self)?;
        if self.nodes.contains_key(node.id()) {
            return Ok(AddResult::AlreadyPresent);
        }
        self.order.push(*node.id());
        self.nodes.insert(*node.id(), node);
        Ok(AddResult::Inserted)
    }

    fn get(&self, id: &QualifiedHash) -> Option<Node> {
        self.nodes.get(id).cloned()
    }

    fn contains(&self, id: &QualifiedHash) -> bool {
        self.nodes.contains_key(id)
    }

    fn recent(&self, node_type: NodeType, limit: usize) -> Vec<Node> {
        let mut matching: Vec<Node> = self
            .nodes
            .values()
            .filter(|n| n.node_type() == node_type)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created().cmp(&a.created()).then_with(|| a.id().cmp(b.id())));
        matching.truncate(limit);
        matching
    }

    fn leaves_of(&self, root: &QualifiedHash, limit: usize) -> Vec<Node> {
        let mut has_children: HashMap<&QualifiedHash, bool> = HashMap::new();
        for node in self.nodes.values() {
            if let Some(parent) = node.parent() {
                has_children.insert(parent, true);
            }
        }
        let mut leaves: Vec<Node> = self
            .nodes
            .values()
            .filter(|n| !has_children.contains_key(n.id()) && self.descends_from(n, root))
            .cloned()
            .collect();
        leaves.sort_by(|a, b| a.created().cmp(&b.created()).then_with(|| a.id().cmp(b.id())));
        leaves.truncate(limit);
        leaves
    }

    fn ancestry(&self, id: &QualifiedHash, levels: usize) -> Vec<Node> {
        let mut chain = Vec::new();
        let Some(node) = self.nodes.get(id) else {
            return chain;
        };
        let mut current = node.parent();
        while let Some(parent_id) = current {
            if chain.len() == levels {
                break;
            }
            // Closure under ancestry makes a missing link unreachable, but a
            // broken chain must not loop forever
            let Some(parent) = self.nodes.get(parent_id) else {
                break;
            };
            chain.push(parent.clone());
            current = parent.parent();
        }
        chain
    }

    fn communities(&self) -> Vec<QualifiedHash> {
        self.order
            .iter()
            .filter(|id| {
                self.nodes
                    .get(id)
                    .map(|n| n.node_type() == NodeType::Community)
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::node::timestamp_now;

    /// A community with one conversation and a two-deep reply chain.
    pub(crate) struct Fixture {
        pub community: Node,
        pub conversation: Node,
        pub reply: Node,
        pub nested_reply: Node,
    }

    pub(crate) fn fixture() -> Fixture {
        let community = Node::new(NodeType::Community, None, 1_000, &b"gardening"[..]).unwrap();
        let conversation = Node::new(
            NodeType::Conversation,
            Some(*community.id()),
            2_000,
            &b"soil quality"[..],
        )
        .unwrap();
        let reply = Node::new(
            NodeType::Reply,
            Some(*conversation.id()),
            3_000,
            &b"loam wins"[..],
        )
        .unwrap();
        let nested_reply = Node::new(
            NodeType::Reply,
            Some(*reply.id()),
            4_000,
            &b"agreed"[..],
        )
        .unwrap();
        Fixture {
            community,
            conversation,
            reply,
            nested_reply,
        }
    }

    pub(crate) fn populated() -> (MemoryStore, Fixture) {
        let mut store = MemoryStore::new();
        let fx = fixture();
        store.add(fx.community.clone()).unwrap();
        store.add(fx.conversation.clone()).unwrap();
        store.add(fx.reply.clone()).unwrap();
        store.add(fx.nested_reply.clone()).unwrap();
        (store, fx)
    }

    #[test]
    fn add_rejects_tampered_content_address() {
        let mut store = MemoryStore::new();
        let node = Node::new(NodeType::Identity, None, timestamp_now(), &b"mallory"[..]).unwrap();
        let tampered = Node::from_parts(
            *node.id(),
            node.node_type(),
            node.parent().copied(),
            node.created(),
            // one bit flipped relative to the declared id
            &b"eallory"[..],
        );
        assert!(matches!(
            store.add(tampered),
            Err(StoreError::Integrity { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn add_demands_stored_ancestors() {
        let mut store = MemoryStore::new();
        let fx = fixture();
        let missing = *fx.community.id();
        match store.add(fx.conversation.clone()) {
            Err(StoreError::UnknownAncestor(id)) => assert_eq!(id, missing),
            other => panic!("unexpected add outcome: {:?}", other.map(|_| ())),
        }
        store.add(fx.community.clone()).unwrap();
        assert_eq!(store.add(fx.conversation).unwrap(), AddResult::Inserted);
    }

    #[test]
    fn add_rejects_mismatched_parent_type() {
        let mut store = MemoryStore::new();
        let fx = fixture();
        store.add(fx.community.clone()).unwrap();
        // a conversation whose parent is another conversation
        store.add(fx.conversation.clone()).unwrap();
        let wrong = Node::new(
            NodeType::Conversation,
            Some(*fx.conversation.id()),
            5_000,
            &b"off topic"[..],
        )
        .unwrap();
        assert!(matches!(
            store.add(wrong),
            Err(StoreError::InvalidParentType { .. })
        ));
    }

    #[test]
    fn add_is_idempotent() {
        let (mut store, fx) = populated();
        let before = store.len();
        assert_eq!(
            store.add(fx.reply.clone()).unwrap(),
            AddResult::AlreadyPresent
        );
        assert_eq!(store.len(), before);
    }

    #[test]
    fn ancestry_walks_nearest_first() {
        let (store, fx) = populated();
        let chain = store.ancestry(fx.nested_reply.id(), 10);
        let ids: Vec<_> = chain.iter().map(|n| *n.id()).collect();
        assert_eq!(
            ids,
            vec![*fx.reply.id(), *fx.conversation.id(), *fx.community.id()]
        );
        // level bound respected
        assert_eq!(store.ancestry(fx.nested_reply.id(), 1).len(), 1);
        // unknown id yields nothing
        let unknown = QualifiedHash::digest_of(b"unknown");
        assert!(store.ancestry(&unknown, 10).is_empty());
    }

    #[test]
    fn leaves_of_finds_childless_descendants() {
        let (mut store, fx) = populated();
        let leaves = store.leaves_of(fx.community.id(), 10);
        assert_eq!(leaves, vec![fx.nested_reply.clone()]);

        let sibling = Node::new(
            NodeType::Reply,
            Some(*fx.conversation.id()),
            5_000,
            &b"compost instead"[..],
        )
        .unwrap();
        store.add(sibling.clone()).unwrap();
        let leaves = store.leaves_of(fx.conversation.id(), 10);
        assert_eq!(leaves, vec![fx.nested_reply, sibling]);
    }

    #[test]
    fn recent_is_most_recent_first() {
        let mut store = MemoryStore::new();
        let older = Node::new(NodeType::Identity, None, 1_000, &b"older"[..]).unwrap();
        let newer = Node::new(NodeType::Identity, None, 2_000, &b"newer"[..]).unwrap();
        store.add(older.clone()).unwrap();
        store.add(newer.clone()).unwrap();
        assert_eq!(store.recent(NodeType::Identity, 10), vec![newer.clone(), older]);
        assert_eq!(store.recent(NodeType::Identity, 1), vec![newer]);
        assert!(store.recent(NodeType::Community, 10).is_empty());
    }

    #[test]
    fn community_of_walks_to_the_community_root() {
        let (store, fx) = populated();
        assert_eq!(
            community_of(&fx.nested_reply, &store),
            Some(*fx.community.id())
        );
        assert_eq!(community_of(&fx.community, &store), Some(*fx.community.id()));
        let identity = Node::new(NodeType::Identity, None, 0, &b"ann"[..]).unwrap();
        assert_eq!(community_of(&identity, &store), None);
    }
}
