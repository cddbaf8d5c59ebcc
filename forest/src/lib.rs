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

//! # Arbor forest
//!
//! The forest is an append-only DAG of immutable, content-addressed nodes.
//! Four node types exist: identities and communities are roots, conversations
//! hang off a community, and replies hang off a conversation or another reply.
//! A node's identifier is the qualified hash of its canonical binary encoding,
//! so a node can never be altered without changing its identity.
//!
//! This crate provides the node model ([`Node`], [`QualifiedHash`],
//! [`NodeType`]), deep validation against a store, an in-memory
//! [`MemoryStore`], and the on-disk [`Grove`] that keeps one file per node.

pub mod fields;
pub mod grove;
pub mod node;
pub mod store;

pub use fields::{FieldError, HashAlgorithm, NodeType, QualifiedHash};
pub use grove::Grove;
pub use node::{Node, NodeError};
pub use store::{community_of, validate_deep, AddResult, MemoryStore, NodeStore, StoreError};
