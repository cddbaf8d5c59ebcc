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

//! The grove: a directory holding one file per node, named by the node's
//! qualified hash. The whole grove is indexed into memory on open; writes go
//! to disk first (write-temp-then-rename) and to the index after.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::*;

use crate::{
    fields::{NodeType, QualifiedHash},
    node::Node,
    store::{AddResult, MemoryStore, NodeStore, StoreError},
};

const LOG_TARGET: &str = "forest::grove";

/// Suffix for in-flight writes. Files carrying it are skipped on open.
const TMP_SUFFIX: &str = ".tmp";

/// On-disk node store rooted at a directory.
pub struct Grove {
    root: PathBuf,
    index: MemoryStore,
}

impl Grove {
    /// Open a grove, creating the directory if needed and indexing every
    /// readable node file. Files that do not decode as nodes are skipped;
    /// nodes whose ancestors are not present in the grove are skipped too,
    /// keeping the index closed under ancestry.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut pending = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(TMP_SUFFIX))
                .unwrap_or(true)
            {
                continue;
            }
            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        "Skipping unreadable grove file '{}': {}",
                        path.display(),
                        err
                    );
                    continue;
                },
            };
            match Node::decode(&data) {
                Ok(node) => pending.push(node),
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        "Skipping grove file '{}': {}",
                        path.display(),
                        err
                    );
                },
            }
        }

        let mut grove = Self {
            root,
            index: MemoryStore::new(),
        };

        // Files arrive in directory order; keep deferring nodes until their
        // ancestors have been indexed
        loop {
            let mut deferred = Vec::new();
            let mut progressed = false;
            for node in pending {
                match grove.index.add(node.clone()) {
                    Ok(_) => progressed = true,
                    Err(StoreError::UnknownAncestor(_)) => deferred.push(node),
                    Err(err) => {
                        warn!(
                            target: LOG_TARGET,
                            "Dropping invalid grove node {}: {}",
                            node.id(),
                            err
                        );
                    },
                }
            }
            if deferred.is_empty() || !progressed {
                for node in &deferred {
                    warn!(
                        target: LOG_TARGET,
                        "Grove node {} has missing ancestors and was not indexed",
                        node.id()
                    );
                }
                break;
            }
            pending = deferred;
        }

        debug!(
            target: LOG_TARGET,
            "Opened grove at '{}' with {} node(s)",
            grove.root.display(),
            grove.index.len()
        );
        Ok(grove)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn node_count(&self) -> usize {
        self.index.len()
    }

    /// The file a node with this id is stored at.
    pub fn node_path(&self, id: &QualifiedHash) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn persist(&self, node: &Node) -> Result<(), StoreError> {
        let final_path = self.node_path(node.id());
        let tmp_path = self.root.join(format!("{}{}", node.id(), TMP_SUFFIX));
        fs::write(&tmp_path, node.encode())?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }
}

impl NodeStore for Grove {
    fn add(&mut self, node: Node) -> Result<AddResult, StoreError> {
        let computed = node.computed_id();
        if computed != *node.id() {
            return Err(StoreError::Integrity {
                declared: *node.id(),
                computed,
            });
        }
        crate::store::validate_deep(&node, &self.index)?;
        if self.index.contains(node.id()) {
            return Ok(AddResult::AlreadyPresent);
        }
        // Disk first: a node the index knows but the grove lost would break
        // durability of the ancestor closure
        self.persist(&node)?;
        self.index.add(node)
    }

    fn get(&self, id: &QualifiedHash) -> Option<Node> {
        self.index.get(id)
    }

    fn contains(&self, id: &QualifiedHash) -> bool {
        self.index.contains(id)
    }

    fn recent(&self, node_type: NodeType, limit: usize) -> Vec<Node> {
        self.index.recent(node_type, limit)
    }

    fn leaves_of(&self, root: &QualifiedHash, limit: usize) -> Vec<Node> {
        self.index.leaves_of(root, limit)
    }

    fn ancestry(&self, id: &QualifiedHash, levels: usize) -> Vec<Node> {
        self.index.ancestry(id, levels)
    }

    fn communities(&self) -> Vec<QualifiedHash> {
        self.index.communities()
    }
}
