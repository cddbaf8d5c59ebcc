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

//! Feeds nodes written into the grove directory by other processes (e.g. a
//! chat client saving a message) into the store, which announces them to
//! subscribed peers. Files the relay writes itself come back as idempotent
//! adds and stay quiet.

use std::{fs, path::PathBuf, sync::Arc};

use log::*;
use notify::{
    event::{EventKind, ModifyKind},
    Event, RecommendedWatcher, RecursiveMode, Watcher,
};
use sprout::SubscriberStore;
use sprout_forest::{AddResult, Grove, Node};
use sprout_shutdown::ShutdownSignal;
use tokio::sync::mpsc;

const LOG_TARGET: &str = "sprout_relay::watcher";

/// Watch the grove directory and ingest created files. The returned watcher
/// must be kept alive for the events to keep flowing.
pub fn watch_grove(
    path: PathBuf,
    store: Arc<SubscriberStore<Grove>>,
    shutdown_signal: ShutdownSignal,
) -> notify::Result<RecommendedWatcher> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
        // the callback runs on the watcher's own thread; hand off immediately
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;
    info!(target: LOG_TARGET, "Watching grove at '{}'", path.display());
    tokio::spawn(run(event_rx, store, shutdown_signal));
    Ok(watcher)
}

async fn run(
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    store: Arc<SubscriberStore<Grove>>,
    mut shutdown_signal: ShutdownSignal,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_signal => break,
            maybe = events.recv() => {
                let Some(result) = maybe else { break };
                let event = match result {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(target: LOG_TARGET, "Grove watch error: {}", err);
                        continue;
                    },
                };
                // new files appear either directly or by rename from a
                // temporary name
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
                ) {
                    continue;
                }
                for path in &event.paths {
                    ingest_file(&store, path);
                }
            },
        }
    }
    debug!(target: LOG_TARGET, "Grove watcher exited");
}

fn ingest_file(store: &SubscriberStore<Grove>, path: &std::path::Path) {
    if path.extension().map(|ext| ext == "tmp").unwrap_or(false) || !path.is_file() {
        return;
    }
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) => {
            warn!(
                target: LOG_TARGET,
                "Failed reading watched file '{}': {}",
                path.display(),
                err
            );
            return;
        },
    };
    let node = match Node::decode(&data) {
        Ok(node) => node,
        Err(err) => {
            warn!(
                target: LOG_TARGET,
                "Watched file '{}' is not a node: {}",
                path.display(),
                err
            );
            return;
        },
    };
    let node_id = *node.id();
    match store.add(node) {
        Ok(AddResult::Inserted) => {
            info!(target: LOG_TARGET, "Ingested node {} from the grove", node_id);
        },
        // the relay's own writes come back around as duplicates
        Ok(AddResult::AlreadyPresent) => {},
        Err(err) => {
            warn!(
                target: LOG_TARGET,
                "Failed adding node {} from watched file: {}", node_id, err
            );
        },
    }
}
