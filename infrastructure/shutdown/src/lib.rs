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

//! Cooperative shutdown signalling for relay tasks.
//!
//! A [`Shutdown`] owns the trigger; any number of [`ShutdownSignal`] clones
//! are handed to connection workers, reader loops, fan-out and ingest tasks,
//! which either `.await` the signal directly or race it in a `select!` arm.
//! Dropping the `Shutdown` without triggering also resolves every signal, so
//! a task can never outlive its owner unnoticed.
//!
//! Workers use the same pair for their connection-local close: the relay's
//! global shutdown and a worker's "this connection is done" are the same
//! shape, just different owners.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use futures::{
    channel::oneshot,
    future::{FusedFuture, Shared},
    FutureExt,
};

/// Trigger for shutting down tasks that hold a [`ShutdownSignal`].
///
/// Triggering consumes the underlying channel's send half; later calls are
/// no-ops, so any teardown path may trigger without coordinating with the
/// others.
#[derive(Clone, Debug)]
pub struct Shutdown {
    trigger: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    signal: ShutdownSignal,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            trigger: Arc::new(Mutex::new(Some(tx))),
            signal: ShutdownSignal {
                inner: rx.shared(),
            },
        }
    }

    /// A signal that resolves once this instance triggers or is dropped.
    pub fn to_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn trigger(&mut self) {
        if let Some(tx) = self
            .trigger
            .lock()
            .expect("shutdown trigger lock poisoned")
            .take()
        {
            let _result = tx.send(());
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.trigger
            .lock()
            .expect("shutdown trigger lock poisoned")
            .is_none()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a [`Shutdown`]. Resolves when the shutdown is triggered
/// or the owning `Shutdown` is dropped, and keeps resolving for every clone
/// thereafter.
#[derive(Clone, Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct ShutdownSignal {
    inner: Shared<oneshot::Receiver<()>>,
}

impl ShutdownSignal {
    /// Wait for the signal. Completes immediately if it already fired.
    pub async fn wait(&mut self) {
        self.await
    }

    /// Whether the shutdown event has been observed on the shared channel,
    /// by this clone or any other.
    pub fn is_triggered(&self) -> bool {
        self.inner.peek().is_some() || self.inner.is_terminated()
    }
}

impl Future for ShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // a completed Shared must not be polled again through the same clone
        if self.inner.is_terminated() {
            return Poll::Ready(());
        }
        match Pin::new(&mut self.inner).poll(cx) {
            // a dropped Shutdown cancels the channel, which counts as
            // triggered for every waiter
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl FusedFuture for ShutdownSignal {
    fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }
}
