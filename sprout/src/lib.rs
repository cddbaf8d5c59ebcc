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

//! # Sprout
//!
//! The sprout protocol synchronizes Arbor forest nodes between peers over any
//! reliable duplex byte stream. Messages are line-oriented ASCII; every
//! request carries a per-connection message id, and `response`/`status`
//! messages answer the request with the matching id, so both sides can keep
//! any number of requests in flight on one stream.
//!
//! A [`connection::Connection`] multiplexes the stream, a
//! [`store::SubscriberStore`] fans freshly ingested nodes out to interested
//! connections, and a [`worker::Worker`] ties the two together with the relay
//! policies: answering peer requests from the local store, pulling missing
//! ancestors, and running the bootstrap catch-up exchange on outbound
//! connections.

pub mod connection;
pub mod proto;
pub mod store;
pub mod worker;

pub use connection::{Connection, ConnectionDirection, ConnectionError, MessageHandler, MessageSender};
pub use proto::{MessageId, StatusCode, PROTOCOL_MAJOR, PROTOCOL_MINOR};
pub use store::{SubscriberId, SubscriberStore};
pub use worker::{RelayConfig, Worker};
