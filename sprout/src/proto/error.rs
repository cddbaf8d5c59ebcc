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

use sprout_forest::QualifiedHash;
use thiserror::Error;

/// Errors produced while reading a protocol message. All of these are fatal
/// to the connection they occurred on; the peer cannot be resynchronized once
/// the stream position is in doubt.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown verb `{0}`")]
    UnknownVerb(String),
    #[error("unknown status code {0}")]
    UnknownStatusCode(u8),
    #[error("malformed {verb} message: {detail}")]
    Malformed { verb: &'static str, detail: String },
    #[error("node line declares id {declared} but its encoding hashes to {computed}")]
    NodeIntegrity {
        declared: QualifiedHash,
        computed: QualifiedHash,
    },
    #[error("message carries {got} records, limit is {max}")]
    TooManyRecords { got: usize, max: usize },
}

impl ProtocolError {
    pub(crate) fn malformed(verb: &'static str, detail: impl Into<String>) -> Self {
        ProtocolError::Malformed {
            verb,
            detail: detail.into(),
        }
    }

    /// True when the failure is a parse problem rather than a transport one,
    /// i.e. the peer should be told about it before closing.
    pub fn is_parse_error(&self) -> bool {
        !matches!(self, ProtocolError::ConnectionClosed | ProtocolError::Io(_))
    }
}
