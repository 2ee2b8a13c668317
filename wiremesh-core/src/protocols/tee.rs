// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The tee buffer
//!
//! While a pipeline speculatively parses one message, every byte pulled off
//! the socket is mirrored here. If parsing fails or the connection upgrades
//! to an opaque protocol, the mirrored bytes are replayed to the peer
//! verbatim, which keeps the proxy byte-transparent for anything it cannot
//! interpret.

use bytes::BytesMut;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeeState {
    Idle,
    Active,
    Stopped,
}

/// A bounded mirror of recently read bytes.
///
/// Writes are retained only while the tee is active. [TeeWriter::start()]
/// clears the previous contents, so at any point the buffer holds exactly
/// the bytes mirrored since the last arm.
pub struct TeeWriter {
    buf: BytesMut,
    state: TeeState,
}

impl TeeWriter {
    pub fn new() -> Self {
        TeeWriter {
            buf: BytesMut::new(),
            state: TeeState::Idle,
        }
    }

    /// Clear the buffer and start retaining writes.
    pub fn start(&mut self) {
        self.buf.clear();
        self.state = TeeState::Active;
    }

    /// Stop retaining writes. The buffered bytes stay readable.
    pub fn stop(&mut self) {
        self.state = TeeState::Stopped;
    }

    pub fn is_active(&self) -> bool {
        self.state == TeeState::Active
    }

    /// Mirror `data`. Bytes are retained only while active.
    pub fn write(&mut self, data: &[u8]) {
        if self.state == TeeState::Active {
            self.buf.extend_from_slice(data);
        }
    }

    /// The mirrored bytes from offset 0.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl Default for TeeWriter {
    fn default() -> Self {
        Self::new()
    }
}
