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

//! Process wide pool of serialization buffers.
//!
//! Every message the pipelines forward is re-serialized through a scratch
//! [BytesMut]. Instead of allocating one per message, borrowers take a
//! buffer from the pool and must return it when done. Buffers are cleared
//! on acquire, so a borrower always starts from an empty buffer.

use bytes::BytesMut;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

const POOL_SIZE: usize = 64;
const BUF_INIT_SIZE: usize = 4096;
// buffers that grew beyond this are dropped instead of pooled again
const BUF_KEEP_SIZE: usize = 1024 * 64;

pub(crate) static WRITE_BUF_POOL: Lazy<BufPool> = Lazy::new(BufPool::new);

pub(crate) struct BufPool {
    bufs: Mutex<Vec<BytesMut>>,
}

impl BufPool {
    fn new() -> Self {
        BufPool {
            bufs: Mutex::new(Vec::with_capacity(POOL_SIZE)),
        }
    }

    /// Take a cleared buffer out of the pool, allocating a fresh one when the
    /// pool is empty.
    pub fn get(&self) -> BytesMut {
        let mut buf = self
            .bufs
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(BUF_INIT_SIZE));
        buf.clear();
        buf
    }

    /// Return a buffer to the pool. Oversized or surplus buffers are dropped.
    pub fn put(&self, buf: BytesMut) {
        if buf.capacity() > BUF_KEEP_SIZE {
            return;
        }
        let mut bufs = self.bufs.lock();
        if bufs.len() < POOL_SIZE {
            bufs.push(buf);
        }
    }
}
