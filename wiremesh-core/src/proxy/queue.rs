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

//! A mutex guarded FIFO
//!
//! Each proxied connection pair keeps three of these: pending requests,
//! pending responses and open spans. Both pipeline tasks touch them, so every
//! operation takes the internal lock; no caller ever observes a partially
//! updated queue.

use parking_lot::Mutex;
use std::collections::VecDeque;

pub struct Queue<T> {
    elements: Mutex<VecDeque<T>>,
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Queue {
            elements: Mutex::new(VecDeque::new()),
        }
    }

    /// Push an element to the back of the queue.
    pub fn push(&self, value: T) {
        self.elements.lock().push_back(value);
    }

    /// Pop the oldest element, `None` when empty.
    pub fn pop(&self) -> Option<T> {
        self.elements.lock().pop_front()
    }

    /// Run `f` over the oldest element without removing it, `None` when empty.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.elements.lock().front().map(f)
    }

    /// Like [Self::peek_with] but with mutable access.
    pub fn peek_mut_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.elements.lock().front_mut().map(f)
    }

    /// Run `f` over the newest element without removing it, `None` when empty.
    pub fn peek_back_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.elements.lock().back().map(f)
    }

    /// Drop all elements.
    pub fn clear(&self) {
        self.elements.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.elements.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.lock().is_empty()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}
