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

#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

//! # wiremesh-core
//!
//! The HTTP protocol engine of the wiremesh service-mesh sidecar proxy.
//!
//! For each proxied TCP connection pair the engine runs two pipelines that
//! share one [proxy::HttpExchange]:
//!
//! * the request pipeline ([proxy::HttpHandler::handle_request]) frames
//!   HTTP/1.x requests from the client, enriches them with correlation ids
//!   and tracing context, negotiates the upstream destination with a dialer
//!   task, and re-serializes them upstream;
//! * the response pipeline ([proxy::HttpHandler::handle_response]) frames
//!   responses from the upstream, forwards them back and finishes one
//!   tracing span per request/response pair.
//!
//! Anything the engine cannot parse, and any connection that upgrades to
//! another protocol, is passed through byte for byte.

pub mod config;
mod pool;
pub mod protocols;
pub mod proxy;
pub mod trace;
pub mod utils;

pub use wiremesh_error::{BError, Error, ErrorType, OrErr, Result};

pub mod prelude {
    pub use crate::config::HttpConfig;
    pub use crate::proxy::{DialerChannels, HttpExchange, HttpHandler};
    pub use crate::trace::Tracer;
}
