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

//! Per connection pair request/response pairing and span assembly
//!
//! The request pipeline pushes each parsed request and opens a span; the
//! response pipeline pushes each parsed response and closes the oldest open
//! span. HTTP/1.1 mandates in-order responses on a connection, so strict
//! FIFO pairing is correct even when requests are pipelined.

use log::info;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::SystemTime;

use wiremesh_cache::TtlCache;
use wiremesh_http::{Method, RequestHeader, ResponseHeader};

use crate::config::HttpConfig;
use crate::protocols::http::v1::common::content_length_or_neg;
use crate::trace::{self, Span, SpanContext, Tag, Tracer};

use super::queue::Queue;

pub struct HttpExchange {
    requests: Queue<Box<RequestHeader>>,
    responses: Queue<Box<ResponseHeader>>,
    spans: Queue<Span>,
    is_inbound: bool,
    remote_addr: Mutex<String>,
    config: Arc<HttpConfig>,
    tracer: Tracer,
    tracing_contexts: Arc<TtlCache<String, SpanContext>>,
}

impl HttpExchange {
    pub(crate) fn new(
        is_inbound: bool,
        config: Arc<HttpConfig>,
        tracer: Tracer,
        tracing_contexts: Arc<TtlCache<String, SpanContext>>,
    ) -> Self {
        HttpExchange {
            requests: Queue::new(),
            responses: Queue::new(),
            spans: Queue::new(),
            is_inbound,
            remote_addr: Mutex::new(String::new()),
            config,
            tracer,
            tracing_contexts,
        }
    }

    pub fn is_inbound(&self) -> bool {
        self.is_inbound
    }

    pub fn set_remote_addr(&self, addr: String) {
        *self.remote_addr.lock() = addr;
    }

    pub fn remote_addr(&self) -> String {
        self.remote_addr.lock().clone()
    }

    /// Queue a parsed request, to be paired with the upstream's response.
    pub fn set_request(&self, req: Box<RequestHeader>) {
        self.requests.push(req);
    }

    /// Queue a parsed response for pairing.
    pub fn set_response(&self, resp: Box<ResponseHeader>) {
        self.responses.push(resp);
    }

    /// Whether the oldest outstanding request is a HEAD.
    pub fn oldest_request_is_head(&self) -> bool {
        self.requests
            .peek_with(|r| r.method == Method::HEAD)
            .unwrap_or(false)
    }

    /// Run `f` over the newest queued request, typically to serialize the
    /// request that was just pushed.
    pub fn with_newest_request<R>(&self, f: impl FnOnce(&RequestHeader) -> R) -> Option<R> {
        self.requests.peek_back_with(|r| f(r))
    }

    /// Open a span for the oldest pending request.
    ///
    /// The parent context is taken from the request's tracing header when
    /// present, otherwise a new root span is started. Inbound spans refresh
    /// the tracing context cache under the request-id so the outbound
    /// sibling connection can continue the trace; outbound root spans inject
    /// their own context into the outgoing request.
    pub fn start_request(&self) {
        let Some(span) = self.requests.peek_mut_with(|req| self.build_span(req)) else {
            return;
        };
        self.spans.push(span);
    }

    fn build_span(&self, req: &mut RequestHeader) -> Span {
        let wire_context = trace::extract_context(req);

        let path = String::from_utf8_lossy(req.raw_path()).to_string();
        let operation = if self.is_inbound {
            path
        } else {
            format!("{}{}", req.host(), path)
        };

        let request_id = req
            .headers
            .get(&self.config.request_id_header_name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        match wire_context {
            Ok(Some(parent)) => {
                let span = self.tracer.span(operation).child_of(&parent).start();
                if self.is_inbound {
                    if let Some(context) = span.context() {
                        self.tracing_contexts.put(&request_id, context.clone());
                    }
                }
                span
            }
            res => {
                if let Err(e) = res {
                    info!("Carrier extract error: {e}");
                }
                let mut span = self.tracer.span(operation).start();

                if self.is_inbound {
                    if let Some(context) = span.context() {
                        self.tracing_contexts.put(&request_id, context.clone());
                    }

                    if !self.config.headers_map.is_empty() {
                        // headers are already parsed into a map, iterate the mapping
                        for (header_name, tag_name) in self.config.headers_map.iter() {
                            if let Some(val) = req
                                .headers
                                .get(header_name)
                                .and_then(|v| v.to_str().ok())
                            {
                                if !val.is_empty() {
                                    let tag_name = tag_name.clone();
                                    let val = val.to_string();
                                    span.set_tag(|| Tag::new(tag_name, val));
                                }
                            }
                        }
                    }
                    if !self.config.cookies_map.is_empty() {
                        // there is no pre-parsed cookie list, iterate the request's cookies
                        let tagged: Vec<(String, String)> = req
                            .cookies()
                            .filter_map(|(name, value)| {
                                self.config
                                    .cookies_map
                                    .get(name)
                                    .map(|tag| (tag.clone(), value.to_string()))
                            })
                            .collect();
                        for (tag_name, value) in tagged {
                            span.set_tag(|| Tag::new(tag_name, value));
                        }
                    }
                } else if let Some(context) = span.context() {
                    let context = context.clone();
                    trace::inject_context(&context, req);
                }
                span
            }
        }
    }

    /// Pair the oldest request with the oldest response and finish its span.
    ///
    /// A response without an outstanding request is quietly dropped. A
    /// request without a response (the connection tore down mid-request)
    /// finishes its span tagged as a timeout; that path runs from
    /// [Self::clean_up()].
    pub fn stop_request(&self) {
        let request = self.requests.pop();
        let response = self.responses.pop();

        if let (Some(req), Some(resp)) = (request.as_deref(), response.as_deref()) {
            if let Some(mut span) = self.spans.pop() {
                self.fill_span(&mut span, Some(req), Some(resp));
                span.set_finish_time(SystemTime::now);
            }
            return;
        }

        if let (Some(req), None) = (request.as_deref(), response.as_deref()) {
            if let Some(mut span) = self.spans.pop() {
                self.fill_span(&mut span, Some(req), None);
                span.set_tag(|| Tag::new("error", true));
                span.set_tag(|| Tag::new("timeout", true));
                span.set_finish_time(SystemTime::now);
            }
        }
    }

    /// Drain whatever is still queued when the connection pair goes away.
    /// Requests that never saw a response finish their spans as timeouts.
    /// Draining is idempotent; a second call finds the queues empty.
    pub fn clean_up(&self) {
        while !self.requests.is_empty() {
            self.stop_request();
        }
        self.responses.clear();
        self.spans.clear();
    }

    fn fill_span(
        &self,
        span: &mut Span,
        req: Option<&RequestHeader>,
        resp: Option<&ResponseHeader>,
    ) {
        let kind = if self.is_inbound { "server" } else { "client" };
        span.set_tag(|| Tag::new("span.kind", kind));
        let remote_addr = self.remote_addr();
        span.set_tag(|| Tag::new("remote_addr", remote_addr));
        if let Some(req) = req {
            let host = req.host().to_string();
            span.set_tag(|| Tag::new("http.host", host));
            let path = String::from_utf8_lossy(req.raw_path()).to_string();
            span.set_tag(|| Tag::new("http.path", path));
            let request_size = content_length_or_neg(&req.headers);
            span.set_tag(|| Tag::new("http.request_size", request_size));
            let method = req.method.as_str().to_string();
            span.set_tag(|| Tag::new("http.method", method));
            if let Some(user_agent) = req
                .headers
                .get(http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
            {
                let user_agent = user_agent.to_string();
                span.set_tag(|| Tag::new("http.user_agent", user_agent));
            }
            if let Some(request_id) = req
                .headers
                .get(&self.config.request_id_header_name)
                .and_then(|v| v.to_str().ok())
            {
                if !request_id.is_empty() {
                    let request_id = request_id.to_string();
                    span.set_tag(|| Tag::new("http.request_id", request_id));
                }
            }
        }
        if let Some(resp) = resp {
            let response_size = content_length_or_neg(&resp.headers);
            span.set_tag(|| Tag::new("http.response_size", response_size));
            let status = resp.status.as_u16();
            span.set_tag(|| Tag::new("http.status_code", status as i64));
            if status >= 500 {
                span.set_tag(|| Tag::new("error", "true".to_string()));
            }
        }
    }
}
