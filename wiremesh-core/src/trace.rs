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

//! Distributed tracing helpers
//!
//! The engine emits one span per proxied request. The tracer itself is
//! owned by the caller; this module binds the tracer's HTTP header carrier
//! interface to the proxy's header types so span contexts can be pulled off
//! inbound requests and pushed onto outbound ones.

use log::info;
use rustracing::carrier::{
    ExtractFromHttpHeader, InjectToHttpHeader, IterHttpHeaderFields, SetHttpHeaderField,
};
use rustracing_jaeger::span::SpanContextState;

use wiremesh_http::{HMap, RequestHeader};

pub use rustracing::sampler::AllSampler;
pub use rustracing::tag::Tag;

pub type Span = rustracing::span::Span<SpanContextState>;
pub type SpanContext = rustracing::span::SpanContext<SpanContextState>;
pub type FinishedSpan = rustracing::span::FinishedSpan<SpanContextState>;
pub type SpanReceiver = rustracing::span::SpanReceiver<SpanContextState>;
pub type Tracer = rustracing_jaeger::Tracer;

/// Read-only carrier over a header map, used for span context extraction.
pub(crate) struct HeaderCarrier<'a>(pub &'a HMap);

impl<'a> IterHttpHeaderFields<'a> for HeaderCarrier<'a> {
    type Fields = std::iter::Map<
        http::header::Iter<'a, http::HeaderValue>,
        fn((&'a http::header::HeaderName, &'a http::HeaderValue)) -> (&'a str, &'a [u8]),
    >;

    fn fields(&'a self) -> Self::Fields {
        fn kv<'b>(
            (name, value): (&'b http::header::HeaderName, &'b http::HeaderValue),
        ) -> (&'b str, &'b [u8]) {
            (name.as_str(), value.as_bytes())
        }
        self.0.iter().map(
            kv as fn((&'a http::header::HeaderName, &'a http::HeaderValue)) -> (&'a str, &'a [u8]),
        )
    }
}

/// Write carrier over a request header, used for span context injection.
pub(crate) struct HeaderInjector<'a>(pub &'a mut RequestHeader);

impl SetHttpHeaderField for HeaderInjector<'_> {
    fn set_http_header_field(&mut self, name: &str, value: &str) -> rustracing::Result<()> {
        // the field names a tracer emits are always valid header names
        let _ = self.0.insert_header(name.to_string(), value);
        Ok(())
    }
}

/// Attempt to extract a parent span context from the request headers.
pub(crate) fn extract_context(req: &RequestHeader) -> rustracing::Result<Option<SpanContext>> {
    let carrier = HeaderCarrier(&req.headers);
    SpanContext::extract_from_http_header(&carrier)
}

/// Inject `ctx` into the request headers as the tracer's wire header.
pub(crate) fn inject_context(ctx: &SpanContext, req: &mut RequestHeader) {
    let mut carrier = HeaderInjector(req);
    if let Err(e) = ctx.inject_to_http_header(&mut carrier) {
        info!("Failed to inject tracing context: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tracer() -> (Tracer, SpanReceiver) {
        let (span_tx, span_rx) = crossbeam_channel::bounded(10);
        (Tracer::with_sender(AllSampler, span_tx), span_rx)
    }

    #[test]
    fn test_inject_then_extract() {
        let (tracer, _span_rx) = test_tracer();
        let span = tracer.span("test-op").start();
        let ctx = span.context().cloned().unwrap();

        let mut req = RequestHeader::build("GET", b"/", None).unwrap();
        assert!(extract_context(&req).unwrap().is_none());

        inject_context(&ctx, &mut req);
        let extracted = extract_context(&req).unwrap().unwrap();
        assert_eq!(
            extracted.state().trace_id().to_string(),
            ctx.state().trace_id().to_string()
        );
    }
}
