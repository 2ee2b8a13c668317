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

//! Dynamic destination routing
//!
//! A caller can redirect selected hosts to alternate upstreams by attaching
//! a routing value, a comma separated `host=target` list, to its request as
//! a header or cookie. The value also propagates through the routing context
//! cache so downstream calls made under the same request-id inherit it.

use std::sync::Arc;
use wiremesh_cache::TtlCache;
use wiremesh_error::{Error, ErrorType, Result};
use wiremesh_http::RequestHeader;

use crate::config::HttpConfig;

pub const MALFORMED_ROUTING_HEADER: ErrorType = ErrorType::new("MalformedRoutingHeader");

/// Resolve the destination for a request with the given routing value.
///
/// Pairs mapping a host to itself are skipped to avoid infinite route loops.
/// Targets without a port default to `:80`. When no pair matches the request
/// host, the original destination is kept.
pub fn routing_destination(
    routing_value: &str,
    host: &str,
    original_dst: &str,
) -> Result<String> {
    for pair in routing_value.split(',') {
        let Some((key, target)) = pair.split_once('=') else {
            return Error::e_explain(
                MALFORMED_ROUTING_HEADER,
                format!("malformed routing header: '{routing_value}'"),
            );
        };
        // avoid infinite route loops
        if key == target {
            continue;
        }
        if host == key {
            if target.contains(':') {
                return Ok(target.to_string());
            }
            return Ok(format!("{target}:80"));
        }
    }
    Ok(original_dst.to_string())
}

/// Look up the routing value for a request: configured cookie first (when
/// enabled), then the routing header, then the routing context cache under
/// the request-id. A value recovered from the cache is re-applied onto the
/// request as the routing header so further hops see it too.
pub(crate) fn routing_value(
    req: &mut RequestHeader,
    conf: &HttpConfig,
    routing_contexts: &Arc<TtlCache<String, String>>,
) -> Option<String> {
    if conf.routing_cookie_enabled {
        if let Some(value) = req.cookie(&conf.routing_cookie_name) {
            return Some(value.to_string());
        }
    }
    if let Some(value) = req
        .headers
        .get(&conf.routing_header_name)
        .and_then(|v| v.to_str().ok())
    {
        return Some(value.to_string());
    }
    let request_id = req
        .headers
        .get(&conf.request_id_header_name)
        .and_then(|v| v.to_str().ok())?
        .to_string();
    let value = routing_contexts.get(&request_id)?;
    let _ = req.append_header(conf.routing_header_name.clone(), value.as_str());
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_port_defaulting() {
        let dst = routing_destination("svc=canary,other=z:8080", "svc", "10.0.0.1:80").unwrap();
        assert_eq!(dst, "canary:80");
    }

    #[test]
    fn test_explicit_port() {
        let dst = routing_destination("svc=canary,other=z:8080", "other", "10.0.0.1:80").unwrap();
        assert_eq!(dst, "z:8080");
    }

    #[test]
    fn test_passthrough() {
        let dst = routing_destination("foo=bar", "baz", "10.0.0.1:80").unwrap();
        assert_eq!(dst, "10.0.0.1:80");
    }

    #[test]
    fn test_malformed() {
        let err = routing_destination("foo", "foo", "x:1").unwrap_err();
        assert_eq!(err.etype(), &MALFORMED_ROUTING_HEADER);
        assert!(err.to_string().contains("malformed routing header: 'foo'"));
    }

    #[test]
    fn test_self_loop_guard() {
        let dst = routing_destination("a=a,b=c:9", "a", "o:1").unwrap();
        assert_eq!(dst, "o:1");
    }

    #[test]
    fn test_idempotent() {
        let first = routing_destination("svc=canary", "svc", "10.0.0.1:80").unwrap();
        let second = routing_destination("svc=canary", "svc", "10.0.0.1:80").unwrap();
        assert_eq!(first, second);
    }

    fn test_conf() -> HttpConfig {
        HttpConfig {
            routing_enabled: true,
            routing_cookie_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_value_precedence_cookie_first() {
        let conf = test_conf();
        let cache = Arc::new(TtlCache::new(16, Duration::from_secs(10)));
        let mut req = RequestHeader::build("GET", b"/", None).unwrap();
        req.insert_header("Cookie", "x-route=svc=cookie").unwrap();
        req.insert_header("X-Route", "svc=header").unwrap();
        assert_eq!(
            routing_value(&mut req, &conf, &cache).as_deref(),
            Some("svc=cookie")
        );
    }

    #[test]
    fn test_value_from_header() {
        let conf = test_conf();
        let cache = Arc::new(TtlCache::new(16, Duration::from_secs(10)));
        let mut req = RequestHeader::build("GET", b"/", None).unwrap();
        req.insert_header("X-Route", "svc=header").unwrap();
        assert_eq!(
            routing_value(&mut req, &conf, &cache).as_deref(),
            Some("svc=header")
        );
    }

    #[test]
    fn test_value_from_cache_reapplies_header() {
        let conf = test_conf();
        let cache = Arc::new(TtlCache::new(16, Duration::from_secs(10)));
        cache.put(&"rid-1".to_string(), "svc=cached".to_string());
        let mut req = RequestHeader::build("GET", b"/", None).unwrap();
        req.insert_header("X-Request-Id", "rid-1").unwrap();
        assert_eq!(
            routing_value(&mut req, &conf, &cache).as_deref(),
            Some("svc=cached")
        );
        // the recovered value is now carried on the request itself
        assert_eq!(
            req.headers.get("X-Route").unwrap().to_str().unwrap(),
            "svc=cached"
        );
    }

    #[test]
    fn test_no_value() {
        let conf = test_conf();
        let cache = Arc::new(TtlCache::new(16, Duration::from_secs(10)));
        let mut req = RequestHeader::build("GET", b"/", None).unwrap();
        assert_eq!(routing_value(&mut req, &conf, &cache), None);
    }
}
