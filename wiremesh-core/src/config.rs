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

//! The HTTP engine configuration
//!
//! The configuration is a plain YAML file. Unknown keys are ignored so new
//! keys can be added without breaking older deployments.

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;
use wiremesh_error::{Error, ErrorType::*, OrErr, Result};

/// The configuration of the HTTP protocol engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// The header carrying the request correlation id. A fresh UUIDv4 is
    /// synthesized when the header is missing.
    pub request_id_header_name: String,
    /// Master switch for destination rewriting and the dialer channel
    /// protocol. When off, the pipelines forward to the connection they were
    /// given and never talk to a dialer.
    pub routing_enabled: bool,
    /// The header consulted for the routing value.
    pub routing_header_name: String,
    /// Whether the routing value may also come from a cookie.
    pub routing_cookie_enabled: bool,
    /// The cookie consulted when `routing_cookie_enabled` is set.
    pub routing_cookie_name: String,
    /// Header name to span tag name mappings applied on inbound root spans.
    pub headers_map: HashMap<String, String>,
    /// Cookie name to span tag name mappings applied on inbound root spans.
    pub cookies_map: HashMap<String, String>,
    /// The header decorating outbound requests with the caller's identity.
    pub x_source_header_name: String,
    /// The value set under `x_source_header_name` when absent.
    pub x_source_value: String,
    /// How long an inbound request's span context stays available to the
    /// outbound sibling, in seconds.
    pub tracing_context_expiration_sec: u64,
    /// How long an inbound request's routing value stays available to the
    /// outbound sibling, in seconds.
    pub routing_context_expiration_sec: u64,
    /// Capacity of the tracing context cache, in entries.
    pub tracing_context_capacity: usize,
    /// Capacity of the routing context cache, in entries.
    pub routing_context_capacity: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            request_id_header_name: "X-Request-Id".to_string(),
            routing_enabled: false,
            routing_header_name: "X-Route".to_string(),
            routing_cookie_enabled: false,
            routing_cookie_name: "x-route".to_string(),
            headers_map: HashMap::new(),
            cookies_map: HashMap::new(),
            x_source_header_name: "X-Source".to_string(),
            x_source_value: "wiremesh".to_string(),
            tracing_context_expiration_sec: 30,
            routing_context_expiration_sec: 30,
            tracing_context_capacity: 8192,
            routing_context_capacity: 8192,
        }
    }
}

impl HttpConfig {
    /// Load the configuration from the given YAML file.
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    /// Parse the configuration from a YAML string.
    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: HttpConfig = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;
        trace!("Loaded conf: {conf:?}");
        conf.validate()
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap()
    }

    fn validate(self) -> Result<Self> {
        if self.request_id_header_name.is_empty() {
            return Error::e_explain(InternalError, "request_id_header_name must not be empty");
        }
        if self.routing_enabled && self.routing_header_name.is_empty() {
            return Error::e_explain(
                InternalError,
                "routing_header_name must not be empty when routing is enabled",
            );
        }
        Ok(self)
    }

    pub fn tracing_context_ttl(&self) -> Duration {
        Duration::from_secs(self.tracing_context_expiration_sec)
    }

    pub fn routing_context_ttl(&self) -> Duration {
        Duration::from_secs(self.routing_context_expiration_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn not_a_test_i_cannot_write_yaml_by_hand() {
        init_log();
        let conf = HttpConfig::default();
        println!("{}", conf.to_yaml());
    }

    #[test]
    fn test_load_file() {
        init_log();
        let conf_str = r#"
---
routing_enabled: true
routing_header_name: X-Canary-Route
routing_cookie_enabled: true
headers_map:
  X-Tenant: tenant
        "#
        .to_string();
        let conf = HttpConfig::from_yaml(&conf_str).unwrap();
        assert!(conf.routing_enabled);
        assert!(conf.routing_cookie_enabled);
        assert_eq!(conf.routing_header_name, "X-Canary-Route");
        assert_eq!(conf.headers_map.get("X-Tenant").unwrap(), "tenant");
        // untouched keys keep their defaults
        assert_eq!(conf.request_id_header_name, "X-Request-Id");
    }

    #[test]
    fn test_unknown_keys_ignored() {
        init_log();
        let conf_str = r#"
---
routing_enabled: true
not_a_real_key: 1
        "#
        .to_string();
        let conf = HttpConfig::from_yaml(&conf_str).unwrap();
        assert!(conf.routing_enabled);
    }

    #[test]
    fn test_invalid() {
        init_log();
        let conf_str = r#"
---
request_id_header_name: ""
        "#
        .to_string();
        assert!(HttpConfig::from_yaml(&conf_str).is_err());
    }
}
