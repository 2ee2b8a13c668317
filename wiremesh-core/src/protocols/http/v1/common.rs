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

//! Common functions and constants

use http::header;
use log::warn;
use std::str;
use wiremesh_error::{Error, ErrorType::*, Result};
use wiremesh_http::HMap;

use crate::utils::KVRef;

pub(crate) const MAX_HEADERS: usize = 256;

pub(crate) const INIT_HEADER_BUF_SIZE: usize = 4096;
pub(crate) const MAX_HEADER_SIZE: usize = 1048575;

pub const CRLF: &[u8; 2] = b"\r\n";

pub(crate) enum HeaderParseState {
    Complete(usize),
    Partial,
    Invalid(httparse::Error),
}

/// Whether the message headers mark the connection as upgraded to another
/// protocol. Only the `Connection: upgrade` form counts; token lists like
/// `Connection: keep-alive, upgrade` are left to the peers to negotiate and
/// will fail the framing of whatever follows, which is also safe.
pub(crate) fn is_connection_upgrade(headers: &HMap) -> bool {
    headers
        .get(header::CONNECTION)
        .map_or(false, |v| v.as_bytes().eq_ignore_ascii_case(b"upgrade"))
}

#[inline]
pub(crate) fn is_header_value_chunked_encoding(
    header_value: Option<&http::header::HeaderValue>,
) -> bool {
    match header_value {
        Some(value) => value.as_bytes().eq_ignore_ascii_case(b"chunked"),
        None => false,
    }
}

#[inline]
pub fn header_value_content_length(
    header_value: Option<&http::header::HeaderValue>,
) -> Option<usize> {
    match header_value {
        Some(value) => buf_to_content_length(Some(value.as_bytes())),
        None => None,
    }
}

#[inline]
pub(crate) fn buf_to_content_length(header_value: Option<&[u8]>) -> Option<usize> {
    match header_value {
        Some(buf) => {
            match str::from_utf8(buf) {
                // check valid string
                Ok(str_cl_value) => match str_cl_value.parse::<i64>() {
                    Ok(cl_length) => {
                        if cl_length >= 0 {
                            Some(cl_length as usize)
                        } else {
                            warn!("negative content-length header value {cl_length}");
                            None
                        }
                    }
                    Err(_) => {
                        warn!("invalid content-length header value {str_cl_value}");
                        None
                    }
                },
                Err(_) => {
                    warn!("invalid content-length header encoding");
                    None
                }
            }
        }
        None => None,
    }
}

/// The content length as reported by the headers, `-1` when absent or
/// unparsable. Used for span tagging where the size may legitimately be
/// unknown (chunked messages).
pub(crate) fn content_length_or_neg(headers: &HMap) -> i64 {
    match header_value_content_length(headers.get(header::CONTENT_LENGTH)) {
        Some(cl) => cl as i64,
        None => -1,
    }
}

/// Reject messages carrying multiple differing `Content-Length` values,
/// per RFC 9112 section 6.3.
pub(crate) fn check_dup_content_length(headers: &HMap) -> Result<()> {
    let mut values = headers.get_all(header::CONTENT_LENGTH).iter();
    let Some(first) = values.next() else {
        return Ok(());
    };
    for value in values {
        if value != first {
            return Error::e_explain(
                InvalidHTTPHeader,
                "conflicting Content-Length headers",
            );
        }
    }
    Ok(())
}

#[inline]
pub(crate) fn populate_headers(
    base: usize,
    header_ref: &mut Vec<KVRef>,
    headers: &[httparse::Header],
) -> usize {
    let mut used_header_index = 0;
    for header in headers.iter() {
        if !header.name.is_empty() {
            header_ref.push(KVRef::new(
                header.name.as_ptr() as usize - base,
                header.name.len(),
                header.value.as_ptr() as usize - base,
                header.value.len(),
            ));
            used_header_index += 1;
        }
    }
    used_header_index
}
