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

//! HTTP/1.x request framing
//!
//! One [RequestReader] per request pipeline. It parses request heads off a
//! raw stream while mirroring the consumed bytes into the pipeline's tee
//! buffer, then delimits the message body. Bytes that belong to the next
//! pipelined request are carried over to the following iteration.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::Version;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};
use wiremesh_error::{Error, ErrorType::*, OrErr, Result};
use wiremesh_http::RequestHeader;

use super::body::{BodyReader, BodyWriter};
use super::common::*;
use crate::protocols::tee::TeeWriter;
use crate::utils::{BufRef, KVRef};

pub struct RequestReader {
    /// The buf that holds the raw request header + possibly a portion of the
    /// request body, which can arrive with the same read().
    buf: Bytes,
    /// A slice reference to `buf` which points to the exact range of the request header
    raw_header: Option<BufRef>,
    /// A slice reference to `buf` which points to the range of a portion of the body if any
    preread_body: Option<BufRef>,
    /// A state machine to track how to read the request body
    body_reader: BodyReader,
    /// The parsed request header
    request_header: Option<Box<RequestHeader>>,
    /// Bytes read past the previous message, to be consumed before the stream
    carry: BytesMut,
}

impl RequestReader {
    pub fn new() -> Self {
        RequestReader {
            buf: Bytes::new(),
            raw_header: None,
            preread_body: None,
            body_reader: BodyReader::new(),
            request_header: None,
            carry: BytesMut::new(),
        }
    }

    /// Bytes held over from the previous message. The pipeline mirrors them
    /// into its tee buffer when it arms it, so a fall-through replays them.
    pub fn carry(&self) -> &[u8] {
        &self.carry
    }

    /// Read one request header off the stream. Return `Ok(Some(n))` with the
    /// header size when read and parsing are successful. Return `Ok(None)`
    /// when the peer closed the connection without sending anything, which is
    /// common on a reused connection.
    ///
    /// Every byte read from `stream` is mirrored into `tee`.
    pub async fn read_request<S>(
        &mut self,
        stream: &mut S,
        tee: &mut TeeWriter,
    ) -> Result<Option<usize>>
    where
        S: AsyncRead + Unpin + Send,
    {
        const MAX_ERR_BUF_LEN: usize = 2048;

        self.buf = Bytes::new();
        self.raw_header = None;
        self.preread_body = None;
        self.request_header = None;

        let mut buf = BytesMut::with_capacity(INIT_HEADER_BUF_SIZE);
        if !self.carry.is_empty() {
            buf.extend_from_slice(&self.carry);
            self.carry.clear();
        }
        let mut already_read: usize = buf.len();
        loop {
            if already_read > 0 {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut req = httparse::Request::new(&mut headers);
                match parse_req_buffer(&mut req, &buf) {
                    HeaderParseState::Complete(s) => {
                        self.raw_header = Some(BufRef(0, s));
                        self.preread_body = Some(BufRef(s, already_read));

                        // The header names and values are picked up as 0 copy Bytes
                        // referencing the original buf. `req` borrows `buf`, so the
                        // offsets are recorded first, `req` dropped, and the buf frozen.
                        let base = buf.as_ptr() as usize;
                        let mut header_refs = Vec::<KVRef>::with_capacity(req.headers.len());
                        let _num_headers = populate_headers(base, &mut header_refs, req.headers);

                        let mut request_header = Box::new(RequestHeader::build(
                            req.method.unwrap_or(""),
                            req.path.unwrap_or("").as_bytes(),
                            Some(req.headers.len()),
                        )?);

                        request_header.set_version(match req.version {
                            Some(1) => Version::HTTP_11,
                            Some(0) => Version::HTTP_10,
                            _ => Version::HTTP_09,
                        });

                        let buf = buf.freeze();

                        for header in header_refs {
                            // the name keeps the exact spelling the peer sent
                            let header_name = header.get_name_bytes(&buf);
                            let value_bytes = header.get_value_bytes(&buf);
                            // safe because this is from what we parsed
                            let header_value = unsafe {
                                http::HeaderValue::from_maybe_shared_unchecked(value_bytes)
                            };

                            request_header
                                .append_header(header_name, header_value)
                                .or_err(InvalidHTTPHeader, "while parsing request header")?;
                        }

                        let contains_transfer_encoding =
                            request_header.headers.contains_key(TRANSFER_ENCODING);
                        let contains_content_length =
                            request_header.headers.contains_key(CONTENT_LENGTH);

                        // Transfer encoding overrides content length, so when
                        // both are present content length is dropped, per
                        // https://datatracker.ietf.org/doc/html/rfc9112#section-6.3
                        if contains_content_length && contains_transfer_encoding {
                            request_header.remove_header(&CONTENT_LENGTH);
                        }

                        check_dup_content_length(&request_header.headers)?;

                        self.buf = buf;
                        self.request_header = Some(request_header);
                        self.body_reader.reinit();

                        return Ok(Some(s));
                    }
                    HeaderParseState::Partial => { /* continue the read loop */ }
                    HeaderParseState::Invalid(e) => {
                        buf.truncate(MAX_ERR_BUF_LEN);
                        return Error::e_because(
                            InvalidHTTPHeader,
                            format!("buf: {}", String::from_utf8_lossy(&buf).escape_default()),
                            e,
                        );
                    }
                }
            }

            if already_read > MAX_HEADER_SIZE {
                /* NOTE: this check only blocks the next read. The first large read is
                allowed since the buf is already allocated. The goal is to avoid slowly
                bloating this buffer */
                return Error::e_explain(
                    InvalidHTTPHeader,
                    format!("Request header larger than {MAX_HEADER_SIZE}"),
                );
            }

            let read_start = buf.len();
            let n = match stream.read_buf(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    if already_read > 0 {
                        return Error::e_because(ReadError, "while reading request headers", e);
                    }
                    /* nothing harmful since nothing was read yet */
                    debug!("Read error on an idle connection: {e}");
                    return Ok(None);
                }
            };
            if n == 0 {
                if already_read > 0 {
                    return Error::e_explain(
                        ConnectionClosed,
                        format!(
                            "while reading request headers, bytes already read: {}",
                            already_read
                        ),
                    );
                }
                /* common when client decides to close a keepalived session */
                debug!("Client prematurely closed connection with 0 byte sent");
                return Ok(None);
            }
            tee.write(&buf[read_start..]);
            already_read += n;
        }
    }

    /// Return a reference of the `RequestHeader` this reader read
    /// # Panics
    /// this function will panic if called before a successful [Self::read_request()]
    pub fn req_header(&self) -> &RequestHeader {
        self.request_header
            .as_ref()
            .expect("Request header is not read yet")
    }

    /// Return a mutable reference of the `RequestHeader` this reader read
    /// # Panics
    /// this function will panic if called before a successful [Self::read_request()]
    pub fn req_header_mut(&mut self) -> &mut RequestHeader {
        self.request_header
            .as_mut()
            .expect("Request header is not read yet")
    }

    /// Hand the parsed header over to the caller. [Self::init_body()] must be
    /// called first since the body framing is derived from the header.
    pub fn take_header(&mut self) -> Box<RequestHeader> {
        self.request_header
            .take()
            .expect("Request header is not read yet")
    }

    /// Initialize the body reader from the parsed header and the bytes that
    /// were preread together with it.
    pub fn init_body(&mut self) {
        let preread = self
            .preread_body
            .as_ref()
            .map_or(&b""[..], |r| r.get(&self.buf));
        let req = self.req_header();
        if is_header_value_chunked_encoding(req.headers.get(TRANSFER_ENCODING)) {
            // transfer-encoding takes priority over content-length
            self.body_reader.init_chunked(preread);
        } else if let Some(cl) = header_value_content_length(req.headers.get(CONTENT_LENGTH)) {
            self.body_reader.init_content_length(cl, preread);
        } else {
            // a request without content-length nor chunked encoding has no body
            self.body_reader.init_content_length(0, preread);
        }
    }

    pub async fn read_body<S>(&mut self, stream: &mut S) -> Result<Option<BufRef>>
    where
        S: AsyncRead + Unpin + Send,
    {
        self.body_reader.read_body(stream).await
    }

    pub fn get_body(&self, buf_ref: &BufRef) -> &[u8] {
        self.body_reader.get_body(buf_ref)
    }

    pub fn body_done(&self) -> bool {
        self.body_reader.body_done()
    }

    pub fn trailers(&self) -> &[u8] {
        self.body_reader.trailers()
    }

    /// Wrap up the current message: any bytes read past its end become the
    /// carry for the next one.
    pub fn finish_message(&mut self) {
        if let Some(overread) = self.body_reader.take_overread() {
            self.carry = overread;
        }
    }
}

impl Default for RequestReader {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn parse_req_buffer<'buf>(
    req: &mut httparse::Request<'_, 'buf>,
    buf: &'buf [u8],
) -> HeaderParseState {
    let res = match req.parse(buf) {
        Ok(s) => s,
        Err(e) => {
            return HeaderParseState::Invalid(e);
        }
    };
    match res {
        httparse::Status::Complete(s) => HeaderParseState::Complete(s),
        _ => HeaderParseState::Partial,
    }
}

/// Serialize the request head into `buf` in HTTP/1.x wire format, header
/// name case preserved.
pub fn http_req_header_to_buf(req: &RequestHeader, buf: &mut BytesMut) -> Result<()> {
    // Request-Line
    let method = req.method.as_str().as_bytes();
    buf.put_slice(method);
    buf.put_u8(b' ');
    buf.put_slice(req.raw_path());
    buf.put_u8(b' ');

    let version = match req.version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        _ => {
            return Error::e_explain(InvalidHTTPHeader, "unsupported HTTP version");
        }
    };
    buf.put_slice(version.as_bytes());
    buf.put_slice(CRLF);

    // headers
    req.header_to_h1_wire(buf);
    buf.put_slice(CRLF);
    Ok(())
}

/// Initialize the writer that re-serializes this request, mirroring the
/// framing the body reader selected.
pub fn init_req_body_writer(req: &RequestHeader, writer: &mut BodyWriter) {
    if is_header_value_chunked_encoding(req.headers.get(TRANSFER_ENCODING)) {
        writer.init_chunked();
    } else if let Some(cl) = header_value_content_length(req.headers.get(CONTENT_LENGTH)) {
        writer.init_content_length(cl);
    } else {
        writer.init_content_length(0);
    }
}

/// Return a string `$METHOD $PATH, Host: $HOST`. Mostly for logging and debug purpose
pub fn request_summary(req: &RequestHeader) -> String {
    format!(
        "{} {}, Host: {}",
        req.method.as_str(),
        String::from_utf8_lossy(req.raw_path()),
        req.host()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[tokio::test]
    async fn read_basic() {
        init_log();
        let input = b"GET / HTTP/1.1\r\n\r\n";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut reader = RequestReader::new();
        let mut tee = TeeWriter::new();
        tee.start();
        let res = reader.read_request(&mut mock_io, &mut tee).await;
        assert_eq!(input.len(), res.unwrap().unwrap());
        assert_eq!(0, reader.req_header().headers.len());
        assert_eq!(reader.req_header().method, http::Method::GET);
        assert_eq!(tee.bytes(), input);
    }

    #[tokio::test]
    async fn read_2_buf() {
        init_log();
        let input1 = b"GET / HTTP/1.1\r\n";
        let input2 = b"Host: wiremesh.example\r\n\r\n";
        let mut mock_io = Builder::new().read(&input1[..]).read(&input2[..]).build();
        let mut reader = RequestReader::new();
        let mut tee = TeeWriter::new();
        tee.start();
        let res = reader.read_request(&mut mock_io, &mut tee).await;
        assert_eq!(input1.len() + input2.len(), res.unwrap().unwrap());
        assert_eq!(reader.req_header().host(), "wiremesh.example");
        assert_eq!(
            tee.bytes(),
            [&input1[..], &input2[..]].concat().as_slice()
        );
    }

    #[tokio::test]
    async fn read_with_body() {
        init_log();
        let input = b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut reader = RequestReader::new();
        let mut tee = TeeWriter::new();
        tee.start();
        reader
            .read_request(&mut mock_io, &mut tee)
            .await
            .unwrap()
            .unwrap();
        tee.stop();
        reader.init_body();
        let res = reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(reader.get_body(&res), b"abc");
        assert!(reader.body_done());
    }

    #[tokio::test]
    async fn read_pipelined_carry() {
        init_log();
        // the second request arrives in the same read as the first body
        let input = b"POST / HTTP/1.1\r\nContent-Length: 1\r\n\r\nxGET /2 HTTP/1.1\r\n\r\n";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut reader = RequestReader::new();
        let mut tee = TeeWriter::new();
        tee.start();
        reader
            .read_request(&mut mock_io, &mut tee)
            .await
            .unwrap()
            .unwrap();
        tee.stop();
        reader.init_body();
        let res = reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(reader.get_body(&res), b"x");
        reader.finish_message();
        assert_eq!(reader.carry(), b"GET /2 HTTP/1.1\r\n\r\n");

        tee.start();
        tee.write(reader.carry());
        let res = reader.read_request(&mut mock_io, &mut tee).await;
        assert!(res.unwrap().is_some());
        assert_eq!(reader.req_header().raw_path(), b"/2");
    }

    #[tokio::test]
    async fn read_invalid() {
        init_log();
        let input = b"GET / HTP/42\r\n\r\n";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut reader = RequestReader::new();
        let mut tee = TeeWriter::new();
        tee.start();
        let res = reader.read_request(&mut mock_io, &mut tee).await;
        assert_eq!(&InvalidHTTPHeader, res.unwrap_err().etype());
        // everything consumed is in the tee for the fall-through
        assert_eq!(tee.bytes(), input);
    }

    #[tokio::test]
    async fn read_closed() {
        init_log();
        let input = b"";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut reader = RequestReader::new();
        let mut tee = TeeWriter::new();
        tee.start();
        let res = reader.read_request(&mut mock_io, &mut tee).await;
        assert!(res.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_partial_then_closed() {
        init_log();
        let input1 = b"GET / HTTP/1.1\r\n";
        let input2 = b"";
        let mut mock_io = Builder::new().read(&input1[..]).read(&input2[..]).build();
        let mut reader = RequestReader::new();
        let mut tee = TeeWriter::new();
        tee.start();
        let res = reader.read_request(&mut mock_io, &mut tee).await;
        assert_eq!(&ConnectionClosed, res.unwrap_err().etype());
        assert_eq!(tee.bytes(), input1);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut req = RequestHeader::build("GET", b"/path?q=1", None).unwrap();
        req.insert_header("Host", "svc").unwrap();
        req.insert_header("X-CuStOm", "v").unwrap();
        let mut buf = BytesMut::new();
        http_req_header_to_buf(&req, &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &b"GET /path?q=1 HTTP/1.1\r\nHost: svc\r\nX-CuStOm: v\r\n\r\n"[..]
        );
    }

    #[test]
    fn test_request_summary() {
        let mut req = RequestHeader::build("GET", b"/p", None).unwrap();
        req.insert_header("Host", "h").unwrap();
        assert_eq!(request_summary(&req), "GET /p, Host: h");
    }
}
