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

//! HTTP/1.x response framing
//!
//! The response side mirror of [super::request]: one [ResponseReader] per
//! response pipeline, parsing response heads while mirroring consumed bytes
//! into the tee, with carry-over of bytes that belong to the next response.
//! Responses are parsed without knowledge of the request they answer; the
//! HEAD special case is applied by the pipeline after pairing.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::Version;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};
use wiremesh_error::{Error, ErrorType::*, OrErr, Result};
use wiremesh_http::ResponseHeader;

use super::body::{BodyReader, BodyWriter};
use super::common::*;
use crate::protocols::tee::TeeWriter;
use crate::utils::{BufRef, KVRef};

pub struct ResponseReader {
    buf: Bytes,
    raw_header: Option<BufRef>,
    preread_body: Option<BufRef>,
    body_reader: BodyReader,
    response_header: Option<Box<ResponseHeader>>,
    carry: BytesMut,
}

impl ResponseReader {
    pub fn new() -> Self {
        ResponseReader {
            buf: Bytes::new(),
            raw_header: None,
            preread_body: None,
            body_reader: BodyReader::new(),
            response_header: None,
            carry: BytesMut::new(),
        }
    }

    /// Bytes held over from the previous message.
    pub fn carry(&self) -> &[u8] {
        &self.carry
    }

    /// Read one response header off the stream. Return `Ok(Some(n))` on
    /// success, `Ok(None)` when the upstream closed without sending anything.
    ///
    /// Every byte read from `stream` is mirrored into `tee`.
    pub async fn read_response<S>(
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
        self.response_header = None;

        let mut buf = BytesMut::with_capacity(INIT_HEADER_BUF_SIZE);
        if !self.carry.is_empty() {
            buf.extend_from_slice(&self.carry);
            self.carry.clear();
        }
        let mut already_read: usize = buf.len();
        loop {
            if already_read > 0 {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut resp = httparse::Response::new(&mut headers);
                match parse_resp_buffer(&mut resp, &buf) {
                    HeaderParseState::Complete(s) => {
                        self.raw_header = Some(BufRef(0, s));
                        self.preread_body = Some(BufRef(s, already_read));

                        let base = buf.as_ptr() as usize;
                        let mut header_refs = Vec::<KVRef>::with_capacity(resp.headers.len());
                        let _num_headers = populate_headers(base, &mut header_refs, resp.headers);

                        let mut response_header = Box::new(ResponseHeader::build(
                            resp.code.unwrap_or(200),
                            Some(resp.headers.len()),
                        )?);

                        response_header.set_version(match resp.version {
                            Some(1) => Version::HTTP_11,
                            Some(0) => Version::HTTP_10,
                            _ => Version::HTTP_09,
                        });

                        response_header.set_reason_phrase(resp.reason)?;

                        let buf = buf.freeze();

                        for header in header_refs {
                            // the name keeps the exact spelling the peer sent
                            let header_name = header.get_name_bytes(&buf);
                            let value_bytes = header.get_value_bytes(&buf);
                            // safe because this is from what we parsed
                            let header_value = unsafe {
                                http::HeaderValue::from_maybe_shared_unchecked(value_bytes)
                            };
                            response_header
                                .append_header(header_name, header_value)
                                .or_err(InvalidHTTPHeader, "while parsing response header")?;
                        }

                        let contains_transfer_encoding =
                            response_header.headers.contains_key(TRANSFER_ENCODING);
                        let contains_content_length =
                            response_header.headers.contains_key(CONTENT_LENGTH);
                        if contains_content_length && contains_transfer_encoding {
                            response_header.remove_header(&CONTENT_LENGTH);
                        }

                        check_dup_content_length(&response_header.headers)?;

                        self.buf = buf;
                        self.response_header = Some(response_header);
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
                return Error::e_explain(
                    InvalidHTTPHeader,
                    format!("Response header larger than {MAX_HEADER_SIZE}"),
                );
            }

            let read_start = buf.len();
            let n = match stream.read_buf(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    if already_read > 0 {
                        return Error::e_because(ReadError, "while reading response headers", e);
                    }
                    debug!("Read error on an idle connection: {e}");
                    return Ok(None);
                }
            };
            if n == 0 {
                if already_read > 0 {
                    return Error::e_explain(
                        ConnectionClosed,
                        format!(
                            "while reading response headers, bytes already read: {}",
                            already_read
                        ),
                    );
                }
                debug!("Upstream closed the connection without a response");
                return Ok(None);
            }
            tee.write(&buf[read_start..]);
            already_read += n;
        }
    }

    /// Return a reference of the `ResponseHeader` this reader read
    /// # Panics
    /// this function will panic if called before a successful [Self::read_response()]
    pub fn resp_header(&self) -> &ResponseHeader {
        self.response_header
            .as_ref()
            .expect("Response header is not read yet")
    }

    /// Hand the parsed header over to the caller. [Self::init_body()] must be
    /// called first since the body framing is derived from the header.
    pub fn take_header(&mut self) -> Box<ResponseHeader> {
        self.response_header
            .take()
            .expect("Response header is not read yet")
    }

    /// Initialize the body reader from the parsed header, the response status
    /// and whether the request this response answers was a HEAD.
    ///
    /// Responses to HEAD and responses with 1xx/204/304 status carry no body
    /// regardless of their headers.
    pub fn init_body(&mut self, head_request: bool) {
        let preread = self
            .preread_body
            .as_ref()
            .map_or(&b""[..], |r| r.get(&self.buf));
        let resp = self.resp_header();
        let status = resp.status.as_u16();
        if head_request || (100..200).contains(&status) || status == 204 || status == 304 {
            self.body_reader.init_content_length(0, preread);
        } else if is_header_value_chunked_encoding(resp.headers.get(TRANSFER_ENCODING)) {
            self.body_reader.init_chunked(preread);
        } else if let Some(cl) = header_value_content_length(resp.headers.get(CONTENT_LENGTH)) {
            self.body_reader.init_content_length(cl, preread);
        } else {
            // no framing given, the body lasts until the connection closes
            self.body_reader.init_http10(preread);
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

impl Default for ResponseReader {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn parse_resp_buffer<'buf>(
    resp: &mut httparse::Response<'_, 'buf>,
    buf: &'buf [u8],
) -> HeaderParseState {
    let mut parser = httparse::ParserConfig::default();
    parser.allow_spaces_after_header_name_in_responses(true);
    let res = match parser.parse_response(resp, buf) {
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

/// Serialize the response head into `buf` in HTTP/1.x wire format, header
/// name case and reason phrase preserved.
pub fn http_resp_header_to_buf(resp: &ResponseHeader, buf: &mut BytesMut) -> Result<()> {
    // Status-Line
    let version = match resp.version {
        Version::HTTP_09 => "HTTP/0.9 ",
        Version::HTTP_10 => "HTTP/1.0 ",
        Version::HTTP_11 => "HTTP/1.1 ",
        _ => {
            return Error::e_explain(InvalidHTTPHeader, "unsupported HTTP version");
        }
    };
    buf.put_slice(version.as_bytes());
    let status = resp.status;
    buf.put_slice(status.as_str().as_bytes());
    buf.put_u8(b' ');
    if let Some(reason) = resp.get_reason_phrase() {
        buf.put_slice(reason.as_bytes());
    }
    buf.put_slice(CRLF);

    // headers
    resp.header_to_h1_wire(buf);
    buf.put_slice(CRLF);
    Ok(())
}

/// Initialize the writer that re-serializes this response, mirroring the
/// framing the body reader selected.
pub fn init_resp_body_writer(resp: &ResponseHeader, head_request: bool, writer: &mut BodyWriter) {
    let status = resp.status.as_u16();
    if head_request || (100..200).contains(&status) || status == 204 || status == 304 {
        writer.init_content_length(0);
    } else if is_header_value_chunked_encoding(resp.headers.get(TRANSFER_ENCODING)) {
        writer.init_chunked();
    } else if let Some(cl) = header_value_content_length(resp.headers.get(CONTENT_LENGTH)) {
        writer.init_content_length(cl);
    } else {
        writer.init_http10();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::http::v1::body::ParseState;
    use tokio_test::io::Builder;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[tokio::test]
    async fn read_basic_response() {
        init_log();
        let input = b"HTTP/1.1 200 OK\r\n\r\n";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut reader = ResponseReader::new();
        let mut tee = TeeWriter::new();
        tee.start();
        let res = reader.read_response(&mut mock_io, &mut tee).await;
        assert_eq!(input.len(), res.unwrap().unwrap());
        assert_eq!(0, reader.resp_header().headers.len());
        assert_eq!(reader.resp_header().status, 200);
        assert_eq!(tee.bytes(), input);
    }

    #[tokio::test]
    async fn read_response_custom_reason() {
        init_log();
        let input = b"HTTP/1.1 200 Just Fine\r\n\r\n";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut reader = ResponseReader::new();
        let mut tee = TeeWriter::new();
        tee.start();
        reader
            .read_response(&mut mock_io, &mut tee)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reader.resp_header().get_reason_phrase(), Some("Just Fine"));

        let mut buf = BytesMut::new();
        http_resp_header_to_buf(reader.resp_header(), &mut buf).unwrap();
        assert_eq!(&buf[..], &b"HTTP/1.1 200 Just Fine\r\n\r\n"[..]);
    }

    #[tokio::test]
    async fn read_response_default_body_until_closed() {
        init_log();
        let input_header = b"HTTP/1.1 200 OK\r\n\r\n";
        let input_body = b"abc";
        let input_close = b""; // simulating close
        let mut mock_io = Builder::new()
            .read(&input_header[..])
            .read(&input_body[..])
            .read(&input_close[..])
            .build();
        let mut reader = ResponseReader::new();
        let mut tee = TeeWriter::new();
        tee.start();
        reader
            .read_response(&mut mock_io, &mut tee)
            .await
            .unwrap()
            .unwrap();
        tee.stop();
        reader.init_body(false);
        let res = reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(reader.get_body(&res), input_body);
        let res = reader.read_body(&mut mock_io).await.unwrap();
        assert_eq!(res, None);
        assert!(reader.body_done());
    }

    #[tokio::test]
    async fn read_response_chunked() {
        init_log();
        let input = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut reader = ResponseReader::new();
        let mut tee = TeeWriter::new();
        tee.start();
        reader
            .read_response(&mut mock_io, &mut tee)
            .await
            .unwrap()
            .unwrap();
        tee.stop();
        reader.init_body(false);
        let res = reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(reader.get_body(&res), b"abc");
        let res = reader.read_body(&mut mock_io).await.unwrap();
        assert_eq!(res, None);
    }

    #[tokio::test]
    async fn read_response_head_skips_body() {
        init_log();
        // a HEAD response advertises a body it will never send
        let input = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut reader = ResponseReader::new();
        let mut tee = TeeWriter::new();
        tee.start();
        reader
            .read_response(&mut mock_io, &mut tee)
            .await
            .unwrap()
            .unwrap();
        tee.stop();
        reader.init_body(true);
        assert_eq!(reader.body_reader.body_state, ParseState::Complete(0));
        let res = reader.read_body(&mut mock_io).await.unwrap();
        assert_eq!(res, None);
    }

    #[tokio::test]
    async fn read_100_then_200_uses_carry() {
        init_log();
        let input = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut reader = ResponseReader::new();
        let mut tee = TeeWriter::new();
        tee.start();
        reader
            .read_response(&mut mock_io, &mut tee)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reader.resp_header().status, 100);
        tee.stop();
        reader.init_body(false);
        let res = reader.read_body(&mut mock_io).await.unwrap();
        assert_eq!(res, None);
        reader.finish_message();
        assert!(!reader.carry().is_empty());

        tee.start();
        tee.write(reader.carry());
        reader
            .read_response(&mut mock_io, &mut tee)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reader.resp_header().status, 200);
    }
}
