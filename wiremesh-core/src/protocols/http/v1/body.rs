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

//! HTTP/1.x body reading and writing state machines
//!
//! The reader delimits one message body off a raw stream: fixed
//! content-length, chunked (with the raw trailer section captured for
//! replay) or read-until-close for HTTP/1.0 style responses. Bytes read
//! past the end of the message belong to the next pipelined message and are
//! handed back through [BodyReader::take_overread()].

use bytes::{Buf, BytesMut};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use wiremesh_error::{Error, ErrorType, ErrorType::*, OrErr, Result};

use crate::utils::BufRef;

const BODY_BUF_SIZE: usize = 1024 * 16;
// limit how much incomplete chunk-size and chunk-ext to buffer
const PARTIAL_CHUNK_HEAD_LIMIT: usize = 1024 * 8;
// arbitrary cap on the trailer section after the terminating chunk
const TRAILER_SIZE_LIMIT: usize = 1024 * 64;

const LAST_CHUNK: &[u8; 5] = b"0\r\n\r\n";
pub(crate) const CRLF: &[u8; 2] = b"\r\n";
const TRAILERS_END: &[u8; 4] = b"\r\n\r\n";

pub const INVALID_CHUNK: ErrorType = ErrorType::new("InvalidChunk");
pub const INVALID_TRAILER_END: ErrorType = ErrorType::new("InvalidTrailerEnd");
pub const PREMATURE_BODY_END: ErrorType = ErrorType::new("PrematureBodyEnd");

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseState {
    ToStart,
    // Complete: total size read
    Complete(usize),
    // Partial: size read, remaining size (content-length)
    Partial(usize, usize),
    // Chunked encoding: size read, current position within the framing
    Chunked(usize, ChunkPhase),
    // read until connection closed, size read
    HTTP1_0(usize),
    // done but there was an error, size read
    Done(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkPhase {
    // expecting a chunk-size line
    Head,
    // inside a chunk payload, n bytes of it still to deliver
    Payload(usize),
    // expecting the CRLF that terminates a chunk payload
    PayloadEnd,
    // after the terminating 0-size chunk, consuming the trailer section
    Trailers,
}

type PS = ParseState;

pub struct BodyReader {
    pub body_state: ParseState,
    // unconsumed raw bytes, filled from the rewind buffer and the stream
    buf: BytesMut,
    // the payload bytes delivered by the last read_body() call
    payload: BytesMut,
    // raw trailer section of a chunked body, starting right after the
    // terminating chunk-size line, including the final CRLF
    trailers: BytesMut,
    // bytes read past the end of this message
    overread: Option<BytesMut>,
}

impl BodyReader {
    pub fn new() -> Self {
        BodyReader {
            body_state: PS::ToStart,
            buf: BytesMut::new(),
            payload: BytesMut::new(),
            trailers: BytesMut::new(),
            overread: None,
        }
    }

    pub fn need_init(&self) -> bool {
        matches!(self.body_state, PS::ToStart)
    }

    pub fn reinit(&mut self) {
        self.body_state = PS::ToStart;
        self.buf.clear();
        self.payload.clear();
        self.trailers.clear();
        self.overread = None;
    }

    fn rewind(&mut self, buf_to_rewind: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(buf_to_rewind);
    }

    pub fn init_chunked(&mut self, buf_to_rewind: &[u8]) {
        self.rewind(buf_to_rewind);
        self.body_state = PS::Chunked(0, ChunkPhase::Head);
    }

    pub fn init_content_length(&mut self, cl: usize, buf_to_rewind: &[u8]) {
        self.rewind(buf_to_rewind);
        match cl {
            0 => {
                self.body_state = PS::Complete(0);
                self.finish_overread();
            }
            _ => {
                self.body_state = PS::Partial(0, cl);
            }
        }
    }

    pub fn init_http10(&mut self, buf_to_rewind: &[u8]) {
        self.rewind(buf_to_rewind);
        self.body_state = PS::HTTP1_0(0);
    }

    pub fn get_body(&self, buf_ref: &BufRef) -> &[u8] {
        buf_ref.get(&self.payload)
    }

    pub fn body_done(&self) -> bool {
        matches!(self.body_state, PS::Complete(_) | PS::Done(_))
    }

    pub fn body_empty(&self) -> bool {
        self.body_state == PS::Complete(0)
    }

    /// The raw trailer section of a chunked body, empty for other framings
    /// and for chunked bodies that carried no trailers.
    pub fn trailers(&self) -> &[u8] {
        &self.trailers
    }

    /// Take the bytes read past the end of this message. They belong to the
    /// next message on the same connection.
    pub fn take_overread(&mut self) -> Option<BytesMut> {
        self.overread.take()
    }

    // move whatever is left in the working buffer out as overread
    fn finish_overread(&mut self) {
        if !self.buf.is_empty() {
            let rest = self.buf.split_off(0);
            self.overread = Some(rest);
        }
    }

    async fn fill<S>(&mut self, stream: &mut S) -> Result<usize>
    where
        S: AsyncRead + Unpin + Send,
    {
        self.buf.reserve(BODY_BUF_SIZE);
        stream
            .read_buf(&mut self.buf)
            .await
            .or_err(ReadError, "when reading body")
    }

    pub async fn read_body<S>(&mut self, stream: &mut S) -> Result<Option<BufRef>>
    where
        S: AsyncRead + Unpin + Send,
    {
        match self.body_state {
            PS::Complete(_) => Ok(None),
            PS::Done(_) => Ok(None),
            PS::Partial(_, _) => self.do_read_body(stream).await,
            PS::Chunked(..) => self.do_read_chunked_body(stream).await,
            PS::HTTP1_0(_) => self.do_read_body_until_closed(stream).await,
            PS::ToStart => panic!("need to init BodyReader first"),
        }
    }

    async fn do_read_body<S>(&mut self, stream: &mut S) -> Result<Option<BufRef>>
    where
        S: AsyncRead + Unpin + Send,
    {
        let PS::Partial(read, to_read) = self.body_state else {
            panic!("wrong body state: {:?}", self.body_state);
        };
        if self.buf.is_empty() {
            let n = self.fill(stream).await?;
            debug!("BodyReader body_state: {:?}, read data from IO: {n}", self.body_state);
            if n == 0 {
                self.body_state = PS::Done(read);
                return Error::e_explain(
                    ConnectionClosed,
                    format!(
                        "Peer prematurely closed connection with {} bytes of body remaining to read",
                        to_read
                    ),
                );
            }
        }
        let n = self.buf.len().min(to_read);
        self.payload = self.buf.split_to(n);
        if n == to_read {
            self.body_state = PS::Complete(read + n);
            self.finish_overread();
        } else {
            self.body_state = PS::Partial(read + n, to_read - n);
        }
        Ok(Some(BufRef::new(0, n)))
    }

    async fn do_read_body_until_closed<S>(&mut self, stream: &mut S) -> Result<Option<BufRef>>
    where
        S: AsyncRead + Unpin + Send,
    {
        let PS::HTTP1_0(read) = self.body_state else {
            panic!("wrong body state: {:?}", self.body_state);
        };
        if self.buf.is_empty() {
            let n = self.fill(stream).await?;
            if n == 0 {
                self.body_state = PS::Complete(read);
                return Ok(None);
            }
        }
        let n = self.buf.len();
        self.payload = self.buf.split_to(n);
        self.body_state = PS::HTTP1_0(read + n);
        Ok(Some(BufRef::new(0, n)))
    }

    async fn do_read_chunked_body<S>(&mut self, stream: &mut S) -> Result<Option<BufRef>>
    where
        S: AsyncRead + Unpin + Send,
    {
        loop {
            let PS::Chunked(read, ref phase) = self.body_state else {
                panic!("wrong body state: {:?}", self.body_state);
            };
            match phase.clone() {
                ChunkPhase::Head => match httparse::parse_chunk_size(&self.buf) {
                    Ok(httparse::Status::Complete((payload_index, chunk_size))) => {
                        self.buf.advance(payload_index);
                        let chunk_size = chunk_size as usize;
                        if chunk_size == 0 {
                            // terminating chunk, the trailer section follows
                            self.body_state = PS::Chunked(read, ChunkPhase::Trailers);
                        } else {
                            self.body_state = PS::Chunked(read, ChunkPhase::Payload(chunk_size));
                        }
                    }
                    Ok(httparse::Status::Partial) => {
                        if self.buf.len() > PARTIAL_CHUNK_HEAD_LIMIT {
                            // "A server ought to limit the total length of chunk extensions received"
                            self.body_state = PS::Done(read);
                            return Error::e_explain(INVALID_CHUNK, "Chunk ext over limit");
                        }
                        let n = self.fill(stream).await?;
                        if n == 0 {
                            self.body_state = PS::Done(read);
                            return Error::e_explain(
                                ConnectionClosed,
                                format!(
                                    "Connection prematurely closed without the termination chunk, \
                                    read {read} bytes"
                                ),
                            );
                        }
                    }
                    Err(e) => {
                        let context = format!("Invalid chunked encoding: {e:?}");
                        debug!(
                            "{context}, {:?}",
                            String::from_utf8_lossy(&self.buf).escape_default()
                        );
                        self.body_state = PS::Done(read);
                        return Error::e_explain(INVALID_CHUNK, context);
                    }
                },
                ChunkPhase::Payload(remaining) => {
                    if self.buf.is_empty() {
                        let n = self.fill(stream).await?;
                        if n == 0 {
                            self.body_state = PS::Done(read);
                            return Error::e_explain(
                                ConnectionClosed,
                                format!(
                                    "Connection prematurely closed with {remaining} bytes of the \
                                    chunk remaining to read"
                                ),
                            );
                        }
                    }
                    let n = remaining.min(self.buf.len());
                    self.payload = self.buf.split_to(n);
                    let next = if n == remaining {
                        ChunkPhase::PayloadEnd
                    } else {
                        ChunkPhase::Payload(remaining - n)
                    };
                    self.body_state = PS::Chunked(read + n, next);
                    return Ok(Some(BufRef::new(0, n)));
                }
                ChunkPhase::PayloadEnd => {
                    while self.buf.len() < CRLF.len() {
                        let n = self.fill(stream).await?;
                        if n == 0 {
                            self.body_state = PS::Done(read);
                            return Error::e_explain(
                                ConnectionClosed,
                                "Connection prematurely closed before the chunk end",
                            );
                        }
                    }
                    if &self.buf[..CRLF.len()] != CRLF {
                        self.body_state = PS::Done(read);
                        return Error::e_explain(
                            INVALID_CHUNK,
                            format!(
                                "Invalid chunked encoding: {} was not CRLF",
                                String::from_utf8_lossy(&self.buf[..CRLF.len()]).escape_default(),
                            ),
                        );
                    }
                    self.buf.advance(CRLF.len());
                    self.body_state = PS::Chunked(read, ChunkPhase::Head);
                }
                ChunkPhase::Trailers => {
                    if let Some(end) = trailers_end(&self.buf) {
                        let section = self.buf.split_to(end);
                        self.trailers.extend_from_slice(&section);
                        self.body_state = PS::Complete(read);
                        self.finish_overread();
                        return Ok(None);
                    }
                    if self.buf.len() > TRAILER_SIZE_LIMIT {
                        self.body_state = PS::Done(read);
                        return Error::e_explain(INVALID_TRAILER_END, "Trailer size over limit");
                    }
                    let n = self.fill(stream).await?;
                    if n == 0 {
                        self.body_state = PS::Done(read);
                        return Error::e_explain(
                            ConnectionClosed,
                            format!(
                                "Connection prematurely closed without the trailer end, \
                                read {read} bytes"
                            ),
                        );
                    }
                }
            }
        }
    }
}

impl Default for BodyReader {
    fn default() -> Self {
        Self::new()
    }
}

// Find the end of the trailer section: the index just past the CRLF that
// terminates the whole chunked body. An empty section is just CRLF.
fn trailers_end(buf: &[u8]) -> Option<usize> {
    if buf.len() >= CRLF.len() && &buf[..CRLF.len()] == CRLF {
        return Some(CRLF.len());
    }
    buf.windows(TRAILERS_END.len())
        .position(|w| w == TRAILERS_END)
        .map(|p| p + TRAILERS_END.len())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BodyMode {
    ToSelect,
    ContentLength(usize, usize), // total length to write, bytes already written
    ChunkedEncoding(usize),      // bytes written
    HTTP1_0(usize),              // bytes written
    Complete(usize),             // bytes written
}

type BM = BodyMode;

pub struct BodyWriter {
    pub body_mode: BodyMode,
}

impl BodyWriter {
    pub fn new() -> Self {
        BodyWriter {
            body_mode: BM::ToSelect,
        }
    }

    pub fn init_chunked(&mut self) {
        self.body_mode = BM::ChunkedEncoding(0);
    }

    pub fn init_http10(&mut self) {
        self.body_mode = BM::HTTP1_0(0);
    }

    pub fn init_content_length(&mut self, cl: usize) {
        self.body_mode = BM::ContentLength(cl, 0);
    }

    pub async fn write_body<S>(&mut self, stream: &mut S, buf: &[u8]) -> Result<Option<usize>>
    where
        S: AsyncWrite + Unpin + Send,
    {
        match self.body_mode {
            BM::Complete(_) => Ok(None),
            BM::ContentLength(_, _) => self.do_write_body(stream, buf).await,
            BM::ChunkedEncoding(_) => self.do_write_chunked_body(stream, buf).await,
            BM::HTTP1_0(_) => self.do_write_http1_0_body(stream, buf).await,
            BM::ToSelect => Ok(None),
        }
    }

    pub fn finished(&self) -> bool {
        match self.body_mode {
            BM::Complete(_) => true,
            BM::ContentLength(total, written) => written >= total,
            _ => false,
        }
    }

    async fn do_write_body<S>(&mut self, stream: &mut S, buf: &[u8]) -> Result<Option<usize>>
    where
        S: AsyncWrite + Unpin + Send,
    {
        match self.body_mode {
            BM::ContentLength(total, written) => {
                if written >= total {
                    // already written full length
                    return Ok(None);
                }
                let mut to_write = total - written;
                if to_write < buf.len() {
                    warn!("Trying to write data over content-length: {total}");
                } else {
                    to_write = buf.len();
                }
                let res = stream.write_all(&buf[..to_write]).await;
                match res {
                    Ok(()) => {
                        self.body_mode = BM::ContentLength(total, written + to_write);
                        Ok(Some(to_write))
                    }
                    Err(e) => Error::e_because(WriteError, "while writing body", e),
                }
            }
            _ => panic!("wrong body mode: {:?}", self.body_mode),
        }
    }

    async fn do_write_chunked_body<S>(
        &mut self,
        stream: &mut S,
        buf: &[u8],
    ) -> Result<Option<usize>>
    where
        S: AsyncWrite + Unpin + Send,
    {
        match self.body_mode {
            BM::ChunkedEncoding(written) => {
                let chunk_size = buf.len();
                if chunk_size == 0 {
                    // an empty chunk would read as the terminating one
                    return Ok(Some(0));
                }

                let chunk_size_buf = format!("{:X}\r\n", chunk_size);
                stream
                    .write_all(chunk_size_buf.as_bytes())
                    .await
                    .or_err(WriteError, "while writing body")?;
                stream
                    .write_all(buf)
                    .await
                    .or_err(WriteError, "while writing body")?;
                stream
                    .write_all(&CRLF[..])
                    .await
                    .or_err(WriteError, "while writing body")?;
                self.body_mode = BM::ChunkedEncoding(written + chunk_size);
                Ok(Some(chunk_size))
            }
            _ => panic!("wrong body mode: {:?}", self.body_mode),
        }
    }

    async fn do_write_http1_0_body<S>(
        &mut self,
        stream: &mut S,
        buf: &[u8],
    ) -> Result<Option<usize>>
    where
        S: AsyncWrite + Unpin + Send,
    {
        match self.body_mode {
            BM::HTTP1_0(written) => {
                let res = stream.write_all(buf).await;
                match res {
                    Ok(()) => {
                        self.body_mode = BM::HTTP1_0(written + buf.len());
                        Ok(Some(buf.len()))
                    }
                    Err(e) => Error::e_because(WriteError, "while writing body", e),
                }
            }
            _ => panic!("wrong body mode: {:?}", self.body_mode),
        }
    }

    /// Terminate the body. For chunked encoding this writes the terminating
    /// chunk followed by `trailers` (the raw trailer section captured by the
    /// [BodyReader], empty meaning no trailers).
    pub async fn finish<S>(&mut self, stream: &mut S, trailers: &[u8]) -> Result<Option<usize>>
    where
        S: AsyncWrite + Unpin + Send,
    {
        match self.body_mode {
            BM::Complete(_) => Ok(None),
            BM::ContentLength(_, _) => self.do_finish_body(stream),
            BM::ChunkedEncoding(_) => self.do_finish_chunked_body(stream, trailers).await,
            BM::HTTP1_0(_) => self.do_finish_http1_0_body(stream),
            BM::ToSelect => Ok(None),
        }
    }

    fn do_finish_body<S>(&mut self, _stream: S) -> Result<Option<usize>> {
        match self.body_mode {
            BM::ContentLength(total, written) => {
                self.body_mode = BM::Complete(written);
                if written < total {
                    return Error::e_explain(
                        PREMATURE_BODY_END,
                        format!("Content-length: {total} bytes written: {written}"),
                    );
                }
                Ok(Some(written))
            }
            _ => panic!("wrong body mode: {:?}", self.body_mode),
        }
    }

    async fn do_finish_chunked_body<S>(
        &mut self,
        stream: &mut S,
        trailers: &[u8],
    ) -> Result<Option<usize>>
    where
        S: AsyncWrite + Unpin + Send,
    {
        match self.body_mode {
            BM::ChunkedEncoding(written) => {
                self.body_mode = BM::Complete(written);
                let res = if trailers.is_empty() {
                    stream.write_all(&LAST_CHUNK[..]).await
                } else {
                    match stream.write_all(b"0\r\n").await {
                        Ok(()) => stream.write_all(trailers).await,
                        e => e,
                    }
                };
                match res {
                    Ok(()) => Ok(Some(written)),
                    Err(e) => Error::e_because(WriteError, "while writing body", e),
                }
            }
            _ => panic!("wrong body mode: {:?}", self.body_mode),
        }
    }

    fn do_finish_http1_0_body<S>(&mut self, _stream: &mut S) -> Result<Option<usize>> {
        match self.body_mode {
            BM::HTTP1_0(written) => {
                self.body_mode = BM::Complete(written);
                Ok(Some(written))
            }
            _ => panic!("wrong body mode: {:?}", self.body_mode),
        }
    }
}

impl Default for BodyWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[tokio::test]
    async fn read_with_body_content_length() {
        init_log();
        let input = b"abc";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut body_reader = BodyReader::new();
        body_reader.init_content_length(3, b"");
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(res, BufRef::new(0, 3));
        assert_eq!(body_reader.body_state, ParseState::Complete(3));
        assert_eq!(input, body_reader.get_body(&res));
        assert_eq!(body_reader.take_overread(), None);
    }

    #[tokio::test]
    async fn read_with_body_content_length_2() {
        init_log();
        let input1 = b"a";
        let input2 = b"bc";
        let mut mock_io = Builder::new().read(&input1[..]).read(&input2[..]).build();
        let mut body_reader = BodyReader::new();
        body_reader.init_content_length(3, b"");
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(res, BufRef::new(0, 1));
        assert_eq!(body_reader.body_state, ParseState::Partial(1, 2));
        assert_eq!(input1, body_reader.get_body(&res));
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(res, BufRef::new(0, 2));
        assert_eq!(body_reader.body_state, ParseState::Complete(3));
        assert_eq!(input2, body_reader.get_body(&res));
        assert_eq!(body_reader.take_overread(), None);
    }

    #[tokio::test]
    async fn read_with_body_content_length_less() {
        init_log();
        let input1 = b"a";
        let input2 = b""; // simulating close
        let mut mock_io = Builder::new().read(&input1[..]).read(&input2[..]).build();
        let mut body_reader = BodyReader::new();
        body_reader.init_content_length(3, b"");
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(res, BufRef::new(0, 1));
        assert_eq!(body_reader.body_state, ParseState::Partial(1, 2));
        assert_eq!(input1, body_reader.get_body(&res));
        let res = body_reader.read_body(&mut mock_io).await.unwrap_err();
        assert_eq!(&ConnectionClosed, res.etype());
        assert_eq!(body_reader.body_state, ParseState::Done(1));
    }

    #[tokio::test]
    async fn read_with_body_content_length_overread() {
        init_log();
        let input1 = b"a";
        let input2 = b"bcd";
        let mut mock_io = Builder::new().read(&input1[..]).read(&input2[..]).build();
        let mut body_reader = BodyReader::new();
        body_reader.init_content_length(3, b"");
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(res, BufRef::new(0, 1));
        assert_eq!(body_reader.body_state, ParseState::Partial(1, 2));
        assert_eq!(input1, body_reader.get_body(&res));
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(res, BufRef::new(0, 2));
        assert_eq!(body_reader.body_state, ParseState::Complete(3));
        assert_eq!(&input2[0..2], body_reader.get_body(&res));
        assert_eq!(body_reader.take_overread().as_deref(), Some(&b"d"[..]));
    }

    #[tokio::test]
    async fn read_with_body_content_length_rewind() {
        init_log();
        let rewind = b"ab";
        let input = b"c";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut body_reader = BodyReader::new();
        body_reader.init_content_length(3, rewind);
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(res, BufRef::new(0, 2));
        assert_eq!(body_reader.body_state, ParseState::Partial(2, 1));
        assert_eq!(rewind, body_reader.get_body(&res));
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(res, BufRef::new(0, 1));
        assert_eq!(body_reader.body_state, ParseState::Complete(3));
        assert_eq!(input, body_reader.get_body(&res));
    }

    #[tokio::test]
    async fn read_with_zero_body_rewind_is_overread() {
        init_log();
        let mut mock_io = Builder::new().build();
        let mut body_reader = BodyReader::new();
        body_reader.init_content_length(0, b"GET / HTTP/1.1\r\n");
        let res = body_reader.read_body(&mut mock_io).await.unwrap();
        assert_eq!(res, None);
        assert_eq!(body_reader.body_state, ParseState::Complete(0));
        assert_eq!(
            body_reader.take_overread().as_deref(),
            Some(&b"GET / HTTP/1.1\r\n"[..])
        );
    }

    #[tokio::test]
    async fn read_with_body_http10() {
        init_log();
        let input1 = b"a";
        let input2 = b""; // simulating close
        let mut mock_io = Builder::new().read(&input1[..]).read(&input2[..]).build();
        let mut body_reader = BodyReader::new();
        body_reader.init_http10(b"");
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(res, BufRef::new(0, 1));
        assert_eq!(body_reader.body_state, ParseState::HTTP1_0(1));
        assert_eq!(input1, body_reader.get_body(&res));
        let res = body_reader.read_body(&mut mock_io).await.unwrap();
        assert_eq!(res, None);
        assert_eq!(body_reader.body_state, ParseState::Complete(1));
    }

    #[tokio::test]
    async fn read_with_body_zero_chunk() {
        init_log();
        let input = b"0\r\n\r\n";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut body_reader = BodyReader::new();
        body_reader.init_chunked(b"");
        let res = body_reader.read_body(&mut mock_io).await.unwrap();
        assert_eq!(res, None);
        assert_eq!(body_reader.body_state, ParseState::Complete(0));
        assert_eq!(body_reader.trailers(), b"\r\n");
    }

    #[tokio::test]
    async fn read_with_body_1_chunk() {
        init_log();
        let input1 = b"1\r\na\r\n";
        let input2 = b"0\r\n\r\n";
        let mut mock_io = Builder::new().read(&input1[..]).read(&input2[..]).build();
        let mut body_reader = BodyReader::new();
        body_reader.init_chunked(b"");
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(res, BufRef::new(0, 1));
        assert_eq!(body_reader.get_body(&res), b"a");
        let res = body_reader.read_body(&mut mock_io).await.unwrap();
        assert_eq!(res, None);
        assert_eq!(body_reader.body_state, ParseState::Complete(1));
        assert_eq!(body_reader.take_overread(), None);
    }

    #[tokio::test]
    async fn read_with_body_multi_chunk() {
        init_log();
        let input = b"1\r\na\r\n2\r\nbc\r\n0\r\n\r\n";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut body_reader = BodyReader::new();
        body_reader.init_chunked(b"");
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(body_reader.get_body(&res), b"a");
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(body_reader.get_body(&res), b"bc");
        let res = body_reader.read_body(&mut mock_io).await.unwrap();
        assert_eq!(res, None);
        assert_eq!(body_reader.body_state, ParseState::Complete(3));
    }

    #[tokio::test]
    async fn read_with_body_chunk_split_payload() {
        init_log();
        let input1 = b"4\r\nab";
        let input2 = b"cd\r\n0\r\n\r\n";
        let mut mock_io = Builder::new().read(&input1[..]).read(&input2[..]).build();
        let mut body_reader = BodyReader::new();
        body_reader.init_chunked(b"");
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(body_reader.get_body(&res), b"ab");
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(body_reader.get_body(&res), b"cd");
        let res = body_reader.read_body(&mut mock_io).await.unwrap();
        assert_eq!(res, None);
        assert_eq!(body_reader.body_state, ParseState::Complete(4));
    }

    #[tokio::test]
    async fn read_with_body_chunked_trailers() {
        init_log();
        let input = b"4\r\ndata\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut body_reader = BodyReader::new();
        body_reader.init_chunked(b"");
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(body_reader.get_body(&res), b"data");
        let res = body_reader.read_body(&mut mock_io).await.unwrap();
        assert_eq!(res, None);
        assert_eq!(body_reader.body_state, ParseState::Complete(4));
        assert_eq!(body_reader.trailers(), b"X-Trailer: 1\r\n\r\n");
    }

    #[tokio::test]
    async fn read_with_body_chunked_overread() {
        init_log();
        // a second pipelined message follows the chunked body
        let input = b"1\r\na\r\n0\r\n\r\nHTTP/1.1 200 OK\r\n";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut body_reader = BodyReader::new();
        body_reader.init_chunked(b"");
        let res = body_reader.read_body(&mut mock_io).await.unwrap().unwrap();
        assert_eq!(body_reader.get_body(&res), b"a");
        let res = body_reader.read_body(&mut mock_io).await.unwrap();
        assert_eq!(res, None);
        assert_eq!(
            body_reader.take_overread().as_deref(),
            Some(&b"HTTP/1.1 200 OK\r\n"[..])
        );
    }

    #[tokio::test]
    async fn read_with_body_chunked_invalid() {
        init_log();
        let input = b"X\r\na\r\n";
        let mut mock_io = Builder::new().read(&input[..]).build();
        let mut body_reader = BodyReader::new();
        body_reader.init_chunked(b"");
        let res = body_reader.read_body(&mut mock_io).await.unwrap_err();
        assert_eq!(res.etype(), &INVALID_CHUNK);
        assert_eq!(body_reader.body_state, ParseState::Done(0));
    }

    #[tokio::test]
    async fn write_body_cl() {
        init_log();
        let output = b"abc";
        let mut mock_io = Builder::new().write(&output[..]).build();
        let mut body_writer = BodyWriter::new();
        body_writer.init_content_length(3);
        assert_eq!(body_writer.body_mode, BodyMode::ContentLength(3, 0));
        let res = body_writer
            .write_body(&mut mock_io, output)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, 3);
        assert_eq!(body_writer.body_mode, BodyMode::ContentLength(3, 3));
        // write again, over the limit
        let res = body_writer.write_body(&mut mock_io, output).await.unwrap();
        assert_eq!(res, None);
        let res = body_writer.finish(&mut mock_io, b"").await.unwrap().unwrap();
        assert_eq!(res, 3);
        assert_eq!(body_writer.body_mode, BodyMode::Complete(3));
    }

    #[tokio::test]
    async fn write_body_cl_premature() {
        init_log();
        let output = b"ab";
        let mut mock_io = Builder::new().write(&output[..]).build();
        let mut body_writer = BodyWriter::new();
        body_writer.init_content_length(3);
        body_writer
            .write_body(&mut mock_io, output)
            .await
            .unwrap()
            .unwrap();
        let res = body_writer.finish(&mut mock_io, b"").await.unwrap_err();
        assert_eq!(res.etype(), &PREMATURE_BODY_END);
    }

    #[tokio::test]
    async fn write_body_chunked() {
        init_log();
        let data = b"abcdefghij";
        let mut mock_io = Builder::new()
            .write(b"A\r\n")
            .write(&data[..])
            .write(b"\r\n")
            .write(b"0\r\n\r\n")
            .build();
        let mut body_writer = BodyWriter::new();
        body_writer.init_chunked();
        let res = body_writer
            .write_body(&mut mock_io, data)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, data.len());
        let res = body_writer.finish(&mut mock_io, b"").await.unwrap().unwrap();
        assert_eq!(res, data.len());
        assert_eq!(body_writer.body_mode, BodyMode::Complete(data.len()));
    }

    #[tokio::test]
    async fn write_body_chunked_trailers() {
        init_log();
        let data = b"ab";
        let mut mock_io = Builder::new()
            .write(b"2\r\n")
            .write(&data[..])
            .write(b"\r\n")
            .write(b"0\r\n")
            .write(b"X-Trailer: 1\r\n\r\n")
            .build();
        let mut body_writer = BodyWriter::new();
        body_writer.init_chunked();
        body_writer
            .write_body(&mut mock_io, data)
            .await
            .unwrap()
            .unwrap();
        let res = body_writer
            .finish(&mut mock_io, b"X-Trailer: 1\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, data.len());
    }

    #[tokio::test]
    async fn write_body_http10() {
        init_log();
        let data = b"ab";
        let mut mock_io = Builder::new().write(&data[..]).build();
        let mut body_writer = BodyWriter::new();
        body_writer.init_http10();
        let res = body_writer
            .write_body(&mut mock_io, data)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, 2);
        let res = body_writer.finish(&mut mock_io, b"").await.unwrap().unwrap();
        assert_eq!(res, 2);
        assert_eq!(body_writer.body_mode, BodyMode::Complete(2));
    }
}
