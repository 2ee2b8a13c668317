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

//! The two pipelines of one proxied connection pair
//!
//! [HttpHandler::handle_request] frames requests flowing from the client to
//! the upstream; [HttpHandler::handle_response] frames responses flowing
//! back. Both re-serialize what they parse and fall back to verbatim byte
//! copying the moment they hit something they cannot or should not
//! interpret.

pub mod exchange;
pub mod queue;
pub mod routing;

use log::{debug, error, warn};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use wiremesh_cache::TtlCache;
use wiremesh_error::ErrorType;
use wiremesh_http::RequestHeader;

use crate::config::HttpConfig;
use crate::pool::WRITE_BUF_POOL;
use crate::protocols::http::v1::body::BodyWriter;
use crate::protocols::http::v1::common::is_connection_upgrade;
use crate::protocols::http::v1::request::{
    http_req_header_to_buf, init_req_body_writer, request_summary, RequestReader,
};
use crate::protocols::http::v1::response::{
    http_resp_header_to_buf, init_resp_body_writer, ResponseReader,
};
use crate::protocols::tee::TeeWriter;
use crate::protocols::SocketOps;
use crate::trace::{SpanContext, Tracer};

pub use exchange::HttpExchange;

/// The rendezvous with the dialer task.
///
/// Once per request the pipeline sends a destination proposal on `addr_tx`
/// and blocks on `conn_rx` for the dialled upstream, `None` meaning the dial
/// failed. Dropping `addr_tx` (by letting this struct go out of scope when
/// the pipeline exits) is the shutdown signal for the dialer.
pub struct DialerChannels<W> {
    pub addr_tx: mpsc::Sender<String>,
    pub conn_rx: mpsc::Receiver<Option<W>>,
}

impl<W> DialerChannels<W> {
    /// Create the channel pair shared with a dialer task. Returns the
    /// pipeline side plus the dialer's receiving and sending ends.
    pub fn pair() -> (Self, mpsc::Receiver<String>, mpsc::Sender<Option<W>>) {
        let (addr_tx, addr_rx) = mpsc::channel(1);
        let (conn_tx, conn_rx) = mpsc::channel(1);
        (DialerChannels { addr_tx, conn_rx }, addr_rx, conn_tx)
    }
}

/// The HTTP protocol engine shared by all connection pairs of a process.
pub struct HttpHandler {
    config: Arc<HttpConfig>,
    tracer: Tracer,
    tracing_contexts: Arc<TtlCache<String, SpanContext>>,
    routing_contexts: Arc<TtlCache<String, String>>,
}

impl HttpHandler {
    pub fn new(config: Arc<HttpConfig>, tracer: Tracer) -> Self {
        let tracing_contexts = Arc::new(TtlCache::new(
            config.tracing_context_capacity,
            config.tracing_context_ttl(),
        ));
        let routing_contexts = Arc::new(TtlCache::new(
            config.routing_context_capacity,
            config.routing_context_ttl(),
        ));
        HttpHandler {
            config,
            tracer,
            tracing_contexts,
            routing_contexts,
        }
    }

    pub fn config(&self) -> &Arc<HttpConfig> {
        &self.config
    }

    /// Create the shared per-connection-pair state. One exchange is shared
    /// by the two pipelines of a pair.
    pub fn new_exchange(&self, is_inbound: bool) -> Arc<HttpExchange> {
        Arc::new(HttpExchange::new(
            is_inbound,
            self.config.clone(),
            self.tracer.clone(),
            self.tracing_contexts.clone(),
        ))
    }

    /// The request pipeline: client to upstream.
    ///
    /// Frames requests off `downstream`, decorates them (request-id,
    /// X-Source, tracing context), negotiates the upstream connection with
    /// the dialer when routing is enabled, and re-serializes each request to
    /// the upstream. Returns the upstream connection for reuse, `None` when
    /// no upstream was available.
    pub async fn handle_request<R, W>(
        &self,
        downstream: &mut R,
        upstream: Option<W>,
        dialer: Option<DialerChannels<W>>,
        exchange: &HttpExchange,
        original_dst: &str,
    ) -> Option<W>
    where
        R: AsyncRead + SocketOps + Unpin + Send,
        W: AsyncWrite + SocketOps + Unpin + Send,
    {
        let mut upstream = upstream;
        // dropped on return, which closes the proposal channel and tells the
        // dialer to shut down
        let mut dialer = dialer;
        let mut reader = RequestReader::new();
        let mut tee = TeeWriter::new();
        loop {
            tee.start();
            tee.write(reader.carry());
            let parsed = match reader.read_request(downstream, &mut tee).await {
                Ok(None) => {
                    debug!("EOF while parsing request HTTP");
                    return upstream;
                }
                Ok(Some(_)) => true,
                Err(e) => {
                    if e.etype() == &ErrorType::ReadError {
                        debug!("{e}");
                        return upstream;
                    }
                    warn!("Error while parsing http request: {e}");
                    false
                }
            };

            if parsed {
                let conf = &self.config;
                {
                    let req = reader.req_header_mut();
                    let missing_id = req
                        .headers
                        .get(&conf.request_id_header_name)
                        .and_then(|v| v.to_str().ok())
                        .map_or(true, |v| v.is_empty());
                    if missing_id {
                        let id = Uuid::new_v4().to_string();
                        let _ = req.insert_header(conf.request_id_header_name.clone(), id);
                    }
                }

                if conf.routing_enabled {
                    if let Some(d) = dialer.as_mut() {
                        let proposal = self.destination_proposal(
                            reader.req_header_mut(),
                            exchange.is_inbound(),
                            original_dst,
                        );
                        if d.addr_tx.send(proposal).await.is_err() {
                            debug!("Dialer is gone, exiting request pipeline");
                            return upstream;
                        }
                        match d.conn_rx.recv().await {
                            Some(Some(w)) => upstream = Some(w),
                            // the dial failed, no upstream available
                            Some(None) | None => return None,
                        }
                    }
                }
            }

            let Some(w) = upstream.as_mut() else {
                return None;
            };

            if exchange.is_inbound() {
                if let Some(addr) = downstream.peer_addr() {
                    exchange.set_remote_addr(addr.to_string());
                }
            } else if let Some(addr) = w.peer_addr() {
                exchange.set_remote_addr(addr.to_string());
            }

            if !parsed {
                fall_through(&mut tee, downstream, w).await;
                return upstream;
            }

            // avoid ws connections and other upgrade protos
            if is_connection_upgrade(&reader.req_header().headers) {
                fall_through(&mut tee, downstream, w).await;
                return upstream;
            }

            tee.stop();

            if !exchange.is_inbound() {
                // propagate the tracing context recorded by the inbound
                // sibling under the same request-id
                let conf = &self.config;
                let req = reader.req_header_mut();
                let request_id = req
                    .headers
                    .get(&conf.request_id_header_name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                if let Some(context) = self.tracing_contexts.get(&request_id) {
                    crate::trace::inject_context(&context, req);
                }
                if req.headers.get(&conf.x_source_header_name).is_none() {
                    let _ = req.insert_header(
                        conf.x_source_header_name.clone(),
                        conf.x_source_value.as_str(),
                    );
                }
            }

            debug!("Forwarding request: {}", request_summary(reader.req_header()));

            reader.init_body();
            exchange.set_request(reader.take_header());
            exchange.start_request();

            // write the same request to the upstream
            let mut body_writer = BodyWriter::new();
            let mut buf = WRITE_BUF_POOL.get();
            let serialized = exchange
                .with_newest_request(|req| {
                    let res = http_req_header_to_buf(req, &mut buf);
                    init_req_body_writer(req, &mut body_writer);
                    res
                })
                .unwrap_or_else(|| unreachable!("the request was just pushed"));
            match serialized {
                Ok(()) => {
                    if let Err(e) =
                        forward_body(&mut reader, downstream, w, &mut body_writer, &buf).await
                    {
                        error!("Error while writing request to upstream: {e}");
                        WRITE_BUF_POOL.put(buf);
                        return upstream;
                    }
                }
                Err(e) => {
                    error!("Error while serializing request: {e}");
                    WRITE_BUF_POOL.put(buf);
                    return upstream;
                }
            }
            WRITE_BUF_POOL.put(buf);
            reader.finish_message();
        }
    }

    /// The response pipeline: upstream to client.
    ///
    /// Frames responses off `upstream`, forwards them to `downstream` and
    /// pairs each one with the oldest outstanding request to finish its
    /// span. Cleans up the exchange on exit.
    pub async fn handle_response<R, W>(
        &self,
        upstream: &mut R,
        downstream: &mut W,
        exchange: &HttpExchange,
        force_close: bool,
    ) where
        R: AsyncRead + SocketOps + Unpin + Send,
        W: AsyncWrite + SocketOps + Unpin + Send,
    {
        let mut reader = ResponseReader::new();
        let mut tee = TeeWriter::new();
        loop {
            tee.start();
            tee.write(reader.carry());
            match reader.read_response(upstream, &mut tee).await {
                Ok(None) => {
                    debug!("EOF while parsing response HTTP");
                    break;
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    if e.etype() == &ErrorType::ReadError {
                        debug!("{e}");
                        break;
                    }
                    warn!("Error while parsing http response: {e}");
                    fall_through(&mut tee, upstream, downstream).await;
                    break;
                }
            }

            // avoid ws connections and other upgrade protos
            if is_connection_upgrade(&reader.resp_header().headers) {
                fall_through(&mut tee, upstream, downstream).await;
                break;
            }

            tee.stop();

            let status = reader.resp_header().status.as_u16();
            let head_request = exchange.oldest_request_is_head();
            reader.init_body(head_request);

            if head_request {
                // the server side can hold the connection, which would leave
                // the terminating write stuck; unblock it first
                if force_close && status != 100 {
                    upstream.shutdown_read();
                    upstream.shutdown_write();
                }
                // write the response directly, bypassing the pooled buffer
                let mut buf = bytes::BytesMut::with_capacity(512);
                match http_resp_header_to_buf(reader.resp_header(), &mut buf) {
                    Ok(()) => {
                        if let Err(e) = downstream.write_all(&buf).await {
                            error!("Error while writing response to client: {e}");
                        }
                        if let Err(e) = downstream.flush().await {
                            error!("Error while flushing response to client: {e}");
                        }
                    }
                    Err(e) => error!("Error while serializing response: {e}"),
                }
            } else {
                let mut body_writer = BodyWriter::new();
                let mut buf = WRITE_BUF_POOL.get();
                let serialized = http_resp_header_to_buf(reader.resp_header(), &mut buf);
                init_resp_body_writer(reader.resp_header(), head_request, &mut body_writer);
                match serialized {
                    Ok(()) => {
                        if let Err(e) = forward_resp_body(
                            &mut reader,
                            upstream,
                            downstream,
                            &mut body_writer,
                            &buf,
                        )
                        .await
                        {
                            error!("Error while writing response to client: {e}");
                            WRITE_BUF_POOL.put(buf);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error while serializing response: {e}");
                        WRITE_BUF_POOL.put(buf);
                        break;
                    }
                }
                WRITE_BUF_POOL.put(buf);
            }

            exchange.set_response(reader.take_header());
            exchange.stop_request();
            reader.finish_message();

            // in case of a 100 response the connection must stay open, the
            // server keeps on sending responses
            if force_close && status != 100 && !head_request {
                upstream.shutdown_read();
                upstream.shutdown_write();
            }
        }
        exchange.clean_up();
    }

    // Derive the destination proposal for one request. Inbound requests keep
    // their original destination and only record the routing value for the
    // outbound sibling; outbound requests propose the resolved address.
    fn destination_proposal(
        &self,
        req: &mut RequestHeader,
        is_inbound: bool,
        original_dst: &str,
    ) -> String {
        let Some(value) = routing::routing_value(req, &self.config, &self.routing_contexts)
        else {
            return original_dst.to_string();
        };
        match routing::routing_destination(&value, req.host(), original_dst) {
            Err(e) => {
                warn!("{e}");
                original_dst.to_string()
            }
            Ok(addr) => {
                if is_inbound {
                    if let Some(request_id) = req
                        .headers
                        .get(&self.config.request_id_header_name)
                        .and_then(|v| v.to_str().ok())
                    {
                        if !request_id.is_empty() {
                            self.routing_contexts
                                .put(&request_id.to_string(), value.clone());
                        }
                    }
                    original_dst.to_string()
                } else {
                    addr
                }
            }
        }
    }
}

// Write the already serialized head then stream the message body from the
// reader to the writer, closing the body framing at the end.
async fn forward_body<R, W>(
    reader: &mut RequestReader,
    from: &mut R,
    to: &mut W,
    body_writer: &mut BodyWriter,
    head: &[u8],
) -> wiremesh_error::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    use wiremesh_error::{ErrorType::WriteError, OrErr};

    to.write_all(head)
        .await
        .or_err(WriteError, "while writing request header")?;
    while let Some(buf_ref) = reader.read_body(from).await? {
        let data = reader.get_body(&buf_ref);
        if data.is_empty() {
            continue;
        }
        body_writer.write_body(to, data).await?;
    }
    body_writer.finish(to, reader.trailers()).await?;
    to.flush().await.or_err(WriteError, "while flushing")?;
    Ok(())
}

// Same as forward_body for the response direction.
async fn forward_resp_body<R, W>(
    reader: &mut ResponseReader,
    from: &mut R,
    to: &mut W,
    body_writer: &mut BodyWriter,
    head: &[u8],
) -> wiremesh_error::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    use wiremesh_error::{ErrorType::WriteError, OrErr};

    to.write_all(head)
        .await
        .or_err(WriteError, "while writing response header")?;
    while let Some(buf_ref) = reader.read_body(from).await? {
        let data = reader.get_body(&buf_ref);
        if data.is_empty() {
            continue;
        }
        body_writer.write_body(to, data).await?;
    }
    body_writer.finish(to, reader.trailers()).await?;
    to.flush().await.or_err(WriteError, "while flushing")?;
    Ok(())
}

// The transparent escape hatch shared by both pipelines: replay the bytes
// the parser consumed, then copy the remainder of the stream verbatim.
async fn fall_through<R, W>(tee: &mut TeeWriter, from: &mut R, to: &mut W)
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    if let Err(e) = to.write_all(tee.bytes()).await {
        warn!("{e}");
    }
    tee.stop();
    if let Err(e) = tokio::io::copy(from, to).await {
        warn!("{e}");
    }
}
