//! The per-connection HTTP/1.1 state machine.
//!
//! `http_received` is the single entry point: the reactor hands it the
//! slot's buffered input whenever new bytes arrive or a previous response
//! has drained. It parses at most one message per call: processing a
//! pipelined follow-up request before the current response (headers,
//! queued segments, file transfer) has been handed to the socket layer
//! would let a second response interleave with an in-flight transfer.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::client::ClientResponse;
use crate::headers::HeaderMap;
use crate::proto::{date, decode, Direction, Phase};
use crate::reactor::io::BUFFER_SIZE;
use crate::reactor::Transport;
use crate::routes::RouteId;
use crate::server::{Core, Exchange, ResponseHook};

const MAX_HEADERS: usize = 100;
const MAX_METHOD: usize = 64;
const MAX_URI: usize = 512;

/// A file attached to the current message by the application, not yet
/// handed to the socket layer.
pub(crate) struct PendingTransfer {
    pub file: File,
    pub size: u64,
    pub dir: Direction,
}

/// Per-slot HTTP state.
pub(crate) struct RequestCtx {
    pub phase: Phase,
    /// The protect hooks already ran for this message.
    pub protected: bool,
    pub method: String,
    pub uri: String,
    pub content_length: usize,
    /// Overrides the reported body length when non-zero.
    pub content_length_out: usize,
    pub route: Option<RouteId>,
    pub status: u16,
    pub reason: String,
    pub in_headers: HeaderMap,
    pub out_headers: HeaderMap,
    pub params: HeaderMap,
    /// Extra body segments appended by the handler, sent after the
    /// returned body in FIFO order.
    pub queued: VecDeque<Bytes>,
    pub queued_len: usize,
    pub transfer: Option<PendingTransfer>,
    /// Set on outbound slots between `submit` and the response.
    pub response_cb: Option<ResponseHook>,
    /// Fires on response headers before the body completes.
    pub async_cb: Option<ResponseHook>,
    /// Scheme://host[:port] of the outbound request, for resolving
    /// relative redirect locations.
    pub base_url: Option<String>,
}

impl RequestCtx {
    pub fn new() -> RequestCtx {
        RequestCtx {
            phase: Phase::Idle,
            protected: false,
            method: String::new(),
            uri: String::new(),
            content_length: 0,
            content_length_out: 0,
            route: None,
            status: 200,
            reason: "OK".to_owned(),
            in_headers: HeaderMap::new(),
            out_headers: HeaderMap::new(),
            params: HeaderMap::new(),
            queued: VecDeque::new(),
            queued_len: 0,
            transfer: None,
            response_cb: None,
            async_cb: None,
            base_url: None,
        }
    }

    pub fn cancel_transfer(&mut self) {
        // Dropping the pending transfer closes its file.
        self.transfer = None;
    }

    fn has_error(&self) -> bool {
        self.status / 100 > 3
    }
}

fn truncated(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_owned();
    }
    let mut cut = max;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    value[..cut].to_owned()
}

/// What became of body bytes routed into an In transfer.
enum Absorbed {
    Wrote(usize),
    Done(usize),
    Failed,
}

impl Core {
    /// Consumes buffered input for a slot. Returns how many bytes were
    /// used; the caller drains them from the slot buffer. `eof` signals a
    /// transport-level end or error instead of data.
    pub(crate) fn http_received(&mut self, id: usize, buf: &mut Vec<u8>, eof: bool) -> usize {
        let mut ctx = match self.eng.take_ctx(id) {
            Some(ctx) => ctx,
            None => return buf.len(),
        };
        let consumed = self.receive_inner(id, &mut ctx, buf, eof);
        if self.raw.is_open(id) {
            self.eng.put_ctx(id, ctx);
        }
        consumed
    }

    fn receive_inner(
        &mut self,
        id: usize,
        ctx: &mut RequestCtx,
        buf: &mut Vec<u8>,
        eof: bool,
    ) -> usize {
        if eof {
            // Transport ended; a caller waiting for a response hears a 505.
            trace!(
                "end of connection while waiting for {}",
                if ctx.response_cb.is_some() { "response" } else { "request" }
            );
            ctx.cancel_transfer();
            if ctx.response_cb.is_some() {
                ctx.status = 505;
                self.respond(id, ctx, &[]);
            }
            return 0;
        }

        // After a fatal protocol error all further input is discarded
        // until the connection closes.
        if ctx.phase == Phase::Error {
            return buf.len();
        }

        if ctx.phase == Phase::AwaitingBody {
            return self.receive_body(id, ctx, buf);
        }

        self.receive_head(id, ctx, buf)
    }

    /// Body continuation for a message whose headers were already parsed.
    fn receive_body(&mut self, id: usize, ctx: &mut RequestCtx, buf: &mut Vec<u8>) -> usize {
        if ctx
            .transfer
            .as_ref()
            .map_or(false, |t| t.dir == Direction::In)
        {
            match absorb_into_transfer(ctx, buf) {
                Absorbed::Failed => {
                    ctx.phase = Phase::Error;
                    ctx.cancel_transfer();
                    return buf.len();
                }
                Absorbed::Wrote(n) => return n,
                Absorbed::Done(n) => {
                    ctx.cancel_transfer();
                    if ctx.response_cb.is_some() {
                        // Outbound connections are not reused.
                        self.respond(id, ctx, &[]);
                        self.close_slot(id, "end of response");
                        return 0;
                    }
                    ctx.phase = Phase::Idle;
                    self.execute(id, ctx, &[]);
                    return n;
                }
            }
        }

        // Buffered body: wait until every byte is in.
        if ctx.content_length > buf.len() {
            return 0;
        }
        let length = ctx.content_length;
        if ctx.response_cb.is_some() {
            self.respond(id, ctx, &buf[..length]);
            self.close_slot(id, "end of response");
            return 0;
        }
        ctx.phase = Phase::Idle;
        self.execute(id, ctx, &buf[..length]);
        length
    }

    /// Parses a header block and dispatches the message it frames.
    fn receive_head(&mut self, id: usize, ctx: &mut RequestCtx, buf: &mut Vec<u8>) -> usize {
        if buf.is_empty() {
            return 0;
        }

        let head_len = if ctx.response_cb.is_some() {
            match self.parse_status_line(id, ctx, buf) {
                Ok(Some(len)) => len,
                Ok(None) => return self.check_head_overflow(id, buf),
                Err(()) => return 0,
            }
        } else {
            match self.parse_request_line(id, ctx, buf) {
                Ok(Some(len)) => len,
                Ok(None) => return self.check_head_overflow(id, buf),
                Err(()) => return buf.len(),
            }
        };

        ctx.protected = false;
        let available = buf.len() - head_len;
        let mut consumed = head_len;
        let body_start = head_len;
        let body_len;

        if let Some(value) = ctx.in_headers.get("Content-Length") {
            let length = value.trim().parse::<usize>().unwrap_or(0);
            if length > available {
                // The body continues beyond this buffer.
                ctx.phase = Phase::AwaitingBody;
                ctx.content_length = length;
                if ctx.async_cb.is_some() {
                    trace!("asynchronous response, {} of {} bytes", available, length);
                    let callback = ctx.async_cb.take().expect("checked above");
                    self.respond_with(id, ctx, &buf[body_start..], callback);
                    if ctx.phase == Phase::Error {
                        return buf.len();
                    }
                    return consumed + self.absorb_partial(id, ctx, buf, body_start);
                }
                let asynchronous = ctx
                    .route
                    .and_then(|route| self.eng.routes.get(route))
                    .and_then(|entry| entry.asynchronous.clone());
                if let Some(handler) = asynchronous {
                    trace!("asynchronous request, {} of {} bytes", available, length);
                    self.execute_async(id, ctx, &buf[body_start..], handler);
                    if ctx.phase == Phase::Error {
                        return buf.len();
                    }
                    return consumed + self.absorb_partial(id, ctx, buf, body_start);
                }
                return consumed;
            }
            body_len = length;
            consumed += length;
        } else if let Some(value) = ctx.in_headers.get("Transfer-Encoding") {
            if !value.trim().eq_ignore_ascii_case("chunked") {
                self.close_slot(id, "unsupported transfer encoding");
                return 0;
            }
            match decode::decode_in_place(buf, body_start) {
                Ok((decoded, used)) => {
                    body_len = decoded;
                    consumed += used;
                }
                Err(decode::ChunkError::Incomplete) => {
                    // Headers stay in the buffer and are parsed again
                    // once the terminating chunk shows up.
                    return 0;
                }
                Err(decode::ChunkError::Invalid(reason)) => {
                    self.close_slot(id, reason);
                    return 0;
                }
            }
        } else {
            body_len = 0;
        }
        ctx.content_length = body_len;

        let body = &buf[body_start..body_start + body_len];
        if ctx.response_cb.is_some() {
            self.respond(id, ctx, body);
            self.close_slot(id, "end of response");
            return 0;
        }
        self.execute(id, ctx, body);
        // One request per call: a pipelined follow-up stays buffered
        // until this response has fully drained.
        consumed
    }

    /// An incomplete header block either waits for more input or, once it
    /// has filled the buffer, ends the connection.
    fn check_head_overflow(&mut self, id: usize, buf: &[u8]) -> usize {
        if buf.len() >= BUFFER_SIZE {
            self.close_slot(id, "data too large");
        }
        0
    }

    fn parse_status_line(
        &mut self,
        id: usize,
        ctx: &mut RequestCtx,
        buf: &[u8],
    ) -> Result<Option<usize>, ()> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                let code = response.code.expect("complete response has a code");
                if !(100..600).contains(&code) {
                    ctx.status = 505;
                    self.respond(id, ctx, &[]);
                    self.close_slot(id, "protocol error");
                    return Err(());
                }
                ctx.status = code;
                ctx.reason = response.reason.unwrap_or("").to_owned();
                trace!("HTTP status {} {}", ctx.status, ctx.reason);
                ctx.in_headers.reset();
                for header in response.headers.iter() {
                    let value = String::from_utf8_lossy(header.value);
                    ctx.in_headers.set(header.name, &value);
                }
                Ok(Some(len))
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(_) => {
                ctx.status = 505;
                self.respond(id, ctx, &[]);
                self.close_slot(id, "protocol error");
                Err(())
            }
        }
    }

    fn parse_request_line(
        &mut self,
        id: usize,
        ctx: &mut RequestCtx,
        buf: &[u8],
    ) -> Result<Option<usize>, ()> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        let (len, method, target) = match request.parse(buf) {
            Ok(httparse::Status::Complete(len)) => (
                len,
                request.method.expect("complete request has a method"),
                request.path.expect("complete request has a target"),
            ),
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => {
                self.invalid(id, ctx, "Invalid Request Line");
                return Err(());
            }
        };
        trace!("HTTP request {} {}", method, target);

        // The query is split off before decoding so an encoded '?' cannot
        // open one.
        let (raw_path, raw_query) = match target.find('?') {
            Some(at) => (&target[..at], Some(&target[at + 1..])),
            None => (target, None),
        };
        let method = match crate::encoding::unescape_str(method) {
            Some(method) => method,
            None => {
                self.invalid(id, ctx, "Invalid request format");
                return Err(());
            }
        };
        let path = match crate::encoding::unescape_str(raw_path) {
            Some(path) => path,
            None => {
                self.invalid(id, ctx, "Invalid request format");
                return Err(());
            }
        };

        // No legitimate request target ever contains "..": refusing them
        // here protects every file-serving handler at once.
        if path.contains("..") {
            self.close_slot(id, "path traversal");
            return Err(());
        }

        ctx.method = truncated(&method, MAX_METHOD);
        ctx.uri = truncated(&path, MAX_URI);

        ctx.params.reset();
        if let Some(query) = raw_query {
            for pair in query.split('&') {
                let (name, value) = match pair.split_once('=') {
                    Some(pair) => pair,
                    None => continue,
                };
                match (
                    crate::encoding::unescape_str(name),
                    crate::encoding::unescape_str(value),
                ) {
                    (Some(name), Some(value)) => {
                        ctx.params.set(&name, &value);
                    }
                    _ => {
                        self.invalid(id, ctx, "Invalid Parameter Syntax");
                        return Err(());
                    }
                }
            }
        }

        match self.eng.routes.lookup(&ctx.uri) {
            Some(route) => ctx.route = Some(route),
            None => {
                debug!("no route for {}", ctx.uri);
                self.send_error(id, ctx, 404, "Not found");
                ctx.phase = Phase::Error;
                return Err(());
            }
        }

        ctx.in_headers.reset();
        for header in request.headers.iter() {
            let value = String::from_utf8_lossy(header.value);
            ctx.in_headers.set(header.name, &value);
        }
        Ok(Some(len))
    }

    /// Routes the partial body that arrived with the headers into a
    /// freshly attached In transfer, if the callback set one up.
    fn absorb_partial(
        &mut self,
        id: usize,
        ctx: &mut RequestCtx,
        buf: &[u8],
        body_start: usize,
    ) -> usize {
        if ctx
            .transfer
            .as_ref()
            .map_or(true, |t| t.dir != Direction::In)
        {
            return 0;
        }
        let outcome = absorb_into_transfer(ctx, &buf[body_start..]);
        match outcome {
            Absorbed::Failed => {
                ctx.phase = Phase::Error;
                ctx.cancel_transfer();
                buf.len() - body_start
            }
            Absorbed::Wrote(n) => n,
            Absorbed::Done(n) => {
                ctx.cancel_transfer();
                if ctx.response_cb.is_some() {
                    self.respond(id, ctx, &[]);
                    self.close_slot(id, "end of response");
                } else {
                    ctx.phase = Phase::Idle;
                    self.execute(id, ctx, &[]);
                }
                n
            }
        }
    }

    /// Runs the global then per-route protect hooks once per message.
    /// Returns false when the request was short-circuited.
    fn execute_protect(&mut self, id: usize, ctx: &mut RequestCtx) -> bool {
        if ctx.protected {
            return true;
        }
        ctx.status = 200;
        ctx.reason = "OK".to_owned();
        ctx.out_headers.reset();
        ctx.cancel_transfer();

        if let Some(hook) = self.eng.routes.protect.clone() {
            let mut exchange = Exchange::new(self, id, ctx, None);
            hook(&mut exchange);
        }
        if ctx.status == 200 {
            let hook = ctx
                .route
                .and_then(|route| self.eng.routes.get(route))
                .and_then(|entry| entry.protect.clone());
            if let Some(hook) = hook {
                let mut exchange = Exchange::new(self, id, ctx, None);
                hook(&mut exchange);
            }
        }
        if ctx.status == 204 {
            // Not an error, but a polite refusal to process further.
            let reason = ctx.reason.clone();
            self.send_error(id, ctx, 204, &reason);
            return false;
        }
        if ctx.has_error() {
            let (status, reason) = (ctx.status, ctx.reason.clone());
            self.send_error(id, ctx, status, &reason);
            return false;
        }
        ctx.protected = true;
        true
    }

    /// Runs the route handler and emits the response.
    pub(crate) fn execute(&mut self, id: usize, ctx: &mut RequestCtx, body: &[u8]) {
        let keep = ctx
            .in_headers
            .get("Connection")
            .map_or(false, |v| v.eq_ignore_ascii_case("keep-alive"));

        if !self.execute_protect(id, ctx) {
            return;
        }
        ctx.content_length_out = 0;

        let handler = ctx
            .route
            .and_then(|route| self.eng.routes.get(route))
            .map(|entry| entry.handler.clone());
        let handler = match handler {
            Some(handler) => handler,
            None => {
                self.send_error(id, ctx, 404, "Not found");
                return;
            }
        };

        let returned = {
            let mut exchange = Exchange::new(self, id, ctx, Some(body));
            handler(&mut exchange)
        };
        ctx.out_headers.set("Date", &date::now());

        if ctx.has_error() {
            let (status, reason) = (ctx.status, ctx.reason.clone());
            self.send_error(id, ctx, status, &reason);
            return;
        }

        let body = returned.unwrap_or_else(Bytes::new);
        let declared = if ctx.content_length_out > 0 {
            ctx.content_length_out
        } else {
            body.len()
        };

        self.send_status_line(id, ctx.status, &ctx.reason);
        if keep {
            self.send_slot(id, b"Connection: keep-alive\r\n");
        }
        self.send_content(id, ctx, &body, declared);
    }

    /// Variant of `execute` for routes that accept oversized bodies: the
    /// asynchronous handler sees the partial body and usually attaches an
    /// In transfer for the rest.
    fn execute_async(
        &mut self,
        id: usize,
        ctx: &mut RequestCtx,
        body: &[u8],
        handler: crate::server::Handler,
    ) {
        if !self.execute_protect(id, ctx) {
            return;
        }
        {
            let mut exchange = Exchange::new(self, id, ctx, Some(body));
            let _ = handler(&mut exchange);
        }

        if (300..400).contains(&ctx.status) {
            // Redirected: answer now, the rest of the body is of no use.
            let (status, reason) = (ctx.status, ctx.reason.clone());
            self.send_status_line(id, status, &reason);
            self.send_content(id, ctx, &[], 0);
            ctx.phase = Phase::Error;
            return;
        }
        if ctx.has_error() {
            let (status, reason) = (ctx.status, ctx.reason.clone());
            self.send_error(id, ctx, status, &reason);
        }
        // Otherwise stay quiet: the body is still on its way.
    }

    /// Fires the stored response callback, if any.
    pub(crate) fn respond(&mut self, id: usize, ctx: &mut RequestCtx, body: &[u8]) {
        if let Some(callback) = ctx.response_cb.take() {
            self.respond_with(id, ctx, body, callback);
        }
        ctx.async_cb = None;
        ctx.in_headers.reset();
    }

    fn respond_with(
        &mut self,
        id: usize,
        ctx: &mut RequestCtx,
        body: &[u8],
        callback: ResponseHook,
    ) {
        let mut response = ClientResponse::new(self, id, ctx, body);
        callback(&mut response);
    }

    /// Fires a pending response callback with status 505. Used when the
    /// transport failed before a complete response arrived.
    pub(crate) fn respond_505(&mut self, id: usize) {
        let mut ctx = match self.eng.take_ctx(id) {
            Some(ctx) => ctx,
            None => return,
        };
        if ctx.response_cb.is_some() {
            ctx.status = 505;
            self.respond(id, &mut ctx, &[]);
        }
        if self.raw.is_open(id) {
            self.eng.put_ctx(id, ctx);
        }
    }

    fn invalid(&mut self, id: usize, ctx: &mut RequestCtx, reason: &str) {
        self.send_error(id, ctx, 406, reason);
        ctx.phase = Phase::Error;
    }

    /// Emits a bare status reply. Errors (≥ 400) also schedule the
    /// connection to close once the reply has drained.
    pub(crate) fn send_error(&mut self, id: usize, ctx: &mut RequestCtx, status: u16, reason: &str) {
        self.send_status_line(id, status, reason);
        if status >= 400 {
            self.send_slot(id, b"Content-Length: 0\r\nConnection: Closed\r\n\r\n");
            if let Some(m) = self.raw.managed_mut(id) {
                m.close_when_drained = true;
            }
        } else {
            self.send_slot(id, b"Content-Length: 0\r\n\r\n");
        }
        ctx.cancel_transfer();
    }

    pub(crate) fn send_status_line(&mut self, id: usize, status: u16, reason: &str) {
        let mut head = Vec::with_capacity(48 + reason.len());
        head.extend_from_slice(b"HTTP/1.1 ");
        let mut formatter = itoa::Buffer::new();
        head.extend_from_slice(formatter.format(status).as_bytes());
        head.push(b' ');
        head.extend_from_slice(reason.as_bytes());
        head.extend_from_slice(b"\r\n");
        self.send_slot(id, &head);
    }

    /// Emits `Content-Length`, the response headers, and the body pieces:
    /// inline body, queued segments, then the file transfer. The transfer
    /// is handed to the socket layer last so the preamble is guaranteed
    /// to precede the file bytes on the wire.
    pub(crate) fn send_content(
        &mut self,
        id: usize,
        ctx: &mut RequestCtx,
        body: &[u8],
        declared: usize,
    ) {
        let transfer_size = ctx
            .transfer
            .as_ref()
            .filter(|t| t.dir == Direction::Out)
            .map(|t| t.size as usize)
            .unwrap_or(0);

        let mut head = Vec::with_capacity(128 + ctx.out_headers.len() * 32);
        head.extend_from_slice(b"Content-Length: ");
        let mut formatter = itoa::Buffer::new();
        head.extend_from_slice(
            formatter
                .format(declared + ctx.queued_len + transfer_size)
                .as_bytes(),
        );
        head.extend_from_slice(b"\r\n");
        for (name, value) in ctx.out_headers.iter() {
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        self.send_slot(id, &head);

        if !body.is_empty() {
            self.send_slot(id, body);
        }

        let queued: Vec<Bytes> = ctx.queued.drain(..).collect();
        ctx.queued_len = 0;
        for segment in queued {
            self.send_slot(id, &segment);
        }

        if transfer_size > 0 {
            if let Some(transfer) = ctx.transfer.take() {
                // From here the socket layer owns the file and closes it.
                self.transfer_slot(id, transfer.file, transfer.size);
            }
        }
    }

    /// Queues bytes for a slot through its transport.
    pub(crate) fn send_slot(&mut self, id: usize, data: &[u8]) {
        if let Some(m) = self.raw.managed_mut(id) {
            if matches!(m.transport, Transport::Tls(_)) {
                crate::tls::send(m, data);
            } else {
                m.out.push(data);
            }
            m.kick = true;
        }
    }

    fn transfer_slot(&mut self, id: usize, file: File, size: u64) {
        if let Some(m) = self.raw.managed_mut(id) {
            match &mut m.transport {
                Transport::Plain => m.out.set_transfer(file, size),
                Transport::Tls(tls) => tls.set_transfer(file, size),
            }
            m.kick = true;
        }
    }
}

/// Writes as much of `data` as the In transfer still expects.
fn absorb_into_transfer(ctx: &mut RequestCtx, data: &[u8]) -> Absorbed {
    let transfer = match ctx.transfer.as_mut() {
        Some(t) if t.dir == Direction::In => t,
        _ => return Absorbed::Wrote(0),
    };
    let take = data.len().min(transfer.size as usize);
    if transfer.file.write_all(&data[..take]).is_err() {
        return Absorbed::Failed;
    }
    transfer.size -= take as u64;
    if transfer.size == 0 {
        Absorbed::Done(take)
    } else {
        Absorbed::Wrote(take)
    }
}
