//! The public server type and the loop that drives everything.
//!
//! A [`Server`] owns the route table, the per-connection HTTP state, and
//! the socket layer. [`Server::run`] enters the loop: one poll per
//! iteration, premium listeners first, then peer traffic (writes before
//! reads, so a finished response leaves before the next request enters),
//! then remaining listeners, then newly accepted connections, and finally
//! idle pruning. Every application callback runs on this thread.

use std::collections::HashMap;
use std::fs::File;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustls::ClientConfig;
use tracing::{debug, warn};

use crate::client::{ClientRequest, ClientResponse};
use crate::headers::HeaderMap;
use crate::proto::conn::{PendingTransfer, RequestCtx};
use crate::proto::{Direction, Phase};
use crate::reactor::io::BUFFER_SIZE;
use crate::reactor::{now_secs, Reactor, Transport, Watch};
use crate::routes::{Match, RouteId, RouteTable};
use crate::tls::TlsOutcome;

pub(crate) type Handler = Rc<dyn Fn(&mut Exchange<'_>) -> Option<Bytes>>;
pub(crate) type ProtectHook = Rc<dyn Fn(&mut Exchange<'_>)>;
pub(crate) type TickHook = Rc<dyn Fn(&mut Scope<'_>)>;
pub(crate) type ListenHook = Rc<dyn Fn(&mut Scope<'_>, RawFd, Watch)>;
pub(crate) type AcceptHook = Rc<dyn Fn(&SocketAddr) -> bool>;
pub(crate) type ResponseHook = Box<dyn FnOnce(&mut ClientResponse<'_>)>;

/// Per-slot HTTP state and the route table.
pub(crate) struct Engine {
    pub routes: RouteTable,
    ctxs: Vec<Option<Box<RequestCtx>>>,
    pub tls_config: Option<Arc<ClientConfig>>,
}

impl Engine {
    fn new(capacity: usize, tls_config: Option<Arc<ClientConfig>>) -> Engine {
        Engine {
            routes: RouteTable::new(),
            ctxs: (0..capacity).map(|_| None).collect(),
            tls_config,
        }
    }

    pub fn init_ctx(&mut self, id: usize) {
        self.ctxs[id] = Some(Box::new(RequestCtx::new()));
    }

    pub fn take_ctx(&mut self, id: usize) -> Option<Box<RequestCtx>> {
        self.ctxs.get_mut(id).and_then(|slot| slot.take())
    }

    pub fn put_ctx(&mut self, id: usize, ctx: Box<RequestCtx>) {
        self.ctxs[id] = Some(ctx);
    }

    pub fn ctx_mut(&mut self, id: usize) -> Option<&mut RequestCtx> {
        self.ctxs.get_mut(id).and_then(|slot| slot.as_deref_mut())
    }

    fn drop_ctx(&mut self, id: usize) {
        if let Some(slot) = self.ctxs.get_mut(id) {
            *slot = None;
        }
    }
}

/// Timed and registered application callbacks.
pub(crate) struct Hooks {
    pub acceptor: Option<AcceptHook>,
    pub background: Option<TickHook>,
    pub last_background: u64,
    pub fastscan: Option<Fastscan>,
    pub listeners: HashMap<RawFd, ListenHook>,
}

pub(crate) struct Fastscan {
    pub period: Duration,
    pub last: Instant,
    pub hook: TickHook,
}

impl Hooks {
    fn new() -> Hooks {
        Hooks {
            acceptor: None,
            background: None,
            last_background: 0,
            fastscan: None,
            listeners: HashMap::new(),
        }
    }
}

pub(crate) struct Core {
    pub raw: Reactor,
    pub eng: Engine,
    pub hooks: Hooks,
    pub running: bool,
    pub debug: bool,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("raw", &self.raw)
            .field("routes", &self.eng.routes)
            .finish()
    }
}

impl Core {
    /// Ends a connection: protocol state first, then the socket.
    pub(crate) fn close_slot(&mut self, id: usize, reason: &str) {
        if !self.raw.is_open(id) {
            return;
        }
        debug!("closing slot {}: {}", id, reason);
        self.eng.drop_ctx(id);
        self.raw.release(id);
    }

    /// Transport failure: a pending response callback hears 505 before
    /// the connection goes away.
    fn close_on_error(&mut self, id: usize, reason: &str) {
        self.respond_505(id);
        self.close_slot(id, reason);
    }

    /// Hands buffered input to the HTTP layer, unless a response is still
    /// draining (processing a second request while the first response
    /// owns the output pipeline would interleave them).
    fn feed(&mut self, id: usize) {
        let gated = match self.raw.managed_mut(id) {
            Some(m) => {
                if m.out.is_idle() {
                    false
                } else {
                    m.refeed = !m.inbuf.is_empty();
                    true
                }
            }
            None => return,
        };
        if gated {
            return;
        }
        let mut buf = match self.raw.managed_mut(id) {
            Some(m) => std::mem::take(&mut m.inbuf),
            None => return,
        };
        let consumed = self.http_received(id, &mut buf, false);
        if let Some(m) = self.raw.managed_mut(id) {
            if consumed > 0 {
                buf.drain(..consumed.min(buf.len()));
            }
            m.refeed = !buf.is_empty();
            m.inbuf = buf;
        }
    }

    fn read_plain(&mut self, id: usize) {
        match self.raw.receive(id) {
            Err(error) => {
                self.close_on_error(id, &error.to_string());
            }
            Ok(received) => {
                if received.bytes > 0 {
                    self.feed(id);
                }
                if !self.raw.is_open(id) {
                    return;
                }
                if received.eof {
                    self.end_of_stream(id, "connection closed by peer");
                    return;
                }
                if received.full {
                    let stuck = self
                        .raw
                        .managed(id)
                        .map_or(false, |m| m.out.is_idle() && m.inbuf.len() >= BUFFER_SIZE);
                    if stuck {
                        self.close_slot(id, "data too large");
                    }
                }
            }
        }
    }

    fn ready_tls(&mut self, id: usize, readable: bool) {
        let outcome = match self.raw.managed_mut(id) {
            Some(m) => crate::tls::ready(m, readable),
            None => return,
        };
        match outcome {
            TlsOutcome::Ok => {
                let has_input = self.raw.managed(id).map_or(false, |m| !m.inbuf.is_empty());
                if has_input {
                    self.feed(id);
                }
            }
            TlsOutcome::Eof => self.end_of_stream(id, "connection closed by peer"),
            TlsOutcome::Fatal => self.close_on_error(id, "TLS failure"),
        }
    }

    /// Delivers remaining parseable input, then the end-of-transport
    /// indication, then closes.
    fn end_of_stream(&mut self, id: usize, reason: &str) {
        self.feed(id);
        if !self.raw.is_open(id) {
            return;
        }
        let mut empty = Vec::new();
        let _ = self.http_received(id, &mut empty, true);
        if self.raw.is_open(id) {
            self.close_slot(id, reason);
        }
    }

    fn dispatch_app(&mut self, ready: crate::reactor::Ready, premium_pass: bool) {
        let entry = self.raw.app(ready.token).map(|a| (a.fd, a.premium));
        let (fd, premium) = match entry {
            Some(entry) => entry,
            None => return,
        };
        if premium != premium_pass {
            return;
        }
        let mut watch = Watch::IDLE;
        if ready.readable {
            watch = watch | Watch::READ;
        }
        if ready.writable {
            watch = watch | Watch::WRITE;
        }
        if watch.is_idle() {
            return;
        }
        if let Some(hook) = self.hooks.listeners.get(&fd).map(Rc::clone) {
            let mut scope = Scope { core: &mut *self };
            hook(&mut scope, fd, watch);
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.raw.accept() {
                Ok(Some(id)) => {
                    let peer = self.raw.managed(id).and_then(|m| m.peer);
                    let accepted = match (self.hooks.acceptor.clone(), peer) {
                        (Some(hook), Some(peer)) => hook(&peer),
                        _ => true,
                    };
                    if !accepted {
                        debug!("peer rejected by acceptor");
                        self.raw.release(id);
                        continue;
                    }
                    self.eng.init_ctx(id);
                }
                Ok(None) => break,
                Err(error) => {
                    warn!("accept failed: {}", error);
                    break;
                }
            }
        }
    }

    fn listen_impl(&mut self, fd: RawFd, watch: Watch, premium: bool, owned: bool, hook: ListenHook) {
        match self.raw.register_fd(fd, watch, premium, owned) {
            Some(_) => {
                self.hooks.listeners.insert(fd, hook);
            }
            None => {
                self.hooks.listeners.remove(&fd);
            }
        }
    }

    fn forget_impl(&mut self, fd: RawFd) {
        self.raw.forget_fd(fd);
        self.hooks.listeners.remove(&fd);
    }

    fn run(&mut self) -> crate::Result<()> {
        self.running = true;
        let mut last_prune = now_secs();
        while self.running {
            // The background hook runs between I/O bursts, at most once
            // per calendar second.
            if let Some(hook) = self.hooks.background.clone() {
                let now = now_secs();
                if now > self.hooks.last_background {
                    self.hooks.last_background = now;
                    let mut scope = Scope { core: &mut *self };
                    hook(&mut scope);
                }
            }

            self.raw.update_interests();

            let timeout = match self.hooks.fastscan.as_ref() {
                Some(fastscan) => fastscan.period,
                None => Duration::from_secs(1),
            };
            let ready = self
                .raw
                .poll_events(timeout)
                .map_err(crate::Error::new_io)?;

            let due = self.hooks.fastscan.as_mut().and_then(|fastscan| {
                if fastscan.last.elapsed() >= fastscan.period {
                    fastscan.last = Instant::now();
                    Some(fastscan.hook.clone())
                } else {
                    None
                }
            });
            if let Some(hook) = due {
                let mut scope = Scope { core: &mut *self };
                hook(&mut scope);
            }

            let listener_token = self.raw.listener_token();

            // Premium listeners are serviced before any TCP traffic.
            for r in ready.iter().copied() {
                self.dispatch_app(r, true);
            }
            for r in ready.iter().copied() {
                if r.token >= listener_token {
                    continue;
                }
                let is_tls = match self.raw.managed(r.token) {
                    Some(m) => matches!(m.transport, Transport::Tls(_)),
                    None => continue,
                };
                if is_tls {
                    self.ready_tls(r.token, r.readable);
                } else {
                    if r.writable {
                        if let Err(error) = self.raw.transmit(r.token) {
                            self.close_on_error(r.token, &error.to_string());
                            continue;
                        }
                    }
                    if r.readable && self.raw.is_open(r.token) {
                        self.read_plain(r.token);
                    }
                }
            }
            for r in ready.iter().copied() {
                self.dispatch_app(r, false);
            }
            if ready
                .iter()
                .any(|r| r.token == listener_token && r.readable)
            {
                self.accept_all();
            }

            // Error replies close once their bytes are out.
            for id in self.raw.managed_ids() {
                let drained = self
                    .raw
                    .managed(id)
                    .map_or(false, |m| m.close_when_drained && m.out.is_idle());
                if drained {
                    self.close_slot(id, "error reply sent");
                }
            }

            // Requests that arrived behind a response get their turn once
            // the response has drained.
            for id in self.raw.managed_ids() {
                let pending = self
                    .raw
                    .managed(id)
                    .map_or(false, |m| m.refeed && m.out.is_idle() && !m.inbuf.is_empty());
                if pending {
                    self.feed(id);
                }
            }

            let now = now_secs();
            if now > last_prune {
                last_prune = now;
                for id in self.raw.expired(now) {
                    self.close_slot(id, "deadline reached");
                }
            }
        }
        Ok(())
    }

    fn close_everything(&mut self) {
        for id in self.raw.managed_ids() {
            self.eng.drop_ctx(id);
        }
        self.raw.close_all();
    }

    fn peer_of(&self, id: usize) -> Option<SocketAddr> {
        self.raw.managed(id).and_then(|m| m.peer)
    }
}

fn is_local_addr(addr: &SocketAddr) -> bool {
    match addr.ip() {
        std::net::IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        std::net::IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4() {
                if !v6.is_loopback() && v6.segments()[..5] == [0, 0, 0, 0, 0] && v6.segments()[5] == 0xffff {
                    return v4.is_loopback() || v4.is_private() || v4.is_link_local();
                }
            }
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// The embedded HTTP server (and client) and its event loop.
pub struct Server {
    core: Core,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("core", &self.core).finish()
    }
}

impl Server {
    /// Binds the listening socket and prepares the loop. TLS client
    /// support is enabled when CA certificates can be loaded from the
    /// configured location; otherwise `https://` requests fail and
    /// everything else still works.
    pub fn open(options: crate::Options) -> crate::Result<Server> {
        let raw = Reactor::open(&options.service, options.ttl)?;
        let capacity = raw.capacity();
        let tls_config = match crate::tls::client_config(&options.tls_certs) {
            Ok(config) => Some(config),
            Err(error) => {
                debug!("TLS client support disabled: {}", error);
                None
            }
        };
        Ok(Server {
            core: Core {
                raw,
                eng: Engine::new(capacity, tls_config),
                hooks: Hooks::new(),
                running: false,
                debug: options.debug,
            },
        })
    }

    /// Registers a handler for exactly `uri`.
    pub fn route<F>(&mut self, uri: &str, handler: F) -> crate::Result<RouteId>
    where
        F: Fn(&mut Exchange<'_>) -> Option<Bytes> + 'static,
    {
        self.core.eng.routes.add(uri, Rc::new(handler), Match::Exact)
    }

    /// Registers a handler for `uri` and everything below it.
    pub fn route_prefix<F>(&mut self, uri: &str, handler: F) -> crate::Result<RouteId>
    where
        F: Fn(&mut Exchange<'_>) -> Option<Bytes> + 'static,
    {
        self.core.eng.routes.add(uri, Rc::new(handler), Match::Prefix)
    }

    /// Removes a route. Unknown URIs are ignored.
    pub fn remove_route(&mut self, uri: &str) {
        self.core.eng.routes.remove(uri);
    }

    /// Installs a protect hook running before the handler of `route`
    /// (or before every handler, for [`RouteId::GLOBAL`]). Setting an
    /// error status from the hook short-circuits the request.
    pub fn protect<F>(&mut self, route: RouteId, hook: F) -> crate::Result<()>
    where
        F: Fn(&mut Exchange<'_>) + 'static,
    {
        self.core.eng.routes.set_protect(route, Rc::new(hook))
    }

    /// Lets `route` accept request bodies larger than the input buffer:
    /// the handler runs as soon as the headers are in and may attach a
    /// transfer file for the body.
    pub fn asynchronous_route<F>(&mut self, route: RouteId, handler: F) -> crate::Result<()>
    where
        F: Fn(&mut Exchange<'_>) -> Option<Bytes> + 'static,
    {
        self.core.eng.routes.set_asynchronous(route, Rc::new(handler))
    }

    /// Gates incoming connections; return false to turn a peer away
    /// before any bytes are read.
    pub fn on_accept<F>(&mut self, hook: F)
    where
        F: Fn(&SocketAddr) -> bool + 'static,
    {
        self.core.hooks.acceptor = Some(Rc::new(hook));
    }

    /// Runs `hook` between I/O bursts, at most once per second.
    pub fn background<F>(&mut self, hook: F)
    where
        F: Fn(&mut Scope<'_>) + 'static,
    {
        self.core.hooks.background = Some(Rc::new(hook));
    }

    /// Runs `hook` on a sub-second period (clamped to 1..=999 ms). More
    /// precise than [`background`](Server::background), and costlier:
    /// the loop wakes up every period.
    pub fn fastscan<F>(&mut self, period: Duration, hook: F)
    where
        F: Fn(&mut Scope<'_>) + 'static,
    {
        let period = period.clamp(Duration::from_millis(1), Duration::from_millis(999));
        self.core.hooks.fastscan = Some(Fastscan {
            period,
            last: Instant::now(),
            hook: Rc::new(hook),
        });
    }

    /// Watches an application file descriptor; `hook` fires with the
    /// ready directions. Premium listeners are serviced before TCP
    /// peers. Registering with `Watch::IDLE` removes the registration;
    /// the application keeps ownership of the descriptor.
    pub fn listen<F>(&mut self, fd: RawFd, watch: Watch, premium: bool, hook: F)
    where
        F: Fn(&mut Scope<'_>, RawFd, Watch) + 'static,
    {
        self.core.listen_impl(fd, watch, premium, false, Rc::new(hook));
    }

    /// Like [`listen`](Server::listen), but the core takes ownership of
    /// the descriptor and closes it when the registration goes away.
    pub fn adopt<F>(&mut self, fd: RawFd, watch: Watch, premium: bool, hook: F)
    where
        F: Fn(&mut Scope<'_>, RawFd, Watch) + 'static,
    {
        self.core.listen_impl(fd, watch, premium, true, Rc::new(hook));
    }

    /// Drops the registration for `fd`.
    pub fn forget(&mut self, fd: RawFd) {
        self.core.forget_impl(fd);
    }

    /// Starts an outbound request; see [`ClientRequest`].
    pub fn client(&mut self, method: &str, url: &str) -> crate::Result<ClientRequest<'_>> {
        let id = self.core.open_client(method, url)?;
        Ok(ClientRequest::new(&mut self.core, id))
    }

    /// Opens a raw non-blocking TCP connection the application owns,
    /// typically to watch with [`listen`](Server::listen) or
    /// [`adopt`](Server::adopt). The connect may still be in progress
    /// when this returns; the first writable event settles it.
    pub fn connect(&mut self, host: &str, port: u16) -> crate::Result<RawFd> {
        crate::reactor::connect_fd(host, port)
    }

    /// The bound TCP port (useful with `-http-service=dynamic`).
    pub fn port(&self) -> u16 {
        self.core.raw.port()
    }

    /// True when the port was dynamically assigned.
    pub fn is_dynamic(&self) -> bool {
        self.core.raw.is_dynamic()
    }

    /// True when `-http-debug` was given.
    pub fn is_debug(&self) -> bool {
        self.core.debug
    }

    /// Enters the event loop until [`Scope::stop`] is called.
    pub fn run(&mut self) -> crate::Result<()> {
        self.core.run()
    }

    /// Closes the listener and every connection.
    pub fn close(&mut self) {
        self.core.close_everything();
    }
}

/// Loop access handed to callbacks that run outside a request: listeners,
/// background and fastscan hooks, response callbacks (through
/// [`ClientResponse`]).
pub struct Scope<'a> {
    pub(crate) core: &'a mut Core,
}

impl std::fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope").finish()
    }
}

impl<'a> Scope<'a> {
    /// Starts an outbound request; see [`ClientRequest`].
    pub fn client(&mut self, method: &str, url: &str) -> crate::Result<ClientRequest<'_>> {
        let id = self.core.open_client(method, url)?;
        Ok(ClientRequest::new(&mut *self.core, id))
    }

    /// See [`Server::listen`].
    pub fn listen<F>(&mut self, fd: RawFd, watch: Watch, premium: bool, hook: F)
    where
        F: Fn(&mut Scope<'_>, RawFd, Watch) + 'static,
    {
        self.core.listen_impl(fd, watch, premium, false, Rc::new(hook));
    }

    /// See [`Server::adopt`].
    pub fn adopt<F>(&mut self, fd: RawFd, watch: Watch, premium: bool, hook: F)
    where
        F: Fn(&mut Scope<'_>, RawFd, Watch) + 'static,
    {
        self.core.listen_impl(fd, watch, premium, true, Rc::new(hook));
    }

    /// See [`Server::forget`].
    pub fn forget(&mut self, fd: RawFd) {
        self.core.forget_impl(fd);
    }

    /// See [`Server::connect`].
    pub fn connect(&mut self, host: &str, port: u16) -> crate::Result<RawFd> {
        crate::reactor::connect_fd(host, port)
    }

    /// Makes [`Server::run`] return after the current iteration.
    pub fn stop(&mut self) {
        self.core.running = false;
    }

    /// The bound TCP port.
    pub fn port(&self) -> u16 {
        self.core.raw.port()
    }

    /// True when `-http-debug` was given.
    pub fn is_debug(&self) -> bool {
        self.core.debug
    }
}

/// A request being handled: accessors for what came in, setters for what
/// goes out. Handlers, protect hooks and asynchronous-route handlers all
/// receive one.
pub struct Exchange<'a> {
    core: &'a mut Core,
    ctx: &'a mut RequestCtx,
    slot: usize,
    body: Option<&'a [u8]>,
}

impl std::fmt::Debug for Exchange<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("method", &self.ctx.method)
            .field("uri", &self.ctx.uri)
            .finish()
    }
}

impl<'a> Exchange<'a> {
    pub(crate) fn new(
        core: &'a mut Core,
        slot: usize,
        ctx: &'a mut RequestCtx,
        body: Option<&'a [u8]>,
    ) -> Exchange<'a> {
        Exchange {
            core,
            ctx,
            slot,
            body,
        }
    }

    /// The request method, percent-decoded.
    pub fn method(&self) -> &str {
        &self.ctx.method
    }

    /// The request path, percent-decoded, query removed.
    pub fn uri(&self) -> &str {
        &self.ctx.uri
    }

    /// The request body. `None` for protect hooks and bodyless requests.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.filter(|b| !b.is_empty())
    }

    /// A request header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.ctx.in_headers.get(name)
    }

    /// All request headers, in arrival order.
    pub fn headers(&self) -> &HeaderMap {
        &self.ctx.in_headers
    }

    /// A query parameter value, percent-decoded.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.ctx.params.get(name)
    }

    /// All query parameters, in arrival order.
    pub fn parameters(&self) -> &HeaderMap {
        &self.ctx.params
    }

    /// The query parameters re-joined as `k=v` pairs with `sep`.
    pub fn parameter_join(&self, sep: &str) -> String {
        self.ctx.params.join(sep)
    }

    /// Sets a response header.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.ctx.out_headers.set(name, value);
    }

    /// Sets the `Content-Type` response header.
    pub fn set_content_type(&mut self, value: &str) {
        self.set_header("Content-Type", value);
    }

    /// Shorthand for `text/plain`.
    pub fn set_content_type_text(&mut self) {
        self.set_content_type("text/plain");
    }

    /// Shorthand for `application/json`.
    pub fn set_content_type_json(&mut self) {
        self.set_content_type("application/json");
    }

    /// Shorthand for `text/html`.
    pub fn set_content_type_html(&mut self) {
        self.set_content_type("text/html");
    }

    /// Shorthand for `text/css`.
    pub fn set_content_type_css(&mut self) {
        self.set_content_type("text/css");
    }

    /// Overrides the reported body length, for responses whose real
    /// length cannot be derived from the returned slice.
    pub fn set_content_length(&mut self, length: usize) {
        self.ctx.content_length_out = length;
    }

    /// The response status as it stands.
    pub fn status(&self) -> u16 {
        self.ctx.status
    }

    /// Replaces the `200 OK` response with an error (or any other)
    /// status and reason.
    pub fn error(&mut self, status: u16, reason: &str) {
        self.ctx.status = status;
        self.ctx.reason = reason.to_owned();
    }

    /// The current reason phrase.
    pub fn reason(&self) -> &str {
        &self.ctx.reason
    }

    /// Answers with a temporary redirect (307) to `url`.
    pub fn redirect(&mut self, url: &str) {
        self.error(307, "Temporary Redirect");
        self.set_header("Location", url);
    }

    /// Answers with a permanent redirect (308) to `url`.
    pub fn permanent_redirect(&mut self, url: &str) {
        self.error(308, "Redirected permanently");
        self.set_header("Location", url);
    }

    /// Appends a body segment sent after the returned body, in call
    /// order.
    pub fn queue<B: Into<Bytes>>(&mut self, data: B) {
        let data = data.into();
        self.ctx.queued_len += data.len();
        self.ctx.queued.push_back(data);
    }

    /// Attaches a file to the current message. For a response, `size`
    /// bytes of `file` are streamed after the body segments; for an
    /// asynchronous request body, the remaining `size` body bytes are
    /// written to `file` as they arrive. The first call wins; the
    /// transfer owns the file either way.
    pub fn transfer(&mut self, file: File, size: u64) {
        if self.ctx.transfer.is_some() {
            return;
        }
        let dir = if self.ctx.phase == Phase::AwaitingBody {
            Direction::In
        } else {
            Direction::Out
        };
        self.ctx.transfer = Some(PendingTransfer { file, size, dir });
    }

    /// True when the peer is on a loopback or private network.
    pub fn is_local(&self) -> bool {
        self.core
            .peer_of(self.slot)
            .map_or(false, |addr| is_local_addr(&addr))
    }

    /// Starts an outbound request from inside a handler. The nested
    /// request does not disturb the response being built; submit it
    /// before returning.
    pub fn client(&mut self, method: &str, url: &str) -> crate::Result<ClientRequest<'_>> {
        let id = self.core.open_client(method, url)?;
        Ok(ClientRequest::new(&mut *self.core, id))
    }
}
