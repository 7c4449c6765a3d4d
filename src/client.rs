//! Outbound HTTP requests, sharing the server's event loop.
//!
//! [`Scope::client`](crate::Scope::client) (or its twins on `Server` and
//! `Exchange`) opens the connection and writes the request line and
//! `Host` header immediately; the returned [`ClientRequest`] collects
//! headers and an optional upload file until `submit` sends the rest and
//! registers the response callback. Outbound connections serve exactly
//! one request: once the response is in, the callback fires and the
//! connection closes.

use std::fs::File;

use tracing::{debug, trace};

use crate::proto::conn::RequestCtx;
use crate::proto::{Direction, Phase};
use crate::reactor::Transport;
use crate::server::{Core, ResponseHook};
use crate::tls::TlsState;

/// Pieces of a parsed client URL.
struct Target<'a> {
    tls: bool,
    host: &'a str,
    port: u16,
    explicit_port: bool,
    path: &'a str,
}

/// Host names are bounded like a DNS label.
const MAX_HOST: usize = 63;

fn parse_url(url: &str) -> crate::Result<Target<'_>> {
    let (tls, rest) = if let Some(rest) = url.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (false, rest)
    } else {
        return Err(crate::Error::new_scheme());
    };

    let host_end = rest
        .find(|c| c == ':' || c == '/')
        .unwrap_or_else(|| rest.len());
    let host = &rest[..host_end];
    if host.is_empty() {
        return Err(crate::Error::new_uri());
    }
    if host.len() > MAX_HOST {
        return Err(crate::Error::new_too_large());
    }

    let after_host = &rest[host_end..];
    let (port, explicit_port, path) = if let Some(after_colon) = after_host.strip_prefix(':') {
        let port_end = after_colon.find('/').unwrap_or_else(|| after_colon.len());
        let port = after_colon[..port_end]
            .parse::<u16>()
            .map_err(|_| crate::Error::new_uri())?;
        (port, true, &after_colon[port_end..])
    } else {
        (if tls { 443 } else { 80 }, false, after_host)
    };

    Ok(Target {
        tls,
        host,
        port,
        explicit_port,
        path: if path.is_empty() { "/" } else { path },
    })
}

impl Core {
    /// Opens an outbound connection and writes the request preamble.
    /// Returns the slot now holding the pending request.
    pub(crate) fn open_client(&mut self, method: &str, url: &str) -> crate::Result<usize> {
        let target = parse_url(url)?;
        debug!("connecting to {}:{}", target.host, target.port);
        let id = self.raw.connect(target.host, target.port)?;
        self.eng.init_ctx(id);

        if target.tls {
            let config = match self.eng.tls_config.clone() {
                Some(config) => config,
                None => {
                    self.close_slot(id, "TLS not initialized");
                    return Err(crate::Error::new_tls("no CA certificates loaded"));
                }
            };
            match TlsState::new(config, target.host) {
                Ok(state) => {
                    if let Some(m) = self.raw.managed_mut(id) {
                        m.transport = Transport::Tls(Box::new(state));
                    }
                }
                Err(error) => {
                    self.close_slot(id, "TLS failed");
                    return Err(error);
                }
            }
        }

        let mut base = String::with_capacity(url.len());
        base.push_str(if target.tls { "https://" } else { "http://" });
        base.push_str(target.host);
        if target.explicit_port {
            base.push(':');
            base.push_str(&target.port.to_string());
        }

        let mut preamble = String::with_capacity(64 + method.len() + url.len());
        preamble.push_str(method);
        preamble.push(' ');
        preamble.push_str(target.path);
        preamble.push_str(" HTTP/1.1\r\nHost: ");
        preamble.push_str(target.host);
        if target.explicit_port {
            preamble.push(':');
            preamble.push_str(&target.port.to_string());
        }
        preamble.push_str("\r\n");
        self.send_slot(id, preamble.as_bytes());

        if let Some(ctx) = self.eng.ctx_mut(id) {
            ctx.base_url = Some(base);
        }
        Ok(id)
    }

    /// Finishes a pending request: headers, body framing, callback.
    pub(crate) fn submit(&mut self, id: usize, body: &[u8], callback: ResponseHook) {
        let mut ctx = match self.eng.take_ctx(id) {
            Some(ctx) => ctx,
            None => return,
        };
        ctx.response_cb = Some(callback);
        trace!("submitting {} byte request body on slot {}", body.len(), id);
        self.send_content(id, &mut ctx, body, body.len());
        if self.raw.is_open(id) {
            self.eng.put_ctx(id, ctx);
        }
    }
}

/// A request that has been opened but not yet submitted.
///
/// Dropping it without calling [`submit`](ClientRequest::submit) leaves
/// the connection to the idle-deadline pruner.
#[derive(Debug)]
pub struct ClientRequest<'a> {
    pub(crate) core: &'a mut Core,
    pub(crate) slot: usize,
}

impl<'a> ClientRequest<'a> {
    pub(crate) fn new(core: &'a mut Core, slot: usize) -> ClientRequest<'a> {
        ClientRequest { core, slot }
    }

    /// Adds a request header.
    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        if let Some(ctx) = self.core.eng.ctx_mut(self.slot) {
            ctx.out_headers.set(name, value);
        }
        self
    }

    /// Streams `size` bytes of `file` as the request body, after whatever
    /// is passed to `submit`. The transfer owns the file.
    pub fn transfer(&mut self, file: File, size: u64) {
        if let Some(ctx) = self.core.eng.ctx_mut(self.slot) {
            if ctx.transfer.is_none() {
                ctx.transfer = Some(crate::proto::conn::PendingTransfer {
                    file,
                    size,
                    dir: Direction::Out,
                });
            }
        }
    }

    /// Registers a callback fired as soon as the response headers arrive,
    /// before the body is complete. The callback may attach a file with
    /// [`ClientResponse::transfer`] to stream the body to disk instead of
    /// buffering it.
    pub fn asynchronous<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut ClientResponse<'_>) + 'static,
    {
        if let Some(ctx) = self.core.eng.ctx_mut(self.slot) {
            ctx.async_cb = Some(Box::new(callback));
        }
    }

    /// Sends the request body and registers the response callback. The
    /// callback fires exactly once: with the complete response, or with
    /// status 505 if the connection fails first.
    pub fn submit<F>(self, body: &[u8], callback: F) -> crate::Result<()>
    where
        F: FnOnce(&mut ClientResponse<'_>) + 'static,
    {
        if !self.core.raw.is_open(self.slot) {
            return Err(crate::Error::new_stale());
        }
        self.core.submit(self.slot, body, Box::new(callback));
        Ok(())
    }
}

/// The response handed to a submit callback.
pub struct ClientResponse<'a> {
    core: &'a mut Core,
    ctx: &'a mut RequestCtx,
    #[allow(dead_code)]
    slot: usize,
    body: &'a [u8],
}

impl<'a> ClientResponse<'a> {
    pub(crate) fn new(
        core: &'a mut Core,
        slot: usize,
        ctx: &'a mut RequestCtx,
        body: &'a [u8],
    ) -> ClientResponse<'a> {
        ClientResponse {
            core,
            ctx,
            slot,
            body,
        }
    }

    /// The response status code. 505 reports a connection that failed
    /// before a complete response arrived.
    pub fn status(&self) -> u16 {
        self.ctx.status
    }

    /// The status line's reason phrase.
    pub fn reason(&self) -> &str {
        &self.ctx.reason
    }

    /// The response body (empty for asynchronous responses, whose body
    /// goes to the transfer file).
    pub fn body(&self) -> &[u8] {
        self.body
    }

    /// A response header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.ctx.in_headers.get(name)
    }

    /// Streams the remaining body bytes to `file`. Only meaningful from
    /// an asynchronous callback, while the body is still arriving.
    pub fn transfer(&mut self, file: File, size: u64) {
        if self.ctx.transfer.is_some() {
            return;
        }
        let dir = if self.ctx.phase == Phase::AwaitingBody {
            Direction::In
        } else {
            Direction::Out
        };
        self.ctx.transfer = Some(crate::proto::conn::PendingTransfer { file, size, dir });
    }

    /// Follows a redirect response, preserving the original request
    /// headers. Behavior depends on the status:
    ///
    ///  - 301, 302, 307, 308: re-issue with the caller's `method`;
    ///  - 303: re-issue as `GET`;
    ///  - anything else: `Ok(None)`, not a redirect; handle the
    ///    response normally.
    ///
    /// On `Ok(Some(request))` the callback must rebuild the request body
    /// and submit it; relative `Location` values resolve against the
    /// original request's origin.
    pub fn redirected(&mut self, method: &str) -> crate::Result<Option<ClientRequest<'_>>> {
        let method = match self.ctx.status {
            301 | 302 | 307 | 308 => method,
            303 => "GET",
            _ => return Ok(None),
        };

        let location = match self.ctx.in_headers.get("Location") {
            Some(location) => location.to_owned(),
            None => return Err(crate::Error::new_redirect()),
        };
        let location = if location.starts_with('/') {
            match self.ctx.base_url.as_ref() {
                Some(base) => format!("{}{}", base, location),
                None => return Err(crate::Error::new_redirect()),
            }
        } else {
            location
        };
        debug!("redirected to {}", location);

        let id = self.core.open_client(method, &location)?;
        for (name, value) in self.ctx.out_headers.iter() {
            if let Some(ctx) = self.core.eng.ctx_mut(id) {
                ctx.out_headers.set(name, value);
            }
        }
        Ok(Some(ClientRequest::new(&mut *self.core, id)))
    }
}

impl std::fmt::Debug for ClientResponse<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientResponse")
            .field("status", &self.ctx.status)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_forms() {
        let t = parse_url("http://example.com/a/b?c=d").unwrap();
        assert!(!t.tls);
        assert_eq!((t.host, t.port, t.path), ("example.com", 80, "/a/b?c=d"));
        assert!(!t.explicit_port);

        let t = parse_url("https://example.com").unwrap();
        assert_eq!((t.port, t.path), (443, "/"));

        let t = parse_url("http://localhost:8080").unwrap();
        assert_eq!((t.host, t.port, t.path), ("localhost", 8080, "/"));
        assert!(t.explicit_port);
    }

    #[test]
    fn url_rejects() {
        assert!(parse_url("ftp://example.com/").is_err());
        assert!(parse_url("http:///nohost").is_err());
        assert!(parse_url("http://host:notaport/").is_err());
        let long = format!("http://{}/", "h".repeat(64));
        assert!(parse_url(&long).is_err());
    }
}
