//! The socket layer: a readiness loop over the listening socket, every
//! peer connection, and any file descriptor the application registers.
//!
//! This module owns sockets, buffers and deadlines but knows nothing about
//! HTTP; the protocol layer drives it through the slot accessors and gets
//! handed raw bytes back. All slot bookkeeping is indexed by a small dense
//! integer (the `mio` token), never by file descriptor: the OS reuses fd
//! numbers, slot numbers recycle through an explicit free list.

pub(crate) mod io;

use std::ffi::CString;
use std::io::{Read, Write};
use std::net::{Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace, warn};

use self::io::{OutputBuffer, BUFFER_SIZE, ETH_MAX_FRAME};
use crate::tls::TlsState;

/// What to watch a registered file descriptor for, and what it was ready
/// for when a listener fires.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Watch(u8);

impl Watch {
    /// Watch nothing; registering with this removes the registration.
    pub const IDLE: Watch = Watch(0);
    /// Readable interest.
    pub const READ: Watch = Watch(1);
    /// Writable interest.
    pub const WRITE: Watch = Watch(2);

    /// True when read interest/readiness is included.
    pub fn is_read(self) -> bool {
        self.0 & 1 != 0
    }

    /// True when write interest/readiness is included.
    pub fn is_write(self) -> bool {
        self.0 & 2 != 0
    }

    /// True when neither direction is included.
    pub fn is_idle(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Watch {
    type Output = Watch;
    fn bitor(self, other: Watch) -> Watch {
        Watch(self.0 | other.0)
    }
}

/// Transport framing of a managed connection.
pub(crate) enum Transport {
    Plain,
    Tls(Box<TlsState>),
}

/// A TCP connection the core owns end to end.
pub(crate) struct Managed {
    pub stream: TcpStream,
    pub peer: Option<SocketAddr>,
    pub transport: Transport,
    pub inbuf: Vec<u8>,
    pub out: OutputBuffer,
    /// Epoch second after which an idle connection is pruned; 0 disables.
    pub deadline: u64,
    /// Buffered input is waiting for the previous response to drain.
    pub refeed: bool,
    /// Close as soon as all queued output reached the socket.
    pub close_when_drained: bool,
    /// Output was queued since the last registration; forces a
    /// re-register so the edge-triggered writable event re-arms even
    /// when the interest itself is unchanged.
    pub kick: bool,
    interest: Option<Interest>,
}

/// An application file descriptor watched on behalf of a listener
/// callback. `owned` descriptors are closed when the slot goes away.
pub(crate) struct AppFd {
    pub fd: RawFd,
    pub watch: Watch,
    pub premium: bool,
    pub owned: bool,
    interest: Option<Interest>,
}

pub(crate) enum SlotKind {
    Managed(Box<Managed>),
    App(AppFd),
}

/// One readiness report out of a poll round.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Ready {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
}

/// Result of draining a peer socket into the slot's input buffer.
#[derive(Debug, Default)]
pub(crate) struct Received {
    pub bytes: usize,
    pub eof: bool,
    pub full: bool,
}

pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    port: u16,
    dynamic: bool,
    pub(crate) ttl: u64,
    slots: Vec<Option<SlotKind>>,
    free: Vec<usize>,
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn fd_limit() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return 1024;
    }
    (limit.rlim_cur as usize).clamp(64, 65536)
}

fn connect_stream(host: &str, port: u16) -> crate::Result<(TcpStream, SocketAddr)> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(crate::Error::new_connect)?;
    let addr = addrs
        .next()
        .ok_or_else(|| crate::Error::new_connect("host has no address"))?;
    trace!("connecting to {}", addr);
    let stream = TcpStream::connect(addr).map_err(crate::Error::new_connect)?;
    Ok((stream, addr))
}

/// Opens a non-blocking TCP connection without assigning it a slot. The
/// caller owns the descriptor; watch it with `listen` or `adopt`.
pub(crate) fn connect_fd(host: &str, port: u16) -> crate::Result<RawFd> {
    let (stream, _) = connect_stream(host, port)?;
    Ok(stream.into_raw_fd())
}

/// Resolves a service argument: `dynamic`, a port number, or a service
/// name from the system services database.
fn service_port(service: &str) -> Option<u16> {
    if service == "dynamic" {
        return Some(0);
    }
    if let Ok(port) = service.parse::<u16>() {
        return Some(port);
    }
    let name = CString::new(service).ok()?;
    let proto = CString::new("tcp").ok()?;
    let entry = unsafe { libc::getservbyname(name.as_ptr(), proto.as_ptr()) };
    if entry.is_null() {
        return None;
    }
    Some(u16::from_be(unsafe { (*entry).s_port } as u16))
}

impl Reactor {
    /// Binds the dual-stack listening socket and sizes the slot table from
    /// the process file descriptor limit.
    pub fn open(service: &str, ttl: u64) -> crate::Result<Reactor> {
        // Write errors must surface through errno, not kill the process.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let port = service_port(service)
            .ok_or_else(|| crate::Error::new_listen(format!("invalid service name {}", service)))?;
        let dynamic = service == "dynamic";

        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .map_err(crate::Error::new_listen)?;
        // IPv6 listener with mapped IPv4 peers accepted as well.
        socket.set_only_v6(false).map_err(crate::Error::new_listen)?;
        socket
            .set_reuse_address(true)
            .map_err(crate::Error::new_listen)?;
        let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
        socket.bind(&addr.into()).map_err(crate::Error::new_listen)?;
        socket.listen(4).map_err(crate::Error::new_listen)?;
        socket
            .set_nonblocking(true)
            .map_err(crate::Error::new_listen)?;
        let mut listener = TcpListener::from_std(socket.into());
        let port = listener
            .local_addr()
            .map_err(crate::Error::new_listen)?
            .port();
        debug!("listening on port {}", port);

        let capacity = fd_limit();
        let poll = Poll::new().map_err(crate::Error::new_listen)?;
        poll.registry()
            .register(&mut listener, Token(capacity), Interest::READABLE)
            .map_err(crate::Error::new_listen)?;

        Ok(Reactor {
            poll,
            events: Events::with_capacity(256),
            listener: Some(listener),
            port,
            dynamic,
            ttl,
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn listener_token(&self) -> usize {
        self.slots.len()
    }

    pub fn is_open(&self, id: usize) -> bool {
        self.slots.get(id).map_or(false, |s| s.is_some())
    }

    pub fn managed(&self, id: usize) -> Option<&Managed> {
        match self.slots.get(id) {
            Some(Some(SlotKind::Managed(m))) => Some(m),
            _ => None,
        }
    }

    pub fn managed_mut(&mut self, id: usize) -> Option<&mut Managed> {
        match self.slots.get_mut(id) {
            Some(Some(SlotKind::Managed(m))) => Some(m),
            _ => None,
        }
    }

    pub fn app(&self, id: usize) -> Option<&AppFd> {
        match self.slots.get(id) {
            Some(Some(SlotKind::App(a))) => Some(a),
            _ => None,
        }
    }

    fn alloc(&mut self, kind: SlotKind) -> Option<usize> {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                warn!("too many connections, rejecting");
                return None;
            }
        };
        debug_assert!(self.slots[id].is_none());
        self.slots[id] = Some(kind);
        Some(id)
    }

    fn alloc_managed(&mut self, stream: TcpStream, peer: Option<SocketAddr>) -> Option<usize> {
        let deadline = if self.ttl > 0 {
            now_secs() + self.ttl
        } else {
            0
        };
        self.alloc(SlotKind::Managed(Box::new(Managed {
            stream,
            peer,
            transport: Transport::Plain,
            inbuf: Vec::with_capacity(BUFFER_SIZE),
            out: OutputBuffer::new(),
            deadline,
            refeed: false,
            close_when_drained: false,
            kick: false,
            interest: None,
        })))
    }

    /// Accepts one pending connection, if any. `Ok(None)` means the accept
    /// queue is drained (or the connection had to be turned away).
    pub fn accept(&mut self) -> std::io::Result<Option<usize>> {
        let listener = match self.listener.as_ref() {
            Some(listener) => listener,
            None => return Ok(None),
        };
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        };
        match self.alloc_managed(stream, Some(peer)) {
            Some(id) => {
                debug!("accepted peer {} as slot {}", peer, id);
                Ok(Some(id))
            }
            // Slot table exhausted: the stream drops, closing the socket.
            None => Ok(None),
        }
    }

    /// Opens a non-blocking outbound connection. The connection may still
    /// be in progress when this returns; the first writable event settles
    /// it.
    pub fn connect(&mut self, host: &str, port: u16) -> crate::Result<usize> {
        let (stream, addr) = connect_stream(host, port)?;
        self.alloc_managed(stream, Some(addr))
            .ok_or_else(crate::Error::new_capacity)
    }

    /// Registers (or updates, or with `Watch::IDLE` removes) an
    /// application file descriptor. `owned` descriptors are closed when
    /// their slot is released.
    pub fn register_fd(
        &mut self,
        fd: RawFd,
        watch: Watch,
        premium: bool,
        owned: bool,
    ) -> Option<usize> {
        for id in 0..self.slots.len() {
            let matches = match &self.slots[id] {
                Some(SlotKind::App(a)) => a.fd == fd,
                _ => false,
            };
            if !matches {
                continue;
            }
            if watch.is_idle() {
                self.release(id);
                return None;
            }
            if let Some(SlotKind::App(a)) = self.slots[id].as_mut() {
                a.watch = watch;
                a.premium = premium;
            }
            return Some(id);
        }
        if watch.is_idle() {
            return None;
        }
        self.alloc(SlotKind::App(AppFd {
            fd,
            watch,
            premium,
            owned,
            interest: None,
        }))
    }

    /// Stops watching `fd`. The application keeps ownership of the
    /// descriptor unless the slot was registered as owned.
    pub fn forget_fd(&mut self, fd: RawFd) {
        for id in 0..self.slots.len() {
            if let Some(SlotKind::App(a)) = &self.slots[id] {
                if a.fd == fd {
                    self.release(id);
                    return;
                }
            }
        }
    }

    /// Releases a slot: deregisters it, closes what the core owns, and
    /// recycles the index.
    pub fn release(&mut self, id: usize) {
        let kind = match self.slots.get_mut(id).and_then(|s| s.take()) {
            Some(kind) => kind,
            None => return,
        };
        match kind {
            SlotKind::Managed(mut m) => {
                if m.interest.is_some() {
                    let _ = self.poll.registry().deregister(&mut m.stream);
                }
                // Dropping the stream closes the socket; dropping the
                // output buffer closes any in-flight transfer file.
            }
            SlotKind::App(a) => {
                if a.interest.is_some() {
                    let _ = self.poll.registry().deregister(&mut SourceFd(&a.fd));
                }
                if a.owned {
                    unsafe {
                        libc::close(a.fd);
                    }
                }
            }
        }
        self.free.push(id);
    }

    /// Closes the listener and every slot. Used at shutdown.
    pub fn close_all(&mut self) {
        for id in 0..self.slots.len() {
            self.release(id);
        }
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
    }

    /// Recomputes and applies the poll interest of every slot. Writable
    /// interest wins while output is queued so a response drains before
    /// the next request is read.
    pub fn update_interests(&mut self) {
        for id in 0..self.slots.len() {
            let desired = match &self.slots[id] {
                Some(SlotKind::Managed(m)) => match &m.transport {
                    Transport::Plain => {
                        if !m.out.is_idle() {
                            Some(Interest::WRITABLE)
                        } else {
                            Some(Interest::READABLE)
                        }
                    }
                    Transport::Tls(tls) => {
                        if tls.wants_write() {
                            Some(Interest::READABLE.add(Interest::WRITABLE))
                        } else {
                            Some(Interest::READABLE)
                        }
                    }
                },
                Some(SlotKind::App(a)) => {
                    let mut interest = None;
                    if a.watch.is_read() {
                        interest = Some(Interest::READABLE);
                    }
                    if a.watch.is_write() {
                        interest = Some(match interest {
                            Some(i) => i.add(Interest::WRITABLE),
                            None => Interest::WRITABLE,
                        });
                    }
                    interest
                }
                None => continue,
            };

            let registry = self.poll.registry();
            match self.slots[id].as_mut() {
                Some(SlotKind::Managed(m)) => {
                    if m.interest == desired && !m.kick {
                        continue;
                    }
                    let result = match (m.interest, desired) {
                        (None, Some(interest)) => {
                            registry.register(&mut m.stream, Token(id), interest)
                        }
                        (Some(_), Some(interest)) => {
                            registry.reregister(&mut m.stream, Token(id), interest)
                        }
                        (Some(_), None) => registry.deregister(&mut m.stream),
                        (None, None) => Ok(()),
                    };
                    if result.is_ok() {
                        m.interest = desired;
                        m.kick = false;
                    }
                }
                Some(SlotKind::App(a)) => {
                    if a.interest == desired {
                        continue;
                    }
                    let mut source = SourceFd(&a.fd);
                    let result = match (a.interest, desired) {
                        (None, Some(interest)) => registry.register(&mut source, Token(id), interest),
                        (Some(_), Some(interest)) => {
                            registry.reregister(&mut source, Token(id), interest)
                        }
                        (Some(_), None) => registry.deregister(&mut source),
                        (None, None) => Ok(()),
                    };
                    if result.is_ok() {
                        a.interest = desired;
                    } else {
                        warn!("cannot watch fd {}: {:?}", a.fd, result);
                    }
                }
                None => {}
            }
        }
    }

    /// Waits for readiness, up to `timeout`.
    pub fn poll_events(&mut self, timeout: Duration) -> std::io::Result<Vec<Ready>> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        Ok(self
            .events
            .iter()
            .map(|event| Ready {
                token: event.token().0,
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
            })
            .collect())
    }

    fn extend_deadline(deadline: &mut u64, ttl: u64) {
        if ttl > 0 && *deadline > 0 {
            let next = now_secs() + ttl;
            if next > *deadline {
                *deadline = next;
            }
        }
    }

    /// Drains the peer socket into the slot's input buffer.
    pub fn receive(&mut self, id: usize) -> std::io::Result<Received> {
        let ttl = self.ttl;
        let m = match self.managed_mut(id) {
            Some(m) => m,
            None => return Ok(Received::default()),
        };
        let mut received = Received::default();
        loop {
            let len = m.inbuf.len();
            let room = BUFFER_SIZE - len;
            if room == 0 {
                received.full = true;
                break;
            }
            m.inbuf.resize(len + room, 0);
            match m.stream.read(&mut m.inbuf[len..]) {
                Ok(0) => {
                    m.inbuf.truncate(len);
                    received.eof = true;
                    break;
                }
                Ok(n) => {
                    m.inbuf.truncate(len + n);
                    received.bytes += n;
                    trace!("read {} bytes from slot {}", n, id);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    m.inbuf.truncate(len);
                    break;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    m.inbuf.truncate(len);
                    continue;
                }
                Err(e) => {
                    m.inbuf.truncate(len);
                    return Err(e);
                }
            }
        }
        if received.bytes > 0 {
            Self::extend_deadline(&mut m.deadline, ttl);
        }
        Ok(received)
    }

    /// Pushes queued output, then the file transfer, to the socket.
    /// Transient write conditions leave the state as-is for the next
    /// writable event.
    pub fn transmit(&mut self, id: usize) -> std::io::Result<()> {
        let ttl = self.ttl;
        let m = match self.managed_mut(id) {
            Some(m) => m,
            None => return Ok(()),
        };
        let Managed {
            stream,
            out,
            deadline,
            ..
        } = &mut *m;
        let mut progressed = false;
        loop {
            if out.has_bytes() {
                let take = out.chunk().len().min(ETH_MAX_FRAME);
                match stream.write(&out.chunk()[..take]) {
                    Ok(0) => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "socket accepted no bytes",
                        ))
                    }
                    Ok(n) => {
                        trace!("sent {} bytes to slot {}", n, id);
                        out.advance(n);
                        progressed = true;
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            } else if let Some(transfer) = out.transfer.as_mut() {
                if transfer.remaining == 0 {
                    out.transfer = None;
                    continue;
                }
                match io::sendfile(stream.as_raw_fd(), transfer) {
                    Ok(n) => {
                        trace!("transferred {} file bytes to slot {}", n, id);
                        progressed = true;
                        if transfer.remaining == 0 {
                            debug!("file transfer to slot {} complete", id);
                            out.transfer = None;
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            } else {
                break;
            }
        }
        if progressed {
            Self::extend_deadline(deadline, ttl);
        }
        Ok(())
    }

    /// Slots whose idle deadline has passed. Slots still transferring or
    /// with queued output are never pruned.
    pub fn expired(&self, now: u64) -> Vec<usize> {
        let mut expired = Vec::new();
        for id in 0..self.slots.len() {
            if let Some(SlotKind::Managed(m)) = &self.slots[id] {
                if m.deadline != 0 && now > m.deadline && m.out.is_idle() {
                    expired.push(id);
                }
            }
        }
        expired
    }

    pub fn managed_ids(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&id| matches!(self.slots[id], Some(SlotKind::Managed(_))))
            .collect()
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("port", &self.port)
            .field("capacity", &self.slots.len())
            .field("free", &self.free.len())
            .finish()
    }
}
