//! TLS for outbound (`https://`) connections.
//!
//! The TLS state machine is sans-IO: records move between the socket and
//! `rustls` on readiness events, decrypted plaintext lands in the slot's
//! regular input buffer, and plaintext queued for sending waits in a
//! dedicated buffer until the TLS layer accepts it. Kernel zero-copy is
//! not possible here, so file transfers are pumped through the same
//! buffer with plain reads.

use std::convert::TryFrom;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use rustls_pki_types::ServerName;
use tracing::{debug, trace, warn};

use crate::reactor::io::{Cursor, FileTransfer, BUFFER_SIZE};
use crate::reactor::{Managed, Transport};

/// Plaintext staged on either side of the TLS layer.
const TLS_BUFFER: usize = 100 * 1024;

/// What a readiness pass concluded about the connection.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum TlsOutcome {
    /// Connection still healthy.
    Ok,
    /// The peer ended the connection.
    Eof,
    /// Unrecoverable TLS failure.
    Fatal,
}

pub(crate) struct TlsState {
    conn: ClientConnection,
    /// Plaintext waiting to enter the TLS layer.
    out: Cursor,
    transfer: Option<FileTransfer>,
}

impl TlsState {
    /// Creates the per-connection state, with SNI set to `host`, and
    /// starts the handshake (the first flight goes out on the first
    /// writable event).
    pub fn new(config: Arc<ClientConfig>, host: &str) -> crate::Result<TlsState> {
        let name = ServerName::try_from(host.to_owned()).map_err(crate::Error::new_tls)?;
        let conn = ClientConnection::new(config, name).map_err(crate::Error::new_tls)?;
        Ok(TlsState {
            conn,
            out: Cursor::with_capacity(TLS_BUFFER),
            transfer: None,
        })
    }

    /// Whether the reactor should watch for writable readiness.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write() || self.out.remaining() > 0 || self.transfer.is_some()
    }

    /// Attaches the file streamed after the buffered plaintext.
    pub fn set_transfer(&mut self, file: File, size: u64) {
        self.transfer = Some(FileTransfer {
            file,
            remaining: size,
        });
    }
}

impl std::fmt::Debug for TlsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsState")
            .field("handshaking", &self.conn.is_handshaking())
            .field("pending", &self.out.remaining())
            .finish()
    }
}

/// Queues plaintext for the peer, sending as much as the TLS layer and
/// the socket will take right now. Returns how much was accepted.
pub(crate) fn send(m: &mut Managed, data: &[u8]) -> usize {
    let Managed {
        stream, transport, ..
    } = m;
    let tls = match transport {
        Transport::Tls(tls) => tls,
        Transport::Plain => return 0,
    };
    let stored = tls.out.fill(data);
    if stored < data.len() {
        warn!("TLS send buffer full, dropping {} bytes", data.len() - stored);
    }
    // Transport errors here surface on the next readiness pass.
    let _ = flush(stream, tls);
    stored
}

/// Moves staged plaintext into the TLS layer and TLS records onto the
/// socket.
fn flush(stream: &mut TcpStream, tls: &mut TlsState) -> std::io::Result<()> {
    loop {
        while tls.out.remaining() > 0 {
            match tls.conn.writer().write(tls.out.chunk()) {
                Ok(0) => break,
                Ok(n) => tls.out.advance(n),
                Err(e) => return Err(e),
            }
        }
        let mut wrote = false;
        while tls.conn.wants_write() {
            match tls.conn.write_tls(stream) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ))
                }
                Ok(n) => {
                    trace!("wrote {} TLS bytes", n);
                    wrote = true;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        // Records leaving may have freed room for more plaintext.
        if tls.out.remaining() == 0 || !wrote {
            return Ok(());
        }
    }
}

/// Refills the plaintext buffer from the transfer file.
fn pump_transfer(tls: &mut TlsState) {
    let mut scratch = [0u8; 4096];
    while let Some(transfer) = tls.transfer.as_mut() {
        let take = tls
            .out
            .room()
            .min(scratch.len())
            .min(transfer.remaining as usize);
        if take == 0 {
            if transfer.remaining == 0 {
                tls.transfer = None;
                continue;
            }
            return; // buffer full, resume on the next pass
        }
        match transfer.file.read(&mut scratch[..take]) {
            Ok(0) => {
                warn!("transfer file ended early, truncating");
                tls.transfer = None;
            }
            Ok(n) => {
                tls.out.fill(&scratch[..n]);
                transfer.remaining -= n as u64;
                if transfer.remaining == 0 {
                    debug!("TLS file transfer complete");
                    tls.transfer = None;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("transfer file read failed: {}", e);
                tls.transfer = None;
            }
        }
    }
}

/// Drives the connection on a readiness event: ingests records, advances
/// the handshake, decrypts into the slot's input buffer, and pushes
/// pending output. The caller feeds whatever landed in the input buffer
/// to the protocol layer afterwards.
pub(crate) fn ready(m: &mut Managed, readable: bool) -> TlsOutcome {
    let Managed {
        stream,
        transport,
        inbuf,
        ..
    } = m;
    let tls = match transport {
        Transport::Tls(tls) => tls,
        Transport::Plain => return TlsOutcome::Ok,
    };

    let mut saw_eof = false;
    if readable {
        loop {
            match tls.conn.read_tls(stream) {
                Ok(0) => {
                    saw_eof = true;
                    break;
                }
                Ok(n) => trace!("read {} TLS bytes", n),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("TLS transport error: {}", e);
                    return TlsOutcome::Fatal;
                }
            }
        }
    }

    if let Err(e) = tls.conn.process_new_packets() {
        debug!("TLS protocol error: {}", e);
        // Try to flush the alert before the caller closes the socket.
        let _ = tls.conn.write_tls(stream);
        return TlsOutcome::Fatal;
    }

    // Decrypted plaintext goes to the regular input buffer.
    loop {
        let len = inbuf.len();
        let room = BUFFER_SIZE - len;
        if room == 0 {
            break;
        }
        inbuf.resize(len + room, 0);
        match tls.conn.reader().read(&mut inbuf[len..]) {
            Ok(0) => {
                inbuf.truncate(len);
                saw_eof = true;
                break;
            }
            Ok(n) => inbuf.truncate(len + n),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                inbuf.truncate(len);
                break;
            }
            Err(e) => {
                inbuf.truncate(len);
                debug!("TLS close without notify: {}", e);
                saw_eof = true;
                break;
            }
        }
    }

    // Flush, and keep refilling from the transfer file until either it
    // is finished or the socket stops taking bytes; stopping earlier
    // would strand the transfer with no further event to resume it.
    loop {
        if flush(stream, tls).is_err() && !saw_eof {
            return TlsOutcome::Fatal;
        }
        if tls.conn.is_handshaking() || tls.transfer.is_none() {
            break;
        }
        if tls.out.remaining() > 0 || tls.conn.wants_write() {
            break; // socket full, resume on the next writable event
        }
        pump_transfer(tls);
    }

    if saw_eof {
        TlsOutcome::Eof
    } else {
        TlsOutcome::Ok
    }
}

fn load_certs(roots: &mut RootCertStore, path: &Path) -> (usize, usize) {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return (0, 0),
    };
    let mut reader = BufReader::new(file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .filter_map(|cert| cert.ok())
        .collect();
    roots.add_parsable_certificates(certs)
}

/// Builds the shared client configuration, loading trusted roots from a
/// CA bundle file or a directory of PEM files.
pub(crate) fn client_config(certs: &Path) -> crate::Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    let mut loaded = (0, 0);
    if certs.is_dir() {
        if let Ok(entries) = std::fs::read_dir(certs) {
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.is_file() {
                    let (added, skipped) = load_certs(&mut roots, &path);
                    loaded.0 += added;
                    loaded.1 += skipped;
                }
            }
        }
    } else {
        loaded = load_certs(&mut roots, certs);
    }
    debug!("loaded {} CA certificates ({} skipped)", loaded.0, loaded.1);
    if roots.is_empty() {
        return Err(crate::Error::new_tls(format!(
            "no CA certificates found at {}",
            certs.display()
        )));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(crate::Error::new_tls)?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_roots_are_an_error() {
        let err = client_config(Path::new("/nonexistent/certs")).unwrap_err();
        assert!(err.is_tls());
    }
}
