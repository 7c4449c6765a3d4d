//! The per-connection output pipeline.
//!
//! Bytes queued for a peer land in a fixed inline buffer first; once that
//! is full, further bytes overflow into a FIFO of owned heap chunks. After
//! every queued byte has reached the socket, an optional file descriptor
//! is streamed with `sendfile(2)`. That order is what keeps an HTTP
//! preamble ahead of the file bytes on the wire.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use bytes::Bytes;

/// Size of the inline input and output buffers.
pub(crate) const BUFFER_SIZE: usize = 128 * 1024;

/// Largest span handed to one `send`/`sendfile` call. Matching the
/// ethernet frame size keeps single writes from monopolizing the loop.
pub(crate) const ETH_MAX_FRAME: usize = 1500;

/// A fixed-capacity buffer drained from a moving start offset.
pub(crate) struct Cursor {
    bytes: Vec<u8>,
    pos: usize,
    cap: usize,
}

impl Cursor {
    pub(crate) fn with_capacity(capacity: usize) -> Cursor {
        Cursor {
            bytes: Vec::with_capacity(capacity),
            pos: 0,
            cap: capacity,
        }
    }

    /// Appends as much of `data` as fits; returns how many bytes fit.
    pub(crate) fn fill(&mut self, data: &[u8]) -> usize {
        let room = self.room().min(data.len());
        self.bytes.extend_from_slice(&data[..room]);
        room
    }

    /// Free space left for `fill`.
    pub(crate) fn room(&self) -> usize {
        self.cap - self.bytes.len()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub(crate) fn chunk(&self) -> &[u8] {
        &self.bytes[self.pos..]
    }

    pub(crate) fn advance(&mut self, cnt: usize) {
        debug_assert!(self.pos + cnt <= self.bytes.len());
        self.pos += cnt;
        if self.pos == self.bytes.len() {
            self.reset();
        }
    }

    pub(crate) fn reset(&mut self) {
        self.pos = 0;
        self.bytes.clear();
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("pos", &self.pos)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A file being streamed as the tail of the output.
#[derive(Debug)]
pub(crate) struct FileTransfer {
    pub file: File,
    pub remaining: u64,
}

#[derive(Debug)]
pub(crate) struct OutputBuffer {
    inline: Cursor,
    queue: VecDeque<Bytes>,
    pub(crate) transfer: Option<FileTransfer>,
}

impl OutputBuffer {
    pub(crate) fn new() -> OutputBuffer {
        OutputBuffer {
            inline: Cursor::with_capacity(BUFFER_SIZE),
            queue: VecDeque::new(),
            transfer: None,
        }
    }

    /// Queues `data` behind everything already queued.
    pub(crate) fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.queue.is_empty() {
            let taken = self.inline.fill(data);
            if taken < data.len() {
                self.queue.push_back(Bytes::copy_from_slice(&data[taken..]));
            }
        } else {
            // The inline buffer stops accepting once overflow starts, so
            // drain order stays first-in first-out.
            self.queue.push_back(Bytes::copy_from_slice(data));
        }
    }

    /// Attaches the file streamed after all queued bytes. The transfer
    /// owns the descriptor from here on.
    pub(crate) fn set_transfer(&mut self, file: File, size: u64) {
        self.transfer = Some(FileTransfer {
            file,
            remaining: size,
        });
    }

    /// True when queued bytes remain (not counting a file transfer).
    pub(crate) fn has_bytes(&self) -> bool {
        self.inline.remaining() > 0 || !self.queue.is_empty()
    }

    /// True when nothing at all is pending.
    pub(crate) fn is_idle(&self) -> bool {
        !self.has_bytes() && self.transfer.is_none()
    }

    /// The span to hand to the next `send` call.
    pub(crate) fn chunk(&self) -> &[u8] {
        if self.inline.remaining() > 0 {
            self.inline.chunk()
        } else {
            self.queue.front().map(|b| &b[..]).unwrap_or(&[])
        }
    }

    pub(crate) fn advance(&mut self, mut cnt: usize) {
        let inline = self.inline.remaining().min(cnt);
        if inline > 0 {
            self.inline.advance(inline);
            cnt -= inline;
        }
        while cnt > 0 {
            let front = self.queue.front_mut().expect("advance past queued data");
            if front.len() > cnt {
                let _ = front.split_to(cnt);
                return;
            }
            cnt -= front.len();
            self.queue.pop_front();
        }
    }

}

/// One `sendfile` slice from `transfer` to `socket`. The kernel advances
/// the file offset itself. Returns the byte count moved.
pub(crate) fn sendfile(socket: RawFd, transfer: &mut FileTransfer) -> io::Result<usize> {
    let count = (transfer.remaining as usize).min(ETH_MAX_FRAME);
    let sent = unsafe {
        libc::sendfile(
            socket,
            transfer.file.as_raw_fd(),
            std::ptr::null_mut(),
            count,
        )
    };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    if sent == 0 {
        // The file ran short of the announced size.
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "transfer file ended early",
        ));
    }
    transfer.remaining -= sent as u64;
    Ok(sent as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(out: &mut OutputBuffer) -> Vec<u8> {
        let mut all = Vec::new();
        while out.has_bytes() {
            let chunk = out.chunk().to_vec();
            let take = chunk.len().min(ETH_MAX_FRAME);
            all.extend_from_slice(&chunk[..take]);
            out.advance(take);
        }
        all
    }

    #[test]
    fn drains_in_push_order() {
        let mut out = OutputBuffer::new();
        out.push(b"hello ");
        out.push(b"world, ");
        out.push(b"it's ember!");
        assert_eq!(drain(&mut out), b"hello world, it's ember!");
        assert!(out.is_idle());
    }

    #[test]
    fn overflow_keeps_ordering() {
        let mut out = OutputBuffer::new();
        let big = vec![b'a'; BUFFER_SIZE - 3];
        out.push(&big);
        out.push(b"XYZ123");
        out.push(b"tail");
        let drained = drain(&mut out);
        assert_eq!(drained.len(), big.len() + 10);
        assert_eq!(&drained[big.len()..], b"XYZ123tail");
    }

    #[test]
    fn partial_advance_straddles_buffers() {
        let mut out = OutputBuffer::new();
        let big = vec![b'x'; BUFFER_SIZE];
        out.push(&big);
        out.push(b"overflow");
        out.advance(BUFFER_SIZE - 2);
        assert_eq!(out.chunk(), b"xx");
        out.advance(2);
        assert_eq!(out.chunk(), b"overflow");
    }

    #[test]
    fn inline_capacity_is_reused_after_drain() {
        let mut out = OutputBuffer::new();
        for _ in 0..8 {
            out.push(&vec![b'y'; BUFFER_SIZE / 2]);
            let drained = drain(&mut out);
            assert_eq!(drained.len(), BUFFER_SIZE / 2);
            assert!(out.queue.is_empty());
        }
    }

    #[test]
    fn transfer_counts_as_pending_output() {
        let mut out = OutputBuffer::new();
        // tests never read the file, any object will do
        out.set_transfer(File::open("/dev/null").unwrap(), 10);
        assert!(!out.has_bytes());
        assert!(!out.is_idle());
    }
}
