//! Chunked transfer decoding.
//!
//! The decoder works on a body that is already fully buffered: chunk data
//! is compacted over the size lines in place, so the caller ends up with
//! one contiguous decoded body at the start of the region. Bodies whose
//! final chunk has not arrived yet are reported as incomplete, so the
//! caller can simply wait for more input and try again.

use std::fmt;

#[derive(Debug, PartialEq)]
pub(crate) enum ChunkError {
    /// The terminating zero-size chunk is not in the buffer yet.
    Incomplete,
    /// The chunk framing is malformed.
    Invalid(&'static str),
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkError::Incomplete => f.write_str("incomplete chunked data"),
            ChunkError::Invalid(reason) => f.write_str(reason),
        }
    }
}

/// Decodes the chunked body found at `buf[start..]`.
///
/// Returns `(decoded, consumed)`: the decoded body occupies
/// `buf[start..start + decoded]` and the encoding consumed `consumed`
/// bytes of input, including the terminating chunk and its trailing CRLF.
///
/// The buffer is scanned before anything moves, so an incomplete body
/// leaves it untouched and the call can simply be repeated once more
/// bytes have arrived.
pub(crate) fn decode_in_place(buf: &mut [u8], start: usize) -> Result<(usize, usize), ChunkError> {
    let mut chunks: Vec<(usize, usize)> = Vec::new();
    let mut read = start;

    loop {
        // Skip the CRLF left over from the previous chunk (and any other
        // leading whitespace, as a tolerance).
        while read < buf.len() && buf[read] <= b' ' {
            read += 1;
        }
        if read >= buf.len() {
            return Err(ChunkError::Incomplete);
        }

        let mut size: usize = 0;
        let mut digits = 0;
        while let Some(value) = buf.get(read).copied().and_then(hex_value) {
            size = size
                .checked_mul(16)
                .and_then(|s| s.checked_add(value as usize))
                .ok_or(ChunkError::Invalid("chunk size overflow"))?;
            digits += 1;
            read += 1;
        }
        if digits == 0 {
            return Err(ChunkError::Invalid("invalid chunk size"));
        }

        // Skip chunk extensions through the end of the size line.
        while read < buf.len() && buf[read] != b'\n' {
            read += 1;
        }
        if read >= buf.len() {
            return Err(ChunkError::Incomplete);
        }
        read += 1;

        if size == 0 {
            // Terminating chunk; absorb the final CRLF when present.
            // Trailer fields are not supported.
            if buf[read..].starts_with(b"\r\n") {
                read += 2;
            }
            break;
        }

        if read + size > buf.len() {
            return Err(ChunkError::Incomplete);
        }
        chunks.push((read, size));
        read += size;
    }

    // The whole body is present; now elide the framing.
    let mut write = start;
    for (data, size) in chunks {
        buf.copy_within(data..data + size, write);
        write += size;
    }

    Ok((write - start, read - start))
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(input: &[u8]) -> Result<(Vec<u8>, usize), ChunkError> {
        let mut buf = input.to_vec();
        let (decoded, consumed) = decode_in_place(&mut buf, 0)?;
        Ok((buf[..decoded].to_vec(), consumed))
    }

    #[test]
    fn decodes_two_chunks() {
        let (body, consumed) = decode(b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n").unwrap();
        assert_eq!(body, b"Wikipedia");
        assert_eq!(consumed, 24);
    }

    #[test]
    fn decodes_with_offset_and_pipelined_tail() {
        let mut buf = b"HEAD3\r\nabc\r\n0\r\n\r\nGET /".to_vec();
        let (decoded, consumed) = decode_in_place(&mut buf, 4).unwrap();
        assert_eq!(&buf[4..4 + decoded], b"abc");
        assert_eq!(&buf[4 + consumed..], b"GET /");
    }

    #[test]
    fn empty_body() {
        let (body, consumed) = decode(b"0\r\n\r\n").unwrap();
        assert_eq!(body, b"");
        assert_eq!(consumed, 5);
    }

    #[test]
    fn hex_sizes_and_extensions() {
        let (body, _) = decode(b"A;name=value\r\n0123456789\r\n0\r\n\r\n").unwrap();
        assert_eq!(body, b"0123456789");
    }

    #[test]
    fn incomplete_without_terminator() {
        assert_eq!(decode(b"4\r\nWiki\r\n").unwrap_err(), ChunkError::Incomplete);
        assert_eq!(decode(b"4\r\nWi").unwrap_err(), ChunkError::Incomplete);
        assert_eq!(decode(b"").unwrap_err(), ChunkError::Incomplete);
    }

    #[test]
    fn incomplete_leaves_buffer_untouched() {
        let mut buf = b"4\r\nWiki\r\n5\r\npe".to_vec();
        let before = buf.clone();
        assert_eq!(decode_in_place(&mut buf, 0).unwrap_err(), ChunkError::Incomplete);
        assert_eq!(buf, before);
        buf.extend_from_slice(b"dia\r\n0\r\n\r\n");
        let (decoded, _) = decode_in_place(&mut buf, 0).unwrap();
        assert_eq!(&buf[..decoded], b"Wikipedia");
    }

    #[test]
    fn rejects_garbage_size() {
        assert!(matches!(
            decode(b"zz\r\ndata\r\n0\r\n\r\n").unwrap_err(),
            ChunkError::Invalid(_)
        ));
    }
}
