//! Buffered lookahead for format sniffing.
//!
//! Deciding how to read an input (bare format by magic bytes, tagged
//! container, BGZF envelope) requires inspecting leading bytes without
//! consuming them, including on standard input where no seeking is
//! possible. [`PeekReader`] wraps any reader with a growable internal
//! buffer so sniffers can look at an arbitrary prefix and leave the stream
//! exactly as they found it.

use std::io::{self, BufRead, Read};

/// How much lookahead sniffing ever needs: a 64-bit varint, a 32-bit
/// varint, and a maximum-length tag.
pub const SNIFF_WINDOW: usize = crate::varint::MAX_VARINT64_LEN
    + crate::varint::MAX_VARINT32_LEN
    + crate::registry::MAX_TAG_LENGTH;

/// Non-destructive lookahead, as needed by format sniffers.
///
/// A sniffer that consumes more than it restores violates this contract;
/// going through `peek` makes that impossible.
pub trait Peek {
    /// Look at up to `n` unconsumed bytes without consuming them. Returns
    /// fewer than `n` bytes only when the stream ends first.
    fn peek(&mut self, n: usize) -> io::Result<&[u8]>;
}

/// A reader with non-destructive lookahead.
///
/// Bytes returned by [`peek`](PeekReader::peek) stay available to
/// subsequent `read`/`fill_buf` calls. The buffer grows to whatever window
/// a caller asks to see, so `peek(n)` never loses data.
pub struct PeekReader<R> {
    inner: R,
    buffer: Vec<u8>,
    /// Valid bytes in `buffer`.
    filled: usize,
    /// Bytes of `buffer` already consumed by reads.
    pos: usize,
}

impl<R: Read> PeekReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, buffer: vec![0u8; SNIFF_WINDOW.max(64)], filled: 0, pos: 0 }
    }

    /// Look at up to `n` unconsumed bytes without consuming them.
    ///
    /// Returns fewer than `n` bytes only when the stream ends first.
    pub fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        // Compact consumed bytes away so the window fits.
        if self.pos > 0 && self.filled - self.pos + n > self.buffer.len() {
            self.buffer.copy_within(self.pos..self.filled, 0);
            self.filled -= self.pos;
            self.pos = 0;
        }
        if self.pos + n > self.buffer.len() {
            self.buffer.resize(self.pos + n, 0);
        }
        while self.filled - self.pos < n {
            let read = self.inner.read(&mut self.buffer[self.filled..])?;
            if read == 0 {
                break;
            }
            self.filled += read;
        }
        let available = (self.filled - self.pos).min(n);
        Ok(&self.buffer[self.pos..self.pos + available])
    }

    /// Unwrap the inner reader. Any buffered-but-unconsumed bytes are lost,
    /// so only call this when the buffer has been drained.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Peek for PeekReader<R> {
    fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        PeekReader::peek(self, n)
    }
}

impl<R: Read> Read for PeekReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.filled {
            let n = buf.len().min(self.filled - self.pos);
            buf[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        self.inner.read(buf)
    }
}

impl<R: Read> BufRead for PeekReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.pos >= self.filled {
            self.pos = 0;
            self.filled = self.inner.read(&mut self.buffer)?;
        }
        Ok(&self.buffer[self.pos..self.filled])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.filled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_peek_does_not_consume() {
        let mut reader = PeekReader::new(Cursor::new(b"abcdef".to_vec()));
        assert_eq!(reader.peek(3).unwrap(), b"abc");
        assert_eq!(reader.peek(3).unwrap(), b"abc");

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn test_peek_past_end() {
        let mut reader = PeekReader::new(Cursor::new(b"ab".to_vec()));
        assert_eq!(reader.peek(10).unwrap(), b"ab");
        assert_eq!(reader.peek(1).unwrap(), b"a");
    }

    #[test]
    fn test_peek_empty_stream() {
        let mut reader = PeekReader::new(Cursor::new(Vec::<u8>::new()));
        assert_eq!(reader.peek(4).unwrap(), b"");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_peek_after_partial_read() {
        let mut reader = PeekReader::new(Cursor::new(b"0123456789".to_vec()));
        assert_eq!(reader.peek(4).unwrap(), b"0123");

        let mut head = [0u8; 2];
        reader.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"01");

        assert_eq!(reader.peek(4).unwrap(), b"2345");
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"23456789");
    }

    #[test]
    fn test_peek_window_larger_than_initial_buffer() {
        let data: Vec<u8> = (0..=255).collect();
        let mut reader = PeekReader::new(Cursor::new(data.clone()));
        assert_eq!(reader.peek(200).unwrap(), &data[..200]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_bufread_interface() {
        let mut reader = PeekReader::new(Cursor::new(b"line one\nline two\n".to_vec()));
        assert_eq!(reader.peek(4).unwrap(), b"line");
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "line one\n");
    }
}
