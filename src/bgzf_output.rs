//! Buffered BGZF output with virtual-offset tracking.
//!
//! [`BgzfOutput`] buffers uncompressed bytes, emits complete BGZF blocks
//! as the buffer fills, and knows at every moment the virtual offset of
//! the next byte to be written, so callers can index what they emit.
//! Finishing the stream appends the EOF sentinel block exactly once.

use std::io::{self, Write};

use vpkg_bgzf::{BGZF_EOF, BlockCompressor};

/// Write half of the BGZF transport: buffered block compression with
/// virtual offsets.
pub struct BgzfOutput<W: Write> {
    inner: Option<W>,
    compressor: BlockCompressor,
    /// Compressed bytes already handed to the backing writer.
    compressed_written: u64,
    /// Uncompressed bytes accepted so far.
    uncompressed_written: u64,
    ended: bool,
}

impl<W: Write> BgzfOutput<W> {
    /// Wrap a writer at the default compression level.
    pub fn new(inner: W) -> Self {
        Self::with_level(inner, 6)
    }

    /// Wrap a writer at a specific deflate level (1..=12).
    pub fn with_level(inner: W, level: u32) -> Self {
        BgzfOutput {
            inner: Some(inner),
            compressor: BlockCompressor::new(level),
            compressed_written: 0,
            uncompressed_written: 0,
            ended: false,
        }
    }

    /// Virtual offset of the next byte to be written: the compressed
    /// offset where the current block will start, packed with the bytes
    /// already buffered into that block.
    #[must_use]
    pub fn tell(&self) -> i64 {
        ((self.compressed_written << 16) | self.compressor.pending_len() as u64) as i64
    }

    /// Total uncompressed bytes accepted.
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.uncompressed_written
    }

    /// Cut the current block short and write it out, so everything
    /// accepted so far is in the backing writer (which is also flushed).
    /// Does not write the EOF sentinel.
    pub fn flush_blocks(&mut self) -> io::Result<()> {
        self.compressor.flush()?;
        self.drain_completed()?;
        self.writer()?.flush()
    }

    /// Flush and append the EOF sentinel block. Idempotent.
    pub fn end_file(&mut self) -> io::Result<()> {
        if self.ended {
            return Ok(());
        }
        self.compressor.flush()?;
        self.drain_completed()?;
        let writer = self.writer()?;
        writer.write_all(&BGZF_EOF)?;
        writer.flush()?;
        self.compressed_written += BGZF_EOF.len() as u64;
        self.ended = true;
        Ok(())
    }

    /// End the file and hand back the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.end_file()?;
        Ok(self.inner.take().expect("inner writer present until finish"))
    }

    fn drain_completed(&mut self) -> io::Result<()> {
        let blocks = self.compressor.take_blocks();
        if blocks.is_empty() {
            return Ok(());
        }
        let written: &mut u64 = &mut self.compressed_written;
        let writer = self.inner.as_mut().ok_or_else(closed)?;
        for block in blocks {
            writer.write_all(&block)?;
            *written += block.len() as u64;
        }
        Ok(())
    }

    fn writer(&mut self) -> io::Result<&mut W> {
        self.inner.as_mut().ok_or_else(closed)
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "BGZF output already finished")
}

impl<W: Write> Write for BgzfOutput<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.compressor.write_all(buf)?;
        self.uncompressed_written += buf.len() as u64;
        self.drain_completed()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_blocks()
    }
}

impl<W: Write> Drop for BgzfOutput<W> {
    fn drop(&mut self) {
        if self.inner.is_some() && !self.ended {
            if let Err(e) = self.end_file() {
                log::error!("failed to finalize BGZF output: {e}");
            }
        }
    }
}
