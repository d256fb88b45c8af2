//! Inline BGZF block compression.
//!
//! [`BlockCompressor`] accumulates uncompressed bytes and emits complete
//! BGZF blocks (header + deflate payload + footer) whenever the buffer
//! reaches the per-block content limit. Callers drain finished blocks with
//! [`take_blocks`](BlockCompressor::take_blocks) and decide where they land,
//! which keeps compressed-offset bookkeeping with the caller.
//!
//! Uses libdeflate via the `bgzf` crate.

use bgzf::{CompressionLevel, Compressor};
use std::io;

/// Maximum uncompressed content of one BGZF block (64KB minus overhead).
pub const BLOCK_CONTENT_SIZE: usize = bgzf::BGZF_BLOCK_SIZE;

/// Accumulates bytes and compresses them into complete BGZF blocks.
pub struct BlockCompressor {
    /// Pending uncompressed bytes, always shorter than one block.
    buffer: Vec<u8>,
    /// Reused `bgzf` compressor state.
    compressor: Compressor,
    /// Finished blocks not yet taken by the caller.
    completed: Vec<Vec<u8>>,
}

impl BlockCompressor {
    /// Create a compressor at the given deflate level (clamped to 1..=12).
    #[must_use]
    pub fn new(level: u32) -> Self {
        let level = CompressionLevel::new(level.clamp(1, 12) as u8)
            .unwrap_or_else(|_| CompressionLevel::new(6).expect("default BGZF level is valid"));
        Self {
            buffer: Vec::with_capacity(BLOCK_CONTENT_SIZE),
            compressor: Compressor::new(level),
            completed: Vec::new(),
        }
    }

    /// Number of bytes buffered but not yet compressed into a block.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Append bytes, compressing a block each time the buffer fills.
    pub fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let room = BLOCK_CONTENT_SIZE - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() >= BLOCK_CONTENT_SIZE {
                self.compress_buffer()?;
            }
        }
        Ok(())
    }

    /// Compress any pending bytes into a (possibly short) final block.
    pub fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            self.compress_buffer()?;
        }
        Ok(())
    }

    /// Take all finished blocks, leaving the pending buffer untouched.
    pub fn take_blocks(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.completed)
    }

    fn compress_buffer(&mut self) -> io::Result<()> {
        let mut block = Vec::new();
        self.compressor
            .compress(&self.buffer, &mut block)
            .map_err(|e| io::Error::other(format!("BGZF compression failed: {e}")))?;
        self.completed.push(block);
        self.buffer.clear();
        Ok(())
    }
}
