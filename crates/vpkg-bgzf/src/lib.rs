#![deny(unsafe_code)]

//! BGZF (Blocked GZIP Format) block-level I/O.
//!
//! This crate provides the raw block codec used by the `vpkg` container
//! library:
//! - [`reader`] - Raw block parsing and decompression using libdeflater
//! - [`writer`] - Inline BGZF compression using the `bgzf` crate

pub mod reader;
pub mod writer;

// Re-export commonly used items
pub use reader::{
    BGZF_EOF, BGZF_FOOTER_SIZE, BGZF_HEADER_SIZE, RawBlock, decompress_block_into, is_bgzf_header,
    read_raw_block,
};
pub use writer::{BLOCK_CONTENT_SIZE, BlockCompressor};
