//! Raw BGZF block reading and decompression.
//!
//! A BGZF file is a sequence of independent gzip members, each at most 64KB
//! uncompressed, with the total block size recorded in a gzip extra
//! subfield. That makes the format random-accessible: a 64-bit virtual
//! offset packs the compressed offset of a block start with an uncompressed
//! offset inside the block.
//!
//! Block structure:
//!
//! ```text
//! 18-byte header: magic 1f 8b, CM=08, FLG=04 (FEXTRA), MTIME/XFL/OS,
//!                 XLEN=6, subfield "BC" len=2, BSIZE = block size - 1
//! deflate-compressed payload
//! 8-byte footer:  CRC32, ISIZE (uncompressed size)
//! ```
//!
//! This module reads whole raw blocks (without decompressing) so callers can
//! track compressed offsets exactly, and decompresses blocks with CRC
//! verification using libdeflater.

use libdeflater::Decompressor;
use std::io::{self, Read};

/// Size of the fixed BGZF block header.
pub const BGZF_HEADER_SIZE: usize = 18;

/// Size of the BGZF block footer (CRC32 + ISIZE).
pub const BGZF_FOOTER_SIZE: usize = 8;

/// The BGZF EOF sentinel: a complete 28-byte block with no content.
/// A well-formed BGZF file ends with exactly one of these.
pub const BGZF_EOF: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43, 0x02, 0x00,
    0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// A raw, still-compressed BGZF block.
#[derive(Debug, Clone)]
pub struct RawBlock {
    /// Complete block bytes: header + compressed payload + footer.
    pub data: Vec<u8>,
}

impl RawBlock {
    /// Total compressed size of the block, header and footer included.
    #[must_use]
    pub fn compressed_len(&self) -> usize {
        self.data.len()
    }

    /// Whether this block is the EOF sentinel.
    #[must_use]
    pub fn is_eof_marker(&self) -> bool {
        self.data == BGZF_EOF
    }

    /// Uncompressed size recorded in the ISIZE footer field.
    #[must_use]
    pub fn uncompressed_len(&self) -> usize {
        let n = self.data.len();
        if n < BGZF_FOOTER_SIZE {
            return 0;
        }
        u32::from_le_bytes([self.data[n - 4], self.data[n - 3], self.data[n - 2], self.data[n - 1]])
            as usize
    }

    /// CRC32 of the uncompressed content, from the footer.
    #[must_use]
    pub fn crc32(&self) -> u32 {
        let n = self.data.len();
        if n < BGZF_FOOTER_SIZE {
            return 0;
        }
        u32::from_le_bytes([self.data[n - 8], self.data[n - 7], self.data[n - 6], self.data[n - 5]])
    }

    /// The deflate payload between header and footer.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        if self.data.len() <= BGZF_HEADER_SIZE + BGZF_FOOTER_SIZE {
            return &[];
        }
        &self.data[BGZF_HEADER_SIZE..self.data.len() - BGZF_FOOTER_SIZE]
    }
}

/// Check whether an 18-byte header could start a BGZF block.
///
/// Requires the gzip magic, deflate method, the FEXTRA flag, and the "BC"
/// subfield identifier. Plain (non-blocked) gzip fails the FEXTRA/"BC"
/// checks while still carrying the `1f 8b` magic.
#[must_use]
pub fn is_bgzf_header(header: &[u8]) -> bool {
    header.len() >= BGZF_HEADER_SIZE
        && header[0] == 0x1f
        && header[1] == 0x8b
        && header[2] == 0x08
        && header[3] & 0x04 != 0
        && header[12] == b'B'
        && header[13] == b'C'
}

/// Validate a BGZF header, returning the total block size.
fn block_size_from_header(header: &[u8; BGZF_HEADER_SIZE]) -> io::Result<usize> {
    if header[0] != 0x1f || header[1] != 0x8b {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "invalid BGZF magic: expected 0x1f 0x8b, got 0x{:02x} 0x{:02x}",
                header[0], header[1]
            ),
        ));
    }
    if header[2] != 0x08 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid compression method: expected 0x08, got 0x{:02x}", header[2]),
        ));
    }
    if header[3] & 0x04 == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "BGZF block missing FEXTRA flag"));
    }
    if header[12] != b'B' || header[13] != b'C' {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "invalid BGZF subfield ID: expected 'BC', got '{}{}'",
                header[12] as char, header[13] as char
            ),
        ));
    }

    // BSIZE holds total block size minus one.
    let block_size = u16::from_le_bytes([header[16], header[17]]) as usize + 1;
    if block_size < BGZF_HEADER_SIZE + BGZF_FOOTER_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("BGZF block too small: {block_size} bytes"),
        ));
    }
    Ok(block_size)
}

/// Read one raw BGZF block.
///
/// Returns `Ok(None)` on a clean EOF (no bytes before the next header).
/// A partial header or partial block body is an error: the file was cut
/// mid-block.
pub fn read_raw_block<R: Read + ?Sized>(reader: &mut R) -> io::Result<Option<RawBlock>> {
    let mut header = [0u8; BGZF_HEADER_SIZE];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let block_size = block_size_from_header(&header)?;

    let mut data = vec![0u8; block_size];
    data[..BGZF_HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut data[BGZF_HEADER_SIZE..])?;

    Ok(Some(RawBlock { data }))
}

/// Decompress a raw block, appending to `output`, verifying the CRC32.
///
/// EOF-sentinel and other empty blocks append nothing.
pub fn decompress_block_into(
    block: &RawBlock,
    decompressor: &mut Decompressor,
    output: &mut Vec<u8>,
) -> io::Result<()> {
    let uncompressed_len = block.uncompressed_len();
    if uncompressed_len == 0 {
        return Ok(());
    }

    let start = output.len();
    output.resize(start + uncompressed_len, 0);
    decompressor.deflate_decompress(block.payload(), &mut output[start..]).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("BGZF decompression failed: {e:?}"))
    })?;

    let expected = block.crc32();
    let actual = crc32fast::hash(&output[start..]);
    if expected != actual {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "BGZF CRC32 mismatch: expected 0x{expected:08x}, got 0x{actual:08x} \
                 (block of {} compressed bytes, {uncompressed_len} uncompressed)",
                block.compressed_len()
            ),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::BlockCompressor;
    use std::io::Cursor;

    #[test]
    fn test_eof_marker() {
        let block = RawBlock { data: BGZF_EOF.to_vec() };
        assert!(block.is_eof_marker());
        assert_eq!(block.uncompressed_len(), 0);
        assert_eq!(block.compressed_len(), 28);
    }

    #[test]
    fn test_read_eof_marker_block() {
        let mut reader = Cursor::new(BGZF_EOF.to_vec());
        let block = read_raw_block(&mut reader).unwrap().unwrap();
        assert!(block.is_eof_marker());
        // Nothing after the sentinel
        assert!(read_raw_block(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_read_empty_input() {
        let mut reader = Cursor::new(Vec::<u8>::new());
        assert!(read_raw_block(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_read_invalid_magic() {
        let data = vec![0u8; BGZF_HEADER_SIZE];
        let mut reader = Cursor::new(data);
        let err = read_raw_block(&mut reader).unwrap_err();
        assert!(err.to_string().contains("invalid BGZF magic"));
    }

    #[test]
    fn test_read_truncated_body() {
        // A valid EOF header but with the body cut off mid-block.
        let data = BGZF_EOF[..20].to_vec();
        let mut reader = Cursor::new(data);
        assert!(read_raw_block(&mut reader).is_err());
    }

    #[test]
    fn test_header_sniffing() {
        assert!(is_bgzf_header(&BGZF_EOF));
        // Plain gzip: magic but no FEXTRA
        let mut plain = [0u8; BGZF_HEADER_SIZE];
        plain[0] = 0x1f;
        plain[1] = 0x8b;
        plain[2] = 0x08;
        assert!(!is_bgzf_header(&plain));
        // Too short to tell
        assert!(!is_bgzf_header(&[0x1f, 0x8b]));
    }

    #[test]
    fn test_roundtrip_single_block() {
        let content = b"blocked gzip roundtrip content";
        let mut compressor = BlockCompressor::new(6);
        compressor.write_all(content).unwrap();
        compressor.flush().unwrap();
        let blocks = compressor.take_blocks();
        assert_eq!(blocks.len(), 1);

        let mut reader = Cursor::new(blocks[0].clone());
        let block = read_raw_block(&mut reader).unwrap().unwrap();
        assert!(is_bgzf_header(&block.data));
        assert_eq!(block.uncompressed_len(), content.len());

        let mut decompressor = Decompressor::new();
        let mut out = Vec::new();
        decompress_block_into(&block, &mut decompressor, &mut out).unwrap();
        assert_eq!(out, content);
    }

    #[test]
    fn test_decompress_appends() {
        let mut compressor = BlockCompressor::new(6);
        compressor.write_all(b"tail").unwrap();
        compressor.flush().unwrap();
        let data = compressor.take_blocks().remove(0);

        let block = read_raw_block(&mut Cursor::new(data)).unwrap().unwrap();
        let mut decompressor = Decompressor::new();
        let mut out = vec![1u8, 2, 3];
        decompress_block_into(&block, &mut decompressor, &mut out).unwrap();
        assert_eq!(&out[..3], &[1, 2, 3]);
        assert_eq!(&out[3..], b"tail");
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let mut compressor = BlockCompressor::new(6);
        compressor.write_all(b"content the CRC protects").unwrap();
        compressor.flush().unwrap();
        let mut data = compressor.take_blocks().remove(0);

        // Corrupt the stored CRC (footer bytes -8..-4).
        let n = data.len();
        data[n - 8] ^= 0xff;

        let block = read_raw_block(&mut Cursor::new(data)).unwrap().unwrap();
        let mut decompressor = Decompressor::new();
        let mut out = Vec::new();
        let err = decompress_block_into(&block, &mut decompressor, &mut out).unwrap_err();
        assert!(err.to_string().contains("CRC32 mismatch"));
    }
}
