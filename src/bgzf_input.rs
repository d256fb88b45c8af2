//! Buffered input over BGZF, plain gzip, and uncompressed byte streams.
//!
//! [`BgzfInput`] is the read half of the container's transport layer. It
//! sniffs the leading bytes of an input to pick one of three modes:
//!
//! - **Blocked**: BGZF data. Blocks are decoded one at a time (or on a
//!   worker pool), virtual offsets are real, and `seek` works when the
//!   underlying stream does. A seekable BGZF input missing its EOF
//!   sentinel block is rejected up front as truncated.
//! - **Gzip**: gzip data without block framing. Readable sequentially
//!   only; `tell` reports -1 and `seek` always fails.
//! - **Plain**: uncompressed data. Read in 64KB chunks; when the stream is
//!   seekable, chunk starts serve as block addresses so virtual offsets
//!   and `seek` still work.
//!
//! A virtual offset packs `(compressed_block_start << 16) | offset_within_
//! block`. At a block boundary `tell` reports the start of the *next*
//! block, so the value is always a valid position to hand back to `seek`.
//!
//! While multithreaded decoding is enabled the pipeline's reader thread
//! owns the byte stream; nothing else may touch it until the input is
//! dropped or sought (which restarts the pipeline).

use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded};
use flate2::read::MultiGzDecoder;
use libdeflater::Decompressor;
use vpkg_bgzf::{BGZF_EOF, RawBlock, decompress_block_into, is_bgzf_header, read_raw_block};

use crate::errors::{Result, VpkgError};
use crate::reorder_buffer::ReorderBuffer;

/// Chunk size for plain (uncompressed) inputs. Must leave chunk-internal
/// offsets representable in the 16 low bits of a virtual offset.
const PLAIN_CHUNK_SIZE: usize = 64 * 1024;

/// Readers that can also seek; what [`BgzfInput`] needs for random access.
trait SeekRead: Read + Seek + Send {}
impl<T: Read + Seek + Send> SeekRead for T {}

/// The byte stream under the decoder: either genuinely seekable, or a
/// forward-only stream with its sniffed prefix logically put back.
enum ByteSource {
    Seekable(Box<dyn SeekRead>),
    Stream { prefix: Vec<u8>, prefix_pos: usize, inner: Box<dyn Read + Send> },
}

impl Read for ByteSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ByteSource::Seekable(inner) => inner.read(buf),
            ByteSource::Stream { prefix, prefix_pos, inner } => {
                if *prefix_pos < prefix.len() {
                    let n = buf.len().min(prefix.len() - *prefix_pos);
                    buf[..n].copy_from_slice(&prefix[*prefix_pos..*prefix_pos + n]);
                    *prefix_pos += n;
                    return Ok(n);
                }
                inner.read(buf)
            }
        }
    }
}

impl ByteSource {
    fn seek_to(&mut self, pos: u64) -> io::Result<bool> {
        match self {
            ByteSource::Seekable(inner) => {
                inner.seek(SeekFrom::Start(pos))?;
                Ok(true)
            }
            ByteSource::Stream { .. } => Ok(false),
        }
    }
}

/// Transport mode, fixed at construction by sniffing.
enum Mode {
    Blocked { source: ByteSource, decompressor: Box<Decompressor> },
    Threaded(DecodePipeline),
    Gzip { decoder: Box<MultiGzDecoder<ByteSource>> },
    Plain { source: ByteSource },
}

/// Buffered reader over a (possibly compressed) container byte stream.
pub struct BgzfInput {
    mode: Mode,
    /// Uncompressed content of the current block.
    block: Vec<u8>,
    /// Cursor within `block`.
    offset: usize,
    /// Compressed offset where the current block starts.
    block_address: u64,
    /// Compressed offset where the next block will start.
    next_address: u64,
    /// Whether virtual offsets are real (seekable source, block-addressable
    /// mode).
    know_offset: bool,
    /// Total uncompressed bytes surfaced so far.
    byte_count: u64,
    /// Intra-block position requested by the last `seek`, applied when the
    /// target block is loaded.
    pending_intra: Option<u16>,
}

impl BgzfInput {
    /// Open a file for reading, with `threads` decode threads (values of 0
    /// or 1 decode inline).
    pub fn open(path: impl AsRef<Path>, threads: usize) -> Result<Self> {
        Self::from_seekable(std::fs::File::open(path)?, threads)
    }

    /// Wrap a seekable reader. Virtual offsets are real in blocked and
    /// plain modes, and BGZF inputs are checked for the EOF sentinel.
    pub fn from_seekable<R: Read + Seek + Send + 'static>(
        mut reader: R,
        threads: usize,
    ) -> Result<Self> {
        let base = reader.stream_position()?;
        let mut prefix = [0u8; vpkg_bgzf::BGZF_HEADER_SIZE];
        let got = read_up_to(&mut reader, &mut prefix)?;

        if got >= vpkg_bgzf::BGZF_HEADER_SIZE && is_bgzf_header(&prefix) {
            check_eof_marker(&mut reader, base)?;
            reader.seek(SeekFrom::Start(base))?;
            let source = ByteSource::Seekable(Box::new(reader));
            return Ok(Self::blocked(source, base, true, threads));
        }

        reader.seek(SeekFrom::Start(base))?;
        let source = ByteSource::Seekable(Box::new(reader));
        if got >= 2 && prefix[0] == 0x1f && prefix[1] == 0x8b {
            // Compressed but not block-framed: sequential reading only.
            Ok(Self::with_mode(Mode::Gzip { decoder: Box::new(MultiGzDecoder::new(source)) }, 0, false))
        } else {
            Ok(Self::with_mode(Mode::Plain { source }, base, true))
        }
    }

    /// Wrap a forward-only reader (standard input, pipes). All modes work,
    /// but virtual offsets are unavailable: `tell` reports -1 and `seek`
    /// fails.
    pub fn from_stream<R: Read + Send + 'static>(mut reader: R, threads: usize) -> Result<Self> {
        let mut header = [0u8; vpkg_bgzf::BGZF_HEADER_SIZE];
        let got = read_up_to(&mut reader, &mut header)?;
        let source = ByteSource::Stream {
            prefix: header[..got].to_vec(),
            prefix_pos: 0,
            inner: Box::new(reader),
        };

        if got >= vpkg_bgzf::BGZF_HEADER_SIZE && is_bgzf_header(&header) {
            Ok(Self::blocked(source, 0, false, threads))
        } else if got >= 2 && header[0] == 0x1f && header[1] == 0x8b {
            Ok(Self::with_mode(Mode::Gzip { decoder: Box::new(MultiGzDecoder::new(source)) }, 0, false))
        } else {
            Ok(Self::with_mode(Mode::Plain { source }, 0, false))
        }
    }

    fn blocked(source: ByteSource, base: u64, know_offset: bool, threads: usize) -> Self {
        let mode = if threads > 1 {
            Mode::Threaded(DecodePipeline::spawn(source, base, threads))
        } else {
            Mode::Blocked { source, decompressor: Box::new(Decompressor::new()) }
        };
        Self::with_mode(mode, base, know_offset)
    }

    fn with_mode(mode: Mode, base: u64, know_offset: bool) -> Self {
        BgzfInput {
            mode,
            block: Vec::new(),
            offset: 0,
            block_address: base,
            next_address: base,
            know_offset,
            byte_count: 0,
            pending_intra: None,
        }
    }

    /// Whether the input is block-compressed (and therefore seekable when
    /// the underlying stream is).
    #[must_use]
    pub fn is_bgzf(&self) -> bool {
        matches!(self.mode, Mode::Blocked { .. } | Mode::Threaded(_))
    }

    /// The unconsumed remainder of the current block, loading the next
    /// block if the current one is spent. An empty slice means end of
    /// input.
    pub fn fill_buf(&mut self) -> io::Result<&[u8]> {
        while self.offset >= self.block.len() {
            if !self.load_next_block()? {
                return Ok(&[]);
            }
        }
        Ok(&self.block[self.offset..])
    }

    /// Mark `amt` bytes of the last `fill_buf` slice as read.
    pub fn consume(&mut self, amt: usize) {
        debug_assert!(self.offset + amt <= self.block.len());
        self.offset = (self.offset + amt).min(self.block.len());
    }

    /// Return the last `amt` consumed bytes to the front of the stream.
    /// Cannot cross the start of the current block.
    pub fn back_up(&mut self, amt: usize) {
        assert!(amt <= self.offset, "cannot back up {amt} bytes past the block start");
        self.offset -= amt;
    }

    /// Skip `n` bytes. Returns false if the input ends first.
    pub fn skip(&mut self, mut n: u64) -> io::Result<bool> {
        while n > 0 {
            let available = self.fill_buf()?;
            if available.is_empty() {
                return Ok(false);
            }
            let take = (available.len() as u64).min(n) as usize;
            self.consume(take);
            n -= take as u64;
        }
        Ok(true)
    }

    /// The current virtual offset, or -1 when the input is untellable.
    ///
    /// At a block boundary this reports the start of the next block, so the
    /// result is always a valid `seek` target.
    #[must_use]
    pub fn tell(&self) -> i64 {
        if !self.know_offset {
            return -1;
        }
        if self.offset >= self.block.len() {
            (self.next_address << 16) as i64
        } else {
            ((self.block_address << 16) | self.offset as u64) as i64
        }
    }

    /// Reposition to a virtual offset previously returned by `tell`.
    ///
    /// Returns false when the input does not support seeking. Seeking with
    /// an outstanding `fill_buf` borrow is prevented by the borrow checker.
    pub fn seek(&mut self, virtual_offset: i64) -> io::Result<bool> {
        if virtual_offset < 0 || !self.know_offset {
            return Ok(false);
        }
        let coffset = (virtual_offset as u64) >> 16;
        let uoffset = (virtual_offset as u64 & 0xffff) as u16;

        match &mut self.mode {
            Mode::Blocked { source, .. } | Mode::Plain { source } => {
                if !source.seek_to(coffset)? {
                    return Ok(false);
                }
            }
            Mode::Threaded(pipeline) => pipeline.seek_to(coffset)?,
            Mode::Gzip { .. } => return Ok(false),
        }

        self.block.clear();
        self.offset = 0;
        self.block_address = coffset;
        self.next_address = coffset;
        self.pending_intra = (uoffset > 0).then_some(uoffset);
        Ok(true)
    }

    /// Total uncompressed bytes produced so far.
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    /// Load the next non-empty block into `self.block`. Returns false at
    /// end of input.
    fn load_next_block(&mut self) -> io::Result<bool> {
        loop {
            let loaded = match &mut self.mode {
                Mode::Blocked { source, decompressor } => {
                    match read_raw_block(source)? {
                        None => None,
                        Some(raw) => {
                            let address = self.next_address;
                            self.next_address += raw.compressed_len() as u64;
                            if raw.uncompressed_len() == 0 {
                                // EOF sentinel or interior empty block.
                                continue;
                            }
                            let mut data = Vec::new();
                            decompress_block_into(&raw, decompressor, &mut data)?;
                            Some((address, data))
                        }
                    }
                }
                Mode::Threaded(pipeline) => match pipeline.next_block()? {
                    None => None,
                    Some((address, data)) => {
                        self.next_address = address + data.compressed_len;
                        if data.content.is_empty() {
                            continue;
                        }
                        Some((address, data.content))
                    }
                },
                Mode::Gzip { decoder } => {
                    let mut data = vec![0u8; PLAIN_CHUNK_SIZE];
                    let n = decoder.read(&mut data)?;
                    if n == 0 {
                        None
                    } else {
                        data.truncate(n);
                        Some((0, data))
                    }
                }
                Mode::Plain { source } => {
                    let address = self.next_address;
                    let mut data = vec![0u8; PLAIN_CHUNK_SIZE];
                    let n = source.read(&mut data)?;
                    if n == 0 {
                        None
                    } else {
                        data.truncate(n);
                        self.next_address = address + n as u64;
                        Some((address, data))
                    }
                }
            };

            let Some((address, data)) = loaded else {
                return Ok(false);
            };
            self.byte_count += data.len() as u64;
            self.block = data;
            self.block_address = address;
            self.offset = 0;
            if let Some(intra) = self.pending_intra.take() {
                if intra as usize > self.block.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "virtual offset points {intra} bytes into a block of {} bytes",
                            self.block.len()
                        ),
                    ));
                }
                self.offset = intra as usize;
            }
            return Ok(true);
        }
    }
}

/// Check whether the next two bytes of a peekable stream are the gzip
/// magic, without consuming them.
pub fn smells_like_gzip<R: Read>(peek: &mut crate::peek::PeekReader<R>) -> io::Result<bool> {
    Ok(matches!(peek.peek(2)?, [0x1f, 0x8b]))
}

/// Fill `buf` as far as the stream allows, tolerating a short read only at
/// end of input.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Verify that a seekable BGZF input ends with the EOF sentinel block.
fn check_eof_marker<R: Read + Seek>(reader: &mut R, base: u64) -> Result<()> {
    let len = reader.seek(SeekFrom::End(0))?;
    if len < base + BGZF_EOF.len() as u64 {
        return Err(VpkgError::TruncatedContainer);
    }
    reader.seek(SeekFrom::End(-(BGZF_EOF.len() as i64)))?;
    let mut tail = [0u8; 28];
    reader.read_exact(&mut tail)?;
    if tail != BGZF_EOF {
        return Err(VpkgError::TruncatedContainer);
    }
    Ok(())
}

// ============================================================================
// Multithreaded decoding
// ============================================================================

/// One decoded block, with enough bookkeeping to keep offsets exact.
struct DecodedContent {
    compressed_len: u64,
    content: Vec<u8>,
}

type WorkItem = (u64, u64, RawBlock);
type DoneItem = (u64, io::Result<(u64, DecodedContent)>);

/// Background BGZF decoding: one reader thread feeding raw blocks to a
/// pool of decompression workers, with results restored to file order
/// through a [`ReorderBuffer`].
struct DecodePipeline {
    results: Option<Receiver<DoneItem>>,
    reorder: ReorderBuffer<io::Result<(u64, DecodedContent)>>,
    reader: Option<JoinHandle<ByteSource>>,
    workers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    threads: usize,
}

impl DecodePipeline {
    fn spawn(source: ByteSource, start_address: u64, threads: usize) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (work_tx, work_rx) = bounded::<WorkItem>(threads * 2);
        let (done_tx, done_rx) = bounded::<DoneItem>(threads * 4);

        log::debug!("starting BGZF decode pipeline with {threads} worker threads");

        let reader =
            spawn_reader(source, start_address, work_tx, done_tx.clone(), Arc::clone(&stop));
        let workers = (0..threads)
            .map(|_| spawn_decode_worker(work_rx.clone(), done_tx.clone()))
            .collect();

        DecodePipeline {
            results: Some(done_rx),
            reorder: ReorderBuffer::new(),
            reader: Some(reader),
            workers,
            stop,
            threads,
        }
    }

    /// Next block in file order: `(block_address, content)`.
    fn next_block(&mut self) -> io::Result<Option<(u64, DecodedContent)>> {
        loop {
            if let Some(result) = self.reorder.try_pop_next() {
                let (address, content) = result?;
                return Ok(Some((address, content)));
            }
            let Some(results) = self.results.as_ref() else {
                return Ok(None);
            };
            match results.recv() {
                Ok((serial, result)) => self.reorder.insert(serial, result),
                Err(_) => {
                    // All senders gone. Serials are contiguous, so whatever
                    // is buffered is poppable; when nothing is, we are done.
                    self.results = None;
                    if self.reorder.is_empty() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Stop the pipeline, reclaim the byte source, seek it, and restart.
    fn seek_to(&mut self, pos: u64) -> io::Result<()> {
        let mut source = self.shutdown();
        if !source.seek_to(pos)? {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "underlying stream does not support seeking",
            ));
        }
        *self = DecodePipeline::spawn(source, pos, self.threads);
        Ok(())
    }

    fn shutdown(&mut self) -> ByteSource {
        self.stop.store(true, Ordering::Release);
        if let Some(results) = self.results.take() {
            // Drain so blocked workers can finish and drop their senders.
            while results.recv().is_ok() {}
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        let reader = self.reader.take().expect("pipeline reader still running");
        reader.join().expect("BGZF reader thread panicked")
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        if self.reader.is_some() {
            self.shutdown();
        }
    }
}

fn spawn_reader(
    mut source: ByteSource,
    start_address: u64,
    work_tx: Sender<WorkItem>,
    done_tx: Sender<DoneItem>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<ByteSource> {
    std::thread::spawn(move || {
        let mut address = start_address;
        let mut serial = 0u64;
        while !stop.load(Ordering::Acquire) {
            match read_raw_block(&mut source) {
                Ok(None) => break,
                Ok(Some(raw)) => {
                    let block_address = address;
                    address += raw.compressed_len() as u64;
                    if work_tx.send((serial, block_address, raw)).is_err() {
                        break;
                    }
                    serial += 1;
                }
                Err(e) => {
                    let _ = done_tx.send((serial, Err(e)));
                    break;
                }
            }
        }
        source
    })
}

fn spawn_decode_worker(work_rx: Receiver<WorkItem>, done_tx: Sender<DoneItem>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut decompressor = Decompressor::new();
        for (serial, address, raw) in work_rx {
            let mut content = Vec::new();
            let result = decompress_block_into(&raw, &mut decompressor, &mut content).map(|()| {
                (address, DecodedContent { compressed_len: raw.compressed_len() as u64, content })
            });
            if done_tx.send((serial, result)).is_err() {
                break;
            }
        }
    })
}
