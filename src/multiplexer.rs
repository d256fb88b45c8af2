//! Fan-in of multiple producer threads into one sequential output sink.
//!
//! Each producer thread checks out a [`ThreadStream`] and writes to it
//! like any `io::Write`. Output from different threads is interleaved in
//! the backing sink only at **breakpoints** the producers declare, so any
//! record-oriented format stays well-formed as long as records end at
//! breakpoints.
//!
//! Per thread, bytes travel: private buffer -> fixed ring of completed
//! chunks -> dedicated writer thread -> sink. The producer's mutex is held
//! only for the O(1) ring push; the writer holds it only for the O(1) pop
//! and writes outside the lock. A full ring makes the producer unlock,
//! yield, and retry.
//!
//! A sink write failure is parked in a shared error cell: the writer keeps
//! draining (discarding) so producers cannot wedge, and the failure
//! surfaces from the next breakpoint call on any thread and from
//! [`finish`](StreamMultiplexer::finish).

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;

/// Slots per thread ring. One slot is always left empty so full and empty
/// states stay distinguishable from the head and tail cursors alone.
pub const RING_BUFFER_SIZE: usize = 10;

/// Don't bother shipping chunks smaller than a few BGZF blocks; tiny
/// chunks just thrash the ring.
pub const MIN_QUEUE_ITEM_BYTES: usize = 10 * 64 * 1024;

struct Ring {
    slots: [Option<Vec<u8>>; RING_BUFFER_SIZE],
    /// Pop cursor.
    head: usize,
    /// Push cursor.
    tail: usize,
}

impl Ring {
    fn new() -> Self {
        Ring { slots: Default::default(), head: 0, tail: 0 }
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        (self.tail + 1) % RING_BUFFER_SIZE == self.head
    }

    fn push(&mut self, chunk: Vec<u8>) {
        debug_assert!(!self.is_full());
        self.slots[self.tail] = Some(chunk);
        self.tail = (self.tail + 1) % RING_BUFFER_SIZE;
    }

    fn pop(&mut self) -> Option<Vec<u8>> {
        if self.is_empty() {
            return None;
        }
        let chunk = self.slots[self.head].take();
        self.head = (self.head + 1) % RING_BUFFER_SIZE;
        chunk
    }
}

struct Shared {
    rings: Vec<Mutex<Ring>>,
    stop: AtomicBool,
    failed: AtomicBool,
    /// Message of the sink failure, if any. The original error comes back
    /// from the writer thread through `finish`.
    error: Mutex<Option<String>>,
}

impl Shared {
    fn writer_error(&self) -> io::Error {
        let message = self.error.lock().clone().unwrap_or_else(|| "unknown failure".into());
        io::Error::other(format!("multiplexer writer failed: {message}"))
    }
}

/// Merges byte output of up to `max_threads` producer threads into one
/// sink, interleaving only at producer-declared breakpoints.
pub struct StreamMultiplexer<W: Write + Send + 'static> {
    shared: Arc<Shared>,
    writer: Option<JoinHandle<io::Result<W>>>,
    claimed: Vec<AtomicBool>,
}

impl<W: Write + Send + 'static> StreamMultiplexer<W> {
    /// Start multiplexing into `backing`. The writer thread runs from now
    /// until [`finish`](StreamMultiplexer::finish) (or drop).
    pub fn new(backing: W, max_threads: usize) -> Self {
        let shared = Arc::new(Shared {
            rings: (0..max_threads).map(|_| Mutex::new(Ring::new())).collect(),
            stop: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
        });
        let writer_shared = Arc::clone(&shared);
        let writer = std::thread::spawn(move || writer_thread(backing, &writer_shared));
        StreamMultiplexer {
            shared,
            writer: Some(writer),
            claimed: (0..max_threads).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Check out the stream for thread `index`. Each index can be taken
    /// once; the handle must be dropped (or its data handed off) before
    /// `finish`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range or already checked out.
    pub fn thread_stream(&self, index: usize) -> ThreadStream<'_, W> {
        assert!(index < self.claimed.len(), "thread index {index} out of range");
        assert!(
            !self.claimed[index].swap(true, Ordering::AcqRel),
            "thread stream {index} already checked out"
        );
        ThreadStream { mux: self, index, buffer: Vec::new(), breakpoint: 0 }
    }

    /// Number of producer slots.
    #[must_use]
    pub fn max_threads(&self) -> usize {
        self.claimed.len()
    }

    /// Stop the writer, drain everything, and hand back the sink. Fails
    /// if any sink write failed.
    pub fn finish(mut self) -> io::Result<W> {
        self.shared.stop.store(true, Ordering::Release);
        let handle = self.writer.take().expect("writer thread runs until finish");
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(io::Error::other("multiplexer writer thread panicked")),
        }
    }
}

impl<W: Write + Send + 'static> Drop for StreamMultiplexer<W> {
    fn drop(&mut self) {
        let Some(handle) = self.writer.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::Release);
        match handle.join() {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::error!("multiplexer sink failed during shutdown: {e}"),
            Err(_) => log::error!("multiplexer writer thread panicked"),
        }
    }
}

/// The per-thread write handle. Writes accumulate in a private buffer;
/// breakpoint calls decide when buffered bytes become eligible for
/// output.
pub struct ThreadStream<'a, W: Write + Send + 'static> {
    mux: &'a StreamMultiplexer<W>,
    index: usize,
    buffer: Vec<u8>,
    /// Last position at which output may legally be cut; discards never
    /// rewind past it.
    breakpoint: usize,
}

impl<W: Write + Send + 'static> ThreadStream<'_, W> {
    /// Declare that the output may be cut here.
    ///
    /// If enough data has accumulated the buffer is handed to the ring
    /// (yielding while the ring is full); otherwise the position is just
    /// remembered as the rewind limit.
    pub fn register_breakpoint(&mut self) -> io::Result<()> {
        if self.buffer.len() >= MIN_QUEUE_ITEM_BYTES {
            self.hand_off()
        } else {
            self.breakpoint = self.buffer.len();
            Ok(())
        }
    }

    /// Whether enough data is buffered that the caller should reach a
    /// breakpoint soon.
    #[must_use]
    pub fn want_breakpoint(&self) -> bool {
        self.buffer.len() >= MIN_QUEUE_ITEM_BYTES
    }

    /// Hand off regardless of size, then block until this thread's ring
    /// is drained. On return, every byte this thread wrote is in the sink
    /// ahead of anything any thread writes afterwards.
    pub fn register_barrier(&mut self) -> io::Result<()> {
        self.hand_off()?;
        // Give the writer a chance before the first check.
        std::thread::yield_now();
        loop {
            if self.mux.shared.failed.load(Ordering::Acquire) {
                return Err(self.mux.shared.writer_error());
            }
            if self.mux.shared.rings[self.index].lock().is_empty() {
                return Ok(());
            }
            std::thread::yield_now();
        }
    }

    /// Drop everything written since the last breakpoint.
    pub fn discard_to_breakpoint(&mut self) {
        self.buffer.truncate(self.breakpoint);
    }

    /// Drop up to `count` trailing bytes, never rewinding past the last
    /// breakpoint.
    pub fn discard_bytes(&mut self, count: usize) {
        let target = self.buffer.len().saturating_sub(count).max(self.breakpoint);
        self.buffer.truncate(target);
    }

    /// Bytes currently buffered and not yet eligible for output.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Move the buffer into this thread's ring, spinning (unlock, yield,
    /// relock) while the ring is full.
    fn hand_off(&mut self) -> io::Result<()> {
        let shared = &self.mux.shared;
        let mut chunk = Some(std::mem::take(&mut self.buffer));
        loop {
            if shared.failed.load(Ordering::Acquire) {
                return Err(shared.writer_error());
            }
            {
                let mut ring = shared.rings[self.index].lock();
                if !ring.is_full() {
                    ring.push(chunk.take().expect("chunk pending until pushed"));
                    break;
                }
            }
            std::thread::yield_now();
        }
        self.breakpoint = 0;
        Ok(())
    }
}

impl<W: Write + Send + 'static> Write for ThreadStream<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Data only moves at breakpoints; there is nothing to flush here.
        Ok(())
    }
}

impl<W: Write + Send + 'static> Drop for ThreadStream<'_, W> {
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let pending = self.buffer.len();
        if let Err(e) = self.hand_off() {
            log::warn!("discarding {pending} buffered bytes from thread {}: {e}", self.index);
        }
    }
}

/// Writer thread: cycle the rings, pop at most one chunk per lock
/// acquisition, write outside the lock. On a sink failure, park the error
/// and keep draining so producers never wedge on a full ring.
fn writer_thread<W: Write>(mut backing: W, shared: &Shared) -> io::Result<W> {
    let mut error: Option<io::Error> = None;

    let mut write_chunk = |backing: &mut W, chunk: Vec<u8>, error: &mut Option<io::Error>| {
        if error.is_some() {
            return;
        }
        if let Err(e) = backing.write_all(&chunk) {
            log::error!("multiplexer sink write failed: {e}");
            *shared.error.lock() = Some(e.to_string());
            shared.failed.store(true, Ordering::Release);
            *error = Some(e);
        }
    };

    while !shared.stop.load(Ordering::Acquire) {
        let mut found_data = false;
        for ring in &shared.rings {
            let chunk = ring.lock().pop();
            if let Some(chunk) = chunk {
                found_data = true;
                write_chunk(&mut backing, chunk, &mut error);
            }
        }
        if !found_data {
            // Nothing on a full pass: don't spin.
            std::thread::yield_now();
        }
    }

    // Shutdown: drain whatever the producers left behind.
    for ring in &shared.rings {
        while let Some(chunk) = ring.lock().pop() {
            write_chunk(&mut backing, chunk, &mut error);
        }
    }

    match error {
        Some(e) => Err(e),
        None => {
            backing.flush()?;
            Ok(backing)
        }
    }
}
