//! Buffered writer of tagged message groups.
//!
//! [`MessageEmitter`] is the write half of the container: it buffers
//! messages under their tag and emits a group whenever the tag changes or
//! the group reaches `max_group_size`. A tag written with no messages
//! still produces one tag-only group, announcing the type's presence.
//!
//! Output is either BGZF-compressed (the emitter finishes the file with
//! the EOF sentinel) or plain framed bytes. Listeners registered with
//! [`on_group`](MessageEmitter::on_group) observe every emitted group with
//! its start and past-end virtual offsets, which is all an index builder
//! needs.

use std::io::{self, Write};

use crate::bgzf_output::BgzfOutput;
use crate::errors::{Result, VpkgError};
use crate::frame;
use crate::registry::MAX_TAG_LENGTH;

/// Groups are cut at this many messages unless the tag changes first.
pub const DEFAULT_MAX_GROUP_SIZE: usize = 1000;

type GroupListener = Box<dyn FnMut(&[u8], i64, i64) + Send>;

enum Sink<W: Write> {
    Bgzf(BgzfOutput<W>),
    Plain { out: W, written: u64 },
}

impl<W: Write> Sink<W> {
    /// Virtual offset of the next byte. For plain output, virtual offsets
    /// are ordinary byte offsets.
    fn tell(&self) -> i64 {
        match self {
            Sink::Bgzf(output) => output.tell(),
            Sink::Plain { written, .. } => *written as i64,
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Sink::Bgzf(output) => output.write_all(data),
            Sink::Plain { out, written } => {
                out.write_all(data)?;
                *written += data.len() as u64;
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Bgzf(output) => output.flush_blocks(),
            Sink::Plain { out, .. } => out.flush(),
        }
    }
}

/// Buffered, coalescing writer of tagged message groups.
pub struct MessageEmitter<W: Write> {
    /// Taken by `finish`; `None` afterwards.
    sink: Option<Sink<W>>,
    /// Tag of the buffered group; empty means nothing is buffered, since
    /// the empty tag can never be written.
    group_tag: Vec<u8>,
    group: Vec<Vec<u8>>,
    max_group_size: usize,
    listeners: Vec<GroupListener>,
}

impl<W: Write> MessageEmitter<W> {
    /// Write to `out`, BGZF-compressed if `compress` is set.
    pub fn new(out: W, compress: bool) -> Self {
        Self::with_max_group_size(out, compress, DEFAULT_MAX_GROUP_SIZE)
    }

    /// Like [`new`](MessageEmitter::new) with an explicit group size cap.
    pub fn with_max_group_size(out: W, compress: bool, max_group_size: usize) -> Self {
        let sink = if compress {
            Sink::Bgzf(BgzfOutput::new(out))
        } else {
            Sink::Plain { out, written: 0 }
        };
        MessageEmitter {
            sink: Some(sink),
            group_tag: Vec::new(),
            group: Vec::new(),
            max_group_size,
            listeners: Vec::new(),
        }
    }

    /// Ensure a (possibly empty) group is eventually emitted for `tag`.
    /// Coalesces with neighboring writes of the same tag.
    pub fn write(&mut self, tag: &[u8]) -> Result<()> {
        if tag.is_empty() {
            return Err(VpkgError::InvalidArgument("cannot write the reserved empty tag".into()));
        }
        if tag.len() > MAX_TAG_LENGTH {
            return Err(VpkgError::InvalidArgument(format!(
                "tag of {} bytes exceeds the {MAX_TAG_LENGTH}-byte limit",
                tag.len()
            )));
        }
        if self.group.len() >= self.max_group_size || tag != self.group_tag {
            // Out of buffer space, or the type changed.
            self.emit_group()?;
        }
        if tag != self.group_tag {
            self.group_tag = tag.to_vec();
        }
        Ok(())
    }

    /// Buffer one message under `tag`.
    pub fn write_message(&mut self, tag: &[u8], message: Vec<u8>) -> Result<()> {
        if message.len() as u64 > frame::MAX_MESSAGE_SIZE {
            return Err(VpkgError::InvalidArgument(format!(
                "message of {} bytes exceeds the maximum item size",
                message.len()
            )));
        }
        self.write(tag)?;
        self.group.push(message);
        Ok(())
    }

    /// Buffer a copy of `message` under `tag`, for callers that cannot
    /// give the bytes away.
    pub fn write_copy(&mut self, tag: &[u8], message: &[u8]) -> Result<()> {
        self.write_message(tag, message.to_vec())
    }

    /// Observe emitted groups as `(tag, start_vo, past_end_vo)`, in file
    /// order. Listeners may fire from `finish` (or drop).
    pub fn on_group(&mut self, listener: impl FnMut(&[u8], i64, i64) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Write out the buffered group, if any.
    pub fn emit_group(&mut self) -> Result<()> {
        if self.group_tag.is_empty() {
            // Nothing buffered, not even a bare tag.
            return Ok(());
        }
        let sink = self.sink.as_mut().expect("emitter sink present until finish");

        let start = sink.tell();
        let mut bytes = Vec::new();
        frame::encode_group(&self.group_tag, &self.group, &mut bytes);
        sink.write_all(&bytes)?;
        let end = sink.tell();

        for listener in &mut self.listeners {
            // Groups only; individual messages are not reported.
            listener(&self.group_tag, start, end);
        }

        self.group.clear();
        self.group_tag.clear();
        Ok(())
    }

    /// Emit the buffered group and flush the backing stream (without
    /// necessarily syncing it to disk, and without ending the file).
    pub fn flush(&mut self) -> Result<()> {
        self.emit_group()?;
        self.sink.as_mut().expect("emitter sink present until finish").flush()?;
        Ok(())
    }

    /// Emit everything, finish the file (EOF sentinel for BGZF output),
    /// and hand back the writer.
    pub fn finish(mut self) -> Result<W> {
        self.emit_group()?;
        match self.sink.take().expect("emitter sink present until finish") {
            Sink::Bgzf(output) => Ok(output.finish()?),
            Sink::Plain { mut out, .. } => {
                out.flush()?;
                Ok(out)
            }
        }
    }
}

impl<W: Write> Drop for MessageEmitter<W> {
    fn drop(&mut self) {
        if self.sink.is_none() {
            return;
        }
        // Finish the file as well as possible; errors can only be logged
        // here. Callers that care use finish().
        if let Err(e) = self.emit_group() {
            log::error!("failed to emit final message group: {e}");
            return;
        }
        match self.sink.take() {
            Some(Sink::Bgzf(mut output)) => {
                if let Err(e) = output.end_file() {
                    log::error!("failed to end BGZF file: {e}");
                }
            }
            Some(Sink::Plain { mut out, .. }) => {
                if let Err(e) = out.flush() {
                    log::error!("failed to flush emitter output: {e}");
                }
            }
            None => {}
        }
    }
}
