//! Lazy cursor over the tagged message groups of a container stream.
//!
//! [`MessageIterator`] walks a container one message at a time, yielding
//! `(tag, payload)` pairs. Groups are invisible to consumers except
//! through [`tell_group`](MessageIterator::tell_group) /
//! [`seek_group`](MessageIterator::seek_group), which expose the virtual
//! offset of the current group start as a random-access handle.
//!
//! The first "item" of each group is its tag. Whether it really is a tag
//! is decided by a cache of the previous group's tag (cheap path) and then
//! the registry: an unrecognized first item means the group predates tags,
//! and its items are yielded under the reserved empty tag instead.

use bstr::BString;

use crate::bgzf_input::BgzfInput;
use crate::errors::{Result, VpkgError};
use crate::frame;
use crate::peek::PeekReader;
use crate::registry::Registry;

/// One message drawn from a container: its group's tag (empty for legacy
/// untagged data) and its payload. The payload is `None` only for
/// synthesized tag-only entries, which announce a type's presence without
/// carrying data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedMessage {
    pub tag: Vec<u8>,
    pub message: Option<Vec<u8>>,
}

/// Reading cursor over tagged message groups.
pub struct MessageIterator<'r> {
    input: BgzfInput,
    registry: &'r Registry,
    /// The message most recently decoded and not yet taken.
    current: Option<TaggedMessage>,
    /// Tag of the group being read; lets repeated groups of one type skip
    /// the registry lookup.
    previous_tag: Vec<u8>,
    /// Items (tag included) in the current group.
    group_count: u64,
    /// Items of the current group consumed so far.
    group_idx: u64,
    /// Virtual offset of the current group's start, or a synthetic group
    /// counter when the input is untellable, or -1 at end of input.
    group_vo: i64,
    /// Virtual offset of the current item, mirrors `group_vo` semantics.
    item_vo: i64,
}

impl<'r> MessageIterator<'r> {
    /// Wrap a transport stream and position on the first message.
    pub fn new(input: BgzfInput, registry: &'r Registry) -> Result<Self> {
        let mut it = MessageIterator {
            input,
            registry,
            current: None,
            previous_tag: Vec::new(),
            group_count: 0,
            group_idx: 0,
            group_vo: -1,
            item_vo: -1,
        };
        it.advance()?;
        Ok(it)
    }

    /// Open a container file with `threads` decode threads.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        registry: &'r Registry,
        threads: usize,
    ) -> Result<Self> {
        Self::new(BgzfInput::open(path, threads)?, registry)
    }

    /// Whether a message is available.
    #[must_use]
    pub fn has_current(&self) -> bool {
        self.current.is_some()
    }

    /// The available message, if any.
    #[must_use]
    pub fn current(&self) -> Option<&TaggedMessage> {
        self.current.as_ref()
    }

    /// Yield the current message and advance past it. `Ok(None)` at end of
    /// input.
    pub fn take(&mut self) -> Result<Option<TaggedMessage>> {
        match self.current.take() {
            None => Ok(None),
            Some(value) => {
                self.advance()?;
                Ok(Some(value))
            }
        }
    }

    /// Virtual offset of the current group's start, suitable for a later
    /// [`seek_group`](MessageIterator::seek_group). At end of input this
    /// is the end-of-stream offset; -1 when the input is untellable.
    #[must_use]
    pub fn tell_group(&self) -> i64 {
        if self.input.tell() == -1 {
            // group_vo only holds a synthetic counter; we cannot seek.
            return -1;
        }
        if self.group_vo == -1 { self.input.tell() } else { self.group_vo }
    }

    /// Reposition to a group start previously returned by `tell_group`.
    /// The next message yielded is that group's first. Returns false when
    /// the input cannot seek.
    pub fn seek_group(&mut self, virtual_offset: i64) -> Result<bool> {
        if virtual_offset < 0 {
            return Ok(false);
        }
        if self.group_idx == 0 && self.group_vo == virtual_offset {
            // Already positioned there.
            return Ok(true);
        }
        if !self.input.seek(virtual_offset)? {
            log::debug!("input could not seek to virtual offset {virtual_offset}");
            return Ok(false);
        }
        self.group_count = 0;
        self.group_idx = 0;
        self.current = None;
        self.advance()?;
        Ok(true)
    }

    /// Decode the next message into `self.current`, or record end of
    /// input.
    fn advance(&mut self) -> Result<()> {
        while self.group_idx == self.group_count {
            // Group boundary: note where the new group starts, then read
            // its header.
            let vo = self.input.tell();
            if vo == -1 {
                // Untellable input: count groups instead.
                self.group_vo += 1;
            } else {
                self.group_vo = vo;
            }
            self.group_idx = 0;

            let Some(count) = frame::try_read_varint64(&mut self.input, self.group_vo)? else {
                log::debug!("no group header at {}; iteration ends", self.group_vo);
                self.group_vo = -1;
                self.item_vo = -1;
                self.current = None;
                return Ok(());
            };
            if count == 0 {
                return Err(VpkgError::malformed(self.group_vo, "group count is zero"));
            }
            self.group_count = count;

            // The first item claims to be the tag.
            let vo = self.input.tell();
            if vo == -1 {
                self.item_vo += 1;
            } else {
                self.item_vo = vo;
            }
            let tag_len = frame::read_varint32(&mut self.input, self.group_vo)?;
            if u64::from(tag_len) > frame::MAX_MESSAGE_SIZE {
                return Err(VpkgError::malformed(
                    self.group_vo,
                    format!("tag of {tag_len} bytes is too long"),
                ));
            }
            let first = frame::read_exact_vec(&mut self.input, tag_len as usize, self.group_vo)?;
            self.group_idx += 1;

            let is_tag = (!self.previous_tag.is_empty() && self.previous_tag == first)
                || self.registry.is_valid_tag(&first);

            if !is_tag {
                // Not a registered tag: this is legacy untagged data, and
                // the "tag" was really the group's first message.
                log::debug!(
                    "first item of {} bytes is not a known tag; reading group as untagged",
                    first.len()
                );
                self.previous_tag.clear();
                self.current = Some(TaggedMessage { tag: Vec::new(), message: Some(first) });
                return Ok(());
            }

            self.previous_tag.clone_from(&first);
            if self.group_count == 1 {
                // Tag-only group: announce the tag with no payload.
                log::debug!("found message-less tag '{}'", BString::from(first.as_slice()));
                self.current = Some(TaggedMessage { tag: first, message: None });
                return Ok(());
            }
        }

        // Mid-group: the next item is a real message under the cached tag.
        let vo = self.input.tell();
        if vo == -1 {
            self.item_vo += 1;
        } else {
            self.item_vo = vo;
        }
        let len = frame::read_varint32(&mut self.input, self.item_vo)?;
        if u64::from(len) > frame::MAX_MESSAGE_SIZE {
            return Err(VpkgError::malformed(
                self.item_vo,
                format!("message of {len} bytes is too long"),
            ));
        }
        let message = frame::read_exact_vec(&mut self.input, len as usize, self.item_vo)?;
        self.group_idx += 1;
        self.current =
            Some(TaggedMessage { tag: self.previous_tag.clone(), message: Some(message) });
        Ok(())
    }
}

impl Iterator for MessageIterator<'_> {
    type Item = Result<TaggedMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.take() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Sniff the tag of the first group from a peekable stream, leaving the
/// stream untouched. Returns the empty vector when the leading bytes do
/// not look like a registered tagged group.
pub fn sniff_tag<R: std::io::Read>(
    peek: &mut PeekReader<R>,
    registry: &Registry,
) -> Result<Vec<u8>> {
    let window = peek.peek(crate::peek::SNIFF_WINDOW)?;
    match frame::parse_group_prelude(window) {
        Some((_, tag)) if registry.is_valid_tag(&tag) => Ok(tag),
        _ => Ok(Vec::new()),
    }
}

/// Sniff the tag of the next group from an already-opened transport
/// stream, without consuming anything. Limited to the current block's
/// lookahead.
pub fn sniff_tag_from_input(input: &mut BgzfInput, registry: &Registry) -> Result<Vec<u8>> {
    let window = input.fill_buf()?;
    match frame::parse_group_prelude(window) {
        Some((_, tag)) if registry.is_valid_tag(&tag) => Ok(tag),
        _ => Ok(Vec::new()),
    }
}
