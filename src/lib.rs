#![deny(unsafe_code)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args
)]

//! # vpkg - Type-tagged message container I/O
//!
//! A library for reading and writing a container format that carries
//! heterogeneous, versioned payloads as a sequence of type-tagged message
//! groups, optionally wrapped in a block-gzip (BGZF) envelope. Payloads
//! are opaque byte strings; short string tags bind them to the loaders
//! and savers registered for them, so a reader can ask "give me whichever
//! known thing this file contains".
//!
//! ## Overview
//!
//! - **[`bgzf_input`] / [`bgzf_output`]** - the transport: buffered
//!   streams over BGZF (or plain gzip, or uncompressed bytes) with
//!   virtual-offset `tell`/`seek` and EOF-sentinel handling
//! - **[`frame`] / [`varint`]** - group framing: varint-prefixed
//!   `(count, tag, items...)` records
//! - **[`message_iterator`] / [`message_emitter`]** - the message layer:
//!   a lazy tag-aware cursor and a coalescing buffered writer
//! - **[`registry`]** - tag <-> type bindings: loaders, savers, bare
//!   magic-sniffed formats; built once, immutable afterwards
//! - **[`dispatch`]** - the front end: `try_load_one`, `try_load_first`,
//!   `save`, `with_save_stream`, with format auto-detection
//! - **[`parallel`]** - batched parallel for-each over container messages
//!   with adaptive backpressure
//! - **[`multiplexer`]** - multi-thread output fan-in that interleaves
//!   only at declared record boundaries
//!
//! ## Reading
//!
//! ```no_run
//! use vpkg::{Registry, try_load_one_path};
//!
//! #[derive(Debug)]
//! struct AlignmentSet(Vec<Vec<u8>>);
//!
//! # fn main() -> vpkg::Result<()> {
//! let registry = Registry::global();
//! if let Some(alignments) = try_load_one_path::<AlignmentSet>("reads.gam", registry)? {
//!     // ...
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Writing
//!
//! ```
//! use vpkg::MessageEmitter;
//!
//! # fn main() -> vpkg::Result<()> {
//! let mut emitter = MessageEmitter::new(Vec::new(), true);
//! emitter.write_message(b"GAM", vec![0xaa, 0xbb])?;
//! let bytes = emitter.finish()?;
//! # Ok(())
//! # }
//! ```

pub mod bgzf_input;
pub mod bgzf_output;
pub mod dispatch;
pub mod errors;
pub mod frame;
pub mod message_emitter;
pub mod message_iterator;
pub mod multiplexer;
pub mod parallel;
pub mod peek;
pub mod registry;
pub mod reorder_buffer;
pub mod varint;

pub use bgzf_input::{BgzfInput, smells_like_gzip};
pub use bgzf_output::BgzfOutput;
pub use errors::{Result, VpkgError};
pub use frame::MAX_MESSAGE_SIZE;
pub use message_emitter::{DEFAULT_MAX_GROUP_SIZE, MessageEmitter};
pub use message_iterator::{MessageIterator, TaggedMessage, sniff_tag};
pub use multiplexer::{StreamMultiplexer, ThreadStream};
pub use peek::{Peek, PeekReader};
pub use registry::{MAX_TAG_LENGTH, MessageSource, Registry, RegistryBuilder, Sniffer};
pub use dispatch::{
    LoadFirst, load_first, load_first_path, load_one, load_one_path, save, save_path, sniff_magic,
    try_load_first, try_load_first_path, try_load_one, try_load_one_path, with_save_stream,
};
