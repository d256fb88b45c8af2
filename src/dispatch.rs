//! Type-driven loading and saving of container files.
//!
//! This is the front door of the crate: ask for a type, get it from
//! whatever the input turns out to be. Dispatch order:
//!
//! 1. **Bare loaders** whose sniffer accepts the leading bytes (magic
//!    numbers for pre-container formats).
//! 2. **Container data**, compressed or not: groups are iterated and the
//!    first run whose tag has a loader registered for the requested type
//!    is fed to that loader. Runs with foreign tags are skipped, so files
//!    carrying several payload kinds still load.
//!
//! All sniffing happens through a putback window, so nothing is consumed
//! from the input until a loader commits to it. Standard input (`"-"`)
//! works everywhere a path does.
//!
//! The `try_*` functions report "absent but well-formed" as `None` and
//! still fail on malformed data. The non-`try_` variants terminate the
//! process with a diagnostic instead, for tool code where a missing input
//! is fatal anyway.

use std::any::type_name;
use std::io::{self, Read, Seek, SeekFrom, Write};

use bstr::BString;

use crate::bgzf_input::{BgzfInput, smells_like_gzip};
use crate::errors::{Result, VpkgError};
use crate::message_emitter::MessageEmitter;
use crate::message_iterator::{MessageIterator, sniff_tag};
use crate::peek::{Peek, PeekReader};
use crate::registry::{ChunkWriter, MessageSource, Registry};

/// Check whether a peekable stream starts with the given magic bytes,
/// consuming nothing.
pub fn sniff_magic<R: Read>(peek: &mut PeekReader<R>, magic: &[u8]) -> io::Result<bool> {
    Peek::peek(peek, magic.len()).map(|window| window == magic)
}

/// Feeds a loader the payloads of consecutive same-tag groups, skipping
/// tag-only entries.
struct GroupMessageSource<'a, 'r> {
    it: &'a mut MessageIterator<'r>,
    tag: Vec<u8>,
}

impl MessageSource for GroupMessageSource<'_, '_> {
    fn next_message(&mut self) -> Result<Option<Vec<u8>>> {
        while self.it.current().is_some_and(|m| m.tag == self.tag) {
            let message = self.it.take()?.expect("current message just observed");
            if let Some(payload) = message.message {
                return Ok(Some(payload));
            }
        }
        Ok(None)
    }
}

/// Try every bare loader registered for `T` whose sniffer accepts the
/// input.
fn try_bare<T: Send + 'static, R: Read>(
    peek: &mut PeekReader<R>,
    registry: &Registry,
) -> Result<Option<T>> {
    for loader in registry.find_bare_loaders::<T>() {
        // First registered loader that accepts the input wins; avoiding
        // prefix overlap is up to registration code.
        if loader.sniff(peek)? {
            return Ok(Some(loader.load(peek)?));
        }
    }
    Ok(None)
}

/// Decide whether the input is worth opening as a container: either it is
/// gzip-framed (we must decompress to see tags), or it sniffs as an
/// uncompressed container whose leading tag `has_loader` accepts.
fn should_open_container<R: Read>(
    peek: &mut PeekReader<R>,
    registry: &Registry,
    has_loader: &dyn Fn(&[u8]) -> bool,
) -> Result<bool> {
    if smells_like_gzip(peek)? {
        return Ok(true);
    }
    let sniffed = sniff_tag(peek, registry)?;
    Ok(!sniffed.is_empty() && has_loader(&sniffed))
}

/// Walk the container, loading the first run of groups whose tag has a
/// loader for `T`; runs under other tags are skipped for forward
/// compatibility.
fn try_load_encapsulated<T: Send + 'static>(
    it: &mut MessageIterator<'_>,
    registry: &Registry,
) -> Result<Option<T>> {
    loop {
        let Some(current) = it.current() else {
            return Ok(None);
        };
        let tag = current.tag.clone();
        if let Some(loader) = registry.find_loader::<T>(&tag) {
            let mut source = GroupMessageSource { it, tag };
            return Ok(Some(loader.load(&mut source)?));
        }
        log::debug!(
            "skipping messages with tag '{}' not loadable as {}",
            BString::from(tag.as_slice()),
            type_name::<T>()
        );
        while it.current().is_some_and(|m| m.tag == tag) {
            it.take()?;
        }
    }
}

/// Load a `T` from a forward-only stream, trying bare loaders first and
/// container data second. `Ok(None)` when the input is well-formed but
/// does not contain a `T`.
pub fn try_load_one<T, R>(reader: R, registry: &Registry) -> Result<Option<T>>
where
    T: Send + 'static,
    R: Read + Send + 'static,
{
    let mut peek = PeekReader::new(reader);
    if let Some(value) = try_bare::<T, _>(&mut peek, registry)? {
        return Ok(Some(value));
    }
    let has_loader = |tag: &[u8]| registry.find_loader::<T>(tag).is_some();
    if !should_open_container(&mut peek, registry, &has_loader)? {
        return Ok(None);
    }
    let input = BgzfInput::from_stream(peek, 1)?;
    let mut it = MessageIterator::new(input, registry)?;
    try_load_encapsulated::<T>(&mut it, registry)
}

/// Load a `T` from a file, or standard input for `"-"`. Seekable BGZF
/// inputs are checked for truncation before any messages are read.
pub fn try_load_one_path<T: Send + 'static>(path: &str, registry: &Registry) -> Result<Option<T>> {
    if path == "-" {
        return try_load_one::<T, _>(io::stdin(), registry);
    }
    let file = std::fs::File::open(path)?;
    let mut peek = PeekReader::new(file);
    if let Some(value) = try_bare::<T, _>(&mut peek, registry)? {
        return Ok(Some(value));
    }
    let has_loader = |tag: &[u8]| registry.find_loader::<T>(tag).is_some();
    if !should_open_container(&mut peek, registry, &has_loader)? {
        return Ok(None);
    }
    // Reopen the file through the seekable path so virtual offsets and the
    // truncation check are in force. Sniffing consumed nothing.
    let mut file = peek.into_inner();
    file.seek(SeekFrom::Start(0))?;
    let input = BgzfInput::from_seekable(file, 1)?;
    let mut it = MessageIterator::new(input, registry)?;
    try_load_encapsulated::<T>(&mut it, registry)
}

/// Like [`try_load_one`], but terminates the process with a diagnostic
/// when the input does not contain a `T`.
pub fn load_one<T, R>(reader: R, registry: &Registry) -> T
where
    T: Send + 'static,
    R: Read + Send + 'static,
{
    unwrap_or_exit(try_load_one::<T, _>(reader, registry), "stream")
}

/// Like [`try_load_one_path`], but terminates the process with a
/// diagnostic when the input does not contain a `T`.
pub fn load_one_path<T: Send + 'static>(path: &str, registry: &Registry) -> T {
    unwrap_or_exit(try_load_one_path::<T>(path, registry), path)
}

fn unwrap_or_exit<T>(result: Result<Option<T>>, source: &str) -> T {
    match result {
        Ok(Some(value)) => value,
        Ok(None) => {
            log::error!("{} not found in {source}", type_name::<T>());
            eprintln!("error[vpkg::load_one]: {} not found in {source}", type_name::<T>());
            std::process::exit(1);
        }
        Err(e) => {
            log::error!("could not load {} from {source}: {e}", type_name::<T>());
            eprintln!("error[vpkg::load_one]: could not load {} from {source}: {e}", type_name::<T>());
            std::process::exit(1);
        }
    }
}

/// Loading several candidate types in priority order: implemented for
/// tuples of up to four types. At most one slot of the result is
/// populated.
pub trait LoadFirst: Sized {
    /// Tuple of `Option`s, one per candidate type.
    type Output;

    /// Load from a forward-only stream.
    fn load_first_stream<R: Read + Send + 'static>(
        reader: R,
        registry: &Registry,
    ) -> Result<Self::Output>;

    /// Load from a file, or standard input for `"-"`.
    fn load_first_path(path: &str, registry: &Registry) -> Result<Self::Output>;

    #[doc(hidden)]
    fn load_first_encapsulated(
        it: &mut MessageIterator<'_>,
        registry: &Registry,
        output: &mut Self::Output,
    ) -> Result<bool>;

    /// Whether any slot of the result is populated.
    fn any_loaded(output: &Self::Output) -> bool;
}

/// Load whichever of the tuple's types the input offers first. Bare
/// loaders are tried in tuple order before any container data; inside the
/// container, each run of groups is offered to the types in tuple order.
pub fn try_load_first<W: LoadFirst, R: Read + Send + 'static>(
    reader: R,
    registry: &Registry,
) -> Result<W::Output> {
    W::load_first_stream(reader, registry)
}

/// [`try_load_first`] from a file, or standard input for `"-"`.
pub fn try_load_first_path<W: LoadFirst>(path: &str, registry: &Registry) -> Result<W::Output> {
    W::load_first_path(path, registry)
}

/// Like [`try_load_first`], but terminates the process with a diagnostic
/// when none of the candidate types can be produced.
pub fn load_first<W: LoadFirst, R: Read + Send + 'static>(
    reader: R,
    registry: &Registry,
) -> W::Output {
    first_or_exit::<W>(W::load_first_stream(reader, registry), "stream")
}

/// Like [`try_load_first_path`], but terminates the process with a
/// diagnostic when none of the candidate types can be produced.
pub fn load_first_path<W: LoadFirst>(path: &str, registry: &Registry) -> W::Output {
    first_or_exit::<W>(W::load_first_path(path, registry), path)
}

fn first_or_exit<W: LoadFirst>(result: Result<W::Output>, source: &str) -> W::Output {
    match result {
        Ok(output) if W::any_loaded(&output) => output,
        Ok(_) => {
            log::error!("none of the requested types found in {source}");
            eprintln!("error[vpkg::load_first]: none of the requested types found in {source}");
            std::process::exit(1);
        }
        Err(e) => {
            log::error!("could not load from {source}: {e}");
            eprintln!("error[vpkg::load_first]: could not load from {source}: {e}");
            std::process::exit(1);
        }
    }
}

macro_rules! impl_load_first {
    ($(($ty:ident, $idx:tt)),+) => {
        impl<$($ty: Send + 'static,)+> LoadFirst for ($($ty,)+) {
            type Output = ($(Option<$ty>,)+);

            fn load_first_stream<R: Read + Send + 'static>(
                reader: R,
                registry: &Registry,
            ) -> Result<Self::Output> {
                let mut output: Self::Output = Default::default();
                let mut peek = PeekReader::new(reader);
                $(
                    if let Some(value) = try_bare::<$ty, _>(&mut peek, registry)? {
                        output.$idx = Some(value);
                        return Ok(output);
                    }
                )+
                let has_loader =
                    |tag: &[u8]| false $(|| registry.find_loader::<$ty>(tag).is_some())+;
                if !should_open_container(&mut peek, registry, &has_loader)? {
                    return Ok(output);
                }
                let input = BgzfInput::from_stream(peek, 1)?;
                let mut it = MessageIterator::new(input, registry)?;
                Self::load_first_encapsulated(&mut it, registry, &mut output)?;
                Ok(output)
            }

            fn load_first_path(path: &str, registry: &Registry) -> Result<Self::Output> {
                if path == "-" {
                    return Self::load_first_stream(io::stdin(), registry);
                }
                let file = std::fs::File::open(path)?;
                let mut output: Self::Output = Default::default();
                let mut peek = PeekReader::new(file);
                $(
                    if let Some(value) = try_bare::<$ty, _>(&mut peek, registry)? {
                        output.$idx = Some(value);
                        return Ok(output);
                    }
                )+
                let has_loader =
                    |tag: &[u8]| false $(|| registry.find_loader::<$ty>(tag).is_some())+;
                if !should_open_container(&mut peek, registry, &has_loader)? {
                    return Ok(output);
                }
                let mut file = peek.into_inner();
                file.seek(SeekFrom::Start(0))?;
                let input = BgzfInput::from_seekable(file, 1)?;
                let mut it = MessageIterator::new(input, registry)?;
                Self::load_first_encapsulated(&mut it, registry, &mut output)?;
                Ok(output)
            }

            fn load_first_encapsulated(
                it: &mut MessageIterator<'_>,
                registry: &Registry,
                output: &mut Self::Output,
            ) -> Result<bool> {
                loop {
                    let Some(current) = it.current() else {
                        return Ok(false);
                    };
                    let tag = current.tag.clone();
                    $(
                        if let Some(loader) = registry.find_loader::<$ty>(&tag) {
                            let mut source = GroupMessageSource { it, tag };
                            output.$idx = Some(loader.load(&mut source)?);
                            return Ok(true);
                        }
                    )+
                    while it.current().is_some_and(|m| m.tag == tag) {
                        it.take()?;
                    }
                }
            }

            fn any_loaded(output: &Self::Output) -> bool {
                false $(|| output.$idx.is_some())+
            }
        }
    };
}

impl_load_first!((A, 0));
impl_load_first!((A, 0), (B, 1));
impl_load_first!((A, 0), (B, 1), (C, 2));
impl_load_first!((A, 0), (B, 1), (C, 2), (D, 3));

/// Save `value` as a BGZF container: one presence-marking write of its
/// save tag, then every message its saver emits under that tag.
pub fn save<T: 'static>(value: &T, out: impl Write, registry: &Registry) -> Result<()> {
    let saver = registry
        .find_saver::<T>()
        .ok_or(VpkgError::UnknownType { type_name: type_name::<T>() })?;
    let tag = saver.tag().to_vec();

    let mut emitter = MessageEmitter::new(out, true);
    // Mark that this tag was serialized even if no messages follow.
    emitter.write(&tag)?;
    saver.save(value, &mut |message| emitter.write_copy(&tag, message))?;
    emitter.finish()?;
    Ok(())
}

/// [`save`] to a file, or standard output for `"-"`.
pub fn save_path<T: 'static>(value: &T, path: &str, registry: &Registry) -> Result<()> {
    if path == "-" {
        save(value, io::stdout(), registry)
    } else {
        save(value, std::fs::File::create(path)?, registry)
    }
}

/// Run a callback against a byte sink whose writes land in the container
/// as messages tagged `tag`, chunked transparently.
pub fn with_save_stream<W: Write>(
    out: W,
    tag: &[u8],
    use_stream: impl FnOnce(&mut dyn Write) -> io::Result<()>,
) -> Result<W> {
    let mut emitter = MessageEmitter::new(out, true);
    emitter.write(tag)?;
    {
        let mut consume = |chunk: &[u8]| emitter.write_copy(tag, chunk);
        let mut chunker = ChunkWriter::new(&mut consume);
        use_stream(&mut chunker).map_err(ChunkWriter::unwrap_error)?;
        chunker.finish()?;
    }
    emitter.finish()
}
