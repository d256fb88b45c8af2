//! Tag and type bookkeeping for container files.
//!
//! The registry binds short string tags to the code that loads and saves
//! the payloads carried under them. All bindings are made on a
//! [`RegistryBuilder`] during initialization and frozen into an immutable
//! [`Registry`] before any reader runs, so the lookup path is plain shared
//! reads with no locking.
//!
//! Three kinds of binding are supported:
//!
//! - **Record types**: a bidirectional tag <-> type association for
//!   schema-driven payloads, used to check that a stream carries the
//!   expected record kind.
//! - **Loaders/savers**: closures that build an object from a lazy
//!   sequence of tagged message payloads, or serialize one into such a
//!   sequence. Loaders are keyed by `(tag, requested type)`; each type has
//!   exactly one save tag.
//! - **Bare loaders**: closures over a raw, unframed byte stream, selected
//!   by a magic-prefix (or custom) sniffer, for formats that predate the
//!   container.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead, Read, Write};
use std::sync::{Arc, OnceLock};

use bstr::BString;

use crate::errors::{Result, VpkgError};
use crate::peek::Peek;

/// Longest permitted tag, in bytes.
///
/// Tags of 139 bytes or more could make an uncompressed file start with
/// the gzip magic number (the magic decodes as a 31-item group whose first
/// item is at least 139 bytes), so the ceiling stays far below that.
pub const MAX_TAG_LENGTH: usize = 25;

/// A lazy, single-pass, non-restartable sequence of message payloads, all
/// sharing one tag. What loaders consume.
pub trait MessageSource {
    /// The next payload, or `None` when the run of same-tag messages ends.
    fn next_message(&mut self) -> Result<Option<Vec<u8>>>;
}

/// A vector of payloads works as a message source, mainly for adapters
/// and tests.
impl MessageSource for std::vec::IntoIter<Vec<u8>> {
    fn next_message(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.next())
    }
}

type LoadFn = Arc<dyn Fn(&mut dyn MessageSource) -> Result<Box<dyn Any + Send>> + Send + Sync>;
type SaveFn = Arc<dyn Fn(&dyn Any, &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> + Send + Sync>;
type BareLoadFn = Arc<dyn Fn(&mut dyn BufRead) -> Result<Box<dyn Any + Send>> + Send + Sync>;
/// A peek-and-restore predicate deciding whether a bare loader applies.
pub type SniffFn = Arc<dyn Fn(&mut dyn Peek) -> io::Result<bool> + Send + Sync>;

/// Decides whether a bare loader applies to an input, by inspecting (and
/// restoring) its leading bytes.
pub enum Sniffer {
    /// The input starts with these literal magic bytes.
    Magic(Vec<u8>),
    /// Arbitrary peek-and-restore predicate.
    Custom(SniffFn),
}

impl Sniffer {
    /// Build a custom sniffer from a peek-and-restore predicate.
    pub fn custom(f: impl Fn(&mut dyn Peek) -> io::Result<bool> + Send + Sync + 'static) -> Self {
        Sniffer::Custom(Arc::new(f))
    }

    pub(crate) fn matches(&self, peek: &mut dyn Peek) -> io::Result<bool> {
        match self {
            Sniffer::Magic(magic) => Ok(peek.peek(magic.len())? == &magic[..]),
            Sniffer::Custom(f) => (**f)(peek),
        }
    }
}

struct BareEntry {
    load: BareLoadFn,
    sniffer: Option<Sniffer>,
}

#[derive(Default)]
struct Tables {
    /// Every literally registered tag; membership defines tag validity.
    tags: HashSet<Vec<u8>>,
    tag_to_record: HashMap<Vec<u8>, TypeId>,
    record_to_tag: HashMap<TypeId, Vec<u8>>,
    tag_to_loaders: HashMap<Vec<u8>, HashMap<TypeId, LoadFn>>,
    type_to_saver: HashMap<TypeId, (Vec<u8>, SaveFn)>,
    type_to_bare_loaders: HashMap<TypeId, Vec<BareEntry>>,
}

/// Accumulates registrations; freeze with [`build`](RegistryBuilder::build).
///
/// Registration mistakes (empty or oversized tags, duplicate save tags)
/// panic, since they can only come from initialization code.
#[derive(Default)]
pub struct RegistryBuilder {
    tables: Tables,
}

fn check_tag(tag: &[u8]) {
    assert!(!tag.is_empty(), "the empty tag is reserved for legacy untagged data");
    assert!(
        tag.len() <= MAX_TAG_LENGTH,
        "tag '{}' is longer than {MAX_TAG_LENGTH} bytes",
        BString::from(tag)
    );
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a record type to its tag, in both directions.
    pub fn register_record<T: 'static>(&mut self, tag: &[u8]) -> &mut Self {
        check_tag(tag);
        self.tables.tags.insert(tag.to_vec());
        self.tables.tag_to_record.insert(tag.to_vec(), TypeId::of::<T>());
        self.tables.record_to_tag.insert(TypeId::of::<T>(), tag.to_vec());
        self
    }

    /// Register a loader producing `T` from message payloads carried under
    /// any of `tags`.
    pub fn register_loader<T, F>(&mut self, tags: &[&[u8]], loader: F) -> &mut Self
    where
        T: Send + 'static,
        F: Fn(&mut dyn MessageSource) -> Result<T> + Send + Sync + 'static,
    {
        assert!(!tags.is_empty(), "a loader needs at least one tag");
        let erased: LoadFn =
            Arc::new(move |source| loader(source).map(|v| Box::new(v) as Box<dyn Any + Send>));
        for tag in tags {
            check_tag(tag);
            self.tables.tags.insert(tag.to_vec());
            self.tables
                .tag_to_loaders
                .entry(tag.to_vec())
                .or_default()
                .insert(TypeId::of::<T>(), Arc::clone(&erased));
        }
        self
    }

    /// Register the saver for `T`. Exactly one save tag is allowed per
    /// type.
    pub fn register_saver<T, F>(&mut self, tag: &[u8], saver: F) -> &mut Self
    where
        T: 'static,
        F: Fn(&T, &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> + Send + Sync + 'static,
    {
        check_tag(tag);
        let erased: SaveFn = Arc::new(move |value, consume| {
            let value = value.downcast_ref::<T>().expect("saver invoked with its registered type");
            saver(value, consume)
        });
        self.tables.tags.insert(tag.to_vec());
        let previous = self.tables.type_to_saver.insert(TypeId::of::<T>(), (tag.to_vec(), erased));
        assert!(previous.is_none(), "type already has a registered save tag");
        self
    }

    /// Register a loader and saver together. The first tag is the save
    /// tag; the rest are accepted on load only.
    pub fn register_loader_saver<T, L, S>(&mut self, tags: &[&[u8]], loader: L, saver: S) -> &mut Self
    where
        T: Send + 'static,
        L: Fn(&mut dyn MessageSource) -> Result<T> + Send + Sync + 'static,
        S: Fn(&T, &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> + Send + Sync + 'static,
    {
        assert!(!tags.is_empty(), "a loader/saver needs at least one tag");
        self.register_loader::<T, _>(tags, loader);
        self.register_saver::<T, _>(tags[0], saver)
    }

    /// Register a loader over a raw, unframed byte stream.
    ///
    /// With a sniffer, the loader participates in automatic format
    /// detection; without one it is only reachable when a caller
    /// explicitly dispatches to bare loading.
    pub fn register_bare_loader<T, F>(&mut self, sniffer: Option<Sniffer>, loader: F) -> &mut Self
    where
        T: Send + 'static,
        F: Fn(&mut dyn BufRead) -> Result<T> + Send + Sync + 'static,
    {
        let erased: BareLoadFn =
            Arc::new(move |stream| loader(stream).map(|v| Box::new(v) as Box<dyn Any + Send>));
        self.tables
            .type_to_bare_loaders
            .entry(TypeId::of::<T>())
            .or_default()
            .push(BareEntry { load: erased, sniffer });
        self
    }

    /// Register a bare-format loader/saver whose files start with literal
    /// magic bytes.
    ///
    /// Three bindings result: the bare loader (selected by the magic), and
    /// a tagged loader/saver pair under `tag` whose payloads are chunks of
    /// the bare byte stream, so the same format can also travel inside a
    /// container.
    pub fn register_bare_loader_saver_with_magic<T, L, S>(
        &mut self,
        tag: &[u8],
        magic: &[u8],
        loader: L,
        saver: S,
    ) -> &mut Self
    where
        T: Send + 'static,
        L: Fn(&mut dyn BufRead) -> Result<T> + Send + Sync + 'static,
        S: Fn(&T, &mut dyn Write) -> Result<()> + Send + Sync + 'static,
    {
        check_tag(tag);
        let loader = Arc::new(loader);

        // Tagged loader: concatenate the payload run back into a stream.
        let tagged_loader = Arc::clone(&loader);
        self.register_loader::<T, _>(&[tag], move |source| {
            let mut stream = MessageSourceReader::new(source);
            (*tagged_loader)(&mut stream)
        });

        // Tagged saver: chunk the bare serialization into messages.
        self.register_saver::<T, _>(tag, move |value, consume| {
            let mut chunker = ChunkWriter::new(consume);
            saver(value, &mut chunker).map_err(|e| match e {
                VpkgError::Io(io) => ChunkWriter::unwrap_error(io),
                other => other,
            })?;
            chunker.finish()
        });

        let bare_loader = Arc::clone(&loader);
        self.register_bare_loader::<T, _>(Some(Sniffer::Magic(magic.to_vec())), move |stream| {
            (*bare_loader)(stream)
        })
    }

    /// Freeze the builder into an immutable registry.
    #[must_use]
    pub fn build(self) -> Registry {
        Registry { tables: self.tables }
    }
}

/// The frozen registry. Lookups are read-only and safe to share across
/// threads.
pub struct Registry {
    tables: Tables,
}

static GLOBAL_REGISTRY: OnceLock<Registry> = OnceLock::new();

impl Registry {
    /// Install the process-wide registry. Call once during initialization,
    /// before any lookup.
    ///
    /// # Panics
    ///
    /// Panics if a registry has already been installed (including the
    /// empty one that [`global`](Registry::global) falls back to).
    pub fn install(builder: RegistryBuilder) -> &'static Registry {
        assert!(
            GLOBAL_REGISTRY.set(builder.build()).is_ok(),
            "process-wide registry installed twice"
        );
        GLOBAL_REGISTRY.get().expect("registry was just installed")
    }

    /// The process-wide registry, or an empty one if none was installed.
    #[must_use]
    pub fn global() -> &'static Registry {
        GLOBAL_REGISTRY.get_or_init(|| RegistryBuilder::new().build())
    }

    /// Whether a byte string read from a file is a registered tag, as
    /// opposed to message data from a legacy untagged file.
    #[must_use]
    pub fn is_valid_tag(&self, tag: &[u8]) -> bool {
        !tag.is_empty() && tag.len() <= MAX_TAG_LENGTH && self.tables.tags.contains(tag)
    }

    /// The tag to use when serializing records of type `T`, if registered.
    #[must_use]
    pub fn record_tag<T: 'static>(&self) -> Option<&[u8]> {
        self.tables.record_to_tag.get(&TypeId::of::<T>()).map(Vec::as_slice)
    }

    /// Whether `tag` is acceptable when deserializing records of type `T`.
    /// The empty tag is always acceptable, for legacy untagged files.
    #[must_use]
    pub fn check_record_tag<T: 'static>(&self, tag: &[u8]) -> bool {
        if tag.is_empty() {
            return true;
        }
        if tag.len() > MAX_TAG_LENGTH {
            return false;
        }
        self.tables.tag_to_record.get(tag) == Some(&TypeId::of::<T>())
    }

    /// The loader producing `T` from data tagged `tag`, if one is bound to
    /// that exact pair.
    #[must_use]
    pub fn find_loader<T: 'static>(&self, tag: &[u8]) -> Option<Loader<T>> {
        if tag.len() > MAX_TAG_LENGTH {
            return None;
        }
        let erased = self.tables.tag_to_loaders.get(tag)?.get(&TypeId::of::<T>())?;
        Some(Loader { erased: Arc::clone(erased), _marker: std::marker::PhantomData })
    }

    /// The save tag and saver for `T`, if registered.
    #[must_use]
    pub fn find_saver<T: 'static>(&self) -> Option<Saver<'_, T>> {
        let (tag, erased) = self.tables.type_to_saver.get(&TypeId::of::<T>())?;
        Some(Saver { tag, erased, _marker: std::marker::PhantomData })
    }

    /// All bare loaders that can produce `T`, in registration order. When
    /// several sniffers accept the same input, the first registered wins.
    #[must_use]
    pub fn find_bare_loaders<T: 'static>(&self) -> Vec<BareLoader<'_, T>> {
        self.tables
            .type_to_bare_loaders
            .get(&TypeId::of::<T>())
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| BareLoader {
                        erased: &entry.load,
                        sniffer: entry.sniffer.as_ref(),
                        _marker: std::marker::PhantomData,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A typed handle on a registered loader.
pub struct Loader<T> {
    erased: LoadFn,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: 'static> Loader<T> {
    /// Run the loader over a run of same-tag message payloads.
    pub fn load(&self, source: &mut dyn MessageSource) -> Result<T> {
        let boxed = (*self.erased)(source)?;
        Ok(*boxed.downcast::<T>().expect("loader produced its registered type"))
    }
}

/// A typed handle on a registered saver, with its save tag.
pub struct Saver<'r, T> {
    tag: &'r [u8],
    erased: &'r SaveFn,
    _marker: std::marker::PhantomData<fn(&T)>,
}

impl<T: 'static> Saver<'_, T> {
    /// The canonical tag this type serializes under.
    #[must_use]
    pub fn tag(&self) -> &[u8] {
        self.tag
    }

    /// Serialize `value`, handing each message payload to `consume`.
    pub fn save(&self, value: &T, consume: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        (**self.erased)(value, consume)
    }
}

/// A typed handle on a registered bare loader and its sniffer.
pub struct BareLoader<'r, T> {
    erased: &'r BareLoadFn,
    sniffer: Option<&'r Sniffer>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: 'static> BareLoader<'_, T> {
    /// Whether this loader has a sniffer that accepts the input. Loaders
    /// without sniffers never match automatically.
    pub fn sniff(&self, peek: &mut dyn Peek) -> io::Result<bool> {
        match self.sniffer {
            Some(sniffer) => sniffer.matches(peek),
            None => Ok(false),
        }
    }

    /// Run the loader on a raw byte stream.
    pub fn load(&self, stream: &mut dyn BufRead) -> Result<T> {
        let boxed = (**self.erased)(stream)?;
        Ok(*boxed.downcast::<T>().expect("bare loader produced its registered type"))
    }
}

// ============================================================================
// Bare-format adapters
// ============================================================================

/// Presents a run of message payloads as one continuous byte stream, so a
/// bare-format loader can read container-carried data unchanged.
pub struct MessageSourceReader<'a> {
    source: &'a mut dyn MessageSource,
    current: Vec<u8>,
    pos: usize,
}

impl<'a> MessageSourceReader<'a> {
    pub fn new(source: &'a mut dyn MessageSource) -> Self {
        Self { source, current: Vec::new(), pos: 0 }
    }
}

impl Read for MessageSourceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = buf.len().min(available.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for MessageSourceReader<'_> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        while self.pos >= self.current.len() {
            match self.source.next_message() {
                Ok(Some(message)) => {
                    self.current = message;
                    self.pos = 0;
                }
                Ok(None) => return Ok(&[]),
                Err(e) => return Err(io::Error::other(e)),
            }
        }
        Ok(&self.current[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.current.len());
    }
}

/// Chunk size for serializations routed through a [`ChunkWriter`].
const SAVE_CHUNK_SIZE: usize = 64 * 1024;

/// An `io::Write` that slices its input into message-sized chunks and
/// hands each to a consumer callback.
pub struct ChunkWriter<'a> {
    consume: &'a mut dyn FnMut(&[u8]) -> Result<()>,
    buffer: Vec<u8>,
}

impl<'a> ChunkWriter<'a> {
    pub fn new(consume: &'a mut dyn FnMut(&[u8]) -> Result<()>) -> Self {
        Self { consume, buffer: Vec::with_capacity(SAVE_CHUNK_SIZE) }
    }

    /// Emit any buffered tail as a final (short) chunk.
    pub fn finish(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            (self.consume)(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Recover a consumer error smuggled through the `io::Write` interface.
    pub(crate) fn unwrap_error(err: io::Error) -> VpkgError {
        if err.get_ref().is_some_and(|inner| inner.is::<VpkgError>()) {
            let inner = err.into_inner().expect("custom error just observed");
            *inner.downcast::<VpkgError>().expect("custom error type just checked")
        } else {
            VpkgError::Io(err)
        }
    }
}

impl Write for ChunkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= SAVE_CHUNK_SIZE {
            (self.consume)(&self.buffer).map_err(io::Error::other)?;
            self.buffer.clear();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peek::PeekReader;
    use std::io::Cursor;

    /// Toy record: a list of byte payloads, one per message.
    #[derive(Debug, PartialEq)]
    struct Payloads(Vec<Vec<u8>>);

    fn payloads_registry() -> Registry {
        let mut builder = RegistryBuilder::new();
        builder.register_loader_saver::<Payloads, _, _>(
            &[b"PLD"],
            |source| {
                let mut items = Vec::new();
                while let Some(message) = source.next_message()? {
                    items.push(message);
                }
                Ok(Payloads(items))
            },
            |value, consume| {
                for item in &value.0 {
                    consume(item)?;
                }
                Ok(())
            },
        );
        builder.build()
    }

    #[test]
    fn test_is_valid_tag() {
        let registry = payloads_registry();
        assert!(registry.is_valid_tag(b"PLD"));
        assert!(!registry.is_valid_tag(b"XYZ"));
        assert!(!registry.is_valid_tag(b""));
        assert!(!registry.is_valid_tag(&[b'x'; 26]));
    }

    #[test]
    fn test_loader_roundtrip() {
        let registry = payloads_registry();
        let loader = registry.find_loader::<Payloads>(b"PLD").unwrap();
        let mut source = vec![b"one".to_vec(), b"two".to_vec()].into_iter();
        let loaded = loader.load(&mut source).unwrap();
        assert_eq!(loaded, Payloads(vec![b"one".to_vec(), b"two".to_vec()]));
    }

    #[test]
    fn test_loader_requires_exact_pair() {
        let registry = payloads_registry();
        assert!(registry.find_loader::<Payloads>(b"OTH").is_none());
        assert!(registry.find_loader::<String>(b"PLD").is_none());
    }

    #[test]
    fn test_saver_tag_and_output() {
        let registry = payloads_registry();
        let saver = registry.find_saver::<Payloads>().unwrap();
        assert_eq!(saver.tag(), b"PLD");

        let value = Payloads(vec![b"a".to_vec(), b"bc".to_vec()]);
        let mut seen = Vec::new();
        saver.save(&value, &mut |message| {
            seen.push(message.to_vec());
            Ok(())
        }).unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"bc".to_vec()]);
    }

    #[test]
    fn test_record_tag_binding() {
        struct NodeRecord;
        let mut builder = RegistryBuilder::new();
        builder.register_record::<NodeRecord>(b"VG");
        let registry = builder.build();

        assert_eq!(registry.record_tag::<NodeRecord>(), Some(b"VG".as_slice()));
        assert!(registry.check_record_tag::<NodeRecord>(b"VG"));
        assert!(registry.check_record_tag::<NodeRecord>(b""));
        assert!(!registry.check_record_tag::<NodeRecord>(b"GAM"));
        assert!(registry.is_valid_tag(b"VG"));
    }

    #[test]
    fn test_bare_loader_magic_sniffing() {
        #[derive(Debug, PartialEq)]
        struct BareBlob(Vec<u8>);

        let mut builder = RegistryBuilder::new();
        builder.register_bare_loader::<BareBlob, _>(
            Some(Sniffer::Magic(b"GBI\x01".to_vec())),
            |stream| {
                let mut data = Vec::new();
                stream.read_to_end(&mut data)?;
                Ok(BareBlob(data))
            },
        );
        let registry = builder.build();

        let loaders = registry.find_bare_loaders::<BareBlob>();
        assert_eq!(loaders.len(), 1);

        let mut matching = PeekReader::new(Cursor::new(b"GBI\x01rest".to_vec()));
        assert!(loaders[0].sniff(&mut matching).unwrap());
        // Sniffing consumed nothing: the loader sees the magic too.
        let loaded = loaders[0].load(&mut matching).unwrap();
        assert_eq!(loaded, BareBlob(b"GBI\x01rest".to_vec()));

        let mut other = PeekReader::new(Cursor::new(b"HG10xxxx".to_vec()));
        assert!(!loaders[0].sniff(&mut other).unwrap());
    }

    #[test]
    fn test_bare_loader_without_sniffer_never_matches() {
        struct Opaque;
        let mut builder = RegistryBuilder::new();
        builder.register_bare_loader::<Opaque, _>(None, |_| Ok(Opaque));
        let registry = builder.build();

        let loaders = registry.find_bare_loaders::<Opaque>();
        let mut peek = PeekReader::new(Cursor::new(b"anything".to_vec()));
        assert!(!loaders[0].sniff(&mut peek).unwrap());
    }

    #[test]
    fn test_bare_loader_saver_with_magic_registers_tagged_pair() {
        #[derive(Debug, PartialEq)]
        struct Blob(Vec<u8>);

        let mut builder = RegistryBuilder::new();
        builder.register_bare_loader_saver_with_magic::<Blob, _, _>(
            b"BLOB",
            b"BL\x01",
            |stream| {
                let mut data = Vec::new();
                stream.read_to_end(&mut data)?;
                Ok(Blob(data))
            },
            |value, out| {
                out.write_all(&value.0)?;
                Ok(())
            },
        );
        let registry = builder.build();

        assert!(registry.is_valid_tag(b"BLOB"));
        assert_eq!(registry.find_bare_loaders::<Blob>().len(), 1);

        // Save through the tagged saver, load back through the tagged
        // loader: the chunks concatenate to the original stream.
        let value = Blob(b"BL\x01 followed by content".to_vec());
        let saver = registry.find_saver::<Blob>().unwrap();
        let mut messages = Vec::new();
        saver.save(&value, &mut |m| {
            messages.push(m.to_vec());
            Ok(())
        }).unwrap();
        assert!(!messages.is_empty());

        let loader = registry.find_loader::<Blob>(b"BLOB").unwrap();
        let mut source = messages.into_iter();
        assert_eq!(loader.load(&mut source).unwrap(), value);
    }

    #[test]
    fn test_message_source_reader_skips_empty_payloads() {
        let mut source =
            vec![Vec::new(), b"abc".to_vec(), Vec::new(), b"def".to_vec()].into_iter();
        let mut reader = MessageSourceReader::new(&mut source);
        let mut all = Vec::new();
        reader.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"abcdef");
    }

    #[test]
    fn test_chunk_writer_chunks_large_output() {
        let mut chunks = Vec::new();
        let mut consume = |m: &[u8]| {
            chunks.push(m.to_vec());
            Ok(())
        };
        let mut writer = ChunkWriter::new(&mut consume);
        let data = vec![0xabu8; SAVE_CHUNK_SIZE + 100];
        writer.write_all(&data).unwrap();
        writer.finish().unwrap();

        let total: usize = chunks.iter().map(Vec::len).sum();
        assert_eq!(total, data.len());
        assert!(chunks.len() >= 2);
        let flattened: Vec<u8> = chunks.concat();
        assert_eq!(flattened, data);
    }

    #[test]
    fn test_duplicate_save_tag_panics() {
        let result = std::panic::catch_unwind(|| {
            let mut builder = RegistryBuilder::new();
            builder.register_saver::<u32, _>(b"A", |_, _| Ok(()));
            builder.register_saver::<u32, _>(b"B", |_, _| Ok(()));
        });
        assert!(result.is_err());
    }
}
