//! End-to-end container tests: emitter to disk, iterator back, virtual
//! offsets, truncation handling.

use std::fs::{self, File};
use std::io::Cursor;

use anyhow::Result;
use tempfile::TempDir;

use vpkg::{
    BgzfInput, MessageEmitter, MessageIterator, Registry, RegistryBuilder, TaggedMessage,
    VpkgError,
};

fn registry_with(tags: &[&[u8]]) -> Registry {
    let mut builder = RegistryBuilder::new();
    for (i, tag) in tags.iter().enumerate() {
        // Each tag needs a distinct type for the bidirectional binding.
        match i {
            0 => builder.register_record::<u8>(tag),
            1 => builder.register_record::<u16>(tag),
            2 => builder.register_record::<u32>(tag),
            _ => builder.register_record::<u64>(tag),
        };
    }
    builder.build()
}

fn collect(mut it: MessageIterator<'_>) -> Result<Vec<TaggedMessage>> {
    let mut out = Vec::new();
    while let Some(message) = MessageIterator::take(&mut it)? {
        out.push(message);
    }
    Ok(out)
}

#[test]
fn empty_writer_produces_exactly_one_eof_block() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("empty.vpkg");

    let emitter = MessageEmitter::new(File::create(&path)?, true);
    emitter.finish()?;

    let bytes = fs::read(&path)?;
    assert_eq!(bytes.len(), 28);
    assert_eq!(bytes, vpkg_bgzf::BGZF_EOF);

    // And it reads back as an empty container.
    let registry = registry_with(&[b"GAM"]);
    let input = BgzfInput::open(&path, 1)?;
    let it = MessageIterator::new(input, &registry)?;
    assert!(!it.has_current());
    Ok(())
}

#[test]
fn disk_roundtrip_preserves_messages_and_tags() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("mixed.vpkg");
    let registry = registry_with(&[b"GAM", b"VG"]);

    let mut emitter = MessageEmitter::new(File::create(&path)?, true);
    for i in 0..2000u32 {
        emitter.write_message(b"GAM", i.to_le_bytes().to_vec())?;
    }
    emitter.write_message(b"VG", b"a graph chunk".to_vec())?;
    emitter.finish()?;

    let messages = collect(MessageIterator::new(BgzfInput::open(&path, 1)?, &registry)?)?;
    assert_eq!(messages.len(), 2001);
    for (i, message) in messages[..2000].iter().enumerate() {
        assert_eq!(message.tag, b"GAM");
        assert_eq!(message.message.as_deref(), Some((i as u32).to_le_bytes().as_slice()));
    }
    assert_eq!(messages[2000].tag, b"VG");
    Ok(())
}

#[test]
fn multithreaded_decode_reads_the_same_stream() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("big.vpkg");
    let registry = registry_with(&[b"GAM"]);

    // Enough data for several BGZF blocks.
    let mut emitter = MessageEmitter::new(File::create(&path)?, true);
    for i in 0..5000u32 {
        emitter.write_message(b"GAM", vec![(i % 251) as u8; 64])?;
    }
    emitter.finish()?;

    let inline = collect(MessageIterator::new(BgzfInput::open(&path, 1)?, &registry)?)?;
    let threaded = collect(MessageIterator::new(BgzfInput::open(&path, 4)?, &registry)?)?;
    assert_eq!(inline.len(), 5000);
    assert_eq!(inline, threaded);
    Ok(())
}

#[test]
fn group_offset_survives_seek_on_disk() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("seek.vpkg");
    let registry = registry_with(&[b"GAM"]);

    let mut emitter = MessageEmitter::new(File::create(&path)?, true);
    for batch in 0..10u8 {
        for i in 0..100u8 {
            emitter.write_message(b"GAM", vec![batch, i])?;
        }
        // Force a group boundary per batch.
        emitter.emit_group()?;
    }
    emitter.finish()?;

    let mut it = MessageIterator::new(BgzfInput::open(&path, 1)?, &registry)?;

    // Read through a few groups, remembering where one started.
    let mut vo_of_fifth_group = -1;
    let mut first_of_fifth = None;
    for _ in 0..1000 {
        let Some(message) = it.current().cloned() else { break };
        if message.message.as_deref().map(|m| m[0]) == Some(4) && first_of_fifth.is_none() {
            vo_of_fifth_group = it.tell_group();
            first_of_fifth = Some(message);
        }
        MessageIterator::take(&mut it)?;
    }
    let first_of_fifth = first_of_fifth.expect("batch 4 present");
    assert!(vo_of_fifth_group >= 0);

    // After a seek, the same message comes back.
    assert!(it.seek_group(vo_of_fifth_group)?);
    let replayed = MessageIterator::take(&mut it)?.expect("message at sought group");
    assert_eq!(replayed, first_of_fifth);
    Ok(())
}

#[test]
fn truncated_bgzf_file_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("truncated.vpkg");

    let mut emitter = MessageEmitter::new(Vec::new(), true);
    emitter.write_message(b"GAM", vec![1, 2, 3])?;
    let mut bytes = emitter.finish()?;
    bytes.truncate(bytes.len() - 28);
    fs::write(&path, &bytes)?;

    match BgzfInput::open(&path, 1) {
        Err(VpkgError::TruncatedContainer) => {}
        Err(other) => panic!("expected TruncatedContainer, got {other}"),
        Ok(_) => panic!("truncated input was accepted"),
    }
    Ok(())
}

#[test]
fn trailing_data_before_eof_block_is_read() -> Result<()> {
    // A writer may flush groups then end the file; everything before the
    // sentinel counts.
    let registry = registry_with(&[b"GAM"]);
    let mut emitter = MessageEmitter::new(Vec::new(), true);
    emitter.write_message(b"GAM", b"early".to_vec())?;
    emitter.flush()?;
    emitter.write_message(b"GAM", b"late".to_vec())?;
    let bytes = emitter.finish()?;

    let input = BgzfInput::from_seekable(Cursor::new(bytes), 1)?;
    let messages = collect(MessageIterator::new(input, &registry)?)?;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].message.as_deref(), Some(b"late".as_slice()));
    Ok(())
}

#[test]
fn legacy_untagged_file_reads_with_empty_tag() -> Result<()> {
    // A file written before tags existed: groups whose first item is
    // payload, not a registered tag.
    let registry = registry_with(&[b"GAM"]);
    let mut bytes = Vec::new();
    let payload: Vec<u8> = (0u8..200).collect();
    // count = 2: the "tag" slot holds the first payload, then one more.
    vpkg::frame::encode_group(&payload, &[b"second item".to_vec()], &mut bytes);

    let input = BgzfInput::from_seekable(Cursor::new(bytes), 1)?;
    let messages = collect(MessageIterator::new(input, &registry)?)?;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].tag, b"");
    assert_eq!(messages[0].message.as_deref(), Some(payload.as_slice()));
    assert_eq!(messages[1].tag, b"");
    Ok(())
}
