//! Batched parallel iteration over container messages.
//!
//! A single dispatcher pulls records sequentially (the iterator owns the
//! only access to the underlying stream), packs them into fixed-size
//! batches, and posts each batch to a small worker pool. Backpressure is
//! adaptive: when the number of outstanding batches reaches a cap the
//! dispatcher processes the batch itself, and if that inline work let the
//! workers drain more than a quarter of the backlog, the cap doubles (to a
//! hard ceiling), since consumers were starving.
//!
//! Ordering: the callback sees no interleaving within a pair, but there is
//! no global order across batches.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::unbounded;

use crate::errors::{Result, VpkgError};
use crate::message_iterator::MessageIterator;

/// Default records per batch for line-record streams.
pub const DEFAULT_BATCH_SIZE: usize = 512;

/// Default records per batch when iterating encapsulated messages.
pub const DEFAULT_MESSAGE_BATCH_SIZE: usize = 256;

/// Outstanding-batch cap never grows beyond this.
const MAX_OUTSTANDING_CAP: usize = 8192;

fn worker_count() -> usize {
    let threads = std::thread::available_parallelism().map(std::num::NonZero::get).unwrap_or(1);
    threads.saturating_sub(1).max(1)
}

/// The engine: fetch sequentially, process in batches, return how many
/// records the callback saw.
fn run_batched<M, F, E, P>(mut fetch: F, each: E, until_true: P, batch_size: usize) -> Result<u64>
where
    M: Send,
    F: FnMut() -> Result<Option<M>>,
    E: Fn(M) + Send + Sync,
    P: Fn() -> bool,
{
    if batch_size == 0 {
        return Err(VpkgError::InvalidArgument("batch size must be nonzero".into()));
    }

    let workers = worker_count();
    let outstanding = AtomicUsize::new(0);
    let outstanding = &outstanding;
    let each = &each;

    std::thread::scope(|scope| -> Result<u64> {
        let (tx, rx) = unbounded::<Vec<M>>();
        for _ in 0..workers {
            let rx = rx.clone();
            scope.spawn(move || {
                for batch in rx {
                    for item in batch {
                        each(item);
                    }
                    outstanding.fetch_sub(1, Ordering::AcqRel);
                }
            });
        }
        drop(rx);

        let mut max_outstanding = 2 * workers;
        let mut delivered: u64 = 0;

        loop {
            let mut batch = Vec::with_capacity(batch_size);
            let mut fetch_error = None;
            let mut end = false;
            while batch.len() < batch_size {
                match fetch() {
                    Ok(Some(item)) => batch.push(item),
                    Ok(None) => {
                        end = true;
                        break;
                    }
                    Err(e) => {
                        fetch_error = Some(e);
                        break;
                    }
                }
            }
            delivered += batch.len() as u64;

            if let Some(e) = fetch_error {
                // Records read before the failure are still delivered.
                for item in batch {
                    each(item);
                }
                return Err(e);
            }

            if batch.is_empty() {
                break;
            }

            if !until_true() {
                // Warm-up phase wants deterministic single-threaded order.
                for item in batch {
                    each(item);
                }
            } else if outstanding.load(Ordering::Acquire) < max_outstanding {
                outstanding.fetch_add(1, Ordering::AcqRel);
                tx.send(batch).expect("workers outlive the dispatcher");
            } else {
                // Saturated: work the batch here, then check whether the
                // pool drained enough meanwhile to justify a deeper
                // buffer.
                let before = outstanding.load(Ordering::Acquire);
                for item in batch {
                    each(item);
                }
                let after = outstanding.load(Ordering::Acquire);
                if after + before / 4 < before && max_outstanding < MAX_OUTSTANDING_CAP {
                    max_outstanding = (max_outstanding * 2).min(MAX_OUTSTANDING_CAP);
                    log::debug!("raising outstanding batch cap to {max_outstanding}");
                }
            }

            if end {
                break;
            }
        }

        drop(tx);
        Ok(delivered)
    })
}

/// Parallel for-each over a record fetcher. Returns the number of records
/// delivered to the callback.
pub fn for_each_parallel<M, F, E>(fetch: F, each: E, batch_size: usize) -> Result<u64>
where
    M: Send,
    F: FnMut() -> Result<Option<M>>,
    E: Fn(M) + Send + Sync,
{
    run_batched(fetch, each, || true, batch_size)
}

/// Parallel for-each over consecutive record pairs. The two records of a
/// pair are always delivered in one callback invocation. Counts records,
/// not pairs.
pub fn paired_for_each_parallel<M, F, E>(fetch_pair: F, each: E, batch_size: usize) -> Result<u64>
where
    M: Send,
    F: FnMut() -> Result<Option<(M, M)>>,
    E: Fn(M, M) + Send + Sync,
{
    paired_for_each_parallel_after_wait(fetch_pair, each, || true, batch_size)
}

/// Like [`paired_for_each_parallel`], processing batches inline on the
/// dispatcher until `single_threaded_until_true` first returns true.
pub fn paired_for_each_parallel_after_wait<M, F, E, P>(
    fetch_pair: F,
    each: E,
    single_threaded_until_true: P,
    batch_size: usize,
) -> Result<u64>
where
    M: Send,
    F: FnMut() -> Result<Option<(M, M)>>,
    E: Fn(M, M) + Send + Sync,
    P: Fn() -> bool,
{
    let pairs = run_batched(
        fetch_pair,
        |(first, second)| each(first, second),
        single_threaded_until_true,
        batch_size,
    )?;
    Ok(pairs * 2)
}

/// Pull the next payload carried under `expected` from the iterator.
///
/// A mismatched tag on the very first message is fatal (the stream holds
/// the wrong schema); later foreign tags are skipped silently so newer
/// writers can add types without breaking older readers.
fn next_payload_with_tag(
    it: &mut MessageIterator<'_>,
    expected: &[u8],
    first: &mut bool,
) -> Result<Option<Vec<u8>>> {
    loop {
        let Some(message) = it.take()? else {
            return Ok(None);
        };
        if message.tag != expected {
            if *first {
                return Err(VpkgError::UnexpectedTag {
                    expected: expected.into(),
                    found: message.tag.into(),
                });
            }
            log::debug!("skipping message with foreign tag while iterating");
            continue;
        }
        *first = false;
        let Some(payload) = message.message else {
            // Tag-only entry: announces the type, carries no record.
            continue;
        };
        return Ok(Some(payload));
    }
}

/// Parallel for-each over the payloads carried under `tag`. Returns the
/// number of payloads delivered.
pub fn for_each_message_parallel<E>(
    it: &mut MessageIterator<'_>,
    tag: &[u8],
    each: E,
    batch_size: usize,
) -> Result<u64>
where
    E: Fn(Vec<u8>) + Send + Sync,
{
    let mut first = true;
    for_each_parallel(|| next_payload_with_tag(it, tag, &mut first), each, batch_size)
}

/// Parallel for-each over interleaved payload pairs carried under `tag`.
/// An odd number of payloads is an error: the trailing element has no
/// mate.
pub fn paired_for_each_message_parallel<E>(
    it: &mut MessageIterator<'_>,
    tag: &[u8],
    each: E,
    batch_size: usize,
) -> Result<u64>
where
    E: Fn(Vec<u8>, Vec<u8>) + Send + Sync,
{
    paired_for_each_message_parallel_after_wait(it, tag, each, || true, batch_size)
}

/// Like [`paired_for_each_message_parallel`] with a warm-up predicate.
pub fn paired_for_each_message_parallel_after_wait<E, P>(
    it: &mut MessageIterator<'_>,
    tag: &[u8],
    each: E,
    single_threaded_until_true: P,
    batch_size: usize,
) -> Result<u64>
where
    E: Fn(Vec<u8>, Vec<u8>) + Send + Sync,
    P: Fn() -> bool,
{
    let mut first = true;
    paired_for_each_parallel_after_wait(
        || {
            let Some(mate1) = next_payload_with_tag(it, tag, &mut first)? else {
                return Ok(None);
            };
            let Some(mate2) = next_payload_with_tag(it, tag, &mut first)? else {
                return Err(VpkgError::InvalidArgument(
                    "unpaired last element in interleaved pair stream".into(),
                ));
            };
            Ok(Some((mate1, mate2)))
        },
        each,
        single_threaded_until_true,
        batch_size,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgzf_input::BgzfInput;
    use crate::frame;
    use crate::registry::{Registry, RegistryBuilder};
    use std::io::Cursor;
    use std::sync::atomic::AtomicU64;

    fn tag_registry() -> Registry {
        let mut builder = RegistryBuilder::new();
        builder.register_record::<()>(b"X");
        builder.register_record::<u8>(b"Y");
        builder.build()
    }

    fn container_bytes(groups: &[(&[u8], &[&[u8]])]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for (tag, messages) in groups {
            let owned: Vec<Vec<u8>> = messages.iter().map(|m| m.to_vec()).collect();
            frame::encode_group(tag, &owned, &mut bytes);
        }
        bytes
    }

    #[test]
    fn test_conservation_over_fetcher() {
        let total = 10_000u64;
        let mut next = 0u64;
        let seen = AtomicU64::new(0);
        let sum = AtomicU64::new(0);

        let delivered = for_each_parallel(
            || {
                if next < total {
                    next += 1;
                    Ok(Some(next))
                } else {
                    Ok(None)
                }
            },
            |item: u64| {
                seen.fetch_add(1, Ordering::Relaxed);
                sum.fetch_add(item, Ordering::Relaxed);
            },
            64,
        )
        .unwrap();

        assert_eq!(delivered, total);
        assert_eq!(seen.load(Ordering::Relaxed), total);
        assert_eq!(sum.load(Ordering::Relaxed), total * (total + 1) / 2);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let result = for_each_parallel(|| Ok(None::<u8>), |_| {}, 0);
        assert!(matches!(result, Err(VpkgError::InvalidArgument(_))));
    }

    #[test]
    fn test_single_threaded_until_true_runs_inline() {
        let dispatcher = std::thread::current().id();
        let mut next = 0u32;
        let off_thread = AtomicU64::new(0);

        paired_for_each_parallel_after_wait(
            || {
                if next < 100 {
                    next += 2;
                    Ok(Some((next - 2, next - 1)))
                } else {
                    Ok(None)
                }
            },
            |_a, _b| {
                if std::thread::current().id() != dispatcher {
                    off_thread.fetch_add(1, Ordering::Relaxed);
                }
            },
            || false,
            8,
        )
        .unwrap();

        assert_eq!(off_thread.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_message_driver_counts_payloads() {
        let registry = tag_registry();
        let bytes = container_bytes(&[
            (b"X", &[b"a", b"b", b"c"]),
            (b"X", &[b"d", b"e"]),
        ]);
        let input = BgzfInput::from_seekable(Cursor::new(bytes), 1).unwrap();
        let mut it = MessageIterator::new(input, &registry).unwrap();

        let seen = AtomicU64::new(0);
        let delivered = for_each_message_parallel(
            &mut it,
            b"X",
            |payload| {
                assert_eq!(payload.len(), 1);
                seen.fetch_add(1, Ordering::Relaxed);
            },
            DEFAULT_MESSAGE_BATCH_SIZE,
        )
        .unwrap();

        assert_eq!(delivered, 5);
        assert_eq!(seen.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_wrong_first_tag_is_fatal() {
        let registry = tag_registry();
        let bytes = container_bytes(&[(b"Y", &[b"a"])]);
        let input = BgzfInput::from_seekable(Cursor::new(bytes), 1).unwrap();
        let mut it = MessageIterator::new(input, &registry).unwrap();

        let result = for_each_message_parallel(&mut it, b"X", |_| {}, 16);
        assert!(matches!(result, Err(VpkgError::UnexpectedTag { .. })));
    }

    #[test]
    fn test_later_foreign_tags_skipped() {
        let registry = tag_registry();
        let bytes = container_bytes(&[
            (b"X", &[b"a"]),
            (b"Y", &[b"foreign", b"foreign"]),
            (b"X", &[b"b"]),
        ]);
        let input = BgzfInput::from_seekable(Cursor::new(bytes), 1).unwrap();
        let mut it = MessageIterator::new(input, &registry).unwrap();

        let delivered = for_each_message_parallel(&mut it, b"X", |_| {}, 16).unwrap();
        assert_eq!(delivered, 2);
    }

    #[test]
    fn test_odd_pair_stream_fails_after_full_pairs() {
        let registry = tag_registry();
        let bytes = container_bytes(&[(b"X", &[b"1", b"2", b"3", b"4", b"5"])]);
        let input = BgzfInput::from_seekable(Cursor::new(bytes), 1).unwrap();
        let mut it = MessageIterator::new(input, &registry).unwrap();

        let pairs_seen = AtomicU64::new(0);
        let result = paired_for_each_message_parallel(
            &mut it,
            b"X",
            |_a, _b| {
                pairs_seen.fetch_add(1, Ordering::Relaxed);
            },
            DEFAULT_MESSAGE_BATCH_SIZE,
        );

        assert!(matches!(result, Err(VpkgError::InvalidArgument(_))));
        // The two complete pairs were still delivered.
        assert_eq!(pairs_seen.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_tag_only_entries_are_not_records() {
        let registry = tag_registry();
        let mut bytes = Vec::new();
        frame::encode_group(b"X", &[], &mut bytes);
        frame::encode_group(b"X", &[b"only".to_vec()], &mut bytes);
        let input = BgzfInput::from_seekable(Cursor::new(bytes), 1).unwrap();
        let mut it = MessageIterator::new(input, &registry).unwrap();

        let delivered = for_each_message_parallel(&mut it, b"X", |_| {}, 16).unwrap();
        assert_eq!(delivered, 1);
    }
}
