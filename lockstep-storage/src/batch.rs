//! Batch fan-out / fan-in.
//!
//! Any request larger than a per-call limit is split into chunks that run
//! concurrently. Each chunk writes only to its own slice of the caller's
//! pre-allocated output, so results land in input order no matter which
//! chunk finishes first.

use std::future::Future;
use std::ops::Range;

use futures_util::future::join_all;
use lockstep_core::{LockstepError, LockstepResult, MultiError};

/// Chunk size actually used for `len` items under `limit`. A `limit` of
/// zero means "no limit".
pub fn effective_limit(len: usize, limit: usize) -> usize {
    if limit == 0 {
        len.max(1)
    } else {
        limit
    }
}

/// Split `0..len` into consecutive ranges of at most `limit` items.
///
/// Pair the ranges with `chunks(effective_limit(len, limit))` of any
/// parallel slice.
pub fn chunk_ranges(len: usize, limit: usize) -> Vec<Range<usize>> {
    let limit = effective_limit(len, limit);
    (0..len)
        .step_by(limit)
        .map(|start| start..(start + limit).min(len))
        .collect()
}

/// Await every chunk and merge their outcomes into one result for `total`
/// positions.
pub async fn join_chunks<I, Fut>(total: usize, chunks: I) -> LockstepResult<()>
where
    I: IntoIterator<Item = (Range<usize>, Fut)>,
    Fut: Future<Output = LockstepResult<()>>,
{
    let (ranges, futures): (Vec<_>, Vec<_>) = chunks.into_iter().unzip();
    let results = join_all(futures).await;
    merge_chunk_results(total, ranges.into_iter().zip(results).collect())
}

/// Fold per-chunk outcomes into one result.
///
/// Every chunk succeeded: `Ok(())`. Otherwise a positional `MultiError`
/// of length `total`: a chunk's own `MultiError` is copied into its slot
/// range, a flat chunk error is repeated across its range, successful
/// chunks stay empty. The shape does not depend on how many chunks ran.
///
/// A chunk `MultiError` whose length does not match its range cannot be
/// placed and is returned as is.
pub fn merge_chunk_results(
    total: usize,
    results: Vec<(Range<usize>, LockstepResult<()>)>,
) -> LockstepResult<()> {
    if results.iter().all(|(_, r)| r.is_ok()) {
        return Ok(());
    }
    let mut merged = MultiError::new(total);
    for (range, result) in results {
        match result {
            Ok(()) => {}
            Err(LockstepError::Multi(me)) if me.len() == range.len() => {
                merged.copy_into(range, &me);
            }
            Err(err @ LockstepError::Multi(_)) => return Err(err),
            Err(err) => merged.fill(range, &err),
        }
    }
    merged.into_result()
}
