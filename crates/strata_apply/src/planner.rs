//! Coalescing missing chunks into as few range requests as the source (and
//! common sense) allow.

use std::path::PathBuf;

use itertools::Itertools as _;

use crate::source::ChunkRange;

/// Hard cap on ranges per request; the first request never asks for more.
pub(crate) const MAX_MISSING_PART_REQUESTS: usize = 1024;

/// Give up once the source still rejects a request this small.
pub(crate) const MIN_MISSING_PART_REQUESTS: usize = 64;

/// A prior-layer location whose bytes can replace a remote range.
#[derive(Debug, Clone)]
pub(crate) struct OriginFile {
    pub root: PathBuf,
    pub path: String,
    pub offset: u64,
}

/// One consumer of a part's stream: either a gap to discard or a chunk to
/// write into a destination file (addressed by its merged-entry index).
#[derive(Debug, Clone)]
pub(crate) struct MissingFileChunk {
    pub gap: u64,
    pub hole: bool,
    pub file: Option<usize>,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl MissingFileChunk {
    pub(crate) fn gap(len: u64) -> Self {
        Self {
            gap: len,
            hole: false,
            file: None,
            compressed_size: 0,
            uncompressed_size: 0,
        }
    }
}

/// A unit of outstanding work: a blob range to fetch, unless the bytes can
/// come from a hole or a local origin file instead.
#[derive(Debug, Clone)]
pub(crate) struct MissingPart {
    pub hole: bool,
    pub source: ChunkRange,
    pub origin_file: Option<OriginFile>,
    pub chunks: Vec<MissingFileChunk>,
}

impl MissingPart {
    /// True when the part needs bytes from the remote blob.
    pub(crate) fn is_remote(&self) -> bool {
        !self.hole && self.origin_file.is_none()
    }
}

/// The ranges to actually request for a planned part list.
pub(crate) fn ranges_to_request(parts: &[MissingPart]) -> Vec<ChunkRange> {
    parts
        .iter()
        .filter(|p| p.is_remote())
        .map(|p| p.source)
        .collect()
}

/// Bytes between the end of `prev`'s range and the start of `cur`'s.
/// Negative when ranges overlap, which happens when deduplicated content
/// appears several times in the manifest.
fn gap_between(prev: &MissingPart, cur: &MissingPart) -> i64 {
    cur.source.offset as i64 - (prev.source.offset + prev.source.length) as i64
}

/// What merging `cur` into `prev` would cost in wasted download bytes: the
/// gap itself, plus any origin-file bytes that would have to be fetched
/// instead of read locally.
fn merge_cost(prev: &MissingPart, cur: &MissingPart) -> i64 {
    let mut cost = gap_between(prev, cur);
    if prev.origin_file.is_some() {
        cost += prev.source.length as i64;
    }
    if cur.origin_file.is_some() {
        cost += cur.source.length as i64;
    }
    cost
}

/// Reduces the part list to at most `target` entries.
///
/// Two passes: first, free merges of directly adjacent remote single-chunk
/// parts of the same file; then, if still over target, cost-ranked merges of
/// neighboring parts, discarding the gap bytes at fetch time. The cost
/// threshold is picked from the sorted adjacency costs, so duplicates can
/// make the pass merge slightly more than needed; the target is a heuristic
/// anyway.
pub(crate) fn merge_missing_parts(parts: Vec<MissingPart>, target: usize) -> Vec<MissingPart> {
    if parts.is_empty() {
        return parts;
    }

    // Pass 1: adjacent pieces of the same file, no gap, nothing local.
    let mut merged: Vec<MissingPart> = Vec::with_capacity(parts.len());
    for part in parts {
        let free_merge = merged.last().is_some_and(|prev| {
            gap_between(prev, &part) == 0
                && prev.is_remote()
                && part.is_remote()
                && prev.chunks.len() == 1
                && part.chunks.len() == 1
                && prev.chunks[0].file.is_some()
                && prev.chunks[0].file == part.chunks[0].file
        });
        if free_merge {
            let prev = merged.last_mut().expect("just matched");
            prev.source.length += part.source.length;
            prev.chunks[0].compressed_size += part.chunks[0].compressed_size;
            prev.chunks[0].uncompressed_size += part.chunks[0].uncompressed_size;
        } else {
            merged.push(part);
        }
    }

    if merged.len() <= target {
        return merged;
    }

    // Pass 2: pick the cheapest adjacencies until the count fits.
    let costs: Vec<i64> = merged
        .iter()
        .tuple_windows()
        .map(|(prev, cur)| merge_cost(prev, cur))
        .collect();
    let to_shrink = (merged.len() - target).min(costs.len() - 1);
    let threshold = *costs.iter().sorted().nth(to_shrink).expect("non-empty");

    let mut result: Vec<MissingPart> = Vec::with_capacity(target);
    for (i, part) in merged.into_iter().enumerate() {
        let mergeable = i > 0 && costs[i - 1] <= threshold;
        let prev = result.last_mut();
        match (mergeable, prev) {
            (true, Some(prev)) => {
                let gap = gap_between(prev, &part);
                if gap < 0 {
                    // Overlapping ranges cannot share one stream.
                    result.push(part);
                    continue;
                }
                prev.source.length += gap as u64 + part.source.length;
                prev.hole = false;
                prev.origin_file = None;
                if gap > 0 {
                    prev.chunks.push(MissingFileChunk::gap(gap as u64));
                }
                prev.chunks.extend(part.chunks);
            }
            _ => result.push(part),
        }
    }
    result
}
