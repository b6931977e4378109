#![deny(missing_docs)]

//! Table-of-contents data model for seekable chunked container layers.
//!
//! A chunked layer blob embeds a manifest describing every file in the layer
//! together with the compressed byte ranges ("chunks") that hold each file's
//! data. The manifest is a flat list: a large file is stored as a regular
//! entry followed by `chunk` continuation entries. This crate provides the
//! decoded form of that manifest ([`Toc`], [`FileMetadata`]) and the *entry
//! merger* ([`merge_entries`]) that folds continuation entries into per-file
//! chunk lists and reconstructs the byte ranges a fetcher needs.
//!
//! Decoding the on-disk manifest encodings (zstd-compressed JSON for
//! zstd:chunked, the gzip TOC record for eStargz) is the concern of the
//! calling store; this crate only deals with the decoded entries.

mod merge;
mod model;

pub use merge::{merge_entries, MergedToc};
pub use model::{ChunkKind, ChunkRef, EntryType, FileMetadata, LayerFormat, Toc, TOC_VERSION};

/// An error raised while validating or merging TOC entries.
#[derive(Debug, thiserror::Error)]
pub enum TocError {
    /// A `chunk` continuation entry appeared without a preceding regular file.
    #[error("chunk entry {0:?} is not preceded by a regular file")]
    ChunkWithoutRegularFile(String),

    /// The manifest could not be decoded.
    #[error("failed to decode table of contents")]
    Decode(#[from] serde_json::Error),
}

/// Collects the set of uids and gids referenced by the given entries.
///
/// The returned vectors are sorted and free of duplicates. The owning store
/// uses them to prepare ID mappings before the layer is mounted.
pub fn collect_ids(entries: &[FileMetadata]) -> (Vec<u32>, Vec<u32>) {
    let mut uids = std::collections::BTreeSet::new();
    let mut gids = std::collections::BTreeSet::new();
    for entry in entries {
        uids.insert(entry.uid);
        gids.insert(entry.gid);
    }
    (uids.into_iter().collect(), gids.into_iter().collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_collect_ids_deduplicates() {
        let mut a = FileMetadata::regular("a", 0, None);
        a.uid = 1000;
        a.gid = 100;
        let mut b = FileMetadata::regular("b", 0, None);
        b.uid = 1000;
        b.gid = 0;
        let (uids, gids) = collect_ids(&[a, b]);
        assert_eq!(uids, vec![1000]);
        assert_eq!(gids, vec![0, 100]);
    }
}
