//! Folding the flat manifest entry list into per-file records.

use crate::model::{ChunkRef, EntryType, FileMetadata, LayerFormat, ESTARGZ_LANDMARKS};
use crate::TocError;

/// The output of [`merge_entries`]: the per-file entry list and the total
/// uncompressed size of the layer.
#[derive(Debug, Clone)]
pub struct MergedToc {
    /// One entry per file; `chunk` continuations have been absorbed into
    /// their owning regular file's chunk list.
    pub entries: Vec<FileMetadata>,

    /// Sum of the uncompressed sizes of all files in the layer.
    pub total_size: u64,
}

/// True for bookkeeping entries that must not appear in the merged output.
fn must_skip(format: LayerFormat, entry: &FileMetadata) -> bool {
    format == LayerFormat::Estargz && ESTARGZ_LANDMARKS.contains(&entry.name.as_str())
}

/// Folds raw manifest entries into per-file records.
///
/// Each regular file absorbs the `chunk` continuation entries that follow it;
/// the byte range of every chunk is extended up to the start of the next
/// chunk so that a single range request can span consecutive chunks. End
/// offsets missing from the manifest (eStargz does not record them) are
/// reconstructed by walking the entries in reverse, seeded with the offset of
/// the table of contents itself.
///
/// Merging is idempotent: an already-merged list is returned unchanged.
pub fn merge_entries(
    format: LayerFormat,
    entries: &[FileMetadata],
    toc_offset: u64,
) -> Result<MergedToc, TocError> {
    let mut merged: Vec<FileMetadata> = Vec::with_capacity(entries.len());
    let mut total_size = 0u64;

    let mut i = 0;
    while i < entries.len() {
        let entry = &entries[i];
        if must_skip(format, entry) {
            i += 1;
            continue;
        }
        if entry.entry_type == EntryType::Chunk {
            return Err(TocError::ChunkWithoutRegularFile(entry.name.clone()));
        }

        total_size += entry.size;

        let mut entry = entry.clone();
        if entry.entry_type == EntryType::Reg {
            let continuations = entries[i + 1..]
                .iter()
                .take_while(|e| e.entry_type == EntryType::Chunk)
                .count();
            // An already-merged entry arrives with its chunk list populated
            // and no continuations left to absorb; keep it as-is.
            if continuations > 0 || entry.chunks.is_empty() {
                entry.chunks = build_chunk_list(&entry, &entries[i + 1..i + 1 + continuations]);
                if let Some(last) = entries[i..i + 1 + continuations]
                    .iter()
                    .rev()
                    .find(|e| e.end_offset != 0)
                {
                    entry.end_offset = last.end_offset;
                }
            }
            i += continuations;
        }
        merged.push(entry);
        i += 1;
    }

    link_offsets(&mut merged, toc_offset);

    Ok(MergedToc {
        entries: merged,
        total_size,
    })
}

/// Builds the chunk list of a regular entry: the entry itself describes the
/// first chunk, the continuation entries the rest. Logical chunk sizes are
/// derived from the `chunkSize` fields, with the last unsized chunk covering
/// the remainder of the file.
fn build_chunk_list(entry: &FileMetadata, continuations: &[FileMetadata]) -> Vec<ChunkRef> {
    let mut remaining = entry.size;
    let mut chunks = Vec::with_capacity(1 + continuations.len());
    for source in std::iter::once(entry).chain(continuations) {
        let size = if source.chunk_size > 0 {
            source.chunk_size
        } else {
            remaining
        };
        remaining = remaining.saturating_sub(size);
        let digest = source.chunk_digest.or(if continuations.is_empty() {
            // A file stored as a single chunk may omit the chunk digest; the
            // chunk bytes are then the whole file.
            entry.digest
        } else {
            None
        });
        chunks.push(ChunkRef {
            offset: source.offset,
            end_offset: source.end_offset,
            size,
            digest,
            kind: source.chunk_type,
        });
    }
    chunks
}

/// Reconstructs missing end offsets and chains every chunk's range up to the
/// start of its successor.
fn link_offsets(merged: &mut [FileMetadata], toc_offset: u64) {
    let mut last_offset = toc_offset;
    for entry in merged.iter_mut().rev() {
        if entry.end_offset == 0 {
            entry.end_offset = last_offset;
        }
        if entry.offset != 0 {
            last_offset = entry.offset;
        }

        let mut last_chunk_offset = entry.end_offset;
        for chunk in entry.chunks.iter_mut().rev() {
            chunk.end_offset = last_chunk_offset;
            last_chunk_offset = chunk.offset;
        }
    }
}

#[cfg(test)]
mod test {
    use strata_digest::compute_bytes_digest;

    use super::*;
    use crate::model::{ChunkKind, Toc};

    fn sample_entries() -> Vec<FileMetadata> {
        let mut small = FileMetadata::regular("etc/hostname", 6, Some(compute_bytes_digest(b"horse\n")));
        small.offset = 100;
        small.end_offset = 140;

        let big_digest = compute_bytes_digest(b"0123456789abcdef");
        let mut big = FileMetadata::regular("usr/share/blob", 16, Some(big_digest));
        big.offset = 140;
        big.end_offset = 160;
        big.chunk_size = 8;
        big.chunk_digest = Some(compute_bytes_digest(b"01234567"));
        let continuation = FileMetadata::chunk(
            "usr/share/blob",
            160,
            8,
            8,
            Some(compute_bytes_digest(b"89abcdef")),
        );

        vec![
            FileMetadata::directory("etc"),
            small,
            FileMetadata::directory("usr"),
            big,
            continuation,
        ]
    }

    #[test]
    fn test_merge_absorbs_continuations() {
        let merged = merge_entries(LayerFormat::ZstdChunked, &sample_entries(), 400).unwrap();
        assert_eq!(merged.entries.len(), 4);
        assert_eq!(merged.total_size, 22);

        let big = &merged.entries[3];
        assert_eq!(big.chunks.len(), 2);
        assert_eq!(big.chunks[0].offset, 140);
        assert_eq!(big.chunks[0].end_offset, 160);
        assert_eq!(big.chunks[0].size, 8);
        assert_eq!(big.chunks[1].offset, 160);
        assert_eq!(big.chunks[1].size, 8);
        // The last chunk's range extends to the table of contents.
        assert_eq!(big.chunks[1].end_offset, 400);
        assert_eq!(big.end_offset, 400);
    }

    #[test]
    fn test_chunk_sizes_cover_declared_size() {
        let merged = merge_entries(LayerFormat::ZstdChunked, &sample_entries(), 400).unwrap();
        for entry in &merged.entries {
            if entry.entry_type == EntryType::Reg {
                let total: u64 = entry.chunks.iter().map(|c| c.size).sum();
                assert_eq!(total, entry.size, "chunk sizes of {:?}", entry.name);
            }
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let once = merge_entries(LayerFormat::ZstdChunked, &sample_entries(), 400).unwrap();
        let twice = merge_entries(LayerFormat::ZstdChunked, &once.entries, 400).unwrap();
        assert_eq!(once.entries, twice.entries);
        assert_eq!(once.total_size, twice.total_size);
    }

    #[test]
    fn test_single_chunk_inherits_file_digest() {
        let entries = sample_entries();
        let merged = merge_entries(LayerFormat::ZstdChunked, &entries, 400).unwrap();
        let small = &merged.entries[1];
        assert_eq!(small.chunks.len(), 1);
        assert_eq!(small.chunks[0].digest, small.digest);
        assert_eq!(small.chunks[0].kind, ChunkKind::Data);
    }

    #[test]
    fn test_dangling_chunk_is_rejected() {
        let entries = vec![
            FileMetadata::directory("etc"),
            FileMetadata::chunk("etc/orphan", 64, 0, 8, None),
        ];
        let err = merge_entries(LayerFormat::ZstdChunked, &entries, 100).unwrap_err();
        assert!(matches!(err, TocError::ChunkWithoutRegularFile(name) if name == "etc/orphan"));
    }

    #[test]
    fn test_estargz_landmarks_are_dropped_and_offsets_rebuilt() {
        let mut file = FileMetadata::regular("bin/sh", 4, Some(compute_bytes_digest(b"exec")));
        file.offset = 50;
        // eStargz leaves end offsets unset.
        file.end_offset = 0;
        let entries = vec![FileMetadata::regular(".no.prefetch.landmark", 0, None), file];

        let merged = merge_entries(LayerFormat::Estargz, &entries, 90).unwrap();
        assert_eq!(merged.entries.len(), 1);
        assert_eq!(merged.entries[0].end_offset, 90);
        assert_eq!(merged.entries[0].chunks[0].end_offset, 90);
    }

    #[test]
    fn test_toc_json_round_trip() {
        let toc = Toc::new(sample_entries());
        let json = serde_json::to_vec(&toc).unwrap();
        let decoded = Toc::from_json(&json).unwrap();
        assert_eq!(decoded.version, toc.version);
        assert_eq!(decoded.entries.len(), toc.entries.len());
    }
}
