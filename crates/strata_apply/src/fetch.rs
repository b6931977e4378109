//! Driving fetched streams into destination files.
//!
//! The driver is strictly serial: parts are consumed in the order they were
//! requested, and within a part the chunk list says exactly how many bytes
//! go where. Anything else would desynchronize the multi-range response.

use std::io::Read;
use std::os::fd::AsFd;
use std::path::Path;
use std::sync::Arc;

use rustix::fs::{Mode, OFlags, SeekFrom};
use strata_toc::FileMetadata;

use crate::decoder::{self, PartKind};
use crate::dest::{ApplyContext, DestinationFile, Finalizer};
use crate::dirfd::{open_root, open_under_root};
use crate::error::ApplyError;
use crate::planner::{
    merge_missing_parts, ranges_to_request, MissingPart, MIN_MISSING_PART_REQUESTS,
};
use crate::source::{BlobSource, BlobSourceError, BlobStreams};

/// Requests the remote ranges for `parts` and materializes every missing
/// chunk. When the source rejects the request as too large, the parts are
/// coalesced harder and the request retried, down to a floor.
pub(crate) fn retrieve_missing_parts(
    ctx: &Arc<ApplyContext>,
    source: &mut dyn BlobSource,
    entries: &[FileMetadata],
    mut parts: Vec<MissingPart>,
    kind: PartKind,
) -> Result<(), ApplyError> {
    let streams = loop {
        let ranges = ranges_to_request(&parts);
        if ranges.is_empty() {
            // Everything left is a hole or a local origin file.
            let (_tx, rx) = std::sync::mpsc::channel();
            break rx;
        }
        match source.get_blob_at(&ranges) {
            Ok(streams) => break streams,
            Err(BlobSourceError::BadRequest) => {
                let requested = parts.len();
                if requested < MIN_MISSING_PART_REQUESTS {
                    return Err(BlobSourceError::BadRequest.into());
                }
                parts = merge_missing_parts(parts, requested / 2);
            }
            Err(err) => return Err(err.into()),
        }
    };
    store_missing_parts(ctx, entries, &parts, streams, kind)
}

/// Opens the local byte source of a part backed by a prior layer.
fn open_origin_file(origin: &crate::planner::OriginFile) -> Result<Box<dyn Read>, ApplyError> {
    let root = open_root(&origin.root)?;
    let fd = open_under_root(
        root.as_fd(),
        Path::new(&origin.path),
        OFlags::RDONLY,
        Mode::empty(),
    )?;
    rustix::fs::seek(&fd, SeekFrom::Start(origin.offset)).map_err(std::io::Error::from)?;
    Ok(Box::new(std::fs::File::from(fd)))
}

/// Streams every planned part into its destination files.
fn store_missing_parts(
    ctx: &Arc<ApplyContext>,
    entries: &[FileMetadata],
    parts: &[MissingPart],
    streams: BlobStreams,
    kind: PartKind,
) -> Result<(), ApplyError> {
    let mut finalizer = Finalizer::spawn(Arc::clone(ctx));
    let mut current: Option<DestinationFile> = None;

    let result = (|| -> Result<(), ApplyError> {
        for part in parts {
            let part_kind = if part.hole {
                PartKind::Hole
            } else if part.origin_file.is_some() {
                PartKind::NoCompression
            } else {
                kind
            };

            let mut reader: Option<Box<dyn Read>> = match (&part.origin_file, part.hole) {
                (_, true) => None,
                (Some(origin), _) => Some(open_origin_file(origin)?),
                (None, false) => match streams.recv() {
                    Ok(Ok(stream)) => Some(Box::new(stream)),
                    Ok(Err(err)) => return Err(err.into()),
                    Err(_) => return Err(ApplyError::MissingStream),
                },
            };

            for chunk in &part.chunks {
                if chunk.gap > 0 {
                    if let Some(reader) = reader.as_mut() {
                        decoder::discard(reader.as_mut(), chunk.gap)?;
                    }
                    continue;
                }
                let Some(index) = chunk.file else { continue };
                let metadata = &entries[index];

                // Keep the file open across consecutive chunks; a change of
                // target hands the previous file to the finalizer.
                if current.as_ref().map(DestinationFile::name) != Some(metadata.name.as_str()) {
                    if let Some(done) = current.take() {
                        finalizer.submit(done)?;
                    }
                    current = Some(DestinationFile::open(ctx, metadata)?);
                }
                let dest = current.as_mut().expect("opened above");

                if chunk.hole || part_kind == PartKind::Hole {
                    // Holes stored in a data part still occupy compressed
                    // bytes that must be skipped.
                    if let Some(reader) = reader.as_mut() {
                        decoder::discard(reader.as_mut(), chunk.compressed_size)?;
                    }
                    dest.append_hole(chunk.uncompressed_size)?;
                    continue;
                }

                let reader = reader.as_mut().ok_or(ApplyError::MissingStream)?;
                let limit = if part_kind == PartKind::NoCompression {
                    chunk.uncompressed_size
                } else {
                    chunk.compressed_size
                };
                let mut framed = reader.take(limit);
                let copied =
                    decoder::copy_uncompressed(part_kind, &mut framed, dest, chunk.uncompressed_size)?;
                if copied != chunk.uncompressed_size {
                    return Err(ApplyError::ShortStream {
                        path: Path::new(&metadata.name).to_owned(),
                        expected: chunk.uncompressed_size,
                        actual: copied,
                    });
                }
                // Skip whatever the codec framing left unconsumed so the
                // next chunk starts at a deterministic offset.
                decoder::drain(&mut framed)?;
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            if let Some(done) = current.take() {
                finalizer.submit(done)?;
            }
            finalizer.finish()
        }
        Err(err) => {
            // Abandon the in-flight file (it is not validated) and surface
            // the first error; queued finalizations still run to completion.
            drop(current);
            let _ = finalizer.finish();
            Err(err)
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write as _;

    use strata_digest::compute_bytes_digest;
    use strata_toc::FileMetadata;

    use super::*;
    use crate::dest::ApplyContext;
    use crate::dirfd::open_root;
    use crate::options::TarOptions;
    use crate::planner::MissingFileChunk;
    use crate::source::{ChunkRange, FileBlobSource};
    use crate::verity::{VerityPolicy, VerityRecorder};

    fn context(root: &Path) -> Arc<ApplyContext> {
        Arc::new(ApplyContext {
            root: open_root(root).unwrap(),
            options: TarOptions::default(),
            verity: VerityRecorder::new(VerityPolicy::Disabled),
            skip_validation: false,
        })
    }

    fn entry(name: &str, content: &[u8]) -> FileMetadata {
        let mut meta = FileMetadata::regular(
            name,
            content.len() as u64,
            Some(compute_bytes_digest(content)),
        );
        meta.uid = rustix::process::getuid().as_raw();
        meta.gid = rustix::process::getgid().as_raw();
        meta
    }

    fn remote_part(offset: u64, length: u64, file: usize, uncompressed: u64) -> MissingPart {
        MissingPart {
            hole: false,
            source: ChunkRange { offset, length },
            origin_file: None,
            chunks: vec![MissingFileChunk {
                gap: 0,
                hole: false,
                file: Some(file),
                compressed_size: length,
                uncompressed_size: uncompressed,
            }],
        }
    }

    #[test]
    fn test_store_uncompressed_parts_with_gap() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path());

        let mut blob = tempfile::tempfile().unwrap();
        blob.write_all(b"AAAA-skip-BBBB").unwrap();
        let mut source = FileBlobSource::new(blob);

        let entries = vec![entry("a", b"AAAA"), entry("b", b"BBBB")];
        // One coalesced part covering both files and the gap between them.
        let part = MissingPart {
            hole: false,
            source: ChunkRange {
                offset: 0,
                length: 14,
            },
            origin_file: None,
            chunks: vec![
                MissingFileChunk {
                    gap: 0,
                    hole: false,
                    file: Some(0),
                    compressed_size: 4,
                    uncompressed_size: 4,
                },
                MissingFileChunk::gap(6),
                MissingFileChunk {
                    gap: 0,
                    hole: false,
                    file: Some(1),
                    compressed_size: 4,
                    uncompressed_size: 4,
                },
            ],
        };

        retrieve_missing_parts(
            &ctx,
            &mut source,
            &entries,
            vec![part],
            PartKind::NoCompression,
        )
        .unwrap();
        assert_eq!(std::fs::read(root.path().join("a")).unwrap(), b"AAAA");
        assert_eq!(std::fs::read(root.path().join("b")).unwrap(), b"BBBB");
    }

    #[test]
    fn test_zstd_part_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path());

        let payload = b"compressed file body".repeat(10);
        let compressed = zstd::stream::encode_all(&payload[..], 3).unwrap();
        let mut blob = tempfile::tempfile().unwrap();
        blob.write_all(&compressed).unwrap();
        let mut source = FileBlobSource::new(blob);

        let entries = vec![entry("z", &payload)];
        let part = remote_part(0, compressed.len() as u64, 0, payload.len() as u64);

        retrieve_missing_parts(&ctx, &mut source, &entries, vec![part], PartKind::ZstdChunked)
            .unwrap();
        assert_eq!(std::fs::read(root.path().join("z")).unwrap(), payload);
    }

    #[test]
    fn test_hole_part_creates_sparse_file() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path());

        let zeros = vec![0u8; 8192];
        let entries = vec![entry("sparse", &zeros)];
        let part = MissingPart {
            hole: true,
            source: ChunkRange {
                offset: 0,
                length: 0,
            },
            origin_file: None,
            chunks: vec![MissingFileChunk {
                gap: 0,
                hole: true,
                file: Some(0),
                compressed_size: 0,
                uncompressed_size: 8192,
            }],
        };

        let mut blob = tempfile::tempfile().unwrap();
        blob.write_all(b"").unwrap();
        let mut source = FileBlobSource::new(blob);

        retrieve_missing_parts(&ctx, &mut source, &entries, vec![part], PartKind::ZstdChunked)
            .unwrap();
        assert_eq!(std::fs::read(root.path().join("sparse")).unwrap(), zeros);
    }

    #[test]
    fn test_short_stream_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path());

        let mut blob = tempfile::tempfile().unwrap();
        blob.write_all(b"xy").unwrap();
        let mut source = FileBlobSource::new(blob);

        let entries = vec![entry("f", b"longer than the blob")];
        let part = remote_part(0, 2, 0, 20);

        let err = retrieve_missing_parts(
            &ctx,
            &mut source,
            &entries,
            vec![part],
            PartKind::NoCompression,
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::ShortStream { .. }));
    }

    struct BadRangeOnce {
        inner: FileBlobSource,
        calls: std::cell::Cell<usize>,
    }

    impl BlobSource for BadRangeOnce {
        fn get_blob_at(
            &mut self,
            ranges: &[ChunkRange],
        ) -> Result<crate::source::BlobStreams, BlobSourceError> {
            let call = self.calls.get();
            self.calls.set(call + 1);
            if call == 0 {
                return Err(BlobSourceError::BadRequest);
            }
            self.inner.get_blob_at(ranges)
        }
    }

    #[test]
    fn test_bad_range_retries_with_smaller_target() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path());

        let content: Vec<u8> = (0..=255u8).cycle().take(128 * 10).collect();
        let mut blob = tempfile::tempfile().unwrap();
        blob.write_all(&content).unwrap();

        let entries: Vec<_> = (0..128)
            .map(|i| entry(&format!("f{i}"), &content[i * 10..(i + 1) * 10]))
            .collect();
        let parts: Vec<_> = (0..128)
            .map(|i| remote_part(i as u64 * 10, 10, i, 10))
            .collect();

        let mut source = BadRangeOnce {
            inner: FileBlobSource::new(blob),
            calls: std::cell::Cell::new(0),
        };
        retrieve_missing_parts(&ctx, &mut source, &entries, parts, PartKind::NoCompression)
            .unwrap();
        assert_eq!(source.calls.get(), 2);
        for (i, meta) in entries.iter().enumerate() {
            assert_eq!(
                std::fs::read(root.path().join(&meta.name)).unwrap(),
                &content[i * 10..(i + 1) * 10]
            );
        }
    }

    #[test]
    fn test_bad_range_below_floor_aborts() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path());

        struct AlwaysBad;
        impl BlobSource for AlwaysBad {
            fn get_blob_at(
                &mut self,
                _ranges: &[ChunkRange],
            ) -> Result<crate::source::BlobStreams, BlobSourceError> {
                Err(BlobSourceError::BadRequest)
            }
        }

        let entries = vec![entry("f", b"0123456789")];
        let parts = vec![remote_part(0, 10, 0, 10)];
        let err = retrieve_missing_parts(
            &ctx,
            &mut AlwaysBad,
            &entries,
            parts,
            PartKind::NoCompression,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ApplyError::BlobSource(BlobSourceError::BadRequest)
        ));
    }
}
