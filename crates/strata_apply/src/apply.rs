//! The apply orchestrator: phase sequencing, the dedup worker pool, and the
//! output record.

use std::collections::{HashMap, HashSet};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use rustix::fs::XattrFlags;
use strata_digest::ContentDigest;
use strata_toc::{collect_ids, merge_entries, EntryType, FileMetadata, LayerFormat, Toc};

use crate::attrs::{override_stat_value, set_file_attrs, CONTAINERS_OVERRIDE_XATTR};
use crate::cache::{validate_chunk_checksum, LayerCache};
use crate::convert::{convert_raw_blob, ChunkedCompressor};
use crate::decoder::PartKind;
use crate::dedup::{find_and_copy_file, DedupConfig, DedupedFile};
use crate::dest::ApplyContext;
use crate::dirfd::{open_root, reopen_read_only, sanitized_rel_path};
use crate::error::ApplyError;
use crate::fetch::retrieve_missing_parts;
use crate::options::{
    StoreOptions, TarOptions, OPTION_CONVERT_IMAGES, OPTION_ENABLE_PARTIAL_IMAGES,
    OPTION_USE_HARD_LINKS,
};
use crate::output::{
    ApplyOutput, OutputFormat, LAYER_DATA_BIG_DATA_KEY, MANIFEST_BIG_DATA_KEY,
};
use crate::planner::{
    merge_missing_parts, MissingFileChunk, MissingPart, OriginFile, MAX_MISSING_PART_REQUESTS,
};
use crate::source::{BlobSource, ChunkRange};
use crate::tree::{
    create_empty_file, safe_link, safe_mkdir, safe_mknod, safe_symlink, RootWhiteoutOps,
};
use crate::verity::{VerityPolicy, VerityRecorder};

/// Size of the worker pool probing local dedup sources.
const COPY_WORKERS: usize = 32;

/// Annotation marking a blob as zstd:chunked, valued with the TOC digest.
pub const ZSTD_CHUNKED_TOC_DIGEST_ANNOTATION: &str =
    "io.github.containers.zstd-chunked.manifest-checksum";

/// Annotation marking a blob as eStargz, valued with the TOC digest.
pub const ESTARGZ_TOC_DIGEST_ANNOTATION: &str = "containerd.io/snapshot/stargz/toc.digest";

/// Inspects blob annotations for a table-of-contents marker. A blob
/// advertising both formats is corrupt.
pub fn detect_layer_format(
    annotations: &HashMap<String, String>,
) -> Result<Option<LayerFormat>, ApplyError> {
    let zstd_chunked = annotations.contains_key(ZSTD_CHUNKED_TOC_DIGEST_ANNOTATION);
    let estargz = annotations.contains_key(ESTARGZ_TOC_DIGEST_ANNOTATION);
    match (zstd_chunked, estargz) {
        (true, true) => Err(ApplyError::AmbiguousTocFormat),
        (true, false) => Ok(Some(LayerFormat::ZstdChunked)),
        (false, true) => Ok(Some(LayerFormat::Estargz)),
        (false, false) => Ok(None),
    }
}

/// Per-apply knobs chosen by the storage driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApplyOptions {
    /// The on-disk layout to produce.
    pub output_format: OutputFormat,
    /// Whether files are enrolled for kernel attestation.
    pub verity: VerityPolicy,
}

enum DifferMode {
    Chunked {
        format: LayerFormat,
        toc: Toc,
        manifest: Vec<u8>,
        tar_split: Vec<u8>,
        toc_offset: u64,
        toc_digest: ContentDigest,
    },
    Convert {
        blob_digest: ContentDigest,
        blob_size: u64,
        compressor: Box<dyn ChunkedCompressor>,
    },
}

/// Applies one layer blob under a destination root.
///
/// A differ is built either from a decoded table of contents
/// ([`Differ::from_toc`]) or, for blobs without one, from the raw blob
/// digest and a compressor that produces the chunked format locally
/// ([`Differ::convert_from_raw`]). It is consumed by
/// [`apply_diff`](Differ::apply_diff).
pub struct Differ {
    source: Box<dyn BlobSource>,
    cache: Arc<dyn LayerCache>,
    store_opts: StoreOptions,
    mode: DifferMode,
}

impl Differ {
    /// Builds a differ for a blob with an embedded table of contents.
    ///
    /// `manifest` is the raw (decompressed) manifest blob, preserved
    /// verbatim in the output; `toc` is its decoded form; `toc_offset` is
    /// the position of the manifest inside the blob, capping the last
    /// chunk's byte range.
    #[allow(clippy::too_many_arguments)]
    pub fn from_toc(
        source: Box<dyn BlobSource>,
        cache: Arc<dyn LayerCache>,
        store_opts: StoreOptions,
        format: LayerFormat,
        toc: Toc,
        manifest: Vec<u8>,
        tar_split: Vec<u8>,
        toc_offset: u64,
        toc_digest: ContentDigest,
    ) -> Result<Self, ApplyError> {
        if !store_opts.bool_option(OPTION_ENABLE_PARTIAL_IMAGES, true) {
            return Err(ApplyError::PartialImagesDisabled);
        }
        Ok(Self {
            source,
            cache,
            store_opts,
            mode: DifferMode::Chunked {
                format,
                toc,
                manifest,
                tar_split,
                toc_offset,
                toc_digest,
            },
        })
    }

    /// Builds a differ for an opaque compressed tarball, converted locally
    /// into the chunked format before application.
    pub fn convert_from_raw(
        source: Box<dyn BlobSource>,
        cache: Arc<dyn LayerCache>,
        store_opts: StoreOptions,
        blob_digest: ContentDigest,
        blob_size: u64,
        compressor: Box<dyn ChunkedCompressor>,
    ) -> Result<Self, ApplyError> {
        if !store_opts.bool_option(OPTION_ENABLE_PARTIAL_IMAGES, true) {
            return Err(ApplyError::PartialImagesDisabled);
        }
        if !store_opts.bool_option(OPTION_CONVERT_IMAGES, false) {
            return Err(ApplyError::ConversionDisabled);
        }
        Ok(Self {
            source,
            cache,
            store_opts,
            mode: DifferMode::Convert {
                blob_digest,
                blob_size,
                compressor,
            },
        })
    }

    /// Materializes the layer under `dest` and returns the output record.
    ///
    /// `dest` is scratch space owned by the calling driver: on error,
    /// partially written state is left in place for the driver's rollback.
    pub fn apply_diff(
        self,
        dest: &Path,
        options: TarOptions,
        apply_options: &ApplyOptions,
    ) -> Result<ApplyOutput, ApplyError> {
        let Differ {
            source,
            cache,
            store_opts,
            mode,
        } = self;
        let result = apply_inner(source, &cache, &store_opts, mode, dest, options, apply_options);
        cache.release();
        result
    }
}

#[allow(clippy::too_many_lines)]
fn apply_inner(
    mut source: Box<dyn BlobSource>,
    cache: &Arc<dyn LayerCache>,
    store_opts: &StoreOptions,
    mode: DifferMode,
    dest: &Path,
    options: TarOptions,
    apply_options: &ApplyOptions,
) -> Result<ApplyOutput, ApplyError> {
    let mut skip_validation = false;
    let mut uncompressed_digest = None;

    let (format, toc, manifest, tar_split, toc_offset, toc_digest) = match mode {
        DifferMode::Chunked {
            format,
            toc,
            manifest,
            tar_split,
            toc_offset,
            toc_digest,
        } => (format, toc, manifest, tar_split, toc_offset, Some(toc_digest)),
        DifferMode::Convert {
            blob_digest,
            blob_size,
            compressor,
        } => {
            let converted =
                convert_raw_blob(source.as_mut(), blob_size, blob_digest, compressor.as_ref(), dest)?;
            // The stream was produced and hashed locally; re-validating
            // every file against digests we just computed buys nothing.
            skip_validation = true;
            uncompressed_digest = Some(converted.uncompressed_digest);
            source = Box::new(converted.source);
            let manifest =
                serde_json::to_vec(&converted.toc).map_err(ApplyError::LayerDataEncode)?;
            (
                LayerFormat::ZstdChunked,
                converted.toc,
                manifest,
                converted.tar_split,
                converted.toc_offset,
                None,
            )
        }
    };

    let use_hard_links = store_opts.bool_option(OPTION_USE_HARD_LINKS, false);
    let dedup_config = DedupConfig {
        use_hard_links,
        object_repos: store_opts.object_repos(),
    };

    // Ids are collected before any remapping; the driver needs the original
    // ones to prepare mappings.
    let (uids, gids) = collect_ids(&toc.entries);

    let merged = merge_entries(format, &toc.entries, toc_offset)?;
    let total_size = merged.total_size;
    let mut entries = merged.entries;

    for entry in &mut entries {
        let cleaned = sanitized_rel_path(&entry.name)?;
        entry.name = if cleaned.as_os_str().is_empty() {
            ".".to_owned()
        } else {
            cleaned.to_string_lossy().into_owned()
        };
        if entry.entry_type == EntryType::Hardlink {
            // Hard-link targets are layer paths and bound by the same
            // containment rules; symlink targets are kept verbatim.
            entry.link_name = sanitized_rel_path(&entry.link_name)?
                .to_string_lossy()
                .into_owned();
        }
    }

    options.remap_entries(&mut entries)?;

    if let Some(mask) = options.force_mask {
        use base64::Engine as _;
        for entry in &mut entries {
            let stashed = override_stat_value(entry.uid, entry.gid, entry.mode);
            entry.xattrs.insert(
                CONTAINERS_OVERRIDE_XATTR.to_owned(),
                base64::engine::general_purpose::STANDARD.encode(stashed),
            );
            entry.mode = mask;
        }
        // The root itself keeps its real ownership in the same xattr.
        let stat = rustix::fs::stat(dest).map_err(std::io::Error::from)?;
        let value = override_stat_value(stat.st_uid, stat.st_gid, stat.st_mode);
        rustix::fs::setxattr(
            dest,
            CONTAINERS_OVERRIDE_XATTR,
            value.as_bytes(),
            XattrFlags::empty(),
        )
        .map_err(std::io::Error::from)?;
    }

    let root = open_root(dest)?;

    if apply_options.output_format == OutputFormat::Flat {
        entries = make_entries_flat(entries)?;
        let mut created = HashSet::new();
        for entry in &entries {
            let prefix = &entry.name[..2];
            if created.insert(prefix.to_owned()) {
                let _ = rustix::fs::mkdirat(
                    root.as_fd(),
                    prefix,
                    rustix::fs::Mode::from_bits_truncate(0o755),
                );
            }
        }
    }

    let ctx = Arc::new(ApplyContext {
        root,
        options,
        verity: VerityRecorder::new(apply_options.verity),
        skip_validation,
    });

    // Phase: create the tree skeleton and probe local dedup sources for
    // regular files on a worker pool. Hard links are deferred until their
    // targets exist.
    let mut hard_links: Vec<usize> = Vec::new();
    let mut root_dir_mode = None;
    let mut total_chunks_size = 0u64;
    let (result_tx, result_rx) = mpsc::channel::<(usize, Result<bool, ApplyError>)>();

    std::thread::scope(|scope| -> Result<(), ApplyError> {
        let (job_tx, job_rx) = mpsc::sync_channel::<usize>(COPY_WORKERS);
        let job_rx = Arc::new(Mutex::new(job_rx));

        for _ in 0..COPY_WORKERS {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let ctx = &ctx;
            let entries = &entries;
            let dedup_config = &dedup_config;
            scope.spawn(move || loop {
                let job = { job_rx.lock().expect("worker pool poisoned").recv() };
                let Ok(index) = job else { break };
                let outcome = dedup_worker(ctx, &entries[index], cache.as_ref(), dedup_config);
                if result_tx.send((index, outcome)).is_err() {
                    break;
                }
            });
        }
        drop(result_tx);

        for (index, entry) in entries.iter().enumerate() {
            if let Some(converter) = &ctx.options.whiteout_converter {
                let mut ops = RootWhiteoutOps {
                    root: ctx.root.as_fd(),
                };
                if !converter.convert(entry, &mut ops)? {
                    continue;
                }
            }
            match entry.entry_type {
                EntryType::Reg if entry.size == 0 => {
                    create_empty_file(ctx.root.as_fd(), entry, &ctx.options)?;
                }
                EntryType::Reg => {
                    total_chunks_size += entry.size;
                    if job_tx.send(index).is_err() {
                        break;
                    }
                }
                EntryType::Dir => {
                    if entry.name == "." {
                        root_dir_mode = Some(entry.mode);
                    }
                    safe_mkdir(ctx.root.as_fd(), entry, &ctx.options)?;
                }
                EntryType::Symlink => safe_symlink(ctx.root.as_fd(), entry)?,
                EntryType::Hardlink => hard_links.push(index),
                EntryType::Char | EntryType::Block | EntryType::Fifo => {
                    safe_mknod(ctx.root.as_fd(), entry, &ctx.options)?;
                }
                EntryType::Chunk => {
                    return Err(ApplyError::InvalidEntryType {
                        path: PathBuf::from(&entry.name),
                    })
                }
            }
        }
        Ok(())
    })?;

    // Phase: plan the work for everything the workers could not satisfy,
    // probing per-chunk dedup before conceding a remote fetch.
    let mut copy_results: Vec<_> = result_rx.into_iter().collect();
    copy_results.sort_by_key(|(index, _)| *index);

    let mut missing_parts: Vec<MissingPart> = Vec::new();
    let mut missing_parts_size = 0u64;
    for (index, outcome) in copy_results {
        if outcome? {
            continue;
        }
        let entry = &entries[index];
        missing_parts_size += entry.size;

        for chunk in &entry.chunks {
            let compressed = chunk.compressed_len();
            let mut part = MissingPart {
                hole: false,
                source: ChunkRange {
                    offset: chunk.offset,
                    length: compressed,
                },
                origin_file: None,
                chunks: vec![MissingFileChunk {
                    gap: 0,
                    hole: false,
                    file: Some(index),
                    compressed_size: compressed,
                    uncompressed_size: chunk.size,
                }],
            };
            match chunk.kind {
                strata_toc::ChunkKind::Data => {
                    if let Some((layer_root, path, offset)) =
                        cache.find_chunk_in_other_layers(chunk)?
                    {
                        if validate_chunk_checksum(chunk, &layer_root, &path, offset) {
                            missing_parts_size = missing_parts_size.saturating_sub(chunk.size);
                            part.origin_file = Some(OriginFile {
                                root: layer_root,
                                path,
                                offset,
                            });
                        }
                    }
                }
                strata_toc::ChunkKind::Zeros => {
                    missing_parts_size = missing_parts_size.saturating_sub(chunk.size);
                    part.hole = true;
                    part.chunks[0].hole = true;
                }
            }
            missing_parts.push(part);
        }
    }

    if !missing_parts.is_empty() {
        let parts = merge_missing_parts(missing_parts, MAX_MISSING_PART_REQUESTS);
        retrieve_missing_parts(&ctx, source.as_mut(), &entries, parts, PartKind::from(format))?;
    }

    // Phase: hard links, now that every target exists.
    for index in hard_links {
        safe_link(ctx.root.as_fd(), &entries[index], &ctx.options)?;
    }

    if total_chunks_size > 0 {
        tracing::debug!(
            "missing {} bytes out of {} ({:.2} %)",
            missing_parts_size,
            total_chunks_size,
            missing_parts_size as f64 * 100.0 / total_chunks_size as f64
        );
    }

    let mut big_data = HashMap::new();
    big_data.insert(MANIFEST_BIG_DATA_KEY.to_owned(), manifest);
    big_data.insert(
        LAYER_DATA_BIG_DATA_KEY.to_owned(),
        ApplyOutput::layer_data_json(apply_options.output_format)
            .map_err(ApplyError::LayerDataEncode)?,
    );

    Ok(ApplyOutput {
        uids,
        gids,
        size: total_size,
        tar_split,
        big_data,
        toc: Some(toc),
        toc_digest,
        uncompressed_digest,
        verity_digests: ctx.verity.take_digests(),
        root_dir_mode,
    })
}

/// One worker-pool job: try to materialize a regular file from a local
/// source, returning whether it was satisfied.
fn dedup_worker(
    ctx: &ApplyContext,
    entry: &FileMetadata,
    cache: &dyn LayerCache,
    config: &DedupConfig,
) -> Result<bool, ApplyError> {
    match find_and_copy_file(ctx.root.as_fd(), entry, cache, config)? {
        None => Ok(false),
        Some(DedupedFile::HardLinked) => {
            // A hard link shares the source inode; touching attributes
            // would rewrite the source too.
            Ok(true)
        }
        Some(DedupedFile::Copied(fd)) => {
            set_file_attrs(
                ctx.root.as_fd(),
                fd.as_fd(),
                entry.mode,
                entry,
                &ctx.options,
                false,
            )?;
            if ctx.verity.enabled() {
                let ro = reopen_read_only(&fd)?;
                ctx.verity.record(&entry.name, ro.as_fd())?;
            }
            Ok(true)
        }
    }
}

/// Rewrites the merged entries for the flat layout: one regular file per
/// unique content digest, named `xx/yyyy…`, everything else dropped.
fn make_entries_flat(entries: Vec<FileMetadata>) -> Result<Vec<FileMetadata>, ApplyError> {
    let mut seen = HashSet::new();
    let mut flat = Vec::new();
    for mut entry in entries {
        if entry.entry_type != EntryType::Reg {
            continue;
        }
        let digest = entry.digest.ok_or_else(|| ApplyError::MissingDigest {
            path: PathBuf::from(&entry.name),
        })?;
        let encoded = digest.encoded();
        if !seen.insert(encoded.clone()) {
            continue;
        }
        entry.name = format!("{}/{}", &encoded[..2], &encoded[2..]);
        flat.push(entry);
    }
    Ok(flat)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_detect_layer_format() {
        let mut annotations = HashMap::new();
        assert!(detect_layer_format(&annotations).unwrap().is_none());

        annotations.insert(ZSTD_CHUNKED_TOC_DIGEST_ANNOTATION.to_owned(), "sha256:x".into());
        assert_eq!(
            detect_layer_format(&annotations).unwrap(),
            Some(LayerFormat::ZstdChunked)
        );

        annotations.insert(ESTARGZ_TOC_DIGEST_ANNOTATION.to_owned(), "sha256:y".into());
        assert!(matches!(
            detect_layer_format(&annotations),
            Err(ApplyError::AmbiguousTocFormat)
        ));
    }

    #[test]
    fn test_make_entries_flat_dedups_by_digest() {
        let digest = strata_digest::compute_bytes_digest(b"same");
        let entries = vec![
            FileMetadata::directory("etc"),
            FileMetadata::regular("a", 4, Some(digest)),
            FileMetadata::regular("b", 4, Some(digest)),
        ];
        let flat = make_entries_flat(entries).unwrap();
        assert_eq!(flat.len(), 1);
        let encoded = digest.encoded();
        assert_eq!(flat[0].name, format!("{}/{}", &encoded[..2], &encoded[2..]));
    }

    #[test]
    fn test_make_entries_flat_requires_digest() {
        let entries = vec![FileMetadata::regular("a", 4, None)];
        assert!(matches!(
            make_entries_flat(entries),
            Err(ApplyError::MissingDigest { .. })
        ));
    }
}
