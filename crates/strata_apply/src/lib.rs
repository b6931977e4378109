#![deny(missing_docs)]

//! Materializes seekable chunked container layers under a destination root,
//! fetching only the byte ranges that cannot be deduplicated from prior
//! layers or local object repositories.
//!
//! The entry point is [`Differ`]: build one from a decoded table of contents
//! (or from a raw blob plus a [`ChunkedCompressor`] for the conversion
//! fallback) and call [`Differ::apply_diff`] with a destination directory.
//! The applier then:
//!
//! 1. merges the manifest entries into per-file chunk lists,
//! 2. creates directories, symlinks, and special files,
//! 3. probes the [`LayerCache`] and any configured object repositories for
//!    files it can hard-link or copy instead of fetching,
//! 4. coalesces the remaining chunks into as few range requests as possible
//!    and streams them from the [`BlobSource`] into validated files,
//! 5. creates hard links last, once their targets exist.
//!
//! Every path is resolved under the destination root with
//! `openat2(RESOLVE_IN_ROOT)` (or an equivalent userspace fallback), so
//! hostile manifests cannot escape it. File content is digest-validated on
//! close and can optionally be enrolled for fs-verity attestation.
//!
//! This crate is Linux-only.

mod apply;
mod attrs;
mod cache;
mod convert;
mod decoder;
mod dedup;
mod dest;
mod dirfd;
mod error;
mod fetch;
mod options;
mod output;
mod planner;
mod source;
mod tree;
mod verity;

pub use apply::{
    detect_layer_format, ApplyOptions, Differ, ESTARGZ_TOC_DIGEST_ANNOTATION,
    ZSTD_CHUNKED_TOC_DIGEST_ANNOTATION,
};
pub use attrs::CONTAINERS_OVERRIDE_XATTR;
pub use cache::{LayerCache, NoLayerCache};
pub use convert::{ChunkedCompressor, ConvertedToc};
pub use error::ApplyError;
pub use options::{
    ChownOverride, IdMap, StoreOptions, TarOptions, WhiteoutConverter, WhiteoutOps,
    OPTION_CONVERT_IMAGES, OPTION_ENABLE_PARTIAL_IMAGES, OPTION_OSTREE_REPOS,
    OPTION_USE_HARD_LINKS,
};
pub use output::{ApplyOutput, OutputFormat, LAYER_DATA_BIG_DATA_KEY, MANIFEST_BIG_DATA_KEY};
pub use source::{BlobSource, BlobSourceError, BlobStream, BlobStreams, ChunkRange, FileBlobSource};
pub use verity::VerityPolicy;
