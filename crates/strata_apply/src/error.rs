use std::path::PathBuf;

use strata_digest::{ContentDigest, DigestError};
use strata_toc::TocError;

use crate::source::BlobSourceError;

/// An error that can occur while applying a layer.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// Partial image support is switched off in the store configuration.
    #[error("enable_partial_images not configured")]
    PartialImagesDisabled,

    /// The convert-on-pull fallback is switched off in the store configuration.
    #[error("convert_images not configured")]
    ConversionDisabled,

    /// The blob annotations advertise more than one table-of-contents format.
    #[error("both zstd:chunked and eStargz TOC found")]
    AmbiguousTocFormat,

    /// A path resolved to an inode outside the destination root.
    #[error("path {path:?} resolves outside the root directory")]
    PathEscapesRoot {
        /// The offending entry path.
        path: PathBuf,
    },

    /// Opening a path under the destination root failed.
    #[error("open {path:?} under the rootfs")]
    OpenUnderRoot {
        /// The path being opened.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The content written for a file does not hash to its manifest digest.
    #[error("checksum mismatch for {path:?} (got {actual} instead of {expected})")]
    DigestMismatch {
        /// Destination path of the file.
        path: PathBuf,
        /// Digest recorded in the manifest.
        expected: ContentDigest,
        /// Digest of the bytes actually written.
        actual: ContentDigest,
    },

    /// The fully fetched blob does not hash to its declared digest.
    #[error("invalid digest to convert: expected {expected}, got {actual}")]
    BlobDigestMismatch {
        /// Digest declared by the image manifest.
        expected: ContentDigest,
        /// Digest of the fetched bytes.
        actual: ContentDigest,
    },

    /// A manifest entry has a type this applier cannot materialize.
    #[error("invalid entry type for {path:?}")]
    InvalidEntryType {
        /// The offending entry path.
        path: PathBuf,
    },

    /// A regular entry is missing the digest needed to address its content.
    #[error("missing digest for {path:?}")]
    MissingDigest {
        /// The offending entry path.
        path: PathBuf,
    },

    /// An entry's uid/gid has no counterpart in the configured ID mappings.
    #[error("no mapping found for uid/gid {uid}:{gid}")]
    IdNotMapped {
        /// Unmapped user id.
        uid: u32,
        /// Unmapped group id.
        gid: u32,
    },

    /// Changing the owner of a freshly written file failed.
    #[error("chown {path:?} to {uid}:{gid}")]
    Chown {
        /// Destination path of the file.
        path: PathBuf,
        /// Requested user id.
        uid: u32,
        /// Requested group id.
        gid: u32,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Changing the owner failed because the id is not available in the
    /// current user namespace.
    #[error("potentially insufficient UIDs or GIDs available in the user namespace (requested {uid}:{gid} for {path:?}): check /etc/subuid and /etc/subgid")]
    ChownUnmappedId {
        /// Destination path of the file.
        path: PathBuf,
        /// Requested user id.
        uid: u32,
        /// Requested group id.
        gid: u32,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Applying an extended attribute failed with a non-ignorable error.
    #[error("set xattr {name} for {path:?}")]
    SetXattr {
        /// Destination path of the file.
        path: PathBuf,
        /// Attribute name.
        name: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An xattr value in the manifest is not valid base64.
    #[error("decode xattr value of {name} for {path:?}")]
    InvalidXattrValue {
        /// Destination path of the file.
        path: PathBuf,
        /// Attribute name.
        name: String,
    },

    /// The blob source reported fewer streams than ranges requested.
    #[error("not enough data returned from the server")]
    MissingStream,

    /// A stream ended before delivering the bytes its chunk declared.
    #[error("stream for {path:?} ended after {actual} of {expected} bytes")]
    ShortStream {
        /// Destination path being written.
        path: PathBuf,
        /// Bytes the chunk declared.
        expected: u64,
        /// Bytes actually delivered.
        actual: u64,
    },

    /// fs-verity is required by policy but could not be enabled.
    #[error("fs-verity required but not supported for {path:?}")]
    VerityUnsupported {
        /// Destination path of the file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The layer-data artifact could not be encoded.
    #[error("failed to encode layer data")]
    LayerDataEncode(#[source] serde_json::Error),

    /// The blob source failed.
    #[error(transparent)]
    BlobSource(#[from] BlobSourceError),

    /// The table of contents is malformed.
    #[error(transparent)]
    Toc(#[from] TocError),

    /// A digest string in the manifest is malformed.
    #[error(transparent)]
    Digest(#[from] DigestError),

    /// An uncategorized I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ApplyError {
    pub(crate) fn open_under_root(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ApplyError::OpenUnderRoot {
            path: path.into(),
            source,
        }
    }
}
