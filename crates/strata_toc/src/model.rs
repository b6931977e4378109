//! Decoded manifest types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_digest::ContentDigest;

/// The manifest version understood by this crate.
pub const TOC_VERSION: u32 = 1;

/// The codec family a layer blob was produced with.
///
/// The two formats share the same decoded entry model but differ in how chunk
/// payloads are compressed and in a few bookkeeping entries the merger has to
/// paper over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerFormat {
    /// zstd:chunked: zstd-framed chunks, end offsets recorded in the manifest.
    ZstdChunked,
    /// eStargz: gzip chunks, end offsets reconstructed from the entry order.
    Estargz,
}

/// eStargz bookkeeping entries that never materialize on disk.
pub(crate) const ESTARGZ_LANDMARKS: &[&str] = &[
    ".prefetch.landmark",
    ".no.prefetch.landmark",
    "stargz.index.json",
];

/// The type of a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Regular file.
    Reg,
    /// Directory.
    Dir,
    /// Symbolic link.
    Symlink,
    /// Hard link to another entry in the same layer.
    Hardlink,
    /// Character device.
    Char,
    /// Block device.
    Block,
    /// Named pipe.
    Fifo,
    /// Continuation of the preceding regular file's data.
    Chunk,
}

/// The payload kind of a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkKind {
    /// The chunk holds literal file data.
    #[default]
    #[serde(rename = "")]
    Data,
    /// The chunk is a run of zeros and has no stored payload.
    #[serde(rename = "zeros")]
    Zeros,
}

/// A contiguous compressed byte range holding part of a file's data.
///
/// Produced by the merger; `offset..end_offset` addresses the compressed blob
/// while `size` is the length of the data after decompression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    /// Start of the compressed payload in the blob.
    pub offset: u64,
    /// End of the compressed payload in the blob (start of the next one).
    pub end_offset: u64,
    /// Uncompressed length of the chunk.
    pub size: u64,
    /// Digest of the uncompressed chunk data, when recorded.
    pub digest: Option<ContentDigest>,
    /// Whether the chunk carries data or a run of zeros.
    pub kind: ChunkKind,
}

impl ChunkRef {
    /// Length of the compressed payload in the blob.
    pub fn compressed_len(&self) -> u64 {
        self.end_offset.saturating_sub(self.offset)
    }
}

/// A single decoded manifest entry.
///
/// Field names mirror the manifest JSON so the decoded form can be
/// round-tripped. The `chunks` list is empty until the entry has passed
/// through [`merge_entries`](crate::merge_entries).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Entry type.
    #[serde(rename = "type")]
    pub entry_type: EntryType,

    /// Path of the entry, relative to the layer root.
    pub name: String,

    /// Target of a symlink or hard link.
    #[serde(rename = "linkName", default, skip_serializing_if = "String::is_empty")]
    pub link_name: String,

    /// Permission bits (plus setuid/setgid/sticky).
    #[serde(default)]
    pub mode: u32,

    /// Uncompressed file size in bytes.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,

    /// Owning user id.
    #[serde(default)]
    pub uid: u32,

    /// Owning group id.
    #[serde(default)]
    pub gid: u32,

    /// Modification time.
    #[serde(rename = "modtime", default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,

    /// Access time.
    #[serde(
        rename = "accesstime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub access_time: Option<DateTime<Utc>>,

    /// Device major number, for `char` and `block` entries.
    #[serde(rename = "devMajor", default, skip_serializing_if = "is_zero_u32")]
    pub dev_major: u32,

    /// Device minor number, for `char` and `block` entries.
    #[serde(rename = "devMinor", default, skip_serializing_if = "is_zero_u32")]
    pub dev_minor: u32,

    /// Extended attributes; values are base64-encoded in the manifest.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub xattrs: HashMap<String, String>,

    /// Digest of the whole (uncompressed) file content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<ContentDigest>,

    /// Start of this entry's compressed payload in the blob.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,

    /// End of this entry's compressed payload in the blob. Zero when the
    /// codec does not record it; reconstructed by the merger.
    #[serde(rename = "endOffset", default, skip_serializing_if = "is_zero")]
    pub end_offset: u64,

    /// Uncompressed size of this chunk, when the file is split. Zero means
    /// the chunk spans the remainder of the file.
    #[serde(rename = "chunkSize", default, skip_serializing_if = "is_zero")]
    pub chunk_size: u64,

    /// Logical offset of this chunk within the file.
    #[serde(rename = "chunkOffset", default, skip_serializing_if = "is_zero")]
    pub chunk_offset: u64,

    /// Digest of this chunk's uncompressed data.
    #[serde(rename = "chunkDigest", default, skip_serializing_if = "Option::is_none")]
    pub chunk_digest: Option<ContentDigest>,

    /// Payload kind of this chunk.
    #[serde(rename = "chunkType", default, skip_serializing_if = "is_data")]
    pub chunk_type: ChunkKind,

    /// Per-file chunk list, filled in by the merger.
    #[serde(skip)]
    pub chunks: Vec<ChunkRef>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_data(v: &ChunkKind) -> bool {
    *v == ChunkKind::Data
}

impl FileMetadata {
    fn new(entry_type: EntryType, name: impl Into<String>) -> Self {
        Self {
            entry_type,
            name: name.into(),
            link_name: String::new(),
            mode: 0,
            size: 0,
            uid: 0,
            gid: 0,
            mod_time: None,
            access_time: None,
            dev_major: 0,
            dev_minor: 0,
            xattrs: HashMap::new(),
            digest: None,
            offset: 0,
            end_offset: 0,
            chunk_size: 0,
            chunk_offset: 0,
            chunk_digest: None,
            chunk_type: ChunkKind::Data,
            chunks: Vec::new(),
        }
    }

    /// Creates a regular-file entry.
    pub fn regular(name: impl Into<String>, size: u64, digest: Option<ContentDigest>) -> Self {
        Self {
            size,
            digest,
            mode: 0o644,
            ..Self::new(EntryType::Reg, name)
        }
    }

    /// Creates a directory entry.
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            mode: 0o755,
            ..Self::new(EntryType::Dir, name)
        }
    }

    /// Creates a symlink entry pointing at `target`.
    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            link_name: target.into(),
            mode: 0o777,
            ..Self::new(EntryType::Symlink, name)
        }
    }

    /// Creates a hard-link entry pointing at `target`.
    pub fn hard_link(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            link_name: target.into(),
            ..Self::new(EntryType::Hardlink, name)
        }
    }

    /// Creates a `chunk` continuation entry.
    pub fn chunk(
        name: impl Into<String>,
        offset: u64,
        chunk_offset: u64,
        chunk_size: u64,
        chunk_digest: Option<ContentDigest>,
    ) -> Self {
        Self {
            offset,
            chunk_offset,
            chunk_size,
            chunk_digest,
            ..Self::new(EntryType::Chunk, name)
        }
    }

    /// True when this entry names the layer root itself.
    pub fn is_root(&self) -> bool {
        self.name.is_empty() || self.name == "." || self.name == "/"
    }
}

/// A decoded table of contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toc {
    /// Manifest format version.
    pub version: u32,

    /// The flat entry list, in tar stream order.
    pub entries: Vec<FileMetadata>,
}

impl Toc {
    /// Wraps a list of entries in a current-version table of contents.
    pub fn new(entries: Vec<FileMetadata>) -> Self {
        Self {
            version: TOC_VERSION,
            entries,
        }
    }

    /// Decodes a table of contents from its JSON form (the manifest after the
    /// caller has stripped the codec-specific framing and compression).
    pub fn from_json(bytes: &[u8]) -> Result<Self, crate::TocError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
