//! The read-only index of prior layers the dedup probe consults.

use std::io::{self, Read};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use rustix::fs::{Mode, OFlags, SeekFrom};
use sha2::Digest as _;
use strata_digest::ContentDigest;
use strata_toc::{ChunkRef, FileMetadata};

use crate::dirfd::{open_root, open_under_root};

/// An index over the files and chunks of already-pulled layers.
///
/// Maintained by the storage driver; the applier only queries it. All hits
/// are treated as hints and re-verified before use.
pub trait LayerCache: Send + Sync {
    /// Looks up a prior layer containing a file with the same content (and,
    /// when `use_hard_links` is set, compatible metadata). Returns the
    /// layer's checkout root and the file's path inside it.
    fn find_file_in_other_layers(
        &self,
        file: &FileMetadata,
        use_hard_links: bool,
    ) -> io::Result<Option<(PathBuf, String)>>;

    /// Looks up a prior layer containing a byte range with the chunk's
    /// content. Returns the layer root, the file path inside it, and the
    /// offset of the range in that file.
    fn find_chunk_in_other_layers(
        &self,
        chunk: &ChunkRef,
    ) -> io::Result<Option<(PathBuf, String, u64)>>;

    /// Releases any reservation the index holds on behalf of this apply.
    fn release(&self) {}
}

/// A cache that never finds anything; every byte is fetched or copied from
/// object repositories.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLayerCache;

impl LayerCache for NoLayerCache {
    fn find_file_in_other_layers(
        &self,
        _file: &FileMetadata,
        _use_hard_links: bool,
    ) -> io::Result<Option<(PathBuf, String)>> {
        Ok(None)
    }

    fn find_chunk_in_other_layers(
        &self,
        _chunk: &ChunkRef,
    ) -> io::Result<Option<(PathBuf, String, u64)>> {
        Ok(None)
    }
}

/// Re-reads a candidate byte range and checks that it still hashes to the
/// chunk's digest. Cache hits are hints, not facts: the layer could have
/// been mutated since it was indexed. Any failure means "do not use".
pub(crate) fn validate_chunk_checksum(
    chunk: &ChunkRef,
    root: &Path,
    path: &str,
    offset: u64,
) -> bool {
    let Some(expected) = chunk.digest else {
        return false;
    };
    let Ok(root_fd) = open_root(root) else {
        return false;
    };
    let Ok(fd) = open_under_root(root_fd.as_fd(), Path::new(path), OFlags::RDONLY, Mode::empty())
    else {
        return false;
    };
    if rustix::fs::seek(&fd, SeekFrom::Start(offset)).is_err() {
        return false;
    }

    let mut hasher = sha2::Sha256::new();
    let mut reader = std::fs::File::from(fd).take(chunk.size);
    match io::copy(&mut reader, &mut HashWriter(&mut hasher)) {
        Ok(copied) if copied == chunk.size => {}
        _ => return false,
    }
    ContentDigest::from_hash(hasher.finalize()) == expected
}

/// Adapts a hasher into an `io::Write` sink.
struct HashWriter<'a>(&'a mut sha2::Sha256);

impl io::Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use strata_toc::ChunkKind;

    use super::*;

    fn chunk_for(data: &[u8]) -> ChunkRef {
        ChunkRef {
            offset: 0,
            end_offset: 0,
            size: data.len() as u64,
            digest: Some(strata_digest::compute_bytes_digest(data)),
            kind: ChunkKind::Data,
        }
    }

    #[test]
    fn test_validate_chunk_checksum_accepts_matching_range() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("blob"), b"prefix-PAYLOAD-suffix").unwrap();
        let chunk = chunk_for(b"PAYLOAD");
        assert!(validate_chunk_checksum(&chunk, root.path(), "blob", 7));
    }

    #[test]
    fn test_validate_chunk_checksum_rejects_mismatch() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("blob"), b"prefix-PAYLOAD-suffix").unwrap();
        let chunk = chunk_for(b"PAYLOAD");
        assert!(!validate_chunk_checksum(&chunk, root.path(), "blob", 0));
        assert!(!validate_chunk_checksum(&chunk, root.path(), "missing", 7));
    }

    #[test]
    fn test_validate_chunk_checksum_rejects_short_file() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("blob"), b"PAY").unwrap();
        let chunk = chunk_for(b"PAYLOAD");
        assert!(!validate_chunk_checksum(&chunk, root.path(), "blob", 0));
    }
}
