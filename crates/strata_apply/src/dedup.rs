//! Finding reusable copies of a file in prior layers or object
//! repositories, and copying them into place as cheaply as possible.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use base64::Engine as _;
use rustix::fs::{Mode, OFlags};
use rustix::io::Errno;
use strata_toc::FileMetadata;

use crate::attrs::XATTRS_TO_IGNORE;
use crate::cache::LayerCache;
use crate::dirfd::{hard_link_by_fd, new_file_flags, open_parent_dir, open_root, open_under_root};
use crate::error::ApplyError;

/// How a dedup hit was materialized.
pub(crate) enum DedupedFile {
    /// Hard-linked to the source; attributes stay those of the source inode.
    HardLinked,
    /// Copied; the open descriptor still needs attributes applied.
    Copied(OwnedFd),
}

/// Copy/link configuration for the dedup workers.
pub(crate) struct DedupConfig {
    pub use_hard_links: bool,
    pub object_repos: Vec<PathBuf>,
}

/// Tries to satisfy `file` from a prior layer or an object repository.
/// Returns `None` when the file has to be fetched remotely.
pub(crate) fn find_and_copy_file(
    root: BorrowedFd<'_>,
    file: &FileMetadata,
    cache: &dyn LayerCache,
    config: &DedupConfig,
) -> Result<Option<DedupedFile>, ApplyError> {
    if let Some(found) = find_file_in_other_layers(root, file, cache, config.use_hard_links)? {
        return Ok(Some(found));
    }
    if let Some(found) =
        find_file_in_object_repos(root, file, &config.object_repos, config.use_hard_links)
    {
        return Ok(Some(found));
    }
    Ok(None)
}

/// First tier: a prior layer checkout indexed by the layer cache.
fn find_file_in_other_layers(
    root: BorrowedFd<'_>,
    file: &FileMetadata,
    cache: &dyn LayerCache,
    use_hard_links: bool,
) -> Result<Option<DedupedFile>, ApplyError> {
    let Some((layer_root, name)) = cache.find_file_in_other_layers(file, use_hard_links)? else {
        return Ok(None);
    };
    let src_root = open_root(&layer_root)?;
    let src = open_under_root(
        src_root.as_fd(),
        Path::new(&name),
        OFlags::RDONLY,
        Mode::empty(),
    )?;
    copy_file_content(root, src.as_fd(), file, use_hard_links).map(Some)
}

/// Second tier: content-addressed object repositories, where a file with
/// digest `xxyyyy…` sits at `objects/xx/yyyy….payload-link`.
///
/// Repository probing is best-effort: any failure just means "not found
/// here". When hard-linking was requested but no candidate is compatible,
/// the probe is retried in copy mode.
fn find_file_in_object_repos(
    root: BorrowedFd<'_>,
    file: &FileMetadata,
    repos: &[PathBuf],
    use_hard_links: bool,
) -> Option<DedupedFile> {
    let encoded = file.digest?.encoded();

    for repo in repos {
        let candidate = repo
            .join("objects")
            .join(&encoded[..2])
            .join(format!("{}.payload-link", &encoded[2..]));
        let Ok(stat) = std::fs::metadata(&candidate) else {
            continue;
        };
        if !stat.is_file() || stat.len() != file.size {
            continue;
        }
        let Ok(src) = rustix::fs::open(
            &candidate,
            OFlags::RDONLY | OFlags::NONBLOCK | OFlags::CLOEXEC,
            Mode::empty(),
        ) else {
            tracing::debug!(path = %candidate.display(), "could not open object repository candidate");
            return None;
        };
        if use_hard_links && !can_dedup_fd_with_hard_link(file, src.as_fd()) {
            continue;
        }
        match copy_file_content(root, src.as_fd(), file, use_hard_links) {
            Ok(found) => return Some(found),
            Err(err) => {
                tracing::debug!(path = %candidate.display(), "could not copy from object repository: {err}");
                return None;
            }
        }
    }

    // Hard-link reuse found no compatible candidate; fall back to copying.
    if use_hard_links {
        return find_file_in_object_repos(root, file, repos, false);
    }
    None
}

/// Materializes `file` from the open source descriptor, preferring a hard
/// link when allowed and falling back to the cheapest available copy.
fn copy_file_content(
    root: BorrowedFd<'_>,
    src: BorrowedFd<'_>,
    file: &FileMetadata,
    use_hard_links: bool,
) -> Result<DedupedFile, ApplyError> {
    let name = Path::new(&file.name);

    if use_hard_links {
        if let Ok((parent, base)) = open_parent_dir(root, name) {
            let dirfd = parent.as_ref().map_or(root, |fd| fd.as_fd());
            if hard_link_by_fd(src, dirfd, base).is_ok() {
                return Ok(DedupedFile::HardLinked);
            }
        }
    }

    let dst = open_under_root(root, name, new_file_flags(), Mode::empty())?;
    let size = rustix::fs::fstat(src).map_err(io::Error::from)?.st_size as u64;
    copy_content(src, dst.as_fd(), size)?;
    Ok(DedupedFile::Copied(dst))
}

/// Copies `size` bytes between two descriptors: reflink when the filesystem
/// can share extents, `copy_file_range` otherwise, plain reads as the last
/// resort.
fn copy_content(src: BorrowedFd<'_>, dst: BorrowedFd<'_>, size: u64) -> io::Result<()> {
    if rustix::fs::ioctl_ficlone(dst, src).is_ok() {
        return Ok(());
    }

    let mut off_in = 0u64;
    let mut off_out = 0u64;
    while off_in < size {
        let remaining = (size - off_in) as usize;
        match rustix::fs::copy_file_range(
            src,
            Some(&mut off_in),
            dst,
            Some(&mut off_out),
            remaining,
        ) {
            Ok(0) => break,
            Ok(_) => {}
            Err(Errno::NOSYS | Errno::XDEV | Errno::INVAL | Errno::OPNOTSUPP) if off_in == 0 => {
                return copy_by_read(src, dst, size);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn copy_by_read(src: BorrowedFd<'_>, dst: BorrowedFd<'_>, size: u64) -> io::Result<()> {
    let mut buf = vec![0u8; 128 * 1024];
    let mut offset = 0u64;
    while offset < size {
        let n = rustix::io::pread(src, &mut buf, offset)?;
        if n == 0 {
            break;
        }
        let mut written = 0;
        while written < n {
            written += rustix::io::pwrite(dst, &buf[written..n], offset + written as u64)?;
        }
        offset += n as u64;
    }
    Ok(())
}

/// Whether the open candidate can stand in for `file` via a hard link:
/// owner, mode, and extended attributes must all match, because a link
/// shares the inode and cannot diverge afterwards.
fn can_dedup_fd_with_hard_link(file: &FileMetadata, fd: BorrowedFd<'_>) -> bool {
    let Ok(stat) = rustix::fs::fstat(fd) else {
        return false;
    };
    if file.uid != stat.st_uid || file.gid != stat.st_gid {
        return false;
    }
    if file.mode & 0o7777 != stat.st_mode & 0o7777 {
        return false;
    }

    let Some(candidate_xattrs) = read_xattrs(fd) else {
        return false;
    };
    let mut wanted = HashMap::new();
    for (key, value) in &file.xattrs {
        if XATTRS_TO_IGNORE.contains(&key.as_str()) {
            continue;
        }
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(value) else {
            return false;
        };
        wanted.insert(key.clone(), decoded);
    }
    wanted == candidate_xattrs
}

/// Reads all extended attributes of an open file, minus the ignore list.
fn read_xattrs(fd: BorrowedFd<'_>) -> Option<HashMap<String, Vec<u8>>> {
    use std::os::fd::AsRawFd as _;

    let raw = fd.as_raw_fd();
    let len = unsafe { libc::flistxattr(raw, std::ptr::null_mut(), 0) };
    if len < 0 {
        return None;
    }
    let mut names = vec![0u8; len as usize];
    let len = unsafe { libc::flistxattr(raw, names.as_mut_ptr().cast(), names.len()) };
    if len < 0 {
        return None;
    }
    names.truncate(len as usize);

    let mut xattrs = HashMap::new();
    for name in names.split(|&b| b == 0).filter(|n| !n.is_empty()) {
        let name = std::str::from_utf8(name).ok()?;
        if XATTRS_TO_IGNORE.contains(&name) {
            continue;
        }
        let c_name = std::ffi::CString::new(name).ok()?;
        let len = unsafe { libc::fgetxattr(raw, c_name.as_ptr(), std::ptr::null_mut(), 0) };
        if len < 0 {
            return None;
        }
        let mut value = vec![0u8; len as usize];
        let len = unsafe {
            libc::fgetxattr(raw, c_name.as_ptr(), value.as_mut_ptr().cast(), value.len())
        };
        if len < 0 {
            return None;
        }
        value.truncate(len as usize);
        xattrs.insert(name.to_owned(), value);
    }
    Some(xattrs)
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::MetadataExt;

    use strata_digest::compute_bytes_digest;

    use super::*;
    use crate::cache::NoLayerCache;

    fn object_repo_with(content: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let repo = tempfile::tempdir().unwrap();
        let encoded = compute_bytes_digest(content).encoded();
        let dir = repo.path().join("objects").join(&encoded[..2]);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(format!("{}.payload-link", &encoded[2..])),
            content,
        )
        .unwrap();
        let path = repo.path().to_owned();
        (repo, path)
    }

    #[test]
    fn test_object_repo_copy_hit() {
        let content = b"shared object payload";
        let (_repo, repo_path) = object_repo_with(content);
        let dest = tempfile::tempdir().unwrap();
        let root = open_root(dest.path()).unwrap();

        let file = FileMetadata::regular(
            "usr/lib/shared",
            content.len() as u64,
            Some(compute_bytes_digest(content)),
        );
        let config = DedupConfig {
            use_hard_links: false,
            object_repos: vec![repo_path],
        };
        let found = find_and_copy_file(root.as_fd(), &file, &NoLayerCache, &config).unwrap();
        assert!(matches!(found, Some(DedupedFile::Copied(_))));
        assert_eq!(
            std::fs::read(dest.path().join("usr/lib/shared")).unwrap(),
            content
        );
    }

    #[test]
    fn test_object_repo_size_mismatch_misses() {
        let content = b"shared object payload";
        let (_repo, repo_path) = object_repo_with(content);
        let dest = tempfile::tempdir().unwrap();
        let root = open_root(dest.path()).unwrap();

        // Same digest recorded, but the manifest declares a different size.
        let file = FileMetadata::regular("f", 1, Some(compute_bytes_digest(content)));
        let config = DedupConfig {
            use_hard_links: false,
            object_repos: vec![repo_path],
        };
        let found = find_and_copy_file(root.as_fd(), &file, &NoLayerCache, &config).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_hard_link_falls_back_to_copy_on_metadata_mismatch() {
        let content = b"payload";
        let (_repo, repo_path) = object_repo_with(content);
        let dest = tempfile::tempdir().unwrap();
        let root = open_root(dest.path()).unwrap();

        let mut file = FileMetadata::regular(
            "f",
            content.len() as u64,
            Some(compute_bytes_digest(content)),
        );
        // Owner that cannot match the repository candidate in a test run.
        file.uid = 0;
        file.gid = 0;
        file.mode = 0o400;

        let config = DedupConfig {
            use_hard_links: true,
            object_repos: vec![repo_path],
        };
        let found = find_and_copy_file(root.as_fd(), &file, &NoLayerCache, &config)
            .unwrap()
            .unwrap();
        assert!(matches!(found, DedupedFile::Copied(_)));
        assert_eq!(std::fs::metadata(dest.path().join("f")).unwrap().nlink(), 1);
    }

    struct SingleLayerCache {
        layer_root: PathBuf,
        name: String,
    }

    impl LayerCache for SingleLayerCache {
        fn find_file_in_other_layers(
            &self,
            _file: &FileMetadata,
            _use_hard_links: bool,
        ) -> io::Result<Option<(PathBuf, String)>> {
            Ok(Some((self.layer_root.clone(), self.name.clone())))
        }

        fn find_chunk_in_other_layers(
            &self,
            _chunk: &strata_toc::ChunkRef,
        ) -> io::Result<Option<(PathBuf, String, u64)>> {
            Ok(None)
        }
    }

    #[test]
    fn test_layer_cache_hard_link_hit() {
        let layer = tempfile::tempdir().unwrap();
        std::fs::write(layer.path().join("orig"), b"content").unwrap();
        let dest = tempfile::tempdir().unwrap();
        let root = open_root(dest.path()).unwrap();

        let cache = SingleLayerCache {
            layer_root: layer.path().to_owned(),
            name: "orig".to_owned(),
        };
        let file = FileMetadata::regular("copy", 7, Some(compute_bytes_digest(b"content")));
        let config = DedupConfig {
            use_hard_links: true,
            object_repos: Vec::new(),
        };
        let found = find_and_copy_file(root.as_fd(), &file, &cache, &config)
            .unwrap()
            .unwrap();
        assert!(matches!(found, DedupedFile::HardLinked));
        assert_eq!(
            std::fs::metadata(dest.path().join("copy")).unwrap().nlink(),
            2
        );
    }
}
