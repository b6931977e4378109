//! Opening paths under the destination root without escaping it.
//!
//! Every path from a manifest is untrusted: a hostile layer can stage
//! symlinks that point outside the checkout. All opens therefore go through
//! `openat2(2)` with `RESOLVE_IN_ROOT`, which makes the kernel treat the
//! destination root the way `chroot` would. On kernels without `openat2` the
//! resolution is replayed in userspace and the opened descriptor is verified
//! to still live under the root.

use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use rustix::fs::{AtFlags, Mode, OFlags, ResolveFlags};
use rustix::io::Errno;

use crate::error::ApplyError;

/// Set once `openat2` has returned `ENOSYS`; all later opens go straight to
/// the userspace fallback.
static SKIP_OPENAT2: AtomicBool = AtomicBool::new(false);

/// Bound on symlink traversals during userspace resolution.
const MAX_SYMLINK_FOLLOWS: u32 = 255;

/// Flags used to create a destination file that must not exist yet.
pub(crate) fn new_file_flags() -> OFlags {
    OFlags::CREATE | OFlags::TRUNC | OFlags::EXCL | OFlags::WRONLY
}

/// The `/proc/self/fd` alias of an open descriptor.
pub(crate) fn proc_self_fd(fd: impl AsFd) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", fd.as_fd().as_raw_fd()))
}

/// Splits a relative path into its parent (if any) and final component.
fn parent_and_base(name: &Path) -> (Option<&Path>, &OsStr) {
    let base = name.file_name().unwrap_or(name.as_os_str());
    let parent = name
        .parent()
        .filter(|p| !p.as_os_str().is_empty() && p.as_os_str() != ".");
    (parent, base)
}

/// Validates an entry path: it must be relative and free of `..` segments.
pub(crate) fn sanitized_rel_path(name: &str) -> Result<PathBuf, ApplyError> {
    let mut cleaned = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(c) => cleaned.push(c),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ApplyError::PathEscapesRoot {
                    path: PathBuf::from(name),
                })
            }
        }
    }
    Ok(cleaned)
}

fn openat2_in_root(
    dirfd: BorrowedFd<'_>,
    name: &Path,
    flags: OFlags,
    mode: Mode,
) -> rustix::io::Result<OwnedFd> {
    rustix::fs::openat2(
        dirfd,
        name,
        flags | OFlags::CLOEXEC,
        mode,
        ResolveFlags::IN_ROOT,
    )
}

/// Joins `unsafe_path` onto `root`, resolving symlinks in userspace and
/// clamping any traversal at `root`, mirroring what `RESOLVE_IN_ROOT` does in
/// the kernel. Components that do not exist yet are kept literally.
fn secure_join(root: &Path, unsafe_path: &Path) -> io::Result<PathBuf> {
    let mut pending: std::collections::VecDeque<std::ffi::OsString> = unsafe_path
        .components()
        .map(|c| c.as_os_str().to_owned())
        .collect();
    let mut resolved = PathBuf::new();
    let mut follows = 0u32;

    while let Some(component) = pending.pop_front() {
        if component == "." || component == "/" {
            continue;
        }
        if component == ".." {
            resolved.pop();
            continue;
        }

        let candidate = root.join(&resolved).join(&component);
        match std::fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                follows += 1;
                if follows > MAX_SYMLINK_FOLLOWS {
                    return Err(io::Error::from(Errno::LOOP));
                }
                let target = std::fs::read_link(&candidate)?;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                for piece in target.components().rev() {
                    match piece {
                        Component::RootDir | Component::Prefix(_) => {}
                        other => pending.push_front(other.as_os_str().to_owned()),
                    }
                }
            }
            // A missing component is fine: the caller may be about to create it.
            _ => resolved.push(&component),
        }
    }

    Ok(root.join(resolved))
}

/// Userspace fallback for kernels without `openat2`: resolve against the
/// root, open, then verify through `/proc/self/fd` that the descriptor did
/// not land outside the root.
fn open_fallback(
    dirfd: BorrowedFd<'_>,
    name: &Path,
    flags: OFlags,
    mode: Mode,
) -> Result<OwnedFd, ApplyError> {
    let root = std::fs::read_link(proc_self_fd(dirfd))?;

    let fd = if flags.contains(OFlags::NOFOLLOW) {
        // Resolve only up to the parent and keep the final component literal.
        let (parent, base) = parent_and_base(name);
        let parent_path = match parent {
            Some(parent) => secure_join(&root, parent)?,
            None => root.clone(),
        };
        let parent_fd = rustix::fs::open(&parent_path, OFlags::PATH | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| ApplyError::open_under_root(name, e.into()))?;
        rustix::fs::openat(&parent_fd, base, flags | OFlags::CLOEXEC, mode)
            .map_err(|e| ApplyError::open_under_root(name, e.into()))?
    } else {
        let joined = secure_join(&root, name)?;
        rustix::fs::open(&joined, flags | OFlags::CLOEXEC, mode)
            .map_err(|e| ApplyError::open_under_root(name, e.into()))?
    };

    let target = std::fs::read_link(proc_self_fd(&fd))?;
    if !target.starts_with(&root) {
        return Err(ApplyError::PathEscapesRoot {
            path: name.to_owned(),
        });
    }
    Ok(fd)
}

fn open_under_root_raw(
    dirfd: BorrowedFd<'_>,
    name: &Path,
    flags: OFlags,
    mode: Mode,
) -> Result<OwnedFd, ApplyError> {
    if SKIP_OPENAT2.load(Ordering::Relaxed) {
        return open_fallback(dirfd, name, flags, mode);
    }
    match openat2_in_root(dirfd, name, flags, mode) {
        Ok(fd) => Ok(fd),
        Err(Errno::NOSYS) => {
            SKIP_OPENAT2.store(true, Ordering::Relaxed);
            open_fallback(dirfd, name, flags, mode)
        }
        Err(e) => Err(ApplyError::open_under_root(name, e.into())),
    }
}

/// Safely opens `name` under the root directory `dirfd`.
///
/// When `flags` asks for creation and the parent directory chain does not
/// exist yet, the missing directories are created first.
pub(crate) fn open_under_root(
    dirfd: BorrowedFd<'_>,
    name: &Path,
    flags: OFlags,
    mode: Mode,
) -> Result<OwnedFd, ApplyError> {
    match open_under_root_raw(dirfd, name, flags, mode) {
        Ok(fd) => Ok(fd),
        Err(err) => {
            let missing_parent = matches!(
                &err,
                ApplyError::OpenUnderRoot { source, .. }
                    if source.raw_os_error() == Some(Errno::NOENT.raw_os_error())
            );
            if missing_parent && flags.contains(OFlags::CREATE) {
                if let (Some(parent), base) = parent_and_base(name) {
                    let parent_fd = open_or_create_dir_under_root(dirfd, parent, Mode::empty())?;
                    return open_under_root_raw(parent_fd.as_fd(), Path::new(base), flags, mode);
                }
            }
            Err(err)
        }
    }
}

/// Safely opens the directory `name` under the root, creating it and any
/// missing ancestors with mode `0o755`.
pub(crate) fn open_or_create_dir_under_root(
    dirfd: BorrowedFd<'_>,
    name: &Path,
    mode: Mode,
) -> Result<OwnedFd, ApplyError> {
    let flags = OFlags::DIRECTORY | OFlags::RDONLY;
    match open_under_root_raw(dirfd, name, flags, mode) {
        Ok(fd) => Ok(fd),
        Err(err) => {
            let missing = matches!(
                &err,
                ApplyError::OpenUnderRoot { source, .. }
                    if source.raw_os_error() == Some(Errno::NOENT.raw_os_error())
            );
            if !missing {
                return Err(err);
            }
            let (parent, base) = parent_and_base(name);
            let parent_fd = match parent {
                Some(parent) => Some(open_or_create_dir_under_root(dirfd, parent, mode)?),
                None => None,
            };
            let at = parent_fd.as_ref().map_or(dirfd, |fd| fd.as_fd());
            if let Err(e) = rustix::fs::mkdirat(at, base, Mode::from_bits_truncate(0o755)) {
                if e != Errno::EXIST {
                    return Err(err);
                }
            }
            open_under_root_raw(at, Path::new(base), flags, mode)
        }
    }
}

/// Opens the parent directory of `name` under the root, creating missing
/// ancestors, and returns it together with the final path component.
pub(crate) fn open_parent_dir<'n>(
    dirfd: BorrowedFd<'_>,
    name: &'n Path,
) -> Result<(Option<OwnedFd>, &'n OsStr), ApplyError> {
    let (parent, base) = parent_and_base(name);
    let parent_fd = match parent {
        Some(parent) => Some(open_or_create_dir_under_root(dirfd, parent, Mode::empty())?),
        None => None,
    };
    Ok((parent_fd, base))
}

/// Creates a hard link to the inode behind `src`, going through
/// `/proc/self/fd` so no capability beyond owning the descriptor is needed.
/// An existing destination entry is unlinked and the link retried once.
pub(crate) fn hard_link_by_fd(
    src: BorrowedFd<'_>,
    dest_dir: BorrowedFd<'_>,
    base: &OsStr,
) -> io::Result<()> {
    let src_path = proc_self_fd(src);
    let link = || {
        rustix::fs::linkat(
            rustix::fs::CWD,
            &src_path,
            dest_dir,
            base,
            AtFlags::SYMLINK_FOLLOW,
        )
    };
    match link() {
        Ok(()) => Ok(()),
        Err(Errno::EXIST) => {
            let _ = rustix::fs::unlinkat(dest_dir, base, AtFlags::empty());
            link().map_err(io::Error::from)
        }
        Err(e) => Err(e.into()),
    }
}

/// Re-opens an open file read-only through `/proc/self/fd`.
pub(crate) fn reopen_read_only(fd: impl AsFd) -> io::Result<OwnedFd> {
    rustix::fs::open(
        proc_self_fd(fd),
        OFlags::RDONLY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(io::Error::from)
}

/// Opens a directory as a root handle for resolution.
pub(crate) fn open_root(path: &Path) -> io::Result<OwnedFd> {
    rustix::fs::open(path, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty()).map_err(io::Error::from)
}

#[cfg(test)]
mod test {
    use std::os::fd::AsFd;

    use rustix::fs::{Mode, OFlags};

    use super::*;

    #[test]
    fn test_create_under_missing_parents() {
        let root = tempfile::tempdir().unwrap();
        let root_fd = open_root(root.path()).unwrap();

        let fd = open_under_root(
            root_fd.as_fd(),
            Path::new("a/b/c/file"),
            new_file_flags(),
            Mode::from_bits_truncate(0o644),
        )
        .unwrap();
        drop(fd);
        assert!(root.path().join("a/b/c/file").is_file());
    }

    #[test]
    fn test_sanitized_rel_path_rejects_traversal() {
        assert!(sanitized_rel_path("a/../../etc/passwd").is_err());
        assert!(sanitized_rel_path("/etc/passwd").is_err());
        assert_eq!(
            sanitized_rel_path("./usr/bin/env").unwrap(),
            PathBuf::from("usr/bin/env")
        );
    }

    #[test]
    fn test_symlink_cannot_escape_root() {
        let outside = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("exit")).unwrap();
        let root_fd = open_root(root.path()).unwrap();

        // Resolution is clamped to the root, so the file must land inside it
        // (or the open must fail outright), never in the outside directory.
        let result = open_under_root(
            root_fd.as_fd(),
            Path::new("exit/escaped"),
            new_file_flags(),
            Mode::from_bits_truncate(0o644),
        );
        drop(result);
        assert!(!outside.path().join("escaped").exists());
    }

    #[test]
    fn test_secure_join_clamps_dotdot() {
        let root = tempfile::tempdir().unwrap();
        let joined = secure_join(root.path(), Path::new("a/../../../etc/passwd")).unwrap();
        assert_eq!(joined, root.path().join("etc/passwd"));
    }

    #[test]
    fn test_hard_link_by_fd() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("orig"), b"payload").unwrap();
        let root_fd = open_root(root.path()).unwrap();

        let src = open_under_root(
            root_fd.as_fd(),
            Path::new("orig"),
            OFlags::RDONLY,
            Mode::empty(),
        )
        .unwrap();
        hard_link_by_fd(src.as_fd(), root_fd.as_fd(), OsStr::new("copy")).unwrap();

        let meta = std::fs::metadata(root.path().join("copy")).unwrap();
        assert_eq!(std::os::unix::fs::MetadataExt::nlink(&meta), 2);
    }
}
