//! Stamping ownership, mode, timestamps, and extended attributes onto
//! materialized inodes.

use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

use base64::Engine as _;
use rustix::fs::{AtFlags, Mode, OFlags, Timespec, Timestamps, XattrFlags};
use rustix::io::Errno;
use strata_toc::{EntryType, FileMetadata};

use crate::dirfd::{open_under_root, proc_self_fd};
use crate::error::ApplyError;
use crate::options::TarOptions;

/// Extended attribute holding the original `uid:gid:mode` triple when a
/// forced mask rewrites the on-disk mode.
pub const CONTAINERS_OVERRIDE_XATTR: &str = "user.containers.override_stat";

/// Extended attributes never copied onto the destination; MAC labels are
/// managed by the host, not the layer.
pub(crate) const XATTRS_TO_IGNORE: &[&str] = &["security.selinux"];

/// `tv_nsec` value asking `utimensat` to leave a timestamp untouched.
const UTIME_OMIT: i64 = (1 << 30) - 2;

fn timespec_from(time: Option<&chrono::DateTime<chrono::Utc>>) -> Timespec {
    match time {
        Some(t) => Timespec {
            tv_sec: t.timestamp(),
            tv_nsec: i64::from(t.timestamp_subsec_nanos()),
        },
        None => Timespec {
            tv_sec: 0,
            tv_nsec: UTIME_OMIT,
        },
    }
}

/// True for errors raised by filesystems that simply do not implement an
/// attribute operation; those are warned about and skipped.
fn can_ignore(errno: Errno) -> bool {
    errno == Errno::NOSYS || errno == Errno::OPNOTSUPP
}

/// Formats the stashed ownership triple for [`CONTAINERS_OVERRIDE_XATTR`].
pub(crate) fn override_stat_value(uid: u32, gid: u32, mode: u32) -> String {
    format!("{uid}:{gid}:0{:o}", mode & 0o7777)
}

/// Applies ownership, xattrs, timestamps, and mode to a freshly created
/// inode.
///
/// `fd` must be an open descriptor for the inode. When `use_path` is set (or
/// the entry is a symlink, which cannot be operated on through a plain
/// descriptor) the attributes are applied through the parent directory with
/// `AT_SYMLINK_NOFOLLOW` instead.
pub(crate) fn set_file_attrs(
    root: BorrowedFd<'_>,
    fd: BorrowedFd<'_>,
    mode: u32,
    metadata: &FileMetadata,
    options: &TarOptions,
    use_path: bool,
) -> Result<(), ApplyError> {
    let use_path = use_path || metadata.entry_type == EntryType::Symlink;
    let name = Path::new(&metadata.name);

    // For path-based application resolve the parent once and address the
    // inode by its final component.
    let mut parent_fd = None;
    let mut base = PathBuf::new();
    if use_path {
        if let Some(parent) = name.parent().filter(|p| !p.as_os_str().is_empty()) {
            parent_fd = Some(open_under_root(
                root,
                parent,
                OFlags::PATH | OFlags::DIRECTORY,
                Mode::empty(),
            )?);
        }
        base = name
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&metadata.name));
    }
    let dirfd = parent_fd.as_ref().map_or(root, |fd| fd.as_fd());

    let chown_result = if use_path {
        rustix::fs::chownat(
            dirfd,
            &base,
            Some(unsafe { rustix::fs::Uid::from_raw(metadata.uid) }),
            Some(unsafe { rustix::fs::Gid::from_raw(metadata.gid) }),
            AtFlags::SYMLINK_NOFOLLOW,
        )
    } else {
        rustix::fs::fchown(
            fd,
            Some(unsafe { rustix::fs::Uid::from_raw(metadata.uid) }),
            Some(unsafe { rustix::fs::Gid::from_raw(metadata.gid) }),
        )
    };
    if let Err(errno) = chown_result {
        if !options.ignore_chown_errors {
            return Err(chown_error(name.to_owned(), metadata.uid, metadata.gid, errno));
        }
        tracing::debug!(path = %name.display(), "ignoring chown failure: {errno}");
    }

    for (key, value) in &metadata.xattrs {
        if XATTRS_TO_IGNORE.contains(&key.as_str()) {
            continue;
        }
        let data = base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(|_| ApplyError::InvalidXattrValue {
                path: name.to_owned(),
                name: key.clone(),
            })?;
        let result = if use_path {
            // The proc alias resolves to the open inode itself, which is the
            // only way to label a symlink.
            rustix::fs::setxattr(proc_self_fd(fd), key, &data, XattrFlags::empty())
        } else {
            rustix::fs::fsetxattr(fd, key, &data, XattrFlags::empty())
        };
        match result {
            Ok(()) => {}
            Err(errno) if can_ignore(errno) => {
                tracing::warn!(path = %name.display(), xattr = %key, "filesystem does not support xattrs: {errno}");
            }
            Err(errno) => {
                return Err(ApplyError::SetXattr {
                    path: name.to_owned(),
                    name: key.clone(),
                    source: errno.into(),
                })
            }
        }
    }

    let times = Timestamps {
        last_access: timespec_from(metadata.access_time.as_ref()),
        last_modification: timespec_from(metadata.mod_time.as_ref()),
    };
    let utimes_result = if use_path {
        rustix::fs::utimensat(dirfd, &base, &times, AtFlags::SYMLINK_NOFOLLOW)
    } else {
        rustix::fs::utimensat(
            rustix::fs::CWD,
            proc_self_fd(fd),
            &times,
            AtFlags::empty(),
        )
    };
    if let Err(errno) = utimes_result {
        if !can_ignore(errno) {
            return Err(ApplyError::Io(errno.into()));
        }
        tracing::warn!(path = %name.display(), "cannot set file times: {errno}");
    }

    let mode_bits = Mode::from_bits_truncate(mode);
    let chmod_result = if use_path {
        rustix::fs::chmodat(dirfd, &base, mode_bits, AtFlags::SYMLINK_NOFOLLOW)
    } else {
        rustix::fs::fchmod(fd, mode_bits)
    };
    if let Err(errno) = chmod_result {
        if !can_ignore(errno) {
            return Err(ApplyError::Io(errno.into()));
        }
        tracing::warn!(path = %name.display(), "cannot chmod: {errno}");
    }

    Ok(())
}

/// Builds the chown error, decorating `EINVAL` with the user-namespace hint.
pub(crate) fn chown_error(path: PathBuf, uid: u32, gid: u32, errno: Errno) -> ApplyError {
    if errno == Errno::INVAL {
        ApplyError::ChownUnmappedId {
            path,
            uid,
            gid,
            source: errno.into(),
        }
    } else {
        ApplyError::Chown {
            path,
            uid,
            gid,
            source: errno.into(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::os::fd::AsFd;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    use rustix::fs::{Mode, OFlags};

    use super::*;
    use crate::dirfd::{new_file_flags, open_root, open_under_root};

    #[test]
    fn test_override_stat_value_format() {
        assert_eq!(override_stat_value(0, 0, 0o4755), "0:0:04755");
        assert_eq!(override_stat_value(1000, 100, 0o644), "1000:100:0644");
    }

    #[test]
    fn test_mode_and_times_applied() {
        let root = tempfile::tempdir().unwrap();
        let root_fd = open_root(root.path()).unwrap();
        let fd = open_under_root(
            root_fd.as_fd(),
            Path::new("file"),
            new_file_flags(),
            Mode::from_bits_truncate(0o600),
        )
        .unwrap();

        let mut meta = strata_toc::FileMetadata::regular("file", 0, None);
        meta.mode = 0o751;
        meta.mod_time = Some(chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        // Unprivileged chown to self.
        meta.uid = rustix::process::getuid().as_raw();
        meta.gid = rustix::process::getgid().as_raw();

        set_file_attrs(
            root_fd.as_fd(),
            fd.as_fd(),
            meta.mode,
            &meta,
            &TarOptions::default(),
            false,
        )
        .unwrap();

        let on_disk = std::fs::metadata(root.path().join("file")).unwrap();
        assert_eq!(on_disk.permissions().mode() & 0o7777, 0o751);
        assert_eq!(on_disk.mtime(), 1_700_000_000);
    }

    #[test]
    fn test_symlink_attrs_use_path() {
        let root = tempfile::tempdir().unwrap();
        let root_fd = open_root(root.path()).unwrap();
        std::os::unix::fs::symlink("target", root.path().join("link")).unwrap();
        let fd = open_under_root(
            root_fd.as_fd(),
            Path::new("link"),
            OFlags::PATH | OFlags::NOFOLLOW,
            Mode::empty(),
        )
        .unwrap();

        let mut meta = strata_toc::FileMetadata::symlink("link", "target");
        meta.uid = rustix::process::getuid().as_raw();
        meta.gid = rustix::process::getgid().as_raw();

        set_file_attrs(
            root_fd.as_fd(),
            fd.as_fd(),
            meta.mode,
            &meta,
            &TarOptions::default(),
            true,
        )
        .unwrap();
        assert!(root.path().join("link").symlink_metadata().unwrap().is_symlink());
    }
}
