//! Creation of the non-regular parts of the tree: directories, symlinks,
//! hard links, device nodes, and the whiteout hook operations.

use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;

use rustix::fs::{AtFlags, FileType, Mode, OFlags, XattrFlags};
use rustix::io::Errno;
use strata_toc::{EntryType, FileMetadata};

use crate::attrs::{chown_error, set_file_attrs};
use crate::dirfd::{hard_link_by_fd, open_or_create_dir_under_root, open_parent_dir, open_under_root};
use crate::error::ApplyError;
use crate::options::{TarOptions, WhiteoutOps};

/// Creates the directory for `metadata`, including missing ancestors, and
/// applies its attributes. An already-existing directory is reused.
pub(crate) fn safe_mkdir(
    root: BorrowedFd<'_>,
    metadata: &FileMetadata,
    options: &TarOptions,
) -> Result<(), ApplyError> {
    let name = Path::new(&metadata.name);
    let (parent, base) = open_parent_dir(root, name)?;
    let dirfd = parent.as_ref().map_or(root, |fd| fd.as_fd());

    if let Err(errno) = rustix::fs::mkdirat(dirfd, base, Mode::from_bits_truncate(metadata.mode)) {
        if errno != Errno::EXIST {
            return Err(ApplyError::open_under_root(name, errno.into()));
        }
    }

    let fd = open_under_root(
        dirfd,
        Path::new(base),
        OFlags::DIRECTORY | OFlags::RDONLY,
        Mode::empty(),
    )?;
    set_file_attrs(root, fd.as_fd(), metadata.mode, metadata, options, false)
}

/// Creates the symlink for `metadata`. Attributes of symlinks are applied by
/// the caller policy embedded in `set_file_attrs` (always by path).
pub(crate) fn safe_symlink(root: BorrowedFd<'_>, metadata: &FileMetadata) -> Result<(), ApplyError> {
    let name = Path::new(&metadata.name);
    let (parent, base) = open_parent_dir(root, name)?;
    let dirfd = parent.as_ref().map_or(root, |fd| fd.as_fd());

    rustix::fs::symlinkat(&metadata.link_name, dirfd, base)
        .map_err(|errno| ApplyError::open_under_root(name, errno.into()))
}

/// Creates the hard link for `metadata` once its target exists, then
/// re-applies attributes to the shared inode.
pub(crate) fn safe_link(
    root: BorrowedFd<'_>,
    metadata: &FileMetadata,
    options: &TarOptions,
) -> Result<(), ApplyError> {
    let target = open_under_root(
        root,
        Path::new(&metadata.link_name),
        OFlags::PATH | OFlags::RDONLY | OFlags::NOFOLLOW,
        Mode::empty(),
    )?;

    let name = Path::new(&metadata.name);
    let (parent, base) = open_parent_dir(root, name)?;
    let dirfd = parent.as_ref().map_or(root, |fd| fd.as_fd());
    hard_link_by_fd(target.as_fd(), dirfd, base)
        .map_err(|e| ApplyError::open_under_root(name, e))?;

    match open_under_root(root, name, OFlags::WRONLY | OFlags::NOFOLLOW, Mode::empty()) {
        Ok(fd) => set_file_attrs(root, fd.as_fd(), metadata.mode, metadata, options, false),
        Err(ApplyError::OpenUnderRoot { source, .. })
            if source.raw_os_error() == Some(Errno::LOOP.raw_os_error()) =>
        {
            // The link target is itself a symlink; fall back to an O_PATH
            // handle and apply attributes by path.
            let fd = open_under_root(
                root,
                name,
                OFlags::PATH | OFlags::NOFOLLOW,
                Mode::empty(),
            )?;
            set_file_attrs(root, fd.as_fd(), metadata.mode, metadata, options, true)
        }
        Err(err) => Err(err),
    }
}

/// Creates the device node or fifo for `metadata` and applies attributes.
pub(crate) fn safe_mknod(
    root: BorrowedFd<'_>,
    metadata: &FileMetadata,
    options: &TarOptions,
) -> Result<(), ApplyError> {
    let file_type = match metadata.entry_type {
        EntryType::Char => FileType::CharacterDevice,
        EntryType::Block => FileType::BlockDevice,
        EntryType::Fifo => FileType::Fifo,
        _ => {
            return Err(ApplyError::InvalidEntryType {
                path: Path::new(&metadata.name).to_owned(),
            })
        }
    };
    let name = Path::new(&metadata.name);
    let (parent, base) = open_parent_dir(root, name)?;
    let dirfd = parent.as_ref().map_or(root, |fd| fd.as_fd());

    let dev = rustix::fs::makedev(metadata.dev_major, metadata.dev_minor);
    rustix::fs::mknodat(
        dirfd,
        base,
        file_type,
        Mode::from_bits_truncate(metadata.mode),
        dev,
    )
    .map_err(|errno| ApplyError::open_under_root(name, errno.into()))?;

    let fd = open_under_root(root, name, OFlags::PATH | OFlags::NOFOLLOW, Mode::empty())?;
    set_file_attrs(root, fd.as_fd(), metadata.mode, metadata, options, true)
}

/// Creates an empty regular file and applies its attributes; empty files
/// never touch the fetch pipeline.
pub(crate) fn create_empty_file(
    root: BorrowedFd<'_>,
    metadata: &FileMetadata,
    options: &TarOptions,
) -> Result<(), ApplyError> {
    let fd = open_under_root(
        root,
        Path::new(&metadata.name),
        crate::dirfd::new_file_flags(),
        Mode::empty(),
    )?;
    set_file_attrs(root, fd.as_fd(), metadata.mode, metadata, options, false)
}

/// The filesystem operations offered to a whiteout converter, resolving
/// every path under the destination root.
pub(crate) struct RootWhiteoutOps<'a> {
    pub root: BorrowedFd<'a>,
}

impl WhiteoutOps for RootWhiteoutOps<'_> {
    fn set_xattr(&mut self, path: &str, name: &str, value: &[u8]) -> Result<(), ApplyError> {
        let fd = open_or_create_dir_under_root(self.root, Path::new(path), Mode::empty())?;
        rustix::fs::fsetxattr(fd.as_fd(), name, value, XattrFlags::empty()).map_err(|errno| {
            ApplyError::SetXattr {
                path: Path::new(path).to_owned(),
                name: name.to_owned(),
                source: errno.into(),
            }
        })
    }

    fn mknod(&mut self, path: &str, mode: u32, dev: u64) -> Result<(), ApplyError> {
        let name = Path::new(path);
        let (parent, base) = open_parent_dir(self.root, name)?;
        let dirfd = parent.as_ref().map_or(self.root, |fd| fd.as_fd());
        rustix::fs::mknodat(
            dirfd,
            base,
            FileType::from_raw_mode(mode),
            Mode::from_bits_truncate(mode),
            dev,
        )
        .map_err(|errno| ApplyError::open_under_root(name, errno.into()))
    }

    fn chown(&mut self, path: &str, uid: u32, gid: u32) -> Result<(), ApplyError> {
        let fd = open_under_root(self.root, Path::new(path), OFlags::PATH, Mode::empty())?;
        let result = rustix::fs::chownat(
            fd.as_fd(),
            "",
            Some(unsafe { rustix::fs::Uid::from_raw(uid) }),
            Some(unsafe { rustix::fs::Gid::from_raw(gid) }),
            AtFlags::EMPTY_PATH,
        );
        if let Err(errno) = result {
            // The owner may already be right, e.g. in a user namespace where
            // the chown itself is not permitted.
            if let Ok(stat) = rustix::fs::fstat(fd.as_fd()) {
                if stat.st_uid == uid && stat.st_gid == gid {
                    return Ok(());
                }
            }
            return Err(chown_error(Path::new(path).to_owned(), uid, gid, errno));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::MetadataExt;

    use super::*;
    use crate::dirfd::open_root;

    fn own(meta: &mut FileMetadata) {
        meta.uid = rustix::process::getuid().as_raw();
        meta.gid = rustix::process::getgid().as_raw();
    }

    #[test]
    fn test_safe_mkdir_creates_and_stamps() {
        let root = tempfile::tempdir().unwrap();
        let root_fd = open_root(root.path()).unwrap();
        let mut meta = FileMetadata::directory("var/lib/app");
        meta.mode = 0o750;
        own(&mut meta);

        safe_mkdir(root_fd.as_fd(), &meta, &TarOptions::default()).unwrap();
        let on_disk = std::fs::metadata(root.path().join("var/lib/app")).unwrap();
        assert!(on_disk.is_dir());
        assert_eq!(on_disk.mode() & 0o7777, 0o750);
    }

    #[test]
    fn test_safe_symlink_and_link() {
        let root = tempfile::tempdir().unwrap();
        let root_fd = open_root(root.path()).unwrap();
        std::fs::write(root.path().join("file"), b"x").unwrap();

        let mut sym = FileMetadata::symlink("alias", "file");
        own(&mut sym);
        safe_symlink(root_fd.as_fd(), &sym).unwrap();
        assert_eq!(
            std::fs::read_link(root.path().join("alias")).unwrap(),
            Path::new("file")
        );

        let mut link = FileMetadata::hard_link("second", "file");
        link.mode = 0o644;
        own(&mut link);
        safe_link(root_fd.as_fd(), &link, &TarOptions::default()).unwrap();
        assert_eq!(
            std::fs::metadata(root.path().join("second")).unwrap().nlink(),
            2
        );
    }

    #[test]
    fn test_hard_link_to_symlink_uses_path_attrs() {
        let root = tempfile::tempdir().unwrap();
        let root_fd = open_root(root.path()).unwrap();
        std::os::unix::fs::symlink("missing", root.path().join("dangling")).unwrap();

        let mut link = FileMetadata::hard_link("copy", "dangling");
        link.mode = 0o777;
        own(&mut link);
        safe_link(root_fd.as_fd(), &link, &TarOptions::default()).unwrap();
        assert!(root
            .path()
            .join("copy")
            .symlink_metadata()
            .unwrap()
            .is_symlink());
    }

    #[test]
    fn test_create_empty_file() {
        let root = tempfile::tempdir().unwrap();
        let root_fd = open_root(root.path()).unwrap();
        let mut meta = FileMetadata::regular("etc/empty", 0, None);
        meta.mode = 0o600;
        own(&mut meta);

        create_empty_file(root_fd.as_fd(), &meta, &TarOptions::default()).unwrap();
        let on_disk = std::fs::metadata(root.path().join("etc/empty")).unwrap();
        assert_eq!(on_disk.len(), 0);
        assert_eq!(on_disk.mode() & 0o7777, 0o600);
    }
}
