//! Kernel-backed integrity attestation (fs-verity).
//!
//! After a file has been validated, the kernel can be asked to seal it: an
//! fs-verity enabled file is read-only and every read is checked against a
//! Merkle tree the kernel built at enrollment. The measured root digest is
//! collected per file and handed back to the storage driver as an artifact.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::Path;

use parking_lot::Mutex;
use rustix::io::Errno;

use crate::error::ApplyError;

/// Whether and how strictly files are enrolled in fs-verity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VerityPolicy {
    /// Never enroll.
    #[default]
    Disabled,
    /// Enroll when the filesystem supports it, silently skip otherwise.
    IfAvailable,
    /// Enroll every file; fail the apply when the filesystem cannot.
    Required,
}

// The fs-verity ioctls are not wrapped by rustix; numbers are
// _IOW('f', 133, fsverity_enable_arg) and _IOWR('f', 134, fsverity_digest).
const FS_IOC_ENABLE_VERITY: libc::c_ulong = 0x4080_6685;
const FS_IOC_MEASURE_VERITY: libc::c_ulong = 0xc004_6686;

const FS_VERITY_HASH_ALG_SHA256: u32 = 1;
const FS_VERITY_BLOCK_SIZE: u32 = 4096;
const FS_VERITY_MAX_DIGEST_SIZE: u16 = 64;

#[repr(C)]
struct FsVerityEnableArg {
    version: u32,
    hash_algorithm: u32,
    block_size: u32,
    salt_size: u32,
    salt_ptr: u64,
    sig_size: u32,
    reserved1: u32,
    sig_ptr: u64,
    reserved2: [u64; 11],
}

#[repr(C)]
struct FsVerityDigest {
    digest_algorithm: u16,
    digest_size: u16,
    digest: [u8; FS_VERITY_MAX_DIGEST_SIZE as usize],
}

/// Enrolls the file behind `fd` in fs-verity. Enabling an already-enrolled
/// file is not an error.
fn enable_verity(fd: BorrowedFd<'_>) -> io::Result<()> {
    let arg = FsVerityEnableArg {
        version: 1,
        hash_algorithm: FS_VERITY_HASH_ALG_SHA256,
        block_size: FS_VERITY_BLOCK_SIZE,
        salt_size: 0,
        salt_ptr: 0,
        sig_size: 0,
        reserved1: 0,
        sig_ptr: 0,
        reserved2: [0; 11],
    };
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), FS_IOC_ENABLE_VERITY, &arg) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(Errno::EXIST.raw_os_error()) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Reads back the measured fs-verity digest of the file behind `fd` as a hex
/// string.
fn measure_verity(fd: BorrowedFd<'_>) -> io::Result<String> {
    let mut arg = FsVerityDigest {
        digest_algorithm: 0,
        digest_size: FS_VERITY_MAX_DIGEST_SIZE,
        digest: [0; FS_VERITY_MAX_DIGEST_SIZE as usize],
    };
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), FS_IOC_MEASURE_VERITY, &mut arg) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(hex::encode(&arg.digest[..arg.digest_size as usize]))
}

/// Collects the attestation digests of finalized files, shared between the
/// worker threads and the finalizer.
#[derive(Debug, Default)]
pub(crate) struct VerityRecorder {
    policy: VerityPolicy,
    digests: Mutex<HashMap<String, String>>,
}

impl VerityRecorder {
    pub(crate) fn new(policy: VerityPolicy) -> Self {
        Self {
            policy,
            digests: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.policy != VerityPolicy::Disabled
    }

    /// Enrolls a just-written file and records its measured digest.
    ///
    /// `fd` must be a read-only descriptor; enrollment fails on writable
    /// ones.
    pub(crate) fn record(&self, name: &str, fd: BorrowedFd<'_>) -> Result<(), ApplyError> {
        if self.policy == VerityPolicy::Disabled {
            return Ok(());
        }
        if let Err(err) = enable_verity(fd.as_fd()) {
            if self.policy == VerityPolicy::Required {
                return Err(ApplyError::VerityUnsupported {
                    path: Path::new(name).to_owned(),
                    source: err,
                });
            }
            let errno = err.raw_os_error();
            if errno != Some(Errno::OPNOTSUPP.raw_os_error())
                && errno != Some(Errno::NOTTY.raw_os_error())
            {
                tracing::warn!(path = name, "cannot enable fs-verity: {err}");
            }
            return Ok(());
        }
        let measured = measure_verity(fd).map_err(|err| ApplyError::VerityUnsupported {
            path: Path::new(name).to_owned(),
            source: err,
        })?;
        self.digests.lock().insert(name.to_owned(), measured);
        Ok(())
    }

    /// Returns the collected per-file digests.
    pub(crate) fn take_digests(&self) -> HashMap<String, String> {
        std::mem::take(&mut *self.digests.lock())
    }
}
