//! Destination files: open, write, validate, finalize.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::Arc;

use sha2::Digest as _;
use strata_digest::ContentDigest;
use strata_toc::FileMetadata;

use crate::attrs::set_file_attrs;
use crate::decoder;
use crate::dirfd::{new_file_flags, open_under_root, reopen_read_only};
use crate::error::ApplyError;
use crate::options::TarOptions;
use crate::verity::VerityRecorder;

/// State shared by the orchestrator, the dedup workers, and the finalizer.
pub(crate) struct ApplyContext {
    /// The destination root directory.
    pub root: OwnedFd,
    /// Ownership/mode handling options.
    pub options: TarOptions,
    /// Attestation collector.
    pub verity: VerityRecorder,
    /// Set when the blob was produced locally and per-file digests are
    /// already known to be good.
    pub skip_validation: bool,
}

/// An open file being materialized under the root.
///
/// Bytes are teed through a hasher unless validation was skipped; on close
/// the digest is checked against the manifest, attributes are stamped, and
/// the file is optionally enrolled for attestation.
pub(crate) struct DestinationFile {
    file: File,
    metadata: FileMetadata,
    hasher: Option<sha2::Sha256>,
}

impl DestinationFile {
    /// Creates the file under the root. The path must not exist yet.
    pub(crate) fn open(ctx: &ApplyContext, metadata: &FileMetadata) -> Result<Self, ApplyError> {
        let fd = open_under_root(
            ctx.root.as_fd(),
            Path::new(&metadata.name),
            new_file_flags(),
            rustix::fs::Mode::empty(),
        )?;
        Ok(Self {
            file: File::from(fd),
            metadata: metadata.clone(),
            hasher: (!ctx.skip_validation).then(|| sha2::Sha256::new()),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Extends the file with `size` zero bytes without storing data. The
    /// zeros still run through the hasher so the recorded digest matches the
    /// logical content.
    pub(crate) fn append_hole(&mut self, size: u64) -> io::Result<()> {
        decoder::append_hole(&self.file, size)?;
        if let Some(hasher) = self.hasher.as_mut() {
            decoder::hash_zeros(hasher, size);
        }
        Ok(())
    }

    /// Validates the content digest and stamps attributes.
    pub(crate) fn close(mut self, ctx: &ApplyContext) -> Result<(), ApplyError> {
        if let Some(hasher) = self.hasher.take() {
            let expected = self
                .metadata
                .digest
                .ok_or_else(|| ApplyError::MissingDigest {
                    path: Path::new(&self.metadata.name).to_owned(),
                })?;
            let actual = ContentDigest::from_hash(hasher.finalize());
            if actual != expected {
                return Err(ApplyError::DigestMismatch {
                    path: Path::new(&self.metadata.name).to_owned(),
                    expected,
                    actual,
                });
            }
        }

        set_file_attrs(
            ctx.root.as_fd(),
            self.file.as_fd(),
            self.metadata.mode,
            &self.metadata,
            &ctx.options,
            false,
        )?;

        if ctx.verity.enabled() {
            let ro = reopen_read_only(&self.file)?;
            ctx.verity.record(&self.metadata.name, ro.as_fd())?;
        }
        Ok(())
    }
}

impl Write for DestinationFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.file.write(buf)?;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..written]);
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// A dedicated thread that validates and finalizes destination files, so the
/// fetch driver can move on to the next file while the previous one is still
/// being chmodded.
pub(crate) struct Finalizer {
    tx: Option<SyncSender<DestinationFile>>,
    err_rx: Receiver<ApplyError>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Finalizer {
    /// Spawns the finalizer thread over a small bounded queue.
    pub(crate) fn spawn(ctx: Arc<ApplyContext>) -> Self {
        let (tx, rx) = std::sync::mpsc::sync_channel::<DestinationFile>(3);
        let (err_tx, err_rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            for file in rx {
                if let Err(err) = file.close(&ctx) {
                    let _ = err_tx.send(err);
                }
            }
        });
        Self {
            tx: Some(tx),
            err_rx,
            handle: Some(handle),
        }
    }

    /// Hands a finished file over for validation. Errors from earlier
    /// finalizations surface here, so a failed validation stops the driver
    /// at the next file boundary.
    pub(crate) fn submit(&mut self, file: DestinationFile) -> Result<(), ApplyError> {
        if let Ok(err) = self.err_rx.try_recv() {
            return Err(err);
        }
        let Some(tx) = self.tx.as_ref() else {
            return Err(ApplyError::Io(io::Error::other("finalizer already shut down")));
        };
        match tx.try_send(file) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(file)) => {
                // Queue full: check for a failure once more, then block.
                if let Ok(err) = self.err_rx.try_recv() {
                    return Err(err);
                }
                tx.send(file)
                    .map_err(|_| ApplyError::Io(io::Error::other("finalizer stopped")))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(ApplyError::Io(io::Error::other("finalizer stopped")))
            }
        }
    }

    /// Drains the queue and returns the first finalization error, if any.
    pub(crate) fn finish(mut self) -> Result<(), ApplyError> {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        match self.err_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
