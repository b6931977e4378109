//! Converting an opaque compressed tarball into a seekable chunked blob.
//!
//! When a layer carries no table of contents there is nothing to pull
//! partially, but the rest of the pipeline can still be reused: fetch the
//! whole blob once, verify it, recompress it locally into the chunked
//! format, and apply that as if the registry had served it.

use std::io::{self, BufReader, Read, Seek, Write};
use std::path::Path;

use strata_digest::{ContentDigest, HashingReader};
use strata_toc::Toc;

use crate::decoder::decompress_stream;
use crate::error::ApplyError;
use crate::source::{BlobSource, ChunkRange, FileBlobSource};

/// The in-memory description of a locally produced chunked blob.
pub struct ConvertedToc {
    /// Table of contents of the produced container.
    pub toc: Toc,
    /// The tar-split stream letting consumers rebuild the original tar.
    pub tar_split: Vec<u8>,
    /// Offset of the embedded manifest, which caps the last chunk's range.
    pub toc_offset: u64,
}

/// The compressor producing the seekable chunked container. Implemented by
/// the owning store; the applier only drives it.
pub trait ChunkedCompressor: Send + Sync {
    /// Consumes a raw tar stream, writes the chunked container to `out`, and
    /// returns its table of contents.
    fn compress(&self, tar_stream: &mut dyn Read, out: &mut dyn Write)
        -> io::Result<ConvertedToc>;
}

/// A converted blob, ready to re-enter the main pipeline.
#[derive(Debug)]
pub(crate) struct ConvertedBlob {
    /// Range-capable source over the produced chunked file.
    pub source: FileBlobSource,
    pub toc: Toc,
    pub tar_split: Vec<u8>,
    pub toc_offset: u64,
    /// Digest of the decompressed tar stream (the layer's DiffID).
    pub uncompressed_digest: ContentDigest,
}

/// Fetches the whole blob, verifies it against `blob_digest`, and
/// recompresses it into a chunked container stored in an anonymous file on
/// the destination filesystem (so later copies can reflink from it).
pub(crate) fn convert_raw_blob(
    source: &mut dyn BlobSource,
    blob_size: u64,
    blob_digest: ContentDigest,
    compressor: &dyn ChunkedCompressor,
    dest: &Path,
) -> Result<ConvertedBlob, ApplyError> {
    let streams = source.get_blob_at(&[ChunkRange {
        offset: 0,
        length: blob_size,
    }])?;
    let stream = match streams.recv() {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => return Err(ApplyError::MissingStream),
    };

    // Land the compressed blob on disk, hashing on the way through.
    let mut blob_file = tempfile::tempfile_in(dest)?;
    let mut hashing = HashingReader::new(stream);
    io::copy(&mut hashing, &mut blob_file)?;
    let (_, compressed_digest) = hashing.finalize();
    if compressed_digest != blob_digest {
        return Err(ApplyError::BlobDigestMismatch {
            expected: blob_digest,
            actual: compressed_digest,
        });
    }

    // Recompress into the chunked format, hashing the decompressed tar to
    // obtain the DiffID that validates the conversion end to end.
    blob_file.rewind()?;
    let tar_stream = decompress_stream(BufReader::new(blob_file))?;
    let mut hashing = HashingReader::new(tar_stream);
    let mut chunked_file = tempfile::tempfile_in(dest)?;
    let converted = compressor.compress(&mut hashing, &mut chunked_file)?;
    let (_, uncompressed_digest) = hashing.finalize();

    Ok(ConvertedBlob {
        source: FileBlobSource::new(chunked_file),
        toc: converted.toc,
        tar_split: converted.tar_split,
        toc_offset: converted.toc_offset,
        uncompressed_digest,
    })
}
