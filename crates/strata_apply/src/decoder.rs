//! Uniform byte source over the codecs a chunked part can be stored in.
//!
//! A fetched part is either zstd-framed (zstd:chunked), gzip-framed
//! (eStargz), raw bytes (a local origin file), or a hole that has no payload
//! at all. The fetch driver asks this module to move exactly N uncompressed
//! bytes from a part reader into a destination writer, whatever the framing.

use std::io::{self, BufRead, Read, Write};

use rustix::fs::SeekFrom;
use strata_toc::LayerFormat;

/// The framing of a fetched part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartKind {
    /// zstd-framed chunk data.
    ZstdChunked,
    /// gzip-framed chunk data.
    Gzip,
    /// Raw bytes, already uncompressed.
    NoCompression,
    /// A run of zeros with no stored payload.
    Hole,
}

impl From<LayerFormat> for PartKind {
    fn from(format: LayerFormat) -> Self {
        match format {
            LayerFormat::ZstdChunked => PartKind::ZstdChunked,
            LayerFormat::Estargz => PartKind::Gzip,
        }
    }
}

/// Moves exactly `size` uncompressed bytes from `from` (framed as `kind`)
/// into `to`. The caller is responsible for limiting `from` to the part's
/// compressed payload.
pub(crate) fn copy_uncompressed(
    kind: PartKind,
    from: &mut dyn Read,
    to: &mut dyn Write,
    size: u64,
) -> io::Result<u64> {
    match kind {
        PartKind::ZstdChunked => {
            let mut decoder = zstd::stream::read::Decoder::new(from)?;
            io::copy(&mut (&mut decoder).take(size), to)
        }
        PartKind::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(from);
            io::copy(&mut (&mut decoder).take(size), to)
        }
        PartKind::NoCompression => io::copy(&mut from.take(size), to),
        PartKind::Hole => Err(io::Error::other("hole parts carry no stream")),
    }
}

/// Discards `n` bytes from a reader, returning how many were actually
/// skipped.
pub(crate) fn discard(from: &mut dyn Read, n: u64) -> io::Result<u64> {
    io::copy(&mut from.take(n), &mut io::sink())
}

/// Discards whatever is left of a reader so the next part starts at a
/// deterministic position.
pub(crate) fn drain(from: &mut dyn Read) -> io::Result<u64> {
    io::copy(from, &mut io::sink())
}

/// Extends the open file by `size` bytes without writing data, leaving a
/// hole. The explicit truncate matters when the hole is the last thing in
/// the file.
pub(crate) fn append_hole(fd: impl std::os::fd::AsFd, size: u64) -> io::Result<()> {
    let end = rustix::fs::seek(&fd, SeekFrom::Current(size as i64))?;
    rustix::fs::ftruncate(&fd, end)?;
    Ok(())
}

/// Feeds `size` zero bytes to a hasher, so a digest over a sparse file
/// matches the digest of its logical content.
pub(crate) fn hash_zeros(hasher: &mut sha2::Sha256, size: u64) {
    use sha2::Digest as _;
    const ZEROS: [u8; 64 * 1024] = [0; 64 * 1024];
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(ZEROS.len() as u64) as usize;
        hasher.update(&ZEROS[..n]);
        remaining -= n as u64;
    }
}

/// Wraps a compressed tarball in a decompressing reader, sniffing the codec
/// from its magic bytes. Unrecognized content is passed through unchanged.
pub(crate) fn decompress_stream<R: BufRead + 'static>(mut reader: R) -> io::Result<Box<dyn Read>> {
    let header = reader.fill_buf()?;
    if header.starts_with(&[0x1f, 0x8b]) {
        Ok(Box::new(flate2::read::MultiGzDecoder::new(reader)))
    } else if header.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Ok(Box::new(zstd::stream::read::Decoder::new(reader)?))
    } else {
        Ok(Box::new(reader))
    }
}
