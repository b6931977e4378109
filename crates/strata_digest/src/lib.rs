#![deny(missing_docs)]

//! Content digest support for the strata layer applier.
//!
//! Layer tables of contents identify file and chunk payloads by their SHA-256
//! digest, written in the canonical `sha256:<hex>` string form. This crate
//! provides the [`ContentDigest`] type that round-trips that form, plus a few
//! adapters for hashing data as it streams through a reader or writer:
//!
//! - [`ContentDigest`]: a parsed, validated digest string.
//! - [`HashingWriter`] / [`HashingReader`]: wrap an `impl Write`/`impl Read`
//!   and hash every byte that passes through.
//! - [`compute_file_digest`] / [`compute_bytes_digest`]: one-shot helpers.

use std::fmt;
use std::io::{Read, Write};
use std::path::Path;

use sha2::Digest;

pub use sha2::Sha256;

/// A type alias for the output of a SHA256 hash.
pub type Sha256Hash = sha2::digest::Output<Sha256>;

/// The algorithm prefix of the canonical digest string form.
const SHA256_PREFIX: &str = "sha256:";

/// An error that can occur when parsing a digest string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DigestError {
    /// The string does not start with a supported algorithm prefix.
    #[error("unsupported digest algorithm in {0:?}")]
    UnsupportedAlgorithm(String),

    /// The hex part of the digest has the wrong length or invalid characters.
    #[error("invalid digest encoding in {0:?}")]
    InvalidEncoding(String),
}

/// A validated SHA-256 content digest.
///
/// Serializes to and parses from the canonical `sha256:<64 hex chars>` form
/// used by layer manifests.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest(Sha256Hash);

impl ContentDigest {
    /// Parses a digest from its canonical `sha256:<hex>` string form.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        let hex_part = s
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| DigestError::UnsupportedAlgorithm(s.to_owned()))?;
        let mut hash = Sha256Hash::default();
        if hex_part.len() != hash.len() * 2 {
            return Err(DigestError::InvalidEncoding(s.to_owned()));
        }
        hex::decode_to_slice(hex_part, &mut hash)
            .map_err(|_| DigestError::InvalidEncoding(s.to_owned()))?;
        Ok(Self(hash))
    }

    /// Returns the digest for the given raw hash output.
    pub fn from_hash(hash: Sha256Hash) -> Self {
        Self(hash)
    }

    /// Returns the raw hash bytes.
    pub fn hash(&self) -> &Sha256Hash {
        &self.0
    }

    /// Returns the hex part of the digest, without the algorithm prefix.
    pub fn encoded(&self) -> String {
        format!("{:x}", self.0)
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SHA256_PREFIX}{:x}", self.0)
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl std::str::FromStr for ContentDigest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for ContentDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ContentDigest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Compute the digest of the file at the specified location.
pub fn compute_file_digest(path: impl AsRef<Path>) -> Result<ContentDigest, std::io::Error> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(ContentDigest::from_hash(hasher.finalize()))
}

/// Compute the digest of the specified bytes.
pub fn compute_bytes_digest(bytes: impl AsRef<[u8]>) -> ContentDigest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentDigest::from_hash(hasher.finalize())
}

/// A simple object that provides a [`Write`] implementation that also
/// immediately hashes the bytes written to it. Call [`HashingWriter::finalize`]
/// to retrieve both the original `impl Write` object as well as the digest.
pub struct HashingWriter<W> {
    writer: W,
    hasher: Sha256,
}

impl<W> HashingWriter<W> {
    /// Constructs a new instance from a writer and a new (empty) hasher.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Sha256::new(),
        }
    }

    /// Consumes this instance and returns the original writer and the digest of
    /// all bytes written to this instance.
    pub fn finalize(self) -> (W, ContentDigest) {
        (self.writer, ContentDigest::from_hash(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes = self.writer.write(buf)?;
        self.hasher.update(&buf[..bytes]);
        Ok(bytes)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// A simple object that provides a [`Read`] implementation that also
/// immediately hashes the bytes read from it. Call [`HashingReader::finalize`]
/// to retrieve both the original `impl Read` object as well as the digest.
pub struct HashingReader<R> {
    reader: R,
    hasher: Sha256,
}

impl<R> HashingReader<R> {
    /// Constructs a new instance from a reader and a new (empty) hasher.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: Sha256::new(),
        }
    }

    /// Consumes this instance and returns the original reader and the digest of
    /// all bytes read from this instance.
    pub fn finalize(self) -> (R, ContentDigest) {
        (self.reader, ContentDigest::from_hash(self.hasher.finalize()))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes_read = self.reader.read(buf)?;
        self.hasher.update(&buf[..bytes_read]);
        Ok(bytes_read)
    }
}
