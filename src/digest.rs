//! Content identity for change detection
//!
//! Files are identified by the SHA-256 digest of their bytes. Digests are
//! rendered as standard base64 in change logs.
//!
//! Hashing always streams: [`digest_reader`] consumes a reader with a fixed
//! buffer, and [`HashingReader`] hashes bytes as they are copied somewhere
//! else so archiving a file never reads it twice.

use crate::error::{BackupError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Size of the read buffer used when hashing
const BUFFER_SIZE: usize = 8192;

/// SHA-256 digest of a file's content
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Digest of an in-memory buffer
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Base64 rendering used in change logs
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Parse a base64 digest; `None` if malformed or of the wrong length
    pub fn from_base64(text: &str) -> Option<Self> {
        let bytes = STANDARD.decode(text).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.to_base64())
    }
}

/// Hash everything `reader` yields
pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<ContentDigest> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(ContentDigest(hasher.finalize().into()))
}

/// Hash a file's content
///
/// # Errors
///
/// - [`BackupError::IoAt`] if the file cannot be opened or read
pub fn hash_file(path: &Path) -> Result<ContentDigest> {
    let file = File::open(path).map_err(|e| BackupError::io_at(path, e))?;
    digest_reader(file).map_err(|e| BackupError::io_at(path, e))
}

/// Reader adapter that hashes the bytes passing through it
///
/// # Example
///
/// ```rust
/// use backline::digest::{ContentDigest, HashingReader};
/// use std::io::Read;
///
/// let mut reader = HashingReader::new(&b"hello"[..]);
/// let mut copy = Vec::new();
/// reader.read_to_end(&mut copy).unwrap();
/// let (digest, len) = reader.finish();
/// assert_eq!(len, 5);
/// assert_eq!(digest, ContentDigest::of(b"hello"));
/// ```
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    /// Wrap `inner`
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Digest and length of everything read so far
    pub fn finish(self) -> (ContentDigest, u64) {
        (ContentDigest(self.hasher.finalize().into()), self.bytes)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}
