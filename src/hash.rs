//! Content checksums for mapped ranges and whole images.
//!
//! The algorithm is a configuration value recorded in every manifest, so a
//! verifying reader never has to guess it. Each range gets a fresh hashing
//! context; nothing is shared between calls.

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use md5::Md5;
use sha2::{Digest as _, Sha256, Sha512};

use crate::error::{BmapError, Result};

/// Checksum algorithm used for a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChecksumType {
    /// SHA-256, 32-byte digests.
    #[default]
    Sha256,
    /// SHA-512, 64-byte digests.
    Sha512,
    /// BLAKE3, 32-byte digests.
    Blake3,
    /// MD5, 16-byte digests. Only useful for legacy tooling.
    Md5,
}

impl ChecksumType {
    /// All supported algorithms.
    pub const ALL: [Self; 4] = [Self::Sha256, Self::Sha512, Self::Blake3, Self::Md5];

    /// Identifier written to the manifest.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Blake3 => "blake3",
            Self::Md5 => "md5",
        }
    }

    /// Length of a digest in bytes.
    #[must_use]
    pub const fn digest_len(self) -> usize {
        match self {
            Self::Sha256 | Self::Blake3 => 32,
            Self::Sha512 => 64,
            Self::Md5 => 16,
        }
    }

    /// Start a new hashing context.
    #[must_use]
    pub fn hasher(self) -> Hasher {
        let state = match self {
            Self::Sha256 => HasherState::Sha256(Sha256::new()),
            Self::Sha512 => HasherState::Sha512(Sha512::new()),
            Self::Blake3 => HasherState::Blake3(Box::new(blake3::Hasher::new())),
            Self::Md5 => HasherState::Md5(Md5::new()),
        };
        Hasher { state }
    }

    /// Digest of a byte slice.
    ///
    /// # Example
    ///
    /// ```rust
    /// use bmapcopy::ChecksumType;
    ///
    /// let a = ChecksumType::Sha256.digest(b"hello world");
    /// let b = ChecksumType::Sha256.digest(b"hello world");
    /// assert_eq!(a, b);
    /// assert_eq!(a.as_bytes().len(), 32);
    /// ```
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Digest {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// Digest of everything a reader yields.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading fails.
    pub fn digest_reader<R: Read>(self, reader: &mut R) -> std::io::Result<Digest> {
        let mut hasher = self.hasher();
        let mut buffer = [0u8; 8192];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(hasher.finalize())
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumType {
    type Err = BmapError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| BmapError::ManifestFormat(format!("unknown checksum type {s:?}")))
    }
}

enum HasherState {
    Sha256(Sha256),
    Sha512(Sha512),
    Blake3(Box<blake3::Hasher>),
    Md5(Md5),
}

/// Incremental hashing context for one [`ChecksumType`].
pub struct Hasher {
    state: HasherState,
}

impl Hasher {
    /// Feed bytes into the context.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(h) => h.update(data),
            HasherState::Sha512(h) => h.update(data),
            HasherState::Blake3(h) => {
                h.update(data);
            }
            HasherState::Md5(h) => h.update(data),
        }
    }

    /// Feed `len` zero bytes into the context.
    pub fn update_zeros(&mut self, mut len: u64) {
        const ZEROS: [u8; 8192] = [0u8; 8192];
        while len > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let n = len.min(ZEROS.len() as u64) as usize;
            self.update(&ZEROS[..n]);
            len -= n as u64;
        }
    }

    /// Consume the context and produce the digest.
    #[must_use]
    pub fn finalize(self) -> Digest {
        let bytes = match self.state {
            HasherState::Sha256(h) => h.finalize().to_vec(),
            HasherState::Sha512(h) => h.finalize().to_vec(),
            HasherState::Blake3(h) => h.finalize().as_bytes().to_vec(),
            HasherState::Md5(h) => h.finalize().to_vec(),
        };
        Digest(bytes)
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ty = match self.state {
            HasherState::Sha256(_) => ChecksumType::Sha256,
            HasherState::Sha512(_) => ChecksumType::Sha512,
            HasherState::Blake3(_) => ChecksumType::Blake3,
            HasherState::Md5(_) => ChecksumType::Md5,
        };
        f.debug_struct("Hasher").field("type", &ty).finish()
    }
}

/// A finished checksum value.
///
/// Displays as lowercase hex, which is also the manifest representation.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Digest(Vec<u8>);

impl Digest {
    /// Create a digest from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse a hex string (either case).
    ///
    /// # Errors
    ///
    /// Returns `ManifestFormat` if the string is not valid hex.
    pub fn from_hex(text: &str) -> Result<Self> {
        let text = text.trim();
        hex::decode(text).map(Self).map_err(|e| {
            BmapError::ManifestFormat(format!("invalid checksum {text:?}: {e}"))
        })
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Digest length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the digest holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Constant-time equality comparison.
    #[must_use]
    pub fn ct_eq(&self, other: &Self) -> bool {
        if self.0.len() != other.0.len() {
            return false;
        }
        let mut result = 0u8;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            result |= a ^ b;
        }
        result == 0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_string();
        write!(f, "Digest({}...)", &hex[..hex.len().min(16)])
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
