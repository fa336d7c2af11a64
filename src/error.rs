//! Error types for bmap generation and copying.

use thiserror::Error;

use crate::hash::Digest;
use crate::range::BlockRange;

/// Errors that can occur while generating a block map or copying an image.
#[derive(Error, Debug)]
pub enum BmapError {
    /// I/O error not attributable to a specific endpoint.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image or copy source cannot be opened or read.
    #[error("Cannot read {what}: {source}")]
    SourceUnreadable {
        /// Human readable description of the source.
        what: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file or filesystem does not support extent queries.
    #[error("Extent query unsupported: {0}")]
    UnsupportedExtentQuery(String),

    /// The manifest is malformed or uses an unrecognized format.
    #[error("Malformed bmap manifest: {0}")]
    ManifestFormat(String),

    /// Checksum of a copied range did not match the manifest.
    #[error("Checksum mismatch for blocks {range}: expected {expected}, got {actual}")]
    Integrity {
        /// Block range that failed verification.
        range: BlockRange,
        /// Checksum recorded in the manifest.
        expected: Digest,
        /// Checksum of the bytes actually read.
        actual: Digest,
    },

    /// Aggregate checksum over all mapped data did not match the manifest.
    #[error("Image checksum mismatch: expected {expected}, got {actual}")]
    ImageIntegrity {
        /// Aggregate checksum recorded in the manifest.
        expected: Digest,
        /// Aggregate checksum of the bytes actually read.
        actual: Digest,
    },

    /// The source ended before the expected number of bytes was read.
    #[error("Short read at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Byte offset where the read started.
        offset: u64,
        /// Number of bytes required.
        expected: u64,
        /// Number of bytes available.
        actual: u64,
    },

    /// The destination (image copy or manifest sink) cannot be written.
    #[error("Cannot write destination: {0}")]
    DestinationUnwritable(#[source] std::io::Error),

    /// Flushing the destination to stable storage failed.
    #[error("Cannot synchronize destination: {0}")]
    SyncFailed(#[source] std::io::Error),

    /// Invalid block size specified.
    #[error("Invalid block size: {0} (must be power of 2, 512-1048576)")]
    InvalidBlockSize(u64),
}

impl BmapError {
    pub(crate) fn unreadable(what: impl Into<String>, source: std::io::Error) -> Self {
        Self::SourceUnreadable {
            what: what.into(),
            source,
        }
    }

    /// Returns `true` for checksum mismatches of either kind.
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. } | Self::ImageIntegrity { .. })
    }
}

/// Result type for bmap operations.
pub type Result<T> = std::result::Result<T, BmapError>;
