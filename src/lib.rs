//! # bmapcopy
//!
//! Block-map generation and block-map guided copying of sparse disk images.
//!
//! A bmap manifest lists which blocks of an image hold data, with a checksum
//! per range. Copying with it skips the holes, recreates them in the
//! destination and verifies every range on the way.
//!
//! ## Features
//!
//! - **Extent queries**: data and holes found with `SEEK_DATA`/`SEEK_HOLE`
//! - **Deterministic manifests**: identical bytes for identical images
//! - **Verified copies**: per-range and whole-image checksums
//! - **Streams**: forward-only sources such as decompressors, with or
//!   without a manifest
//!
//! ## Example
//!
//! ```rust
//! use bmapcopy::{ConfigBuilder, Copier, Creator, Destination, ImageInput, ManifestInput,
//!     ManifestOutput, Source};
//! use std::io::{Seek, SeekFrom, Write};
//!
//! let dir = tempfile::tempdir()?;
//! let image = dir.path().join("disk.img");
//! let bmap = dir.path().join("disk.img.bmap");
//! let copy = dir.path().join("copy.img");
//!
//! // 1 MiB image with data only at the start and the end
//! let mut file = std::fs::File::create(&image)?;
//! file.set_len(1024 * 1024)?;
//! file.write_all(&[0xAB; 4096])?;
//! file.seek(SeekFrom::End(-4096))?;
//! file.write_all(&[0xCD; 4096])?;
//! file.sync_all()?;
//!
//! let config = ConfigBuilder::new().block_size(4096).build();
//! let manifest = Creator::with_config(
//!     ImageInput::Path(image.clone()),
//!     ManifestOutput::Path(bmap.clone()),
//!     config.clone(),
//! )
//! .generate()?;
//!
//! let mut copier = Copier::with_config(
//!     Source::Path(image.clone()),
//!     Destination::Path(copy.clone()),
//!     Some(ManifestInput::Path(bmap)),
//!     config,
//! )?;
//! let stats = copier.copy(true, true)?;
//!
//! assert!(stats.verified);
//! assert_eq!(stats.bytes_copied, manifest.mapped_bytes());
//! assert_eq!(std::fs::read(&copy)?, std::fs::read(&image)?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

mod config;
mod copy;
mod create;
mod error;
mod extent;
mod hash;
mod manifest;
mod range;
mod source;
mod sys;

pub use config::{
    filesystem_block_size, validate_block_size, Config, ConfigBuilder, FALLBACK_BLOCK_SIZE,
    MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
pub use copy::{Copier, CopyStats};
pub use create::{Creator, ImageInput, ManifestOutput};
pub use error::{BmapError, Result};
pub use extent::{ExtentMapper, MappedRanges, UnmappedRanges};
pub use hash::{ChecksumType, Digest, Hasher};
pub use manifest::{Manifest, MappedRange, FORMAT_VERSION};
pub use range::{blocks_for, BlockRange, ExtentSet, Holes};
pub use source::{Destination, ManifestInput, Source};
