//! Manifest generation.
//!
//! A [`Creator`] holds the image and output it was built with. Every
//! [`Creator::generate`] call opens the image again, queries its extents,
//! checksums the mapped ranges and rewrites the output from scratch, so
//! repeated calls produce the same bytes.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::config::{filesystem_block_size, validate_block_size, Config};
use crate::error::{BmapError, Result};
use crate::extent::ExtentMapper;
use crate::hash::{ChecksumType, Hasher};
use crate::manifest::{Manifest, MappedRange};
use crate::range::{blocks_for, BlockRange, ExtentSet};
use crate::source::content_len;

/// Image a manifest is generated for.
#[derive(Debug)]
pub enum ImageInput {
    /// Opened afresh for every generation.
    Path(PathBuf),
    /// An open handle. It is duplicated, never moved.
    File(File),
}

impl From<PathBuf> for ImageInput {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<File> for ImageInput {
    fn from(file: File) -> Self {
        Self::File(file)
    }
}

/// Where a generated manifest is written.
#[derive(Debug)]
pub enum ManifestOutput {
    /// Created or truncated on every generation.
    Path(PathBuf),
    /// Rewound and truncated on every generation.
    File(File),
}

impl From<PathBuf> for ManifestOutput {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<File> for ManifestOutput {
    fn from(file: File) -> Self {
        Self::File(file)
    }
}

impl ManifestOutput {
    fn write(&mut self, manifest: &Manifest) -> Result<()> {
        match self {
            Self::Path(path) => {
                let mut file = File::create(&*path).map_err(BmapError::DestinationUnwritable)?;
                manifest.write_to(&mut file)
            }
            Self::File(file) => {
                file.seek(SeekFrom::Start(0))
                    .and_then(|_| file.set_len(0))
                    .map_err(BmapError::DestinationUnwritable)?;
                manifest.write_to(file)
            }
        }
    }
}

/// Generates bmap manifests for one image.
///
/// # Example
///
/// ```rust,no_run
/// use bmapcopy::{Creator, ImageInput, ManifestOutput};
///
/// let mut creator = Creator::new(
///     ImageInput::Path("disk.img".into()),
///     ManifestOutput::Path("disk.img.bmap".into()),
/// );
/// let manifest = creator.generate()?;
/// println!("{} of {} blocks mapped", manifest.mapped_blocks_count(), manifest.blocks_count());
/// # Ok::<(), bmapcopy::BmapError>(())
/// ```
#[derive(Debug)]
pub struct Creator {
    image: ImageInput,
    output: ManifestOutput,
    config: Config,
}

impl Creator {
    /// Create a generator with default configuration.
    #[must_use]
    pub fn new(image: ImageInput, output: ManifestOutput) -> Self {
        Self::with_config(image, output, Config::default())
    }

    /// Create a generator with custom configuration.
    #[must_use]
    pub const fn with_config(image: ImageInput, output: ManifestOutput, config: Config) -> Self {
        Self {
            image,
            output,
            config,
        }
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Build the manifest without writing it anywhere.
    ///
    /// # Errors
    ///
    /// Returns `SourceUnreadable` if the image cannot be opened or read,
    /// `ShortRead` if it shrinks while being read, and `InvalidBlockSize`
    /// for a bad configured block size.
    pub fn build(&self) -> Result<Manifest> {
        BuildOperation::start(&self.image, &self.config)?.run()
    }

    /// Build the manifest and write it to the output.
    ///
    /// # Errors
    ///
    /// As [`Creator::build`], plus `DestinationUnwritable` if the output
    /// cannot be written.
    pub fn generate(&mut self) -> Result<Manifest> {
        let manifest = self.build()?;
        self.output.write(&manifest)?;
        info!(
            image_size = manifest.image_size(),
            block_size = manifest.block_size(),
            mapped_blocks = manifest.mapped_blocks_count(),
            blocks = manifest.blocks_count(),
            ranges = manifest.ranges().len(),
            "Manifest written"
        );
        Ok(manifest)
    }
}

/// State of one generation, dropped when it returns.
struct BuildOperation {
    image: File,
    image_size: u64,
    block_size: u64,
    extents: ExtentSet,
    checksum_type: ChecksumType,
    aggregate: Hasher,
    buffer: Vec<u8>,
}

impl BuildOperation {
    fn start(input: &ImageInput, config: &Config) -> Result<Self> {
        let image = match input {
            ImageInput::Path(path) => File::open(path)
                .map_err(|e| BmapError::unreadable(format!("image {}", path.display()), e))?,
            ImageInput::File(file) => file
                .try_clone()
                .map_err(|e| BmapError::unreadable("image handle", e))?,
        };
        let metadata = image
            .metadata()
            .map_err(|e| BmapError::unreadable("image metadata", e))?;

        let block_size = match config.block_size {
            Some(size) => {
                validate_block_size(size)?;
                size
            }
            None => filesystem_block_size(&metadata),
        };
        let image_size =
            content_len(&image).map_err(|e| BmapError::unreadable("image size", e))?;
        let blocks_count = blocks_for(image_size, block_size);

        let extents = match ExtentMapper::from_file(&image, Some(block_size)) {
            Ok(mapper) => mapper.extent_set()?,
            Err(BmapError::UnsupportedExtentQuery(reason)) => {
                warn!(%reason, "Extent query unsupported, treating the whole image as mapped");
                ExtentSet::full(blocks_count)
            }
            Err(e) => return Err(e),
        };
        debug!(
            image_size,
            block_size,
            mapped_blocks = extents.mapped_blocks(),
            ranges = extents.ranges().len(),
            "Extents resolved"
        );

        Ok(Self {
            image,
            image_size,
            block_size,
            extents,
            checksum_type: config.checksum_type,
            aggregate: config.checksum_type.hasher(),
            buffer: vec![0u8; config.buffer_size.max(1)],
        })
    }

    fn run(mut self) -> Result<Manifest> {
        let extents = std::mem::take(&mut self.extents);
        let ranges = extents
            .ranges()
            .iter()
            .map(|&range| self.checksum_range(range))
            .collect::<Result<Vec<_>>>()?;

        Manifest::new(
            self.image_size,
            self.block_size,
            self.checksum_type,
            ranges,
            self.aggregate.finalize(),
        )
    }

    fn checksum_range(&mut self, range: BlockRange) -> Result<MappedRange> {
        let offset = range.byte_start(self.block_size);
        let expected = range.byte_len(self.block_size, self.image_size);

        self.image
            .seek(SeekFrom::Start(offset))
            .map_err(|e| BmapError::unreadable("image", e))?;

        let mut hasher = self.checksum_type.hasher();
        let mut done = 0u64;
        while done < expected {
            let want = usize::try_from(expected - done)
                .map_or(self.buffer.len(), |left| left.min(self.buffer.len()));
            let n = match self.image.read(&mut self.buffer[..want]) {
                Ok(0) => {
                    return Err(BmapError::ShortRead {
                        offset,
                        expected,
                        actual: done,
                    })
                }
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(BmapError::unreadable("image", e)),
            };
            hasher.update(&self.buffer[..n]);
            self.aggregate.update(&self.buffer[..n]);
            done += n as u64;
        }

        Ok(MappedRange {
            range,
            checksum: hasher.finalize(),
        })
    }
}
