//! Manifest-guided image copying.
//!
//! Each [`Copier::copy`] call resolves a plan, then transfers:
//!
//! - **Manifest**: only the ranges listed in the manifest are read, verified
//!   against their checksums when asked to.
//! - **Extents**: no manifest, but the source is a file whose extents can be
//!   queried. Only mapped ranges are read.
//! - **Linear**: anything else, including every stream without a manifest.
//!   All bytes are copied.
//!
//! Gaps between mapped ranges are either left as holes or filled with zeros.
//! Streams are read strictly forward; bytes before a range are skipped.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use tracing::{debug, info};

use crate::config::{filesystem_block_size, Config, FALLBACK_BLOCK_SIZE};
use crate::error::{BmapError, Result};
use crate::extent::ExtentMapper;
use crate::hash::{ChecksumType, Digest, Hasher};
use crate::manifest::Manifest;
use crate::range::{blocks_for, BlockRange, ExtentSet};
use crate::source::{Destination, ManifestInput, OpenSource, Source, SourceSlot};

/// Outcome of one copy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CopyStats {
    /// Final size of the destination.
    pub image_size: u64,
    /// Bytes read from the source and written to the destination.
    pub bytes_copied: u64,
    /// Blocks covered by the copied ranges.
    pub blocks_copied: u64,
    /// Number of ranges copied.
    pub ranges_copied: u64,
    /// Number of unmapped gaps recreated in the destination.
    pub holes: u64,
    /// Every range and the image checksum matched the manifest.
    pub verified: bool,
    /// Digest of the whole destination content, holes read as zeros.
    ///
    /// Only computed when verifying. Hole bytes are hashed too, so on a
    /// mostly empty image this costs a hash pass over the full logical
    /// size even though only the mapped bytes are read and written.
    pub image_digest: Option<Digest>,
}

/// Copies an image to a destination, guided by a manifest when one is given.
///
/// # Example
///
/// ```rust,no_run
/// use bmapcopy::{Copier, Destination, ManifestInput, Source};
///
/// let mut copier = Copier::new(
///     Source::Path("disk.img".into()),
///     Destination::Path("/dev/sdX".into()),
///     Some(ManifestInput::Path("disk.img.bmap".into())),
/// )?;
/// let stats = copier.copy(true, true)?;
/// copier.sync()?;
/// println!("copied {} bytes", stats.bytes_copied);
/// # Ok::<(), bmapcopy::BmapError>(())
/// ```
pub struct Copier {
    source: SourceSlot,
    destination: File,
    destination_name: String,
    /// Block devices can be neither truncated nor extended.
    resizable: bool,
    manifest: Option<Manifest>,
    config: Config,
}

impl std::fmt::Debug for Copier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Copier")
            .field("source", &self.source.kind())
            .field("destination", &self.destination_name)
            .field("manifest", &self.manifest.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl Copier {
    /// Create a copier with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `ManifestFormat` or `SourceUnreadable` if the manifest cannot
    /// be loaded, and `DestinationUnwritable` if a destination path cannot be
    /// opened.
    pub fn new(
        source: Source,
        destination: Destination,
        manifest: Option<ManifestInput>,
    ) -> Result<Self> {
        Self::with_config(source, destination, manifest, Config::default())
    }

    /// Create a copier with custom configuration.
    ///
    /// # Errors
    ///
    /// Same as [`Copier::new`].
    pub fn with_config(
        source: Source,
        destination: Destination,
        manifest: Option<ManifestInput>,
        config: Config,
    ) -> Result<Self> {
        let manifest = manifest.map(ManifestInput::load).transpose()?;
        let (destination, destination_name) = destination.open()?;
        let resizable = destination
            .metadata()
            .map_err(BmapError::DestinationUnwritable)?
            .is_file();

        Ok(Self {
            source: source.into(),
            destination,
            destination_name,
            resizable,
            manifest,
            config,
        })
    }

    /// The parsed manifest, if any.
    #[must_use]
    pub const fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Copy the image.
    ///
    /// With `create_holes` unmapped gaps are left unwritten; otherwise they
    /// are filled with zeros. With `verify` every range is checked against
    /// the manifest, and the whole-image digest is reported in the stats.
    ///
    /// # Errors
    ///
    /// - `SourceUnreadable` if the source cannot be opened or read, including
    ///   a stream that was already consumed by an earlier copy
    /// - `ShortRead` if the source ends early
    /// - `Integrity` / `ImageIntegrity` on a checksum mismatch
    /// - `DestinationUnwritable` if the destination cannot be written
    ///
    /// On error the destination is left partially written.
    pub fn copy(&mut self, create_holes: bool, verify: bool) -> Result<CopyStats> {
        debug!(
            source = self.source.kind(),
            destination = %self.destination_name,
            create_holes,
            verify,
            "Resolving copy plan"
        );
        let source = self.source.open()?;
        let plan = Plan::resolve(self.manifest.as_ref(), &source, &self.config)?;

        if self.resizable {
            self.destination
                .set_len(0)
                .map_err(BmapError::DestinationUnwritable)?;
        }
        self.destination
            .seek(SeekFrom::Start(0))
            .map_err(BmapError::DestinationUnwritable)?;

        debug!(plan = plan.name(), "Transferring");
        let mut op = CopyOperation::new(
            source,
            &mut self.destination,
            self.resizable,
            create_holes,
            verify,
            plan.checksum_type(&self.config),
            self.config.buffer_size,
        );

        let result = match &plan {
            Plan::Manifest(manifest) => op.copy_manifest(manifest),
            Plan::Extents {
                set,
                image_size,
                block_size,
            } => op.copy_extents(set, *block_size, *image_size),
            Plan::Linear { block_size } => op.copy_linear(*block_size),
        };
        if let Err(e) = &result {
            debug!(error = %e, "Copy failed");
        }
        result?;

        debug!("Finalizing");
        let stats = op.finish()?;
        info!(
            plan = plan.name(),
            image_size = stats.image_size,
            bytes_copied = stats.bytes_copied,
            ranges = stats.ranges_copied,
            holes = stats.holes,
            verified = stats.verified,
            "Copy complete"
        );
        Ok(stats)
    }

    /// Flush destination data and metadata to stable storage.
    ///
    /// # Errors
    ///
    /// Returns `SyncFailed` if the flush fails.
    pub fn sync(&mut self) -> Result<()> {
        self.destination
            .flush()
            .and_then(|()| self.destination.sync_all())
            .map_err(BmapError::SyncFailed)
    }
}

/// How the bytes of one copy are chosen.
enum Plan<'m> {
    Manifest(&'m Manifest),
    Extents {
        set: ExtentSet,
        image_size: u64,
        block_size: u64,
    },
    Linear {
        block_size: u64,
    },
}

impl<'m> Plan<'m> {
    fn resolve(manifest: Option<&'m Manifest>, source: &OpenSource, config: &Config) -> Result<Self> {
        if let Some(manifest) = manifest {
            return Ok(Self::Manifest(manifest));
        }

        let Some(file) = source.file() else {
            return Ok(Self::Linear {
                block_size: config.block_size.unwrap_or(FALLBACK_BLOCK_SIZE),
            });
        };

        match ExtentMapper::from_file(file, config.block_size) {
            Ok(mapper) => Ok(Self::Extents {
                set: mapper.extent_set()?,
                image_size: mapper.image_size(),
                block_size: mapper.block_size(),
            }),
            Err(BmapError::UnsupportedExtentQuery(reason)) => {
                debug!(%reason, "No extent query on source, copying linearly");
                let block_size = match config.block_size {
                    Some(size) => size,
                    None => file
                        .metadata()
                        .map_or(FALLBACK_BLOCK_SIZE, |m| filesystem_block_size(&m)),
                };
                Ok(Self::Linear { block_size })
            }
            Err(e) => Err(e),
        }
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::Manifest(_) => "manifest",
            Self::Extents { .. } => "extents",
            Self::Linear { .. } => "linear",
        }
    }

    /// The manifest's own algorithm wins over the configured one.
    fn checksum_type(&self, config: &Config) -> ChecksumType {
        match self {
            Self::Manifest(manifest) => manifest.checksum_type(),
            _ => config.checksum_type,
        }
    }
}

/// State of one copy, dropped when it returns.
struct CopyOperation<'d> {
    source: OpenSource,
    destination: &'d mut File,
    resizable: bool,
    create_holes: bool,
    verify: bool,
    checksum_type: ChecksumType,
    buffer: Vec<u8>,
    /// Destination offset up to which content is settled.
    cursor: u64,
    image_hasher: Option<Hasher>,
    stats: CopyStats,
}

impl<'d> CopyOperation<'d> {
    fn new(
        source: OpenSource,
        destination: &'d mut File,
        resizable: bool,
        create_holes: bool,
        verify: bool,
        checksum_type: ChecksumType,
        buffer_size: usize,
    ) -> Self {
        Self {
            source,
            destination,
            resizable,
            create_holes,
            verify,
            checksum_type,
            buffer: vec![0u8; buffer_size.max(1)],
            cursor: 0,
            image_hasher: verify.then(|| checksum_type.hasher()),
            stats: CopyStats::default(),
        }
    }

    fn copy_manifest(&mut self, manifest: &Manifest) -> Result<()> {
        let aggregate = self.verify.then(|| manifest.checksum_type().hasher());
        let ranges = manifest
            .ranges()
            .iter()
            .map(|mapped| (mapped.range, Some(&mapped.checksum)));

        let actual = self.copy_mapped(
            ranges,
            manifest.block_size(),
            manifest.image_size(),
            aggregate,
        )?;

        if let Some(actual) = actual {
            let expected = manifest.image_checksum();
            if !actual.ct_eq(expected) {
                return Err(BmapError::ImageIntegrity {
                    expected: expected.clone(),
                    actual,
                });
            }
            self.stats.verified = true;
        }
        Ok(())
    }

    fn copy_extents(&mut self, set: &ExtentSet, block_size: u64, image_size: u64) -> Result<()> {
        let ranges = set.ranges().iter().map(|&range| (range, None));
        self.copy_mapped(ranges, block_size, image_size, None)?;
        Ok(())
    }

    /// Copy mapped ranges in ascending order, recreating the gaps, and
    /// return the aggregate digest when a hasher for it was given.
    fn copy_mapped<'r, I>(
        &mut self,
        ranges: I,
        block_size: u64,
        image_size: u64,
        mut aggregate: Option<Hasher>,
    ) -> Result<Option<Digest>>
    where
        I: Iterator<Item = (BlockRange, Option<&'r Digest>)>,
    {
        for (range, expected) in ranges {
            let start = range.byte_start(block_size);
            let end = range.byte_end(block_size, image_size);
            if start >= end {
                continue;
            }

            self.fill_gap(start)?;
            let check = expected.filter(|_| self.verify);
            let actual = self.copy_range(start, end, check.is_some(), aggregate.as_mut())?;

            if let (Some(expected), Some(actual)) = (check, actual) {
                if !actual.ct_eq(expected) {
                    return Err(BmapError::Integrity {
                        range,
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
            self.stats.ranges_copied += 1;
            self.stats.blocks_copied += range.len();
        }

        self.fill_gap(image_size)?;
        self.stats.image_size = image_size;
        Ok(aggregate.map(Hasher::finalize))
    }

    fn copy_linear(&mut self, block_size: u64) -> Result<()> {
        self.source
            .seek_to(0)
            .map_err(|e| BmapError::unreadable("source", e))?;

        let mut total = 0u64;
        loop {
            let n = self
                .source
                .read_full(&mut self.buffer)
                .map_err(|e| BmapError::unreadable("source", e))?;
            if n == 0 {
                break;
            }
            let chunk = &self.buffer[..n];
            if let Some(hasher) = self.image_hasher.as_mut() {
                hasher.update(chunk);
            }
            self.destination
                .write_all(chunk)
                .map_err(BmapError::DestinationUnwritable)?;
            total += n as u64;
            if n < self.buffer.len() {
                break;
            }
        }

        self.cursor = total;
        self.stats.image_size = total;
        self.stats.bytes_copied = total;
        self.stats.blocks_copied = blocks_for(total, block_size);
        self.stats.ranges_copied = u64::from(total > 0);
        Ok(())
    }

    /// Copy `[start, end)` from source to destination at the same offset.
    /// Returns the range digest when `hash_range` is set.
    fn copy_range(
        &mut self,
        start: u64,
        end: u64,
        hash_range: bool,
        mut aggregate: Option<&mut Hasher>,
    ) -> Result<Option<Digest>> {
        let expected = end - start;

        let reached = self
            .source
            .seek_to(start)
            .map_err(|e| BmapError::unreadable("source", e))?;
        if reached < start {
            return Err(BmapError::ShortRead {
                offset: start,
                expected,
                actual: 0,
            });
        }
        self.destination
            .seek(SeekFrom::Start(start))
            .map_err(BmapError::DestinationUnwritable)?;

        let mut hasher = hash_range.then(|| self.checksum_type.hasher());
        let mut done = 0u64;
        while done < expected {
            let want = usize::try_from(expected - done)
                .map_or(self.buffer.len(), |left| left.min(self.buffer.len()));
            let n = self
                .source
                .read_full(&mut self.buffer[..want])
                .map_err(|e| BmapError::unreadable("source", e))?;

            let chunk = &self.buffer[..n];
            for h in [hasher.as_mut(), aggregate.as_deref_mut(), self.image_hasher.as_mut()]
                .into_iter()
                .flatten()
            {
                h.update(chunk);
            }
            self.destination
                .write_all(chunk)
                .map_err(BmapError::DestinationUnwritable)?;
            done += n as u64;

            if n < want {
                return Err(BmapError::ShortRead {
                    offset: start,
                    expected,
                    actual: done,
                });
            }
        }

        self.cursor = end;
        self.stats.bytes_copied += expected;
        Ok(hasher.map(Hasher::finalize))
    }

    /// Settle the destination up to `to` without source data.
    fn fill_gap(&mut self, to: u64) -> Result<()> {
        if to <= self.cursor {
            return Ok(());
        }
        let len = to - self.cursor;

        if let Some(hasher) = self.image_hasher.as_mut() {
            hasher.update_zeros(len);
        }

        if !self.create_holes {
            self.destination
                .seek(SeekFrom::Start(self.cursor))
                .map_err(BmapError::DestinationUnwritable)?;
            self.buffer.fill(0);
            let mut left = len;
            while left > 0 {
                let n = usize::try_from(left).map_or(self.buffer.len(), |l| l.min(self.buffer.len()));
                self.destination
                    .write_all(&self.buffer[..n])
                    .map_err(BmapError::DestinationUnwritable)?;
                left -= n as u64;
            }
        }

        self.stats.holes += 1;
        self.cursor = to;
        Ok(())
    }

    /// Set the destination length and hand back the statistics.
    fn finish(mut self) -> Result<CopyStats> {
        if self.resizable {
            self.destination
                .set_len(self.stats.image_size)
                .map_err(BmapError::DestinationUnwritable)?;
        }
        self.destination
            .flush()
            .map_err(BmapError::DestinationUnwritable)?;

        self.stats.image_digest = self.image_hasher.take().map(Hasher::finalize);
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::create::{Creator, ImageInput, ManifestOutput};
    use crate::manifest::MappedRange;
    use std::io::{Cursor, Read};

    const BS: u64 = 1024;

    struct Fixture {
        dir: tempfile::TempDir,
        data: Vec<u8>,
    }

    impl Fixture {
        /// Image of `blocks` blocks where `data_blocks` hold a pattern and
        /// the rest is left as holes.
        fn new(blocks: u64, data_blocks: &[(u64, u64)]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let size = blocks * BS;
            let mut data = vec![0u8; size as usize];
            let mut file = File::create(dir.path().join("image")).unwrap();
            file.set_len(size).unwrap();
            for &(start, end) in data_blocks {
                let from = (start * BS) as usize;
                let to = (end * BS) as usize;
                for (i, byte) in data[from..to].iter_mut().enumerate() {
                    *byte = ((from + i) % 251) as u8 + 1;
                }
                file.seek(SeekFrom::Start(start * BS)).unwrap();
                file.write_all(&data[from..to]).unwrap();
            }
            file.sync_all().unwrap();
            Self { dir, data }
        }

        fn image(&self) -> std::path::PathBuf {
            self.dir.path().join("image")
        }

        fn dest(&self) -> std::path::PathBuf {
            self.dir.path().join("dest")
        }

        fn config(&self) -> Config {
            ConfigBuilder::new().block_size(BS).build()
        }

        fn manifest(&self) -> Manifest {
            Creator::with_config(
                ImageInput::Path(self.image()),
                ManifestOutput::Path(self.dir.path().join("image.bmap")),
                self.config(),
            )
            .build()
            .unwrap()
        }

        fn copier(&self, source: Source, manifest: Option<Manifest>) -> Copier {
            Copier::with_config(
                source,
                Destination::Path(self.dest()),
                manifest.map(ManifestInput::Parsed),
                self.config(),
            )
            .unwrap()
        }

        fn dest_bytes(&self) -> Vec<u8> {
            std::fs::read(self.dest()).unwrap()
        }
    }

    // ==========================================================================
    // MANIFEST PLAN
    // ==========================================================================

    #[test]
    fn manifest_copy_reproduces_content() {
        let fx = Fixture::new(64, &[(4, 20), (40, 64)]);
        let manifest = fx.manifest();
        let mut copier = fx.copier(Source::Path(fx.image()), Some(manifest.clone()));

        let stats = copier.copy(true, true).unwrap();
        assert_eq!(fx.dest_bytes(), fx.data);
        assert_eq!(stats.image_size, 64 * BS);
        assert_eq!(stats.bytes_copied, manifest.mapped_bytes());
        assert_eq!(stats.blocks_copied, manifest.mapped_blocks_count());
        assert!(stats.verified);
        assert_eq!(
            stats.image_digest,
            Some(ChecksumType::Sha256.digest(&fx.data))
        );
    }

    #[test]
    fn copy_without_holes_writes_zeros() {
        let fx = Fixture::new(32, &[(8, 16)]);
        let manifest = fx.manifest();
        let mut copier = fx.copier(Source::Path(fx.image()), Some(manifest));

        let stats = copier.copy(false, false).unwrap();
        assert_eq!(fx.dest_bytes(), fx.data);
        assert!(!stats.verified);
        assert!(stats.image_digest.is_none());
    }

    #[test]
    fn stale_destination_content_is_cleared() {
        let fx = Fixture::new(16, &[(0, 4)]);
        std::fs::write(fx.dest(), vec![0xFFu8; 64 * 1024]).unwrap();

        let manifest = fx.manifest();
        let mut copier = fx.copier(Source::Path(fx.image()), Some(manifest));
        copier.copy(true, false).unwrap();

        assert_eq!(fx.dest_bytes(), fx.data);
    }

    #[test]
    fn copier_is_reusable() {
        let fx = Fixture::new(32, &[(2, 10), (20, 30)]);
        let manifest = fx.manifest();
        let image = File::open(fx.image()).unwrap();
        let mut copier = fx.copier(Source::File(image), Some(manifest));

        let first = copier.copy(true, true).unwrap();
        let second = copier.copy(true, true).unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.dest_bytes(), fx.data);
    }

    #[test]
    fn corrupted_source_fails_verification() {
        let fx = Fixture::new(32, &[(4, 12)]);
        let manifest = fx.manifest();

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(fx.image())
            .unwrap();
        file.seek(SeekFrom::Start(6 * BS + 17)).unwrap();
        file.write_all(&[0xEE]).unwrap();
        drop(file);

        let mut copier = fx.copier(Source::Path(fx.image()), Some(manifest));
        let err = copier.copy(true, true).unwrap_err();
        assert!(err.is_integrity());
        assert!(matches!(err, BmapError::Integrity { .. }));

        // Without verification the corrupted bytes are copied as they are
        assert!(copier.copy(true, false).is_ok());
    }

    #[test]
    fn wrong_image_checksum_fails_verification() {
        let fx = Fixture::new(16, &[(0, 8)]);
        let good = fx.manifest();
        let bad = Manifest::new(
            good.image_size(),
            good.block_size(),
            good.checksum_type(),
            good.ranges().to_vec(),
            good.checksum_type().digest(b"not the image"),
        )
        .unwrap();

        let mut copier = fx.copier(Source::Path(fx.image()), Some(bad));
        assert!(matches!(
            copier.copy(true, true),
            Err(BmapError::ImageIntegrity { .. })
        ));
    }

    #[test]
    fn truncated_source_is_short_read() {
        let fx = Fixture::new(16, &[(0, 16)]);
        let manifest = fx.manifest();
        File::options()
            .write(true)
            .open(fx.image())
            .unwrap()
            .set_len(10 * BS)
            .unwrap();

        let mut copier = fx.copier(Source::Path(fx.image()), Some(manifest));
        let err = copier.copy(true, false).unwrap_err();
        assert!(matches!(
            err,
            BmapError::ShortRead {
                offset: 0,
                expected,
                actual,
            } if expected == 16 * BS && actual == 10 * BS
        ));
    }

    // ==========================================================================
    // STREAM SOURCES
    // ==========================================================================

    #[test]
    fn stream_with_manifest() {
        let fx = Fixture::new(48, &[(5, 9), (30, 40)]);
        let manifest = fx.manifest();
        let stream = Source::stream(Cursor::new(fx.data.clone()));
        let mut copier = fx.copier(stream, Some(manifest));

        let stats = copier.copy(true, true).unwrap();
        assert!(stats.verified);
        assert_eq!(fx.dest_bytes(), fx.data);
    }

    #[test]
    fn stream_without_manifest_is_linear() {
        let fx = Fixture::new(20, &[(3, 6)]);
        let stream = Source::stream(Cursor::new(fx.data.clone()));
        let mut copier = fx.copier(stream, None);

        let stats = copier.copy(true, true).unwrap();
        assert_eq!(fx.dest_bytes(), fx.data);
        assert_eq!(stats.image_size, 20 * BS);
        assert_eq!(stats.bytes_copied, 20 * BS);
        assert_eq!(stats.blocks_copied, 20);
        assert_eq!(stats.holes, 0);
        assert!(!stats.verified);
    }

    #[test]
    fn stream_is_consumed_once() {
        let fx = Fixture::new(4, &[(0, 4)]);
        let stream = Source::stream(Cursor::new(fx.data.clone()));
        let mut copier = fx.copier(stream, None);

        copier.copy(true, false).unwrap();
        assert!(matches!(
            copier.copy(true, false),
            Err(BmapError::SourceUnreadable { .. })
        ));
    }

    #[test]
    fn short_stream_with_manifest() {
        let fx = Fixture::new(32, &[(20, 30)]);
        let manifest = fx.manifest();
        let stream = Source::stream(Cursor::new(fx.data[..(10 * BS) as usize].to_vec()));
        let mut copier = fx.copier(stream, Some(manifest));

        assert!(matches!(
            copier.copy(true, false),
            Err(BmapError::ShortRead { .. })
        ));
    }

    // ==========================================================================
    // WITHOUT MANIFEST
    // ==========================================================================

    #[test]
    fn file_without_manifest() {
        let fx = Fixture::new(40, &[(0, 3), (25, 40)]);
        let mut copier = fx.copier(Source::Path(fx.image()), None);

        let stats = copier.copy(true, true).unwrap();
        assert_eq!(fx.dest_bytes(), fx.data);
        assert_eq!(stats.image_size, 40 * BS);
        assert!(!stats.verified);
    }

    #[cfg(unix)]
    #[test]
    fn pipe_without_manifest_is_linear() {
        let fx = Fixture::new(24, &[(2, 5), (20, 24)]);
        let fifo = fx.dir.path().join("pipe");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::S_IRWXU).unwrap();

        let writer = {
            let fifo = fifo.clone();
            let data = fx.data.clone();
            std::thread::spawn(move || {
                let mut pipe = File::options().write(true).open(fifo).unwrap();
                pipe.write_all(&data).unwrap();
            })
        };

        let stats = fx
            .copier(Source::Path(fifo), None)
            .copy(true, true)
            .unwrap();
        writer.join().unwrap();

        assert_eq!(fx.dest_bytes(), fx.data);
        assert_eq!(stats.image_size, 24 * BS);
        assert_eq!(stats.bytes_copied, 24 * BS);
        assert_eq!(
            stats.image_digest,
            Some(ChecksumType::Sha256.digest(&fx.data))
        );
    }

    #[cfg(unix)]
    #[test]
    fn device_without_extent_query_is_linear() {
        let fx = Fixture::new(1, &[]);
        std::fs::write(fx.dest(), b"stale destination bytes").unwrap();

        // A seekable character device: opened as a file, rejected by the
        // extent query, then copied linearly
        let stats = fx
            .copier(Source::Path("/dev/null".into()), None)
            .copy(true, true)
            .unwrap();

        assert_eq!(stats.image_size, 0);
        assert_eq!(stats.bytes_copied, 0);
        assert!(!stats.verified);
        assert_eq!(stats.image_digest, Some(ChecksumType::Sha256.digest(b"")));
        assert!(fx.dest_bytes().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn block_device_without_manifest_is_linear() {
        let Some(device) = crate::source::small_block_device(64 * 1024 * 1024) else {
            return;
        };
        let data = std::fs::read(&device).unwrap();
        let fx = Fixture::new(1, &[]);

        let stats = fx
            .copier(Source::Path(device), None)
            .copy(true, true)
            .unwrap();

        assert_eq!(stats.image_size, data.len() as u64);
        assert_eq!(stats.bytes_copied, data.len() as u64);
        assert_eq!(stats.image_digest, Some(ChecksumType::Sha256.digest(&data)));
        assert_eq!(fx.dest_bytes(), data);
    }

    #[test]
    fn image_digest_is_plan_independent() {
        let fx = Fixture::new(40, &[(1, 7), (22, 31)]);
        let manifest = fx.manifest();

        let with_manifest = fx
            .copier(Source::Path(fx.image()), Some(manifest))
            .copy(true, true)
            .unwrap();
        let with_extents = fx
            .copier(Source::Path(fx.image()), None)
            .copy(false, true)
            .unwrap();
        let linear = fx
            .copier(Source::stream(Cursor::new(fx.data.clone())), None)
            .copy(true, true)
            .unwrap();

        assert!(with_manifest.image_digest.is_some());
        assert_eq!(with_manifest.image_digest, with_extents.image_digest);
        assert_eq!(with_manifest.image_digest, linear.image_digest);
    }

    #[test]
    fn empty_image() {
        let fx = Fixture::new(0, &[]);
        let manifest = fx.manifest();
        assert!(manifest.ranges().is_empty());

        let stats = fx
            .copier(Source::Path(fx.image()), Some(manifest))
            .copy(true, true)
            .unwrap();
        assert_eq!(stats.image_size, 0);
        assert_eq!(stats.holes, 0);
        assert!(fx.dest_bytes().is_empty());
    }

    // ==========================================================================
    // CONSTRUCTION AND SYNC
    // ==========================================================================

    #[test]
    fn malformed_manifest_fails_construction() {
        let fx = Fixture::new(4, &[(0, 4)]);
        let bmap = fx.dir.path().join("bad.bmap");
        std::fs::write(&bmap, "<bmap version=\"1.0\"></bmap>").unwrap();

        let err = Copier::new(
            Source::Path(fx.image()),
            Destination::Path(fx.dest()),
            Some(ManifestInput::Path(bmap)),
        )
        .unwrap_err();
        assert!(matches!(err, BmapError::ManifestFormat(_)));
    }

    #[test]
    fn manifest_from_handle() {
        let fx = Fixture::new(8, &[(2, 5)]);
        let manifest = fx.manifest();
        let mut handle = tempfile::tempfile().unwrap();
        manifest.write_to(&mut handle).unwrap();

        let copier = Copier::new(
            Source::Path(fx.image()),
            Destination::Path(fx.dest()),
            Some(ManifestInput::File(handle)),
        )
        .unwrap();
        assert_eq!(copier.manifest(), Some(&manifest));
    }

    #[test]
    fn destination_handle_and_sync() {
        let fx = Fixture::new(8, &[(0, 8)]);
        let dest = tempfile::tempfile().unwrap();
        let mut copier = Copier::with_config(
            Source::Path(fx.image()),
            Destination::File(dest.try_clone().unwrap()),
            None,
            fx.config(),
        )
        .unwrap();

        copier.copy(true, false).unwrap();
        copier.sync().unwrap();

        let mut copied = Vec::new();
        let mut dest = dest;
        dest.seek(SeekFrom::Start(0)).unwrap();
        dest.read_to_end(&mut copied).unwrap();
        assert_eq!(copied, fx.data);
    }

    #[test]
    fn manifest_ranges_drive_the_copy() {
        // A manifest listing only part of the data copies only that part
        let fx = Fixture::new(16, &[(0, 16)]);
        let full = fx.manifest();
        let range = BlockRange::new(4, 8);
        let bytes = &fx.data[(4 * BS) as usize..(8 * BS) as usize];
        let partial = Manifest::new(
            full.image_size(),
            BS,
            ChecksumType::Sha256,
            vec![MappedRange {
                range,
                checksum: ChecksumType::Sha256.digest(bytes),
            }],
            ChecksumType::Sha256.digest(bytes),
        )
        .unwrap();

        let stats = fx
            .copier(Source::Path(fx.image()), Some(partial))
            .copy(false, true)
            .unwrap();
        assert_eq!(stats.ranges_copied, 1);
        assert_eq!(stats.holes, 2);

        let copied = fx.dest_bytes();
        assert_eq!(copied.len(), fx.data.len());
        assert!(copied[..(4 * BS) as usize].iter().all(|&b| b == 0));
        assert_eq!(&copied[(4 * BS) as usize..(8 * BS) as usize], bytes);
        assert!(copied[(8 * BS) as usize..].iter().all(|&b| b == 0));
    }
}
