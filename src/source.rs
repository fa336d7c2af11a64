//! Copy endpoints: where image bytes come from and where they go.
//!
//! A [`Source`] is one of a closed set of kinds. Per copy it is opened into an
//! `OpenSource`, the only surface the copier reads through. Streams report
//! themselves as not seekable and can only skip forward; files that cannot
//! seek, such as pipes, are read as streams too.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

use crate::error::{BmapError, Result};
use crate::manifest::Manifest;

/// Where the image is read from.
pub enum Source {
    /// A file opened afresh for every copy.
    Path(PathBuf),
    /// An open handle, rewound before every copy if it can seek.
    File(File),
    /// A forward-only byte stream such as a decompressor. Can be copied once.
    Stream(Box<dyn Read + Send>),
}

impl Source {
    /// Wrap any reader as a forward-only stream source.
    pub fn stream<R: Read + Send + 'static>(reader: R) -> Self {
        Self::Stream(Box::new(reader))
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::File(file) => f.debug_tuple("File").field(file).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<PathBuf> for Source {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<File> for Source {
    fn from(file: File) -> Self {
        Self::File(file)
    }
}

/// Where the image copy is written.
#[derive(Debug)]
pub enum Destination {
    /// Created if missing. Opened once, when the copier is built.
    Path(PathBuf),
    /// An open, writable handle.
    File(File),
}

impl Destination {
    pub(crate) fn open(self) -> Result<(File, String)> {
        match self {
            Self::Path(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .map_err(BmapError::DestinationUnwritable)?;
                Ok((file, path.display().to_string()))
            }
            Self::File(file) => Ok((file, "destination handle".to_string())),
        }
    }
}

impl From<PathBuf> for Destination {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<File> for Destination {
    fn from(file: File) -> Self {
        Self::File(file)
    }
}

/// Where the manifest comes from.
#[derive(Debug)]
pub enum ManifestInput {
    /// A manifest file on disk.
    Path(PathBuf),
    /// An open manifest handle, read from offset 0.
    File(File),
    /// An already parsed manifest.
    Parsed(Manifest),
}

impl ManifestInput {
    /// Load and parse the manifest.
    ///
    /// # Errors
    ///
    /// Returns `SourceUnreadable` if the manifest cannot be read and
    /// `ManifestFormat` if it does not parse.
    pub fn load(self) -> Result<Manifest> {
        match self {
            Self::Path(path) => {
                let mut file = File::open(&path).map_err(|e| {
                    BmapError::unreadable(format!("manifest {}", path.display()), e)
                })?;
                Manifest::read_from(&mut file)
            }
            Self::File(mut file) => {
                file.seek(SeekFrom::Start(0))
                    .map_err(|e| BmapError::unreadable("manifest handle", e))?;
                Manifest::read_from(&mut file)
            }
            Self::Parsed(manifest) => Ok(manifest),
        }
    }
}

impl From<Manifest> for ManifestInput {
    fn from(manifest: Manifest) -> Self {
        Self::Parsed(manifest)
    }
}

/// Byte length of an image file.
///
/// Block devices report a zero `st_size`, so anything that is not a regular
/// file is measured by seeking to its end. The offset is left at 0.
pub(crate) fn content_len(file: &File) -> io::Result<u64> {
    let metadata = file.metadata()?;
    if metadata.is_file() {
        return Ok(metadata.len());
    }
    let mut file = file;
    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(len)
}

/// Long-lived source held by a copier. A stream is taken on first use.
pub(crate) enum SourceSlot {
    Path(PathBuf),
    File(File),
    Stream(Option<Box<dyn Read + Send>>),
}

impl From<Source> for SourceSlot {
    fn from(source: Source) -> Self {
        match source {
            Source::Path(path) => Self::Path(path),
            Source::File(file) => Self::File(file),
            Source::Stream(reader) => Self::Stream(Some(reader)),
        }
    }
}

impl SourceSlot {
    /// Open the source for one copy.
    pub(crate) fn open(&mut self) -> Result<OpenSource> {
        match self {
            Self::Path(path) => {
                let file = File::open(&*path).map_err(|e| {
                    BmapError::unreadable(format!("source {}", path.display()), e)
                })?;
                Ok(OpenSource::from_file(file))
            }
            Self::File(file) => {
                let file = file
                    .try_clone()
                    .map_err(|e| BmapError::unreadable("source handle", e))?;
                let mut source = OpenSource::from_file(file);
                if source.is_seekable() {
                    source
                        .seek_to(0)
                        .map_err(|e| BmapError::unreadable("source handle", e))?;
                }
                Ok(source)
            }
            Self::Stream(reader) => {
                let reader = reader.take().ok_or_else(|| {
                    BmapError::unreadable(
                        "source stream",
                        io::Error::new(io::ErrorKind::UnexpectedEof, "stream already consumed"),
                    )
                })?;
                Ok(OpenSource::Stream { reader, pos: 0 })
            }
        }
    }

    pub(crate) const fn kind(&self) -> &'static str {
        match self {
            Self::Path(_) => "path",
            Self::File(_) => "handle",
            Self::Stream(_) => "stream",
        }
    }
}

/// A source opened for one copy.
pub(crate) enum OpenSource {
    File(File),
    Stream {
        reader: Box<dyn Read + Send>,
        pos: u64,
    },
}

impl OpenSource {
    /// Pipes, sockets and the like cannot seek and become streams.
    fn from_file(mut file: File) -> Self {
        if file.stream_position().is_ok() {
            Self::File(file)
        } else {
            Self::Stream {
                reader: Box::new(file),
                pos: 0,
            }
        }
    }

    pub(crate) const fn is_seekable(&self) -> bool {
        matches!(self, Self::File(_))
    }

    /// The underlying file, for extent queries.
    pub(crate) const fn file(&self) -> Option<&File> {
        match self {
            Self::File(file) => Some(file),
            Self::Stream { .. } => None,
        }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::File(file) => file.read(buf),
            Self::Stream { reader, pos } => {
                let n = reader.read(buf)?;
                *pos += n as u64;
                Ok(n)
            }
        }
    }

    /// Fill `buf` as far as the source allows. Returns less than `buf.len()`
    /// only at end of input.
    pub(crate) fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// Position the source at `offset` and return the position reached,
    /// which is short of `offset` only when a stream ends first. Streams can
    /// only move forward.
    pub(crate) fn seek_to(&mut self, offset: u64) -> io::Result<u64> {
        let current = match self {
            Self::File(file) => return file.seek(SeekFrom::Start(offset)),
            Self::Stream { pos, .. } => *pos,
        };
        let ahead = offset.checked_sub(current).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("cannot seek a stream back from {current} to {offset}"),
            )
        })?;
        let skipped = self.skip(ahead)?;
        Ok(current + skipped)
    }

    /// Discard up to `n` bytes, returning how many were skipped.
    pub(crate) fn skip(&mut self, n: u64) -> io::Result<u64> {
        match self {
            Self::File(file) => {
                let n = i64::try_from(n).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
                file.seek(SeekFrom::Current(n))?;
                Ok(n.unsigned_abs())
            }
            Self::Stream { reader, pos } => {
                let skipped = io::copy(&mut reader.by_ref().take(n), &mut io::sink())?;
                *pos += skipped;
                Ok(skipped)
            }
        }
    }
}

/// First readable block device in `/dev` holding between 1 byte and
/// `max_len` bytes. Usually only loop devices qualify, and only for root.
#[cfg(all(test, unix))]
pub(crate) fn small_block_device(max_len: u64) -> Option<PathBuf> {
    use std::os::unix::fs::FileTypeExt;

    let mut candidates: Vec<PathBuf> = std::fs::read_dir("/dev")
        .ok()?
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_block_device()))
        .map(|entry| entry.path())
        .collect();
    candidates.sort();

    candidates.into_iter().find(|path| {
        File::open(path)
            .and_then(|file| content_len(&file))
            .is_ok_and(|len| len > 0 && len <= max_len)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn stream_of(data: Vec<u8>) -> OpenSource {
        let mut slot = SourceSlot::from(Source::stream(Cursor::new(data)));
        slot.open().unwrap()
    }

    #[test]
    fn stream_reads_forward() {
        let mut source = stream_of((0..100u8).collect());
        assert!(!source.is_seekable());
        assert!(source.file().is_none());

        assert_eq!(source.seek_to(10).unwrap(), 10);
        let mut buf = [0u8; 5];
        assert_eq!(source.read_full(&mut buf).unwrap(), 5);
        assert_eq!(buf, [10, 11, 12, 13, 14]);

        assert_eq!(source.skip(80).unwrap(), 80);
        let mut rest = [0u8; 10];
        assert_eq!(source.read_full(&mut rest).unwrap(), 5);
        assert_eq!(&rest[..5], &[95, 96, 97, 98, 99]);
    }

    #[test]
    fn stream_cannot_seek_backwards() {
        let mut source = stream_of(vec![0u8; 50]);
        source.seek_to(20).unwrap();
        let err = source.seek_to(10).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn stream_seek_past_end() {
        let mut source = stream_of(vec![0u8; 50]);
        assert_eq!(source.seek_to(60).unwrap(), 50);
    }

    #[test]
    fn stream_consumed_once() {
        let mut slot = SourceSlot::from(Source::stream(Cursor::new(vec![1u8; 10])));
        assert_eq!(slot.kind(), "stream");
        assert!(slot.open().is_ok());
        assert!(matches!(
            slot.open(),
            Err(BmapError::SourceUnreadable { .. })
        ));
    }

    #[test]
    fn handle_source_is_rewound() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"hello world").unwrap();

        let mut slot = SourceSlot::from(Source::File(file));
        for _ in 0..2 {
            let mut source = slot.open().unwrap();
            assert!(source.is_seekable());
            let mut buf = [0u8; 5];
            source.read_full(&mut buf).unwrap();
            assert_eq!(&buf, b"hello");
        }
    }

    #[test]
    fn file_source_seek_and_skip() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();

        let mut source = SourceSlot::from(Source::File(file)).open().unwrap();
        assert_eq!(source.seek_to(3).unwrap(), 3);
        assert_eq!(source.skip(2).unwrap(), 2);
        let mut buf = [0u8; 3];
        source.read_full(&mut buf).unwrap();
        assert_eq!(&buf, b"567");
    }

    #[test]
    fn content_len_of_regular_file() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[1u8; 3000]).unwrap();
        assert_eq!(content_len(&file).unwrap(), 3000);
    }

    #[cfg(unix)]
    #[test]
    fn content_len_of_block_device() {
        let Some(path) = small_block_device(64 * 1024 * 1024) else {
            return;
        };
        let file = File::open(&path).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 0);
        let len = content_len(&file).unwrap();
        assert!(len > 0);
        assert_eq!(std::fs::read(&path).unwrap().len() as u64, len);
    }

    #[cfg(unix)]
    #[test]
    fn fifo_path_opens_as_stream() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("pipe");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::S_IRWXU).unwrap();

        let writer = {
            let fifo = fifo.clone();
            std::thread::spawn(move || {
                let mut pipe = File::options().write(true).open(fifo).unwrap();
                pipe.write_all(b"through a pipe").unwrap();
            })
        };

        let mut source = SourceSlot::from(Source::Path(fifo)).open().unwrap();
        assert!(!source.is_seekable());
        assert!(source.file().is_none());
        assert_eq!(source.seek_to(8).unwrap(), 8);
        let mut buf = [0u8; 16];
        let n = source.read_full(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"a pipe");
        writer.join().unwrap();
    }

    #[test]
    fn missing_path_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut slot = SourceSlot::from(Source::Path(dir.path().join("missing")));
        assert!(matches!(
            slot.open(),
            Err(BmapError::SourceUnreadable { .. })
        ));
    }

    #[test]
    fn destination_path_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.img");
        let (_file, name) = Destination::Path(path.clone()).open().unwrap();
        assert!(path.exists());
        assert!(name.contains("out.img"));
    }

    #[test]
    fn destination_in_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = Destination::Path(dir.path().join("no/such/dir/out.img"))
            .open()
            .unwrap_err();
        assert!(matches!(err, BmapError::DestinationUnwritable(_)));
    }

    #[test]
    fn manifest_input_from_handle_reads_from_start() {
        use crate::hash::ChecksumType;

        let manifest = Manifest::new(
            0,
            4096,
            ChecksumType::Sha256,
            Vec::new(),
            ChecksumType::Sha256.digest(b""),
        )
        .unwrap();
        let mut file = tempfile::tempfile().unwrap();
        manifest.write_to(&mut file).unwrap();

        // Handle is left at EOF after writing
        let loaded = ManifestInput::File(file).load().unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn manifest_input_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = ManifestInput::Path(dir.path().join("none.bmap"))
            .load()
            .unwrap_err();
        assert!(matches!(err, BmapError::SourceUnreadable { .. }));
    }
}
