//! Raw extent queries against the kernel.
//!
//! Data regions are found with `lseek(2)` and `SEEK_DATA` / `SEEK_HOLE`.
//! Results are byte extents; block conversion and merging happen in
//! [`crate::extent`].

use std::fs::File;
use std::io;

/// One data region as reported by the kernel, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawExtent {
    pub logical: u64,
    pub length: u64,
}

impl RawExtent {
    pub(crate) const fn end(&self) -> u64 {
        self.logical.saturating_add(self.length)
    }
}

/// Cap on extents appended per [`fetch`] call.
pub(crate) const BATCH: usize = 64;

#[cfg(target_os = "linux")]
mod linux {
    use std::os::unix::io::AsRawFd;

    use nix::errno::Errno;
    use nix::libc::off_t;
    use nix::unistd::{lseek, Whence};

    use super::{io, File, RawExtent, BATCH};

    /// `lseek` that maps `ENXIO` (no data / hole past this offset) to `None`.
    fn seek(file: &File, offset: u64, whence: Whence) -> io::Result<Option<u64>> {
        let offset =
            off_t::try_from(offset).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        match lseek(file.as_raw_fd(), offset, whence) {
            Ok(pos) => Ok(u64::try_from(pos).ok()),
            Err(Errno::ENXIO) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub(super) fn check(file: &File) -> io::Result<()> {
        seek(file, 0, Whence::SeekData).map(|_| ())
    }

    pub(super) fn fetch(
        file: &File,
        start: u64,
        end: u64,
        out: &mut Vec<RawExtent>,
    ) -> io::Result<()> {
        let mut pos = start;
        while pos < end && out.len() < BATCH {
            let Some(data) = seek(file, pos, Whence::SeekData)? else {
                break;
            };
            if data >= end {
                break;
            }
            // Every file ends in an implicit hole, so `None` only shows up
            // if the file shrank under us
            let hole = seek(file, data, Whence::SeekHole)?.unwrap_or(end);
            if hole <= data {
                break;
            }
            out.push(RawExtent {
                logical: data,
                length: hole - data,
            });
            pos = hole;
        }
        Ok(())
    }
}

/// Check that `file` answers extent queries.
///
/// # Errors
///
/// Returns the kernel's error, or `Unsupported` off Linux.
#[cfg(target_os = "linux")]
pub(crate) fn check(file: &File) -> io::Result<()> {
    linux::check(file)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn check(_file: &File) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "extent queries are only implemented on Linux",
    ))
}

/// Append up to [`BATCH`] extents intersecting `[start, end)` to `out`, in
/// ascending order. Appends nothing once there is no more data in the range.
///
/// Moves the file offset.
#[cfg(target_os = "linux")]
pub(crate) fn fetch(file: &File, start: u64, end: u64, out: &mut Vec<RawExtent>) -> io::Result<()> {
    if start >= end {
        return Ok(());
    }
    linux::fetch(file, start, end, out)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn fetch(
    _file: &File,
    _start: u64,
    _end: u64,
    _out: &mut Vec<RawExtent>,
) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}
