// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use thiserror::Error;

use crate::format::rangeset::RangeSet;

/// Fixed addressing unit for all block ranges on the target device.
pub const BLOCK_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read {size} bytes at offset {offset}")]
    Read {
        offset: u64,
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write {size} bytes at offset {offset}")]
    Write {
        offset: u64,
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("Failed to seek to offset {offset}")]
    Seek {
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("Failed to discard {size} bytes at offset {offset}")]
    Discard {
        offset: u64,
        size: u64,
        #[source]
        source: io::Error,
    },
    #[error("Failed to fsync target")]
    Fsync(#[source] io::Error),
    #[error("Failed to fsync directory: {0:?}")]
    FsyncDir(std::path::PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// When writes may be preceded by a block discard. Discards are only issued
/// when the run is a retry of a previously interrupted update, where they
/// reclaim any half-written state. A fresh run leaves blocks untouched until
/// they are overwritten. `erase` forces a discard regardless.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiscardPolicy {
    pub is_retry: bool,
}

impl DiscardPolicy {
    pub fn should_discard(self, force: bool) -> bool {
        self.is_retry || force
    }
}

/// Seek to an absolute offset, mapping failures to a fatal error.
pub fn check_seek(mut file: &File, offset: u64) -> Result<()> {
    file.seek(SeekFrom::Start(offset))
        .map(|_| ())
        .map_err(|e| Error::Seek { offset, source: e })
}

/// Read the blocks covered by `ranges`, in order, into the beginning of
/// `buf`. `buf` must be at least `ranges.blocks() * BLOCK_SIZE` bytes.
pub fn read_blocks(mut file: &File, ranges: &RangeSet, buf: &mut [u8]) -> Result<()> {
    let mut pos = 0;

    for range in ranges.iter() {
        let offset = range.start * BLOCK_SIZE as u64;
        let size = range.len() as usize * BLOCK_SIZE;

        check_seek(file, offset)?;

        file.read_exact(&mut buf[pos..pos + size])
            .map_err(|e| Error::Read {
                offset,
                size,
                source: e,
            })?;

        pos += size;
    }

    Ok(())
}

/// Write the beginning of `buf` to the blocks covered by `ranges`, in order,
/// discarding each range first when the policy calls for it.
pub fn write_blocks(
    mut file: &File,
    ranges: &RangeSet,
    buf: &[u8],
    policy: DiscardPolicy,
) -> Result<()> {
    let mut pos = 0;

    for range in ranges.iter() {
        let offset = range.start * BLOCK_SIZE as u64;
        let size = range.len() as usize * BLOCK_SIZE;

        discard_blocks(file, offset, size as u64, policy, false)?;
        check_seek(file, offset)?;

        file.write_all(&buf[pos..pos + size])
            .map_err(|e| Error::Write {
                offset,
                size,
                source: e,
            })?;

        pos += size;
    }

    Ok(())
}

/// Fill the blocks covered by `ranges` with zeros, discarding each range
/// first when the policy calls for it.
pub fn zero_blocks(mut file: &File, ranges: &RangeSet, policy: DiscardPolicy) -> Result<()> {
    static ZERO_BLOCK: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

    for range in ranges.iter() {
        let offset = range.start * BLOCK_SIZE as u64;
        let size = range.len() * BLOCK_SIZE as u64;

        discard_blocks(file, offset, size, policy, false)?;
        check_seek(file, offset)?;

        for block in range.start..range.end {
            file.write_all(&ZERO_BLOCK).map_err(|e| Error::Write {
                offset: block * BLOCK_SIZE as u64,
                size: BLOCK_SIZE,
                source: e,
            })?;
        }
    }

    Ok(())
}

/// Issue a block discard for the byte range, subject to the policy. Targets
/// that don't support discards (regular files, discard-less kernels) are
/// silently tolerated.
pub fn discard_blocks(
    file: &File,
    offset: u64,
    size: u64,
    policy: DiscardPolicy,
    force: bool,
) -> Result<()> {
    if !policy.should_discard(force) {
        return Ok(());
    }

    discard_range(file, offset, size).map_err(|e| Error::Discard {
        offset,
        size,
        source: e,
    })
}

#[cfg(target_os = "linux")]
fn discard_range(file: &File, offset: u64, size: u64) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    // _IO(0x12, 119)
    const BLKDISCARD: libc::c_ulong = 0x1277;

    let args = [offset, size];
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKDISCARD, args.as_ptr()) };
    if ret == -1 {
        let e = io::Error::last_os_error();
        match e.raw_os_error() {
            Some(libc::EOPNOTSUPP) | Some(libc::ENOTTY) => Ok(()),
            _ => Err(e),
        }
    } else {
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
fn discard_range(_file: &File, _offset: u64, _size: u64) -> io::Result<()> {
    Ok(())
}

/// Whether the file refers to an actual block device. `erase` refuses to run
/// against anything else.
pub fn is_block_device(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;

        Ok(file.metadata()?.file_type().is_block_device())
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(false)
    }
}

pub fn fsync(file: &File) -> Result<()> {
    file.sync_all().map_err(Error::Fsync)
}

/// Fsync a directory so that a preceding rename within it is durable.
pub fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).map_err(|e| Error::FsyncDir(path.to_owned(), e))?;
    dir.sync_all()
        .map_err(|e| Error::FsyncDir(path.to_owned(), e))
}
