// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Application of BSDIFF40 patches. The format is a 32-byte header followed
//! by three independently bzip2-compressed streams:
//!
//! ```text
//! offset  size
//! 0       8     "BSDIFF40"
//! 8       8     X = compressed control block length
//! 16      8     Y = compressed diff block length
//! 24      8     size of the new data
//! 32      X     bzip2(control block)
//! 32+X    Y     bzip2(diff block)
//! 32+X+Y  ...   bzip2(extra block)
//! ```
//!
//! The control block is a sequence of (x, y, z) triples: add x bytes of the
//! old data to x bytes from the diff block, copy y bytes from the extra
//! block, then seek forward z bytes in the old data. Integers are
//! little-endian sign-magnitude (top bit of the final byte is the sign).
//!
//! Output is produced strictly in order, so the patch can be streamed onto a
//! sink without materializing the new data.

use std::io::{self, Read, Write};

use bzip2::read::BzDecoder;
use thiserror::Error;

const MAGIC: &[u8; 8] = b"BSDIFF40";
const HEADER_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Patch too short to contain header: {0} bytes")]
    TooShort(usize),
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 8]),
    #[error("Invalid header length field: {0}")]
    InvalidLength(i64),
    #[error("Streams exceed patch size: {0} > {1}")]
    StreamsTooLong(u64, u64),
    #[error("Corrupt patch: new data overrun")]
    NewDataOverrun,
    #[error("Failed to read patch stream: {0}")]
    StreamRead(&'static str, #[source] io::Error),
    #[error("Failed to write patched data")]
    Write(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Little-endian sign-magnitude, as used by the original bsdiff tool.
fn read_offset(buf: &[u8; 8]) -> i64 {
    let magnitude = i64::from_le_bytes(*buf) & !(1 << 63);

    if buf[7] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

fn read_stream_offset(reader: &mut impl Read, name: &'static str) -> Result<i64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|e| Error::StreamRead(name, e))?;
    Ok(read_offset(&buf))
}

/// Apply `patch` to `old`, writing the new data to `sink` in order.
pub fn apply(old: &[u8], patch: &[u8], mut sink: impl Write) -> Result<()> {
    if patch.len() < HEADER_SIZE {
        return Err(Error::TooShort(patch.len()));
    }

    let magic: [u8; 8] = patch[0..8].try_into().unwrap();
    if magic != *MAGIC {
        return Err(Error::UnknownMagic(magic));
    }

    let ctrl_len = read_offset(patch[8..16].try_into().unwrap());
    let diff_len = read_offset(patch[16..24].try_into().unwrap());
    let new_size = read_offset(patch[24..32].try_into().unwrap());

    for len in [ctrl_len, diff_len, new_size] {
        if len < 0 {
            return Err(Error::InvalidLength(len));
        }
    }

    let streams_end = HEADER_SIZE as u64 + ctrl_len as u64 + diff_len as u64;
    if streams_end > patch.len() as u64 {
        return Err(Error::StreamsTooLong(streams_end, patch.len() as u64));
    }

    let diff_start = HEADER_SIZE + ctrl_len as usize;
    let extra_start = diff_start + diff_len as usize;

    let mut ctrl = BzDecoder::new(&patch[HEADER_SIZE..diff_start]);
    let mut diff = BzDecoder::new(&patch[diff_start..extra_start]);
    let mut extra = BzDecoder::new(&patch[extra_start..]);

    let new_size = new_size as u64;
    let mut old_pos: i64 = 0;
    let mut new_pos: u64 = 0;
    let mut buf = vec![];

    while new_pos < new_size {
        let add_len = read_stream_offset(&mut ctrl, "control")?;
        let copy_len = read_stream_offset(&mut ctrl, "control")?;
        let seek_len = read_stream_offset(&mut ctrl, "control")?;

        if add_len < 0 || copy_len < 0 {
            return Err(Error::InvalidLength(add_len.min(copy_len)));
        }

        if new_pos + add_len as u64 > new_size {
            return Err(Error::NewDataOverrun);
        }

        buf.resize(add_len as usize, 0);
        diff.read_exact(&mut buf)
            .map_err(|e| Error::StreamRead("diff", e))?;

        // Diff bytes are deltas against the old data; additions that fall
        // outside the old data pass through unchanged.
        for (i, byte) in buf.iter_mut().enumerate() {
            let pos = old_pos + i as i64;
            if pos >= 0 && (pos as u64) < old.len() as u64 {
                *byte = byte.wrapping_add(old[pos as usize]);
            }
        }

        sink.write_all(&buf).map_err(Error::Write)?;
        new_pos += add_len as u64;
        old_pos += add_len;

        if new_pos + copy_len as u64 > new_size {
            return Err(Error::NewDataOverrun);
        }

        buf.resize(copy_len as usize, 0);
        extra
            .read_exact(&mut buf)
            .map_err(|e| Error::StreamRead("extra", e))?;

        sink.write_all(&buf).map_err(Error::Write)?;
        new_pos += copy_len as u64;
        old_pos += seek_len;
    }

    Ok(())
}
