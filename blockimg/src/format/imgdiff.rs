// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Application of IMGDIFF2 patches. The container wraps a series of chunks,
//! each covering a slice of the source data:
//!
//! * Normal: a bsdiff patch against a raw source slice.
//! * Raw: literal target bytes embedded in the patch.
//! * Deflate: the source slice is a raw deflate stream. It is inflated, a
//!   bsdiff patch is applied to the expanded data, and the result is
//!   recompressed with the deflate parameters recorded in the chunk header so
//!   that the output is byte-identical to what the patch producer saw.
//!
//! Chunks are emitted in order, so like bsdiff, the whole patch streams onto
//! a sink.

use std::io::{self, Read, Write};

use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};
use thiserror::Error;
use tracing::warn;

use crate::format::bsdiff;

const MAGIC: &[u8; 8] = b"IMGDIFF2";

const CHUNK_NORMAL: u32 = 0;
const CHUNK_GZIP: u32 = 1;
const CHUNK_DEFLATE: u32 = 2;
const CHUNK_RAW: u32 = 3;

/// Raw stream with a 32 KiB window, the only layout the patch producer emits.
const WINDOW_BITS: i32 = -15;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Patch too short: {0} bytes")]
    TooShort(usize),
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 8]),
    #[error("Chunk #{index}: Unknown type: {chunk_type}")]
    UnknownChunkType { index: u32, chunk_type: u32 },
    #[error("Chunk #{index}: Truncated chunk header")]
    TruncatedChunk { index: u32 },
    #[error("Chunk #{index}: Source range {start}+{len} exceeds source size {size}")]
    SourceRange {
        index: u32,
        start: u64,
        len: u64,
        size: usize,
    },
    #[error("Chunk #{index}: Patch offset {offset} exceeds patch size {size}")]
    PatchOffset { index: u32, offset: u64, size: usize },
    #[error("Chunk #{index}: Expected {expected} expanded bytes, but have {actual}")]
    ExpandedSize {
        index: u32,
        expected: u64,
        actual: u64,
    },
    #[error("Chunk #{index}: Failed to apply bsdiff patch")]
    Bsdiff {
        index: u32,
        #[source]
        source: bsdiff::Error,
    },
    #[error("Chunk #{index}: Failed to inflate source data")]
    Inflate {
        index: u32,
        #[source]
        source: io::Error,
    },
    #[error("Chunk #{index}: Failed to deflate target data")]
    Deflate {
        index: u32,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write patched data")]
    Write(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    index: u32,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, size: usize) -> Result<&'a [u8]> {
        let data = self.data;
        let end = self
            .pos
            .checked_add(size)
            .filter(|&e| e <= data.len())
            .ok_or(Error::TruncatedChunk { index: self.index })?;
        let slice = &data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

fn source_slice<'a>(old: &'a [u8], index: u32, start: u64, len: u64) -> Result<&'a [u8]> {
    let end = start.checked_add(len).filter(|&e| e <= old.len() as u64);

    match end {
        Some(end) => Ok(&old[start as usize..end as usize]),
        None => Err(Error::SourceRange {
            index,
            start,
            len,
            size: old.len(),
        }),
    }
}

fn patch_at(patch: &[u8], index: u32, offset: u64) -> Result<&[u8]> {
    if offset > patch.len() as u64 {
        return Err(Error::PatchOffset {
            index,
            offset,
            size: patch.len(),
        });
    }

    Ok(&patch[offset as usize..])
}

/// Apply `patch` to `old`, writing the new data to `sink` in order.
pub fn apply(old: &[u8], patch: &[u8], mut sink: impl Write) -> Result<()> {
    if patch.len() < 12 {
        return Err(Error::TooShort(patch.len()));
    }

    let magic: [u8; 8] = patch[0..8].try_into().unwrap();
    if magic != *MAGIC {
        return Err(Error::UnknownMagic(magic));
    }

    let num_chunks = u32::from_le_bytes(patch[8..12].try_into().unwrap());
    let mut cursor = Cursor {
        data: patch,
        pos: 12,
        index: 0,
    };

    for index in 0..num_chunks {
        cursor.index = index;
        let chunk_type = cursor.read_u32()?;

        match chunk_type {
            CHUNK_NORMAL => {
                let src_start = cursor.read_u64()?;
                let src_len = cursor.read_u64()?;
                let patch_offset = cursor.read_u64()?;

                let src = source_slice(old, index, src_start, src_len)?;
                let chunk_patch = patch_at(patch, index, patch_offset)?;

                bsdiff::apply(src, chunk_patch, &mut sink)
                    .map_err(|e| Error::Bsdiff { index, source: e })?;
            }
            CHUNK_RAW => {
                let data_len = cursor.read_u32()?;
                let data = cursor.take(data_len as usize)?;

                sink.write_all(data).map_err(Error::Write)?;
            }
            CHUNK_DEFLATE => {
                let src_start = cursor.read_u64()?;
                let src_len = cursor.read_u64()?;
                let patch_offset = cursor.read_u64()?;
                let expanded_len = cursor.read_u64()?;
                let _target_len = cursor.read_u64()?;
                let level = cursor.read_u32()?;
                let _method = cursor.read_u32()?;
                let window_bits = cursor.read_u32()? as i32;
                let _mem_level = cursor.read_u32()?;
                let _strategy = cursor.read_u32()?;

                if window_bits != WINDOW_BITS {
                    // The producer always emits raw streams; anything else
                    // would decompress to garbage.
                    warn!("Chunk #{index}: Unexpected window bits: {window_bits}");
                }

                let src = source_slice(old, index, src_start, src_len)?;
                let chunk_patch = patch_at(patch, index, patch_offset)?;

                let mut expanded = Vec::with_capacity(expanded_len as usize);
                let mut decoder = DeflateDecoder::new(src);
                decoder
                    .read_to_end(&mut expanded)
                    .map_err(|e| Error::Inflate { index, source: e })?;

                if expanded.len() as u64 != expanded_len {
                    return Err(Error::ExpandedSize {
                        index,
                        expected: expanded_len,
                        actual: expanded.len() as u64,
                    });
                }

                let mut target = vec![];
                bsdiff::apply(&expanded, chunk_patch, &mut target)
                    .map_err(|e| Error::Bsdiff { index, source: e })?;

                let mut encoder = DeflateEncoder::new(&mut sink, Compression::new(level));
                encoder
                    .write_all(&target)
                    .and_then(|()| encoder.finish().map(|_| ()))
                    .map_err(|e| Error::Deflate { index, source: e })?;
            }
            CHUNK_GZIP => {
                // IMGDIFF1 only; no producer has emitted these in years.
                return Err(Error::UnknownChunkType { index, chunk_type });
            }
            _ => {
                return Err(Error::UnknownChunkType { index, chunk_type });
            }
        }
    }

    Ok(())
}
