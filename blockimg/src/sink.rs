// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs::File, io};

use thiserror::Error;

use crate::{
    blockio::{self, BLOCK_SIZE, DiscardPolicy},
    format::rangeset::{BlockRange, RangeSet},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Range sink overrun; cannot write {0} more bytes")]
    Overrun(usize),
    #[error("Block I/O error")]
    BlockIo(#[from] blockio::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Writes a linear byte stream across the disjoint block ranges of a target
/// set, in order. Each range is discarded (subject to the policy) and sought
/// to when the cursor first enters it. Writing past the end of the final
/// range is an overrun and is rejected.
pub struct RangeSink {
    file: File,
    ranges: RangeSet,
    next_range: usize,
    /// Bytes left before the cursor moves to the next range.
    left_in_range: u64,
    /// Current device byte offset, for error reporting.
    offset: u64,
    written: u64,
    policy: DiscardPolicy,
}

impl RangeSink {
    pub fn new(file: File, ranges: RangeSet, policy: DiscardPolicy) -> Self {
        Self {
            file,
            ranges,
            next_range: 0,
            left_in_range: 0,
            offset: 0,
            written: 0,
            policy,
        }
    }

    pub fn finished(&self) -> bool {
        self.next_range == self.ranges.pair_count() && self.left_in_range == 0
    }

    /// Bytes the sink will still accept.
    pub fn available(&self) -> u64 {
        self.ranges.blocks() * BLOCK_SIZE as u64 - self.written
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    fn enter_next_range(&mut self) -> Result<()> {
        let range: BlockRange = self.ranges.iter().nth(self.next_range).unwrap();
        let offset = range.start * BLOCK_SIZE as u64;

        self.left_in_range = range.len() * BLOCK_SIZE as u64;
        self.offset = offset;
        self.next_range += 1;

        blockio::discard_blocks(&self.file, offset, self.left_in_range, self.policy, false)?;
        blockio::check_seek(&self.file, offset)?;

        Ok(())
    }

    pub fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        use std::io::Write;

        if !data.is_empty() && self.finished() {
            return Err(Error::Overrun(data.len()));
        }

        while !data.is_empty() {
            if self.left_in_range == 0 {
                if self.next_range >= self.ranges.pair_count() {
                    return Err(Error::Overrun(data.len()));
                }
                self.enter_next_range()?;
            }

            let n = (self.left_in_range).min(data.len() as u64) as usize;

            (&self.file)
                .write_all(&data[..n])
                .map_err(|e| blockio::Error::Write {
                    offset: self.offset,
                    size: n,
                    source: e,
                })?;

            data = &data[n..];
            self.offset += n as u64;
            self.left_in_range -= n as u64;
            self.written += n as u64;
        }

        Ok(())
    }
}

/// The patch appliers only see a plain writer.
impl io::Write for RangeSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        RangeSink::write_all(self, buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};

    use assert_matches::assert_matches;

    use super::*;

    fn image(blocks: usize) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0u8; blocks * BLOCK_SIZE]).unwrap();
        file
    }

    #[test]
    fn fills_disjoint_ranges_exactly() {
        let file = image(8);
        let ranges: RangeSet = "4,1,3,5,6".parse().unwrap();
        let mut sink = RangeSink::new(
            file.try_clone().unwrap(),
            ranges,
            DiscardPolicy::default(),
        );

        let payload = (0..3 * BLOCK_SIZE)
            .map(|i| (i % 251) as u8)
            .collect::<Vec<_>>();

        // Feed in uneven chunks to exercise the cursor logic.
        sink.write_all(&payload[..10]).unwrap();
        sink.write_all(&payload[10..2 * BLOCK_SIZE + 17]).unwrap();
        sink.write_all(&payload[2 * BLOCK_SIZE + 17..]).unwrap();

        assert!(sink.finished());
        assert_eq!(sink.available(), 0);
        assert_eq!(sink.bytes_written(), 3 * BLOCK_SIZE as u64);

        assert_matches!(sink.write_all(b"x"), Err(Error::Overrun(1)));

        let mut file = file;
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut all = vec![];
        file.read_to_end(&mut all).unwrap();

        assert_eq!(&all[BLOCK_SIZE..3 * BLOCK_SIZE], &payload[..2 * BLOCK_SIZE]);
        assert_eq!(
            &all[5 * BLOCK_SIZE..6 * BLOCK_SIZE],
            &payload[2 * BLOCK_SIZE..],
        );
        // Blocks outside the target set are untouched.
        assert!(all[..BLOCK_SIZE].iter().all(|&b| b == 0));
        assert!(all[3 * BLOCK_SIZE..5 * BLOCK_SIZE].iter().all(|&b| b == 0));
        assert!(all[6 * BLOCK_SIZE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn empty_write_to_finished_sink_is_ok() {
        let file = image(1);
        let ranges: RangeSet = "2,0,1".parse().unwrap();
        let mut sink = RangeSink::new(file, ranges, DiscardPolicy::default());

        sink.write_all(&vec![7u8; BLOCK_SIZE]).unwrap();
        sink.write_all(&[]).unwrap();
        assert!(sink.finished());
    }
}
