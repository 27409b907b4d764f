// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, str::FromStr};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid range text: {0:?}")]
    TooFewTokens(String),
    #[error("Failed to parse endpoint count: {0:?}")]
    InvalidCount(String),
    #[error("Endpoint count must be even and non-zero: {0}")]
    BadCount(u64),
    #[error("Expected {expected} endpoints, but have {actual}")]
    MismatchedCount { expected: u64, actual: usize },
    #[error("Invalid block number: {0:?}")]
    InvalidBlock(String),
    #[error("Empty or inverted range: {start}..{end}")]
    EmptyRange { start: u64, end: u64 },
    #[error("Total block count overflows")]
    SizeOverflow,
}

type Result<T> = std::result::Result<T, Error>;

/// Half-open range of block indices.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    /// Starting block (inclusive).
    pub start: u64,
    /// Ending block (exclusive).
    pub end: u64,
}

impl fmt::Debug for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl BlockRange {
    /// Length in blocks.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// An ordered set of non-empty [`BlockRange`]s. The ranges from a single
/// parsed set are assumed by the producer of the transfer list to be mutually
/// exclusive, but no global sort order is required.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<BlockRange>,
    blocks: u64,
}

impl RangeSet {
    pub fn new(ranges: impl IntoIterator<Item = BlockRange>) -> Result<Self> {
        let mut result = Self::default();

        for range in ranges {
            result.push(range)?;
        }

        Ok(result)
    }

    fn push(&mut self, range: BlockRange) -> Result<()> {
        if range.start >= range.end {
            return Err(Error::EmptyRange {
                start: range.start,
                end: range.end,
            });
        }

        self.blocks = self
            .blocks
            .checked_add(range.len())
            .ok_or(Error::SizeOverflow)?;
        self.ranges.push(range);

        Ok(())
    }

    /// Total number of blocks covered by the set.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Number of ranges in the set.
    pub fn pair_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = BlockRange> + '_ {
        self.ranges.iter().copied()
    }

    /// Absolute block number of the i-th (0-based) block covered by the set.
    pub fn block_at(&self, mut index: u64) -> Option<u64> {
        for range in &self.ranges {
            if index < range.len() {
                return Some(range.start + index);
            }
            index -= range.len();
        }

        None
    }

    /// Whether any block is covered by both sets. The bounds are half-open,
    /// so `[3, 5)` and `[5, 7)` do not overlap.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.ranges.iter().any(|a| {
            other
                .ranges
                .iter()
                .any(|b| !(b.start >= a.end || a.start >= b.end))
        })
    }
}

impl FromStr for RangeSet {
    type Err = Error;

    /// Parse the textual form `<n>,<p0>,<p1>,...,<pn-1>`, where `n` is the
    /// number of endpoints and each consecutive pair of endpoints forms a
    /// half-open range. All violations are fatal.
    fn from_str(s: &str) -> Result<Self> {
        let mut tokens = s.split(',');
        let count_token = tokens
            .next()
            .ok_or_else(|| Error::TooFewTokens(s.to_owned()))?;
        let count: u64 = count_token
            .parse()
            .ok()
            .filter(|&n| n <= i32::MAX as u64)
            .ok_or_else(|| Error::InvalidCount(count_token.to_owned()))?;

        if count == 0 || count % 2 != 0 {
            return Err(Error::BadCount(count));
        }

        let mut endpoints = Vec::with_capacity(count as usize);

        for token in tokens {
            let block: u64 = token
                .parse()
                .ok()
                .filter(|&n| n <= i32::MAX as u64)
                .ok_or_else(|| Error::InvalidBlock(token.to_owned()))?;
            endpoints.push(block);
        }

        if endpoints.len() as u64 != count {
            return Err(Error::MismatchedCount {
                expected: count,
                actual: endpoints.len(),
            });
        }

        Self::new(endpoints.chunks_exact(2).map(|pair| BlockRange {
            start: pair[0],
            end: pair[1],
        }))
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ranges.len() * 2)?;

        for range in &self.ranges {
            write!(f, ",{},{}", range.start, range.end)?;
        }

        Ok(())
    }
}
