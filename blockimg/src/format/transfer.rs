// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Parsing of the transfer list: a line-oriented text format with a small
//! header followed by one command per line.
//!
//! ```text
//! line 1: version (1..4)
//! line 2: total number of target blocks
//! (version >= 2)
//! line 3: maximum number of simultaneous stash entries (informational)
//! line 4: maximum number of blocks stashed simultaneously
//! line 5..: commands
//! ```
//!
//! The producer of the list guarantees that no block is read after an
//! earlier command has overwritten it and (version >= 2) that stashes are
//! created before they are referenced.

use std::str::FromStr;

use thiserror::Error;

use crate::format::rangeset::{self, RangeSet};

/// Oldest understood version.
pub const MIN_VERSION: u8 = 1;
/// Newest understood version.
pub const MAX_VERSION: u8 = 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Too few lines in transfer list: {0}")]
    TooFewLines(usize),
    #[error("Unsupported transfer list version: {0:?}")]
    UnsupportedVersion(String),
    #[error("Invalid block count: {0:?}")]
    InvalidBlockCount(String),
    #[error("Invalid stash hint: {0:?}")]
    InvalidStashHint(String),
    #[error("Unknown command: {0:?}")]
    UnknownCommand(String),
    #[error("Command {command:?} requires transfer list version {needed}, but have {version}")]
    CommandVersion {
        command: &'static str,
        needed: u8,
        version: u8,
    },
    #[error("Missing {0} argument")]
    MissingArgument(&'static str),
    #[error("Invalid {name} argument: {value:?}")]
    InvalidArgument { name: &'static str, value: String },
    #[error("Invalid range set")]
    RangeSet(#[from] rangeset::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CommandKind {
    Abort,
    Bsdiff,
    Erase,
    Free,
    Imgdiff,
    Move,
    New,
    Stash,
    Zero,
}

impl CommandKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "abort" => Self::Abort,
            "bsdiff" => Self::Bsdiff,
            "erase" => Self::Erase,
            "free" => Self::Free,
            "imgdiff" => Self::Imgdiff,
            "move" => Self::Move,
            "new" => Self::New,
            "stash" => Self::Stash,
            "zero" => Self::Zero,
            _ => return None,
        };

        Some(kind)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Bsdiff => "bsdiff",
            Self::Erase => "erase",
            Self::Free => "free",
            Self::Imgdiff => "imgdiff",
            Self::Move => "move",
            Self::New => "new",
            Self::Stash => "stash",
            Self::Zero => "zero",
        }
    }

    /// Oldest transfer list version the command may appear in.
    pub fn min_version(self) -> u8 {
        match self {
            Self::Stash => 2,
            Self::Free => 3,
            _ => 1,
        }
    }
}

/// One command line, split into the command name and its raw argument
/// tokens. Argument interpretation is version-specific and happens at
/// execution time via [`Args`].
#[derive(Clone, Debug)]
pub struct Command {
    pub kind: CommandKind,
    /// The full original line, for logging.
    pub raw: String,
    tokens: Vec<String>,
}

impl Command {
    pub fn args(&self) -> Args<'_> {
        Args {
            tokens: &self.tokens,
            pos: 0,
        }
    }
}

/// Cursor over a command's argument tokens.
pub struct Args<'a> {
    tokens: &'a [String],
    pos: usize,
}

impl<'a> Args<'a> {
    pub fn next(&mut self, name: &'static str) -> Result<&'a str> {
        let token = self
            .tokens
            .get(self.pos)
            .ok_or(Error::MissingArgument(name))?;
        self.pos += 1;
        Ok(token)
    }

    pub fn next_u64(&mut self, name: &'static str) -> Result<u64> {
        let token = self.next(name)?;
        token.parse().map_err(|_| Error::InvalidArgument {
            name,
            value: token.to_owned(),
        })
    }

    pub fn next_range(&mut self, name: &'static str) -> Result<RangeSet> {
        Ok(self.next(name)?.parse()?)
    }

    pub fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.tokens.len()
    }
}

#[derive(Clone, Debug)]
pub struct TransferList {
    pub version: u8,
    /// Total number of blocks the commands will write, for progress
    /// reporting.
    pub total_blocks: u64,
    /// Informational only.
    pub max_stash_entries: u64,
    /// Used for the stash space pre-check.
    pub max_stash_blocks: u64,
    pub commands: Vec<Command>,
}

impl FromStr for TransferList {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut lines = s.lines();

        let version_line = lines.next().ok_or(Error::TooFewLines(0))?;
        let version: u8 = version_line
            .parse()
            .ok()
            .filter(|v| (MIN_VERSION..=MAX_VERSION).contains(v))
            .ok_or_else(|| Error::UnsupportedVersion(version_line.to_owned()))?;

        let blocks_line = lines.next().ok_or(Error::TooFewLines(1))?;
        let total_blocks: u64 = blocks_line
            .parse()
            .map_err(|_| Error::InvalidBlockCount(blocks_line.to_owned()))?;

        let (max_stash_entries, max_stash_blocks) = if version >= 2 {
            let entries_line = lines.next().ok_or(Error::TooFewLines(2))?;
            let entries = entries_line
                .parse()
                .map_err(|_| Error::InvalidStashHint(entries_line.to_owned()))?;

            let blocks_line = lines.next().ok_or(Error::TooFewLines(3))?;
            let blocks = blocks_line
                .parse()
                .map_err(|_| Error::InvalidStashHint(blocks_line.to_owned()))?;

            (entries, blocks)
        } else {
            (0, 0)
        };

        let mut commands = vec![];

        for line in lines {
            if line.is_empty() {
                continue;
            }

            let mut tokens = line.split(' ').map(str::to_owned);
            let name = tokens.next().unwrap();
            let kind = CommandKind::from_name(&name).ok_or(Error::UnknownCommand(name))?;

            if version < kind.min_version() {
                return Err(Error::CommandVersion {
                    command: kind.name(),
                    needed: kind.min_version(),
                    version,
                });
            }

            commands.push(Command {
                kind,
                raw: line.to_owned(),
                tokens: tokens.collect(),
            });
        }

        Ok(Self {
            version,
            total_blocks,
            max_stash_entries,
            max_stash_blocks,
            commands,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_v1_header() {
        let list: TransferList = "1\n100\nzero 2,0,50\nnew 2,50,100\n".parse().unwrap();
        assert_eq!(list.version, 1);
        assert_eq!(list.total_blocks, 100);
        assert_eq!(list.commands.len(), 2);
        assert_eq!(list.commands[0].kind, CommandKind::Zero);
        assert_eq!(list.commands[1].kind, CommandKind::New);
    }

    #[test]
    fn parse_v3_header() {
        let list: TransferList = "3\n10\n2\n8\nfree a1b2\n".parse().unwrap();
        assert_eq!(list.max_stash_entries, 2);
        assert_eq!(list.max_stash_blocks, 8);
        assert_eq!(list.commands[0].kind, CommandKind::Free);
    }

    #[test]
    fn rejects_bad_headers() {
        assert_matches!(
            "5\n1\n".parse::<TransferList>(),
            Err(Error::UnsupportedVersion(_))
        );
        assert_matches!("2\n10\n".parse::<TransferList>(), Err(Error::TooFewLines(2)));
        assert_matches!(
            "1\nten\n".parse::<TransferList>(),
            Err(Error::InvalidBlockCount(_))
        );
    }

    #[test]
    fn rejects_commands_from_newer_versions() {
        assert_matches!(
            "1\n10\nstash id 2,0,1\n".parse::<TransferList>(),
            Err(Error::CommandVersion {
                command: "stash",
                needed: 2,
                version: 1,
            })
        );
        assert_matches!(
            "2\n10\n1\n1\nfree id\n".parse::<TransferList>(),
            Err(Error::CommandVersion {
                command: "free",
                needed: 3,
                version: 2,
            })
        );
    }

    #[test]
    fn rejects_unknown_command() {
        assert_matches!(
            "1\n10\nfrobnicate 2,0,1\n".parse::<TransferList>(),
            Err(Error::UnknownCommand(_))
        );
    }

    #[test]
    fn args_cursor() {
        let list: TransferList = "1\n10\nmove 2,0,1 2,1,2\n".parse().unwrap();
        let mut args = list.commands[0].args();

        assert_eq!(args.peek(), Some("2,0,1"));
        assert_eq!(args.next_range("src").unwrap().blocks(), 1);
        assert_eq!(args.next("tgt").unwrap(), "2,1,2");
        assert!(args.is_empty());
        assert_matches!(args.next("extra"), Err(Error::MissingArgument("extra")));
    }
}
