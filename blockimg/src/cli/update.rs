// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    env,
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::{Args, Parser};
use flate2::read::GzDecoder;
use sha1::{Digest, Sha1};

use crate::{
    blockio::{self, BLOCK_SIZE},
    cli::status,
    engine::{self, Mode, Options},
    format::rangeset::RangeSet,
};

fn default_stash_root() -> PathBuf {
    env::temp_dir().join("blockimg")
}

fn open_new_data(path: &Path) -> Result<Box<dyn Read + Send>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open new data file: {path:?}"))?;
    let reader = BufReader::new(file);

    // The engine consumes an opaque byte stream; the container codec is
    // decided here by the file name.
    if path.extension().is_some_and(|e| e == "gz") {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

fn run_engine(cli: &ApplyGroup, mode: Mode, cancel_signal: &AtomicBool) -> Result<()> {
    let transfer_list = fs::read_to_string(&cli.transfer_list)
        .with_context(|| format!("Failed to read transfer list: {:?}", cli.transfer_list))?;

    let patch_data = match &cli.patch {
        Some(path) => {
            fs::read(path).with_context(|| format!("Failed to read patch blob: {path:?}"))?
        }
        None => vec![],
    };

    let new_data = open_new_data(&cli.new_data)?;

    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&cli.image)
        .with_context(|| format!("Failed to open image: {:?}", cli.image))?;

    let options = Options {
        is_retry: cli.retry,
        erase_as_zero: cli.erase_as_zero,
        stash_root: cli
            .stash_root
            .clone()
            .unwrap_or_else(default_stash_root),
    };

    let device_path = cli.image.to_string_lossy();

    let stats = engine::apply(
        device,
        &device_path,
        &transfer_list,
        new_data,
        patch_data.as_slice(),
        mode,
        &options,
        &mut io::stdout(),
        cancel_signal,
    )
    .with_context(|| format!("Failed to update image: {:?}", cli.image))?;

    match mode {
        Mode::Update => status!("Wrote {} blocks ({} stashed)", stats.written, stats.stashed),
        Mode::Verify => status!("Update is applicable to this image"),
    }

    Ok(())
}

pub fn update_main(cli: &UpdateCli, cancel_signal: &AtomicBool) -> Result<()> {
    run_engine(&cli.apply, Mode::Update, cancel_signal)
}

pub fn verify_main(cli: &VerifyCli, cancel_signal: &AtomicBool) -> Result<()> {
    run_engine(&cli.apply, Mode::Verify, cancel_signal)
}

pub fn range_sha1_main(cli: &RangeSha1Cli) -> Result<()> {
    let ranges: RangeSet = cli
        .ranges
        .parse()
        .with_context(|| format!("Failed to parse ranges: {:?}", cli.ranges))?;

    let file = File::open(&cli.image)
        .with_context(|| format!("Failed to open image: {:?}", cli.image))?;

    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; BLOCK_SIZE];

    for range in ranges.iter() {
        blockio::check_seek(&file, range.start * BLOCK_SIZE as u64)?;

        for block in range.start..range.end {
            (&file)
                .read_exact(&mut buf)
                .with_context(|| format!("Failed to read block {block}"))?;
            hasher.update(&buf);
        }
    }

    println!("{}", hex::encode(hasher.finalize()));

    Ok(())
}

/// Inputs shared by `update` and `verify`.
#[derive(Debug, Args)]
pub struct ApplyGroup {
    /// Path to the image file or block device to modify in place.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub image: PathBuf,

    /// Path to the transfer list.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub transfer_list: PathBuf,

    /// Path to the concatenated new data stream (gzip if named *.gz).
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub new_data: PathBuf,

    /// Path to the concatenated patch blob.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub patch: Option<PathBuf>,

    /// Directory for stash directories (default: temp dir).
    #[arg(long, value_name = "DIR", value_parser)]
    pub stash_root: Option<PathBuf>,

    /// Treat this run as a retry of an interrupted update.
    #[arg(long)]
    pub retry: bool,

    /// Fill erased regions with zeros instead of issuing a discard.
    #[arg(long)]
    pub erase_as_zero: bool,
}

/// Apply a transfer list to an image.
#[derive(Debug, Parser)]
pub struct UpdateCli {
    #[command(flatten)]
    pub apply: ApplyGroup,
}

/// Dry-run a transfer list against an image without writing.
#[derive(Debug, Parser)]
pub struct VerifyCli {
    #[command(flatten)]
    pub apply: ApplyGroup,
}

/// Print the SHA-1 of a set of block ranges in an image.
#[derive(Debug, Parser)]
pub struct RangeSha1Cli {
    /// Path to the image file or block device.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub image: PathBuf,

    /// Block ranges, e.g. "4,10,20,30,40".
    #[arg(short, long, value_name = "RANGES")]
    pub ranges: String,
}
