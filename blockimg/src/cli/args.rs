// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing::Level;

use crate::cli::{completion, update};

#[derive(Debug, Subcommand)]
pub enum Command {
    Update(update::UpdateCli),
    Verify(update::VerifyCli),
    RangeSha1(update::RangeSha1Cli),
    Completion(completion::CompletionCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lower logging verbosity (can be specified multiple times).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub quiet: u8,

    /// Raise logging verbosity (can be specified multiple times).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

fn init_logging(cli: &Cli) {
    const LEVELS: &[Level] = &[
        Level::ERROR,
        Level::WARN,
        Level::INFO,
        Level::DEBUG,
        Level::TRACE,
    ];

    let default = 2usize;
    let index = default
        .saturating_sub(cli.quiet.into())
        .saturating_add(cli.verbose.into())
        .min(LEVELS.len() - 1);

    tracing_subscriber::fmt()
        .with_max_level(LEVELS[index])
        .with_writer(io::stderr)
        .init();
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli);
    logging_initialized.store(true, Ordering::SeqCst);

    match &cli.command {
        Command::Update(c) => update::update_main(c, cancel_signal),
        Command::Verify(c) => update::verify_main(c, cancel_signal),
        Command::RangeSha1(c) => update::range_sha1_main(c),
        Command::Completion(c) => completion::completion_main(c),
    }
}
