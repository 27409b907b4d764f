// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The block image update engine. A transfer list is interpreted against a
//! target device opened read/write, turning the old partition contents into
//! the new contents in place, without ever materializing the full image.
//!
//! Interrupted updates are resumable: commands in version 3+ lists carry
//! content hashes that let an already-applied command be detected and
//! skipped, and source blocks that would be destroyed by an overlapping
//! write are stashed durably first. Nearly every failure is immediately
//! fatal to the invocation; re-invoking the engine after a relaunch is the
//! retry mechanism.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    blockio::{self, BLOCK_SIZE, DiscardPolicy},
    format::{
        bsdiff, imgdiff,
        rangeset::RangeSet,
        transfer::{Args, Command, CommandKind, TransferList},
    },
    newdata::Streamer,
    sink::{self, RangeSink},
    stash::{self, DirState, Stash},
    util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to parse transfer list")]
    TransferList(#[from] crate::format::transfer::Error),
    #[error("Malformed command arguments: {0}")]
    BadCommand(String),
    #[error("Block I/O error")]
    BlockIo(#[from] blockio::Error),
    #[error("Stash error")]
    Stash(#[from] stash::Error),
    #[error("New data stream error")]
    NewData(#[from] crate::newdata::Error),
    #[error("Failed to apply bsdiff patch")]
    Bsdiff(#[from] bsdiff::Error),
    #[error("Failed to apply imgdiff patch")]
    Imgdiff(#[from] imgdiff::Error),
    #[error("Range sink overrun; cannot write {0} more bytes")]
    SinkOverrun(usize),
    #[error("Patch output missing {0} bytes of target data")]
    SinkUnderrun(u64),
    #[error("Patch blob region {offset}+{length} exceeds blob size {size}")]
    PatchBounds { offset: u64, length: u64, size: u64 },
    #[error("Source blocks have unexpected contents; update cannot be resumed")]
    Unresumable,
    #[error("Target is not a block device")]
    NotBlockDevice,
    #[error("Aborting per transfer list instruction")]
    Aborted,
    #[error("Update was interrupted")]
    Interrupted,
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether a retry of the whole update is known to be pointless. The
    /// caller must not blindly re-invoke the engine in this case; the stash
    /// directory has already been deleted.
    pub fn is_unresumable(&self) -> bool {
        matches!(self, Self::Unresumable)
    }
}

impl From<sink::Error> for Error {
    fn from(e: sink::Error) -> Self {
        match e {
            sink::Error::Overrun(n) => Self::SinkOverrun(n),
            sink::Error::BlockIo(e) => Self::BlockIo(e),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Apply the transfer list to the device.
    Update,
    /// Dry run: execute the command sequence without writing, to determine
    /// whether an update is still feasible.
    Verify,
}

#[derive(Clone, Debug)]
pub struct Options {
    /// Whether this run is a retry of a previously interrupted update.
    /// Discards are only issued on retries; see [`DiscardPolicy`].
    pub is_retry: bool,
    /// Degrade `erase` to explicit zero-fill writes instead of a discard.
    pub erase_as_zero: bool,
    /// Directory under which per-device stash directories are created.
    pub stash_root: PathBuf,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Target blocks written (or that would be written, in verify mode).
    pub written: u64,
    /// Source blocks stashed.
    pub stashed: u64,
}

/// Outcome of loading a command's source and target state.
enum SourceLoad {
    /// Source blocks have expected contents and the command can proceed.
    Fresh,
    /// The target blocks already hash to the expected result; the command
    /// completed in a previous, interrupted attempt.
    AlreadyApplied,
}

#[derive(Clone, Copy)]
enum PatchKind {
    Bsdiff,
    Imgdiff,
}

/// Resume bookkeeping from the `last_command` file of a previous attempt.
struct Resume {
    path: PathBuf,
    /// Whether commands up to `last_index` may be skipped.
    skip: bool,
    last_index: usize,
}

/// Apply (or dry-run) a transfer list against `device`.
///
/// `device_path` only determines the stash directory name; the device itself
/// is accessed through the already opened `device` handle. `new_data` is the
/// concatenated, already decompressed payload for all `new` commands.
/// `patch_data` is the concatenated patch blob that diff commands address by
/// offset and length. Progress lines of the form `set_progress <fraction>`
/// are written to `progress` after every command in update mode.
///
/// The cancel signal is only checked between commands; mid-command
/// cancellation is unsupported. Killing the process outright is safe since
/// that's exactly what resume exists for.
#[allow(clippy::too_many_arguments)]
pub fn apply(
    device: File,
    device_path: &str,
    transfer_list: &str,
    new_data: impl Read + Send + 'static,
    patch_data: &[u8],
    mode: Mode,
    options: &Options,
    progress: &mut dyn Write,
    cancel_signal: &AtomicBool,
) -> Result<Stats> {
    info!(
        "Performing {}",
        match mode {
            Mode::Update => "update",
            Mode::Verify => "verification",
        },
    );
    if options.is_retry {
        info!("This update is a retry");
    }

    let list: TransferList = transfer_list.parse()?;
    info!("Transfer list version is {}", list.version);

    if list.total_blocks == 0 {
        return Ok(Stats::default());
    }

    fs::create_dir_all(&options.stash_root)?;

    let stash = Stash::new(&options.stash_root, device_path);
    let marker_path = sibling_path(stash.directory(), ".updated");
    let resume_path = sibling_path(stash.directory(), ".last_command");

    // If the update on this device already finished (but the overall run was
    // interrupted later), a no-op retry could still fail on leftover state.
    // The marker lets it be skipped outright.
    if options.is_retry {
        if marker_path.exists() {
            info!("Skipping already updated device {device_path} based on marker");
            return Ok(Stats::default());
        }
    } else {
        remove_file_if_exists(&marker_path)?;
    }

    let stash_created = if list.version >= 2 {
        stash.create(list.max_stash_blocks)? == DirState::Created
    } else {
        false
    };

    let mut resume = Resume {
        path: resume_path,
        skip: false,
        last_index: 0,
    };
    match parse_last_command(&resume.path) {
        Some(index) => {
            resume.skip = true;
            resume.last_index = index;
        }
        None => {
            // Can't trust the bookkeeping; start from the first command.
            if let Err(e) = fs::remove_file(&resume.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to delete {:?}: {e}", resume.path);
                }
            }
        }
    }

    let streamer = match mode {
        Mode::Update => Some(Streamer::spawn(new_data)),
        Mode::Verify => None,
    };

    let mut runner = Runner {
        file: device,
        mode,
        version: list.version,
        policy: DiscardPolicy {
            is_retry: options.is_retry,
        },
        erase_as_zero: options.erase_as_zero,
        stash,
        stash_created,
        stash_map: HashMap::new(),
        patch_data,
        streamer,
        buffer: vec![],
        written: 0,
        stashed: 0,
        free_stash: None,
        unresumable: false,
        found_writes: false,
        target_verified: false,
    };

    let result = runner.run(&list, &mut resume, progress, cancel_signal);
    runner.finalize(result, &list, &resume.path, &marker_path)
}

struct Runner<'a> {
    file: File,
    mode: Mode,
    version: u8,
    policy: DiscardPolicy,
    erase_as_zero: bool,
    stash: Stash,
    /// Whether this invocation created the stash directory.
    stash_created: bool,
    /// Source ranges for stashes recorded during a dry run. The device
    /// hasn't been mutated yet, so the bytes are recoverable by re-reading
    /// and no disk I/O is needed just for a feasibility check.
    stash_map: HashMap<String, RangeSet>,
    patch_data: &'a [u8],
    streamer: Option<Streamer>,
    /// Scratch buffer for source data, reused across commands and only ever
    /// grown.
    buffer: Vec<u8>,
    written: u64,
    stashed: u64,
    /// Overlap stash to delete once the current command's write completes.
    free_stash: Option<String>,
    unresumable: bool,
    /// Whether any command so far actually needed to write.
    found_writes: bool,
    /// Whether the current command's target blocks already had the expected
    /// contents.
    target_verified: bool,
}

impl<'a> Runner<'a> {
    fn can_write(&self) -> bool {
        self.mode == Mode::Update
    }

    fn run(
        &mut self,
        list: &TransferList,
        resume: &mut Resume,
        progress: &mut dyn Write,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        for (index, command) in list.commands.iter().enumerate() {
            if cancel_signal.load(Ordering::SeqCst) {
                return Err(Error::Interrupted);
            }

            self.target_verified = false;

            // Write-only commands have nothing to check during a dry run.
            if !self.can_write()
                && matches!(
                    command.kind,
                    CommandKind::New | CommandKind::Zero | CommandKind::Erase,
                )
            {
                debug!("Skipping command [{}]", command.raw);
                continue;
            }

            // Skip commands a previous attempt already executed, except for
            // `new`, which must still consume its slice of the stream.
            if self.can_write()
                && resume.skip
                && index <= resume.last_index
                && command.kind != CommandKind::New
            {
                info!(
                    "Skipping already executed command {index} (last executed: {})",
                    resume.last_index,
                );
                continue;
            }

            debug!("Performing command [{}]", command.raw);

            self.perform_command(command).inspect_err(|_| {
                error!("Failed to execute command [{}]", command.raw);
            })?;

            // In verify mode, check that the previously executed commands
            // actually produced their target blocks. If not, the next update
            // attempt must resume from the first command.
            if !self.can_write()
                && resume.skip
                && index <= resume.last_index
                && matches!(
                    command.kind,
                    CommandKind::Move | CommandKind::Bsdiff | CommandKind::Imgdiff,
                )
                && !self.target_verified
            {
                warn!(
                    "Previously executed command {index} does not produce expected target blocks: {}",
                    command.raw,
                );
                resume.skip = false;
                if let Err(e) = fs::remove_file(&resume.path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to delete {:?}: {e}", resume.path);
                    }
                }
            }

            if self.can_write() {
                blockio::fsync(&self.file)?;

                let record = format!("{index}\n{}", command.raw);
                if let Err(e) = stash::write_atomic(&resume.path, record.as_bytes()) {
                    warn!("Failed to update the last command file: {e}");
                }

                let fraction = self.written as f64 / list.total_blocks as f64;
                writeln!(progress, "set_progress {fraction:.4}")?;
            }
        }

        Ok(())
    }

    fn perform_command(&mut self, command: &Command) -> Result<()> {
        let mut args = command.args();

        match command.kind {
            CommandKind::Abort => {
                info!("Aborting as instructed");
                Err(Error::Aborted)
            }
            CommandKind::Bsdiff => self.perform_diff(&mut args, PatchKind::Bsdiff),
            CommandKind::Erase => self.perform_erase(&mut args),
            CommandKind::Free => self.perform_free(&mut args),
            CommandKind::Imgdiff => self.perform_diff(&mut args, PatchKind::Imgdiff),
            CommandKind::Move => self.perform_move(&mut args),
            CommandKind::New => self.perform_new(&mut args),
            CommandKind::Stash => self.perform_stash(&mut args),
            CommandKind::Zero => self.perform_zero(&mut args, true),
        }
    }

    fn perform_move(&mut self, args: &mut Args) -> Result<()> {
        // move carries one hash: the source and target contents are the same.
        let hashes = if self.version >= 3 {
            let hash = args.next("src_hash")?.to_owned();
            Some((hash.clone(), hash))
        } else {
            None
        };

        let (tgt, blocks, load) = self.load_src_tgt(args, hashes)?;

        match load {
            SourceLoad::Fresh => {
                self.found_writes = true;

                if self.can_write() {
                    info!("Moving {blocks} blocks");
                    blockio::write_blocks(
                        &self.file,
                        &tgt,
                        &self.buffer[..blocks as usize * BLOCK_SIZE],
                        self.policy,
                    )?;
                }
            }
            SourceLoad::AlreadyApplied => {
                self.note_already_applied("move");

                if self.can_write() {
                    info!("Skipping {} already moved blocks", tgt.blocks());
                }
            }
        }

        self.release_free_stash();
        self.written += tgt.blocks();

        Ok(())
    }

    fn perform_diff(&mut self, args: &mut Args, kind: PatchKind) -> Result<()> {
        let hashes = if self.version >= 3 {
            let src_hash = args.next("src_hash")?.to_owned();
            let tgt_hash = args.next("tgt_hash")?.to_owned();
            Some((src_hash, tgt_hash))
        } else {
            None
        };

        let patch_offset = args.next_u64("patch_offset")?;
        let patch_length = args.next_u64("patch_len")?;

        let (tgt, blocks, load) = self.load_src_tgt(args, hashes)?;

        match load {
            SourceLoad::Fresh => {
                self.found_writes = true;

                if self.can_write() {
                    info!("Patching {blocks} blocks to {}", tgt.blocks());

                    let patch = self.patch_slice(patch_offset, patch_length)?;
                    let src = &self.buffer[..blocks as usize * BLOCK_SIZE];
                    let mut sink =
                        RangeSink::new(self.file.try_clone()?, tgt.clone(), self.policy);

                    match kind {
                        PatchKind::Bsdiff => bsdiff::apply(src, patch, &mut sink)?,
                        PatchKind::Imgdiff => imgdiff::apply(src, patch, &mut sink)?,
                    }

                    // The patch output must fill the target ranges exactly.
                    if !sink.finished() {
                        return Err(Error::SinkUnderrun(sink.available()));
                    }
                }
            }
            SourceLoad::AlreadyApplied => {
                self.note_already_applied("diff");

                if self.can_write() {
                    info!(
                        "Skipping {blocks} blocks already patched to {}",
                        tgt.blocks(),
                    );
                }
            }
        }

        self.release_free_stash();
        self.written += tgt.blocks();

        Ok(())
    }

    fn perform_stash(&mut self, args: &mut Args) -> Result<()> {
        let id = args.next("stash_id")?.to_owned();

        // Version 2 ids are opaque slot names; version 3+ ids are the
        // content hash, which makes the command idempotent.
        let use_hash = self.version >= 3;

        if use_hash && self.load_stash(&id, true).is_ok() {
            // The stash already exists with expected contents. Don't read
            // from the source again; it may have been overwritten during a
            // previous attempt.
            return Ok(());
        }

        let src = args.next_range("src_range")?;
        let blocks = src.blocks();
        let size = blocks as usize * BLOCK_SIZE;

        self.allocate(size);
        blockio::read_blocks(&self.file, &src, &mut self.buffer[..size])?;
        self.stash_map.insert(id.clone(), src);

        if use_hash && util::sha1_hex(&self.buffer[..size]) != id {
            // Unexpected source contents. Only fatal if the data is actually
            // needed later; the command that uses it may have completed in a
            // previous attempt, in which case its target check will pass.
            error!("Failed to load source blocks for stash {id}");
            return Ok(());
        }

        if !self.can_write() {
            return Ok(());
        }

        info!("Stashing {blocks} blocks to {id}");
        self.stash
            .write(&id, &self.buffer[..size], false, use_hash)?;
        self.stashed += blocks;

        Ok(())
    }

    fn perform_free(&mut self, args: &mut Args) -> Result<()> {
        let id = args.next("stash_id")?;

        self.stash_map.remove(id);

        if self.stash_created || self.can_write() {
            self.stash.free(id);
        }

        Ok(())
    }

    fn perform_zero(&mut self, args: &mut Args, counts_written: bool) -> Result<()> {
        let tgt = args.next_range("tgt_range")?;

        info!("Zeroing {} blocks", tgt.blocks());

        if self.can_write() {
            blockio::zero_blocks(&self.file, &tgt, self.policy)?;
        }

        // The erase fallback doesn't count toward progress.
        if counts_written {
            self.written += tgt.blocks();
        }

        Ok(())
    }

    fn perform_new(&mut self, args: &mut Args) -> Result<()> {
        let tgt = args.next_range("tgt_range")?;

        if self.can_write() {
            info!("Writing {} blocks of new data", tgt.blocks());

            let sink = RangeSink::new(self.file.try_clone()?, tgt.clone(), self.policy);
            let streamer = self
                .streamer
                .as_ref()
                .expect("Streamer always exists in update mode");

            streamer.feed(sink)?;
        }

        self.written += tgt.blocks();

        Ok(())
    }

    fn perform_erase(&mut self, args: &mut Args) -> Result<()> {
        if self.erase_as_zero {
            return self.perform_zero(args, false);
        }

        if !blockio::is_block_device(&self.file)? {
            error!("Not a block device; cannot erase");
            return Err(Error::NotBlockDevice);
        }

        let tgt = args.next_range("tgt_range")?;

        if self.can_write() {
            info!("Erasing {} blocks", tgt.blocks());

            for range in tgt.iter() {
                blockio::discard_blocks(
                    &self.file,
                    range.start * BLOCK_SIZE as u64,
                    range.len() * BLOCK_SIZE as u64,
                    self.policy,
                    true,
                )?;
            }
        }

        Ok(())
    }

    /// Load a command's target range and source data, dispatching on the
    /// version-specific argument grammar. `hashes` holds the source and
    /// target content hashes the caller already consumed (version 3+ only).
    /// Returns the target set, the number of source blocks now in the
    /// scratch buffer, and whether the command still needs to run.
    fn load_src_tgt(
        &mut self,
        args: &mut Args,
        hashes: Option<(String, String)>,
    ) -> Result<(RangeSet, u64, SourceLoad)> {
        match self.version {
            1 => self.load_src_tgt_v1(args),
            2 => self.load_src_tgt_v2(args),
            _ => {
                let (src_hash, tgt_hash) =
                    hashes.expect("Hashes always parsed for version 3+");
                self.load_src_tgt_v3(args, &src_hash, &tgt_hash)
            }
        }
    }

    /// Version 1: `<src_range> <tgt_range>`.
    fn load_src_tgt_v1(&mut self, args: &mut Args) -> Result<(RangeSet, u64, SourceLoad)> {
        let src = args.next_range("src_range")?;
        let tgt = args.next_range("tgt_range")?;

        let blocks = src.blocks();
        let size = blocks as usize * BLOCK_SIZE;

        self.allocate(size);
        blockio::read_blocks(&self.file, &src, &mut self.buffer[..size])?;

        Ok((tgt, blocks, SourceLoad::Fresh))
    }

    /// Version 2: `<tgt_range> <src_block_count> (...)`.
    fn load_src_tgt_v2(&mut self, args: &mut Args) -> Result<(RangeSet, u64, SourceLoad)> {
        let tgt = args.next_range("tgt_range")?;
        let (blocks, _) = self.load_source_blocks(args, &tgt)?;

        Ok((tgt, blocks, SourceLoad::Fresh))
    }

    /// Version 3+: as version 2, but the content hashes make the command
    /// idempotent and the update resumable.
    fn load_src_tgt_v3(
        &mut self,
        args: &mut Args,
        src_hash: &str,
        tgt_hash: &str,
    ) -> Result<(RangeSet, u64, SourceLoad)> {
        let tgt = args.next_range("tgt_range")?;

        let mut tgt_buffer = vec![0u8; tgt.blocks() as usize * BLOCK_SIZE];
        blockio::read_blocks(&self.file, &tgt, &mut tgt_buffer)?;

        if util::sha1_hex(&tgt_buffer) == tgt_hash {
            // Already applied in a previous, interrupted attempt.
            return Ok((tgt, 0, SourceLoad::AlreadyApplied));
        }

        let (blocks, overlap) = self.load_source_blocks(args, &tgt)?;
        let size = blocks as usize * BLOCK_SIZE;

        if util::sha1_hex(&self.buffer[..size]) == src_hash {
            // If source and target overlap, stash the source first so a
            // resume after a partial write still has a recovery point. A dry
            // run won't overwrite anything, so it can skip this.
            if overlap && self.can_write() {
                info!("Stashing {blocks} overlapping blocks to {src_hash}");

                let existed = self
                    .stash
                    .write(src_hash, &self.buffer[..size], true, true)?;
                self.stashed += blocks;

                if !existed {
                    // Can be deleted once the write has completed.
                    self.free_stash = Some(src_hash.to_owned());
                }
            }

            return Ok((tgt, blocks, SourceLoad::Fresh));
        }

        if overlap {
            if let Ok(data) = self.load_stash(src_hash, true) {
                // The overlapping source was stashed by a previous attempt.
                // We don't know whether the stash can be deleted safely
                // after this command, so leave it alone.
                self.allocate(data.len());
                self.buffer[..data.len()].copy_from_slice(&data);

                return Ok((tgt, blocks, SourceLoad::Fresh));
            }
        }

        error!("Source blocks have unexpected contents (expected {src_hash})");
        self.unresumable = true;

        Err(Error::Unresumable)
    }

    /// Fill the scratch buffer with a version 2+ command's source data:
    /// blocks read from the device, optionally rearranged in place, overlaid
    /// with any listed stash fragments at their designated positions.
    fn load_source_blocks(&mut self, args: &mut Args, tgt: &RangeSet) -> Result<(u64, bool)> {
        let src_blocks = args.next_u64("src_block_count")?;
        let size = src_blocks as usize * BLOCK_SIZE;

        self.allocate(size);

        let mut overlap = false;

        if args.peek() == Some("-") {
            // No source range; the data comes entirely from stashes.
            args.next("source")?;
        } else {
            let src = args.next_range("src_range")?;

            if src.blocks() > src_blocks {
                return Err(Error::BadCommand(format!(
                    "Source range holds {} blocks, but count is {src_blocks}",
                    src.blocks(),
                )));
            }

            overlap = src.overlaps(tgt);

            blockio::read_blocks(
                &self.file,
                &src,
                &mut self.buffer[..src.blocks() as usize * BLOCK_SIZE],
            )?;

            if !args.is_empty() {
                let locs = args.next_range("src_loc")?;

                validate_locations(&locs, src.blocks(), src_blocks)?;
                scatter_within(&mut self.buffer[..size], &locs);
            }
        }

        // Remaining tokens are `<stash_id>:<range>` overlays.
        while !args.is_empty() {
            let token = args.next("stash_ref")?;
            let (id, locs) = token
                .split_once(':')
                .ok_or_else(|| Error::BadCommand(format!("Invalid stash reference: {token:?}")))?;
            let locs: RangeSet = locs
                .parse()
                .map_err(crate::format::transfer::Error::RangeSet)?;

            validate_locations(&locs, locs.blocks(), src_blocks)?;

            match self.load_stash(id, false) {
                Ok(data) => {
                    if data.len() < locs.blocks() as usize * BLOCK_SIZE {
                        return Err(Error::BadCommand(format!(
                            "Stash {id} holds {} bytes, but needs {}",
                            data.len(),
                            locs.blocks() as usize * BLOCK_SIZE,
                        )));
                    }

                    scatter_from(&mut self.buffer[..size], &locs, &data);
                }
                Err(e) => {
                    // These source blocks will fail verification if they're
                    // used later; let the caller decide whether that's fatal.
                    error!("Failed to load stash {id}: {e}");
                }
            }
        }

        Ok((src_blocks, overlap))
    }

    /// Load a stash entry. During a dry run, stashes recorded in the
    /// in-memory map are satisfied by re-reading the source blocks, which
    /// are still intact.
    fn load_stash(&mut self, id: &str, verify: bool) -> Result<Vec<u8>> {
        if !self.can_write() {
            if let Some(src) = self.stash_map.get(id) {
                let mut buf = vec![0u8; src.blocks() as usize * BLOCK_SIZE];
                blockio::read_blocks(&self.file, src, &mut buf)?;

                // Hash-named stashes can be checked; version 2 slot names
                // can't.
                if self.version >= 3 {
                    let actual = util::sha1_hex(&buf);
                    if actual != id {
                        error!("Failed to verify source blocks in stash map for {id}");
                        return Err(Error::Stash(stash::Error::MismatchedHash {
                            id: id.to_owned(),
                            actual,
                        }));
                    }
                }

                return Ok(buf);
            }
        }

        Ok(self.stash.load(id, verify)?)
    }

    fn note_already_applied(&mut self, what: &str) {
        self.target_verified = true;

        if self.found_writes {
            warn!("Commands executed out of order [{what}]");
        }
    }

    fn release_free_stash(&mut self) {
        if let Some(id) = self.free_stash.take() {
            self.stash.free(&id);
        }
    }

    fn patch_slice(&self, offset: u64, length: u64) -> Result<&'a [u8]> {
        let data = self.patch_data;
        let end = offset
            .checked_add(length)
            .filter(|&e| e <= data.len() as u64)
            .ok_or(Error::PatchBounds {
                offset,
                length,
                size: data.len() as u64,
            })?;

        Ok(&data[offset as usize..end as usize])
    }

    /// Grow the scratch buffer if needed. It's reused across commands, so it
    /// only ever grows.
    fn allocate(&mut self, size: usize) {
        if self.buffer.len() < size {
            self.buffer.resize(size, 0);
        }
    }

    fn finalize(
        mut self,
        mut result: Result<()>,
        list: &TransferList,
        resume_path: &Path,
        marker_path: &Path,
    ) -> Result<Stats> {
        if let Some(streamer) = self.streamer.take() {
            if let Err(e) = streamer.finish() {
                warn!("New data stream failed: {e}");
            }
        }

        if self.can_write() && result.is_ok() {
            info!("Wrote {} blocks; expected {}", self.written, list.total_blocks);
            info!("Stashed {} blocks", self.stashed);
            info!("Max scratch allocation was {} bytes", self.buffer.len());

            // The stash may contain blocks needed to complete the update
            // later, so only delete it after full success.
            if self.version >= 2 {
                self.stash.delete();
            }
            if let Err(e) = remove_file_if_exists(resume_path) {
                warn!("Failed to delete {resume_path:?}: {e}");
            }
            if let Err(e) = stash::write_atomic(marker_path, b"") {
                warn!("Failed to write updated marker; continuing: {e}");
            }
        } else if result.is_ok() {
            info!("Verified partition contents; update may be resumed");
        }

        if let Err(e) = blockio::fsync(&self.file) {
            if result.is_ok() {
                result = Err(e.into());
            }
        }

        if self.unresumable {
            // Don't let a caller blindly retry against data already known to
            // be unrecoverable.
            if let Err(e) = remove_file_if_exists(resume_path) {
                warn!("Failed to delete {resume_path:?}: {e}");
            }
        }

        if self.unresumable || (!self.can_write() && self.stash_created) {
            self.stash.delete();
        }

        result.map(|()| Stats {
            written: self.written,
            stashed: self.stashed,
        })
    }
}

/// Scatter packed data within `buffer` to the block positions in `locs`.
/// The producer emits location sets in ascending order, so processing them
/// back to front never overwrites packed data that hasn't moved yet.
fn scatter_within(buffer: &mut [u8], locs: &RangeSet) {
    let mut packed = locs.blocks();

    for range in locs.iter().rev() {
        packed -= range.len();

        let src = packed as usize * BLOCK_SIZE
            ..(packed + range.len()) as usize * BLOCK_SIZE;
        buffer.copy_within(src, range.start as usize * BLOCK_SIZE);
    }
}

/// Copy packed `data` into `buffer` at the block positions in `locs`.
fn scatter_from(buffer: &mut [u8], locs: &RangeSet, data: &[u8]) {
    let mut packed = 0usize;

    for range in locs.iter() {
        let size = range.len() as usize * BLOCK_SIZE;
        let start = range.start as usize * BLOCK_SIZE;

        buffer[start..start + size].copy_from_slice(&data[packed..packed + size]);
        packed += size;
    }
}

fn validate_locations(locs: &RangeSet, expected_blocks: u64, total_blocks: u64) -> Result<()> {
    if locs.blocks() != expected_blocks {
        return Err(Error::BadCommand(format!(
            "Location set holds {} blocks, but expected {expected_blocks}",
            locs.blocks(),
        )));
    }

    if locs.iter().any(|r| r.end > total_blocks) {
        return Err(Error::BadCommand(format!(
            "Location set exceeds the {total_blocks} source blocks",
        )));
    }

    Ok(())
}

fn sibling_path(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Parse the saved `<index>\n<command line>` bookkeeping from a previous
/// attempt. Any malformation means the file can't be trusted.
fn parse_last_command(path: &Path) -> Option<usize> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to read {path:?}: {e}");
            }
            return None;
        }
    };

    let lines = content.trim_end().split('\n').collect::<Vec<_>>();
    if lines.len() != 2 {
        error!("Unexpected line count in last command file: {}", lines.len());
        return None;
    }

    match lines[0].parse() {
        Ok(index) => Some(index),
        Err(_) => {
            error!("Failed to parse last command index: {:?}", lines[0]);
            None
        }
    }
}
