// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Content-addressed persistence of source blocks. Each stash entry is a file
//! named after the SHA-1 of its contents, living in a per-device directory
//! under the stash root. Writes go to a `.partial` file first and only become
//! visible after an fsync + rename + directory fsync, so an interrupted write
//! can never be mistaken for a finished entry.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    blockio::{self, BLOCK_SIZE},
    util,
};

/// Suffix for in-progress writes. Leftovers are crash artifacts and are
/// deleted when the stash directory is reused.
const PARTIAL_SUFFIX: &str = ".partial";

#[cfg(unix)]
const STASH_DIRECTORY_MODE: u32 = 0o700;
#[cfg(unix)]
const STASH_FILE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Not enough space for stash: {needed} bytes needed, {available} available")]
    NotEnoughSpace { needed: u64, available: u64 },
    #[error("Stash not found: {id}")]
    NotFound { id: String },
    #[error("Stash {id} size {size} is not a multiple of the block size")]
    Misaligned { id: String, size: u64 },
    #[error("Stash {id} has unexpected contents: {actual}")]
    MismatchedHash { id: String, actual: String },
    #[error("I/O error on {path:?}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Block I/O error")]
    BlockIo(#[from] blockio::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Whether [`Stash::create`] made a new directory or found one left behind by
/// an interrupted run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirState {
    Created,
    Reused,
}

/// The stash directory for one target device.
pub struct Stash {
    dir: PathBuf,
}

impl Stash {
    /// The directory name is derived from the device path so that concurrent
    /// updates to different partitions never collide.
    pub fn new(root: &Path, device_path: &str) -> Self {
        Self {
            dir: root.join(util::sha1_hex(device_path.as_bytes())),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn partial_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}{PARTIAL_SUFFIX}"))
    }

    /// Create the stash directory if needed and verify that the filesystem
    /// has room for `max_blocks` blocks. When reusing a directory from an
    /// interrupted run, leftover partial writes are deleted first and space
    /// already occupied by finished entries counts toward the requirement.
    pub fn create(&self, max_blocks: u64) -> Result<DirState> {
        let needed = max_blocks * BLOCK_SIZE as u64;

        if !self.dir.exists() {
            info!("Creating stash {:?}", self.dir);
            create_dir_all(&self.dir)?;
            self.check_space(needed)?;

            return Ok(DirState::Created);
        }

        info!("Using existing stash {:?}", self.dir);

        let mut existing = 0;

        for entry in self.entries()? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                delete_file(&entry.path());
            } else if let Ok(metadata) = entry.metadata() {
                existing += metadata.len();
            }
        }

        if needed > existing {
            self.check_space(needed - existing)?;
        }

        Ok(DirState::Reused)
    }

    fn check_space(&self, needed: u64) -> Result<()> {
        let available = free_space(&self.dir).map_err(|e| Error::File {
            path: self.dir.clone(),
            source: e,
        })?;

        if available < needed {
            return Err(Error::NotEnoughSpace { needed, available });
        }

        Ok(())
    }

    fn entries(&self) -> Result<impl Iterator<Item = fs::DirEntry>> {
        let iter = fs::read_dir(&self.dir).map_err(|e| Error::File {
            path: self.dir.clone(),
            source: e,
        })?;

        Ok(iter
            .flatten()
            .filter(|e| e.file_type().is_ok_and(|t| t.is_file())))
    }

    /// Durably write a stash entry. With `skip_existing` (used when the name
    /// is the hash of the contents), an existing entry is skipped instead of
    /// rewritten. Returns whether the entry already existed.
    pub fn write(&self, id: &str, data: &[u8], check_space: bool, skip_existing: bool) -> Result<bool> {
        if check_space {
            self.check_space(data.len() as u64)?;
        }

        let final_path = self.entry_path(id);
        if skip_existing && final_path.exists() {
            debug!("Skipping existing stash entry {id}");
            return Ok(true);
        }

        let partial_path = self.partial_path(id);

        info!("Writing {} blocks to stash {id}", data.len() / BLOCK_SIZE);

        {
            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(STASH_FILE_MODE);
            }

            let mut file = options.open(&partial_path).map_err(|e| Error::File {
                path: partial_path.clone(),
                source: e,
            })?;
            file.write_all(data).map_err(|e| Error::File {
                path: partial_path.clone(),
                source: e,
            })?;
            file.sync_all().map_err(|e| Error::File {
                path: partial_path.clone(),
                source: e,
            })?;
        }

        fs::rename(&partial_path, &final_path).map_err(|e| Error::File {
            path: partial_path.clone(),
            source: e,
        })?;
        blockio::fsync_dir(&self.dir)?;

        Ok(false)
    }

    /// Read a stash entry back. With `verify`, the contents are re-hashed
    /// against the id; a mismatch deletes the corrupt file so a retry won't
    /// trust it either.
    pub fn load(&self, id: &str, verify: bool) -> Result<Vec<u8>> {
        let path = self.entry_path(id);

        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound { id: id.to_owned() });
            }
            Err(e) => return Err(Error::File { path, source: e }),
        };

        let size = file
            .metadata()
            .map_err(|e| Error::File {
                path: path.clone(),
                source: e,
            })?
            .len();
        if size % BLOCK_SIZE as u64 != 0 {
            return Err(Error::Misaligned {
                id: id.to_owned(),
                size,
            });
        }

        debug!("Loading stash {id}");

        let mut buf = Vec::with_capacity(size as usize);
        file.read_to_end(&mut buf).map_err(|e| Error::File {
            path: path.clone(),
            source: e,
        })?;

        if verify {
            let actual = util::sha1_hex(&buf);
            if actual != id {
                delete_file(&path);
                return Err(Error::MismatchedHash {
                    id: id.to_owned(),
                    actual,
                });
            }
        }

        Ok(buf)
    }

    /// Delete one entry, tolerating "already absent".
    pub fn free(&self, id: &str) {
        delete_file(&self.entry_path(id));
    }

    /// Delete every entry and the directory itself, tolerating "already
    /// absent". Errors are logged; there is nothing useful to do about them.
    pub fn delete(&self) {
        info!("Deleting stash {:?}", self.dir);

        if let Ok(entries) = self.entries() {
            for entry in entries {
                delete_file(&entry.path());
            }
        }

        if let Err(e) = fs::remove_dir(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                error!("Failed to remove {:?}: {e}", self.dir);
            }
        }
    }
}

fn create_dir_all(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(STASH_DIRECTORY_MODE);
    }

    builder.create(path).map_err(|e| Error::File {
        path: path.to_owned(),
        source: e,
    })
}

fn delete_file(path: &Path) {
    debug!("Deleting {path:?}");

    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            error!("Failed to delete {path:?}: {e}");
        }
    }
}

/// Atomically (write temp, fsync, rename, fsync dir) replace the contents of
/// a small state file. Used for the resume bookkeeping next to the stash.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    {
        let mut file = File::create(&temp).map_err(|e| Error::File {
            path: temp.clone(),
            source: e,
        })?;
        file.write_all(contents).map_err(|e| Error::File {
            path: temp.clone(),
            source: e,
        })?;
        file.sync_all().map_err(|e| Error::File {
            path: temp.clone(),
            source: e,
        })?;
    }

    fs::rename(&temp, path).map_err(|e| Error::File {
        path: temp.clone(),
        source: e,
    })?;

    if let Some(parent) = path.parent() {
        blockio::fsync_dir(parent)?;
    }

    Ok(())
}

#[cfg(unix)]
fn free_space(path: &Path) -> io::Result<u64> {
    use std::{ffi::CString, os::unix::ffi::OsStrExt};

    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let mut stat = unsafe { std::mem::zeroed::<libc::statvfs>() };

    if unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // The field types vary across platforms.
    #[allow(clippy::unnecessary_cast, clippy::cast_lossless)]
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn free_space(_path: &Path) -> io::Result<u64> {
    Ok(u64::MAX)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn block_data(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE]
    }

    #[test]
    fn write_load_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let stash = Stash::new(root.path(), "/dev/block/test");
        stash.create(1).unwrap();

        let data = block_data(0x5a);
        let id = util::sha1_hex(&data);

        assert!(!stash.write(&id, &data, false, true).unwrap());
        // Content-addressed: a second write is a skip.
        assert!(stash.write(&id, &data, false, true).unwrap());

        assert_eq!(stash.load(&id, true).unwrap(), data);
    }

    #[test]
    fn load_verify_deletes_corrupt_entry() {
        let root = tempfile::tempdir().unwrap();
        let stash = Stash::new(root.path(), "/dev/block/test");
        stash.create(1).unwrap();

        let id = util::sha1_hex(&block_data(1));
        stash.write(&id, &block_data(2), false, true).unwrap();

        assert_matches!(stash.load(&id, true), Err(Error::MismatchedHash { .. }));
        assert!(!stash.entry_path(&id).exists());

        assert_matches!(stash.load(&id, true), Err(Error::NotFound { .. }));
    }

    #[test]
    fn create_reuse_cleans_partial_files() {
        let root = tempfile::tempdir().unwrap();
        let stash = Stash::new(root.path(), "/dev/block/test");
        assert_eq!(stash.create(1).unwrap(), DirState::Created);

        let leftover = stash.directory().join("deadbeef.partial");
        fs::write(&leftover, b"junk").unwrap();

        assert_eq!(stash.create(1).unwrap(), DirState::Reused);
        assert!(!leftover.exists());
    }

    #[test]
    fn misaligned_entry_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let stash = Stash::new(root.path(), "/dev/block/test");
        stash.create(1).unwrap();

        fs::write(stash.entry_path("abc123"), b"short").unwrap();

        assert_matches!(
            stash.load("abc123", false),
            Err(Error::Misaligned { size: 5, .. })
        );
    }

    #[test]
    fn delete_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let stash = Stash::new(root.path(), "/dev/block/test");
        stash.create(1).unwrap();

        let data = block_data(9);
        stash
            .write(&util::sha1_hex(&data), &data, false, true)
            .unwrap();

        stash.delete();
        assert!(!stash.directory().exists());

        // Tolerates "already absent".
        stash.delete();
    }
}
