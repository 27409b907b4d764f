// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, OpenOptions},
    io::{Cursor, Write},
    path::PathBuf,
    sync::atomic::AtomicBool,
};

use assert_matches::assert_matches;
use bzip2::{Compression, write::BzEncoder};

use blockimg::{
    blockio::BLOCK_SIZE,
    engine::{self, Error, Mode, Options, Stats},
    stash::Stash,
    util,
};

struct TestEnv {
    _temp_dir: tempfile::TempDir,
    image_path: PathBuf,
    options: Options,
}

impl TestEnv {
    fn new(image: &[u8]) -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let image_path = temp_dir.path().join("image.bin");
        fs::write(&image_path, image).unwrap();

        let options = Options {
            is_retry: false,
            erase_as_zero: true,
            stash_root: temp_dir.path().join("stash"),
        };

        Self {
            _temp_dir: temp_dir,
            image_path,
            options,
        }
    }

    fn run(
        &self,
        transfer_list: &str,
        new_data: &[u8],
        patch_data: &[u8],
        mode: Mode,
    ) -> (Result<Stats, Error>, String) {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.image_path)
            .unwrap();
        let cancel_signal = AtomicBool::new(false);
        let mut progress = vec![];

        let result = engine::apply(
            device,
            self.image_path.to_str().unwrap(),
            transfer_list,
            Cursor::new(new_data.to_vec()),
            patch_data,
            mode,
            &self.options,
            &mut progress,
            &cancel_signal,
        );

        (result, String::from_utf8(progress).unwrap())
    }

    fn image(&self) -> Vec<u8> {
        fs::read(&self.image_path).unwrap()
    }

    fn stash_dir(&self) -> PathBuf {
        Stash::new(
            &self.options.stash_root,
            self.image_path.to_str().unwrap(),
        )
        .directory()
        .to_owned()
    }
}

/// One block per byte value, so every block has distinct contents.
fn patterned(bytes: &[u8]) -> Vec<u8> {
    let mut data = vec![];
    for &byte in bytes {
        data.extend_from_slice(&vec![byte; BLOCK_SIZE]);
    }
    data
}

fn sha1_of_blocks(image: &[u8], blocks: impl IntoIterator<Item = usize>) -> String {
    let mut data = vec![];
    for block in blocks {
        data.extend_from_slice(&image[block * BLOCK_SIZE..(block + 1) * BLOCK_SIZE]);
    }
    util::sha1_hex(&data)
}

#[test]
fn zero_and_new_end_to_end() {
    let env = TestEnv::new(&vec![0xffu8; 100 * BLOCK_SIZE]);
    let new_data = (0..50 * BLOCK_SIZE)
        .map(|i| (i % 253) as u8)
        .collect::<Vec<_>>();

    let list = "1\n100\nzero 2,0,50\nnew 2,50,100\n";
    let (result, progress) = env.run(list, &new_data, &[], Mode::Update);

    let stats = result.unwrap();
    assert_eq!(stats.written, 100);

    let image = env.image();
    assert!(image[..50 * BLOCK_SIZE].iter().all(|&b| b == 0));
    assert_eq!(&image[50 * BLOCK_SIZE..], &new_data[..]);

    assert_eq!(progress.lines().next(), Some("set_progress 0.5000"));
    assert_eq!(progress.lines().last(), Some("set_progress 1.0000"));
}

#[test]
fn v1_move_copies_source_to_target() {
    let env = TestEnv::new(&patterned(&[0x11, 0x22, 0x00, 0x00]));

    let list = "1\n2\nmove 2,0,2 2,2,4\n";
    let (result, _) = env.run(list, &[], &[], Mode::Update);

    assert_eq!(result.unwrap().written, 2);
    assert_eq!(env.image(), patterned(&[0x11, 0x22, 0x11, 0x22]));
}

#[test]
fn v2_move_composed_from_stash() {
    let env = TestEnv::new(&patterned(&[0x11, 0x22, 0x00, 0x00]));

    // Stash blocks 0-1, zero them, then reconstruct them at blocks 2-3
    // purely from the stash.
    let list = "2\n4\n1\n2\n\
                stash 0 2,0,2\n\
                zero 2,0,2\n\
                move 2,2,4 2 - 0:2,0,2\n";
    let (result, _) = env.run(list, &[], &[], Mode::Update);

    let stats = result.unwrap();
    assert_eq!(stats.written, 4);
    assert_eq!(stats.stashed, 2);
    assert_eq!(env.image(), patterned(&[0x00, 0x00, 0x11, 0x22]));

    // The stash directory is deleted after a successful update.
    assert!(!env.stash_dir().exists());
}

#[test]
fn v2_move_with_rearranged_source_and_stash() {
    let env = TestEnv::new(&patterned(&[0x11, 0x22, 0x33, 0x00, 0x00, 0x00]));

    // Blocks 0-1 are read packed and scattered to positions 0 and 2 of the
    // source buffer; the stashed block 2 fills the gap at position 1.
    let list = "2\n4\n1\n1\n\
                stash 0 2,2,3\n\
                zero 2,2,3\n\
                move 2,3,6 3 2,0,2 4,0,1,2,3 0:2,1,2\n";
    let (result, _) = env.run(list, &[], &[], Mode::Update);

    result.unwrap();
    assert_eq!(
        env.image(),
        patterned(&[0x11, 0x22, 0x00, 0x11, 0x33, 0x22]),
    );
}

#[test]
fn v3_overlapping_move_is_idempotent() {
    let initial = patterned(&[0x11, 0x22, 0x33, 0x44]);
    let env = TestEnv::new(&initial);

    let src_hash = sha1_of_blocks(&initial, [0, 1]);
    let list = format!("3\n2\n1\n2\nmove {src_hash} 2,1,3 2 2,0,2\n");

    let (result, _) = env.run(&list, &[], &[], Mode::Update);
    assert_eq!(result.unwrap().written, 2);

    let expected = patterned(&[0x11, 0x11, 0x22, 0x44]);
    assert_eq!(env.image(), expected);

    // A full re-run sees the target hash already matching and skips the
    // command, producing a byte-identical image.
    let (result, _) = env.run(&list, &[], &[], Mode::Update);
    assert_eq!(result.unwrap().written, 2);
    assert_eq!(env.image(), expected);
}

#[test]
fn v3_resume_consumes_stash_after_partial_write() {
    let initial = patterned(&[0x11, 0x22, 0x33, 0x44]);
    let env = TestEnv::new(&initial);

    let src_hash = sha1_of_blocks(&initial, [0, 1]);
    let list = format!("3\n2\n1\n2\nmove {src_hash} 2,1,3 2 2,0,2\n");

    // Simulate an interrupted run that stashed the overlapping source and
    // then died mid-write, leaving garbage in both source and target.
    let stash = Stash::new(&env.options.stash_root, env.image_path.to_str().unwrap());
    stash.create(2).unwrap();
    stash
        .write(&src_hash, &initial[..2 * BLOCK_SIZE], false, true)
        .unwrap();

    fs::write(&env.image_path, patterned(&[0x99, 0x98, 0x97, 0x44])).unwrap();

    let (result, _) = env.run(&list, &[], &[], Mode::Update);
    assert_eq!(result.unwrap().written, 2);

    let image = env.image();
    assert_eq!(
        &image[BLOCK_SIZE..3 * BLOCK_SIZE],
        &initial[..2 * BLOCK_SIZE],
    );
}

#[test]
fn v3_unrecoverable_source_is_unresumable() {
    let env = TestEnv::new(&patterned(&[0x11, 0x22, 0x33, 0x44]));

    // Hash of data that is neither in the target nor the source nor any
    // stash.
    let bogus_hash = util::sha1_hex(b"data that never existed");
    let list = format!("3\n2\n1\n2\nmove {bogus_hash} 2,1,3 2 2,0,2\n");

    let stash_dir = env.stash_dir();
    let (result, _) = env.run(&list, &[], &[], Mode::Update);

    let error = result.unwrap_err();
    assert_matches!(error, Error::Unresumable);
    assert!(error.is_unresumable());

    // An unresumable failure deletes the stash directory so the caller
    // can't blindly retry.
    assert!(!stash_dir.exists());
}

#[test]
fn verify_mode_does_not_modify_image() {
    let initial = patterned(&[0x11, 0x22, 0x33, 0x44]);
    let env = TestEnv::new(&initial);

    let src_hash = sha1_of_blocks(&initial, [0, 1]);
    let list = format!(
        "3\n4\n1\n2\n\
         stash {src_hash} 2,0,2\n\
         move {src_hash} 2,1,3 2 2,0,2\n\
         zero 2,0,1\n",
    );

    let (result, progress) = env.run(&list, &[], &[], Mode::Verify);

    result.unwrap();
    assert_eq!(env.image(), initial);
    // No progress is reported during a dry run.
    assert_eq!(progress, "");
    // A dry run that created the stash directory cleans it up.
    assert!(!env.stash_dir().exists());
}

#[test]
fn stash_space_check_fails_up_front() {
    let env = TestEnv::new(&patterned(&[0x11]));

    // More blocks than any filesystem will have room for.
    let list = "2\n1\n1\n1099511627776\nzero 2,0,1\n";
    let (result, _) = env.run(list, &[], &[], Mode::Update);

    assert_matches!(
        result.unwrap_err(),
        Error::Stash(blockimg::stash::Error::NotEnoughSpace { .. })
    );
}

#[test]
fn erase_requires_block_device_unless_degraded() {
    let initial = patterned(&[0x11, 0x22]);

    // Degraded mode zero-fills instead.
    let env = TestEnv::new(&initial);
    let (result, _) = env.run("1\n1\nerase 2,0,1\n", &[], &[], Mode::Update);
    result.unwrap();

    let image = env.image();
    assert!(image[..BLOCK_SIZE].iter().all(|&b| b == 0));
    assert_eq!(&image[BLOCK_SIZE..], &initial[BLOCK_SIZE..]);

    // Strict mode refuses to erase a regular file.
    let mut env = TestEnv::new(&initial);
    env.options.erase_as_zero = false;
    let (result, _) = env.run("1\n1\nerase 2,0,1\n", &[], &[], Mode::Update);
    assert_matches!(result.unwrap_err(), Error::NotBlockDevice);
}

#[test]
fn abort_command_fails_the_update() {
    let env = TestEnv::new(&patterned(&[0x11]));

    let (result, _) = env.run("1\n1\nabort\nzero 2,0,1\n", &[], &[], Mode::Update);
    assert_matches!(result.unwrap_err(), Error::Aborted);

    // Nothing after the abort ran.
    assert_eq!(env.image(), patterned(&[0x11]));
}

#[test]
fn second_run_skips_commands_before_last_executed() {
    let initial = patterned(&[0x11, 0x22, 0x00, 0x00]);
    let env = TestEnv::new(&initial);

    let list = "1\n4\nmove 2,0,2 2,2,4\nzero 2,0,2\n";
    let (result, _) = env.run(list, &[], &[], Mode::Update);
    result.unwrap();

    let after_first = env.image();
    assert_eq!(after_first, patterned(&[0x00, 0x00, 0x11, 0x22]));

    // Simulate a crash right after the first command of a fresh run: only
    // its index is recorded.
    fs::create_dir_all(&env.options.stash_root).unwrap();
    let resume_path = {
        let mut name = env.stash_dir().into_os_string();
        name.push(".last_command");
        PathBuf::from(name)
    };
    fs::write(&resume_path, "0\nmove 2,0,2 2,2,4").unwrap();

    // The first run already zeroed the move's source blocks, so redoing the
    // move would wipe the target. The recorded index makes the engine skip
    // it instead.
    let (result, _) = env.run(list, &[], &[], Mode::Update);
    result.unwrap();

    let image = env.image();
    assert_eq!(&image[2 * BLOCK_SIZE..], &after_first[2 * BLOCK_SIZE..]);
}

fn bsdiff_identity_patch(len: usize) -> Vec<u8> {
    let bz = |data: &[u8]| {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    };

    let mut ctrl_raw = vec![];
    ctrl_raw.extend_from_slice(&(len as u64).to_le_bytes());
    ctrl_raw.extend_from_slice(&0u64.to_le_bytes());
    ctrl_raw.extend_from_slice(&0u64.to_le_bytes());

    let ctrl = bz(&ctrl_raw);
    let diff = bz(&vec![1u8; len]);
    let extra = bz(b"");

    let mut patch = b"BSDIFF40".to_vec();
    patch.extend_from_slice(&(ctrl.len() as u64).to_le_bytes());
    patch.extend_from_slice(&(diff.len() as u64).to_le_bytes());
    patch.extend_from_slice(&(len as u64).to_le_bytes());
    patch.extend_from_slice(&ctrl);
    patch.extend_from_slice(&diff);
    patch.extend_from_slice(&extra);
    patch
}

#[test]
fn v3_bsdiff_streams_across_disjoint_targets() {
    let initial = patterned(&[0x11, 0x22, 0x00, 0x33, 0x00]);
    let env = TestEnv::new(&initial);

    // The patch adds 1 to every source byte and lands on two disjoint
    // target ranges (blocks 2 and 4).
    let patch = bsdiff_identity_patch(2 * BLOCK_SIZE);
    let expected_target = patterned(&[0x12, 0x23]);

    let src_hash = sha1_of_blocks(&initial, [0, 1]);
    let tgt_hash = util::sha1_hex(&expected_target);
    let list = format!(
        "3\n2\n0\n0\nbsdiff {src_hash} {tgt_hash} 0 {} 4,2,3,4,5 2 2,0,2\n",
        patch.len(),
    );

    let (result, _) = env.run(&list, &[], &patch, Mode::Update);
    assert_eq!(result.unwrap().written, 2);

    let image = env.image();
    assert_eq!(
        &image[2 * BLOCK_SIZE..3 * BLOCK_SIZE],
        &expected_target[..BLOCK_SIZE],
    );
    assert_eq!(
        &image[4 * BLOCK_SIZE..5 * BLOCK_SIZE],
        &expected_target[BLOCK_SIZE..],
    );
    // Untouched blocks stay put.
    assert_eq!(&image[3 * BLOCK_SIZE..4 * BLOCK_SIZE], &initial[3 * BLOCK_SIZE..4 * BLOCK_SIZE]);
}

#[test]
fn total_blocks_zero_is_a_no_op() {
    let env = TestEnv::new(&patterned(&[0x11]));

    let (result, progress) = env.run("3\n0\n0\n0\n", &[], &[], Mode::Update);
    assert_eq!(result.unwrap(), Stats::default());
    assert_eq!(progress, "");
}

#[test]
fn retry_skips_partition_with_updated_marker() {
    let initial = patterned(&[0x11, 0x22, 0x00, 0x00]);
    let env = TestEnv::new(&initial);

    let list = "1\n2\nmove 2,0,2 2,2,4\n";
    let (result, _) = env.run(list, &[], &[], Mode::Update);
    result.unwrap();

    let updated = env.image();

    // Retrying after full success doesn't touch the image again.
    let mut retry_env_options = env.options.clone();
    retry_env_options.is_retry = true;
    let env = TestEnv {
        options: retry_env_options,
        ..env
    };

    let (result, _) = env.run(list, &[], &[], Mode::Update);
    assert_eq!(result.unwrap(), Stats::default());
    assert_eq!(env.image(), updated);
}
