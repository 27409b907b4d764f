// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use sha1::{Digest, Sha1};

/// Compute the SHA-1 digest of a buffer and render it as lowercase hex, the
/// form used for stash ids and transfer list hashes.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}
