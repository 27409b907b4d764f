// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod bsdiff;
pub mod imgdiff;
pub mod rangeset;
pub mod transfer;
