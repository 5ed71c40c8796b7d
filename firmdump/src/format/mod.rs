// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod compression;
pub mod lp;
pub mod payload;
pub mod sparse;
pub mod transfer;
