// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod args;
pub mod completion;
pub mod dump;
pub mod lp;
pub mod normalize;
pub mod payload;
pub mod sparse;
