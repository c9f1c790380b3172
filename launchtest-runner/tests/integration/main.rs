// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

// Workers in these tests are small `sh` scripts.
#![cfg(unix)]

mod basic;
mod fixtures;
mod results;
