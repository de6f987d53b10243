// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Turns a captured directory tree into a layer configuration by applying
//! per-path policies from a profile, then verifying that no file in the tree
//! was left unaccounted for.

mod analyzer;
mod profile;

pub use analyzer::*;
pub use profile::*;
