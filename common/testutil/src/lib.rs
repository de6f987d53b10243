// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Helpers for unit tests that mount filesystems or build directory
//! fixtures.

mod namespace;
mod tree;

pub use namespace::*;
pub use tree::*;
