// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Thin wrappers over the filesystem and namespace syscalls the rest of the
//! workspace builds on.

mod compare;
mod mounts;
mod namespace;
mod paths;
mod remove;
mod tempdir;
mod walk;

pub use compare::*;
pub use mounts::*;
pub use namespace::*;
pub use paths::*;
pub use remove::*;
pub use tempdir::*;
pub use walk::*;
