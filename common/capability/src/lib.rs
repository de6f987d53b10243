// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Capability identifiers of the form `name-V1.V2...Vk` and the symlink
//! registry that maps them to configuration files.

mod registry;
mod version;

pub use registry::*;
pub use version::*;
