// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The capture pipeline: runs a build command in a view where every mount is
//! re-overlaid with a dedicated upper directory, then turns the union of the
//! non-empty uppers into a standalone layer.

mod capture;

pub use capture::*;

// Run mount-performing unit tests in a private mount namespace.
#[cfg(test)]
#[used]
#[link_section = ".init_array"]
static _CTOR: extern "C" fn() = ::testutil::ctor_enter_mount_namespace;
