// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Turns a flattened environment into an actual mount-namespace view,
//! recording every mutation in a path-state tree.

mod assemble;
mod ldconfig;
mod runtime;
mod setup;

pub use assemble::*;
pub use ldconfig::*;
pub use runtime::*;
pub use setup::*;

// Run mount-performing unit tests in a private mount namespace.
#[cfg(test)]
#[used]
#[link_section = ".init_array"]
static _CTOR: extern "C" fn() = ::testutil::ctor_enter_mount_namespace;
