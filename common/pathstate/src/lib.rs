// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Records what the environment assembler did to each path of a mount
//! namespace, so the result can be introspected, harvested or torn down.

mod mounttab;
mod tree;

pub use mounttab::*;
pub use tree::*;
