// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The wormhole configuration model: environments made of layers, layers
//! made of path directives, and the profiles that map commands onto
//! environments. Includes the text loader/writer and reference flattening.

mod flatten;
mod lexer;
mod parser;
mod types;
mod writer;

pub use flatten::*;
pub use types::*;
