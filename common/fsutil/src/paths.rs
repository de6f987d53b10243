// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::{Path, PathBuf};

/// Maps an absolute view path under a different root, e.g. `/usr/bin` under
/// `/srv/image` becomes `/srv/image/usr/bin`. A root of `/` returns the path
/// unchanged.
pub fn rebase(path: &Path, root: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(_) => root.join(path),
    }
}

/// Strips `root` from a physical path, yielding the absolute path as seen
/// inside the view rooted there.
pub fn unbase(path: &Path, root: &Path) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(relative) => Path::new("/").join(relative),
        Err(_) => path.to_path_buf(),
    }
}
