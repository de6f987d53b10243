// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::{Path, PathBuf};

use anyhow::Result;
use walkdir::WalkDir;

/// Creates files (with parent directories) under `root`. An entry whose path
/// ends with `/` becomes an empty directory instead.
pub fn write_tree(root: &Path, entries: &[(&str, &str)]) -> Result<()> {
    for (path, content) in entries {
        if let Some(dir) = path.strip_suffix('/') {
            std::fs::create_dir_all(root.join(dir))?;
            continue;
        }
        let path = root.join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
    }
    Ok(())
}

/// Lists every entry under `root` as a sorted vector of relative paths.
pub fn list_tree(root: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        paths.push(entry.path().strip_prefix(root)?.to_path_buf());
    }
    Ok(paths)
}
