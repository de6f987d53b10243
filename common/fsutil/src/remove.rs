// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{os::unix::fs::PermissionsExt, path::Path};

use anyhow::{Context, Result};

/// Removes a directory tree, restoring owner permissions on entries that
/// would otherwise refuse deletion (overlay upper dirs frequently contain
/// mode-0 directories copied up from read-only layers).
pub fn remove_dir_all_with_chmod(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
        }
    }

    chmod_tree_writable(path)?;
    std::fs::remove_dir_all(path)
        .with_context(|| format!("Failed to remove {}", path.display()))
}

/// Removes a single file, making its parent writable first if needed.
pub fn remove_file_with_chmod(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
        }
    }

    if let Some(parent) = path.parent() {
        make_writable(parent)?;
    }
    std::fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))
}

fn make_writable(path: &Path) -> Result<()> {
    let metadata = path
        .symlink_metadata()
        .with_context(|| format!("Cannot stat {}", path.display()))?;
    let mut permissions = metadata.permissions();
    let mode = permissions.mode();
    if mode & 0o700 != 0o700 {
        permissions.set_mode(mode | 0o700);
        std::fs::set_permissions(path, permissions)
            .with_context(|| format!("Failed to chmod {}", path.display()))?;
    }
    Ok(())
}

fn chmod_tree_writable(path: &Path) -> Result<()> {
    make_writable(path)?;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            chmod_tree_writable(&entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_inaccessible_subdirs() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path().join("root");
        let bad = root.join("bad");
        std::fs::create_dir_all(&bad)?;
        std::fs::write(bad.join("file"), "x")?;
        std::fs::set_permissions(&bad, std::fs::Permissions::from_mode(0o0))?;

        remove_dir_all_with_chmod(&root)?;
        assert!(!root.exists());
        Ok(())
    }

    #[test]
    fn removing_missing_tree_is_ok() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        remove_dir_all_with_chmod(&temp_dir.path().join("missing"))?;
        Ok(())
    }
}
