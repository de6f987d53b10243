// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{cmp::Ordering, os::unix::fs::MetadataExt, path::Path};

use anyhow::{Context, Result};

/// Relationship between two inodes, computed from metadata alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InodeDelta {
    /// Both paths have the same file type (regular, directory, symlink, ...).
    pub same_type: bool,
    /// How the first path's size compares to the second's.
    pub size: Ordering,
    /// How the first path's modification time compares to the second's.
    pub mtime: Ordering,
}

impl InodeDelta {
    /// True when the first path was modified more recently than the second.
    pub fn left_newer(&self) -> bool {
        self.mtime == Ordering::Greater
    }
}

/// Compares two paths by type, size and mtime without opening either file.
/// Symlinks are compared as themselves, not their targets.
pub fn inode_compare(left: &Path, right: &Path) -> Result<InodeDelta> {
    let left_meta = left
        .symlink_metadata()
        .with_context(|| format!("Cannot stat {}", left.display()))?;
    let right_meta = right
        .symlink_metadata()
        .with_context(|| format!("Cannot stat {}", right.display()))?;

    Ok(InodeDelta {
        same_type: left_meta.file_type() == right_meta.file_type(),
        size: left_meta.size().cmp(&right_meta.size()),
        mtime: (left_meta.mtime(), left_meta.mtime_nsec())
            .cmp(&(right_meta.mtime(), right_meta.mtime_nsec())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_types_and_sizes() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let file = temp_dir.path().join("file");
        let dir = temp_dir.path().join("dir");
        std::fs::write(&file, "hello")?;
        std::fs::create_dir(&dir)?;

        let delta = inode_compare(&file, &dir)?;
        assert!(!delta.same_type);

        let other = temp_dir.path().join("other");
        std::fs::write(&other, "hi")?;
        let delta = inode_compare(&file, &other)?;
        assert!(delta.same_type);
        assert_eq!(delta.size, Ordering::Greater);
        Ok(())
    }

    #[test]
    fn newer_mtime_wins() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let old = temp_dir.path().join("old");
        let new = temp_dir.path().join("new");
        std::fs::write(&old, "")?;
        std::fs::write(&new, "")?;
        use nix::sys::time::TimeValLike;
        let past = nix::sys::time::TimeVal::seconds(1_000_000);
        nix::sys::stat::utimes(&old, &past, &past)?;

        assert!(inode_compare(&new, &old)?.left_newer());
        assert!(!inode_compare(&old, &new)?.left_newer());
        Ok(())
    }
}
