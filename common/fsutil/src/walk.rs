// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{fs::Metadata, os::unix::fs::MetadataExt, path::Path};

use anyhow::{Context, Result};

/// Which side of an entry the walk callback is seeing: `Enter` fires for
/// every entry before its children, `Leave` fires for directories after
/// their children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkEvent {
    Enter,
    Leave,
}

/// What a walk callback wants to happen next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkAction {
    /// Keep going.
    Continue,
    /// Do not descend into the entry just entered (directories only; no
    /// `Leave` is delivered for a skipped directory).
    SkipSubtree,
    /// Stop the whole walk. `walk_tree` returns `Ok(false)`.
    Abort,
}

/// Options for [`walk_tree`].
#[derive(Clone, Copy, Debug, Default)]
pub struct WalkOptions {
    /// Do not cross filesystem boundaries below the root.
    pub same_file_system: bool,
    /// Log and skip directories that cannot be opened instead of failing
    /// the walk.
    pub ignore_open_errors: bool,
}

/// Walks the tree under `root` depth-first, entries in name order. The root
/// itself is not reported. Returns `Ok(false)` when the callback aborted the
/// walk.
pub fn walk_tree(
    root: &Path,
    options: WalkOptions,
    callback: &mut dyn FnMut(WalkEvent, &Path, &Metadata) -> Result<WalkAction>,
) -> Result<bool> {
    let root_meta = root
        .symlink_metadata()
        .with_context(|| format!("Cannot stat {}", root.display()))?;
    let root_dev = options.same_file_system.then(|| root_meta.dev());
    walk_dir(root, root_dev, options, callback)
}

fn walk_dir(
    dir: &Path,
    root_dev: Option<u64>,
    options: WalkOptions,
    callback: &mut dyn FnMut(WalkEvent, &Path, &Metadata) -> Result<WalkAction>,
) -> Result<bool> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if options.ignore_open_errors => {
            tracing::warn!("Skipping unreadable directory {}: {}", dir.display(), e);
            return Ok(true);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Cannot read directory {}", dir.display()));
        }
    };

    let mut entries: Vec<_> = entries
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("Cannot read directory {}", dir.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let metadata = path
            .symlink_metadata()
            .with_context(|| format!("Cannot stat {}", path.display()))?;

        let descend = match callback(WalkEvent::Enter, &path, &metadata)? {
            WalkAction::Continue => true,
            WalkAction::SkipSubtree => false,
            WalkAction::Abort => return Ok(false),
        };

        if metadata.is_dir() && descend {
            if root_dev.map_or(false, |dev| metadata.dev() != dev) {
                continue;
            }
            if !walk_dir(&path, root_dev, options, callback)? {
                return Ok(false);
            }
            if callback(WalkEvent::Leave, &path, &metadata)? == WalkAction::Abort {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn relative(root: &Path, path: &Path) -> PathBuf {
        path.strip_prefix(root).unwrap().to_path_buf()
    }

    #[test]
    fn visits_entries_in_order_with_leave_events() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("a/b"))?;
        std::fs::write(root.join("a/b/f"), "")?;
        std::fs::write(root.join("z"), "")?;

        let mut entered = Vec::new();
        let mut left = Vec::new();
        walk_tree(root, WalkOptions::default(), &mut |event, path, _| {
            match event {
                WalkEvent::Enter => entered.push(relative(root, path)),
                WalkEvent::Leave => left.push(relative(root, path)),
            }
            Ok(WalkAction::Continue)
        })?;

        assert_eq!(
            entered,
            ["a", "a/b", "a/b/f", "z"].map(PathBuf::from).to_vec()
        );
        assert_eq!(left, ["a/b", "a"].map(PathBuf::from).to_vec());
        Ok(())
    }

    #[test]
    fn skip_subtree_prunes_descent() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("skip/inner"))?;
        std::fs::write(root.join("seen"), "")?;

        let mut entered = Vec::new();
        walk_tree(root, WalkOptions::default(), &mut |event, path, _| {
            if event == WalkEvent::Enter {
                entered.push(relative(root, path));
                if path.file_name().unwrap() == "skip" {
                    return Ok(WalkAction::SkipSubtree);
                }
            }
            Ok(WalkAction::Continue)
        })?;

        assert_eq!(entered, ["seen", "skip"].map(PathBuf::from).to_vec());
        Ok(())
    }

    #[test]
    fn abort_stops_walk() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path();
        std::fs::write(root.join("a"), "")?;
        std::fs::write(root.join("b"), "")?;

        let mut entered = Vec::new();
        let completed = walk_tree(root, WalkOptions::default(), &mut |_, path, _| {
            entered.push(relative(root, path));
            Ok(WalkAction::Abort)
        })?;

        assert!(!completed);
        assert_eq!(entered, [PathBuf::from("a")].to_vec());
        Ok(())
    }
}
