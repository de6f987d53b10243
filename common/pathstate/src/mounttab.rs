// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

use crate::{PathState, PathTree};

const PROC_MOUNTS: &str = "/proc/mounts";

/// Decodes the octal escapes the kernel uses for whitespace in mount paths
/// (`\040` for space and friends).
fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3 {
            if let Ok(code) = u8::from_str_radix(&digits, 8) {
                out.push(code as char);
                chars.nth(2);
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Reads a proc mounts file into a fresh [`PathTree`], tagging each mount
/// point as a system mount.
///
/// When `strip_prefix` is given, entries below it are re-rooted (the prefix
/// removed) and entries outside it are dropped; this maps the host mount
/// table into the coordinate system of a chroot target.
pub fn snapshot_mounts(path: Option<&Path>, strip_prefix: Option<&Path>) -> Result<PathTree> {
    let path = path.unwrap_or(Path::new(PROC_MOUNTS));
    let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;

    let mut tree = PathTree::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let mut fields = line.split(' ');
        let (device, mount_point, fstype) = match (fields.next(), fields.next(), fields.next()) {
            (Some(device), Some(mount_point), Some(fstype)) => (device, mount_point, fstype),
            _ => {
                tracing::warn!("Corrupted mount table line: {}", line);
                continue;
            }
        };
        let mount_point = PathBuf::from(unescape_mount_field(mount_point));

        let mount_point = match strip_prefix {
            None => mount_point,
            Some(prefix) => match mount_point.strip_prefix(prefix) {
                Ok(rest) => Path::new("/").join(rest),
                Err(_) => continue,
            },
        };

        tree.set(
            &mount_point,
            PathState::SystemMount {
                fstype: fstype.to_owned(),
                device: unescape_mount_field(device),
            },
        );
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda2 / ext4 rw,relatime 0 0
/dev/sda3 /srv/chroot/leap ext4 rw,relatime 0 0
tmpfs /srv/chroot/leap/tmp tmpfs rw 0 0
tmpfs /mnt/with\\040space tmpfs rw 0 0
";

    fn write_sample() -> Result<(tempfile::TempDir, PathBuf)> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mounts");
        std::fs::write(&path, SAMPLE)?;
        Ok((dir, path))
    }

    #[test]
    fn records_all_mount_points() -> Result<()> {
        let (_dir, path) = write_sample()?;
        let tree = snapshot_mounts(Some(&path), None)?;

        assert_eq!(
            tree.get(Path::new("/proc")),
            Some(&PathState::SystemMount {
                fstype: "proc".to_owned(),
                device: "proc".to_owned(),
            })
        );
        assert_eq!(
            tree.get(Path::new("/")),
            Some(&PathState::SystemMount {
                fstype: "ext4".to_owned(),
                device: "/dev/sda2".to_owned(),
            })
        );
        assert_eq!(
            tree.get(Path::new("/mnt/with space")),
            Some(&PathState::SystemMount {
                fstype: "tmpfs".to_owned(),
                device: "tmpfs".to_owned(),
            })
        );
        Ok(())
    }

    #[test]
    fn strip_prefix_reroots_and_drops() -> Result<()> {
        let (_dir, path) = write_sample()?;
        let tree = snapshot_mounts(Some(&path), Some(Path::new("/srv/chroot/leap")))?;

        assert_eq!(
            tree.get(Path::new("/")),
            Some(&PathState::SystemMount {
                fstype: "ext4".to_owned(),
                device: "/dev/sda3".to_owned(),
            })
        );
        assert_eq!(
            tree.get(Path::new("/tmp")),
            Some(&PathState::SystemMount {
                fstype: "tmpfs".to_owned(),
                device: "tmpfs".to_owned(),
            })
        );
        assert!(tree.find(Path::new("/proc")).is_none());
        Ok(())
    }

    #[test]
    fn snapshot_of_live_proc_mounts_has_root() -> Result<()> {
        let tree = snapshot_mounts(None, None)?;
        assert!(tree.get(Path::new("/")).is_some());
        Ok(())
    }
}
