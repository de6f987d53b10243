// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    fs::File,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
};

use anyhow::{ensure, Context, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};

/// Unmounts a mount point on drop (lazily, so open file descriptors below it
/// do not keep the whole operation from completing).
#[must_use]
pub struct MountGuard {
    dir: Option<PathBuf>,
}

impl MountGuard {
    fn new(dir: &Path) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
        }
    }

    /// Forgets this mount point. After calling this method, it is your
    /// responsibility to unmount it. It is often safe to use this method,
    /// e.g. when this mount point is under another mount point and you're
    /// sure it's unmounted recursively, or when the whole namespace is
    /// discarded on process exit.
    pub fn leak(mut self) {
        self.dir = None;
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            umount2(&dir, MntFlags::MNT_DETACH).expect("Failed to unmount");
        }
    }
}

/// Creates `path` and any missing ancestors with the given mode.
pub fn makedirs(path: &Path, mode: u32) -> Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .with_context(|| format!("Failed to create directory {}", path.display()))
}

/// Creates an empty regular file at `path` if nothing exists there yet.
pub fn create_empty(path: &Path) -> Result<()> {
    if path.symlink_metadata().is_err() {
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    }
    Ok(())
}

/// Makes sure `target` can serve as a bind target for `source`: bind needs a
/// mount point of matching type, so a missing file target is created empty
/// and a missing directory target is created as a directory.
fn prepare_bind_target(source: &Path, target: &Path) -> Result<()> {
    let source_meta = source
        .symlink_metadata()
        .with_context(|| format!("Cannot stat bind source {}", source.display()))?;
    if source_meta.is_dir() {
        makedirs(target, 0o755)?;
    } else {
        if let Some(parent) = target.parent() {
            makedirs(parent, 0o755)?;
        }
        create_empty(target)?;
    }
    Ok(())
}

/// Bind-mounts `source` onto `target`, recursively when requested.
/// Missing parent directories (and a missing file target) are created first.
pub fn bind_mount(source: &Path, target: &Path, recursive: bool) -> Result<MountGuard> {
    prepare_bind_target(source, target)?;

    let mut flags = MsFlags::MS_BIND;
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    mount(Some(source), target, Some(""), flags, Some("")).with_context(|| {
        format!(
            "Bind-mounting {} to {} failed",
            source.display(),
            target.display()
        )
    })?;
    Ok(MountGuard::new(target))
}

/// Remounts an existing bind mount read-only. MS_RDONLY is ignored on the
/// initial bind, so a separate remount is the only way to get one.
pub fn remount_readonly(path: &Path) -> Result<()> {
    mount(
        Some(""),
        path,
        Some(""),
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        Some(""),
    )
    .with_context(|| format!("Failed remounting {} as read-only", path.display()))?;
    Ok(())
}

/// Mounts an overlayfs at `target`.
///
/// `lowers` is ordered top-down: the first entry has the highest priority,
/// which is the kernel's own convention for the `lowerdir` option. With
/// `upper` and `work` present the overlay is read-write; with neither it is
/// read-only. `work` must be an empty directory on the same filesystem as
/// `upper`.
pub fn mount_overlay(
    target: &Path,
    lowers: &[&Path],
    upper: Option<&Path>,
    work: Option<&Path>,
) -> Result<MountGuard> {
    ensure!(
        !lowers.is_empty(),
        "Mounting overlayfs with zero lower directories is not supported"
    );
    ensure!(
        upper.is_some() == work.is_some(),
        "overlayfs upperdir and workdir must be given together"
    );

    let lowerdir = lowers
        .iter()
        .map(|p| p.to_string_lossy())
        .collect::<Vec<_>>()
        .join(":");
    let mut options = format!("lowerdir={}", lowerdir);
    if let (Some(upper), Some(work)) = (upper, work) {
        options.push_str(&format!(
            ",upperdir={},workdir={}",
            upper.display(),
            work.display()
        ));
    }

    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .with_context(|| {
        format!(
            "Failed to mount overlayfs at {} with options {}",
            target.display(),
            options
        )
    })?;
    Ok(MountGuard::new(target))
}

/// Mounts a fresh instance of a virtual filesystem such as proc or devpts.
pub fn mount_virtual_fs(
    target: &Path,
    fstype: &str,
    device: Option<&str>,
    options: Option<&str>,
) -> Result<MountGuard> {
    makedirs(target, 0o755)?;
    mount(
        Some(device.unwrap_or(fstype)),
        target,
        Some(fstype),
        MsFlags::empty(),
        options,
    )
    .with_context(|| format!("Failed to mount {} at {}", fstype, target.display()))?;
    Ok(MountGuard::new(target))
}

/// Mounts a tmpfs at `target`.
pub fn mount_tmpfs(target: &Path) -> Result<MountGuard> {
    mount_virtual_fs(target, "tmpfs", None, None)
}

/// Detaches the mount at `path` without waiting for it to become unbusy.
pub fn lazy_unmount(path: &Path) -> Result<()> {
    umount2(path, MntFlags::MNT_DETACH)
        .with_context(|| format!("Failed to unmount {}", path.display()))?;
    Ok(())
}

/// Changes mount propagation below `path` to private so that subsequent
/// mounts do not leak back into the parent namespace.
pub fn make_private(path: &Path) -> Result<()> {
    mount(
        Some(""),
        path,
        Some(""),
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        Some(""),
    )
    .with_context(|| format!("Failed to make {} private", path.display()))?;
    Ok(())
}
