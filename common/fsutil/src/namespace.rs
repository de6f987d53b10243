// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{ensure, Context, Result};
use nix::{
    errno::Errno,
    sched::{unshare, CloneFlags},
    unistd::{getgid, getuid},
};

fn ensure_single_threaded() -> Result<()> {
    let entries: Vec<_> = std::fs::read_dir("/proc/self/task")?.collect::<std::io::Result<_>>()?;
    ensure!(entries.len() == 1, "The current process is multi-threaded");
    Ok(())
}

fn mount_namespace_id() -> Result<u64> {
    let st = nix::sys::stat::stat("/proc/self/ns/mnt")
        .context("Failed to stat /proc/self/ns/mnt")?;
    Ok(st.st_ino)
}

/// Unshares the mount namespace of the current process.
///
/// The new namespace identity is verified against the old one; an unchanged
/// identity means the kernel silently refused and would let later mounts leak
/// into the host view.
pub fn enter_mount_namespace() -> Result<()> {
    ensure_single_threaded()?;

    let before = mount_namespace_id()?;
    unshare(CloneFlags::CLONE_NEWNS).context("Failed to enter a mount namespace")?;
    let after = mount_namespace_id()?;
    ensure!(
        before != after,
        "Mount namespace identity did not change after unshare"
    );
    Ok(())
}

/// Unshares a user namespace together with a mount namespace and installs
/// identity uid/gid maps, so files keep their apparent owner inside the view.
///
/// Multi-threaded processes cannot enter a new user namespace, so it is
/// always an error to call this after spawning a thread. Any map write
/// failure is fatal for this namespace attempt.
pub fn enter_user_namespace() -> Result<()> {
    ensure_single_threaded()?;

    let uid = getuid();
    let gid = getgid();
    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS)
        .context("Failed to create an unprivileged user namespace")?;
    std::fs::write("/proc/self/setgroups", "deny").context("Writing /proc/self/setgroups")?;
    std::fs::write("/proc/self/uid_map", format!("{uid} {uid} 1\n"))
        .context("Writing /proc/self/uid_map")?;
    std::fs::write("/proc/self/gid_map", format!("{gid} {gid} 1\n"))
        .context("Writing /proc/self/gid_map")?;
    Ok(())
}

/// Enters a mount namespace, falling back to an unprivileged user namespace
/// when the caller lacks CAP_SYS_ADMIN. Also remounts everything private so
/// the original namespace never sees our mounts.
pub fn enter_mount_namespace_with_fallback() -> Result<()> {
    ensure_single_threaded()?;

    match unshare(CloneFlags::CLONE_NEWNS) {
        Err(Errno::EPERM) => enter_user_namespace(),
        other => other.context("Failed to enter a mount namespace"),
    }?;

    crate::make_private(std::path::Path::new("/"))?;
    Ok(())
}
