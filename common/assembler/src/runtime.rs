// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    path::PathBuf,
    process::Command,
};

use anyhow::{bail, Context, Result};

/// The slice of a container runtime the assembler needs: resolve an image
/// reference to a mountable root directory. Implementations may shell out or
/// link a native client; the assembler only observes the returned path.
pub trait ContainerRuntime {
    fn exists(&self, local_name: &str) -> Result<bool>;
    fn start(&self, image_ref: &str, local_name: &str) -> Result<()>;
    /// Returns the container's root directory; the path stays valid until
    /// [`ContainerRuntime::unmount`].
    fn mount(&self, local_name: &str) -> Result<PathBuf>;
    fn unmount(&self, local_name: &str) -> Result<()>;
}

/// Derives the runtime-local container name from an image reference: the tag
/// is dropped, path separators become underscores, and everything gets a
/// `wormhole_` prefix.
pub fn local_name_for_image(reference: &str) -> String {
    let without_tag = reference.split(':').next().unwrap_or(reference);
    format!("wormhole_{}", without_tag.replace('/', "_"))
}

/// Drives a `podman` binary as a child process.
pub struct PodmanRuntime {
    program: PathBuf,
}

impl PodmanRuntime {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("podman"),
        }
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        cmd
    }
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for PodmanRuntime {
    fn exists(&self, local_name: &str) -> Result<bool> {
        let status = self
            .command(&["container", "exists", local_name])
            .status()
            .context("Cannot run podman")?;
        match status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => bail!("podman container exists {} failed: {}", local_name, status),
        }
    }

    fn start(&self, image_ref: &str, local_name: &str) -> Result<()> {
        processes::run_and_check(&mut self.command(&[
            "container",
            "create",
            "--name",
            local_name,
            image_ref,
        ]))
    }

    fn mount(&self, local_name: &str) -> Result<PathBuf> {
        let output = self
            .command(&["mount", local_name])
            .output()
            .context("Cannot run podman")?;
        if !output.status.success() {
            bail!(
                "podman mount {} failed: {}: {}",
                local_name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let path = String::from_utf8(output.stdout).context("podman mount output")?;
        Ok(PathBuf::from(path.trim()))
    }

    fn unmount(&self, local_name: &str) -> Result<()> {
        processes::run_and_check(&mut self.command(&["umount", local_name]))
    }
}
