// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

use crate::Capability;

const DEFAULT_REGISTRY_DIR: &str = "/var/lib/wormhole/capability";

/// A symlink farm mapping capability identifiers to configuration files.
///
/// Each published capability is one symlink named after the capability
/// string, pointing at the config file that provides it. Operations are
/// individual symlink/unlink calls and therefore not atomic with respect to
/// concurrent writers; last one wins.
pub struct CapabilityRegistry {
    dir: PathBuf,
}

impl CapabilityRegistry {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn system() -> Self {
        Self::new(Path::new(DEFAULT_REGISTRY_DIR))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Publishes `capability` as provided by the config at `target`,
    /// replacing an existing registration of the exact same string.
    pub fn publish(&self, capability: &Capability, target: &Path) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Cannot create registry {}", self.dir.display()))?;
        let link = self.dir.join(capability.to_string());
        match std::fs::remove_file(&link) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot replace {}", link.display()));
            }
        }
        symlink(target, &link)
            .with_context(|| format!("Cannot publish capability {}", capability))?;
        Ok(())
    }

    /// Removes the registration of `capability`, if present.
    pub fn withdraw(&self, capability: &Capability) -> Result<()> {
        let link = self.dir.join(capability.to_string());
        match std::fs::remove_file(&link) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Cannot withdraw {}", capability)),
        }
    }

    /// Lists every published capability with its config path.
    pub fn list(&self) -> Result<Vec<(Capability, PathBuf)>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Cannot read registry {}", self.dir.display()));
            }
        };

        let mut result = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let capability = match name.to_str().map(Capability::try_new) {
                Some(Ok(capability)) => capability,
                _ => {
                    tracing::debug!("Skipping foreign registry entry {:?}", name);
                    continue;
                }
            };
            let target = std::fs::read_link(entry.path())
                .with_context(|| format!("Cannot read registry link {:?}", name))?;
            result.push((capability, target));
        }
        Ok(result)
    }

    /// Resolves `requirement` to the best (greatest-version) published
    /// capability that satisfies it.
    pub fn resolve(&self, requirement: &Capability) -> Result<Option<(Capability, PathBuf)>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|(capability, _)| capability.satisfies(requirement))
            .max_by(|(a, _), (b, _)| a.version().cmp(b.version())))
    }
}
