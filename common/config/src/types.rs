// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::{Path, PathBuf};

use anyhow::Result;
use strum_macros::{Display, EnumString};

/// How one path directive enters the composed view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum PathKind {
    /// Make the path invisible. Accepted by the parser but not implemented
    /// by the assembler.
    Hide,
    /// Bind-mount the same path from the layer's source tree.
    Bind,
    /// Overlay the path, then bind each immediate child of the source
    /// directory individually so the children stay separately writable.
    BindChildren,
    /// Overlay the layer's source directory on top of the current view.
    Overlay,
    /// Like `Overlay`, applied per immediate child.
    OverlayChildren,
    /// Mount a fresh virtual filesystem.
    Mount,
    /// Bind the wrapper-client executable onto the path, so a command inside
    /// this layer re-enters a different environment when run.
    Wormhole,
}

/// One (kind, path) instruction of a layer. `path` is absolute inside the
/// assembled view and may be a glob pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathDirective {
    pub kind: PathKind,
    pub path: PathBuf,
    /// `Mount` only.
    pub fstype: Option<String>,
    pub device: Option<String>,
    pub options: Option<String>,
}

impl PathDirective {
    pub fn new(kind: PathKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            fstype: None,
            device: None,
            options: None,
        }
    }

    pub fn mount(path: impl Into<PathBuf>, fstype: impl Into<String>) -> Self {
        Self {
            kind: PathKind::Mount,
            path: path.into(),
            fstype: Some(fstype.into()),
            device: None,
            options: None,
        }
    }
}

/// Where a layer's content comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayerSource {
    /// A directory tree on the host; relative directive paths resolve under
    /// it.
    Directory {
        directory: PathBuf,
        use_ldconfig: bool,
    },
    /// A full root filesystem: an OCI image resolved through the container
    /// runtime, or a directory captured earlier. Only valid as the bottom of
    /// the stack; the assembled environment is chrooted into it.
    Image {
        reference: Option<String>,
        directory: Option<PathBuf>,
    },
    /// Another environment whose layers are spliced in at this position
    /// during configure-time flattening.
    Reference { environment: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layer {
    pub source: LayerSource,
    /// Applied in declaration order; later directives stack on earlier ones.
    pub paths: Vec<PathDirective>,
}

impl Layer {
    pub fn directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            source: LayerSource::Directory {
                directory: directory.into(),
                use_ldconfig: false,
            },
            paths: Vec::new(),
        }
    }
}

/// A named, ordered stack of layers with optional capability metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    pub layers: Vec<Layer>,
    pub provides: Vec<String>,
    pub requires: Vec<String>,
}

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Maps a wrapper executable to the command it runs and the environment it
/// runs it in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub wrapper: Option<PathBuf>,
    pub command: Option<PathBuf>,
    pub environment: Option<String>,
}

/// A fully loaded configuration: the union of the root file and everything
/// it included.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub client_path: Option<PathBuf>,
    pub environments: Vec<Environment>,
    pub profiles: Vec<Profile>,
}

impl Config {
    /// Loads a configuration file, following `config` includes.
    pub fn load(path: &Path) -> Result<Config> {
        crate::parser::load(path)
    }

    /// Parses configuration text that contains no includes. Relative layer
    /// directories are left as-is.
    pub fn parse(text: &str) -> Result<Config> {
        crate::parser::parse(text)
    }

    /// Writes the canonical text form; `Config::parse` of the output yields
    /// an equal config.
    pub fn write(&self, path: &Path) -> Result<()> {
        crate::writer::write(self, path)
    }

    pub fn to_text(&self) -> String {
        crate::writer::to_text(self)
    }

    pub fn environment(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.name == name)
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Merges declarations from a config loaded later (e.g. one resolved
    /// through the capability registry). Declarations already present keep
    /// priority.
    pub fn merge(&mut self, other: Config) {
        if self.client_path.is_none() {
            self.client_path = other.client_path;
        }
        for environment in other.environments {
            if self.environment(&environment.name).is_none() {
                self.environments.push(environment);
            }
        }
        for profile in other.profiles {
            if self.profile(&profile.name).is_none() {
                self.profiles.push(profile);
            }
        }
    }
}
