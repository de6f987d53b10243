// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use anyhow::{bail, ensure, Context, Result};
use config::{Config, Environment, Layer, LayerSource, PathDirective, PathKind, Profile};
use fsutil::{rebase, unbase, WalkAction, WalkEvent, WalkOptions};
use pathstate::{PathState, PathTree};

use crate::{load_profile, ProfileKeyword, ProfileLine};

const DEFAULT_LDCONFIG_CACHE: &str = "/etc/ld.so.cache";
const MAX_LOGGED_STRAYS: u64 = 100;

/// Whether the emitted config describes an overlay fragment or a full root.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EnvironmentType {
    #[default]
    Layer,
    Image,
}

pub struct AnalyzeOptions {
    /// The digger output directory; the captured files live in its `tree`
    /// subdirectory.
    pub overlay_dir: PathBuf,
    pub environment_name: String,
    /// A built-in profile tag or an absolute path to a profile file.
    pub profile: String,
    pub provides: Vec<String>,
    pub requires: Vec<String>,
    /// Where `check-binaries` wrapper links will be installed.
    pub wrapper_directory: Option<PathBuf>,
    /// Additional `check-binaries` directories, applied after the profile.
    pub check_binaries: Vec<PathBuf>,
}

/// Applies `options.profile` to the captured tree and emits the resulting
/// layer config. Fails if any file in the tree is left unexplained by the
/// profile.
pub fn analyze(options: &AnalyzeOptions) -> Result<Config> {
    let tree_dir = options.overlay_dir.join("tree");
    ensure!(
        tree_dir.is_dir(),
        "{} has no captured tree",
        options.overlay_dir.display()
    );

    let mut lines = load_profile(&options.profile)?;
    for path in &options.check_binaries {
        lines.push(ProfileLine {
            keyword: ProfileKeyword::CheckBinaries,
            arg: Some(path.to_string_lossy().into_owned()),
            line: 0,
        });
    }

    let mut analyzer = Analyzer {
        tree_dir,
        options,
        state: PathTree::new(),
        directives: Vec::new(),
        wrapper_profiles: Vec::new(),
        environment_type: EnvironmentType::default(),
        use_ldconfig: false,
        ignore_strays: false,
    };
    for line in &lines {
        analyzer
            .apply(line)
            .with_context(|| format!("Profile {} line {}", options.profile, line.line))?;
    }

    if !analyzer.ignore_strays {
        analyzer.check_strays()?;
    }
    Ok(analyzer.emit())
}

struct Analyzer<'a> {
    tree_dir: PathBuf,
    options: &'a AnalyzeOptions,
    state: PathTree,
    directives: Vec<PathDirective>,
    wrapper_profiles: Vec<Profile>,
    environment_type: EnvironmentType,
    use_ldconfig: bool,
    ignore_strays: bool,
}

impl Analyzer<'_> {
    /// The captured file backing an absolute view path.
    fn captured(&self, view: &Path) -> PathBuf {
        rebase(view, &self.tree_dir)
    }

    fn arg_path<'l>(&self, line: &'l ProfileLine) -> Result<&'l Path> {
        let arg = line
            .arg
            .as_deref()
            .with_context(|| format!("'{}' needs a path argument", line.keyword))?;
        ensure!(arg.starts_with('/'), "Path '{}' must be absolute", arg);
        Ok(Path::new(arg))
    }

    fn apply(&mut self, line: &ProfileLine) -> Result<()> {
        match line.keyword {
            ProfileKeyword::EnvironmentType => {
                self.environment_type = match line.arg.as_deref() {
                    Some("layer") => EnvironmentType::Layer,
                    Some("image") => EnvironmentType::Image,
                    other => bail!("environment-type must be 'layer' or 'image', got {:?}", other),
                };
            }
            ProfileKeyword::Ignore if line.arg.as_deref() == Some("strays") => {
                self.ignore_strays = true;
            }
            ProfileKeyword::Ignore => {
                let view = self.arg_path(line)?;
                if self.captured(view).symlink_metadata().is_ok() {
                    self.state.set(view, PathState::Ignored);
                }
            }
            ProfileKeyword::IgnoreIfEmpty => {
                let view = self.arg_path(line)?;
                self.state.mark_ignore_if_empty(view, false);
            }
            ProfileKeyword::IgnoreEmptySubdirs => {
                let view = self.arg_path(line)?;
                self.state.mark_ignore_if_empty(view, true);
            }
            ProfileKeyword::OptionalDirectory => {
                self.arg_path(line)?;
            }
            ProfileKeyword::Overlay => {
                let view = self.arg_path(line)?.to_path_buf();
                ensure!(
                    self.captured(&view).exists(),
                    "overlay {}: not present in the captured tree",
                    view.display()
                );
                self.record_overlay(&view, PathKind::Overlay);
            }
            ProfileKeyword::Bind => {
                let view = self.arg_path(line)?.to_path_buf();
                ensure!(
                    self.captured(&view).exists(),
                    "bind {}: not present in the captured tree",
                    view.display()
                );
                self.record_overlay(&view, PathKind::Bind);
            }
            ProfileKeyword::OverlayUnlessEmpty => {
                let view = self.arg_path(line)?.to_path_buf();
                self.record_unless_empty(&view, PathKind::Overlay)?;
            }
            ProfileKeyword::BindUnlessEmpty => {
                let view = self.arg_path(line)?.to_path_buf();
                self.record_unless_empty(&view, PathKind::Bind)?;
            }
            ProfileKeyword::MustBeEmpty => {
                let view = self.arg_path(line)?;
                let captured = self.captured(view);
                if captured.is_dir() {
                    ensure!(
                        is_empty_dir(&captured)?,
                        "{} must be empty but has content",
                        view.display()
                    );
                    self.state.set(view, PathState::Ignored);
                }
            }
            ProfileKeyword::CheckLdconfig => {
                let view = match &line.arg {
                    Some(arg) => {
                        ensure!(arg.starts_with('/'), "Path '{}' must be absolute", arg);
                        PathBuf::from(arg)
                    }
                    None => PathBuf::from(DEFAULT_LDCONFIG_CACHE),
                };
                if self.captured(&view).exists() {
                    self.use_ldconfig = true;
                    self.state.set(&view, PathState::Ignored);
                }
            }
            ProfileKeyword::MountTmpfs => {
                let view = self.arg_path(line)?.to_path_buf();
                self.directives.push(PathDirective::mount(&view, "tmpfs"));
                self.state.set(
                    &view,
                    PathState::SystemMount {
                        fstype: "tmpfs".to_owned(),
                        device: "tmpfs".to_owned(),
                    },
                );
            }
            ProfileKeyword::CheckBinaries => {
                let view = self.arg_path(line)?.to_path_buf();
                self.check_binaries(&view)?;
            }
        }
        Ok(())
    }

    fn record_overlay(&mut self, view: &Path, kind: PathKind) {
        self.directives.push(PathDirective::new(kind, view));
        let state = match kind {
            PathKind::Bind => PathState::BindMounted,
            _ => PathState::OverlayMounted { upper: None },
        };
        self.state.set(view, state);
    }

    fn record_unless_empty(&mut self, view: &Path, kind: PathKind) -> Result<()> {
        let captured = self.captured(view);
        if !captured.exists() {
            return Ok(());
        }
        if captured.is_dir() && is_empty_dir(&captured)? {
            self.state.set(view, PathState::Ignored);
        } else {
            self.record_overlay(view, kind);
        }
        Ok(())
    }

    /// Emits one wrapper profile per executable directly under `view`.
    fn check_binaries(&mut self, view: &Path) -> Result<()> {
        let wrapper_dir = match &self.options.wrapper_directory {
            Some(dir) => dir.clone(),
            None => return Ok(()),
        };
        let captured = self.captured(view);
        if !captured.is_dir() {
            return Ok(());
        }

        let mut entries: Vec<_> = std::fs::read_dir(&captured)?
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("Cannot read {}", captured.display()))?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let metadata = entry.metadata()?;
            if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            self.wrapper_profiles.push(Profile {
                name: name.clone(),
                wrapper: Some(wrapper_dir.join(&name)),
                command: Some(view.join(&name)),
                environment: Some(self.options.environment_name.clone()),
            });
        }
        Ok(())
    }

    /// Walks the captured tree and fails if any file is still unexplained.
    /// Directories marked ignorable-if-empty disappear when nothing below
    /// them turned out to be a stray.
    fn check_strays(&mut self) -> Result<()> {
        let tree_dir = self.tree_dir.clone();
        let root_recursive = self
            .state
            .find(Path::new("/"))
            .map_or(false, |id| self.state.ignore_empty_subdirs(id));

        let state = &mut self.state;
        // Per-directory stray counters along the current walk path. A count
        // percolates to the parent unless the directory turns out ignorable.
        let mut counts: Vec<u64> = vec![0];
        let mut inherit: Vec<bool> = vec![root_recursive];
        let mut logged: u64 = 0;

        fsutil::walk_tree(
            &tree_dir,
            WalkOptions::default(),
            &mut |event, path, metadata| {
                let view = unbase(path, &tree_dir);
                match event {
                    WalkEvent::Enter => {
                        let node = state.find(&view);
                        if let Some(id) = node {
                            // Consumed by a directive or an earlier ignore.
                            if state.state(id) != &PathState::Unchanged {
                                return Ok(WalkAction::SkipSubtree);
                            }
                        }
                        if metadata.is_dir() {
                            let recursive = *inherit.last().unwrap()
                                || node.map_or(false, |id| state.ignore_empty_subdirs(id));
                            counts.push(0);
                            inherit.push(recursive);
                        } else {
                            *counts.last_mut().unwrap() += 1;
                            if logged < MAX_LOGGED_STRAYS {
                                tracing::error!("Stray file {}", view.display());
                                logged += 1;
                            }
                        }
                        Ok(WalkAction::Continue)
                    }
                    WalkEvent::Leave => {
                        let below = counts.pop().unwrap();
                        let inherited = inherit.pop().unwrap();
                        let node = state.find(&view);
                        let marker = node.map_or(false, |id| {
                            state.ignore_if_empty(id) || state.ignore_empty_subdirs(id)
                        });
                        if below == 0 && (marker || inherited) {
                            state.set(&view, PathState::Ignored);
                        } else {
                            *counts.last_mut().unwrap() += below;
                        }
                        Ok(WalkAction::Continue)
                    }
                }
            },
        )?;

        let strays = counts.pop().unwrap();
        if strays > MAX_LOGGED_STRAYS {
            tracing::error!("... and {} more stray files", strays - MAX_LOGGED_STRAYS);
        }
        ensure!(
            strays == 0,
            "{} stray file(s) not covered by profile {}",
            strays,
            self.options.profile
        );
        Ok(())
    }

    fn emit(self) -> Config {
        let tree_dir = self.tree_dir;
        let source = match self.environment_type {
            EnvironmentType::Layer => LayerSource::Directory {
                directory: tree_dir,
                use_ldconfig: self.use_ldconfig,
            },
            EnvironmentType::Image => LayerSource::Image {
                reference: None,
                directory: Some(tree_dir),
            },
        };

        let mut environment = Environment::new(&self.options.environment_name);
        environment.provides = self.options.provides.clone();
        environment.requires = self.options.requires.clone();
        environment.layers.push(Layer {
            source,
            paths: self.directives,
        });

        Config {
            client_path: None,
            environments: vec![environment],
            profiles: self.wrapper_profiles,
        }
    }
}

fn is_empty_dir(dir: &Path) -> Result<bool> {
    Ok(std::fs::read_dir(dir)?.next().is_none())
}
