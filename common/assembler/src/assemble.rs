// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use config::{FlatEnvironment, LayerSource, PathDirective, PathKind};
use fsutil::{rebase, unbase, TmpfsTempDir};
use pathstate::{PathState, PathTree};
use tracing::info_span;

use crate::{local_name_for_image, ContainerRuntime};

const DEFAULT_CLIENT_PATH: &str = "/usr/bin/wormhole";

/// Everything the assembler needs besides the environment itself.
pub struct AssembleOptions<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    /// The wrapper-client executable bound by `wormhole` directives.
    pub client_path: Option<&'a Path>,
}

/// Assembly lifecycle of one environment. `Failed` is terminal within this
/// process; a retry constructs a fresh session from the same config.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssemblyState {
    Configured,
    Assembling,
    Ready,
    Failed,
}

/// One environment being materialized into the current mount namespace.
///
/// The caller must have entered a (user and) mount namespace and made `/`
/// private before calling [`EnvironmentSession::assemble`]; the session does
/// not fork and mutates the namespace it runs in. Partial mounts are not
/// unwound on failure; the owner discards the whole namespace instead.
pub struct EnvironmentSession {
    env: FlatEnvironment,
    state: AssemblyState,
    pub tree: PathTree,
    /// tmpfs scaffolds backing throw-away overlay uppers. They live as long
    /// as the session; when the process execs the wrapped command they are
    /// inherited by the namespace and die with it.
    scratch: Vec<TmpfsTempDir>,
}

impl EnvironmentSession {
    pub fn new(env: FlatEnvironment) -> Self {
        Self {
            env,
            state: AssemblyState::Configured,
            tree: PathTree::new(),
            scratch: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.env.name
    }

    pub fn state(&self) -> AssemblyState {
        self.state
    }

    /// The physical root to chroot into, set when the bottom layer was an
    /// image. The caller, not the assembler, performs the chroot.
    pub fn root_directory(&self) -> Option<&Path> {
        self.tree.root_directory()
    }

    /// Applies every layer of the environment to the current namespace.
    pub fn assemble(&mut self, options: &AssembleOptions) -> Result<()> {
        ensure!(
            self.state == AssemblyState::Configured,
            "Environment '{}' was already assembled (state {:?})",
            self.env.name,
            self.state
        );
        self.state = AssemblyState::Assembling;

        let _span = info_span!("assemble", environment = %self.env.name).entered();
        match self.assemble_layers(options) {
            Ok(()) => {
                self.state = AssemblyState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = AssemblyState::Failed;
                Err(e).with_context(|| format!("Assembling environment '{}'", self.env.name))
            }
        }
    }

    fn assemble_layers(&mut self, options: &AssembleOptions) -> Result<()> {
        let layers = self.env.layers.clone();
        for (index, layer) in layers.iter().enumerate() {
            let (source_prefix, use_ldconfig) = match &layer.source {
                LayerSource::Image {
                    reference,
                    directory,
                } => {
                    ensure!(index == 0, "Image layer above the bottom of the stack");
                    let root = match (reference, directory) {
                        (Some(reference), _) => {
                            let root = resolve_image_root(options.runtime, reference)?;
                            tracing::info!("Image {} mounted at {}", reference, root.display());
                            root
                        }
                        (None, Some(directory)) => directory.clone(),
                        (None, None) => bail!("Image layer without image or directory"),
                    };
                    self.tree.set_root_directory(&root);
                    (root, false)
                }
                LayerSource::Directory {
                    directory,
                    use_ldconfig,
                } => (directory.clone(), *use_ldconfig),
                LayerSource::Reference { environment } => {
                    bail!(
                        "Unexpected reference to '{}'; environments must be flattened before assembly",
                        environment
                    );
                }
            };

            let dest_prefix = self
                .tree
                .root_directory()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/"));

            for directive in &layer.paths {
                self.apply_directive(directive, &source_prefix, &dest_prefix, options)?;
            }

            if use_ldconfig {
                crate::apply_ldconfig(&source_prefix, &dest_prefix, &mut self.tree)?;
            }
        }
        Ok(())
    }

    fn apply_directive(
        &mut self,
        directive: &PathDirective,
        source_prefix: &Path,
        dest_prefix: &Path,
        options: &AssembleOptions,
    ) -> Result<()> {
        if directive.kind == PathKind::Hide {
            tracing::warn!(
                "hide {} is not implemented; the path stays visible",
                directive.path.display()
            );
            return Ok(());
        }

        for source in expand_paths(source_prefix, &directive.path)? {
            let view_path = unbase(&source, source_prefix);
            let target = rebase(&view_path, dest_prefix);
            match self.mount_one(directive, &source, &view_path, &target, options) {
                Ok(()) => {}
                // Mount points the current uid cannot reach are skipped, not
                // fatal; user-namespace mode routinely refuses some of them.
                Err(e) if is_permission_error(&e) => {
                    tracing::warn!(
                        "Skipping {} {}: {:#}",
                        directive.kind,
                        view_path.display(),
                        e
                    );
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Applying {} {}", directive.kind, directive.path.display())
                    });
                }
            }
        }
        Ok(())
    }

    fn mount_one(
        &mut self,
        directive: &PathDirective,
        source: &Path,
        view_path: &Path,
        target: &Path,
        options: &AssembleOptions,
    ) -> Result<()> {
        match directive.kind {
            PathKind::Bind => {
                fsutil::bind_mount(source, target, true)?.leak();
                self.tree.set(view_path, PathState::BindMounted);
            }
            PathKind::BindChildren => {
                self.overlay_in_place(view_path, target)?;
                for child in sorted_children(source)? {
                    let name = child.file_name().unwrap().to_owned();
                    fsutil::bind_mount(&child, &target.join(&name), true)?.leak();
                    self.tree.set(&view_path.join(&name), PathState::BindMounted);
                }
            }
            PathKind::Overlay => {
                // The layer is the topmost lower so it wins over the current
                // view; unmounting it reveals the previous stacking.
                fsutil::makedirs(target, 0o755)?;
                fsutil::mount_overlay(target, &[source, target], None, None)?.leak();
                self.tree
                    .set(view_path, PathState::OverlayMounted { upper: None });
            }
            PathKind::OverlayChildren => {
                for child in sorted_children(source)? {
                    let name = child.file_name().unwrap().to_owned();
                    let child_target = target.join(&name);
                    let child_view = view_path.join(&name);
                    if child.is_dir() {
                        fsutil::makedirs(&child_target, 0o755)?;
                        fsutil::mount_overlay(&child_target, &[&child, &child_target], None, None)?
                            .leak();
                        self.tree
                            .set(&child_view, PathState::OverlayMounted { upper: None });
                    } else {
                        fsutil::bind_mount(&child, &child_target, true)?.leak();
                        self.tree.set(&child_view, PathState::BindMounted);
                    }
                }
            }
            PathKind::Mount => {
                let fstype = directive
                    .fstype
                    .as_deref()
                    .context("mount directive without a filesystem type")?;
                fsutil::mount_virtual_fs(
                    target,
                    fstype,
                    directive.device.as_deref(),
                    directive.options.as_deref(),
                )?
                .leak();
                self.tree.set(
                    view_path,
                    PathState::SystemMount {
                        fstype: fstype.to_owned(),
                        device: directive.device.clone().unwrap_or_else(|| fstype.to_owned()),
                    },
                );
            }
            PathKind::Wormhole => {
                let client = options
                    .client_path
                    .unwrap_or(Path::new(DEFAULT_CLIENT_PATH));
                fsutil::bind_mount(client, target, false)?.leak();
                self.tree.set(view_path, PathState::BindMounted);
            }
            PathKind::Hide => unreachable!("handled by apply_directive"),
        }
        Ok(())
    }

    /// Mounts a read-write overlay of `target` over itself, with a
    /// throw-away tmpfs upper, so that subsequent binds below it do not
    /// perturb the real filesystem.
    fn overlay_in_place(&mut self, view_path: &Path, target: &Path) -> Result<()> {
        let scaffold = TmpfsTempDir::new()?;
        let upper = scaffold.path().join("upper");
        let work = scaffold.path().join("work");
        fsutil::makedirs(&upper, 0o755)?;
        fsutil::makedirs(&work, 0o755)?;
        fsutil::makedirs(target, 0o755)?;
        fsutil::mount_overlay(target, &[target], Some(&upper), Some(&work))?.leak();
        // The upper dir is scaffolding we do not retain, so it is not
        // recorded in the tree.
        self.tree
            .set(view_path, PathState::OverlayMounted { upper: None });
        self.scratch.push(scaffold);
        Ok(())
    }
}

/// Expands a directive path against the layer's source prefix with shell
/// glob semantics. A pattern without magic characters yields itself even
/// when nothing matches, so plain directives work for paths that do not
/// exist yet (fresh mount points, client binds).
fn expand_paths(source_prefix: &Path, pattern: &Path) -> Result<Vec<PathBuf>> {
    let full = rebase(pattern, source_prefix);
    let full_str = full
        .to_str()
        .with_context(|| format!("Path {} is not valid UTF-8", full.display()))?;

    let matches: Vec<PathBuf> = glob::glob(full_str)
        .with_context(|| format!("Bad glob pattern {}", full_str))?
        .collect::<Result<_, _>>()
        .with_context(|| format!("Expanding glob pattern {}", full_str))?;

    if matches.is_empty() && !has_magic(full_str) {
        return Ok(vec![full]);
    }
    Ok(matches)
}

fn has_magic(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Non-dot immediate children of a directory, in name order.
fn sorted_children(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut children: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Cannot read layer directory {}", dir.display()))?
        .filter_map(|entry| match entry {
            Ok(entry) if entry.file_name().to_string_lossy().starts_with('.') => None,
            Ok(entry) => Some(Ok(entry.path())),
            Err(e) => Some(Err(e.into())),
        })
        .collect::<Result<_>>()?;
    children.sort();
    Ok(children)
}

fn is_permission_error(err: &anyhow::Error) -> bool {
    if let Some(errno) = err.root_cause().downcast_ref::<nix::errno::Errno>() {
        return matches!(errno, nix::errno::Errno::EACCES | nix::errno::Errno::EPERM);
    }
    if let Some(io) = err.root_cause().downcast_ref::<std::io::Error>() {
        return io.kind() == std::io::ErrorKind::PermissionDenied;
    }
    false
}

/// Resolves an image reference to a mounted root directory, creating the
/// runtime-local container on first use.
pub fn resolve_image_root(runtime: &dyn ContainerRuntime, reference: &str) -> Result<PathBuf> {
    let local_name = local_name_for_image(reference);
    if !runtime.exists(&local_name)? {
        runtime
            .start(reference, &local_name)
            .with_context(|| format!("Cannot create container for image {}", reference))?;
    }
    runtime
        .mount(&local_name)
        .with_context(|| format!("Cannot mount image {}", reference))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use config::Config;
    use pretty_assertions::assert_eq;

    use super::*;

    /// Stands in for podman: "mounting" the image yields a fixed directory.
    struct FakeRuntime {
        root: PathBuf,
        mounted: RefCell<Vec<String>>,
    }

    impl FakeRuntime {
        fn new(root: &Path) -> Self {
            Self {
                root: root.to_path_buf(),
                mounted: RefCell::new(Vec::new()),
            }
        }
    }

    impl ContainerRuntime for FakeRuntime {
        fn exists(&self, _local_name: &str) -> Result<bool> {
            Ok(true)
        }

        fn start(&self, _image_ref: &str, _local_name: &str) -> Result<()> {
            Ok(())
        }

        fn mount(&self, local_name: &str) -> Result<PathBuf> {
            self.mounted.borrow_mut().push(local_name.to_owned());
            Ok(self.root.clone())
        }

        fn unmount(&self, _local_name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn flat(config_text: &str, name: &str) -> FlatEnvironment {
        let config = Config::parse(config_text).unwrap();
        config::flatten_environment(&config, name).unwrap()
    }

    #[test]
    fn expand_paths_globs_and_falls_back() -> Result<()> {
        let dir = tempfile::tempdir()?;
        testutil::write_tree(dir.path(), &[("sbin/yast2", ""), ("sbin/yast", "")])?;

        let mut matches = expand_paths(dir.path(), Path::new("/sbin/yast*"))?;
        matches.sort();
        assert_eq!(
            matches,
            vec![dir.path().join("sbin/yast"), dir.path().join("sbin/yast2")]
        );

        // No magic characters: a missing path is returned as-is.
        assert_eq!(
            expand_paths(dir.path(), Path::new("/proc"))?,
            vec![dir.path().join("proc")]
        );

        // Magic characters without a match expand to nothing.
        assert!(expand_paths(dir.path(), Path::new("/sbin/zypper*"))?.is_empty());
        Ok(())
    }

    #[test]
    fn local_names_are_derived_from_references() {
        assert_eq!(
            local_name_for_image("registry.opensuse.org/opensuse/leap:15.4"),
            "wormhole_registry.opensuse.org_opensuse_leap"
        );
        assert_eq!(local_name_for_image("leap"), "wormhole_leap");
    }

    #[test]
    fn reference_layer_is_rejected() {
        let env = FlatEnvironment {
            name: "broken".to_owned(),
            layers: vec![config::Layer {
                source: LayerSource::Reference {
                    environment: "other".to_owned(),
                },
                paths: Vec::new(),
            }],
            provides: Vec::new(),
            requires: Vec::new(),
        };
        let dir = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::new(dir.path());
        let mut session = EnvironmentSession::new(env);
        let err = session
            .assemble(&AssembleOptions {
                runtime: &runtime,
                client_path: None,
            })
            .unwrap_err();
        assert!(format!("{:#}", err).contains("flattened"), "{:#}", err);
        assert_eq!(session.state(), AssemblyState::Failed);
    }

    #[test]
    fn bind_into_image_root() -> Result<()> {
        if !testutil::namespace_ready() {
            return Ok(());
        }

        let image_root = tempfile::tempdir()?;
        let layer_dir = tempfile::tempdir()?;
        testutil::write_tree(layer_dir.path(), &[("sbin/yast2", "#!/bin/sh\n")])?;

        let config_text = format!(
            r#"
environment yast {{
    define-image {{ image registry.example.com/leap:15.4 }}
    define-layer {{
        directory {}
        bind /sbin/yast2
    }}
}}
"#,
            layer_dir.path().display()
        );
        let env = flat(&config_text, "yast");

        let runtime = FakeRuntime::new(image_root.path());
        let mut session = EnvironmentSession::new(env);
        session.assemble(&AssembleOptions {
            runtime: &runtime,
            client_path: None,
        })?;

        assert_eq!(session.state(), AssemblyState::Ready);
        assert_eq!(session.root_directory(), Some(image_root.path()));
        assert_eq!(
            std::fs::read_to_string(image_root.path().join("sbin/yast2"))?,
            "#!/bin/sh\n"
        );
        assert_eq!(
            session.tree.get(Path::new("/sbin/yast2")),
            Some(&PathState::BindMounted)
        );
        assert_eq!(
            runtime.mounted.borrow().as_slice(),
            ["wormhole_registry.example.com_leap"]
        );

        fsutil::lazy_unmount(&image_root.path().join("sbin/yast2"))?;
        Ok(())
    }

    #[test]
    fn later_overlay_layer_wins() -> Result<()> {
        if !testutil::namespace_ready() {
            return Ok(());
        }

        let image_root = tempfile::tempdir()?;
        testutil::write_tree(image_root.path(), &[("usr/bin/", "")])?;
        let l1 = tempfile::tempdir()?;
        let l2 = tempfile::tempdir()?;
        testutil::write_tree(l1.path(), &[("usr/bin/foo", "1")])?;
        testutil::write_tree(l2.path(), &[("usr/bin/foo", "2")])?;

        let config_text = format!(
            r#"
environment stacked {{
    define-image {{ image registry.example.com/leap:15.4 }}
    define-layer {{
        directory {l1}
        overlay /usr
    }}
    define-layer {{
        directory {l2}
        overlay /usr
    }}
}}
"#,
            l1 = l1.path().display(),
            l2 = l2.path().display()
        );
        let env = flat(&config_text, "stacked");

        let runtime = FakeRuntime::new(image_root.path());
        let mut session = EnvironmentSession::new(env);
        session.assemble(&AssembleOptions {
            runtime: &runtime,
            client_path: None,
        })?;

        let foo = image_root.path().join("usr/bin/foo");
        assert_eq!(std::fs::read_to_string(&foo)?, "2");

        // Unmounting the top overlay reveals the first layer's content.
        fsutil::lazy_unmount(&image_root.path().join("usr"))?;
        assert_eq!(std::fs::read_to_string(&foo)?, "1");
        fsutil::lazy_unmount(&image_root.path().join("usr"))?;

        assert_eq!(
            session.tree.get(Path::new("/usr")),
            Some(&PathState::OverlayMounted { upper: None })
        );
        Ok(())
    }

    #[test]
    fn bind_children_keeps_children_individually_mounted() -> Result<()> {
        if !testutil::namespace_ready() {
            return Ok(());
        }

        let image_root = tempfile::tempdir()?;
        testutil::write_tree(image_root.path(), &[("opt/existing", "host")])?;
        let layer_dir = tempfile::tempdir()?;
        testutil::write_tree(
            layer_dir.path(),
            &[("opt/tool-a/bin", "a"), ("opt/.hidden/x", "")],
        )?;

        let config_text = format!(
            r#"
environment tools {{
    define-image {{ image registry.example.com/leap:15.4 }}
    define-layer {{
        directory {}
        bind-children /opt
    }}
}}
"#,
            layer_dir.path().display()
        );
        let env = flat(&config_text, "tools");

        let runtime = FakeRuntime::new(image_root.path());
        let mut session = EnvironmentSession::new(env);
        session.assemble(&AssembleOptions {
            runtime: &runtime,
            client_path: None,
        })?;

        let opt = image_root.path().join("opt");
        // The host child is still visible through the in-place overlay, the
        // layer child is bound on top, and dot entries are not bound.
        assert_eq!(std::fs::read_to_string(opt.join("existing"))?, "host");
        assert_eq!(std::fs::read_to_string(opt.join("tool-a/bin"))?, "a");
        assert!(!opt.join(".hidden").exists());

        assert_eq!(
            session.tree.get(Path::new("/opt")),
            Some(&PathState::OverlayMounted { upper: None })
        );
        assert_eq!(
            session.tree.get(Path::new("/opt/tool-a")),
            Some(&PathState::BindMounted)
        );

        fsutil::lazy_unmount(&opt.join("tool-a"))?;
        fsutil::lazy_unmount(&opt)?;
        Ok(())
    }

    #[test]
    fn mount_directive_records_system_mount() -> Result<()> {
        if !testutil::namespace_ready() {
            return Ok(());
        }

        let image_root = tempfile::tempdir()?;
        let config_text = r#"
environment vfs {
    define-image {
        image registry.example.com/leap:15.4
        mount /tmp tmpfs
    }
}
"#;
        let env = flat(config_text, "vfs");

        let runtime = FakeRuntime::new(image_root.path());
        let mut session = EnvironmentSession::new(env);
        session.assemble(&AssembleOptions {
            runtime: &runtime,
            client_path: None,
        })?;

        std::fs::write(image_root.path().join("tmp/probe"), "x")?;
        assert_eq!(
            session.tree.get(Path::new("/tmp")),
            Some(&PathState::SystemMount {
                fstype: "tmpfs".to_owned(),
                device: "tmpfs".to_owned(),
            })
        );

        fsutil::lazy_unmount(&image_root.path().join("tmp"))?;
        Ok(())
    }
}
