// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    ffi::OsString,
    io::{BufRead, BufReader, Seek},
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{bail, ensure, Context, Result};
use assembler::{
    local_name_for_image, resolve_image_root, AssembleOptions, ContainerRuntime,
    EnvironmentSession,
};
use config::{Config, Environment, FlatEnvironment, Layer, LayerSource};
use fsutil::rebase;
use pathstate::{snapshot_mounts, PathState, PathTree};
use processes::ChildStatus;
use tracing::info_span;

/// Virtual filesystem types that are carried into the capture view as binds
/// of the host's instances rather than captured.
const VIRTUAL_FS_TYPES: &[&str] = &[
    "proc",
    "sysfs",
    "tmpfs",
    "devpts",
    "devtmpfs",
    "cgroup",
    "cgroup2",
    "bpf",
    "mqueue",
    "debugfs",
    "hugetlbfs",
    "securityfs",
    "pstore",
    "efivarfs",
];

/// Filesystem types overlayfs refuses as a lower layer.
const OVERLAY_UNSUPPORTED_TYPES: &[&str] = &["fat", "vfat", "nfs"];

const CONFIG_NAME: &str = ".digger.conf";
const DEFAULT_ENVIRONMENT_NAME: &str = "captured";

pub struct DiggerOptions {
    /// Where the scaffold and the resulting layer live.
    pub overlay_dir: PathBuf,
    /// Environment whose view the build command runs in; its first layer is
    /// the image source when it is an image environment.
    pub base_environment: Option<String>,
    /// Bound at `/build.sh` and prepended to the command.
    pub build_script: Option<PathBuf>,
    /// Bound at `/build`, which also becomes the working directory.
    pub build_directory: Option<PathBuf>,
    /// Recreate the overlay directory if it already exists.
    pub clean: bool,
    /// Extra filesystem types treated like the built-in virtual ones.
    pub extra_virtual_fs: Vec<String>,
    /// Command to run; empty means an interactive shell.
    pub command: Vec<OsString>,
}

/// Runs the whole capture session: scaffold, assemble, run, harvest.
///
/// The caller must already be inside a private (user and) mount namespace;
/// everything mounted here dies with it.
pub fn run(config: &Config, runtime: &dyn ContainerRuntime, options: &DiggerOptions) -> Result<()> {
    let _span = info_span!("digger", overlay = %options.overlay_dir.display()).entered();

    prepare_overlay_dir(&options.overlay_dir, options.clean)?;
    // The ancestor checks against the mount table need the physical path.
    let overlay_dir = options.overlay_dir.canonicalize()?;

    // The host mount table, before this session adds its own mounts.
    let snapshot = snapshot_mounts(None, None)?;

    let mut environment = base_environment(config, runtime, options)?;
    let (mut scaffold, image_container) =
        Scaffold::create(&overlay_dir, runtime, &mut environment)?;
    // The image mount lives on the host side of the namespace; give it back
    // whichever way the session ends.
    let _image_guard = scopeguard::guard(image_container, |container| {
        if let Some(container) = container {
            if let Err(e) = runtime.unmount(&container) {
                tracing::warn!("Cannot unmount container {}: {:#}", container, e);
            }
        }
    });

    let mut session = EnvironmentSession::new(environment);
    session.tree.set_root_directory(&scaffold.root);
    session.assemble(&AssembleOptions {
        runtime,
        client_path: config.client_path.as_deref(),
    })?;

    capture_live_mounts(&snapshot, &mut scaffold, &mut session.tree, options)?;

    let build = BuildBinds::establish(&scaffold.root, options)?;
    let provides_file = ProvidesFile::establish(&scaffold.root)?;

    run_command(&scaffold.root, &build, options)?;

    fsutil::lazy_unmount(&scaffold.root)?;
    harvest_uppers(&session.tree, &overlay_dir)?;
    cleanup_scaffold(&overlay_dir)?;

    let provides = provides_file.read_lines()?;
    let requires = options
        .base_environment
        .as_deref()
        .and_then(|name| config.environment(name))
        .map(|environment| environment.requires.clone())
        .unwrap_or_default();
    emit_config(
        &overlay_dir,
        &environment_name(options),
        provides,
        requires,
    )?;
    Ok(())
}

fn environment_name(options: &DiggerOptions) -> String {
    options
        .base_environment
        .clone()
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT_NAME.to_owned())
}

fn prepare_overlay_dir(overlay_dir: &Path, clean: bool) -> Result<()> {
    if overlay_dir.exists() {
        ensure!(
            clean,
            "{} already exists; pass --clean to recreate it",
            overlay_dir.display()
        );
        fsutil::remove_dir_all_with_chmod(overlay_dir)?;
    }
    fsutil::makedirs(overlay_dir, 0o755)
}

/// Resolves the base environment to a flat layer stack rooted in the capture
/// view. An image bottom layer is mounted through the runtime and becomes
/// the overlay base; its directives are re-targeted at the capture root.
fn base_environment(
    config: &Config,
    runtime: &dyn ContainerRuntime,
    options: &DiggerOptions,
) -> Result<FlatEnvironment> {
    match &options.base_environment {
        None => Ok(FlatEnvironment {
            name: environment_name(options),
            layers: Vec::new(),
            provides: Vec::new(),
            requires: Vec::new(),
        }),
        Some(name) => config::flatten_environment(config, name),
    }
    .map_err(|e| e.context("Resolving base environment"))
}

/// The working directories of a capture session, all under the overlay root.
struct Scaffold {
    overlay_dir: PathBuf,
    root: PathBuf,
    subtree_count: usize,
}

impl Scaffold {
    /// Creates `lower`/`tree`/`work`/`root`, binds the base at `lower`,
    /// overlays it at `root` and detaches the `lower` bind again. Also
    /// returns the runtime-local container name when the base is an image.
    fn create(
        overlay_dir: &Path,
        runtime: &dyn ContainerRuntime,
        environment: &mut FlatEnvironment,
    ) -> Result<(Self, Option<String>)> {
        let scaffold = Self {
            overlay_dir: overlay_dir.to_path_buf(),
            root: overlay_dir.join("root"),
            subtree_count: 0,
        };
        let lower = overlay_dir.join("lower");
        let tree = overlay_dir.join("tree");
        let work = overlay_dir.join("work");
        for dir in [&lower, &tree, &work, &scaffold.root] {
            fsutil::makedirs(dir, 0o755)?;
        }

        let (base_path, image_container) = match environment.layers.first_mut() {
            Some(Layer {
                source: source @ LayerSource::Image { .. },
                ..
            }) => {
                let (base, container) = match source {
                    LayerSource::Image {
                        reference: Some(reference),
                        ..
                    } => (
                        resolve_image_root(runtime, reference)?,
                        Some(local_name_for_image(reference)),
                    ),
                    LayerSource::Image {
                        reference: None,
                        directory: Some(directory),
                    } => (directory.clone(), None),
                    _ => bail!("Image layer without image or directory"),
                };
                // The image content reaches the view through the overlay;
                // the layer's own directives now operate on the capture
                // root.
                *source = LayerSource::Directory {
                    directory: scaffold.root.clone(),
                    use_ldconfig: false,
                };
                (base, container)
            }
            _ => (PathBuf::from("/"), None),
        };

        fsutil::bind_mount(&base_path, &lower, true)?.leak();
        fsutil::mount_overlay(&scaffold.root, &[&lower], Some(&tree), Some(&work))?.leak();
        fsutil::lazy_unmount(&lower)?;

        Ok((scaffold, image_container))
    }

    fn subtree_dirs(&mut self) -> Result<(PathBuf, PathBuf)> {
        let base = self
            .overlay_dir
            .join(format!("subtree.{}", self.subtree_count));
        self.subtree_count += 1;
        let tree = base.join("tree");
        let work = base.join("work");
        fsutil::makedirs(&tree, 0o755)?;
        fsutil::makedirs(&work, 0o755)?;
        Ok((tree, work))
    }
}

/// Re-establishes every live host mount inside the capture view: virtual
/// filesystems as binds, everything else re-overlaid with its own upper so
/// writes are captured.
fn capture_live_mounts(
    snapshot: &PathTree,
    scaffold: &mut Scaffold,
    tree: &mut PathTree,
    options: &DiggerOptions,
) -> Result<()> {
    let mut walk = snapshot.walk();
    while let Some((mount_point, state)) = walk.next() {
        let fstype = match state {
            PathState::SystemMount { fstype, .. } => fstype.as_str(),
            _ => continue,
        };

        // Mounts above (or at) the overlay directory would capture the
        // capture itself; leave them alone.
        if scaffold.overlay_dir.starts_with(&mount_point) {
            continue;
        }

        let target = rebase(&mount_point, &scaffold.root);
        let is_virtual = VIRTUAL_FS_TYPES.contains(&fstype)
            || options.extra_virtual_fs.iter().any(|t| t == fstype);

        let result = if is_virtual {
            walk.skip_children();
            bind_live_mount(&mount_point, &target, tree)
        } else if OVERLAY_UNSUPPORTED_TYPES.contains(&fstype) {
            continue;
        } else if !mount_point.is_dir() {
            // Overlayfs needs directories; file mounts are carried over as
            // binds.
            bind_live_mount(&mount_point, &target, tree)
        } else {
            let (upper, work) = scaffold.subtree_dirs()?;
            overlay_live_mount(&mount_point, &target, &upper, &work, tree)
        };

        match result {
            Ok(()) => {}
            Err(e) if is_permission_error(&e) => {
                tracing::warn!("Skipping mount {}: {:#}", mount_point.display(), e);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Capturing mount {}", mount_point.display()));
            }
        }
    }
    Ok(())
}

fn bind_live_mount(mount_point: &Path, target: &Path, tree: &mut PathTree) -> Result<()> {
    fsutil::bind_mount(mount_point, target, true)?.leak();
    tree.set(mount_point, PathState::BindMounted);
    Ok(())
}

fn overlay_live_mount(
    mount_point: &Path,
    target: &Path,
    upper: &Path,
    work: &Path,
    tree: &mut PathTree,
) -> Result<()> {
    fsutil::makedirs(target, 0o755)?;
    fsutil::mount_overlay(target, &[mount_point], Some(upper), Some(work))?.leak();
    tree.set(
        mount_point,
        PathState::OverlayMounted {
            upper: Some(upper.to_path_buf()),
        },
    );
    Ok(())
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

struct BuildBinds {
    has_build_dir: bool,
    script: Option<PathBuf>,
}

impl BuildBinds {
    fn establish(root: &Path, options: &DiggerOptions) -> Result<Self> {
        if let Some(build_dir) = &options.build_directory {
            fsutil::bind_mount(build_dir, &root.join("build"), true)?.leak();
        }
        if let Some(script) = &options.build_script {
            fsutil::bind_mount(script, &root.join("build.sh"), false)?.leak();
        }
        Ok(Self {
            has_build_dir: options.build_directory.is_some(),
            script: options.build_script.as_ref().map(|_| PathBuf::from("/build.sh")),
        })
    }

    fn working_dir(&self) -> PathBuf {
        if self.has_build_dir {
            PathBuf::from("/build")
        } else {
            PathBuf::from("/")
        }
    }
}

/// The `/provides` capture file: a temporary empty file bound into the view,
/// read back through the retained host descriptor after the run.
struct ProvidesFile {
    file: tempfile::NamedTempFile,
}

impl ProvidesFile {
    fn establish(root: &Path) -> Result<Self> {
        let file = tempfile::NamedTempFile::new()?;
        fsutil::bind_mount(file.path(), &root.join("provides"), false)?.leak();
        Ok(Self { file })
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        let mut file = self.file.reopen()?;
        file.rewind()?;
        let mut lines = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_owned());
            }
        }
        Ok(lines)
    }
}

fn default_shell() -> OsString {
    if let Some(shell) = std::env::var_os("SHELL") {
        return shell;
    }
    for candidate in ["/bin/bash", "/bin/sh"] {
        if Path::new(candidate).exists() {
            return candidate.into();
        }
    }
    OsString::from("/bin/sh")
}

fn run_command(root: &Path, build: &BuildBinds, options: &DiggerOptions) -> Result<()> {
    let mut argv: Vec<OsString> = Vec::new();
    if let Some(script) = &build.script {
        argv.push(script.clone().into_os_string());
    }
    argv.extend(options.command.iter().cloned());
    if argv.is_empty() {
        argv.push(default_shell());
    }

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    let root = root.to_path_buf();
    let cwd = build.working_dir();
    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::chroot(&root).map_err(std::io::Error::from)?;
            nix::unistd::chdir(&cwd).map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let status = {
        let _span = info_span!("build", command = ?argv).entered();
        processes::run(&mut cmd)?
    };
    if !status.success() {
        bail!("Build command failed: {}", ChildStatus(status));
    }
    Ok(())
}

/// Moves every non-empty capture upper into place under
/// `<overlay_dir>/tree/<mount point>`. Empty uppers and non-directories are
/// skipped.
pub fn harvest_uppers(tree: &PathTree, overlay_dir: &Path) -> Result<()> {
    let layer_tree = overlay_dir.join("tree");
    let mut walk = tree.walk();
    while let Some((mount_point, state)) = walk.next() {
        let upper = match state {
            PathState::OverlayMounted { upper: Some(upper) } => upper,
            _ => continue,
        };
        if !upper.is_dir() || is_empty_dir(upper)? {
            continue;
        }
        let target = rebase(&mount_point, &layer_tree);
        if let Some(parent) = target.parent() {
            fsutil::makedirs(parent, 0o755)?;
        }
        std::fs::rename(upper, &target).with_context(|| {
            format!(
                "Moving captured {} to {}",
                upper.display(),
                target.display()
            )
        })?;
        tracing::info!(
            "Captured changes below {}",
            mount_point.display()
        );
    }
    Ok(())
}

fn is_empty_dir(dir: &Path) -> Result<bool> {
    Ok(std::fs::read_dir(dir)?.next().is_none())
}

/// Removes everything from the overlay directory that is not layer content:
/// the scaffold, the subtree upper/work pairs, and the build/provides
/// artifacts that leaked into the captured tree.
pub fn cleanup_scaffold(overlay_dir: &Path) -> Result<()> {
    for name in ["work", "lower", "root"] {
        fsutil::remove_dir_all_with_chmod(&overlay_dir.join(name))?;
    }
    for entry in std::fs::read_dir(overlay_dir)? {
        let entry = entry?;
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with("subtree.")
        {
            fsutil::remove_dir_all_with_chmod(&entry.path())?;
        }
    }
    let tree = overlay_dir.join("tree");
    for name in ["build.sh", "provides"] {
        fsutil::remove_file_with_chmod(&tree.join(name))?;
    }
    fsutil::remove_dir_all_with_chmod(&tree.join("build"))?;
    Ok(())
}

/// Writes the minimal config describing the captured layer.
pub fn emit_config(
    overlay_dir: &Path,
    environment_name: &str,
    provides: Vec<String>,
    requires: Vec<String>,
) -> Result<PathBuf> {
    let mut environment = Environment::new(environment_name);
    environment.provides = provides;
    environment.requires = requires;
    // Relative to the emitted file, so the capture stays relocatable.
    environment.layers.push(Layer::directory("tree"));

    let config = Config {
        client_path: None,
        environments: vec![environment],
        profiles: Vec::new(),
    };
    let path = overlay_dir.join(CONFIG_NAME);
    config.write(&path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn emitted_config_parses_back() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = emit_config(
            dir.path(),
            "leap-img",
            vec!["python3-devel-3.9".to_owned()],
            vec!["gcc-12".to_owned()],
        )?;
        assert_eq!(path.file_name().unwrap(), ".digger.conf");

        let config = Config::load(&path)?;
        assert_eq!(config.environments.len(), 1);
        let environment = &config.environments[0];
        assert_eq!(environment.name, "leap-img");
        assert_eq!(environment.provides, vec!["python3-devel-3.9"]);
        assert_eq!(environment.requires, vec!["gcc-12"]);
        assert_eq!(
            environment.layers[0].source,
            LayerSource::Directory {
                directory: dir.path().join("tree"),
                use_ldconfig: false,
            }
        );
        Ok(())
    }

    #[test]
    fn harvest_moves_non_empty_uppers_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let overlay_dir = dir.path();
        fsutil::makedirs(&overlay_dir.join("tree"), 0o755)?;

        let full_upper = overlay_dir.join("subtree.0/tree");
        testutil::write_tree(&full_upper, &[("bin/newbin", "fresh")])?;
        let empty_upper = overlay_dir.join("subtree.1/tree");
        fsutil::makedirs(&empty_upper, 0o755)?;

        let mut tree = PathTree::new();
        tree.set(
            Path::new("/boot"),
            PathState::OverlayMounted {
                upper: Some(full_upper.clone()),
            },
        );
        tree.set(
            Path::new("/srv"),
            PathState::OverlayMounted {
                upper: Some(empty_upper),
            },
        );
        tree.set(Path::new("/proc"), PathState::BindMounted);

        harvest_uppers(&tree, overlay_dir)?;

        assert_eq!(
            std::fs::read_to_string(overlay_dir.join("tree/boot/bin/newbin"))?,
            "fresh"
        );
        assert!(!overlay_dir.join("tree/srv").exists());
        assert!(!full_upper.exists());
        Ok(())
    }

    #[test]
    fn cleanup_leaves_only_layer_content() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let overlay_dir = dir.path();
        testutil::write_tree(
            overlay_dir,
            &[
                ("tree/usr/bin/newbin", ""),
                ("tree/build.sh", ""),
                ("tree/build/output", ""),
                ("tree/provides", ""),
                ("work/", ""),
                ("lower/", ""),
                ("root/", ""),
                ("subtree.0/work/", ""),
            ],
        )?;

        cleanup_scaffold(overlay_dir)?;

        assert_eq!(
            testutil::list_tree(overlay_dir)?,
            ["tree", "tree/usr", "tree/usr/bin", "tree/usr/bin/newbin"]
                .map(PathBuf::from)
                .to_vec()
        );
        Ok(())
    }

    #[test]
    fn existing_overlay_dir_requires_clean() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let overlay_dir = dir.path().join("capture");
        std::fs::create_dir(&overlay_dir)?;
        std::fs::write(overlay_dir.join("stale"), "")?;

        let err = prepare_overlay_dir(&overlay_dir, false).unwrap_err();
        assert!(err.to_string().contains("--clean"), "{}", err);

        prepare_overlay_dir(&overlay_dir, true)?;
        assert!(overlay_dir.is_dir());
        assert!(!overlay_dir.join("stale").exists());
        Ok(())
    }

    struct NoRuntime;

    impl ContainerRuntime for NoRuntime {
        fn exists(&self, _local_name: &str) -> Result<bool> {
            bail!("no runtime in this test")
        }

        fn start(&self, _image_ref: &str, _local_name: &str) -> Result<()> {
            bail!("no runtime in this test")
        }

        fn mount(&self, _local_name: &str) -> Result<PathBuf> {
            bail!("no runtime in this test")
        }

        fn unmount(&self, _local_name: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn captures_writes_of_a_build_command() -> Result<()> {
        if !testutil::namespace_ready() {
            return Ok(());
        }

        // Overlayfs refuses an upper directory that lives inside the lower
        // tree, and the lower here is the host root; keep the capture on its
        // own tmpfs.
        let dir = fsutil::TmpfsTempDir::new()?;
        let overlay_dir = dir.path().join("capture");
        let config = Config::default();
        let options = DiggerOptions {
            overlay_dir: overlay_dir.clone(),
            base_environment: None,
            build_script: None,
            build_directory: None,
            clean: false,
            extra_virtual_fs: Vec::new(),
            // /tmp is world-writable in any base, so the capture works for
            // unprivileged user namespaces too.
            command: [
                "/bin/sh",
                "-c",
                "echo fresh > /tmp/captured.txt && echo python3-devel-3.9 > /provides",
            ]
            .map(OsString::from)
            .to_vec(),
        };

        run(&config, &NoRuntime, &options)?;

        assert_eq!(
            std::fs::read_to_string(overlay_dir.join("tree/tmp/captured.txt"))?,
            "fresh\n"
        );
        for gone in ["work", "lower", "root", "tree/provides"] {
            assert!(!overlay_dir.join(gone).exists(), "{} still exists", gone);
        }

        let emitted = Config::load(&overlay_dir.join(".digger.conf"))?;
        assert_eq!(emitted.environments[0].provides, vec!["python3-devel-3.9"]);
        Ok(())
    }
}
