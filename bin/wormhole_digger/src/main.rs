// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The capture binary: runs a build command in an everything-overlaid view
//! of a base environment and turns its filesystem mutations into a layer.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use assembler::PodmanRuntime;
use capability::{Capability, CapabilityRegistry};
use clap::Parser;
use cliutil::cli_main;
use config::Config;
use digger::DiggerOptions;

const DEFAULT_CONFIG: &str = "/etc/wormhole/wormhole.conf";
const CONFIG_ENV: &str = "WORMHOLE_CONFIG";

#[derive(Parser, Debug)]
#[command(about = "Captures the filesystem changes of a build command as a new layer")]
struct Cli {
    /// Environment providing the view the build command runs in.
    #[arg(long)]
    base_environment: Option<String>,

    /// Where the captured layer is written.
    #[arg(long, required = true)]
    overlay_directory: PathBuf,

    /// Script bound at /build.sh and run as the command.
    #[arg(long)]
    build_script: Option<PathBuf>,

    /// Directory bound at /build; becomes the working directory.
    #[arg(long)]
    build_directory: Option<PathBuf>,

    /// Use a plain mount namespace instead of a user namespace.
    #[arg(long)]
    privileged_namespace: bool,

    /// Recreate the overlay directory if it already exists.
    #[arg(long)]
    clean: bool,

    /// Configuration file or directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Additional filesystem types passed through from the host like proc
    /// or sysfs.
    #[arg(long = "virtual-fs")]
    virtual_fs: Vec<String>,

    /// Build command; defaults to an interactive shell.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    if !path.exists() && cli.config.is_none() {
        return Ok(Config::default());
    }
    let mut config = Config::load(&path)?;

    // A base environment that is not declared locally may be published in
    // the capability registry.
    if let Some(name) = &cli.base_environment {
        if config.environment(name).is_none() {
            let requirement = Capability::try_new(name)?;
            if let Some((capability, provider)) =
                CapabilityRegistry::system().resolve(&requirement)?
            {
                tracing::debug!(
                    "Base environment {} found via capability {}",
                    name,
                    capability
                );
                config.merge(Config::load(&provider)?);
            }
        }
    }
    Ok(config)
}

fn do_main(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;

    let options = DiggerOptions {
        overlay_dir: cli.overlay_directory.clone(),
        base_environment: cli.base_environment.clone(),
        build_script: cli.build_script.clone(),
        build_directory: cli.build_directory.clone(),
        clean: cli.clean,
        extra_virtual_fs: cli.virtual_fs.clone(),
        command: cli.command.clone(),
    };

    let runtime = PodmanRuntime::new();
    digger::run(&config, &runtime, &options)?;
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Namespace entry must happen while the process is still
    // single-threaded.
    let namespace_result = if cli.privileged_namespace {
        fsutil::enter_mount_namespace().and_then(|()| fsutil::make_private(Path::new("/")))
    } else {
        fsutil::enter_user_namespace().and_then(|()| fsutil::make_private(Path::new("/")))
    };

    cli_main(|| {
        namespace_result.context("Cannot set up namespaces")?;
        do_main(cli)
    })
}
