// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The wrapper binary: resolves the invoked name to a profile, assembles the
//! profile's environment in a fresh mount namespace and execs the wrapped
//! command inside it.

use std::{
    ffi::OsString,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Command, ExitCode},
};

use anyhow::{bail, Context, Result};
use assembler::{AssembleOptions, EnvironmentSession, PodmanRuntime};
use capability::{Capability, CapabilityRegistry};
use clap::Parser;
use cliutil::cli_main;
use config::Config;

const DEFAULT_CONFIG: &str = "/etc/wormhole/wormhole.conf";
const CONFIG_ENV: &str = "WORMHOLE_CONFIG";

#[derive(Parser, Debug)]
#[command(about = "Runs a command inside its layered environment")]
struct Cli {
    /// Profile to use instead of the invoked program name.
    #[arg(long)]
    profile: Option<String>,

    /// Configuration file or directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use a plain mount namespace instead of a user namespace.
    #[arg(long)]
    privileged_namespace: bool,

    /// Arguments passed through to the wrapped command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

fn profile_name(cli: &Cli) -> Result<String> {
    if let Some(profile) = &cli.profile {
        return Ok(profile.clone());
    }
    let argv0 = std::env::args_os()
        .next()
        .context("argv[0] is not available")?;
    Ok(Path::new(&argv0)
        .file_name()
        .context("argv[0] has no file name")?
        .to_string_lossy()
        .into_owned())
}

/// Loads the configs that provide an environment's requirements, resolving
/// each capability through the registry.
fn load_requirements(config: &mut Config, environment: &str) -> Result<()> {
    let registry = CapabilityRegistry::system();
    let requires = match config.environment(environment) {
        Some(environment) => environment.requires.clone(),
        None => return Ok(()),
    };
    for requirement in requires {
        let requirement = Capability::try_new(&requirement)?;
        match registry.resolve(&requirement)? {
            Some((capability, path)) => {
                tracing::debug!("Requirement {} provided by {}", capability, path.display());
                let provider = Config::load(&path)
                    .with_context(|| format!("Loading provider of {}", requirement))?;
                config.merge(provider);
            }
            None => bail!("No published capability satisfies '{}'", requirement),
        }
    }
    Ok(())
}

fn do_main(cli: Cli) -> Result<ExitCode> {
    let config_path = config_path(&cli);
    let mut config = Config::load(&config_path)?;

    let name = profile_name(&cli)?;
    let profile = config
        .profile(&name)
        .with_context(|| format!("No profile '{}' in {}", name, config_path.display()))?
        .clone();
    let environment_name = profile
        .environment
        .with_context(|| format!("Profile '{}' names no environment", name))?;
    let command = profile
        .command
        .with_context(|| format!("Profile '{}' names no command", name))?;

    load_requirements(&mut config, &environment_name)?;
    let environment = config::flatten_environment(&config, &environment_name)?;

    if cli.privileged_namespace {
        fsutil::enter_mount_namespace()?;
        fsutil::make_private(Path::new("/"))?;
    } else {
        fsutil::enter_mount_namespace_with_fallback()?;
    }

    let runtime = PodmanRuntime::new();
    let mut session = EnvironmentSession::new(environment);
    session.assemble(&AssembleOptions {
        runtime: &runtime,
        client_path: config.client_path.as_deref(),
    })?;

    if let Some(root) = session.root_directory() {
        nix::unistd::chroot(root)
            .with_context(|| format!("Cannot chroot into {}", root.display()))?;
        nix::unistd::chdir("/")?;
    }

    let error = Command::new(&command).arg0(&name).args(&cli.args).exec();
    Err(error).with_context(|| format!("Cannot exec {}", command.display()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    cli_main(|| do_main(cli))
}
