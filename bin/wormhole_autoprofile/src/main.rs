// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The analyser binary: converts a tree captured by the digger into a layer
//! configuration by applying per-path policies from a profile.

use std::{path::PathBuf, process::ExitCode};

use anyhow::Result;
use autoprofile::AnalyzeOptions;
use clap::Parser;
use cliutil::cli_main;

const AUTO_OUTPUT_NAME: &str = ".autoprofile.conf";

#[derive(Parser, Debug)]
#[command(about = "Derives a layer configuration from a captured tree")]
struct Cli {
    /// The digger output directory holding the captured tree.
    #[arg(long, required = true)]
    overlay_directory: PathBuf,

    /// Name of the emitted environment.
    #[arg(long, default_value = "captured")]
    environment_name: String,

    /// Where to write the emitted config: a path, "auto" for a file inside
    /// the overlay directory, or "-" for stdout.
    #[arg(long, default_value = "-")]
    output_file: String,

    /// A built-in profile tag or an absolute path to a profile file.
    #[arg(long, default_value = "default")]
    profile: String,

    /// Capability the emitted environment provides (repeatable).
    #[arg(long)]
    provides: Vec<String>,

    /// Capability the emitted environment requires (repeatable).
    #[arg(long)]
    requires: Vec<String>,

    /// Where check-binaries wrapper links will be installed.
    #[arg(long)]
    wrapper_directory: Option<PathBuf>,

    /// Additional directories to scan for wrappable executables
    /// (repeatable).
    #[arg(long)]
    check_binaries: Vec<PathBuf>,
}

fn do_main(cli: Cli) -> Result<ExitCode> {
    let options = AnalyzeOptions {
        overlay_dir: cli.overlay_directory.clone(),
        environment_name: cli.environment_name.clone(),
        profile: cli.profile.clone(),
        provides: cli.provides.clone(),
        requires: cli.requires.clone(),
        wrapper_directory: cli.wrapper_directory.clone(),
        check_binaries: cli.check_binaries.clone(),
    };

    let config = autoprofile::analyze(&options)?;

    match cli.output_file.as_str() {
        "-" => print!("{}", config.to_text()),
        "auto" => {
            let path = cli.overlay_directory.join(AUTO_OUTPUT_NAME);
            config.write(&path)?;
            tracing::info!("Wrote {}", path.display());
        }
        path => config.write(PathBuf::from(path).as_path())?,
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    cli_main(|| do_main(cli))
}
