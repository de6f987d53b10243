// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{fmt::Write as _, path::Path};

use anyhow::{Context, Result};

use crate::{Config, Environment, Layer, LayerSource, PathKind, Profile};

pub(crate) fn write(config: &Config, path: &Path) -> Result<()> {
    std::fs::write(path, to_text(config))
        .with_context(|| format!("Cannot write configuration {}", path.display()))
}

pub(crate) fn to_text(config: &Config) -> String {
    let mut out = String::new();
    if let Some(client_path) = &config.client_path {
        writeln!(out, "client-path {}", client_path.display()).unwrap();
        out.push('\n');
    }
    for environment in &config.environments {
        write_environment(&mut out, environment);
        out.push('\n');
    }
    for profile in &config.profiles {
        write_profile(&mut out, profile);
        out.push('\n');
    }
    while out.ends_with("\n\n") {
        out.pop();
    }
    out
}

fn write_environment(out: &mut String, environment: &Environment) {
    writeln!(out, "environment {} {{", environment.name).unwrap();
    for capability in &environment.provides {
        writeln!(out, "\tprovides {}", capability).unwrap();
    }
    for capability in &environment.requires {
        writeln!(out, "\trequires {}", capability).unwrap();
    }
    for layer in &environment.layers {
        write_layer(out, layer);
    }
    out.push_str("}\n");
}

fn write_layer(out: &mut String, layer: &Layer) {
    match &layer.source {
        LayerSource::Reference { environment } => {
            writeln!(out, "\tuse-environment {}", environment).unwrap();
            return;
        }
        LayerSource::Directory {
            directory,
            use_ldconfig,
        } => {
            out.push_str("\tdefine-layer {\n");
            writeln!(out, "\t\tdirectory {}", directory.display()).unwrap();
            if *use_ldconfig {
                out.push_str("\t\tuse ldconfig\n");
            }
        }
        LayerSource::Image {
            reference,
            directory,
        } => {
            out.push_str("\tdefine-image {\n");
            if let Some(reference) = reference {
                writeln!(out, "\t\timage {}", reference).unwrap();
            }
            if let Some(directory) = directory {
                writeln!(out, "\t\tdirectory {}", directory.display()).unwrap();
            }
        }
    }
    for directive in &layer.paths {
        match directive.kind {
            PathKind::Mount => {
                write!(
                    out,
                    "\t\tmount {} {}",
                    directive.path.display(),
                    directive.fstype.as_deref().unwrap_or("none")
                )
                .unwrap();
                if let Some(device) = &directive.device {
                    write!(out, " {}", device).unwrap();
                    if let Some(options) = &directive.options {
                        write!(out, " {}", options).unwrap();
                    }
                }
                out.push('\n');
            }
            kind => {
                writeln!(out, "\t\t{} {}", kind, directive.path.display()).unwrap();
            }
        }
    }
    out.push_str("\t}\n");
}

fn write_profile(out: &mut String, profile: &Profile) {
    writeln!(out, "profile {} {{", profile.name).unwrap();
    if let Some(wrapper) = &profile.wrapper {
        writeln!(out, "\twrapper {}", wrapper.display()).unwrap();
    }
    if let Some(command) = &profile.command {
        writeln!(out, "\tcommand {}", command.display()).unwrap();
    }
    if let Some(environment) = &profile.environment {
        writeln!(out, "\tenvironment {}", environment).unwrap();
    }
    out.push_str("}\n");
}
