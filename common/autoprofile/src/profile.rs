// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{path::Path, str::FromStr};

use anyhow::{bail, Context, Result};
use strum_macros::{Display, EnumString};

/// One policy keyword of the profile language.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ProfileKeyword {
    EnvironmentType,
    Ignore,
    IgnoreIfEmpty,
    IgnoreEmptySubdirs,
    OptionalDirectory,
    Overlay,
    Bind,
    OverlayUnlessEmpty,
    BindUnlessEmpty,
    MustBeEmpty,
    CheckLdconfig,
    MountTmpfs,
    CheckBinaries,
}

/// A parsed `keyword [arg]` line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProfileLine {
    pub keyword: ProfileKeyword,
    pub arg: Option<String>,
    pub line: u32,
}

/// The baseline policy for trees captured from a package build: carry the
/// usual system prefixes when they received content, ignore runtime noise,
/// and let empty scaffolding directories vanish.
const DEFAULT_PROFILE: &str = "\
# Baseline policy for captured build trees.
check-ldconfig
mount-tmpfs /tmp
ignore /run
ignore /var
overlay-unless-empty /usr
overlay-unless-empty /etc
overlay-unless-empty /opt
overlay-unless-empty /srv
overlay-unless-empty /boot
ignore-empty-subdirs /
";

const BUILTIN_PROFILES: &[(&str, &str)] = &[("default", DEFAULT_PROFILE)];

/// Parses profile text into its lines. `#` and blank lines are ignored.
pub fn parse_profile(text: &str, origin: &str) -> Result<Vec<ProfileLine>> {
    let mut lines = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = index as u32 + 1;
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        let (keyword, arg) = match raw.split_once(char::is_whitespace) {
            Some((keyword, arg)) => (keyword, Some(arg.trim().to_owned())),
            None => (raw, None),
        };
        let keyword = ProfileKeyword::from_str(keyword)
            .with_context(|| format!("{}:{}: unknown keyword '{}'", origin, line, keyword))?;
        lines.push(ProfileLine { keyword, arg, line });
    }
    Ok(lines)
}

/// Loads a profile by built-in tag or absolute path.
pub fn load_profile(name: &str) -> Result<Vec<ProfileLine>> {
    if let Some((_, text)) = BUILTIN_PROFILES.iter().find(|(tag, _)| *tag == name) {
        return parse_profile(text, name);
    }
    if !name.starts_with('/') {
        bail!(
            "Unknown profile '{}' (built-in profiles: {})",
            name,
            BUILTIN_PROFILES
                .iter()
                .map(|(tag, _)| *tag)
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    let text = std::fs::read_to_string(Path::new(name))
        .with_context(|| format!("Cannot read profile {}", name))?;
    parse_profile(&text, name)
}
