// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, bail, Context, Result};

use crate::{
    lexer::{tokenize, Token, TokenKind},
    Config, Environment, Layer, LayerSource, PathDirective, PathKind, Profile,
};

pub(crate) fn load(path: &Path) -> Result<Config> {
    let mut loader = Loader::default();
    loader.load_path(path)?;
    Ok(loader.config)
}

pub(crate) fn parse(text: &str) -> Result<Config> {
    let mut loader = Loader::default();
    loader.parse_text(text, Path::new("<inline>"))?;
    Ok(loader.config)
}

#[derive(Default)]
struct Loader {
    config: Config,
    /// Obsolete keywords already warned about, so each one warns only once
    /// per load.
    warned_obsolete: HashSet<String>,
    include_stack: Vec<PathBuf>,
}

impl Loader {
    fn load_path(&mut self, path: &Path) -> Result<()> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Cannot read configuration {}", path.display()))?;
        if metadata.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
                .map(|entry| Ok(entry?.path()))
                .collect::<Result<_>>()?;
            entries.sort();
            for entry in entries {
                if entry.extension().map_or(false, |ext| ext == "conf") {
                    self.load_file(&entry)?;
                }
            }
            Ok(())
        } else {
            self.load_file(path)
        }
    }

    fn load_file(&mut self, path: &Path) -> Result<()> {
        let canonical = std::fs::canonicalize(path)
            .with_context(|| format!("Cannot resolve configuration {}", path.display()))?;
        if self.include_stack.contains(&canonical) {
            bail!("Recursive include of {}", path.display());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read configuration {}", path.display()))?;

        self.include_stack.push(canonical);
        let result = self.parse_text(&text, path);
        self.include_stack.pop();
        result
    }

    fn parse_text(&mut self, text: &str, origin: &Path) -> Result<()> {
        let mut cursor = Cursor::new(tokenize(text), origin);
        while let Some(token) = cursor.next_token() {
            let line = token.line;
            let keyword = match &token.kind {
                TokenKind::Word(word) => word.clone(),
                other => {
                    return Err(cursor.error(line, format!("Unexpected '{}'", other.describe())));
                }
            };
            match keyword.as_str() {
                "config" => {
                    let (include, line) = cursor.expect_word("include path")?;
                    let include = resolve_relative(origin, Path::new(&include));
                    self.load_path(&include).with_context(|| {
                        format!("included from {}:{}", origin.display(), line)
                    })?;
                }
                "client-path" => {
                    let (value, line) = cursor.expect_word("client path")?;
                    if self.config.client_path.is_some() {
                        return Err(cursor.error(line, "Duplicate client-path declaration"));
                    }
                    self.config.client_path = Some(PathBuf::from(value));
                }
                "environment" => {
                    let environment = self.parse_environment(&mut cursor, origin)?;
                    if self.config.environment(&environment.name).is_some() {
                        return Err(cursor.error(
                            line,
                            format!("Duplicate environment '{}'", environment.name),
                        ));
                    }
                    self.config.environments.push(environment);
                }
                "profile" => {
                    let profile = Self::parse_profile(&mut cursor)?;
                    if self.config.profile(&profile.name).is_some() {
                        return Err(
                            cursor.error(line, format!("Duplicate profile '{}'", profile.name))
                        );
                    }
                    self.config.profiles.push(profile);
                }
                other => {
                    return Err(cursor.error(line, format!("Unknown keyword '{}'", other)));
                }
            }
        }
        Ok(())
    }

    fn warn_obsolete(&mut self, origin: &Path, line: u32, old: &str, new: &str) {
        if self.warned_obsolete.insert(old.to_owned()) {
            tracing::warn!(
                "{}:{}: keyword '{}' is obsolete, use '{}'",
                origin.display(),
                line,
                old,
                new
            );
        }
    }

    fn parse_environment(&mut self, cursor: &mut Cursor, origin: &Path) -> Result<Environment> {
        let (name, _) = cursor.expect_word("environment name")?;
        cursor.expect_open()?;

        let mut environment = Environment::new(name);
        loop {
            let token = cursor
                .next_token()
                .ok_or_else(|| cursor.error_at_end("Unterminated environment block"))?;
            let line = token.line;
            let keyword = match &token.kind {
                TokenKind::Close => break,
                TokenKind::Word(word) => word.clone(),
                TokenKind::Open => {
                    return Err(cursor.error(line, "Unexpected '{'"));
                }
            };
            match keyword.as_str() {
                "provides" => {
                    let (value, _) = cursor.expect_word("capability")?;
                    environment.provides.push(value);
                }
                "requires" => {
                    let (value, _) = cursor.expect_word("capability")?;
                    environment.requires.push(value);
                }
                "define-layer" => {
                    environment
                        .layers
                        .push(Self::parse_layer(cursor, origin, false)?);
                }
                "overlay" => {
                    // Obsolete alias from before layers had their own block
                    // keyword.
                    self.warn_obsolete(origin, line, "overlay", "define-layer");
                    environment
                        .layers
                        .push(Self::parse_layer(cursor, origin, false)?);
                }
                "define-image" => {
                    environment
                        .layers
                        .push(Self::parse_layer(cursor, origin, true)?);
                }
                "use-environment" => {
                    let (value, _) = cursor.expect_word("environment name")?;
                    environment.layers.push(Layer {
                        source: LayerSource::Reference { environment: value },
                        paths: Vec::new(),
                    });
                }
                "layer" => {
                    self.warn_obsolete(origin, line, "layer", "use-environment");
                    let (value, _) = cursor.expect_word("environment name")?;
                    environment.layers.push(Layer {
                        source: LayerSource::Reference { environment: value },
                        paths: Vec::new(),
                    });
                }
                other => {
                    return Err(cursor.error(
                        line,
                        format!("Unknown keyword '{}' in environment block", other),
                    ));
                }
            }
        }
        Ok(environment)
    }

    fn parse_layer(cursor: &mut Cursor, origin: &Path, is_image: bool) -> Result<Layer> {
        let open_line = cursor.expect_open()?;
        let mut directory: Option<PathBuf> = None;
        let mut image: Option<String> = None;
        let mut use_ldconfig = false;
        let mut paths = Vec::new();

        loop {
            let token = cursor
                .next_token()
                .ok_or_else(|| cursor.error_at_end("Unterminated layer block"))?;
            let line = token.line;
            let keyword = match &token.kind {
                TokenKind::Close => break,
                TokenKind::Word(word) => word.clone(),
                TokenKind::Open => {
                    return Err(cursor.error(line, "Unexpected '{'"));
                }
            };
            match keyword.as_str() {
                "directory" => {
                    if directory.is_some() {
                        return Err(cursor.error(line, "Duplicate 'directory' declaration"));
                    }
                    let (value, _) = cursor.expect_word("directory path")?;
                    directory = Some(resolve_relative(origin, Path::new(&value)));
                }
                "image" => {
                    if !is_image {
                        return Err(cursor.error(line, "'image' is not valid in define-layer"));
                    }
                    if image.is_some() {
                        return Err(cursor.error(line, "Duplicate 'image' declaration"));
                    }
                    let (value, _) = cursor.expect_word("image reference")?;
                    image = Some(value);
                }
                "use" => {
                    let (value, line) = cursor.expect_word("feature name")?;
                    if value != "ldconfig" {
                        return Err(cursor.error(line, format!("Unknown feature '{}'", value)));
                    }
                    if is_image {
                        return Err(
                            cursor.error(line, "'use ldconfig' is not valid in define-image")
                        );
                    }
                    use_ldconfig = true;
                }
                "mount" => {
                    let (path, path_line) = cursor.expect_word("mount point")?;
                    let path = require_absolute(cursor, path_line, &path)?;
                    let (fstype, fstype_line) = cursor.expect_word("filesystem type")?;
                    let mut directive = PathDirective::mount(path, fstype);
                    // Optional device and options run to the end of the line.
                    if let Some(device) = cursor.next_word_on_line(fstype_line) {
                        directive.device = Some(device);
                        directive.options = cursor.next_word_on_line(fstype_line);
                    }
                    paths.push(directive);
                }
                kind => match PathKind::from_str(kind) {
                    Ok(kind) => {
                        let (path, path_line) = cursor.expect_word("path")?;
                        let path = require_absolute(cursor, path_line, &path)?;
                        paths.push(PathDirective::new(kind, path));
                    }
                    Err(_) => {
                        return Err(cursor.error(
                            line,
                            format!("Unknown keyword '{}' in layer block", keyword),
                        ));
                    }
                },
            }
        }

        let source = if is_image {
            if image.is_none() && directory.is_none() {
                return Err(
                    cursor.error(open_line, "define-image needs 'image' or 'directory'")
                );
            }
            LayerSource::Image {
                reference: image,
                directory,
            }
        } else {
            LayerSource::Directory {
                directory: directory.ok_or_else(|| {
                    cursor.error(open_line, "define-layer without 'directory'")
                })?,
                use_ldconfig,
            }
        };
        Ok(Layer { source, paths })
    }

    fn parse_profile(cursor: &mut Cursor) -> Result<Profile> {
        let (name, _) = cursor.expect_word("profile name")?;
        cursor.expect_open()?;

        let mut profile = Profile {
            name,
            ..Default::default()
        };
        loop {
            let token = cursor
                .next_token()
                .ok_or_else(|| cursor.error_at_end("Unterminated profile block"))?;
            let line = token.line;
            let keyword = match &token.kind {
                TokenKind::Close => break,
                TokenKind::Word(word) => word.clone(),
                TokenKind::Open => {
                    return Err(cursor.error(line, "Unexpected '{'"));
                }
            };
            let (value, _) = cursor.expect_word("value")?;
            match keyword.as_str() {
                "wrapper" => profile.wrapper = Some(PathBuf::from(value)),
                "command" => profile.command = Some(PathBuf::from(value)),
                "environment" => profile.environment = Some(value),
                other => {
                    return Err(cursor.error(
                        line,
                        format!("Unknown keyword '{}' in profile block", other),
                    ));
                }
            }
        }
        Ok(profile)
    }
}

fn require_absolute(cursor: &Cursor, line: u32, path: &str) -> Result<PathBuf> {
    if !path.starts_with('/') {
        return Err(cursor.error(line, format!("Path '{}' must be absolute", path)));
    }
    Ok(PathBuf::from(path))
}

/// Resolves a path mentioned in a config file relative to that file's
/// directory.
fn resolve_relative(origin: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match origin.parent() {
        Some(parent) => parent.join(path),
        None => path.to_path_buf(),
    }
}

struct Cursor<'a> {
    tokens: Vec<Token>,
    pos: usize,
    origin: &'a Path,
}

impl<'a> Cursor<'a> {
    fn new(tokens: Vec<Token>, origin: &'a Path) -> Self {
        Self {
            tokens,
            pos: 0,
            origin,
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_word(&mut self, what: &str) -> Result<(String, u32)> {
        match self.next_token() {
            Some(Token {
                kind: TokenKind::Word(word),
                line,
            }) => Ok((word, line)),
            Some(token) => Err(self.error(
                token.line,
                format!("Expected {}, got '{}'", what, token.kind.describe()),
            )),
            None => Err(self.error_at_end(format!("Expected {}", what))),
        }
    }

    fn expect_open(&mut self) -> Result<u32> {
        match self.next_token() {
            Some(Token {
                kind: TokenKind::Open,
                line,
            }) => Ok(line),
            Some(token) => Err(self.error(
                token.line,
                format!("Expected '{{', got '{}'", token.kind.describe()),
            )),
            None => Err(self.error_at_end("Expected '{'")),
        }
    }

    /// Returns the next word only if it sits on `line`; used for optional
    /// trailing arguments.
    fn next_word_on_line(&mut self, line: u32) -> Option<String> {
        match self.tokens.get(self.pos) {
            Some(Token {
                kind: TokenKind::Word(word),
                line: token_line,
            }) if *token_line == line => {
                let word = word.clone();
                self.pos += 1;
                Some(word)
            }
            _ => None,
        }
    }

    fn error(&self, line: u32, message: impl std::fmt::Display) -> anyhow::Error {
        anyhow!("{}:{}: {}", self.origin.display(), line, message)
    }

    fn error_at_end(&self, message: impl std::fmt::Display) -> anyhow::Error {
        let line = self.tokens.last().map_or(0, |t| t.line);
        self.error(line, message)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_full_environment() -> Result<()> {
        let config = parse(
            r#"
client-path /usr/bin/wormhole

environment yast {
    provides yast2-4.3
    requires python3-devel-3.8
    define-layer {
        directory /opt/yast-layer
        use ldconfig
        bind /sbin/yast2
        overlay /usr/lib/yast2
        mount /proc proc
        mount /dev/pts devpts devpts gid=5,mode=620
        wormhole /usr/bin/zypper
    }
}
"#,
        )?;

        assert_eq!(config.client_path, Some(PathBuf::from("/usr/bin/wormhole")));
        let environment = config.environment("yast").unwrap();
        assert_eq!(environment.provides, vec!["yast2-4.3"]);
        assert_eq!(environment.requires, vec!["python3-devel-3.8"]);
        assert_eq!(environment.layers.len(), 1);

        let layer = &environment.layers[0];
        assert_eq!(
            layer.source,
            LayerSource::Directory {
                directory: PathBuf::from("/opt/yast-layer"),
                use_ldconfig: true,
            }
        );
        assert_eq!(
            layer.paths,
            vec![
                PathDirective::new(PathKind::Bind, "/sbin/yast2"),
                PathDirective::new(PathKind::Overlay, "/usr/lib/yast2"),
                PathDirective::mount("/proc", "proc"),
                PathDirective {
                    kind: PathKind::Mount,
                    path: PathBuf::from("/dev/pts"),
                    fstype: Some("devpts".to_owned()),
                    device: Some("devpts".to_owned()),
                    options: Some("gid=5,mode=620".to_owned()),
                },
                PathDirective::new(PathKind::Wormhole, "/usr/bin/zypper"),
            ]
        );
        Ok(())
    }

    #[test]
    fn parses_image_environment_and_profile() -> Result<()> {
        let config = parse(
            r#"
environment leap {
    define-image {
        image registry.opensuse.org/opensuse/leap:15.4
        mount /proc proc
    }
}

profile yast2 {
    wrapper /usr/lib/wormhole/bin/yast2
    command /sbin/yast2
    environment leap
}
"#,
        )?;

        let environment = config.environment("leap").unwrap();
        assert_eq!(
            environment.layers[0].source,
            LayerSource::Image {
                reference: Some("registry.opensuse.org/opensuse/leap:15.4".to_owned()),
                directory: None,
            }
        );

        let profile = config.profile("yast2").unwrap();
        assert_eq!(profile.command, Some(PathBuf::from("/sbin/yast2")));
        assert_eq!(profile.environment, Some("leap".to_owned()));
        Ok(())
    }

    #[test]
    fn obsolete_aliases_are_rewritten() -> Result<()> {
        let config = parse(
            r#"
environment parent {
    define-layer { directory /p }
}
environment child {
    layer parent
    overlay { directory /c }
}
"#,
        )?;

        let child = config.environment("child").unwrap();
        assert_eq!(
            child.layers[0].source,
            LayerSource::Reference {
                environment: "parent".to_owned(),
            }
        );
        assert_eq!(
            child.layers[1].source,
            LayerSource::Directory {
                directory: PathBuf::from("/c"),
                use_ldconfig: false,
            }
        );
        Ok(())
    }

    #[test]
    fn rejects_relative_directive_path() {
        let err = parse("environment e { define-layer { directory /d bind usr } }")
            .unwrap_err()
            .to_string();
        assert!(err.contains("must be absolute"), "{}", err);
        assert!(err.contains(":1:"), "{}", err);
    }

    #[test]
    fn rejects_duplicate_environment() {
        let err = parse(
            "environment e { define-layer { directory /d } }\n\
             environment e { define-layer { directory /d } }",
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("Duplicate environment 'e'"), "{}", err);
    }

    #[test]
    fn rejects_unknown_keyword_with_location() {
        let err = parse("environment e {\n    frobnicate /x\n}")
            .unwrap_err()
            .to_string();
        assert!(err.contains(":2:"), "{}", err);
        assert!(err.contains("frobnicate"), "{}", err);
    }

    #[test]
    fn rejects_layer_without_directory() {
        let err = parse("environment e { define-layer { bind /x } }")
            .unwrap_err()
            .to_string();
        assert!(err.contains("without 'directory'"), "{}", err);
    }

    #[test]
    fn mount_optionals_stop_at_line_end() -> Result<()> {
        let config = parse(
            "environment e { define-layer {\n    directory /d\n    mount /proc proc\n    bind /x\n} }",
        )?;
        let layer = &config.environment("e").unwrap().layers[0];
        assert_eq!(layer.paths[0], PathDirective::mount("/proc", "proc"));
        assert_eq!(layer.paths[1], PathDirective::new(PathKind::Bind, "/x"));
        Ok(())
    }

    #[test]
    fn loads_includes_from_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sub = dir.path().join("conf.d");
        std::fs::create_dir(&sub)?;
        std::fs::write(
            sub.join("10-base.conf"),
            "environment base { define-layer { directory base-layer } }",
        )?;
        std::fs::write(
            sub.join("20-extra.conf"),
            "environment extra { use-environment base }",
        )?;
        std::fs::write(sub.join("README"), "not a config")?;
        let root = dir.path().join("wormhole.conf");
        std::fs::write(&root, "config conf.d\n")?;

        let config = load(&root)?;
        assert_eq!(config.environments.len(), 2);
        assert_eq!(config.environments[0].name, "base");
        // Relative layer directories resolve against the declaring file.
        assert_eq!(
            config.environments[0].layers[0].source,
            LayerSource::Directory {
                directory: sub.join("base-layer"),
                use_ldconfig: false,
            }
        );
        Ok(())
    }

    #[test]
    fn recursive_include_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("self.conf");
        std::fs::write(&path, "config self.conf\n")?;

        let err = load(&path).unwrap_err();
        let chain = format!("{:#}", err);
        assert!(chain.contains("Recursive include"), "{}", chain);
        assert!(chain.contains("included from"), "{}", chain);
        Ok(())
    }
}
