// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Result};

use crate::{Config, Layer, LayerSource};

/// An environment reduced to a flat list of non-reference layers, ready for
/// assembly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlatEnvironment {
    pub name: String,
    /// Contains no [`LayerSource::Reference`]; an image layer, if any, is at
    /// index 0.
    pub layers: Vec<Layer>,
    pub provides: Vec<String>,
    pub requires: Vec<String>,
}

/// Flattens `name` by splicing referenced environments' layers in place,
/// recursively.
///
/// Layers reached through two different references are deliberately kept as
/// duplicates; the stacking result is the same and collapsing them would
/// change directive ordering guarantees.
pub fn flatten_environment(config: &Config, name: &str) -> Result<FlatEnvironment> {
    let environment = config
        .environment(name)
        .ok_or_else(|| anyhow::anyhow!("Unknown environment '{}'", name))?;

    let mut layers = Vec::new();
    let mut visiting = vec![name.to_owned()];
    collect_layers(config, name, &mut visiting, &mut layers)?;

    let image_positions: Vec<usize> = layers
        .iter()
        .enumerate()
        .filter(|(_, layer)| matches!(layer.source, LayerSource::Image { .. }))
        .map(|(i, _)| i)
        .collect();
    if image_positions.len() > 1 {
        bail!(
            "Environment '{}' stacks {} image layers; only one is allowed",
            name,
            image_positions.len()
        );
    }
    if let Some(&position) = image_positions.first() {
        if position != 0 {
            bail!(
                "Environment '{}' has an image layer at position {}; an image must be the bottom of the stack",
                name,
                position
            );
        }
    }

    Ok(FlatEnvironment {
        name: environment.name.clone(),
        layers,
        provides: environment.provides.clone(),
        requires: environment.requires.clone(),
    })
}

fn collect_layers(
    config: &Config,
    name: &str,
    visiting: &mut Vec<String>,
    out: &mut Vec<Layer>,
) -> Result<()> {
    let environment = config
        .environment(name)
        .ok_or_else(|| anyhow::anyhow!("Unknown environment '{}'", name))?;

    for layer in &environment.layers {
        match &layer.source {
            LayerSource::Reference { environment: referenced } => {
                if visiting.iter().any(|v| v == referenced) {
                    bail!(
                        "Cyclic environment reference: {} -> {}",
                        visiting.join(" -> "),
                        referenced
                    );
                }
                visiting.push(referenced.clone());
                collect_layers(config, referenced, visiting, out)?;
                visiting.pop();
            }
            _ => out.push(layer.clone()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;

    fn layer_directory(layer: &Layer) -> &PathBuf {
        match &layer.source {
            LayerSource::Directory { directory, .. } => directory,
            other => panic!("not a directory layer: {:?}", other),
        }
    }

    #[test]
    fn splices_referenced_layers_in_place() -> Result<()> {
        let config = Config::parse(
            r#"
environment parent {
    define-layer { directory /p }
}
environment child {
    use-environment parent
    define-layer { directory /c }
}
"#,
        )?;

        let flat = flatten_environment(&config, "child")?;
        assert_eq!(flat.layers.len(), 2);
        assert_eq!(layer_directory(&flat.layers[0]), &PathBuf::from("/p"));
        assert_eq!(layer_directory(&flat.layers[1]), &PathBuf::from("/c"));
        Ok(())
    }

    #[test]
    fn flattening_is_a_fixpoint() -> Result<()> {
        let config = Config::parse(
            r#"
environment a { define-layer { directory /a } }
environment b { use-environment a define-layer { directory /b } }
environment c { use-environment b use-environment a }
"#,
        )?;

        let flat = flatten_environment(&config, "c")?;
        // No references survive, so a second flattening is the identity.
        assert!(flat
            .layers
            .iter()
            .all(|l| !matches!(l.source, LayerSource::Reference { .. })));
        assert_eq!(
            flat.layers.iter().map(layer_directory).collect::<Vec<_>>(),
            vec![
                &PathBuf::from("/a"),
                &PathBuf::from("/b"),
                &PathBuf::from("/a"),
            ]
        );
        Ok(())
    }

    #[test]
    fn detects_reference_cycles() -> Result<()> {
        let config = Config::parse(
            r#"
environment a { use-environment b }
environment b { use-environment a }
"#,
        )?;

        let err = flatten_environment(&config, "a").unwrap_err().to_string();
        assert!(err.contains("Cyclic environment reference"), "{}", err);
        Ok(())
    }

    #[test]
    fn rejects_image_above_the_bottom() -> Result<()> {
        let config = Config::parse(
            r#"
environment base { define-layer { directory /base } }
environment broken {
    use-environment base
    define-image { image registry.example.com/img:1 }
}
"#,
        )?;

        let err = flatten_environment(&config, "broken")
            .unwrap_err()
            .to_string();
        assert!(err.contains("must be the bottom"), "{}", err);
        Ok(())
    }

    #[test]
    fn rejects_multiple_images() -> Result<()> {
        let config = Config::parse(
            r#"
environment broken {
    define-image { image registry.example.com/a:1 }
    define-image { image registry.example.com/b:1 }
}
"#,
        )?;

        let err = flatten_environment(&config, "broken")
            .unwrap_err()
            .to_string();
        assert!(err.contains("only one is allowed"), "{}", err);
        Ok(())
    }

    #[test]
    fn image_at_bottom_is_accepted() -> Result<()> {
        let config = Config::parse(
            r#"
environment ok {
    define-image { image registry.example.com/img:1 }
    define-layer { directory /extra }
}
"#,
        )?;

        let flat = flatten_environment(&config, "ok")?;
        assert!(matches!(flat.layers[0].source, LayerSource::Image { .. }));
        Ok(())
    }

    #[test]
    fn unknown_reference_is_an_error() -> Result<()> {
        let config = Config::parse("environment a { use-environment ghost }")?;
        let err = flatten_environment(&config, "a").unwrap_err().to_string();
        assert!(err.contains("Unknown environment 'ghost'"), "{}", err);
        Ok(())
    }
}
