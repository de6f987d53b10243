// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{path::Path, process::Command};

use anyhow::{Context, Result};
use fsutil::rebase;
use pathstate::{PathState, PathTree};

const LDCONFIG: &str = "/sbin/ldconfig";
const LD_SO_CACHE: &str = "/etc/ld.so.cache";

/// Regenerates the linker cache of a layer and binds it over the view's
/// `/etc/ld.so.cache`, so libraries shipped by the layer resolve without an
/// ldconfig run inside the environment.
///
/// Regeneration is skipped when the layer's cache is already newer than the
/// host's; link creation is disabled so the layer tree is not rewritten.
pub fn apply_ldconfig(layer_dir: &Path, dest_prefix: &Path, tree: &mut PathTree) -> Result<()> {
    let etc = layer_dir.join("etc");
    fsutil::makedirs(&etc, 0o755)?;
    let cache = etc.join("ld.so.cache");
    let host_cache = Path::new(LD_SO_CACHE);

    let up_to_date = cache.exists()
        && host_cache.exists()
        && fsutil::inode_compare(&cache, host_cache)?.left_newer();
    if !up_to_date {
        processes::run_and_check(
            Command::new(LDCONFIG)
                .arg("-X")
                .arg("-r")
                .arg(layer_dir),
        )
        .with_context(|| format!("Regenerating linker cache for {}", layer_dir.display()))?;
    }

    if !cache.exists() {
        tracing::warn!(
            "ldconfig produced no cache for {}; leaving the host cache in place",
            layer_dir.display()
        );
        return Ok(());
    }

    let target = rebase(Path::new(LD_SO_CACHE), dest_prefix);
    fsutil::bind_mount(&cache, &target, false)?.leak();
    tree.set(Path::new(LD_SO_CACHE), PathState::BindMounted);
    Ok(())
}
