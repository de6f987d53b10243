// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::{AtomicBool, Ordering};

static NAMESPACE_READY: AtomicBool = AtomicBool::new(false);

/// Whether [`ctor_enter_mount_namespace`] managed to enter a private mount
/// namespace. Tests that perform real mounts return early when this is
/// false, so the suite still passes on kernels that forbid unprivileged
/// user namespaces.
pub fn namespace_ready() -> bool {
    NAMESPACE_READY.load(Ordering::Relaxed)
}

/// Enters a private mount namespace before the test harness spawns threads.
///
/// Register it in a test module as an `.init_array` constructor:
///
/// ```ignore
/// #[cfg(test)]
/// #[used]
/// #[link_section = ".init_array"]
/// static _CTOR: extern "C" fn() = ::testutil::ctor_enter_mount_namespace;
/// ```
pub extern "C" fn ctor_enter_mount_namespace() {
    match fsutil::enter_mount_namespace_with_fallback() {
        Ok(()) => NAMESPACE_READY.store(true, Ordering::Relaxed),
        Err(e) => {
            eprintln!("warning: not entering a mount namespace, mount tests will be skipped: {e:#}")
        }
    }
}
