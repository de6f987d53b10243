// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs environment setup in a forked helper so namespace mutations do not
//! contaminate the calling process. The helper assembles, opens its mount
//! namespace file and hands the descriptor back over a socket pair; the
//! caller can later `setns` into it.

use std::{
    collections::HashMap,
    fs::File,
    io::{IoSlice, IoSliceMut},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use anyhow::{bail, ensure, Context, Result};
use nix::{
    sys::{
        socket::{
            recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned,
            MsgFlags, SockFlag, SockType, UnixAddr,
        },
        wait::{waitpid, WaitStatus},
    },
    unistd::{fork, ForkResult, Pid},
};

const MOUNT_NAMESPACE_FILE: &str = "/proc/self/ns/mnt";

struct PendingSetup {
    pid: Pid,
    sock: OwnedFd,
}

/// Tracks at most one in-flight helper per environment.
#[derive(Default)]
pub struct SetupCoordinator {
    pending: HashMap<String, PendingSetup>,
}

impl SetupCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forks a helper that runs `setup` and sends back its mount-namespace
    /// descriptor. A second request for the same environment while one is
    /// pending is a protocol error.
    pub fn begin<F>(&mut self, environment: &str, setup: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        ensure!(
            !self.pending.contains_key(environment),
            "Environment '{}' already has a setup in progress",
            environment
        );

        let (parent_fd, child_fd) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .context("Cannot create helper socket pair")?;
        let parent_fd = unsafe { OwnedFd::from_raw_fd(parent_fd) };
        let child_fd = unsafe { OwnedFd::from_raw_fd(child_fd) };

        match unsafe { fork() }.context("Cannot fork setup helper")? {
            ForkResult::Child => {
                drop(parent_fd);
                let code = match run_helper(&child_fd, setup) {
                    Ok(()) => 0,
                    Err(e) => {
                        eprintln!("wormhole setup helper: {:?}", e);
                        1
                    }
                };
                // The child shares the parent's stdio; skip atexit handlers.
                unsafe { libc::_exit(code) };
            }
            ForkResult::Parent { child } => {
                drop(child_fd);
                self.pending.insert(
                    environment.to_owned(),
                    PendingSetup {
                        pid: child,
                        sock: parent_fd,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn is_pending(&self, environment: &str) -> bool {
        self.pending.contains_key(environment)
    }

    /// Collects the helper of `environment`, returning the namespace
    /// descriptor it delivered.
    pub fn wait(&mut self, environment: &str) -> Result<OwnedFd> {
        let setup = self
            .pending
            .remove(environment)
            .with_context(|| format!("Environment '{}' has no setup in progress", environment))?;

        let namespace_fd = receive_namespace_fd(&setup.sock);
        let status = waitpid(setup.pid, None).context("Cannot reap setup helper")?;
        match status {
            WaitStatus::Exited(_, 0) => namespace_fd,
            WaitStatus::Exited(_, code) => {
                bail!("Setup helper for '{}' exited with code {}", environment, code)
            }
            other => bail!("Setup helper for '{}' ended with {:?}", environment, other),
        }
    }
}

impl Drop for SetupCoordinator {
    fn drop(&mut self) {
        for (environment, setup) in self.pending.drain() {
            tracing::warn!("Abandoning setup helper for '{}'", environment);
            let _ = nix::sys::signal::kill(setup.pid, nix::sys::signal::Signal::SIGKILL);
            let _ = waitpid(setup.pid, None);
        }
    }
}

fn run_helper<F>(sock: &OwnedFd, setup: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    setup()?;

    let namespace = File::open(MOUNT_NAMESPACE_FILE)
        .with_context(|| format!("Cannot open {}", MOUNT_NAMESPACE_FILE))?;
    let iov = [IoSlice::new(b"ns")];
    let fds = [namespace.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    sendmsg::<UnixAddr>(
        sock.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None,
    )
    .context("Cannot send namespace descriptor")?;
    Ok(())
}

fn receive_namespace_fd(sock: &OwnedFd) -> Result<OwnedFd> {
    let mut buf = [0u8; 8];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<UnixAddr>(
        sock.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .context("Cannot receive from setup helper")?;

    if msg.bytes == 0 {
        bail!("Setup helper exited without delivering a namespace descriptor");
    }
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    bail!("Setup helper reply carried no descriptor")
}

#[cfg(test)]
mod tests {
    use nix::sys::stat::fstat;

    use super::*;

    #[test]
    fn helper_delivers_namespace_fd() -> Result<()> {
        let mut coordinator = SetupCoordinator::new();
        coordinator.begin("demo", || Ok(()))?;
        assert!(coordinator.is_pending("demo"));

        let fd = coordinator.wait("demo")?;
        assert!(!coordinator.is_pending("demo"));

        // The received descriptor is a real namespace file.
        let stat = fstat(fd.as_raw_fd())?;
        assert!(stat.st_ino != 0);
        Ok(())
    }

    #[test]
    fn concurrent_setup_for_same_environment_is_rejected() -> Result<()> {
        let mut coordinator = SetupCoordinator::new();
        coordinator.begin("demo", || Ok(()))?;
        let err = coordinator.begin("demo", || Ok(())).unwrap_err();
        assert!(
            err.to_string().contains("already has a setup in progress"),
            "{}",
            err
        );
        coordinator.wait("demo")?;
        Ok(())
    }

    #[test]
    fn failing_setup_surfaces_as_error() -> Result<()> {
        let mut coordinator = SetupCoordinator::new();
        coordinator.begin("broken", || anyhow::bail!("refusing to assemble"))?;
        let err = coordinator.wait("broken").unwrap_err();
        assert!(
            err.to_string().contains("exited with code 1")
                || err.to_string().contains("without delivering"),
            "{}",
            err
        );
        Ok(())
    }

    #[test]
    fn waiting_without_begin_is_an_error() {
        let mut coordinator = SetupCoordinator::new();
        assert!(coordinator.wait("ghost").is_err());
    }
}
