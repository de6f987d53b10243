// Copyright 2024 The Wormhole Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Result};
use nix::sys::signal::Signal;
use signal_hook::{
    consts::signal::{SIGCHLD, SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    fmt::{Display, Formatter},
    os::unix::process::ExitStatusExt,
    process::{Command, ExitCode, ExitStatus},
};
use tracing::instrument;

// run runs a child process, with some special signal handling:
//   - Forwards SIGTERM to the child process
//   - Ignores SIGINT while the process is running. SIGINT is normally
//     generated by the terminal when Ctrl+C is pressed and is sent to all
//     processes in the foreground process group, so the child receives it by
//     default and we must not deliver it twice.
#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run(cmd: &mut Command) -> Result<ExitStatus> {
    // Register the signal handler before spawning the process to ensure we
    // don't drop any signals.
    let mut signals = Signals::new([SIGCHLD, SIGINT, SIGTERM])?;

    let mut child = cmd.spawn()?;

    for signal in signals.forever() {
        match signal {
            SIGCHLD => match &child.try_wait()? {
                Some(status) => return Ok(*status),
                None => continue,
            },
            SIGINT => {}
            SIGTERM => nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(child.id().try_into()?),
                Signal::SIGTERM,
            )?,
            _ => unreachable!(),
        }
    }
    unreachable!()
}

#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run_and_check(cmd: &mut Command) -> Result<()> {
    let status = run(cmd)?;
    if !status.success() {
        bail!("Command {:?} failed: {}", cmd, ChildStatus(status));
    }
    Ok(())
}

/// Converts [`ExitStatus`] to [`ExitCode`] following the POSIX shell
/// convention: exit code N maps to N, death by signal S maps to 128+S.
///
/// It panics if [`ExitStatus`] does not represent an exiting process (e.g. a
/// process being stopped or continued). This won't happen as long as you get
/// [`ExitStatus`] from [`std::process`] methods such as [`Command::status`].
pub fn status_to_exit_code(status: &ExitStatus) -> ExitCode {
    if let Some(code) = status.code() {
        ExitCode::from(code as u8)
    } else if let Some(signal) = status.signal() {
        ExitCode::from(128 + signal as u8)
    } else {
        panic!("ExitStatus does not represent process exit: {:?}", status);
    }
}

/// Renders how a child ended, for operator-facing messages.
#[derive(Clone, Copy, Debug)]
pub struct ChildStatus(pub ExitStatus);

impl Display for ChildStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(code) = self.0.code() {
            write!(f, "child exited with code {}", code)
        } else if let Some(signal) = self.0.signal() {
            match Signal::try_from(signal) {
                Ok(signal) => write!(f, "child was killed by signal {}", signal),
                Err(_) => write!(f, "child was killed by signal {}", signal),
            }
        } else {
            write!(f, "child ended in unknown state")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_process() -> Result<()> {
        run_and_check(&mut Command::new("true"))?;
        Ok(())
    }

    #[test]
    fn runs_failed_process() -> Result<()> {
        run(&mut Command::new("false"))?;
        assert!(run_and_check(&mut Command::new("false")).is_err());
        Ok(())
    }

    #[test]
    fn child_status_names_exit_code() -> Result<()> {
        let status = run(Command::new("sh").args(["-c", "exit 3"]))?;
        assert_eq!(ChildStatus(status).to_string(), "child exited with code 3");
        Ok(())
    }

    #[test]
    fn child_status_names_signal() -> Result<()> {
        let status = run(Command::new("sh").args(["-c", "kill -TERM $$"]))?;
        assert_eq!(
            ChildStatus(status).to_string(),
            "child was killed by signal SIGTERM"
        );
        Ok(())
    }
}
