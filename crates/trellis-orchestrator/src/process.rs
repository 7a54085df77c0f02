// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OS process backend for the subprocess strategy.
//!
//! Spawned workers are fire-and-forget: completion is observed through the run
//! record, not through the child handle. Stopping is signal based.

use std::io;
use std::process::Stdio;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Launches worker processes from a configured command line.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: Vec<String>,
}

impl ProcessLauncher {
    /// Create a launcher. `command[0]` is the program, the rest its arguments.
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// Spawn a detached worker with extra environment variables.
    ///
    /// Returns the PID of the spawned process.
    pub fn spawn(&self, env: &[(&str, String)]) -> io::Result<u32> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty subprocess command",
            ));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("spawned process exited before reporting a pid"))?;

        info!(pid = pid, program = %program, "Spawned worker process");

        // Dropping the handle leaves the process running; tokio reaps it on exit.
        drop(child);

        Ok(pid)
    }
}

/// Send SIGTERM to a worker process.
///
/// Returns false if the process no longer exists.
pub fn terminate(pid: i32) -> io::Result<bool> {
    match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => {
            debug!(pid = pid, "Sent SIGTERM to process");
            Ok(true)
        }
        Err(Errno::ESRCH) => {
            debug!(pid = pid, "Process already gone (ESRCH)");
            Ok(false)
        }
        Err(e) => {
            warn!(pid = pid, error = %e, "Failed to send SIGTERM to process");
            Err(io::Error::from_raw_os_error(e as i32))
        }
    }
}

/// Check whether a process exists.
pub fn is_alive(pid: i32) -> bool {
    !matches!(signal::kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}
