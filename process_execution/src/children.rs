// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use nix::sys::signal;
use nix::unistd::getpgid;
use nix::unistd::Pid;
use tokio::process::{Child, Command};

// We average out sending SIGKILL to the process's group over this many attempts, because
// checking whether the group has exited is inherently racy.
const GRACEFUL_SHUTDOWN_POLL_TIME: Duration = Duration::from_millis(50);

///
/// A child process running in its own process group, which is killed (as a group) when dropped,
/// optionally after a graceful shutdown window.
///
/// This is a wrapper around a tokio `Child`, and may be used like one.
///
pub struct ManagedChild {
    child: Child,
    graceful_shutdown_timeout: Option<Duration>,
    killed: bool,
}

impl ManagedChild {
    pub fn spawn(
        command: &mut Command,
        graceful_shutdown_timeout: Option<Duration>,
    ) -> std::io::Result<ManagedChild> {
        // Set `kill_on_drop` to encourage `tokio` to reap the process's pid if we fail to
        // kill the process group for any reason.
        command.kill_on_drop(true).process_group(0);

        let child = command.spawn()?;
        Ok(ManagedChild {
            child,
            graceful_shutdown_timeout,
            killed: false,
        })
    }

    fn signal_pg<T: Into<Option<signal::Signal>>>(&mut self, signal: T) -> Result<(), String> {
        let Some(pid) = self.child.id() else {
            // The child has already exited: nothing to signal.
            return Ok(());
        };
        let pgid = getpgid(Some(Pid::from_raw(pid as i32)))
            .map_err(|e| format!("Could not get process group id of child process: {e}"))?;
        signal::killpg(pgid, signal)
            .map_err(|e| format!("Failed to interrupt child processes: {e}"))
    }

    fn check_child_has_exited(&mut self) -> Result<bool, String> {
        let status = self
            .child
            .try_wait()
            .map_err(|e| format!("Failed to wait for child process: {e}"))?;
        Ok(status.is_some())
    }

    ///
    /// Send SIGINT to the process group, and poll for the child to exit for up to the graceful
    /// shutdown timeout.
    ///
    fn graceful_shutdown_sync(&mut self) -> Result<bool, String> {
        let Some(timeout) = self.graceful_shutdown_timeout else {
            return Ok(false);
        };

        self.signal_pg(signal::Signal::SIGINT)?;
        let deadline = Instant::now() + timeout;
        while Instant::now() <= deadline {
            if self.check_child_has_exited()? {
                return Ok(true);
            }
            std::thread::sleep(GRACEFUL_SHUTDOWN_POLL_TIME);
        }
        Ok(false)
    }

    ///
    /// Synchronously kill the process group, first attempting a graceful shutdown.
    ///
    pub fn attempt_shutdown_sync(&mut self) -> Result<(), String> {
        if self.graceful_shutdown_sync()? {
            self.killed = true;
            return Ok(());
        }
        self.signal_pg(signal::Signal::SIGKILL)?;
        self.killed = true;
        Ok(())
    }
}

impl Deref for ManagedChild {
    type Target = Child;

    fn deref(&self) -> &Child {
        &self.child
    }
}

impl DerefMut for ManagedChild {
    fn deref_mut(&mut self) -> &mut Child {
        &mut self.child
    }
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        if !self.killed {
            // Kill the process group, to catch any children which have double-forked.
            let _ = self.attempt_shutdown_sync();
        }
    }
}
