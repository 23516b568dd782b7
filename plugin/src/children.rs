// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::ops::{Deref, DerefMut};
use std::os::unix::process::ExitStatusExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{thread, time};

use nix::sys::signal;
use nix::unistd::getpgid;
use nix::unistd::Pid;
use tokio::process::{Child, Command};

const SHUTDOWN_POLL_TIME: time::Duration = time::Duration::from_millis(50);

///
/// A plugin subprocess running in its own PGID, with a drop implementation that will terminate
/// that PGID: SIGTERM, a grace period, then SIGKILL.
///
/// Cancellation of a capability call propagates to the subprocess by dropping the future that
/// owns the ManagedChild.
///
pub struct ManagedChild {
    child: Child,
    graceful_shutdown_timeout: time::Duration,
    reaped: AtomicBool,
}

impl ManagedChild {
    pub fn spawn(
        command: &mut Command,
        graceful_shutdown_timeout: time::Duration,
    ) -> Result<Self, String> {
        // Set `kill_on_drop` to encourage `tokio` to `wait` the process via its own "reaping"
        // mechanism:
        //   see https://docs.rs/tokio/latest/tokio/process/struct.Command.html#method.kill_on_drop
        command.kill_on_drop(true);

        // Adjust the Command to create its own PGID as it starts, to make it safe to signal the
        // PGID later.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map(|_pgid| ()).map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("Could not create new pgid: {e}"),
                    )
                })
            });
        };

        let child = command
            .spawn()
            .map_err(|e| format!("Error spawning plugin process: {e}"))?;
        Ok(Self {
            child,
            graceful_shutdown_timeout,
            reaped: AtomicBool::new(false),
        })
    }

    ///
    /// Wait for the child to exit, returning its exit code (negated signal number if it was
    /// signalled). Consumes the obligation to clean up: a waited child is not signalled on drop.
    ///
    pub async fn wait_for_exit(&mut self) -> Result<i32, String> {
        let exit_status = self
            .child
            .wait()
            .await
            .map_err(|e| format!("Error waiting for plugin process: {e}"))?;
        self.reaped.store(true, Ordering::SeqCst);
        exit_status
            .code()
            .or_else(|| exit_status.signal().map(|s| -s))
            .ok_or_else(|| "Plugin process exited without a code or signal.".to_owned())
    }

    fn get_pgid(&self) -> Result<Pid, String> {
        let pid = self.id().ok_or_else(|| "Process had no PID.".to_owned())?;
        let pgid = getpgid(Some(Pid::from_raw(pid as i32)))
            .map_err(|e| format!("Could not get process group id of child process: {e}"))?;
        Ok(pgid)
    }

    /// Send a signal to the child process group.
    fn signal_pg<T: Into<Option<signal::Signal>>>(&mut self, signal: T) -> Result<(), String> {
        let pgid = self.get_pgid()?;
        // The negative PGID signals the entire process group.
        signal::kill(Pid::from_raw(-pgid.as_raw()), signal)
            .map_err(|e| format!("Failed to interrupt child process group: {e}"))?;
        Ok(())
    }

    fn check_child_has_exited(&mut self) -> Result<bool, String> {
        let maybe_status = self.child.try_wait().map_err(|e| e.to_string())?;
        if maybe_status.is_some() {
            self.reaped.store(true, Ordering::SeqCst);
        }
        Ok(maybe_status.is_some())
    }

    ///
    /// Synchronously wait for the child to exit, polling until the timeout is reached.
    ///
    /// Ok(true) indicates that the child has terminated; Ok(false) that the timeout elapsed
    /// first. This blocks the current thread, but for a bounded amount of time.
    ///
    fn wait_for_child_exit_sync(
        &mut self,
        max_wait_duration: time::Duration,
    ) -> Result<bool, String> {
        let deadline = time::Instant::now() + max_wait_duration;
        while time::Instant::now() <= deadline {
            if self.check_child_has_exited()? {
                return Ok(true);
            }
            thread::sleep(SHUTDOWN_POLL_TIME);
        }
        // If we get here we have timed out.
        Ok(false)
    }

    ///
    /// Attempt to shut the process group down: SIGTERM, then SIGKILL if it has not exited
    /// within the grace period. Blocks the current thread for at most the grace period.
    ///
    pub fn graceful_shutdown_sync(&mut self) -> Result<(), String> {
        self.signal_pg(signal::Signal::SIGTERM)?;
        match self.wait_for_child_exit_sync(self.graceful_shutdown_timeout) {
            Ok(true) => Ok(()),
            Ok(false) => {
                log::warn!(
                    "Timed out waiting for graceful shutdown of plugin process group. Will try SIGKILL instead."
                );
                self.kill_pgid()
            }
            Err(e) => {
                log::warn!("An error occurred while waiting for graceful shutdown of plugin process group ({e}). Will try SIGKILL instead.");
                self.kill_pgid()
            }
        }
    }

    fn kill_pgid(&mut self) -> Result<(), String> {
        self.signal_pg(signal::Signal::SIGKILL)?;
        self.reaped.store(true, Ordering::SeqCst);
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

/// Implements drop by terminating the process group.
impl Drop for ManagedChild {
    fn drop(&mut self) {
        if !self.reaped.load(Ordering::SeqCst) {
            let _ = self.graceful_shutdown_sync();
        }
    }
}
