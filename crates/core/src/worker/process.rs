//! Subprocesses in their own process group.
//!
//! ffmpeg may fork helpers (and `nice` execs into it), so stopping a job
//! means signalling the whole group, not just the direct child.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::{ExitStatus, Output};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::encoder::EncoderError;

/// How waiting on a grouped child ended.
#[derive(Debug)]
pub(crate) enum WaitOutcome {
    Exited(ExitStatus),
    Cancelled,
    TimedOut,
}

/// A child process that leads its own process group.
pub(crate) struct GroupChild {
    child: Child,
    pgid: Option<Pid>,
    program: String,
}

impl GroupChild {
    /// Spawn `cmd` as the leader of a new process group.
    pub(crate) fn spawn(cmd: &mut Command, program: &str) -> Result<Self, EncoderError> {
        cmd.process_group(0).kill_on_drop(true);
        let child = cmd.spawn().map_err(|e| EncoderError::Spawn {
            program: program.to_string(),
            source: e,
        })?;
        let pgid = child.id().map(|id| Pid::from_raw(id as i32));
        debug!(program = %program, pgid = ?pgid, "Spawned process group");
        Ok(Self {
            child,
            pgid,
            program: program.to_string(),
        })
    }

    pub(crate) fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// SIGKILL every process in the group.
    pub(crate) fn kill_group(&self) {
        if let Some(pgid) = self.pgid {
            kill_group(pgid, &self.program);
        }
    }

    /// Wait for exit, cancellation or the timeout, whichever comes first.
    ///
    /// On cancellation or timeout the group is killed and reaped before
    /// this returns.
    pub(crate) async fn wait(
        &mut self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, EncoderError> {
        let sleep = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            status = self.child.wait() => WaitOutcome::Exited(status?),
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            _ = sleep => WaitOutcome::TimedOut,
        };

        if !matches!(outcome, WaitOutcome::Exited(_)) {
            self.kill_group();
            let _ = self.child.wait().await;
        }
        Ok(outcome)
    }

    /// Collect stdout/stderr and wait, killing the group on timeout.
    pub(crate) async fn output(self, timeout: Duration) -> Result<Output, EncoderError> {
        let GroupChild {
            child,
            pgid,
            program,
        } = self;
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => Ok(output?),
            Err(_) => {
                // The direct child is killed on drop, the rest of the group here
                if let Some(pgid) = pgid {
                    kill_group(pgid, &program);
                }
                Err(EncoderError::Timeout {
                    program,
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }
}

fn kill_group(pgid: Pid, program: &str) {
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => debug!(program = %program, pgid = %pgid, "Killed process group"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(program = %program, pgid = %pgid, error = %e, "Failed to kill process group"),
    }
}
