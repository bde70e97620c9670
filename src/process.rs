//! Child-process supervision: the previous instance is interrupted, given a
//! grace period, then killed, before the next instance starts.

use std::process::ExitStatus;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cli::ExecArg;
use crate::error::{Error, Result};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const KILL_AFTER: Duration = Duration::from_secs(5);

/// Supervises at most one child process at a time.
pub struct ProcessSupervisor {
    exec: ExecArg,
    previous: Option<ChildHandle>,
}

struct ChildHandle {
    pid: Pid,
    exited: oneshot::Receiver<ExitStatus>,
}

impl ChildHandle {
    fn has_exited(&mut self) -> bool {
        !matches!(
            self.exited.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        )
    }
}

impl ProcessSupervisor {
    #[must_use]
    pub const fn new(exec: ExecArg) -> Self {
        Self {
            exec,
            previous: None,
        }
    }

    /// Stops the previous child, if any, and starts a fresh one.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the previous child cannot be signalled or the
    /// new child cannot be spawned.
    pub async fn restart(&mut self) -> Result<()> {
        if let Some(previous) = self.previous.take() {
            stop(previous).await?;
        }
        self.previous = Some(self.start()?);
        Ok(())
    }

    /// Stops the current child without starting a new one.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the child cannot be signalled.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(previous) = self.previous.take() {
            stop(previous).await?;
        }
        Ok(())
    }

    fn start(&self) -> Result<ChildHandle> {
        let mut child = Command::new(&self.exec.command)
            .args(&self.exec.args)
            .spawn()
            .map_err(Error::ChildSpawn)?;
        let Some(pid) = child.id() else {
            return Err(Error::ChildSpawn(std::io::Error::other(
                "child exited before its pid could be read",
            )));
        };
        let pid = Pid::from_raw(pid.cast_signed());
        info!(%pid, command = %self.exec.command, "started child process");

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    if status.success() {
                        info!(%pid, "child process exited");
                    } else {
                        warn!(%pid, %status, "child process exited");
                    }
                    let _ = exit_tx.send(status);
                }
                Err(error) => warn!(%pid, %error, "failed to reap child process"),
            }
        });

        Ok(ChildHandle {
            pid,
            exited: exit_rx,
        })
    }
}

async fn stop(mut child: ChildHandle) -> Result<()> {
    if child.has_exited() {
        debug!(pid = %child.pid, "previous child already exited");
        return Ok(());
    }

    info!(pid = %child.pid, "interrupting previous child");
    send_signal(child.pid, Signal::SIGINT)?;

    let deadline = tokio::time::Instant::now() + KILL_AFTER;
    while tokio::time::Instant::now() < deadline {
        sleep(EXIT_POLL_INTERVAL).await;
        if child.has_exited() {
            return Ok(());
        }
    }

    warn!(pid = %child.pid, "child ignored interrupt, killing");
    send_signal(child.pid, Signal::SIGKILL)
}

fn send_signal(pid: Pid, signal: Signal) -> Result<()> {
    match kill(pid, signal) {
        // ESRCH means the child is already gone, which is what we wanted.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(Error::ChildSignal(errno)),
    }
}
