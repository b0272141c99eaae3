use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::error::TrackerError;

/// Tracking service child process. Killed if dropped while still running.
pub struct ServiceProcess {
    program: String,
    child: Child,
}

impl ServiceProcess {
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, TrackerError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TrackerError::Process(format!("failed to launch {program}: {e}")))?;
        log::info!("Launched {program} (pid {:?})", child.id());
        Ok(Self {
            program: program.to_string(),
            child,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits up to `timeout` for the process to exit, then kills it.
    pub async fn wait_with_timeout(&mut self, timeout: Duration) -> Result<ExitStatus, TrackerError> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                log::info!("{} exited with {status}", self.program);
                Ok(status)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                log::error!(
                    "{} did not exit within {timeout:?}, killing it",
                    self.program
                );
                if let Err(err) = self.child.kill().await {
                    log::warn!("Failed to kill {}: {err}", self.program);
                }
                Err(TrackerError::Process(format!(
                    "{} did not exit within {timeout:?}",
                    self.program
                )))
            }
        }
    }
}
