//! Sandbox process handle, parent side

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use super::child::{SandboxEvent, SandboxJob, SANDBOX_ARG};
use super::engine::SandboxFault;
use crate::capture::OutputSink;

/// How the sandbox process ended
#[derive(Debug)]
pub enum ProcessExit {
    /// Process reported its outcome; `None` means success
    Finished(Option<SandboxFault>),
    /// Process exited (or was killed) without reporting
    Died(ExitStatus),
}

/// One running sandbox process
pub struct SandboxProcess {
    child: Child,
    events: Lines<BufReader<ChildStdout>>,
}

impl SandboxProcess {
    /// Start `program` in sandbox mode and hand it the job
    pub async fn spawn(program: &Path, job: &SandboxJob) -> io::Result<Self> {
        let mut child = Command::new(program)
            .arg(SANDBOX_ARG)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("sandbox stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("sandbox stdout not piped"))?;

        let mut line = serde_json::to_string(job)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        drop(stdin);

        debug!(pid = child.id(), "sandbox process started");
        Ok(Self {
            child,
            events: BufReader::new(stdout).lines(),
        })
    }

    /// Forward streamed output into `sink` until the process reports or exits
    pub async fn wait(&mut self, sink: &OutputSink) -> io::Result<ProcessExit> {
        while let Some(line) = self.events.next_line().await? {
            match serde_json::from_str::<SandboxEvent>(&line) {
                Ok(SandboxEvent::Output { text }) => {
                    if let Err(e) = sink.append(&text) {
                        warn!("sandbox output rejected by sink: {}", e);
                    }
                }
                Ok(SandboxEvent::Finished { fault }) => return Ok(ProcessExit::Finished(fault)),
                Err(e) => warn!("Ignoring malformed sandbox event: {}", e),
            }
        }

        let status = self.child.wait().await?;
        Ok(ProcessExit::Died(status))
    }

    /// Kill the process if it is still running and reap it
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("sandbox process already gone: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceLimits;

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let job = SandboxJob {
            code: String::new(),
            timeout_millis: 100,
            capabilities: Vec::new(),
            limits: ResourceLimits::default(),
        };

        let result = SandboxProcess::spawn(Path::new("/nonexistent/snippet-runner"), &job).await;
        assert!(result.is_err());
    }
}
