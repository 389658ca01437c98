//! Sandbox process side
//!
//! The runner binary re-executes itself with `SANDBOX_ARG` for every
//! execution. That process reads one `SandboxJob` line from stdin, runs it and
//! streams `SandboxEvent` lines to stdout: one `output` event per write, then a
//! single `finished` event. Output already streamed survives the process being
//! killed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::context::SandboxContext;
use super::engine::{Sandbox, SandboxFault};
use crate::capture::{CaptureError, OutputTarget};
use crate::model::{Capability, ResourceLimits};

/// First argument that switches the binary into sandbox mode
pub const SANDBOX_ARG: &str = "sandbox";

/// Everything the sandbox process needs, already validated by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxJob {
    pub code: String,
    pub timeout_millis: u64,
    pub capabilities: Vec<Capability>,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SandboxEvent {
    Output { text: String },
    Finished { fault: Option<SandboxFault> },
}

struct StreamState<W> {
    out: W,
    bytes: usize,
}

/// Forwards each write as an `output` event, enforcing the output limit
pub struct EventStream<W> {
    state: Mutex<StreamState<W>>,
    max_bytes: usize,
}

impl<W: Write> EventStream<W> {
    pub fn new(out: W, max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(StreamState { out, bytes: 0 }),
            max_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState<W>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(out: &mut W, event: &SandboxEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        out.write_all(line.as_bytes())?;
        out.flush()
    }

    /// Report the outcome; nothing may be written afterwards
    pub fn finish(&self, fault: Option<SandboxFault>) -> std::io::Result<()> {
        Self::send(&mut self.lock().out, &SandboxEvent::Finished { fault })
    }
}

impl<W: Write + Send> OutputTarget for EventStream<W> {
    fn append(&self, chunk: &str) -> Result<(), CaptureError> {
        let mut state = self.lock();
        let bytes = state.bytes + chunk.len();
        if bytes > self.max_bytes {
            return Err(CaptureError::OutputLimit {
                limit: self.max_bytes,
            });
        }
        state.bytes = bytes;

        let event = SandboxEvent::Output {
            text: chunk.to_string(),
        };
        if let Err(e) = Self::send(&mut state.out, &event) {
            // Parent is gone; it no longer wants the output
            debug!("dropping output, event pipe closed: {}", e);
        }
        Ok(())
    }
}

/// Run the single job read from `input`, streaming events to `output`
pub fn serve<R, W>(mut input: R, output: W) -> Result<()>
where
    R: BufRead,
    W: Write + Send + 'static,
{
    let mut line = String::new();
    input
        .read_line(&mut line)
        .context("Failed to read sandbox job")?;
    let job: SandboxJob = serde_json::from_str(&line).context("Invalid sandbox job")?;
    debug!(
        code_len = job.code.len(),
        timeout_ms = job.timeout_millis,
        "sandbox job received"
    );

    let stream = Arc::new(EventStream::new(output, job.limits.max_output_bytes));
    // The parent kills this process to cancel it
    let context = SandboxContext::new(
        stream.clone(),
        job.capabilities,
        job.limits,
        Duration::from_millis(job.timeout_millis),
        CancellationToken::new(),
    );

    let outcome = Sandbox::new().run(&job.code, &context);
    stream
        .finish(outcome.err())
        .context("Failed to report sandbox outcome")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ErrorKind;

    /// Clonable in-memory pipe end
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn events(&self) -> Vec<SandboxEvent> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    fn serve_job(job: &SandboxJob) -> Vec<SandboxEvent> {
        let input = format!("{}\n", serde_json::to_string(job).unwrap());
        let output = SharedBuf::default();
        serve(input.as_bytes(), output.clone()).unwrap();
        output.events()
    }

    fn job(code: &str) -> SandboxJob {
        SandboxJob {
            code: code.to_string(),
            timeout_millis: 5_000,
            capabilities: Vec::new(),
            limits: ResourceLimits::default(),
        }
    }

    #[test]
    fn test_streams_each_write_then_finishes() {
        let events = serve_job(&job(r#"print("a"); console.log("b");"#));

        assert_eq!(
            events,
            vec![
                SandboxEvent::Output {
                    text: "a".to_string()
                },
                SandboxEvent::Output {
                    text: "b\n".to_string()
                },
                SandboxEvent::Finished { fault: None },
            ]
        );
    }

    #[test]
    fn test_reports_fault_after_partial_output() {
        let events = serve_job(&job(r#"print("partial-"); null.x;"#));

        assert_eq!(events.len(), 2);
        match &events[1] {
            SandboxEvent::Finished {
                fault: Some(fault),
            } => assert_eq!(fault.kind, ErrorKind::RuntimeError),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_output_limit_enforced_in_stream() {
        let stream = EventStream::new(SharedBuf::default(), 4);

        stream.append("abc").unwrap();
        assert_eq!(
            stream.append("de").unwrap_err(),
            CaptureError::OutputLimit { limit: 4 }
        );
        stream.append("d").unwrap();
    }

    #[test]
    fn test_rejects_malformed_job() {
        let err = serve("not json\n".as_bytes(), SharedBuf::default()).unwrap_err();
        assert!(err.to_string().contains("Invalid sandbox job"));
    }
}
