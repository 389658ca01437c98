//! Output capture sink
//!
//! Every execution owns one `OutputSink`. The sandbox bindings append to it;
//! the coordinator installs a capture before the run and restores the prior
//! route afterwards, taking the captured text with it.
//!
//! The sink does NOT:
//! - Decide what an execution's outcome is
//! - Know about the engine or its bindings

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

/// Where writes go while no capture is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Drop the write
    Discard,
    /// Forward the write to tracing at debug level
    Trace,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("a capture is already installed on this sink")]
    AlreadyInstalled,
    #[error("output limit of {limit} bytes exceeded")]
    OutputLimit { limit: usize },
}

/// Destination for text written by executing code
pub trait OutputTarget: Send + Sync {
    /// Append one chunk, or reject it whole when it would pass the limit
    fn append(&self, chunk: &str) -> Result<(), CaptureError>;
}

/// Chunks captured during one execution, in write order
#[derive(Debug, Default)]
struct CapturedOutput {
    chunks: Vec<String>,
    bytes: usize,
}

impl CapturedOutput {
    fn flatten(self) -> String {
        self.chunks.concat()
    }
}

#[derive(Debug)]
enum Target {
    Route(Route),
    Capture {
        generation: u64,
        output: CapturedOutput,
    },
}

#[derive(Debug)]
struct SinkState {
    target: Target,
    next_generation: u64,
}

/// Proof of an installed capture. Records the route to put back.
#[derive(Debug)]
#[must_use = "a capture stays installed until its token is restored"]
pub struct CaptureToken {
    generation: u64,
    previous: Route,
    restored: bool,
}

impl CaptureToken {
    pub fn is_restored(&self) -> bool {
        self.restored
    }
}

/// Swappable destination for text written by executing code
#[derive(Debug)]
pub struct OutputSink {
    state: Mutex<SinkState>,
    max_bytes: usize,
}

impl OutputSink {
    pub fn new(route: Route, max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(SinkState {
                target: Target::Route(route),
                next_generation: 0,
            }),
            max_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route writes into a fresh buffer until the token is restored
    pub fn install(&self) -> Result<CaptureToken, CaptureError> {
        let mut state = self.lock();
        let previous = match state.target {
            Target::Route(route) => route,
            Target::Capture { .. } => return Err(CaptureError::AlreadyInstalled),
        };

        let generation = state.next_generation;
        state.next_generation += 1;
        state.target = Target::Capture {
            generation,
            output: CapturedOutput::default(),
        };

        Ok(CaptureToken {
            generation,
            previous,
            restored: false,
        })
    }

    /// Append one chunk. Rejected chunks leave the buffer untouched.
    pub fn append(&self, chunk: &str) -> Result<(), CaptureError> {
        let mut state = self.lock();
        match &mut state.target {
            Target::Capture { output, .. } => {
                let bytes = output.bytes + chunk.len();
                if bytes > self.max_bytes {
                    return Err(CaptureError::OutputLimit {
                        limit: self.max_bytes,
                    });
                }
                output.bytes = bytes;
                output.chunks.push(chunk.to_string());
                Ok(())
            }
            Target::Route(Route::Trace) => {
                debug!(chunk, "uncaptured output");
                Ok(())
            }
            Target::Route(Route::Discard) => Ok(()),
        }
    }

    /// Put back the prior route and release the captured text.
    ///
    /// Returns `None` when the token was already restored.
    pub fn restore(&self, token: &mut CaptureToken) -> Option<String> {
        if token.restored {
            return None;
        }
        token.restored = true;

        let mut state = self.lock();
        match std::mem::replace(&mut state.target, Target::Route(token.previous)) {
            Target::Capture { generation, output } if generation == token.generation => {
                Some(output.flatten())
            }
            other => {
                // Token does not own the current target; leave it alone.
                state.target = other;
                Some(String::new())
            }
        }
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self.lock().target, Target::Capture { .. })
    }
}

impl OutputTarget for OutputSink {
    fn append(&self, chunk: &str) -> Result<(), CaptureError> {
        OutputSink::append(self, chunk)
    }
}

/// Scoped capture: restores on `finish` or, failing that, on drop
#[derive(Debug)]
pub struct CaptureGuard {
    sink: Arc<OutputSink>,
    token: CaptureToken,
}

impl CaptureGuard {
    pub fn install(sink: Arc<OutputSink>) -> Result<Self, CaptureError> {
        let token = sink.install()?;
        Ok(Self { sink, token })
    }

    pub fn sink(&self) -> &Arc<OutputSink> {
        &self.sink
    }

    /// Restore the route and take everything captured so far
    pub fn finish(mut self) -> String {
        self.sink.restore(&mut self.token).unwrap_or_default()
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.sink.restore(&mut self.token);
    }
}
