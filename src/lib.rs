//! Sandboxed JavaScript snippet runner
//!
//! Executes caller-supplied JavaScript in a fresh embedded engine and returns
//! everything it printed. Each execution gets its own output sink, deadline,
//! resource limits and capability set; faults come back as typed failures
//! with the output captured before them.

pub mod capture;
pub mod config;
pub mod model;
pub mod runner;
pub mod sandbox;
pub mod worker;

pub use crate::capture::{
    CaptureError, CaptureGuard, CaptureToken, OutputSink, OutputTarget, Route,
};
pub use crate::config::{get_config, init_config, RunnerConfig};
pub use crate::model::{
    Capability, ErrorKind, ExecutionRequest, ExecutionResult, RequestError, ResourceLimits,
};
pub use crate::runner::{CodeRunner, Coordinator};
