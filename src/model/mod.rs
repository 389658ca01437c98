//! Core data types shared by the sandbox, the capture sink and the runner.

pub mod outcome;
pub mod request;

pub use outcome::{ErrorKind, ExecutionResult};
pub use request::{Capability, ExecutionRequest, RequestError, ResourceLimits};
