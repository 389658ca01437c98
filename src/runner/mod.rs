//! Runner module - execution entry point for hosts
//!
//! This module provides the interface hosts program against:
//! - `CodeRunner`: the seam a host (worker loop, RPC handler, agent tool) calls
//! - `Coordinator`: the implementation that owns capture and sandbox lifecycles
//!
//! The runner module does NOT:
//! - Retry failed executions
//! - Decide when an execution should happen

pub mod coordinator;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::{ExecutionRequest, ExecutionResult, RequestError};

/// Runs snippets and reports what they printed
#[async_trait]
pub trait CodeRunner: Send + Sync {
    /// Execute a request until it finishes, fails, times out or `cancel` fires.
    ///
    /// Only a malformed request is an `Err`; every execution outcome is an
    /// `ExecutionResult`.
    async fn run(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, RequestError>;
}

// Re-exports
pub use coordinator::Coordinator;
