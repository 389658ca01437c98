//! Sandbox module - isolated JavaScript evaluation
//!
//! This module provides the execution sandbox around an embedded QuickJS
//! engine. It handles:
//! - Fresh runtime and context per execution
//! - Memory, stack and output limits
//! - Deadline and cancellation through the engine's interrupt handler
//! - Capability-gated host bindings (`fs`, `env`)
//! - Classification of faults into `ErrorKind`
//!
//! Each execution runs in its own process (`child`), started and killed by
//! `process::SandboxProcess`, so a hung or crashing engine never takes the
//! runner with it.
//!
//! The sandbox module does NOT:
//! - Own the capture sink's lifecycle (that's the runner's job)
//! - Schedule or queue executions

pub mod bindings;
pub mod child;
pub mod context;
pub mod engine;
pub mod process;

pub use child::{SandboxEvent, SandboxJob, SANDBOX_ARG};
pub use context::{InterruptReason, InterruptState, SandboxContext};
pub use engine::{Sandbox, SandboxFault};
pub use process::{ProcessExit, SandboxProcess};
