//! Execution request and the capability surface a request may grant.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::config::RunnerConfig;

/// Host operation a request may grant to the snippet.
///
/// Nothing outside computation and output writing is reachable unless listed
/// here. File paths supplied by the snippet are resolved relative to `root`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Capability {
    /// `fs.readFile` / `fs.exists` under `root`
    FsRead { root: PathBuf },
    /// `fs.writeFile` under `root`
    FsWrite { root: PathBuf },
    /// `env.get` for the listed variable names
    Env { vars: Vec<String> },
}

impl Capability {
    pub fn kind(&self) -> &'static str {
        match self {
            Capability::FsRead { .. } => "fs_read",
            Capability::FsWrite { .. } => "fs_write",
            Capability::Env { .. } => "env",
        }
    }
}

/// Resource limits for one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Engine heap limit in bytes
    pub memory_bytes: usize,
    /// Engine stack limit in bytes
    pub max_stack_bytes: usize,
    /// Maximum captured output in bytes
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 64 * 1024 * 1024,
            max_stack_bytes: 512 * 1024,
            max_output_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("timeout must be positive")]
    ZeroTimeout,
    #[error("timeout {requested}ms exceeds the maximum of {max}ms")]
    TimeoutTooLarge { requested: u64, max: u64 },
    #[error("resource limit `{0}` must be positive")]
    ZeroLimit(&'static str),
    #[error("resource limit `{name}` of {requested} exceeds the configured {max}")]
    LimitTooLarge {
        name: &'static str,
        requested: usize,
        max: usize,
    },
    #[error("capability root {0:?} is not a directory")]
    InvalidRoot(PathBuf),
    #[error("environment capability lists an empty variable name")]
    EmptyEnvName,
    #[error("capability `{0}` granted more than once")]
    DuplicateCapability(&'static str),
}

/// A single execution request. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    /// Falls back to the runner's default timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_millis: Option<u64>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimits>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            timeout_millis: None,
            capabilities: Vec::new(),
            limits: None,
        }
    }

    pub fn with_timeout_millis(mut self, timeout_millis: u64) -> Self {
        self.timeout_millis = Some(timeout_millis);
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Timeout in force for this request
    pub fn effective_timeout_millis(&self, config: &RunnerConfig) -> u64 {
        self.timeout_millis.unwrap_or(config.default_timeout_ms)
    }

    /// Limits in force for this request
    pub fn effective_limits(&self, config: &RunnerConfig) -> ResourceLimits {
        self.limits.unwrap_or(config.limits)
    }

    /// Check the request against the configured ceilings.
    ///
    /// Empty code is valid and runs as a no-op.
    pub fn validate(&self, config: &RunnerConfig) -> Result<(), RequestError> {
        let timeout_millis = self.effective_timeout_millis(config);
        if timeout_millis == 0 {
            return Err(RequestError::ZeroTimeout);
        }
        if timeout_millis > config.max_timeout_ms {
            return Err(RequestError::TimeoutTooLarge {
                requested: timeout_millis,
                max: config.max_timeout_ms,
            });
        }

        if let Some(limits) = &self.limits {
            let pairs = [
                ("memory_bytes", limits.memory_bytes, config.limits.memory_bytes),
                (
                    "max_stack_bytes",
                    limits.max_stack_bytes,
                    config.limits.max_stack_bytes,
                ),
                (
                    "max_output_bytes",
                    limits.max_output_bytes,
                    config.limits.max_output_bytes,
                ),
            ];
            for (name, requested, max) in pairs {
                if requested == 0 {
                    return Err(RequestError::ZeroLimit(name));
                }
                if requested > max {
                    return Err(RequestError::LimitTooLarge {
                        name,
                        requested,
                        max,
                    });
                }
            }
        }

        let mut seen = Vec::with_capacity(self.capabilities.len());
        for capability in &self.capabilities {
            let kind = capability.kind();
            if seen.contains(&kind) {
                return Err(RequestError::DuplicateCapability(kind));
            }
            seen.push(kind);

            match capability {
                Capability::FsRead { root } | Capability::FsWrite { root } => {
                    if !root.is_dir() {
                        return Err(RequestError::InvalidRoot(root.clone()));
                    }
                }
                Capability::Env { vars } => {
                    if vars.iter().any(|v| v.is_empty()) {
                        return Err(RequestError::EmptyEnvName);
                    }
                }
            }
        }

        Ok(())
    }
}
