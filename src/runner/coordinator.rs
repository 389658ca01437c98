//! Execution coordinator
//!
//! Runs one request end to end: capture install, a sandbox process per
//! execution, timeout and cancellation from the async side, capture release
//! and result assembly. A process that outlives its deadline is killed, so an
//! execution never keeps its slot past the timeout plus grace.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::CodeRunner;
use crate::capture::{CaptureGuard, OutputSink, Route};
use crate::config::{get_config, RunnerConfig};
use crate::model::{ErrorKind, ExecutionRequest, ExecutionResult, RequestError};
use crate::sandbox::{InterruptReason, ProcessExit, SandboxFault, SandboxJob, SandboxProcess};

/// Coordinates executions; safe to share across tasks
pub struct Coordinator {
    config: RunnerConfig,
    program: PathBuf,
    permits: Arc<Semaphore>,
    next_execution_id: AtomicU64,
}

impl Coordinator {
    pub fn new(config: RunnerConfig) -> Self {
        let program = match &config.sandbox_program {
            Some(program) => program.clone(),
            None => std::env::current_exe().unwrap_or_else(|e| {
                warn!("Cannot resolve current executable ({}), using PATH lookup", e);
                PathBuf::from(env!("CARGO_PKG_NAME"))
            }),
        };
        let permits = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            config,
            program,
            permits,
            next_execution_id: AtomicU64::new(0),
        }
    }

    /// Coordinator using the global configuration
    pub fn from_global_config() -> Self {
        Self::new(get_config().clone())
    }

    /// Execute a request that cannot be cancelled from outside
    pub async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, RequestError> {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Execute a request; cancelling `cancel` aborts it with `Cancelled`
    pub async fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, RequestError> {
        request.validate(&self.config)?;
        let timeout_millis = request.effective_timeout_millis(&self.config);

        let execution_id = self.next_execution_id.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        debug!(
            execution_id,
            code_len = request.code.len(),
            timeout_ms = timeout_millis,
            capabilities = request.capabilities.len(),
            "execution requested"
        );

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(execution_id, "execution cancelled while queued");
                return Ok(ExecutionResult::failure(
                    ErrorKind::Cancelled,
                    "execution cancelled before it started",
                    "",
                ));
            }
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(execution_id, "execution slots closed");
                    return Ok(ExecutionResult::failure(
                        ErrorKind::RuntimeError,
                        "runner is shutting down",
                        "",
                    ));
                }
            },
        };

        let limits = request.effective_limits(&self.config);
        let route = if self.config.trace_uncaptured {
            Route::Trace
        } else {
            Route::Discard
        };
        let sink = Arc::new(OutputSink::new(route, limits.max_output_bytes));
        let guard = match CaptureGuard::install(sink.clone()) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(execution_id, "failed to install capture: {}", e);
                return Ok(ExecutionResult::failure(
                    ErrorKind::RuntimeError,
                    e.to_string(),
                    "",
                ));
            }
        };

        let timeout = Duration::from_millis(timeout_millis);
        let deadline = tokio::time::Instant::now() + timeout;
        let hard_deadline = deadline + Duration::from_millis(self.config.timeout_grace_ms);
        let job = SandboxJob {
            code: request.code,
            timeout_millis,
            capabilities: request.capabilities,
            limits,
        };

        let spawned = SandboxProcess::spawn(&self.program, &job).await;
        let outcome: Result<(), SandboxFault> = match spawned {
            Ok(mut process) => {
                let outcome = tokio::select! {
                    biased;
                    exit = process.wait(&sink) => match exit {
                        Ok(ProcessExit::Finished(None)) => Ok(()),
                        Ok(ProcessExit::Finished(Some(fault))) => Err(fault),
                        Ok(ProcessExit::Died(status)) => {
                            warn!(execution_id, %status, "sandbox process exited without a result");
                            Err(unreported_exit(status, &cancel, deadline, timeout))
                        }
                        Err(e) => Err(SandboxFault::new(
                            ErrorKind::RuntimeError,
                            format!("lost contact with sandbox process: {}", e),
                        )),
                    },
                    _ = cancel.cancelled() => {
                        Err(SandboxFault::interrupted(InterruptReason::Cancelled, timeout))
                    }
                    _ = tokio::time::sleep_until(hard_deadline) => {
                        warn!(execution_id, "sandbox did not stop at its deadline, killing it");
                        Err(SandboxFault::interrupted(InterruptReason::Timeout, timeout))
                    }
                };
                // Slot stays taken until the process is gone
                process.kill().await;
                outcome
            }
            Err(e) => {
                warn!(execution_id, program = %self.program.display(), "failed to start sandbox: {}", e);
                Err(SandboxFault::new(
                    ErrorKind::RuntimeError,
                    format!("failed to start sandbox process: {}", e),
                ))
            }
        };
        drop(permit);

        let output = guard.finish();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(()) => {
                info!(
                    execution_id,
                    elapsed_ms,
                    output_len = output.len(),
                    "execution succeeded"
                );
                ExecutionResult::success(output)
            }
            Err(fault) => {
                info!(
                    execution_id,
                    elapsed_ms,
                    error_kind = %fault.kind,
                    partial_output_len = output.len(),
                    "execution failed"
                );
                ExecutionResult::failure(fault.kind, fault.message, output)
            }
        };

        Ok(result)
    }
}

/// Classify a sandbox process that ended without reporting an outcome
fn unreported_exit(
    status: ExitStatus,
    cancel: &CancellationToken,
    deadline: tokio::time::Instant,
    timeout: Duration,
) -> SandboxFault {
    if cancel.is_cancelled() {
        SandboxFault::interrupted(InterruptReason::Cancelled, timeout)
    } else if tokio::time::Instant::now() >= deadline {
        SandboxFault::interrupted(InterruptReason::Timeout, timeout)
    } else {
        SandboxFault::new(
            ErrorKind::RuntimeError,
            format!("sandbox process exited without a result ({})", status),
        )
    }
}

#[async_trait]
impl CodeRunner for Coordinator {
    async fn run(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, RequestError> {
        self.execute_with_cancel(request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    /// Coordinator whose sandbox binary does not exist
    fn coordinator_without_sandbox(config: RunnerConfig) -> Coordinator {
        Coordinator::new(RunnerConfig {
            sandbox_program: Some(PathBuf::from("/nonexistent/snippet-runner")),
            ..config
        })
    }

    #[tokio::test]
    async fn test_invalid_request_rejected() {
        let err = coordinator_without_sandbox(RunnerConfig::default())
            .execute(ExecutionRequest::new("print(1)").with_timeout_millis(0))
            .await
            .unwrap_err();

        assert_eq!(err, RequestError::ZeroTimeout);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = assert_ok!(
            coordinator_without_sandbox(RunnerConfig::default())
                .execute_with_cancel(ExecutionRequest::new(r#"print("never")"#), cancel)
                .await
        );

        assert_eq!(
            result,
            ExecutionResult::failure(
                ErrorKind::Cancelled,
                "execution cancelled before it started",
                ""
            )
        );
    }

    #[tokio::test]
    async fn test_missing_sandbox_binary_is_runtime_error() {
        let runner = coordinator_without_sandbox(RunnerConfig::default());

        let result = assert_ok!(runner.execute(ExecutionRequest::new("print(1)")).await);
        match result {
            ExecutionResult::Failure {
                error_kind,
                message,
                partial_output,
            } => {
                assert_eq!(error_kind, ErrorKind::RuntimeError);
                assert!(message.starts_with("failed to start sandbox process"));
                assert_eq!(partial_output, "");
            }
            other => panic!("expected failure, got {:?}", other),
        }

        // The slot was given back
        assert_eq!(
            runner.permits.available_permits(),
            RunnerConfig::default().max_concurrency
        );
    }

    #[tokio::test]
    async fn test_default_timeout_follows_own_config() {
        let runner = coordinator_without_sandbox(RunnerConfig {
            default_timeout_ms: 500,
            max_timeout_ms: 1_000,
            ..RunnerConfig::default()
        });

        // Accepted with this coordinator's default, not the global one
        let result = assert_ok!(runner.execute(ExecutionRequest::new("print(1)")).await);
        assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeError));
    }

    #[tokio::test]
    async fn test_runs_through_trait_object() {
        let runner: Box<dyn CodeRunner> =
            Box::new(coordinator_without_sandbox(RunnerConfig::default()));

        let err = runner
            .run(
                ExecutionRequest::new("").with_timeout_millis(u64::MAX),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RequestError::TimeoutTooLarge { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreported_exit_classification() {
        use std::os::unix::process::ExitStatusExt;

        let status = ExitStatus::from_raw(0);
        let timeout = Duration::from_millis(100);
        let future = tokio::time::Instant::now() + Duration::from_secs(60);
        let past = tokio::time::Instant::now() - Duration::from_millis(1);

        let crashed = unreported_exit(status, &CancellationToken::new(), future, timeout);
        assert_eq!(crashed.kind, ErrorKind::RuntimeError);

        let late = unreported_exit(status, &CancellationToken::new(), past, timeout);
        assert_eq!(late.kind, ErrorKind::Timeout);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            unreported_exit(status, &cancel, past, timeout).kind,
            ErrorKind::Cancelled
        );
    }
}
