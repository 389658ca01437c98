//! Newline-delimited JSON worker loop
//!
//! Reads `WorkerJob`s line by line, runs each execute job as its own task and
//! writes one `JobResult` line per execute job. Cancel jobs have no reply.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::model::{ExecutionRequest, ExecutionResult};
use crate::runner::CodeRunner;

/// Worker job enum - represents the jobs the worker can process
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "job_type")]
pub enum WorkerJob {
    /// Execute a snippet
    #[serde(rename = "execute")]
    Execute(ExecuteJob),
    /// Cancel an in-flight execution
    #[serde(rename = "cancel")]
    Cancel(CancelJob),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteJob {
    pub id: String,
    #[serde(flatten)]
    pub request: ExecutionRequest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelJob {
    pub id: String,
}

/// Reply to an execute job
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResult {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    /// Set when the request itself was rejected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type InFlight = Arc<Mutex<HashMap<String, CancellationToken>>>;

pub struct Worker {
    runner: Arc<dyn CodeRunner>,
    in_flight: InFlight,
}

impl Worker {
    pub fn new(runner: Arc<dyn CodeRunner>) -> Self {
        Self {
            runner,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Process jobs until `input` is exhausted and every execution has replied.
    /// Returns the output sink.
    pub async fn run<R, W>(self, input: R, output: W) -> Result<W>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<JobResult>();
        let writer = tokio::spawn(write_results(rx, output));
        let mut tasks = JoinSet::new();

        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await.context("Failed to read job")? {
            reap_finished(&mut tasks);
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<WorkerJob>(&line) {
                Ok(WorkerJob::Execute(job)) => {
                    let cancel = CancellationToken::new();
                    let duplicate = {
                        let mut in_flight = lock(&self.in_flight);
                        if in_flight.contains_key(&job.id) {
                            true
                        } else {
                            in_flight.insert(job.id.clone(), cancel.clone());
                            false
                        }
                    };
                    if duplicate {
                        warn!("Rejected execute job with duplicate id {}", job.id);
                        let _ = tx.send(JobResult {
                            id: job.id,
                            result: None,
                            error: Some("duplicate job id".to_string()),
                        });
                        continue;
                    }

                    info!("Received execute job: id={}", job.id);
                    let runner = self.runner.clone();
                    let in_flight = self.in_flight.clone();
                    let tx = tx.clone();
                    tasks.spawn(async move {
                        let reply = match runner.run(job.request, cancel).await {
                            Ok(result) => {
                                info!(
                                    "Finished execute job: id={}, success={}",
                                    job.id,
                                    result.is_success()
                                );
                                JobResult {
                                    id: job.id.clone(),
                                    result: Some(result),
                                    error: None,
                                }
                            }
                            Err(e) => {
                                warn!("Rejected execute job {}: {}", job.id, e);
                                JobResult {
                                    id: job.id.clone(),
                                    result: None,
                                    error: Some(e.to_string()),
                                }
                            }
                        };
                        lock(&in_flight).remove(&job.id);
                        if tx.send(reply).is_err() {
                            error!("Result writer gone, dropping result for {}", job.id);
                        }
                    });
                }
                Ok(WorkerJob::Cancel(job)) => match lock(&self.in_flight).get(&job.id) {
                    Some(token) => {
                        info!("Cancelling job {}", job.id);
                        token.cancel();
                    }
                    None => warn!("Cancel for unknown job {}", job.id),
                },
                Err(e) => {
                    warn!("Failed to parse job data: {}", e);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Execute task failed: {}", e);
            }
        }
        drop(tx);

        writer.await.context("Result writer task failed")?
    }
}

/// Drop finished execute tasks so a long-lived worker does not accumulate them
fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        if let Err(e) = joined {
            error!("Execute task failed: {}", e);
        }
    }
}

fn lock(in_flight: &InFlight) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn write_results<W>(mut rx: mpsc::UnboundedReceiver<JobResult>, mut output: W) -> Result<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(reply) = rx.recv().await {
        let mut line = serde_json::to_string(&reply)?;
        line.push('\n');
        output
            .write_all(line.as_bytes())
            .await
            .context("Failed to write job result")?;
        output.flush().await?;
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::model::{ErrorKind, RequestError};
    use async_trait::async_trait;

    /// Echoes the code back; code `wait` blocks until cancelled
    struct EchoRunner;

    #[async_trait]
    impl CodeRunner for EchoRunner {
        async fn run(
            &self,
            request: ExecutionRequest,
            cancel: CancellationToken,
        ) -> Result<ExecutionResult, RequestError> {
            request.validate(&RunnerConfig::default())?;
            if request.code == "wait" {
                cancel.cancelled().await;
                return Ok(ExecutionResult::failure(
                    ErrorKind::Cancelled,
                    "execution cancelled",
                    "",
                ));
            }
            Ok(ExecutionResult::success(request.code))
        }
    }

    async fn run_lines(input: &str) -> HashMap<String, JobResult> {
        let output = Worker::new(Arc::new(EchoRunner))
            .run(input.as_bytes(), Vec::new())
            .await
            .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| {
                let reply: JobResult = serde_json::from_str(line).unwrap();
                (reply.id.clone(), reply)
            })
            .collect()
    }

    #[test]
    fn test_parse_execute_job() {
        let job: WorkerJob = serde_json::from_str(
            r#"{"job_type": "execute", "id": "j1", "code": "print(1)", "timeout_millis": 250}"#,
        )
        .unwrap();

        match job {
            WorkerJob::Execute(job) => {
                assert_eq!(job.id, "j1");
                assert_eq!(job.request.code, "print(1)");
                assert_eq!(job.request.timeout_millis, Some(250));
            }
            other => panic!("unexpected job {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replies_per_execute_job() {
        let replies = run_lines(
            r#"{"job_type": "execute", "id": "ok", "code": "hi"}
not json

{"job_type": "execute", "id": "bad", "code": "", "timeout_millis": 0}
{"job_type": "cancel", "id": "unknown"}
"#,
        )
        .await;

        assert_eq!(replies.len(), 2);
        assert_eq!(replies["ok"].result, Some(ExecutionResult::success("hi")));
        assert!(replies["bad"].result.is_none());
        assert_eq!(replies["bad"].error.as_deref(), Some("timeout must be positive"));
    }

    #[tokio::test]
    async fn test_many_jobs_all_answered() {
        let input: String = (0..50)
            .map(|i| format!(r#"{{"job_type": "execute", "id": "j{}", "code": "{}"}}"#, i, i) + "\n")
            .collect();

        let replies = run_lines(&input).await;

        assert_eq!(replies.len(), 50);
        assert_eq!(replies["j42"].result, Some(ExecutionResult::success("42")));
    }

    #[tokio::test]
    async fn test_cancel_job() {
        let replies = run_lines(
            r#"{"job_type": "execute", "id": "spin", "code": "wait"}
{"job_type": "cancel", "id": "spin"}
"#,
        )
        .await;

        let result = replies["spin"].result.as_ref().unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
    }
}
