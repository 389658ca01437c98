use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use snippet_runner::sandbox::{child, SANDBOX_ARG};
use snippet_runner::worker::Worker;
use snippet_runner::{init_config, Coordinator, RunnerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries job results (or sandbox events), logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("snippet_runner=info".parse()?),
        )
        .init();

    if std::env::args().nth(1).as_deref() == Some(SANDBOX_ARG) {
        return tokio::task::spawn_blocking(|| {
            child::serve(std::io::stdin().lock(), std::io::stdout())
        })
        .await
        .context("Sandbox task failed")?;
    }

    dotenvy::dotenv().ok();

    let config = RunnerConfig::from_env()?;
    info!(
        "Runner config: default_timeout={}ms, max_timeout={}ms, memory={}B, max_concurrency={}",
        config.default_timeout_ms,
        config.max_timeout_ms,
        config.limits.memory_bytes,
        config.max_concurrency,
    );
    init_config(config)?;

    info!("Starting snippet runner worker...");
    let worker = Worker::new(Arc::new(Coordinator::from_global_config()));

    info!("Waiting for jobs...");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    worker.run(stdin, tokio::io::stdout()).await?;

    info!("Input closed, worker stopped");
    Ok(())
}
