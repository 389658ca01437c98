//! Runner configuration
//!
//! Defaults, optionally overridden by a TOML file (`RUNNER_CONFIG`) and then
//! by `RUNNER_*` environment variables.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;

use crate::model::ResourceLimits;

/// Runner configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// Timeout used when a request does not carry one (default: 5000ms)
    pub default_timeout_ms: u64,
    /// Largest timeout a request may ask for (default: 60000ms)
    pub max_timeout_ms: u64,
    /// Extra wall time the coordinator waits for the engine to honor an interrupt
    pub timeout_grace_ms: u64,
    /// Default and ceiling limits for every execution
    pub limits: ResourceLimits,
    /// Number of executions allowed to run at once
    pub max_concurrency: usize,
    /// Forward writes made outside an active capture to tracing
    pub trace_uncaptured: bool,
    /// Binary started in sandbox mode for each execution (default: this executable)
    pub sandbox_program: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            max_timeout_ms: 60_000,
            timeout_grace_ms: 200,
            limits: ResourceLimits::default(),
            max_concurrency: 4,
            trace_uncaptured: false,
            sandbox_program: None,
        }
    }
}

/// Raw overrides, shared by the TOML file and the environment
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRunnerConfig {
    default_timeout_ms: Option<u64>,
    max_timeout_ms: Option<u64>,
    timeout_grace_ms: Option<u64>,
    memory_limit_mb: Option<usize>,
    stack_limit_kb: Option<usize>,
    output_limit_kb: Option<usize>,
    max_concurrency: Option<usize>,
    trace_uncaptured: Option<bool>,
    sandbox_program: Option<PathBuf>,
}

impl RawRunnerConfig {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Result<Option<T>>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            match lookup(key) {
                Some(value) => {
                    let parsed = value
                        .trim()
                        .parse::<T>()
                        .with_context(|| format!("Invalid value for {}: {}", key, value))?;
                    Ok(Some(parsed))
                }
                None => Ok(None),
            }
        }

        Ok(Self {
            default_timeout_ms: parse(&lookup, "RUNNER_DEFAULT_TIMEOUT_MS")?,
            max_timeout_ms: parse(&lookup, "RUNNER_MAX_TIMEOUT_MS")?,
            timeout_grace_ms: parse(&lookup, "RUNNER_TIMEOUT_GRACE_MS")?,
            memory_limit_mb: parse(&lookup, "RUNNER_MEMORY_LIMIT_MB")?,
            stack_limit_kb: parse(&lookup, "RUNNER_STACK_LIMIT_KB")?,
            output_limit_kb: parse(&lookup, "RUNNER_OUTPUT_LIMIT_KB")?,
            max_concurrency: parse(&lookup, "RUNNER_MAX_CONCURRENCY")?,
            trace_uncaptured: parse(&lookup, "RUNNER_TRACE_UNCAPTURED")?,
            sandbox_program: parse(&lookup, "RUNNER_SANDBOX_PROGRAM")?,
        })
    }

    fn apply(self, config: &mut RunnerConfig) -> Result<()> {
        fn scaled(key: &str, value: usize, unit: usize) -> Result<usize> {
            value
                .checked_mul(unit)
                .ok_or_else(|| anyhow::anyhow!("{} is too large: {}", key, value))
        }

        if let Some(v) = self.default_timeout_ms {
            config.default_timeout_ms = v;
        }
        if let Some(v) = self.max_timeout_ms {
            config.max_timeout_ms = v;
        }
        if let Some(v) = self.timeout_grace_ms {
            config.timeout_grace_ms = v;
        }
        if let Some(v) = self.memory_limit_mb {
            config.limits.memory_bytes = scaled("memory_limit_mb", v, 1024 * 1024)?;
        }
        if let Some(v) = self.stack_limit_kb {
            config.limits.max_stack_bytes = scaled("stack_limit_kb", v, 1024)?;
        }
        if let Some(v) = self.output_limit_kb {
            config.limits.max_output_bytes = scaled("output_limit_kb", v, 1024)?;
        }
        if let Some(v) = self.max_concurrency {
            config.max_concurrency = v;
        }
        if let Some(v) = self.trace_uncaptured {
            config.trace_uncaptured = v;
        }
        if let Some(v) = self.sandbox_program {
            config.sandbox_program = Some(v);
        }
        Ok(())
    }
}

impl RunnerConfig {
    /// Load configuration: defaults, then `RUNNER_CONFIG` file, then environment
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RUNNER_CONFIG") {
            config = Self::from_file(&path)?;
        }

        RawRunnerConfig::from_lookup(|key| std::env::var(key).ok())?.apply(&mut config)?;
        config.check()?;
        Ok(config)
    }

    /// Load configuration from a TOML file on top of the defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read runner config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid runner config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawRunnerConfig = toml::from_str(content)?;
        let mut config = Self::default();
        raw.apply(&mut config)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.default_timeout_ms == 0 || self.default_timeout_ms > self.max_timeout_ms {
            anyhow::bail!(
                "default_timeout_ms ({}) must be in 1..={}",
                self.default_timeout_ms,
                self.max_timeout_ms
            );
        }
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be positive");
        }
        if self.limits.memory_bytes == 0
            || self.limits.max_stack_bytes == 0
            || self.limits.max_output_bytes == 0
        {
            anyhow::bail!("resource limits must be positive: {:?}", self.limits);
        }
        Ok(())
    }
}

/// Global runner configuration
static RUNNER_CONFIG: OnceLock<RunnerConfig> = OnceLock::new();

/// Initialize the global configuration
pub fn init_config(config: RunnerConfig) -> Result<()> {
    RUNNER_CONFIG
        .set(config)
        .map_err(|_| anyhow::anyhow!("Runner configuration already initialized"))?;

    Ok(())
}

/// Get runner configuration
pub fn get_config() -> &'static RunnerConfig {
    RUNNER_CONFIG.get().unwrap_or_else(|| {
        static DEFAULT: OnceLock<RunnerConfig> = OnceLock::new();

        DEFAULT.get_or_init(|| {
            warn!("Runner configuration not initialized, using default");
            RunnerConfig::default()
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_toml_overrides_defaults() {
        let config = RunnerConfig::from_toml_str(
            r#"
default_timeout_ms = 1000
memory_limit_mb = 16
max_concurrency = 2
"#,
        )
        .unwrap();

        assert_eq!(config.default_timeout_ms, 1000);
        assert_eq!(config.limits.memory_bytes, 16 * 1024 * 1024);
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.max_timeout_ms, RunnerConfig::default().max_timeout_ms);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(RunnerConfig::from_toml_str("worker_id = 3").is_err());
    }

    #[test]
    fn test_toml_rejects_default_above_max() {
        let err = RunnerConfig::from_toml_str("default_timeout_ms = 90000").unwrap_err();
        assert!(err.to_string().contains("default_timeout_ms"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "output_limit_kb = 4\ntrace_uncaptured = true").unwrap();

        let config = RunnerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.limits.max_output_bytes, 4096);
        assert!(config.trace_uncaptured);
    }

    #[test]
    fn test_env_lookup() {
        let vars: HashMap<&str, &str> = [
            ("RUNNER_MAX_TIMEOUT_MS", "120000"),
            ("RUNNER_STACK_LIMIT_KB", "256"),
        ]
        .into_iter()
        .collect();

        let mut config = RunnerConfig::default();
        RawRunnerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap()
            .apply(&mut config)
            .unwrap();

        assert_eq!(config.max_timeout_ms, 120_000);
        assert_eq!(config.limits.max_stack_bytes, 256 * 1024);
    }

    #[test]
    fn test_env_lookup_bad_number() {
        let err = RawRunnerConfig::from_lookup(|key| {
            (key == "RUNNER_MAX_CONCURRENCY").then(|| "many".to_string())
        })
        .unwrap_err();

        assert!(err.to_string().contains("RUNNER_MAX_CONCURRENCY"));
    }

    #[test]
    fn test_oversized_limit_rejected() {
        let err = RunnerConfig::from_toml_str(&format!("memory_limit_mb = {}", i64::MAX))
            .unwrap_err();
        assert!(err.to_string().contains("memory_limit_mb"));

        let err = RawRunnerConfig::from_lookup(|key| {
            (key == "RUNNER_OUTPUT_LIMIT_KB").then(|| usize::MAX.to_string())
        })
        .unwrap()
        .apply(&mut RunnerConfig::default())
        .unwrap_err();
        assert!(err.to_string().contains("output_limit_kb"));
    }

    #[test]
    fn test_sandbox_program_override() {
        let config = RunnerConfig::from_toml_str(r#"sandbox_program = "/opt/runner/bin""#).unwrap();
        assert_eq!(config.sandbox_program, Some(PathBuf::from("/opt/runner/bin")));
    }
}
