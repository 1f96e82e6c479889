use std::path::PathBuf;
use std::str::FromStr;

use crate::constants::{
    DEFAULT_CASE_CONCURRENCY, DEFAULT_COMPILE_MEMORY_KB, DEFAULT_COMPILE_TIMEOUT_MS,
    DEFAULT_OUTPUT_LIMIT_BYTES, DEFAULT_STDERR_CAP_BYTES,
};
use crate::core::errors::ConfigError;

/// Process-wide judge settings. Stage configs override the per-stage
/// defaults found here.
#[derive(Clone, Debug, PartialEq)]
pub struct JudgeConfig {
    pub work_dir: PathBuf,
    pub case_concurrency: usize,
    pub compile_timeout_ms: u64,
    pub compile_memory_kb: u64,
    pub output_limit_bytes: u64,
    pub stderr_cap_bytes: usize,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("judge"),
            case_concurrency: DEFAULT_CASE_CONCURRENCY,
            compile_timeout_ms: DEFAULT_COMPILE_TIMEOUT_MS,
            compile_memory_kb: DEFAULT_COMPILE_MEMORY_KB,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            stderr_cap_bytes: DEFAULT_STDERR_CAP_BYTES,
        }
    }
}

impl JudgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from a key lookup, keeping defaults for absent keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            work_dir: lookup("JUDGE_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            case_concurrency: parse_var(&lookup, "JUDGE_CASE_CONCURRENCY")?
                .unwrap_or(defaults.case_concurrency),
            compile_timeout_ms: parse_var(&lookup, "JUDGE_COMPILE_TIMEOUT_MS")?
                .unwrap_or(defaults.compile_timeout_ms),
            compile_memory_kb: parse_var(&lookup, "JUDGE_COMPILE_MEMORY_KB")?
                .unwrap_or(defaults.compile_memory_kb),
            output_limit_bytes: parse_var(&lookup, "JUDGE_OUTPUT_LIMIT_BYTES")?
                .unwrap_or(defaults.output_limit_bytes),
            stderr_cap_bytes: parse_var(&lookup, "JUDGE_STDERR_CAP_BYTES")?
                .unwrap_or(defaults.stderr_cap_bytes),
        };

        if config.case_concurrency == 0 {
            return Err(ConfigError::Env {
                var: "JUDGE_CASE_CONCURRENCY",
                value: "0".to_string(),
            });
        }
        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
    }
}
