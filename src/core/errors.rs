use thiserror::Error;

use crate::core::domain::StageType;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported manifest version `{version}`, expected 1.x")]
    Version { version: String },
    #[error("manifest declares no test cases")]
    NoCases,
    #[error("invalid {field}: {value}")]
    InvalidDefault { field: &'static str, value: u64 },
    #[error("case {index}: {msg}")]
    InvalidCase { index: usize, msg: String },
    #[error("case {index}: file `{file}` is referenced more than once")]
    DuplicateFile { index: usize, file: String },
    #[error("case points sum to {actual}, problem total is {expected}")]
    PointsMismatch { expected: u32, actual: u32 },
}

/// Bad or missing configuration. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {stage} config: {msg}")]
    Invalid { stage: StageType, msg: String },
    #[error("invalid pipeline config: {msg}")]
    Pipeline { msg: String },
    #[error("unknown custom stage `{name}`")]
    UnknownCustomStage { name: String },
    #[error("environment variable {var} has invalid value `{value}`")]
    Env { var: &'static str, value: String },
}

impl ConfigError {
    pub fn invalid(stage: StageType, msg: impl Into<String>) -> Self {
        ConfigError::Invalid {
            stage,
            msg: msg.into(),
        }
    }
}

/// Failure of the sandbox itself, as opposed to the program it runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SandboxError {
    #[error("failed to launch `{program}`: {msg}")]
    Launch { program: String, msg: String },
    #[error("sandbox io failure: {msg}")]
    Io { msg: String },
    #[error("lost communication with sandboxed process: {msg}")]
    Communication { msg: String },
}

/// Unexpected stage failure. The orchestrator turns every one of these into
/// a JUDGE_ERROR result.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("workspace io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(&'static str),
    #[error("stage panicked: {0}")]
    Panicked(String),
}
