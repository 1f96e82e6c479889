use std::fmt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::{
    domain::{ExecutionLimits, Language},
    errors::SandboxError,
};

#[derive(Clone, Debug, PartialEq)]
pub struct RunRequest {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub stdin: Vec<u8>,
    pub limits: ExecutionLimits,
}

impl RunRequest {
    pub fn new<P: Into<PathBuf>>(command: Vec<String>, cwd: P) -> Self {
        Self {
            command,
            cwd: cwd.into(),
            stdin: Vec::new(),
            limits: ExecutionLimits::default(),
        }
    }

    pub fn stdin(self, stdin: impl Into<Vec<u8>>) -> Self {
        Self {
            stdin: stdin.into(),
            ..self
        }
    }

    pub fn limits(self, limits: ExecutionLimits) -> Self {
        Self { limits, ..self }
    }

    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KillReason {
    TimeLimit,
    MemoryLimit,
    OutputLimit,
    Signal,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub time_ms: u64,
    pub memory_kb: u64,
    pub killed_reason: Option<KillReason>,
}

impl RunOutcome {
    pub fn exited(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn killed(reason: KillReason) -> Self {
        Self {
            killed_reason: Some(reason),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none() && self.killed_reason.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LintOutput {
    pub output: String,
}

/// A running process with its standard streams handed to the caller.
pub struct SpawnedProcess {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub handle: Box<dyn ProcessHandle>,
}

impl fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedProcess").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
pub trait ProcessHandle: Send {
    /// Resolves once the process has exited. `stdout` of the outcome is
    /// empty since the stream belongs to the caller.
    async fn wait(&mut self) -> Result<RunOutcome, SandboxError>;

    async fn kill(&mut self) -> Result<(), SandboxError>;
}

/// Isolated process execution. Implementations must kill whatever exceeds
/// the request limits, so callers never wait on a hung child.
#[mockall::automock]
#[async_trait::async_trait]
pub trait SandboxRunner: std::fmt::Debug + Send + Sync {
    async fn run(&self, request: &RunRequest) -> Result<RunOutcome, SandboxError>;

    async fn lint(&self, job_dir: &Path, language: &Language) -> Result<LintOutput, SandboxError>;

    async fn spawn(&self, request: &RunRequest) -> Result<SpawnedProcess, SandboxError>;
}
