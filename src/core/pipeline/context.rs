use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::JudgeConfig;
use crate::constants::PIPELINE_FILE;
use crate::core::{
    domain::{CaseResult, Executable, StageResult, StageType, Submission, Violation},
    errors::ConfigError,
    manifest::Manifest,
};

/// Ordered stage list attached to a problem. Order is never changed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub stages: Vec<StageSpec>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    #[serde(rename = "type")]
    pub stage_type: StageType,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl StageSpec {
    pub fn new(stage_type: StageType, config: serde_json::Value) -> Self {
        Self {
            stage_type,
            config,
            enabled: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub async fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(PIPELINE_FILE);
        let json = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ConfigError::Pipeline {
                msg: format!("cannot read {}: {e}", path.display()),
            })?;
        Self::from_json(&json).map_err(|e| ConfigError::Pipeline {
            msg: format!("malformed {}: {e}", path.display()),
        })
    }
}

/// Everything the judge knows about the problem being judged.
#[derive(Clone, Debug)]
pub struct Problem {
    pub id: String,
    pub total_points: Option<u32>,
    pub manifest: Manifest,
    pub pipeline: PipelineConfig,
    /// Directory holding case files, templates, checkers and interactors.
    pub assets_dir: PathBuf,
}

impl Problem {
    pub fn asset(&self, relative: &str) -> PathBuf {
        self.assets_dir.join(relative)
    }
}

/// Layout of a submission's job directory.
#[derive(Clone, Debug, PartialEq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            root: std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn src_dir(&self) -> PathBuf {
        self.root.join("src")
    }

    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    pub fn case_dir(&self, case_no: usize) -> PathBuf {
        self.root.join("run").join(format!("case_{case_no}"))
    }

    pub fn checker_dir(&self, case_no: usize) -> PathBuf {
        self.root.join("check").join(format!("case_{case_no}"))
    }
}

/// Accumulated judging state handed to each stage. Stages never mutate it;
/// they return a [`ContextDelta`] that the orchestrator merges.
#[derive(Clone, Debug)]
pub struct PipelineContext {
    pub submission: Arc<Submission>,
    pub problem: Arc<Problem>,
    pub config: Arc<JudgeConfig>,
    pub workspace: Workspace,
    pub executable: Option<Executable>,
    pub cases: Option<Vec<CaseResult>>,
    pub violations: Vec<Violation>,
    pub artifacts: BTreeMap<String, Vec<u8>>,
    pub score: Option<f64>,
    pub stage_results: Vec<StageResult>,
}

#[derive(Clone, Debug, Default)]
pub struct ContextDelta {
    pub executable: Option<Executable>,
    pub cases: Option<Vec<CaseResult>>,
    pub violations: Option<Vec<Violation>>,
    pub artifacts: BTreeMap<String, Vec<u8>>,
    pub score: Option<f64>,
}

impl PipelineContext {
    pub fn new(submission: Arc<Submission>, problem: Arc<Problem>, config: Arc<JudgeConfig>) -> Self {
        let workspace = Workspace::new(&submission.job_dir);
        Self {
            submission,
            problem,
            config,
            workspace,
            executable: None,
            cases: None,
            violations: Vec::new(),
            artifacts: BTreeMap::new(),
            score: None,
            stage_results: Vec::new(),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.problem.manifest
    }

    /// New context with the stage's delta and result folded in.
    pub fn merge(&self, delta: ContextDelta, result: StageResult) -> Self {
        let mut artifacts = self.artifacts.clone();
        artifacts.extend(delta.artifacts);
        let mut stage_results = self.stage_results.clone();
        stage_results.push(result);

        Self {
            executable: delta.executable.or_else(|| self.executable.clone()),
            cases: delta.cases.or_else(|| self.cases.clone()),
            violations: delta.violations.unwrap_or_else(|| self.violations.clone()),
            score: delta.score.or(self.score),
            artifacts,
            stage_results,
            ..self.clone()
        }
    }
}
