use std::sync::Arc;

use serde::{Deserialize, de::DeserializeOwned};

use crate::core::{
    domain::{CaseResult, StageResult, StageType, Status},
    errors::{ConfigError, StageError},
    traits::sandbox::SandboxRunner,
};

mod artifacts;
pub mod checking;
pub mod compiling;
pub mod context;
pub mod custom;
pub mod interactive;
pub mod orchestrator;
pub mod running;
pub mod scoring;
pub mod static_analysis;

#[cfg(test)]
pub(crate) mod testing;

use checking::CheckStage;
use compiling::CompileStage;
use context::{ContextDelta, PipelineContext, Problem, StageSpec};
use custom::{CustomStageCall, StageRegistry};
use interactive::InteractiveStage;
use running::ExecuteStage;
use scoring::ScoringStage;
use static_analysis::StaticAnalysisStage;

/// What a stage hands back: its own result plus the context changes it
/// wants the orchestrator to apply.
#[derive(Clone, Debug)]
pub struct StageOutput {
    pub result: StageResult,
    pub delta: ContextDelta,
}

impl StageOutput {
    pub fn with_delta(result: StageResult, delta: ContextDelta) -> Self {
        Self { result, delta }
    }
}

impl From<StageResult> for StageOutput {
    fn from(result: StageResult) -> Self {
        Self {
            result,
            delta: ContextDelta::default(),
        }
    }
}

/// A validated stage, ready to run.
#[derive(Debug)]
pub enum Stage {
    StaticAnalysis(StaticAnalysisStage),
    Compile(CompileStage),
    Execute(ExecuteStage),
    Interactive(InteractiveStage),
    Check(CheckStage),
    Scoring(ScoringStage),
    Custom(CustomStageCall),
}

impl Stage {
    /// Validates the stage config and builds the matching stage.
    pub fn from_spec(spec: &StageSpec, registry: &StageRegistry) -> Result<Self, ConfigError> {
        let config = &spec.config;
        Ok(match spec.stage_type {
            StageType::StaticAnalysis => {
                Stage::StaticAnalysis(StaticAnalysisStage::validate_config(config)?)
            }
            StageType::Compile => Stage::Compile(CompileStage::validate_config(config)?),
            StageType::Execute => Stage::Execute(ExecuteStage::validate_config(config)?),
            StageType::Interactive => {
                Stage::Interactive(InteractiveStage::validate_config(config)?)
            }
            StageType::Check => Stage::Check(CheckStage::validate_config(config)?),
            StageType::Scoring => Stage::Scoring(ScoringStage::validate_config(config)?),
            StageType::Custom => Stage::Custom(registry.resolve(config)?),
        })
    }

    pub fn stage_type(&self) -> StageType {
        match self {
            Stage::StaticAnalysis(_) => StageType::StaticAnalysis,
            Stage::Compile(_) => StageType::Compile,
            Stage::Execute(_) => StageType::Execute,
            Stage::Interactive(_) => StageType::Interactive,
            Stage::Check(_) => StageType::Check,
            Stage::Scoring(_) => StageType::Scoring,
            Stage::Custom(_) => StageType::Custom,
        }
    }

    pub async fn execute(
        &self,
        ctx: &PipelineContext,
        sandbox: &Arc<dyn SandboxRunner>,
    ) -> Result<StageOutput, StageError> {
        match self {
            Stage::StaticAnalysis(stage) => stage.execute(ctx, sandbox).await,
            Stage::Compile(stage) => stage.execute(ctx, sandbox).await,
            Stage::Execute(stage) => stage.execute(ctx, sandbox).await,
            Stage::Interactive(stage) => stage.execute(ctx, sandbox).await,
            Stage::Check(stage) => stage.execute(ctx, sandbox).await,
            Stage::Scoring(stage) => stage.execute(ctx).await,
            Stage::Custom(stage) => stage.execute(ctx).await,
        }
    }
}

/// Parses a stage's JSON config into its typed form. A missing config is
/// read as an empty object.
pub(crate) fn parse_config<T: DeserializeOwned>(
    stage: StageType,
    config: &serde_json::Value,
) -> Result<T, ConfigError> {
    let value = if config.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        config.clone()
    };
    serde_json::from_value(value).map_err(|e| ConfigError::invalid(stage, e.to_string()))
}

/// AC when every case passed, PA when some points were earned, otherwise
/// the first failing case's status.
pub(crate) fn overall_status(cases: &[CaseResult], score: f64) -> Status {
    match first_failure(cases) {
        None => Status::Ac,
        Some(_) if score > 0.0 => Status::Pa,
        Some(status) => status,
    }
}

/// Status of the first case (manifest order) that is not AC.
pub(crate) fn first_failure(cases: &[CaseResult]) -> Option<Status> {
    cases
        .iter()
        .map(|case| case.status)
        .find(|status| !status.is_accepted())
}

/// An instructor-supplied program (checker, interactor) and its arguments.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub(crate) struct ProgramSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProgramSpec {
    /// Command line with the program and any argument naming a problem
    /// asset resolved into the assets directory. Anything else is passed
    /// through, so `python3` still comes from `PATH`.
    pub fn command(&self, problem: &Problem) -> Vec<String> {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| {
                let asset = problem.asset(part);
                if !std::path::Path::new(part).is_absolute() && asset.is_file() {
                    asset.to_string_lossy().into_owned()
                } else {
                    part.clone()
                }
            })
            .collect()
    }
}
