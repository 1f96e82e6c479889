use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;

use crate::config::JudgeConfig;
use crate::core::{
    domain::{ExecutionSummary, FinalVerdict, StageResult, Status, Submission},
    errors::StageError,
    pipeline::{
        Stage, StageOutput,
        context::{PipelineContext, Problem},
        custom::StageRegistry,
    },
    traits::sandbox::SandboxRunner,
};

/// Runs a problem's stage list against one submission.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    sandbox: Arc<dyn SandboxRunner>,
    registry: Arc<StageRegistry>,
    config: Arc<JudgeConfig>,
}

impl Orchestrator {
    pub fn new(sandbox: Arc<dyn SandboxRunner>) -> Self {
        Self {
            sandbox,
            registry: Arc::new(StageRegistry::new()),
            config: Arc::new(JudgeConfig::default()),
        }
    }

    pub fn with_registry(self, registry: Arc<StageRegistry>) -> Self {
        Self { registry, ..self }
    }

    pub fn with_config(self, config: JudgeConfig) -> Self {
        Self {
            config: Arc::new(config),
            ..self
        }
    }

    /// Judges `submission` with the problem's enabled stages, strictly in
    /// order. Stops at the first result asking to abort. The submission
    /// itself is left untouched; use [`Submission::with_verdict`] to record
    /// the outcome.
    #[tracing::instrument(skip_all, fields(submission_id = %submission.id, problem_id = %problem.id))]
    pub async fn run(&self, submission: &Submission, problem: &Problem) -> FinalVerdict {
        let specs: Vec<_> = problem.pipeline.stages.iter().filter(|s| s.enabled).collect();
        let mut ctx = PipelineContext::new(
            Arc::new(submission.clone()),
            Arc::new(problem.clone()),
            self.config.clone(),
        );
        let mut aborted = false;

        if specs.is_empty() {
            tracing::warn!("pipeline has no enabled stages");
        }

        for spec in &specs {
            let stage = match Stage::from_spec(spec, &self.registry) {
                Ok(stage) => stage,
                Err(e) => {
                    tracing::error!(stage = %spec.stage_type, error = %e, "stage config rejected");
                    let result =
                        StageResult::judge_error(spec.stage_type, "invalid stage configuration");
                    ctx = ctx.merge(Default::default(), result);
                    aborted = true;
                    break;
                }
            };

            let stage_type = stage.stage_type();
            tracing::info!(stage = %stage_type, "stage started");
            let started = Instant::now();
            let outcome = AssertUnwindSafe(stage.execute(&ctx, &self.sandbox))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(StageError::Panicked(panic_message(panic))));
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let StageOutput { result, delta } = match outcome {
                Ok(output) => output,
                Err(e) => {
                    tracing::error!(stage = %stage_type, error = %e, "stage failed");
                    StageResult::judge_error(stage_type, "internal judge error").into()
                }
            };
            let result = StageResult {
                time_ms: result.time_ms.or(Some(elapsed_ms)),
                ..result
            };
            tracing::info!(
                stage = %stage_type,
                status = %result.status,
                elapsed_ms,
                "stage finished"
            );

            let should_abort = result.should_abort;
            ctx = ctx.merge(delta, result);
            if should_abort {
                tracing::info!(stage = %stage_type, "pipeline aborted");
                aborted = true;
                break;
            }
        }

        let status = final_status(&ctx.stage_results, aborted);
        tracing::info!(%status, score = ?ctx.score, "judging finished");

        FinalVerdict {
            status,
            score: ctx.score,
            summary: ExecutionSummary {
                total_stages: specs.len(),
                completed_stages: ctx.stage_results.len(),
                aborted,
            },
            cases: ctx.cases.unwrap_or_default(),
            stage_results: ctx.stage_results,
        }
    }
}

/// The aborting stage decides an aborted run. Otherwise the last stage
/// that sets a terminal status does, falling back to the last stage.
fn final_status(results: &[StageResult], aborted: bool) -> Status {
    let decisive = if aborted {
        results.last()
    } else {
        results
            .iter()
            .rev()
            .find(|r| r.stage_type.sets_terminal_status())
            .or(results.last())
    };
    decisive.map_or(Status::JudgeError, |r| r.status)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
