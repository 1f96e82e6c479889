use std::path::Path;
use std::sync::Arc;

use itertools::{EitherOrBoth, Itertools};
use serde::Deserialize;
use serde_json::json;

use crate::{
    constants::{CHECKER_MEMORY_KB, DEFAULT_CHECKER_TIMEOUT_MS, DISPLAY_TRUNCATE_BYTES},
    core::{
        domain::{CaseResult, ExecutionLimits, StageResult, StageType, Status, truncate_text},
        errors::{ConfigError, StageError},
        manifest::{Case, is_safe_relative_path},
        pipeline::{
            ProgramSpec, StageOutput,
            context::{ContextDelta, PipelineContext},
            overall_status, parse_config,
        },
        traits::sandbox::{RunRequest, SandboxRunner},
    },
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckMode {
    #[default]
    #[serde(alias = "diff")]
    TextDiff,
    CustomChecker,
    ArtifactCheck,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactSpec {
    path: String,
    /// Asset holding the expected content; `{case}` is the case number.
    expected_file: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckConfig {
    #[serde(default)]
    mode: CheckMode,
    #[serde(default = "enabled")]
    ignore_whitespace: bool,
    #[serde(default = "enabled")]
    case_sensitive: bool,
    checker: Option<ProgramSpec>,
    #[serde(default = "default_checker_timeout")]
    checker_timeout_ms: u64,
    #[serde(default)]
    artifacts: Vec<ArtifactSpec>,
    #[serde(default)]
    include_stdout: bool,
}

fn enabled() -> bool {
    true
}

fn default_checker_timeout() -> u64 {
    DEFAULT_CHECKER_TIMEOUT_MS
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextOptions {
    pub ignore_whitespace: bool,
    pub case_sensitive: bool,
}

impl Default for TextOptions {
    fn default() -> Self {
        Self {
            ignore_whitespace: true,
            case_sensitive: true,
        }
    }
}

#[derive(Debug)]
pub struct CheckStage {
    config: CheckConfig,
}

impl CheckStage {
    pub fn validate_config(config: &serde_json::Value) -> Result<Self, ConfigError> {
        let config: CheckConfig = parse_config(StageType::Check, config)?;
        match config.mode {
            CheckMode::CustomChecker => match &config.checker {
                Some(checker) if !checker.program.trim().is_empty() => {}
                _ => {
                    return Err(ConfigError::invalid(
                        StageType::Check,
                        "custom-checker mode requires checker.program",
                    ));
                }
            },
            CheckMode::ArtifactCheck if config.artifacts.is_empty() => {
                return Err(ConfigError::invalid(
                    StageType::Check,
                    "artifact-check mode requires at least one artifact",
                ));
            }
            _ => {}
        }
        if config.checker_timeout_ms == 0 {
            return Err(ConfigError::invalid(StageType::Check, "checkerTimeoutMs must be positive"));
        }
        for artifact in &config.artifacts {
            let mut paths = std::iter::once(&artifact.path).chain(artifact.expected_file.iter());
            if let Some(path) = paths.find(|p| !is_safe_relative_path(p)) {
                return Err(ConfigError::invalid(
                    StageType::Check,
                    format!("`{path}` is not a safe relative path"),
                ));
            }
        }
        Ok(Self { config })
    }

    fn text_options(&self) -> TextOptions {
        TextOptions {
            ignore_whitespace: self.config.ignore_whitespace,
            case_sensitive: self.config.case_sensitive,
        }
    }

    #[tracing::instrument(skip_all, fields(submission_id = %ctx.submission.id, mode = ?self.config.mode))]
    pub async fn execute(
        &self,
        ctx: &PipelineContext,
        sandbox: &Arc<dyn SandboxRunner>,
    ) -> Result<StageOutput, StageError> {
        let cases = match &ctx.cases {
            Some(cases) if !cases.is_empty() => cases,
            _ => {
                return Ok(StageResult::judge_error(StageType::Check, "no case results to check").into());
            }
        };

        let mut checked = Vec::with_capacity(cases.len());
        for case in cases {
            // Cases that already failed while running keep their verdict.
            let case = if case.status.is_accepted() {
                self.check_case(ctx, sandbox, case).await?
            } else {
                case.clone()
            };
            tracing::debug!(case_no = case.case_no, status = %case.status, "case checked");
            checked.push(case);
        }

        let passed = checked.iter().filter(|c| c.status.is_accepted()).count();
        let score: u32 = checked
            .iter()
            .filter(|c| c.status.is_accepted())
            .map(|c| c.points)
            .sum();
        let max_score: u32 = checked.iter().map(|c| c.points).sum();
        let details = json!({
            "passedCount": passed,
            "totalCount": checked.len(),
            "score": score,
            "maxScore": max_score,
            "cases": checked,
        });

        let result = if checked.iter().any(|c| c.status == Status::JudgeError) {
            StageResult::judge_error(StageType::Check, "checker failed")
        } else {
            StageResult::with_status(
                StageType::Check,
                overall_status(&checked, score as f64),
                format!("{passed}/{} cases passed", checked.len()),
            )
        };
        tracing::info!(status = %result.status, passed, score, "check finished");

        Ok(StageOutput::with_delta(
            result.details(details),
            ContextDelta {
                cases: Some(checked),
                score: Some(score as f64),
                ..Default::default()
            },
        ))
    }

    async fn check_case(
        &self,
        ctx: &PipelineContext,
        sandbox: &Arc<dyn SandboxRunner>,
        case: &CaseResult,
    ) -> Result<CaseResult, StageError> {
        let manifest_case = ctx
            .manifest()
            .cases
            .get(case.case_no.saturating_sub(1))
            .ok_or(StageError::MissingPrerequisite("case result without manifest case"))?;

        match self.config.mode {
            CheckMode::TextDiff => {
                let expected = read_lossy(&ctx.problem.asset(&manifest_case.output_file)).await?;
                Ok(diff_verdict(case, &case.stdout, &expected, self.text_options(), "output"))
            }
            CheckMode::CustomChecker => self.run_checker(ctx, sandbox, case, manifest_case).await,
            CheckMode::ArtifactCheck => {
                if self.config.include_stdout {
                    let expected = read_lossy(&ctx.problem.asset(&manifest_case.output_file)).await?;
                    let verdict = diff_verdict(case, &case.stdout, &expected, self.text_options(), "output");
                    if !verdict.status.is_accepted() {
                        return Ok(verdict);
                    }
                }
                self.check_artifacts(ctx, case).await
            }
        }
    }

    async fn check_artifacts(
        &self,
        ctx: &PipelineContext,
        case: &CaseResult,
    ) -> Result<CaseResult, StageError> {
        for artifact in &self.config.artifacts {
            let Some(content) = case.artifacts.get(&artifact.path) else {
                return Ok(case.change_status(
                    Status::Wa,
                    Some(format!("artifact `{}` was not produced", artifact.path)),
                ));
            };
            let Some(expected_file) = &artifact.expected_file else {
                continue;
            };
            let expected_file = expected_file.replace("{case}", &case.case_no.to_string());
            let expected = read_lossy(&ctx.problem.asset(&expected_file)).await?;
            let actual = String::from_utf8_lossy(content);
            let verdict = diff_verdict(case, &actual, &expected, self.text_options(), &artifact.path);
            if !verdict.status.is_accepted() {
                return Ok(verdict);
            }
        }
        Ok(case.change_status(Status::Ac, None))
    }

    async fn run_checker(
        &self,
        ctx: &PipelineContext,
        sandbox: &Arc<dyn SandboxRunner>,
        case: &CaseResult,
        manifest_case: &Case,
    ) -> Result<CaseResult, StageError> {
        let Some(checker) = &self.config.checker else {
            return Err(ConfigError::invalid(StageType::Check, "no checker configured").into());
        };
        let dir = ctx.workspace.checker_dir(case.case_no);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::copy(ctx.problem.asset(&manifest_case.input_file), dir.join("input.txt")).await?;
        tokio::fs::write(dir.join("output.txt"), &case.stdout).await?;
        tokio::fs::copy(ctx.problem.asset(&manifest_case.output_file), dir.join("answer.txt")).await?;

        let mut command = checker.command(&ctx.problem);
        command.extend(["input.txt", "output.txt", "answer.txt"].map(String::from));
        let request = RunRequest::new(command, &dir).limits(ExecutionLimits {
            time_ms: Some(self.config.checker_timeout_ms),
            memory_kb: Some(CHECKER_MEMORY_KB),
            output_bytes: None,
        });
        let outcome = sandbox.run(&request).await?;

        let explanation = [&outcome.stdout, &outcome.stderr]
            .into_iter()
            .map(|text| text.trim())
            .find(|text| !text.is_empty())
            .map(|text| truncate_text(text, DISPLAY_TRUNCATE_BYTES));

        if outcome.killed_reason.is_some() || outcome.signal.is_some() {
            tracing::error!(case_no = case.case_no, ?outcome.killed_reason, ?outcome.signal, "checker was killed");
            return Ok(case.change_status(
                Status::JudgeError,
                Some("checker terminated abnormally".to_string()),
            ));
        }
        Ok(match outcome.exit_code {
            Some(0) => case.change_status(Status::Ac, explanation),
            Some(1) => case.change_status(
                Status::Wa,
                explanation.or_else(|| Some("rejected by checker".to_string())),
            ),
            code => {
                tracing::error!(case_no = case.case_no, ?code, stderr = %outcome.stderr, "checker failed");
                case.change_status(
                    Status::JudgeError,
                    Some(format!("checker exited with unexpected code {code:?}")),
                )
            }
        })
    }
}

/// Expected files are compared as text; stray invalid bytes become U+FFFD
/// the same way program output does.
async fn read_lossy(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn diff_verdict(case: &CaseResult, actual: &str, expected: &str, options: TextOptions, what: &str) -> CaseResult {
    match first_difference(actual, expected, options) {
        None => case.change_status(Status::Ac, None),
        Some(line) => case.change_status(
            Status::Wa,
            Some(format!("{what} differs from expected at line {line}")),
        ),
    }
}

fn normalize(text: &str, options: TextOptions) -> String {
    let text = if options.ignore_whitespace {
        text.split('\n')
            .map(str::trim_end)
            .join("\n")
            .trim_end_matches('\n')
            .to_string()
    } else {
        text.to_string()
    };
    if options.case_sensitive {
        text
    } else {
        text.to_lowercase()
    }
}

/// 1-based line of the first mismatch, or `None` when the texts match.
pub fn first_difference(actual: &str, expected: &str, options: TextOptions) -> Option<usize> {
    let actual = normalize(actual, options);
    let expected = normalize(expected, options);
    if actual == expected {
        return None;
    }
    actual
        .split('\n')
        .zip_longest(expected.split('\n'))
        .position(|pair| !matches!(pair, EitherOrBoth::Both(a, e) if a == e))
        .map(|idx| idx + 1)
        .or(Some(1))
}

pub fn texts_match(actual: &str, expected: &str, options: TextOptions) -> bool {
    first_difference(actual, expected, options).is_none()
}
