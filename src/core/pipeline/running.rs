use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_stream::StreamExt;

use crate::{
    constants::{DEFAULT_MAX_ARTIFACT_BYTES, DISPLAY_TRUNCATE_BYTES},
    core::{
        domain::{
            CaseResult, Executable, ExecutionLimits, StageResult, StageType, Status, truncate_text,
        },
        errors::{ConfigError, StageError},
        manifest::Case,
        pipeline::{
            StageOutput,
            artifacts::{self, ArtifactPattern},
            context::{ContextDelta, PipelineContext},
            first_failure, parse_config,
        },
        traits::sandbox::{KillReason, RunOutcome, RunRequest, SandboxRunner},
    },
};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteConfig {
    concurrency: Option<usize>,
    output_limit_bytes: Option<u64>,
    /// Exact paths or glob patterns, relative to the case directory.
    #[serde(default)]
    artifact_paths: Vec<String>,
    max_artifact_bytes: Option<u64>,
}

#[derive(Debug)]
pub struct ExecuteStage {
    config: ExecuteConfig,
    artifact_patterns: Vec<ArtifactPattern>,
}

impl ExecuteStage {
    pub fn validate_config(config: &serde_json::Value) -> Result<Self, ConfigError> {
        let config: ExecuteConfig = parse_config(StageType::Execute, config)?;
        if config.concurrency == Some(0) {
            return Err(ConfigError::invalid(StageType::Execute, "concurrency must be positive"));
        }
        if config.output_limit_bytes == Some(0) {
            return Err(ConfigError::invalid(StageType::Execute, "outputLimitBytes must be positive"));
        }
        if config.max_artifact_bytes == Some(0) {
            return Err(ConfigError::invalid(StageType::Execute, "maxArtifactBytes must be positive"));
        }
        let artifact_patterns = config
            .artifact_paths
            .iter()
            .map(|path| ArtifactPattern::parse(path))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|msg| ConfigError::invalid(StageType::Execute, msg))?;
        Ok(Self {
            config,
            artifact_patterns,
        })
    }

    #[tracing::instrument(skip_all, fields(submission_id = %ctx.submission.id))]
    pub async fn execute(
        &self,
        ctx: &PipelineContext,
        sandbox: &Arc<dyn SandboxRunner>,
    ) -> Result<StageOutput, StageError> {
        let executable = ctx
            .executable
            .clone()
            .ok_or(StageError::MissingPrerequisite("no executable in context"))?;
        let cases = &ctx.manifest().cases;
        let concurrency = self.config.concurrency.unwrap_or(ctx.config.case_concurrency);
        tracing::info!(cases = cases.len(), concurrency, "executing test cases");

        let mut results: Vec<Option<CaseResult>> = vec![None; cases.len()];
        let mut truncated = Vec::new();
        let mut futures = self.create_case_futures(ctx, &executable, sandbox, concurrency);

        while let Some((case_idx, result)) = futures.next().await {
            let (case_result, truncated_paths) = result?;
            truncated.extend(
                truncated_paths
                    .into_iter()
                    .map(|path| format!("{}/{path}", case_result.name)),
            );
            tracing::debug!(
                case_no = case_result.case_no,
                status = %case_result.status,
                time_ms = case_result.time_ms,
                "case finished"
            );
            results[case_idx] = Some(case_result);
        }

        let cases: Vec<CaseResult> = results.into_iter().flatten().collect();
        let mut artifacts = BTreeMap::new();
        for case in &cases {
            for (path, content) in &case.artifacts {
                artifacts.insert(format!("{}/{path}", case.name), content.clone());
            }
        }

        let status = first_failure(&cases).unwrap_or(Status::Ac);
        let completed = cases.iter().filter(|c| c.status.is_accepted()).count();
        let result = StageResult::with_status(
            StageType::Execute,
            status,
            format!("{completed}/{} cases ran cleanly", cases.len()),
        )
        .details(if truncated.is_empty() {
            json!({ "cases": cases })
        } else {
            truncated.sort();
            json!({ "cases": cases, "truncatedArtifacts": truncated })
        })
        .resources(
            Some(cases.iter().map(|c| c.time_ms).sum()),
            cases.iter().map(|c| c.memory_kb).max(),
        );
        let delta = ContextDelta {
            cases: Some(cases),
            artifacts,
            ..Default::default()
        };
        Ok(StageOutput::with_delta(result, delta))
    }

    /// One future per manifest case, yielding the case index with its result.
    /// At most `concurrency` of them hold a sandbox slot at a time.
    fn create_case_futures<'a>(
        &'a self,
        ctx: &'a PipelineContext,
        executable: &'a Executable,
        sandbox: &'a Arc<dyn SandboxRunner>,
        concurrency: usize,
    ) -> FuturesUnordered<impl Future<Output = (usize, Result<(CaseResult, Vec<String>), StageError>)> + 'a>
    {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let futures = FuturesUnordered::new();

        for (case_idx, case) in ctx.manifest().cases.iter().enumerate() {
            let semaphore = semaphore.clone();
            futures.push(async move {
                let result = match semaphore.acquire().await {
                    Ok(_permit) => self.run_case(ctx, executable, sandbox, case_idx, case).await,
                    Err(e) => Err(StageError::Io(std::io::Error::other(e))),
                };
                (case_idx, result)
            });
        }

        futures
    }

    /// Runs one case and collects its artifacts. Also returns the artifact
    /// paths that were cut at the byte cap.
    async fn run_case(
        &self,
        ctx: &PipelineContext,
        executable: &Executable,
        sandbox: &Arc<dyn SandboxRunner>,
        case_idx: usize,
        case: &Case,
    ) -> Result<(CaseResult, Vec<String>), StageError> {
        let case_no = case_idx + 1;
        let input = tokio::fs::read(ctx.problem.asset(&case.input_file)).await?;
        let case_dir = ctx.workspace.case_dir(case_no);
        tokio::fs::create_dir_all(&case_dir).await?;

        let limits = ExecutionLimits {
            output_bytes: Some(
                self.config
                    .output_limit_bytes
                    .unwrap_or(ctx.config.output_limit_bytes),
            ),
            ..ctx.manifest().effective_limits(case)
        };
        let request = RunRequest::new(executable.command.clone(), &case_dir)
            .stdin(input)
            .limits(limits.clone());
        let outcome = sandbox.run(&request).await?;
        let (status, message) = classify(&outcome, &limits);

        let max_artifact_bytes = self
            .config
            .max_artifact_bytes
            .unwrap_or(DEFAULT_MAX_ARTIFACT_BYTES);
        let collected = artifacts::collect(&case_dir, &self.artifact_patterns, max_artifact_bytes).await;

        let case_result = CaseResult {
            case_no,
            name: case.name.clone(),
            status,
            time_ms: outcome.time_ms,
            memory_kb: outcome.memory_kb,
            stdout_trunc: Some(truncate_text(&outcome.stdout, DISPLAY_TRUNCATE_BYTES)),
            stderr_trunc: (!outcome.stderr.is_empty())
                .then(|| truncate_text(&outcome.stderr, DISPLAY_TRUNCATE_BYTES)),
            points: case.points,
            is_sample: case.is_sample,
            subtask: case.subtask_id(),
            message,
            stdout: outcome.stdout,
            artifacts: collected.files,
        };
        Ok((case_result, collected.truncated))
    }
}

/// Maps a finished run to a case status. AC here only means the program
/// ran cleanly; the output itself is judged later.
pub(crate) fn classify(outcome: &RunOutcome, limits: &ExecutionLimits) -> (Status, Option<String>) {
    match outcome.killed_reason {
        Some(KillReason::TimeLimit) => return (Status::Tle, Some("time limit exceeded".to_string())),
        Some(KillReason::MemoryLimit) => {
            return (Status::Mle, Some("memory limit exceeded".to_string()));
        }
        Some(KillReason::OutputLimit) => {
            return (Status::Ole, Some("output limit exceeded".to_string()));
        }
        Some(KillReason::Signal) | None => {}
    }

    if limits.time_ms.is_some_and(|limit| outcome.time_ms > limit) {
        return (Status::Tle, Some("time limit exceeded".to_string()));
    }
    if limits.memory_kb.is_some_and(|limit| outcome.memory_kb > limit) {
        return (Status::Mle, Some("memory limit exceeded".to_string()));
    }
    if limits
        .output_bytes
        .is_some_and(|limit| outcome.stdout.len() as u64 > limit)
    {
        return (Status::Ole, Some("output limit exceeded".to_string()));
    }
    if let Some(signal) = outcome.signal {
        return (Status::Re, Some(format!("terminated by signal {signal}")));
    }
    match outcome.exit_code {
        Some(0) => (Status::Ac, None),
        Some(code) => (Status::Re, Some(format!("exited with code {code}"))),
        None => (Status::Re, Some("terminated abnormally".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        domain::{Language, SourceBundle},
        errors::SandboxError,
        pipeline::testing::{context_for, create_assets, create_manifest, create_problem, create_submission},
        traits::sandbox::MockSandboxRunner,
    };

    fn create_context(points: &[u32], files: &[(&str, &str)]) -> PipelineContext {
        let manifest = create_manifest(points);
        let assets = create_assets(&manifest, files);
        let submission = create_submission(Language::C, SourceBundle::Single("int main(){}".into()));
        let ctx = context_for(submission, create_problem(manifest, assets));
        ctx.merge(
            ContextDelta {
                executable: Some(Executable {
                    command: vec!["/bin/solution".to_string()],
                }),
                ..Default::default()
            },
            StageResult::passed(StageType::Compile, "ok"),
        )
    }

    fn create_stage(config: serde_json::Value) -> ExecuteStage {
        ExecuteStage::validate_config(&config).unwrap()
    }

    /// Echoes stdin back, like `cat`.
    fn echo_sandbox() -> MockSandboxRunner {
        let mut sandbox = MockSandboxRunner::new();
        sandbox
            .expect_run()
            .returning(|request| Ok(RunOutcome::exited(0, String::from_utf8_lossy(&request.stdin), "")));
        sandbox
    }

    #[tokio::test]
    async fn test_runs_every_case_in_manifest_order() {
        let ctx = create_context(&[30, 30, 40], &[("1\n", "1\n"), ("2\n", "2\n"), ("3\n", "3\n")]);
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(echo_sandbox());

        let output = create_stage(json!({"concurrency": 2})).execute(&ctx, &sandbox).await.unwrap();

        assert_eq!(output.result.status, Status::Ac);
        assert!(!output.result.should_abort);
        let cases = output.delta.cases.unwrap();
        assert_eq!(cases.len(), 3);
        for (i, case) in cases.iter().enumerate() {
            assert_eq!(case.case_no, i + 1);
            assert_eq!(case.stdout, format!("{}\n", i + 1));
        }
        assert_eq!(cases[2].points, 40);
    }

    #[tokio::test]
    async fn test_case_failures_do_not_abort_siblings() {
        let ctx = create_context(&[50, 50], &[("ok\n", "ok\n"), ("crash\n", "")]);
        let mut sandbox = MockSandboxRunner::new();
        sandbox.expect_run().times(2).returning(|request| {
            if request.stdin.starts_with(b"crash") {
                Ok(RunOutcome {
                    signal: Some(11),
                    ..Default::default()
                })
            } else {
                Ok(RunOutcome::exited(0, "ok\n", ""))
            }
        });
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(sandbox);

        let output = create_stage(json!({})).execute(&ctx, &sandbox).await.unwrap();

        assert_eq!(output.result.status, Status::Re);
        assert!(!output.result.should_abort);
        let cases = output.delta.cases.unwrap();
        assert_eq!(cases[0].status, Status::Ac);
        assert_eq!(cases[1].status, Status::Re);
        assert!(cases[1].message.as_ref().unwrap().contains("signal 11"));
    }

    #[tokio::test]
    async fn test_resource_kills_map_to_statuses() {
        let ctx = create_context(&[10, 10, 10], &[("t", ""), ("m", ""), ("o", "")]);
        let mut sandbox = MockSandboxRunner::new();
        sandbox.expect_run().returning(|request| {
            let reason = match request.stdin.as_slice() {
                b"t" => KillReason::TimeLimit,
                b"m" => KillReason::MemoryLimit,
                _ => KillReason::OutputLimit,
            };
            Ok(RunOutcome::killed(reason))
        });
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(sandbox);

        let output = create_stage(json!({})).execute(&ctx, &sandbox).await.unwrap();

        let statuses: Vec<Status> = output.delta.cases.unwrap().iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![Status::Tle, Status::Mle, Status::Ole]);
        assert_eq!(output.result.status, Status::Tle);
    }

    #[tokio::test]
    async fn test_limits_come_from_manifest() {
        let mut manifest = create_manifest(&[100]);
        manifest.cases[0].time_limit_ms = Some(250);
        let assets = create_assets(&manifest, &[("x", "x")]);
        let submission = create_submission(Language::C, SourceBundle::Single("int main(){}".into()));
        let ctx = context_for(submission, create_problem(manifest, assets)).merge(
            ContextDelta {
                executable: Some(Executable {
                    command: vec!["/bin/solution".to_string()],
                }),
                ..Default::default()
            },
            StageResult::passed(StageType::Compile, "ok"),
        );
        let mut sandbox = MockSandboxRunner::new();
        sandbox
            .expect_run()
            .withf(|request| {
                request.limits.time_ms == Some(250)
                    && request.limits.memory_kb == Some(65536)
                    && request.limits.output_bytes == Some(4096)
                    && request.cwd.ends_with("run/case_1")
            })
            .times(1)
            .returning(|_| Ok(RunOutcome::exited(0, "x", "")));
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(sandbox);

        let output = create_stage(json!({"outputLimitBytes": 4096}))
            .execute(&ctx, &sandbox)
            .await
            .unwrap();

        assert_eq!(output.result.status, Status::Ac);
    }

    #[tokio::test]
    async fn test_collects_artifacts_from_case_dir() {
        let ctx = create_context(&[100], &[("in", "out")]);
        let mut sandbox = MockSandboxRunner::new();
        sandbox.expect_run().returning(|request| {
            std::fs::write(request.cwd.join("result.txt"), b"42").unwrap();
            Ok(RunOutcome::exited(0, "", ""))
        });
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(sandbox);

        let output = create_stage(json!({"artifactPaths": ["result.txt", "missing.txt"]}))
            .execute(&ctx, &sandbox)
            .await
            .unwrap();

        let case = &output.delta.cases.as_ref().unwrap()[0];
        assert_eq!(case.artifacts.get("result.txt").unwrap(), b"42");
        assert!(!case.artifacts.contains_key("missing.txt"));
        assert!(output.delta.artifacts.contains_key("Case 1/result.txt"));
    }

    #[tokio::test]
    async fn test_artifact_globs_and_byte_cap() {
        let ctx = create_context(&[100], &[("in", "out")]);
        let mut sandbox = MockSandboxRunner::new();
        sandbox.expect_run().returning(|request| {
            let plots = request.cwd.join("plots");
            std::fs::create_dir_all(&plots).unwrap();
            std::fs::write(plots.join("a.svg"), b"<svg/>").unwrap();
            std::fs::write(plots.join("b.svg"), vec![b'x'; 64]).unwrap();
            std::fs::write(request.cwd.join("trace.log"), b"ignored").unwrap();
            Ok(RunOutcome::exited(0, "", ""))
        });
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(sandbox);

        let output = create_stage(json!({"artifactPaths": ["plots/*.svg"], "maxArtifactBytes": 16}))
            .execute(&ctx, &sandbox)
            .await
            .unwrap();

        let case = &output.delta.cases.as_ref().unwrap()[0];
        assert_eq!(case.artifacts.len(), 2);
        assert_eq!(case.artifacts.get("plots/a.svg").unwrap(), b"<svg/>");
        assert_eq!(case.artifacts.get("plots/b.svg").unwrap().len(), 16);
        assert_eq!(
            output.result.details["truncatedArtifacts"],
            json!(["Case 1/plots/b.svg"])
        );
    }

    #[tokio::test]
    async fn test_binary_input_reaches_the_program_unchanged() {
        let ctx = create_context(&[100], &[("placeholder", "")]);
        let input_file = ctx.problem.asset(&ctx.manifest().cases[0].input_file);
        std::fs::write(input_file, [0xff, 0xfe, 0x00, b'\n']).unwrap();
        let mut sandbox = MockSandboxRunner::new();
        sandbox
            .expect_run()
            .withf(|request| request.stdin == [0xff, 0xfe, 0x00, b'\n'])
            .times(1)
            .returning(|_| Ok(RunOutcome::exited(0, "ok\n", "")));
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(sandbox);

        let output = create_stage(json!({})).execute(&ctx, &sandbox).await.unwrap();

        assert_eq!(output.result.status, Status::Ac);
        assert_eq!(output.delta.cases.unwrap()[0].stdout, "ok\n");
    }

    #[tokio::test]
    async fn test_sandbox_failure_is_an_error() {
        let ctx = create_context(&[100], &[("in", "out")]);
        let mut sandbox = MockSandboxRunner::new();
        sandbox.expect_run().returning(|_| {
            Err(SandboxError::Launch {
                program: "/bin/solution".to_string(),
                msg: "no such file".to_string(),
            })
        });
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(sandbox);

        let result = create_stage(json!({})).execute(&ctx, &sandbox).await;

        assert!(matches!(result, Err(StageError::Sandbox(SandboxError::Launch { .. }))));
    }

    #[tokio::test]
    async fn test_missing_executable_is_an_error() {
        let manifest = create_manifest(&[100]);
        let assets = create_assets(&manifest, &[("in", "out")]);
        let submission = create_submission(Language::C, SourceBundle::Single("int main(){}".into()));
        let ctx = context_for(submission, create_problem(manifest, assets));
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(MockSandboxRunner::new());

        let result = create_stage(json!({})).execute(&ctx, &sandbox).await;

        assert!(matches!(result, Err(StageError::MissingPrerequisite(_))));
    }

    #[test]
    fn test_classify_nonzero_exit_and_measured_overrun() {
        let limits = ExecutionLimits {
            time_ms: Some(100),
            memory_kb: Some(1024),
            output_bytes: Some(4),
        };
        assert_eq!(classify(&RunOutcome::exited(3, "", ""), &limits).0, Status::Re);
        assert_eq!(classify(&RunOutcome::exited(0, "12345", ""), &limits).0, Status::Ole);
        let slow = RunOutcome {
            time_ms: 150,
            ..RunOutcome::exited(0, "", "")
        };
        assert_eq!(classify(&slow, &limits).0, Status::Tle);
        assert_eq!(classify(&RunOutcome::exited(0, "ok", ""), &limits), (Status::Ac, None));
    }

    #[test]
    fn test_config_validation() {
        assert!(ExecuteStage::validate_config(&json!({"concurrency": 0})).is_err());
        assert!(ExecuteStage::validate_config(&json!({"artifactPaths": ["/etc/passwd"]})).is_err());
        assert!(ExecuteStage::validate_config(&json!({"artifactPaths": ["out/result.txt"]})).is_ok());
        assert!(ExecuteStage::validate_config(&json!({"artifactPaths": ["out/**/*.csv"]})).is_ok());
        assert!(ExecuteStage::validate_config(&json!({"artifactPaths": ["../*"]})).is_err());
        assert!(ExecuteStage::validate_config(&json!({"maxArtifactBytes": 0})).is_err());
    }
}
