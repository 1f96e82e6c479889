//! Two-process judging: the submission talks to an instructor interactor
//! over its standard streams, one line at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::stream::FuturesUnordered;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Semaphore, oneshot};
use tokio_stream::StreamExt;

use crate::{
    constants::{
        CHECKER_MEMORY_KB, DEFAULT_INTERACTION_TIMEOUT_MS, DEFAULT_MAX_EXCHANGES,
        DISPLAY_TRUNCATE_BYTES, INTERACTION_GRACE_MS, UNCAPPED_OUTPUT_BYTES,
    },
    core::{
        domain::{
            CaseResult, Executable, ExecutionLimits, StageResult, StageType, Status, truncate_text,
        },
        errors::{ConfigError, StageError},
        manifest::Case,
        pipeline::{
            ProgramSpec, StageOutput,
            context::{ContextDelta, PipelineContext},
            first_failure, parse_config,
        },
        traits::sandbox::{KillReason, RunOutcome, RunRequest, SandboxRunner},
    },
};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InteractiveConfig {
    interactor: ProgramSpec,
    #[serde(default = "default_max_exchanges")]
    max_exchanges: u32,
    #[serde(default = "default_interaction_timeout")]
    interaction_timeout_ms: u64,
    /// Bytes the submission may send the interactor over one interaction.
    output_limit_bytes: Option<u64>,
    concurrency: Option<usize>,
}

fn default_max_exchanges() -> u32 {
    DEFAULT_MAX_EXCHANGES
}

fn default_interaction_timeout() -> u64 {
    DEFAULT_INTERACTION_TIMEOUT_MS
}

#[derive(Debug)]
pub struct InteractiveStage {
    config: InteractiveConfig,
}

/// How the conversation stopped, before any verdict is derived.
enum Ending {
    Interactor(RunOutcome),
    ExchangeLimit,
    OutputLimit,
    Timeout,
}

impl InteractiveStage {
    pub fn validate_config(config: &serde_json::Value) -> Result<Self, ConfigError> {
        let config: InteractiveConfig = parse_config(StageType::Interactive, config)?;
        if config.interactor.program.trim().is_empty() {
            return Err(ConfigError::invalid(
                StageType::Interactive,
                "interactor.program must not be empty",
            ));
        }
        if config.max_exchanges == 0 || config.interaction_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                StageType::Interactive,
                "maxExchanges and interactionTimeoutMs must be positive",
            ));
        }
        if config.concurrency == Some(0) {
            return Err(ConfigError::invalid(StageType::Interactive, "concurrency must be positive"));
        }
        if config.output_limit_bytes == Some(0) {
            return Err(ConfigError::invalid(
                StageType::Interactive,
                "outputLimitBytes must be positive",
            ));
        }
        Ok(Self { config })
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
        let concurrency = self.config.concurrency.unwrap_or(ctx.config.case_concurrency);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        tracing::info!(cases = ctx.manifest().cases.len(), "running interactive cases");

        let mut futures = FuturesUnordered::new();
        for (case_idx, case) in ctx.manifest().cases.iter().enumerate() {
            let semaphore = semaphore.clone();
            let executable = &executable;
            futures.push(async move {
                let result = match semaphore.acquire().await {
                    Ok(_permit) => self.interact(ctx, executable, sandbox, case_idx + 1, case).await,
                    Err(e) => Err(StageError::Io(std::io::Error::other(e))),
                };
                (case_idx, result)
            });
        }

        let mut results: Vec<Option<CaseResult>> = vec![None; ctx.manifest().cases.len()];
        while let Some((case_idx, result)) = futures.next().await {
            results[case_idx] = Some(result?);
        }
        let cases: Vec<CaseResult> = results.into_iter().flatten().collect();

        let result = if cases.iter().any(|c| c.status == Status::JudgeError) {
            StageResult::judge_error(StageType::Interactive, "interactor failed")
        } else {
            let status = first_failure(&cases).unwrap_or(Status::Ac);
            let accepted = cases.iter().filter(|c| c.status.is_accepted()).count();
            StageResult::with_status(
                StageType::Interactive,
                status,
                format!("{accepted}/{} interactions accepted", cases.len()),
            )
        };
        let result = result
            .details(json!({ "cases": cases }))
            .resources(
                Some(cases.iter().map(|c| c.time_ms).sum()),
                cases.iter().map(|c| c.memory_kb).max(),
            );

        Ok(StageOutput::with_delta(
            result,
            ContextDelta {
                cases: Some(cases),
                ..Default::default()
            },
        ))
    }

    async fn interact(
        &self,
        ctx: &PipelineContext,
        executable: &Executable,
        sandbox: &Arc<dyn SandboxRunner>,
        case_no: usize,
        case: &Case,
    ) -> Result<CaseResult, StageError> {
        let program_dir = ctx.workspace.case_dir(case_no);
        let interactor_dir = ctx.workspace.checker_dir(case_no);
        tokio::fs::create_dir_all(&program_dir).await?;
        tokio::fs::create_dir_all(&interactor_dir).await?;
        tokio::fs::copy(
            ctx.problem.asset(&case.input_file),
            interactor_dir.join("input.txt"),
        )
        .await?;

        let mut interactor_command = self.config.interactor.command(&ctx.problem);
        interactor_command.push("input.txt".to_string());
        let interactor_request = RunRequest::new(interactor_command, &interactor_dir).limits(
            ExecutionLimits {
                time_ms: Some(self.config.interaction_timeout_ms),
                memory_kb: Some(CHECKER_MEMORY_KB),
                output_bytes: None,
            },
        );
        let program_request = RunRequest::new(executable.command.clone(), &program_dir)
            .limits(ctx.manifest().effective_limits(case));

        let interactor = sandbox.spawn(&interactor_request).await?;
        let program = match sandbox.spawn(&program_request).await {
            Ok(program) => program,
            Err(e) => {
                let mut handle = interactor.handle;
                handle.kill().await?;
                return Err(e.into());
            }
        };
        let mut interactor_handle = interactor.handle;
        let mut program_handle = program.handle;

        let exchanges = Arc::new(AtomicU32::new(0));
        let (breach_tx, mut breach_rx) = oneshot::channel();
        let program_limits = RelayLimits {
            max_exchanges: self.config.max_exchanges,
            exchanges: exchanges.clone(),
            breach: breach_tx,
        };
        let output_limit = self
            .config
            .output_limit_bytes
            .unwrap_or(ctx.config.output_limit_bytes);
        let to_interactor = tokio::spawn(relay_lines(
            program.stdout,
            interactor.stdin,
            output_limit,
            Some(program_limits),
        ));
        let to_program = tokio::spawn(relay_lines(
            interactor.stdout,
            program.stdin,
            UNCAPPED_OUTPUT_BYTES,
            None,
        ));

        let timeout = Duration::from_millis(self.config.interaction_timeout_ms);
        let ending = tokio::time::timeout(timeout, async {
            tokio::select! {
                outcome = interactor_handle.wait() => outcome.map(Ending::Interactor),
                Ok(breach) = &mut breach_rx => Ok(breach),
            }
        })
        .await
        .unwrap_or(Ok(Ending::Timeout))?;

        let (program_outcome, program_finished) = match ending {
            Ending::Interactor(_) => {
                let grace = Duration::from_millis(INTERACTION_GRACE_MS);
                match tokio::time::timeout(grace, program_handle.wait()).await {
                    Ok(outcome) => (outcome?, true),
                    Err(_) => {
                        program_handle.kill().await?;
                        (program_handle.wait().await?, false)
                    }
                }
            }
            Ending::ExchangeLimit | Ending::OutputLimit | Ending::Timeout => {
                interactor_handle.kill().await?;
                program_handle.kill().await?;
                (program_handle.wait().await?, false)
            }
        };
        to_interactor.abort();
        to_program.abort();

        let exchanges = exchanges.load(Ordering::Relaxed);
        let (status, message) = verdict(&ending, &program_outcome, program_finished, &self.config);
        tracing::debug!(case_no, %status, exchanges, "interaction finished");

        Ok(CaseResult {
            case_no,
            name: case.name.clone(),
            status,
            time_ms: program_outcome.time_ms,
            memory_kb: program_outcome.memory_kb,
            stderr_trunc: (!program_outcome.stderr.is_empty())
                .then(|| truncate_text(&program_outcome.stderr, DISPLAY_TRUNCATE_BYTES)),
            points: case.points,
            is_sample: case.is_sample,
            subtask: case.subtask_id(),
            message: Some(message),
            ..Default::default()
        })
    }
}

fn verdict(
    ending: &Ending,
    program: &RunOutcome,
    program_finished: bool,
    config: &InteractiveConfig,
) -> (Status, String) {
    match program.killed_reason {
        Some(KillReason::TimeLimit) => return (Status::Tle, "time limit exceeded".to_string()),
        Some(KillReason::MemoryLimit) => return (Status::Mle, "memory limit exceeded".to_string()),
        _ => {}
    }

    let interactor = match ending {
        Ending::Timeout => {
            return (
                Status::Tle,
                format!("interaction exceeded {} ms", config.interaction_timeout_ms),
            );
        }
        Ending::ExchangeLimit => {
            return (
                Status::Wa,
                format!("more than {} exchanges", config.max_exchanges),
            );
        }
        Ending::OutputLimit => return (Status::Ole, "output limit exceeded".to_string()),
        Ending::Interactor(outcome) => outcome,
    };

    if interactor.signal.is_some() || interactor.killed_reason.is_some() {
        return (Status::JudgeError, "interactor terminated abnormally".to_string());
    }
    match interactor.exit_code {
        Some(0) if program_finished && !program.success() => {
            (Status::Re, "program exited abnormally".to_string())
        }
        Some(0) => (Status::Ac, "accepted by interactor".to_string()),
        Some(1) | Some(2) => (Status::Wa, "rejected by interactor".to_string()),
        code => (Status::JudgeError, format!("interactor exited with {code:?}")),
    }
}

/// What the submission's side of the relay may send. The sender fires with
/// the breach as soon as a limit is passed.
struct RelayLimits {
    max_exchanges: u32,
    exchanges: Arc<AtomicU32>,
    breach: oneshot::Sender<Ending>,
}

/// Copies lines from `from` to `to`, flushing after each one. At most
/// `max_bytes` are read in total, so a line that never ends cannot grow
/// without bound. `to` is shut down when `from` reaches EOF.
async fn relay_lines(
    from: Box<dyn AsyncRead + Send + Unpin>,
    mut to: Box<dyn AsyncWrite + Send + Unpin>,
    max_bytes: u64,
    mut limits: Option<RelayLimits>,
) {
    let mut reader = BufReader::new(from);
    let mut line = Vec::new();
    let mut relayed: u64 = 0;
    loop {
        line.clear();
        let room = max_bytes.saturating_sub(relayed).saturating_add(1);
        match (&mut reader).take(room).read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(n) => relayed += n as u64,
        }
        if relayed > max_bytes {
            report(&mut limits, Ending::OutputLimit);
            return;
        }
        if let Some(l) = &limits {
            if l.exchanges.fetch_add(1, Ordering::Relaxed) + 1 > l.max_exchanges {
                report(&mut limits, Ending::ExchangeLimit);
                return;
            }
        }
        if !line.ends_with(b"\n") {
            line.push(b'\n');
        }
        let written = async {
            to.write_all(&line).await?;
            to.flush().await
        };
        if written.await.is_err() {
            return;
        }
    }
    let _ = to.shutdown().await;
}

fn report(limits: &mut Option<RelayLimits>, breach: Ending) {
    if let Some(limits) = limits.take() {
        let _ = limits.breach.send(breach);
    }
}
