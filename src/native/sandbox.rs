use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::constants::{
    DEFAULT_STDERR_CAP_BYTES, LINT_TIMEOUT_MS, MAX_WALL_TIME_MS, MEMORY_SAMPLE_INTERVAL_MS,
    OUTPUT_DRAIN_GRACE_MS, UNCAPPED_OUTPUT_BYTES, WALL_TIME_SLACK_MS,
};
use crate::core::{
    domain::{ExecutionLimits, Language},
    errors::SandboxError,
    traits::sandbox::{
        KillReason, LintOutput, ProcessHandle, RunOutcome, RunRequest, SandboxRunner,
        SpawnedProcess,
    },
};

/// Runs commands directly on the host with `tokio::process`.
///
/// Time is enforced with `RLIMIT_CPU`, plus a wall-clock deadline for
/// `run`. Memory is enforced by sampling the peak resident set and an
/// address-space cap, output by capping captured stdout. Every child gets its own process group, which
/// is killed as a whole. There is no filesystem or network isolation, so
/// this is only meant for development and tests.
#[derive(Clone, Debug, Default)]
pub struct LocalSandbox;

impl LocalSandbox {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl SandboxRunner for LocalSandbox {
    async fn run(&self, request: &RunRequest) -> Result<RunOutcome, SandboxError> {
        let mut child = launch(request)?;
        let overflow = Arc::new(AtomicBool::new(false));

        let stdin = child.stdin.take();
        let input = request.stdin.clone();
        tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!(error = %e, "child closed stdin early");
                }
            }
        });

        let stdout = child.stdout.take().ok_or_else(missing_pipe)?;
        let stderr = child.stderr.take().ok_or_else(missing_pipe)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let stdout_cap = request.limits.output_bytes.unwrap_or(UNCAPPED_OUTPUT_BYTES) as usize;
        let stdout_task = tokio::spawn(read_capped(
            stdout,
            stdout_cap,
            Some(overflow.clone()),
            stop_rx.clone(),
        ));
        let stderr_task = tokio::spawn(read_capped(stderr, DEFAULT_STDERR_CAP_BYTES, None, stop_rx));

        let clock = Clock::wall(&request.limits);
        let mut supervisor = Supervisor::new(child, &request.limits, Some(overflow), clock);
        let status = supervisor.wait(None).await.map_err(io_error)?;
        supervisor.kill_stragglers();

        let cutoff = stop_draining_after(stop_tx);
        let stdout = join_output(stdout_task).await?;
        let stderr = join_output(stderr_task).await?;
        cutoff.abort();
        let outcome = supervisor.outcome(status, stdout, stderr);
        tracing::debug!(
            program = request.program(),
            exit_code = ?outcome.exit_code,
            killed = ?outcome.killed_reason,
            time_ms = outcome.time_ms,
            "process finished"
        );
        Ok(outcome)
    }

    async fn lint(&self, job_dir: &Path, language: &Language) -> Result<LintOutput, SandboxError> {
        let src_dir = job_dir.join("src");
        let sources = list_sources(&src_dir, language).await?;
        let mut command = match language {
            Language::Python => vec!["pylint".to_string(), "--output-format=json".to_string()],
            Language::C | Language::Cpp => vec!["clang-tidy".to_string()],
            Language::Java => return Ok(LintOutput::default()),
        };
        if sources.is_empty() {
            return Ok(LintOutput::default());
        }
        command.extend(sources.iter().map(|p| p.to_string_lossy().into_owned()));
        match language {
            Language::C => command.extend(["--".to_string(), "-std=c11".to_string()]),
            Language::Cpp => command.extend(["--".to_string(), "-std=c++17".to_string()]),
            _ => {}
        }

        let request = RunRequest::new(command, &src_dir).limits(ExecutionLimits {
            time_ms: Some(LINT_TIMEOUT_MS),
            ..Default::default()
        });
        let outcome = self.run(&request).await?;
        if outcome.killed_reason == Some(KillReason::TimeLimit) {
            return Err(SandboxError::Io {
                msg: format!("{} exceeded {LINT_TIMEOUT_MS} ms", request.program()),
            });
        }
        Ok(LintOutput {
            output: outcome.stdout,
        })
    }

    /// The child is supervised in the background from here on, so memory
    /// is sampled even while it sits blocked on a peer. There is no wall
    /// deadline: `RLIMIT_CPU` bounds the time it spends running and the
    /// caller owns the overall clock.
    async fn spawn(&self, request: &RunRequest) -> Result<SpawnedProcess, SandboxError> {
        let mut child = launch(request)?;
        let stdin = child.stdin.take().ok_or_else(missing_pipe)?;
        let stdout = child.stdout.take().ok_or_else(missing_pipe)?;
        let stderr = child.stderr.take().ok_or_else(missing_pipe)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let stderr_task = tokio::spawn(read_capped(stderr, DEFAULT_STDERR_CAP_BYTES, None, stop_rx));

        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(child, &request.limits, None, Clock::Cpu);
        let supervision = tokio::spawn(supervise(supervisor, kill_rx, stderr_task, stop_tx));

        Ok(SpawnedProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            handle: Box::new(LocalProcess {
                kill_requests: kill_tx,
                supervision: Some(supervision),
                finished: None,
            }),
        })
    }
}

/// Background half of a spawned process. Dropping the handle closes the
/// kill channel, which kills the child.
async fn supervise(
    mut supervisor: Supervisor,
    kill_requests: mpsc::UnboundedReceiver<()>,
    stderr_task: JoinHandle<std::io::Result<String>>,
    stop_draining: watch::Sender<bool>,
) -> Result<RunOutcome, SandboxError> {
    let status = supervisor.wait(Some(kill_requests)).await.map_err(io_error)?;
    supervisor.kill_stragglers();
    let cutoff = stop_draining_after(stop_draining);
    let stderr = join_output(stderr_task).await?;
    cutoff.abort();
    Ok(supervisor.outcome(status, String::new(), stderr))
}

struct LocalProcess {
    kill_requests: mpsc::UnboundedSender<()>,
    supervision: Option<JoinHandle<Result<RunOutcome, SandboxError>>>,
    finished: Option<RunOutcome>,
}

#[async_trait::async_trait]
impl ProcessHandle for LocalProcess {
    async fn wait(&mut self) -> Result<RunOutcome, SandboxError> {
        if let Some(outcome) = &self.finished {
            return Ok(outcome.clone());
        }
        let Some(supervision) = self.supervision.as_mut() else {
            return Err(SandboxError::Communication {
                msg: "process supervision already failed".to_string(),
            });
        };
        let joined = supervision.await;
        self.supervision = None;
        let outcome = joined.map_err(|e| SandboxError::Communication { msg: e.to_string() })??;
        self.finished = Some(outcome.clone());
        Ok(outcome)
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        // A closed channel means the child is already gone.
        let _ = self.kill_requests.send(());
        Ok(())
    }
}

/// What bounds a child's running time, and how that time is reported.
#[derive(Clone, Copy, Debug)]
enum Clock {
    /// Killed at the deadline; reports elapsed wall time.
    Wall(Instant),
    /// Only `RLIMIT_CPU` applies; reports sampled CPU time.
    Cpu,
}

impl Clock {
    fn wall(limits: &ExecutionLimits) -> Self {
        let wall_ms = limits
            .time_ms
            .map_or(MAX_WALL_TIME_MS, |ms| ms + WALL_TIME_SLACK_MS);
        Clock::Wall(Instant::now() + Duration::from_millis(wall_ms))
    }
}

/// Watches one child: deadline, memory samples, kill requests and output
/// overflow.
struct Supervisor {
    child: Child,
    pid: Option<u32>,
    started: Instant,
    clock: Clock,
    memory_limit_kb: Option<u64>,
    overflow: Option<Arc<AtomicBool>>,
    peak_kb: u64,
    cpu_ms: u64,
    killed: Option<KillReason>,
    exit: Option<(ExitStatus, u64)>,
}

impl Supervisor {
    fn new(
        child: Child,
        limits: &ExecutionLimits,
        overflow: Option<Arc<AtomicBool>>,
        clock: Clock,
    ) -> Self {
        Self {
            pid: child.id(),
            child,
            started: Instant::now(),
            clock,
            memory_limit_kb: limits.memory_kb,
            overflow,
            peak_kb: 0,
            cpu_ms: 0,
            killed: None,
            exit: None,
        }
    }

    /// Resolves once the child is reaped. A closed `kill_requests` channel
    /// counts as a request.
    async fn wait(
        &mut self,
        mut kill_requests: Option<mpsc::UnboundedReceiver<()>>,
    ) -> std::io::Result<ExitStatus> {
        if let Some((status, _)) = self.exit {
            return Ok(status);
        }
        let mut ticker = tokio::time::interval(Duration::from_millis(MEMORY_SAMPLE_INTERVAL_MS));
        loop {
            let deadline = match self.clock {
                Clock::Wall(deadline) if self.killed.is_none() => Some(deadline),
                _ => None,
            };
            tokio::select! {
                status = self.child.wait() => {
                    let status = status?;
                    let time_ms = match self.clock {
                        Clock::Wall(_) => self.started.elapsed().as_millis() as u64,
                        Clock::Cpu => self.cpu_ms,
                    };
                    self.exit = Some((status, time_ms));
                    return Ok(status);
                }
                _ = sleep_until_some(deadline) => {
                    self.kill(Some(KillReason::TimeLimit))?;
                }
                _ = next_kill_request(&mut kill_requests) => {
                    kill_requests = None;
                    self.kill(None)?;
                }
                _ = ticker.tick() => {
                    self.sample().await;
                    if self.killed.is_some() {
                        continue;
                    }
                    if self.memory_limit_kb.is_some_and(|limit| self.peak_kb > limit) {
                        self.kill(Some(KillReason::MemoryLimit))?;
                    } else if self.overflow.as_ref().is_some_and(|o| o.load(Ordering::Relaxed)) {
                        self.kill(Some(KillReason::OutputLimit))?;
                    }
                }
            }
        }
    }

    async fn sample(&mut self) {
        let Some(pid) = self.pid else { return };
        if let Ok(status) = fs::read_to_string(format!("/proc/{pid}/status")).await {
            if let Some(kb) = parse_vm_hwm(&status) {
                self.peak_kb = self.peak_kb.max(kb);
            }
        }
        if matches!(self.clock, Clock::Cpu) {
            if let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")).await {
                if let Some(ticks) = parse_cpu_ticks(&stat) {
                    self.cpu_ms = self.cpu_ms.max(ticks * 1000 / clock_ticks_per_sec());
                }
            }
        }
    }

    fn kill(&mut self, reason: Option<KillReason>) -> std::io::Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        if let Some(reason) = reason {
            self.killed.get_or_insert(reason);
        }
        if self.signal_group() {
            return Ok(());
        }
        match self.child.start_kill() {
            Err(e) if e.kind() != std::io::ErrorKind::InvalidInput => Err(e),
            _ => Ok(()),
        }
    }

    /// Leftover members of the group would keep the output pipes open.
    fn kill_stragglers(&self) {
        self.signal_group();
    }

    fn signal_group(&self) -> bool {
        let Some(pid) = self.pid else { return false };
        // SAFETY: `pid` leads the process group created for this child,
        // and no other process can take the id while the group exists.
        unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) == 0 }
    }

    fn outcome(&self, status: ExitStatus, stdout: String, stderr: String) -> RunOutcome {
        let signal = status.signal();
        let killed_reason = self.killed.or_else(|| match signal {
            Some(libc::SIGXCPU) => Some(KillReason::TimeLimit),
            _ if self.overflow.as_ref().is_some_and(|o| o.load(Ordering::Relaxed)) => {
                Some(KillReason::OutputLimit)
            }
            _ => None,
        });
        RunOutcome {
            exit_code: status.code(),
            signal,
            stdout,
            stderr,
            time_ms: self.exit.map_or(0, |(_, time_ms)| time_ms),
            memory_kb: self.peak_kb,
            killed_reason,
        }
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_kill_request(requests: &mut Option<mpsc::UnboundedReceiver<()>>) {
    match requests {
        Some(requests) => {
            requests.recv().await;
        }
        None => std::future::pending().await,
    }
}

/// A process that left the group (`setsid`) can hold the pipes open long
/// after the child is reaped. The readers get a short grace, then stop.
fn stop_draining_after(stop: watch::Sender<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(OUTPUT_DRAIN_GRACE_MS)).await;
        let _ = stop.send(true);
    })
}

fn launch(request: &RunRequest) -> Result<Child, SandboxError> {
    let (program, args) = request
        .command
        .split_first()
        .ok_or_else(|| SandboxError::Launch {
            program: String::new(),
            msg: "empty command".to_string(),
        })?;

    let mut command = std::process::Command::new(program);
    command
        .args(args)
        .current_dir(&request.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let cpu_secs = request.limits.time_ms.map(|ms| ms.div_ceil(1000) + 1);
    let address_space = address_space_cap(program, &request.limits);
    // SAFETY: the hook only calls setrlimit, which is async-signal-safe.
    unsafe {
        command.pre_exec(move || apply_rlimits(cpu_secs, address_space));
    }

    Command::from(command)
        .kill_on_drop(true)
        .spawn().map_err(|e| SandboxError::Launch {
        program: program.clone(),
        msg: e.to_string(),
    })
}

/// Twice the memory limit, leaving MLE to the resident-set samples. The JVM
/// reserves far more address space than it touches, so it gets none.
fn address_space_cap(program: &str, limits: &ExecutionLimits) -> Option<u64> {
    let is_jvm = Path::new(program).file_name().is_some_and(|name| name == "java");
    if is_jvm {
        return None;
    }
    limits.memory_kb.map(|kb| kb * 1024 * 2)
}

fn apply_rlimits(cpu_secs: Option<u64>, address_space: Option<u64>) -> std::io::Result<()> {
    if let Some(secs) = cpu_secs {
        let limit = libc::rlimit {
            rlim_cur: secs as libc::rlim_t,
            rlim_max: (secs + 1) as libc::rlim_t,
        };
        if unsafe { libc::setrlimit(libc::RLIMIT_CPU, &limit) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    if let Some(bytes) = address_space {
        let limit = libc::rlimit {
            rlim_cur: bytes as libc::rlim_t,
            rlim_max: bytes as libc::rlim_t,
        };
        if unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Reads the stream to the end, keeping at most `cap` bytes. Draining goes
/// on past the cap so the writer never blocks on a full pipe, until `stop`
/// is raised.
async fn read_capped<R>(
    mut reader: R,
    cap: usize,
    overflow: Option<Arc<AtomicBool>>,
    mut stop: watch::Receiver<bool>,
) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = tokio::select! {
            n = reader.read(&mut chunk) => n?,
            Ok(()) = stop.changed() => break,
        };
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..n.min(room)]);
        if n > room {
            if let Some(flag) = &overflow {
                flag.store(true, Ordering::Relaxed);
            }
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn join_output(task: JoinHandle<std::io::Result<String>>) -> Result<String, SandboxError> {
    task.await
        .map_err(|e| SandboxError::Communication { msg: e.to_string() })?
        .map_err(|e| SandboxError::Communication { msg: e.to_string() })
}

async fn list_sources(dir: &Path, language: &Language) -> Result<Vec<PathBuf>, SandboxError> {
    let mut entries = fs::read_dir(dir).await.map_err(io_error)?;
    let mut sources = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| language.compiled_extensions().contains(&ext));
        if matches {
            sources.push(path);
        }
    }
    sources.sort();
    Ok(sources)
}

/// utime + stime from `/proc/<pid>/stat`. The command name may hold
/// spaces, so fields are counted from the closing parenthesis.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace().skip(11);
    let utime: u64 = fields.next()?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

fn clock_ticks_per_sec() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as u64 } else { 100 }
}

fn parse_vm_hwm(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmHWM:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse().ok())
}

fn io_error(e: std::io::Error) -> SandboxError {
    SandboxError::Io { msg: e.to_string() }
}

fn missing_pipe() -> SandboxError {
    SandboxError::Io {
        msg: "child stdio was not captured".to_string(),
    }
}
