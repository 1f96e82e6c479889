use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs;

use crate::{
    constants::{
        DEFAULT_MAKE_TARGET, MAX_FUNCTION_SOURCE_BYTES, MAX_SOURCE_BYTES, STUDENT_CODE_MARKER,
        STUDENT_REGION_BEGIN, STUDENT_REGION_END,
    },
    core::{
        domain::{
            ExecutionLimits, Executable, Language, SourceBundle, StageResult, StageType, Status,
            Submission, SubmissionType, truncate_text,
        },
        errors::{ConfigError, StageError},
        manifest::is_safe_relative_path,
        pipeline::{
            StageOutput,
            context::{ContextDelta, PipelineContext},
            parse_config,
            static_analysis::strip_literals,
        },
        traits::sandbox::{KillReason, RunOutcome, RunRequest, SandboxRunner},
    },
};

static C_MAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:int|void)\s+main\s*\(").expect("main pattern is valid"));
static JAVA_MAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bstatic\s+void\s+main\s*\(").expect("main pattern is valid")
});
static PYTHON_MAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"__name__\s*==\s*['"]__main__['"]"#).expect("main pattern is valid")
});

const ALLOWED_EXTENSIONS: &[&str] = &["c", "h", "cpp", "hpp", "cc", "cxx", "java", "py"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompileMode {
    SingleFile,
    FunctionOnly,
    MultiFile,
    Makefile,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompileConfig {
    mode: Option<CompileMode>,
    /// Harness the function-only submission is merged into.
    template: Option<String>,
    #[serde(default)]
    drivers: Vec<String>,
    makefile: Option<String>,
    executable: Option<String>,
    flags: Option<String>,
    timeout_ms: Option<u64>,
    memory_kb: Option<u64>,
}

#[derive(Debug)]
pub struct CompileStage {
    config: CompileConfig,
}

/// What the toolchain invocation looks like for one submission.
struct BuildPlan {
    command: Vec<String>,
    cwd: PathBuf,
    executable: Executable,
    produces: PathBuf,
}

impl CompileStage {
    pub fn validate_config(config: &serde_json::Value) -> Result<Self, ConfigError> {
        let config: CompileConfig = parse_config(StageType::Compile, config)?;

        if config.mode == Some(CompileMode::FunctionOnly) && config.template.is_none() {
            return Err(invalid("function-only mode requires a `template`"));
        }
        let assets = config
            .template
            .iter()
            .chain(config.makefile.iter())
            .chain(config.drivers.iter());
        for asset in assets {
            if !is_safe_relative_path(asset) {
                return Err(invalid(format!("`{asset}` is not a safe relative path")));
            }
        }
        if let Some(executable) = &config.executable {
            if !is_safe_file_name(executable) {
                return Err(invalid(format!("`{executable}` is not a valid executable name")));
            }
        }
        if config.timeout_ms == Some(0) {
            return Err(invalid("timeoutMs must be positive"));
        }
        Ok(Self { config })
    }

    fn resolve_mode(&self, submission: &Submission) -> CompileMode {
        if let Some(mode) = self.config.mode {
            return mode;
        }
        match submission.submission_type {
            SubmissionType::FunctionOnly => CompileMode::FunctionOnly,
            SubmissionType::MultiFile if submission.source.contains_file("Makefile") => {
                CompileMode::Makefile
            }
            SubmissionType::MultiFile => CompileMode::MultiFile,
            SubmissionType::SingleFile => CompileMode::SingleFile,
        }
    }

    #[tracing::instrument(skip_all, fields(submission_id = %ctx.submission.id))]
    pub async fn execute(
        &self,
        ctx: &PipelineContext,
        sandbox: &Arc<dyn SandboxRunner>,
    ) -> Result<StageOutput, StageError> {
        let language = ctx.submission.language;
        let mode = self.resolve_mode(&ctx.submission);
        tracing::info!(?mode, %language, "compiling submission");

        if let Err(msg) = validate_sources(&ctx.submission.source, mode, &language) {
            return Ok(compilation_failed(mode, msg, None));
        }

        let src_dir = ctx.workspace.src_dir();
        fs::create_dir_all(&src_dir).await?;
        fs::create_dir_all(ctx.workspace.build_dir()).await?;

        if mode == CompileMode::FunctionOnly {
            if let Err(msg) = self.write_merged_source(ctx).await? {
                return Ok(compilation_failed(mode, msg, None));
            }
        } else {
            write_submission_files(ctx).await?;
        }

        for driver in &self.config.drivers {
            let target = src_dir.join(file_name_of(driver));
            fs::copy(ctx.problem.asset(driver), target).await?;
        }

        if mode == CompileMode::Makefile {
            let makefile = src_dir.join("Makefile");
            if let (false, Some(asset)) = (fs::try_exists(&makefile).await?, &self.config.makefile) {
                fs::copy(ctx.problem.asset(asset), &makefile).await?;
            }
            if !fs::try_exists(&makefile).await? {
                return Ok(compilation_failed(
                    mode,
                    "makefile mode requires a Makefile in the submission".to_string(),
                    None,
                ));
            }
        }

        let plan = match self.plan_build(ctx, mode).await? {
            Ok(plan) => plan,
            Err(msg) => return Ok(compilation_failed(mode, msg, None)),
        };

        let limits = ExecutionLimits {
            time_ms: Some(self.config.timeout_ms.unwrap_or(ctx.config.compile_timeout_ms)),
            memory_kb: Some(self.config.memory_kb.unwrap_or(ctx.config.compile_memory_kb)),
            output_bytes: None,
        };
        let request = RunRequest::new(plan.command.clone(), &plan.cwd).limits(limits.clone());
        tracing::debug!(command = ?plan.command, "invoking toolchain");
        let outcome = sandbox.run(&request).await?;

        self.evaluate(ctx, mode, &plan, &limits, outcome).await
    }

    async fn evaluate(
        &self,
        ctx: &PipelineContext,
        mode: CompileMode,
        plan: &BuildPlan,
        limits: &ExecutionLimits,
        outcome: RunOutcome,
    ) -> Result<StageOutput, StageError> {
        let cap = ctx.config.stderr_cap_bytes;

        if outcome.killed_reason == Some(KillReason::TimeLimit) {
            let msg = format!(
                "compilation exceeded the time limit of {} ms",
                limits.time_ms.unwrap_or_default()
            );
            return Ok(compilation_failed(mode, msg, Some(outcome)));
        }
        if !outcome.success() {
            let diagnostics = if outcome.stderr.trim().is_empty() {
                &outcome.stdout
            } else {
                &outcome.stderr
            };
            let stderr = truncate_text(diagnostics, cap);
            tracing::info!(exit_code = ?outcome.exit_code, "compilation failed");
            let result = StageResult::aborted(StageType::Compile, Status::Ce, "compilation failed")
                .details(json!({ "mode": mode, "exitCode": outcome.exit_code }))
                .stderr(stderr)
                .resources(Some(outcome.time_ms), Some(outcome.memory_kb));
            return Ok(result.into());
        }
        if !fs::try_exists(&plan.produces).await? {
            let msg = format!(
                "compilation produced no `{}`",
                file_name_of(&plan.produces.to_string_lossy())
            );
            return Ok(compilation_failed(mode, msg, Some(outcome)));
        }

        let warnings = (!outcome.stderr.trim().is_empty()).then(|| truncate_text(&outcome.stderr, cap));
        let result = StageResult::passed(StageType::Compile, "compilation succeeded")
            .details(json!({
                "mode": mode,
                "executable": plan.executable.command,
                "warnings": warnings,
            }))
            .resources(Some(outcome.time_ms), Some(outcome.memory_kb));
        let delta = ContextDelta {
            executable: Some(plan.executable.clone()),
            ..Default::default()
        };
        Ok(StageOutput::with_delta(result, delta))
    }

    /// Merges the student's function into the instructor harness. The inner
    /// `Err` is a user-facing compile failure.
    async fn write_merged_source(&self, ctx: &PipelineContext) -> Result<Result<(), String>, StageError> {
        let language = ctx.submission.language;
        let Some(template) = &self.config.template else {
            return Err(ConfigError::invalid(
                StageType::Compile,
                "function-only submission but no `template` configured",
            )
            .into());
        };

        let student = match &ctx.submission.source {
            SourceBundle::Single(code) => code.as_str(),
            SourceBundle::Files(files) => match files.get(language.source_file_name()) {
                Some(code) => code.as_str(),
                None => {
                    return Ok(Err(format!(
                        "function-only submission must provide {}",
                        language.source_file_name()
                    )));
                }
            },
        };
        if defines_main(student, &language) {
            return Ok(Err(
                "function-only submissions must not define a main entry point".to_string(),
            ));
        }

        let harness = fs::read_to_string(ctx.problem.asset(template)).await?;
        let merged = merge_template(&harness, student).ok_or_else(|| {
            ConfigError::invalid(
                StageType::Compile,
                format!("template `{template}` has no student code marker"),
            )
        })?;
        fs::write(ctx.workspace.src_dir().join(language.source_file_name()), merged).await?;
        Ok(Ok(()))
    }

    async fn plan_build(
        &self,
        ctx: &PipelineContext,
        mode: CompileMode,
    ) -> Result<Result<BuildPlan, String>, StageError> {
        let src_dir = ctx.workspace.src_dir();
        let build_dir = ctx.workspace.build_dir();
        let language = ctx.submission.language;

        if mode == CompileMode::Makefile {
            let target = self.config.executable.as_deref().unwrap_or(DEFAULT_MAKE_TARGET);
            let produces = src_dir.join(target);
            return Ok(Ok(BuildPlan {
                command: vec!["make".to_string(), "-s".to_string()],
                cwd: src_dir.clone(),
                executable: Executable {
                    command: vec![path_arg(&produces)],
                },
                produces,
            }));
        }

        let entry = src_dir.join(language.source_file_name());
        let needs_entry = matches!(language, Language::Java | Language::Python);
        if needs_entry && !fs::try_exists(&entry).await? {
            return Ok(Err(format!("the submission must contain {}", language.source_file_name())));
        }

        let sources = list_sources(&src_dir, &language).await?;
        if sources.is_empty() {
            return Ok(Err(format!("no {language} source files to compile")));
        }
        let flags: Vec<String> = self
            .config
            .flags
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let binary = build_dir.join("main");

        let plan = match language {
            Language::C | Language::Cpp => {
                let (compiler, standard) = match language {
                    Language::C => ("gcc", "-std=c11"),
                    _ => ("g++", "-std=c++17"),
                };
                let mut command = vec![compiler.to_string(), standard.to_string(), "-O2".to_string()];
                command.extend(flags);
                command.extend(["-o".to_string(), path_arg(&binary)]);
                command.extend(sources.iter().map(|s| path_arg(s)));
                if language == Language::C {
                    command.push("-lm".to_string());
                }
                BuildPlan {
                    command,
                    cwd: src_dir.clone(),
                    executable: Executable {
                        command: vec![path_arg(&binary)],
                    },
                    produces: binary,
                }
            }
            Language::Java => {
                let mut command = vec!["javac".to_string(), "-encoding".to_string(), "UTF-8".to_string()];
                command.extend(flags);
                command.extend(["-d".to_string(), path_arg(&build_dir)]);
                command.extend(sources.iter().map(|s| path_arg(s)));
                BuildPlan {
                    command,
                    cwd: src_dir.clone(),
                    executable: Executable {
                        command: vec![
                            "java".to_string(),
                            "-cp".to_string(),
                            path_arg(&build_dir),
                            "Main".to_string(),
                        ],
                    },
                    produces: build_dir.join("Main.class"),
                }
            }
            Language::Python => {
                let mut command = vec!["python3".to_string(), "-m".to_string(), "py_compile".to_string()];
                command.extend(sources.iter().map(|s| path_arg(s)));
                BuildPlan {
                    command,
                    cwd: src_dir.clone(),
                    executable: Executable {
                        command: vec!["python3".to_string(), path_arg(&entry)],
                    },
                    produces: entry,
                }
            }
        };
        Ok(Ok(plan))
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::invalid(StageType::Compile, msg)
}

fn compilation_failed(mode: CompileMode, msg: String, outcome: Option<RunOutcome>) -> StageOutput {
    let result = StageResult::aborted(StageType::Compile, Status::Ce, "compilation failed")
        .details(json!({ "mode": mode }))
        .stderr(msg);
    match outcome {
        Some(outcome) => result.resources(Some(outcome.time_ms), Some(outcome.memory_kb)).into(),
        None => result.into(),
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn file_name_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn has_allowed_extension(name: &str) -> bool {
    name == "Makefile"
        || Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext))
}

/// User-facing source checks done before anything touches the disk.
fn validate_sources(source: &SourceBundle, mode: CompileMode, language: &Language) -> Result<(), String> {
    let files = source.files(language);
    if files.iter().all(|(_, code)| code.trim().is_empty()) {
        return Err("source code is empty".to_string());
    }

    let limit = match mode {
        CompileMode::FunctionOnly => MAX_FUNCTION_SOURCE_BYTES,
        _ => MAX_SOURCE_BYTES,
    };
    let total: usize = files.iter().map(|(_, code)| code.len()).sum();
    if total > limit {
        return Err(format!("source code is {total} bytes, the limit is {limit} bytes"));
    }

    if let SourceBundle::Files(files) = source {
        for name in files.keys() {
            if !is_safe_file_name(name) || !has_allowed_extension(name) {
                return Err(format!("`{name}` is not an allowed source file name"));
            }
        }
    }
    Ok(())
}

fn defines_main(source: &str, language: &Language) -> bool {
    match language {
        Language::C | Language::Cpp => C_MAIN.is_match(&strip_literals(source, language)),
        Language::Java => JAVA_MAIN.is_match(&strip_literals(source, language)),
        Language::Python => PYTHON_MAIN.is_match(source),
    }
}

/// Puts the student code in place of the single-line marker, or between
/// the BEGIN/END region markers (which are kept).
pub fn merge_template(template: &str, student: &str) -> Option<String> {
    for marker in [
        format!("// {STUDENT_CODE_MARKER}"),
        format!("# {STUDENT_CODE_MARKER}"),
        STUDENT_CODE_MARKER.to_string(),
    ] {
        if template.contains(&marker) {
            return Some(template.replacen(&marker, student, 1));
        }
    }

    let begin = template.find(STUDENT_REGION_BEGIN)?;
    let body_start = template[begin..].find('\n').map(|i| begin + i + 1)?;
    let end = body_start + template[body_start..].find(STUDENT_REGION_END)?;
    let end_line_start = template[..end].rfind('\n').map(|i| i + 1).unwrap_or(0);
    if end_line_start < body_start {
        return None;
    }

    let mut merged = String::with_capacity(template.len() + student.len());
    merged.push_str(&template[..body_start]);
    merged.push_str(student);
    if !student.ends_with('\n') {
        merged.push('\n');
    }
    merged.push_str(&template[end_line_start..]);
    Some(merged)
}

/// Writes the submitted files, as submitted, into the workspace `src` dir.
pub(crate) async fn write_submission_files(ctx: &PipelineContext) -> Result<(), StageError> {
    let src_dir = ctx.workspace.src_dir();
    fs::create_dir_all(&src_dir).await?;
    for (name, code) in ctx.submission.source.files(&ctx.submission.language) {
        if !is_safe_file_name(&name) {
            return Err(StageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("refusing to write submission file `{name}`"),
            )));
        }
        fs::write(src_dir.join(&name), code).await?;
    }
    Ok(())
}

async fn list_sources(dir: &Path, language: &Language) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut entries = fs::read_dir(dir).await?;
    let mut sources = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| language.compiled_extensions().contains(&ext));
        if matches && entry.file_type().await?.is_file() {
            sources.push(path);
        }
    }
    sources.sort();
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::{
        pipeline::testing::{context_for, create_manifest, create_problem, create_submission, unique_dir},
        traits::sandbox::MockSandboxRunner,
    };

    const HELLO_C: &str = "#include <stdio.h>\nint main() { printf(\"hi\\n\"); return 0; }\n";
    const BROKEN_C: &str = "#include <stdio.h>\nint main() { printf(\"hi\\n\") return 0; }\n";

    fn create_stage(config: serde_json::Value) -> CompileStage {
        CompileStage::validate_config(&config).unwrap()
    }

    fn context(language: Language, source: SourceBundle, submission_type: SubmissionType) -> PipelineContext {
        let assets = unique_dir("judge_assets");
        std::fs::create_dir_all(&assets).unwrap();
        let mut submission = create_submission(language, source);
        submission.submission_type = submission_type;
        context_for(submission, create_problem(create_manifest(&[100]), assets))
    }

    /// Sandbox that "compiles" by creating whatever the command promises.
    fn compiling_sandbox() -> MockSandboxRunner {
        let mut sandbox = MockSandboxRunner::new();
        sandbox.expect_run().returning(|request| {
            let command = &request.command;
            if let Some(i) = command.iter().position(|arg| arg == "-o") {
                std::fs::write(&command[i + 1], b"\x7fELF").unwrap();
            }
            if let Some(i) = command.iter().position(|arg| arg == "-d") {
                std::fs::write(Path::new(&command[i + 1]).join("Main.class"), b"class").unwrap();
            }
            if command[0] == "make" {
                std::fs::write(request.cwd.join("main"), b"\x7fELF").unwrap();
            }
            Ok(RunOutcome::exited(0, "", ""))
        });
        sandbox
    }

    #[tokio::test]
    async fn test_syntax_error_is_ce_and_aborts() {
        let mut sandbox = MockSandboxRunner::new();
        sandbox.expect_run().times(1).return_const(Ok(RunOutcome::exited(
            1,
            "",
            "main.c:2:38: error: expected ';' before 'return'",
        )));
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(sandbox);
        let ctx = context(Language::C, SourceBundle::Single(BROKEN_C.into()), SubmissionType::SingleFile);

        let output = create_stage(json!({})).execute(&ctx, &sandbox).await.unwrap();

        assert_eq!(output.result.status, Status::Ce);
        assert!(output.result.should_abort);
        assert!(output.result.stderr.unwrap().contains("expected ';'"));
        assert!(output.delta.executable.is_none());
    }

    #[tokio::test]
    async fn test_single_file_success_sets_executable() {
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(compiling_sandbox());
        let ctx = context(Language::C, SourceBundle::Single(HELLO_C.into()), SubmissionType::SingleFile);

        let output = create_stage(json!({"flags": "-Wall"})).execute(&ctx, &sandbox).await.unwrap();

        assert_eq!(output.result.status, Status::Ac);
        assert!(!output.result.should_abort);
        let executable = output.delta.executable.unwrap();
        assert_eq!(executable.command, vec![path_arg(&ctx.workspace.build_dir().join("main"))]);
        let written = std::fs::read_to_string(ctx.workspace.src_dir().join("main.c")).unwrap();
        assert_eq!(written, HELLO_C);
    }

    #[tokio::test]
    async fn test_compile_timeout_is_ce() {
        let mut sandbox = MockSandboxRunner::new();
        sandbox
            .expect_run()
            .return_const(Ok(RunOutcome::killed(KillReason::TimeLimit)));
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(sandbox);
        let ctx = context(Language::Cpp, SourceBundle::Single("int main(){}".into()), SubmissionType::SingleFile);

        let output = create_stage(json!({"timeoutMs": 500})).execute(&ctx, &sandbox).await.unwrap();

        assert_eq!(output.result.status, Status::Ce);
        assert!(output.result.stderr.unwrap().contains("500 ms"));
    }

    #[tokio::test]
    async fn test_empty_source_never_reaches_compiler() {
        let mut sandbox = MockSandboxRunner::new();
        sandbox.expect_run().times(0);
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(sandbox);
        let ctx = context(Language::C, SourceBundle::Single("  \n".into()), SubmissionType::SingleFile);

        let output = create_stage(json!({})).execute(&ctx, &sandbox).await.unwrap();

        assert_eq!(output.result.status, Status::Ce);
        assert_eq!(output.result.stderr.as_deref(), Some("source code is empty"));
    }

    #[tokio::test]
    async fn test_function_only_merges_into_template() {
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(compiling_sandbox());
        let ctx = context(
            Language::C,
            SourceBundle::Single("int add(int a, int b) { return a + b; }".into()),
            SubmissionType::FunctionOnly,
        );
        std::fs::write(
            ctx.problem.asset("harness.c"),
            "#include <stdio.h>\n// STUDENT_CODE_HERE\nint main() { printf(\"%d\", add(1, 2)); }\n",
        )
        .unwrap();

        let output = create_stage(json!({"template": "harness.c"}))
            .execute(&ctx, &sandbox)
            .await
            .unwrap();

        assert_eq!(output.result.status, Status::Ac);
        let merged = std::fs::read_to_string(ctx.workspace.src_dir().join("main.c")).unwrap();
        assert!(merged.contains("int add(int a, int b)"));
        assert!(!merged.contains(STUDENT_CODE_MARKER));
    }

    #[tokio::test]
    async fn test_function_only_rejects_main() {
        let mut sandbox = MockSandboxRunner::new();
        sandbox.expect_run().times(0);
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(sandbox);
        let ctx = context(Language::C, SourceBundle::Single(HELLO_C.into()), SubmissionType::FunctionOnly);

        let output = create_stage(json!({"mode": "function-only", "template": "harness.c"}))
            .execute(&ctx, &sandbox)
            .await
            .unwrap();

        assert_eq!(output.result.status, Status::Ce);
        assert!(output.result.stderr.unwrap().contains("main"));
    }

    #[tokio::test]
    async fn test_makefile_mode() {
        let mut files = BTreeMap::new();
        files.insert("main.c".to_string(), HELLO_C.to_string());
        files.insert("Makefile".to_string(), "main: main.c\n\tgcc -o main main.c\n".to_string());
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(compiling_sandbox());
        let ctx = context(Language::C, SourceBundle::Files(files), SubmissionType::MultiFile);

        let output = create_stage(json!({})).execute(&ctx, &sandbox).await.unwrap();

        assert_eq!(output.result.status, Status::Ac);
        assert_eq!(output.result.details["mode"], "makefile");
        assert_eq!(
            output.delta.executable.unwrap().command,
            vec![path_arg(&ctx.workspace.src_dir().join("main"))]
        );
    }

    #[tokio::test]
    async fn test_makefile_mode_without_makefile_is_ce() {
        let mut files = BTreeMap::new();
        files.insert("main.c".to_string(), HELLO_C.to_string());
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(MockSandboxRunner::new());
        let ctx = context(Language::C, SourceBundle::Files(files), SubmissionType::MultiFile);

        let output = create_stage(json!({"mode": "makefile"})).execute(&ctx, &sandbox).await.unwrap();

        assert_eq!(output.result.status, Status::Ce);
    }

    #[tokio::test]
    async fn test_multi_file_java_with_driver() {
        let mut files = BTreeMap::new();
        files.insert("Solver.java".to_string(), "class Solver { int solve() { return 1; } }".to_string());
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(compiling_sandbox());
        let ctx = context(Language::Java, SourceBundle::Files(files), SubmissionType::MultiFile);
        std::fs::create_dir_all(ctx.problem.asset("drivers")).unwrap();
        std::fs::write(
            ctx.problem.asset("drivers/Main.java"),
            "public class Main { public static void main(String[] a) {} }",
        )
        .unwrap();

        let output = create_stage(json!({"mode": "multi-file", "drivers": ["drivers/Main.java"]}))
            .execute(&ctx, &sandbox)
            .await
            .unwrap();

        assert_eq!(output.result.status, Status::Ac);
        let command = output.delta.executable.unwrap().command;
        assert_eq!(command[0], "java");
        assert_eq!(command.last().unwrap(), "Main");
        assert!(ctx.workspace.src_dir().join("Main.java").exists());
    }

    #[tokio::test]
    async fn test_unsafe_file_names_are_ce() {
        let mut files = BTreeMap::new();
        files.insert("../evil.c".to_string(), HELLO_C.to_string());
        let sandbox: Arc<dyn SandboxRunner> = Arc::new(MockSandboxRunner::new());
        let ctx = context(Language::C, SourceBundle::Files(files), SubmissionType::MultiFile);

        let output = create_stage(json!({})).execute(&ctx, &sandbox).await.unwrap();

        assert_eq!(output.result.status, Status::Ce);
    }

    #[test]
    fn test_merge_template_region_markers() {
        let template = "class Main {\n    // === STUDENT CODE BEGIN ===\n    int placeholder;\n    // === STUDENT CODE END ===\n}\n";
        let merged = merge_template(template, "    int solve() { return 42; }").unwrap();
        assert_eq!(
            merged,
            "class Main {\n    // === STUDENT CODE BEGIN ===\n    int solve() { return 42; }\n    // === STUDENT CODE END ===\n}\n"
        );
        assert!(merge_template("no markers here", "x").is_none());
    }

    #[test]
    fn test_merge_template_python_marker() {
        let merged = merge_template("# STUDENT_CODE_HERE\nprint(f(2))\n", "def f(x):\n    return x * 2").unwrap();
        assert!(merged.starts_with("def f(x):"));
    }

    #[test]
    fn test_defines_main_ignores_comments() {
        assert!(defines_main("int main(void) { return 0; }", &Language::C));
        assert!(!defines_main("/* int main() */ int helper(void);", &Language::C));
        assert!(defines_main("if __name__ == '__main__':\n    run()", &Language::Python));
        assert!(!defines_main("def solve():\n    pass", &Language::Python));
    }

    #[test]
    fn test_config_validation() {
        assert!(CompileStage::validate_config(&json!({"mode": "function-only"})).is_err());
        assert!(CompileStage::validate_config(&json!({"mode": "cmake"})).is_err());
        assert!(CompileStage::validate_config(&json!({"drivers": ["../x.c"]})).is_err());
        assert!(CompileStage::validate_config(&json!({"executable": "a/b"})).is_err());
        assert!(CompileStage::validate_config(&serde_json::Value::Null).is_ok());
    }
}
