use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Language {
    C,
    Cpp,
    Java,
    Python,
}

impl Language {
    /// File name the submission is stored under when it is a single source file.
    pub fn source_file_name(&self) -> &'static str {
        match self {
            Language::C => "main.c",
            Language::Cpp => "main.cpp",
            Language::Java => "Main.java",
            Language::Python => "main.py",
        }
    }

    /// Extensions of files handed to the compiler (headers excluded).
    pub fn compiled_extensions(&self) -> &'static [&'static str] {
        match self {
            Language::C => &["c"],
            Language::Cpp => &["cpp", "cc", "cxx"],
            Language::Java => &["java"],
            Language::Python => &["py"],
        }
    }

    pub fn uses_c_comments(&self) -> bool {
        !matches!(self, Language::Python)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::C => "C",
            Language::Cpp => "CPP",
            Language::Java => "JAVA",
            Language::Python => "PYTHON",
        };
        f.write_str(name)
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c" => Ok(Language::C),
            "cpp" | "c++" | "cxx" => Ok(Language::Cpp),
            "java" => Ok(Language::Java),
            "python" | "py" | "python3" => Ok(Language::Python),
            other => Err(format!("unsupported language: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionType {
    #[default]
    SingleFile,
    FunctionOnly,
    MultiFile,
}

impl FromStr for SubmissionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "single-file" | "single" => Ok(SubmissionType::SingleFile),
            "function-only" | "function" => Ok(SubmissionType::FunctionOnly),
            "multi-file" | "multi" => Ok(SubmissionType::MultiFile),
            other => Err(format!("unsupported submission type: {other}")),
        }
    }
}

/// Submitted code: either one source text or an already extracted archive
/// of named files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceBundle {
    Single(String),
    Files(BTreeMap<String, String>),
}

impl SourceBundle {
    pub fn files(&self, language: &Language) -> Vec<(String, &str)> {
        match self {
            SourceBundle::Single(code) => vec![(language.source_file_name().to_string(), code)],
            SourceBundle::Files(files) => files
                .iter()
                .map(|(name, code)| (name.clone(), code.as_str()))
                .collect(),
        }
    }

    pub fn contains_file(&self, name: &str) -> bool {
        match self {
            SourceBundle::Single(_) => false,
            SourceBundle::Files(files) => files.contains_key(name),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Ac,
    Wa,
    Tle,
    Mle,
    Re,
    Ole,
    Ce,
    Sa,
    Pa,
    JudgeError,
}

impl Status {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Status::Ac)
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Pending
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Status::Pending => "PENDING",
            Status::Ac => "AC",
            Status::Wa => "WA",
            Status::Tle => "TLE",
            Status::Mle => "MLE",
            Status::Re => "RE",
            Status::Ole => "OLE",
            Status::Ce => "CE",
            Status::Sa => "SA",
            Status::Pa => "PA",
            Status::JudgeError => "JUDGE_ERROR",
        };
        f.write_str(code)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageType {
    StaticAnalysis,
    Compile,
    Execute,
    Interactive,
    Check,
    Scoring,
    Custom,
}

impl StageType {
    /// Whether a completed stage of this type decides the submission status.
    pub fn sets_terminal_status(&self) -> bool {
        matches!(
            self,
            StageType::Interactive | StageType::Check | StageType::Scoring | StageType::Custom
        )
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageType::StaticAnalysis => "STATIC_ANALYSIS",
            StageType::Compile => "COMPILE",
            StageType::Execute => "EXECUTE",
            StageType::Interactive => "INTERACTIVE",
            StageType::Check => "CHECK",
            StageType::Scoring => "SCORING",
            StageType::Custom => "CUSTOM",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage_type: StageType,
    pub status: Status,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub should_abort: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_kb: Option<u64>,
}

impl StageResult {
    pub fn passed(stage_type: StageType, message: impl Into<String>) -> Self {
        Self {
            stage_type,
            status: Status::Ac,
            details: serde_json::Value::Null,
            stderr: None,
            should_abort: false,
            message: message.into(),
            time_ms: None,
            memory_kb: None,
        }
    }

    pub fn with_status(stage_type: StageType, status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            ..Self::passed(stage_type, message)
        }
    }

    /// A result that stops the pipeline with the given status.
    pub fn aborted(stage_type: StageType, status: Status, message: impl Into<String>) -> Self {
        Self {
            should_abort: true,
            ..Self::with_status(stage_type, status, message)
        }
    }

    pub fn judge_error(stage_type: StageType, message: impl Into<String>) -> Self {
        Self::aborted(stage_type, Status::JudgeError, message)
    }

    pub fn details(self, details: serde_json::Value) -> Self {
        Self { details, ..self }
    }

    pub fn stderr(self, stderr: impl Into<String>) -> Self {
        Self {
            stderr: Some(stderr.into()),
            ..self
        }
    }

    pub fn resources(self, time_ms: Option<u64>, memory_kb: Option<u64>) -> Self {
        Self {
            time_ms,
            memory_kb,
            ..self
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseResult {
    /// 1-based position of the case in the manifest.
    pub case_no: usize,
    pub name: String,
    pub status: Status,
    pub time_ms: u64,
    pub memory_kb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_trunc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_trunc: Option<String>,
    pub points: u32,
    pub is_sample: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip)]
    pub stdout: String,
    #[serde(skip)]
    pub artifacts: BTreeMap<String, Vec<u8>>,
}

impl CaseResult {
    pub fn change_status(&self, status: Status, message: Option<String>) -> Self {
        Self {
            status,
            message,
            ..self.clone()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub line: usize,
    pub column: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Command line that starts the compiled submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executable {
    pub command: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLimits {
    pub time_ms: Option<u64>,
    pub memory_kb: Option<u64>,
    pub output_bytes: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub total_stages: usize,
    pub completed_stages: usize,
    pub aborted: bool,
}

/// Outcome of one judging pass as exposed to persistence and UI.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalVerdict {
    pub status: Status,
    pub score: Option<f64>,
    pub stage_results: Vec<StageResult>,
    pub cases: Vec<CaseResult>,
    pub summary: ExecutionSummary,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: Uuid,
    pub problem_id: String,
    pub language: Language,
    pub submission_type: SubmissionType,
    pub source: SourceBundle,
    pub job_dir: PathBuf,
    pub submitted_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub status: Status,
    pub score: Option<f64>,
    pub stage_results: Vec<StageResult>,
    pub cases: Vec<CaseResult>,
}

impl Submission {
    pub fn new(
        problem_id: impl Into<String>,
        language: Language,
        submission_type: SubmissionType,
        source: SourceBundle,
        job_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            problem_id: problem_id.into(),
            language,
            submission_type,
            source,
            job_dir: job_dir.into(),
            submitted_at: Utc::now(),
            deadline: None,
            status: Status::Pending,
            score: None,
            stage_results: Vec::new(),
            cases: Vec::new(),
        }
    }

    pub fn with_deadline(self, deadline: DateTime<Utc>) -> Self {
        Self {
            deadline: Some(deadline),
            ..self
        }
    }

    pub fn with_verdict(&self, verdict: &FinalVerdict) -> Self {
        Self {
            status: verdict.status,
            score: verdict.score,
            stage_results: verdict.stage_results.clone(),
            cases: verdict.cases.clone(),
            ..self.clone()
        }
    }

    /// Fresh judging pass of the same code in a new job directory.
    pub fn rejudge(&self, job_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_dir: job_dir.into(),
            status: Status::Pending,
            score: None,
            stage_results: Vec::new(),
            cases: Vec::new(),
            ..self.clone()
        }
    }
}

/// Cuts `text` to at most `max_bytes`, on a char boundary, marking the cut.
pub fn truncate_text(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated)", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_as_verdict_codes() {
        let json = serde_json::to_string(&vec![Status::Ac, Status::JudgeError, Status::Ole]).unwrap();
        assert_eq!(json, r#"["AC","JUDGE_ERROR","OLE"]"#);
    }

    #[test]
    fn test_truncate_text_respects_char_boundary() {
        let text = "ab日本";
        let cut = truncate_text(text, 3);
        assert!(cut.starts_with("ab\n"));
        assert_eq!(truncate_text("short", 10), "short");
    }

    #[test]
    fn test_rejudge_resets_judging_state() {
        let submission = Submission::new(
            "p1",
            Language::C,
            SubmissionType::SingleFile,
            SourceBundle::Single("int main(){}".to_string()),
            "/tmp/job-a",
        );
        let verdict = FinalVerdict {
            status: Status::Ce,
            score: None,
            stage_results: vec![StageResult::aborted(StageType::Compile, Status::Ce, "failed")],
            cases: vec![],
            summary: ExecutionSummary {
                total_stages: 1,
                completed_stages: 1,
                aborted: true,
            },
        };
        let judged = submission.with_verdict(&verdict);
        assert_eq!(judged.status, Status::Ce);

        let again = judged.rejudge("/tmp/job-b");
        assert_eq!(again.status, Status::Pending);
        assert!(again.stage_results.is_empty());
        assert_ne!(again.id, judged.id);
    }

    #[test]
    fn test_language_parsing() {
        assert_eq!("c++".parse::<Language>().unwrap(), Language::Cpp);
        assert_eq!("PYTHON".parse::<Language>().unwrap(), Language::Python);
        assert!("rust".parse::<Language>().is_err());
    }
}
