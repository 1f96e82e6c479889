//! Lexical screening of submitted source for forbidden constructs.
//!
//! This is a best-effort filter built on regular expressions, not a parser:
//! string and comment literals are blanked out before keyword scanning, but
//! an obfuscated submission can still slip through. Function and library
//! rules look at the source as written, keyword rules at the stripped text.
//!
//! Stripping keeps every byte offset and newline in place, so a match in
//! the stripped text reports the same line and column as in the original.

use std::sync::{Arc, LazyLock};

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::json;

use crate::core::{
    domain::{Language, Severity, StageResult, StageType, Status, Violation},
    errors::{ConfigError, StageError},
    pipeline::{
        StageOutput, compiling::write_submission_files,
        context::{ContextDelta, PipelineContext},
        parse_config,
    },
    traits::sandbox::SandboxRunner,
};

static C_LIKE_LITERALS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:[^"\\\n]|\\.)*"|'(?:[^'\\\n]|\\.)*'|/\*(?s:.*?)\*/|//[^\n]*"#)
        .expect("C literal pattern is valid")
});

static PYTHON_LITERALS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"'''(?s:.*?)'''|"""(?s:.*?)"""|'(?:[^'\\\n]|\\.)*'|"(?:[^"\\\n]|\\.)*"|#[^\n]*"#)
        .expect("Python literal pattern is valid")
});

static CLANG_DIAGNOSTIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(.+?):(\d+):(\d+):\s*(warning|error|note):\s*(.+)$")
        .expect("diagnostic pattern is valid")
});

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StaticAnalysisConfig {
    #[serde(default)]
    rules: Vec<RuleConfig>,
    #[serde(default = "fail_on_error_default")]
    fail_on_error: bool,
}

fn fail_on_error_default() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleConfig {
    #[serde(rename = "type")]
    kind: RuleKind,
    severity: Option<Severity>,
    message: Option<String>,
    #[serde(default, alias = "forbiddenFunctions")]
    functions: Vec<String>,
    #[serde(default, alias = "forbiddenLibraries")]
    libraries: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default, alias = "forbiddenPatterns")]
    patterns: Vec<PatternConfig>,
}

#[derive(Clone, Debug, Deserialize)]
struct PatternConfig {
    pattern: String,
    #[serde(default)]
    flags: String,
    message: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum RuleKind {
    ForbiddenFunction,
    ForbiddenLibrary,
    ForbiddenSyntax,
    ForbiddenKeyword,
    Linter,
}

impl RuleKind {
    fn name(&self) -> &'static str {
        match self {
            RuleKind::ForbiddenFunction => "forbidden-function",
            RuleKind::ForbiddenLibrary => "forbidden-library",
            RuleKind::ForbiddenSyntax => "forbidden-syntax",
            RuleKind::ForbiddenKeyword => "forbidden-keyword",
            RuleKind::Linter => "linter",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scope {
    Raw,
    Stripped,
}

#[derive(Debug)]
struct Probe {
    regex: Regex,
    scope: Scope,
    message: String,
    languages: Option<&'static [Language]>,
}

#[derive(Debug)]
struct CompiledRule {
    kind: RuleKind,
    severity: Severity,
    probes: Vec<Probe>,
}

#[derive(Debug)]
pub struct StaticAnalysisStage {
    rules: Vec<CompiledRule>,
    fail_on_error: bool,
}

impl StaticAnalysisStage {
    pub fn validate_config(config: &serde_json::Value) -> Result<Self, ConfigError> {
        let config: StaticAnalysisConfig = parse_config(StageType::StaticAnalysis, config)?;
        if config.rules.is_empty() {
            return Err(invalid("at least one rule is required"));
        }
        let rules = config
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| compile_rule(index, rule))
            .collect::<Result<Vec<_>, _>>()?;
        // One lint run covers the whole submission; a second rule could
        // only disagree with the first about severity.
        if rules.iter().filter(|rule| rule.kind == RuleKind::Linter).count() > 1 {
            return Err(invalid("at most one linter rule is allowed"));
        }

        Ok(Self {
            rules,
            fail_on_error: config.fail_on_error,
        })
    }

    #[tracing::instrument(skip_all, fields(submission_id = %ctx.submission.id))]
    pub async fn execute(
        &self,
        ctx: &PipelineContext,
        sandbox: &Arc<dyn SandboxRunner>,
    ) -> Result<StageOutput, StageError> {
        let language = ctx.submission.language;
        let files = ctx.submission.source.files(&language);
        let label_files = files.len() > 1;

        let mut violations = Vec::new();
        for (name, source) in &files {
            let stripped = strip_literals(source, &language);
            let file = label_files.then(|| name.clone());
            for rule in &self.rules {
                violations.extend(rule.scan(source, &stripped, &language, file.as_deref()));
            }
        }

        if let Some(rule) = self.rules.iter().find(|rule| rule.kind == RuleKind::Linter) {
            violations.extend(run_linter(ctx, sandbox, rule.severity).await?);
        }

        let error_count = count(&violations, Severity::Error);
        let warning_count = count(&violations, Severity::Warning);
        let details = json!({
            "violations": violations,
            "errorCount": error_count,
            "warningCount": warning_count,
        });
        tracing::info!(error_count, warning_count, "static analysis finished");

        let delta = ContextDelta {
            violations: Some(violations.clone()),
            ..Default::default()
        };

        let result = if error_count > 0 && self.fail_on_error {
            StageResult::aborted(
                StageType::StaticAnalysis,
                Status::Sa,
                format!("static analysis failed: {error_count} error(s), {warning_count} warning(s)"),
            )
            .details(details)
            .stderr(render_violations(&violations))
        } else if violations.is_empty() {
            StageResult::passed(StageType::StaticAnalysis, "static analysis passed").details(details)
        } else {
            StageResult::passed(
                StageType::StaticAnalysis,
                format!("static analysis passed with {error_count} error(s), {warning_count} warning(s)"),
            )
            .details(details)
        };

        Ok(StageOutput::with_delta(result, delta))
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::invalid(StageType::StaticAnalysis, msg)
}

fn compile_rule(index: usize, rule: &RuleConfig) -> Result<CompiledRule, ConfigError> {
    let severity = rule.severity.unwrap_or(match rule.kind {
        RuleKind::Linter => Severity::Warning,
        _ => Severity::Error,
    });
    let literal = |text: &str| -> Result<Regex, ConfigError> {
        Regex::new(text).map_err(|e| invalid(format!("rule {index}: {e}")))
    };
    let require = |items: usize, field: &str| -> Result<(), ConfigError> {
        if items == 0 {
            return Err(invalid(format!("rule {index} ({}) needs `{field}`", rule.kind.name())));
        }
        Ok(())
    };

    let mut probes = Vec::new();
    match rule.kind {
        RuleKind::ForbiddenFunction => {
            require(rule.functions.len(), "functions")?;
            for name in &rule.functions {
                probes.push(Probe {
                    regex: literal(&format!(r"\b{}\s*\(", regex::escape(name)))?,
                    scope: Scope::Raw,
                    message: format!("{}: {name}", rule.message.as_deref().unwrap_or("forbidden function")),
                    languages: None,
                });
            }
        }
        RuleKind::ForbiddenLibrary => {
            require(rule.libraries.len(), "libraries")?;
            let message = rule.message.as_deref().unwrap_or("forbidden library");
            for lib in &rule.libraries {
                let escaped = regex::escape(lib);
                probes.push(Probe {
                    regex: literal(&format!(r#"#include\s*[<"]{escaped}[>"]"#))?,
                    scope: Scope::Raw,
                    message: format!("{message}: {lib}"),
                    languages: Some(&[Language::C, Language::Cpp]),
                });
                probes.push(Probe {
                    regex: literal(&format!(r"(?m)^\s*(?:import|from)\s+{escaped}\b"))?,
                    scope: Scope::Raw,
                    message: format!("{message}: {lib}"),
                    languages: Some(&[Language::Python, Language::Java]),
                });
            }
        }
        RuleKind::ForbiddenSyntax => {
            require(rule.patterns.len(), "patterns")?;
            for pattern in &rule.patterns {
                probes.push(Probe {
                    regex: build_pattern(index, &pattern.pattern, &pattern.flags)?,
                    scope: Scope::Raw,
                    message: pattern
                        .message
                        .clone()
                        .or_else(|| rule.message.clone())
                        .unwrap_or_else(|| format!("forbidden syntax: {}", pattern.pattern)),
                    languages: None,
                });
            }
        }
        RuleKind::ForbiddenKeyword => {
            require(rule.keywords.len(), "keywords")?;
            for keyword in &rule.keywords {
                probes.push(Probe {
                    regex: literal(&format!(r"\b{}\b", regex::escape(keyword)))?,
                    scope: Scope::Stripped,
                    message: format!(
                        "{}: {keyword}",
                        rule.message.as_deref().unwrap_or("forbidden keyword")
                    ),
                    languages: None,
                });
            }
        }
        RuleKind::Linter => {}
    }

    Ok(CompiledRule {
        kind: rule.kind,
        severity,
        probes,
    })
}

/// Accepts the JavaScript-style flag letters instructors write. `g`, `u`
/// and `y` have no meaning for a scan that always finds every match.
fn build_pattern(index: usize, pattern: &str, flags: &str) -> Result<Regex, ConfigError> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            'g' | 'u' | 'y' => &mut builder,
            other => return Err(invalid(format!("rule {index}: unsupported regex flag `{other}`"))),
        };
    }
    builder
        .build()
        .map_err(|e| invalid(format!("rule {index}: {e}")))
}

impl CompiledRule {
    fn scan(&self, source: &str, stripped: &str, language: &Language, file: Option<&str>) -> Vec<Violation> {
        let mut violations = Vec::new();
        for probe in &self.probes {
            if probe.languages.is_some_and(|langs| !langs.contains(language)) {
                continue;
            }
            let haystack = match probe.scope {
                Scope::Raw => source,
                Scope::Stripped => stripped,
            };
            for found in probe.regex.find_iter(haystack) {
                let (line, column) = position(haystack, found.start());
                violations.push(Violation {
                    rule: self.kind.name().to_string(),
                    severity: self.severity,
                    message: probe.message.clone(),
                    line,
                    column,
                    symbol: None,
                    file: file.map(str::to_string),
                });
            }
        }
        violations
    }
}

/// Replaces string/char literals and comments with blanks, keeping newlines
/// and byte length unchanged.
pub fn strip_literals(source: &str, language: &Language) -> String {
    let pattern = if language.uses_c_comments() {
        &*C_LIKE_LITERALS
    } else {
        &*PYTHON_LITERALS
    };
    pattern
        .replace_all(source, |caps: &regex::Captures| blank(&caps[0]))
        .into_owned()
}

fn blank(text: &str) -> String {
    text.bytes()
        .map(|b| if b == b'\n' { '\n' } else { ' ' })
        .collect()
}

/// 1-based line and column of a byte offset.
fn position(text: &str, offset: usize) -> (usize, usize) {
    let before = &text.as_bytes()[..offset];
    let line = before.iter().filter(|b| **b == b'\n').count() + 1;
    let line_start = before
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    (line, offset - line_start + 1)
}

fn count(violations: &[Violation], severity: Severity) -> usize {
    violations.iter().filter(|v| v.severity == severity).count()
}

fn render_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| {
            let level = match v.severity {
                Severity::Error => "ERROR",
                Severity::Warning => "WARNING",
            };
            match &v.file {
                Some(file) => format!("[{level}] {file} Line {}: {}", v.line, v.message),
                None => format!("[{level}] Line {}: {}", v.line, v.message),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn run_linter(
    ctx: &PipelineContext,
    sandbox: &Arc<dyn SandboxRunner>,
    default_severity: Severity,
) -> Result<Vec<Violation>, StageError> {
    let language = ctx.submission.language;
    if language == Language::Java {
        tracing::debug!("no linter configured for Java, skipping");
        return Ok(Vec::new());
    }

    write_submission_files(ctx).await?;
    let lint = sandbox.lint(ctx.workspace.root(), &language).await?;
    Ok(match language {
        Language::Python => parse_pylint(&lint.output, default_severity),
        _ => parse_clang_diagnostics(&lint.output, default_severity),
    })
}

#[derive(Debug, Deserialize)]
struct PylintMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
    #[serde(rename = "message-id", default)]
    message_id: Option<String>,
    line: Option<usize>,
    column: Option<usize>,
    symbol: Option<String>,
}

fn parse_pylint(output: &str, default_severity: Severity) -> Vec<Violation> {
    let output = output.trim();
    if output.is_empty() {
        return Vec::new();
    }
    let messages: Vec<PylintMessage> = match serde_json::from_str(output) {
        Ok(messages) => messages,
        Err(e) => {
            tracing::warn!(error = %e, "linter output is not valid JSON, ignoring it");
            return Vec::new();
        }
    };

    messages
        .into_iter()
        .map(|item| Violation {
            rule: RuleKind::Linter.name().to_string(),
            severity: match item.kind.as_str() {
                "error" | "fatal" => Severity::Error,
                _ => default_severity,
            },
            message: match item.message_id {
                Some(id) => format!("{} ({id})", item.message),
                None => item.message,
            },
            line: item.line.unwrap_or(0),
            column: item.column.map(|c| c + 1).unwrap_or(0),
            symbol: item.symbol,
            file: None,
        })
        .collect()
}

fn parse_clang_diagnostics(output: &str, default_severity: Severity) -> Vec<Violation> {
    CLANG_DIAGNOSTIC
        .captures_iter(output)
        .filter(|caps| &caps[4] != "note")
        .map(|caps| Violation {
            rule: RuleKind::Linter.name().to_string(),
            severity: if &caps[4] == "error" {
                Severity::Error
            } else {
                default_severity
            },
            message: caps[5].trim().to_string(),
            line: caps[2].parse().unwrap_or(0),
            column: caps[3].parse().unwrap_or(0),
            symbol: None,
            file: std::path::Path::new(&caps[1])
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
        })
        .collect()
}
