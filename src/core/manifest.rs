//! Test-data manifest: the ordered list of cases of a problem together with
//! their limits and point allocation.
//!
//! The manifest is shipped as `manifest.json` next to the case files:
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "defaultTimeLimitMs": 1000,
//!   "defaultMemoryLimitKb": 262144,
//!   "cases": [
//!     { "name": "Sample 1", "inputFile": "input/01.in", "outputFile": "output/01.out",
//!       "points": 50, "isSample": true }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::constants::{
    DEFAULT_MEMORY_LIMIT_KB, DEFAULT_TIME_LIMIT_MS, MANIFEST_FILE, MIN_MEMORY_LIMIT_KB,
    MIN_TIME_LIMIT_MS,
};
use crate::core::domain::ExecutionLimits;
use crate::core::errors::ManifestError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(deserialize_with = "version_string")]
    pub version: String,
    #[serde(default = "default_time_limit_ms")]
    pub default_time_limit_ms: u64,
    #[serde(default = "default_memory_limit_kb")]
    pub default_memory_limit_kb: u64,
    pub cases: Vec<Case>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    pub name: String,
    pub input_file: String,
    pub output_file: String,
    pub points: u32,
    #[serde(default)]
    pub is_sample: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_kb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask: Option<String>,
}

impl Case {
    /// Subtask this case belongs to: the explicit `subtask` field, otherwise
    /// the id of a `Subtask <id> ...` style name.
    pub fn subtask_id(&self) -> Option<String> {
        if let Some(subtask) = &self.subtask {
            return Some(subtask.clone());
        }
        let rest = self.name.strip_prefix("Subtask")?;
        let id: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if id.is_empty() || rest.len() == rest.trim_start().len() {
            return None;
        }
        Some(id)
    }
}

fn default_time_limit_ms() -> u64 {
    DEFAULT_TIME_LIMIT_MS
}

fn default_memory_limit_kb() -> u64 {
    DEFAULT_MEMORY_LIMIT_KB
}

fn version_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Version {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Version::deserialize(deserializer)? {
        Version::Text(text) => text,
        Version::Number(number) => {
            let text = number.to_string();
            if text.contains('.') { text } else { format!("{text}.0") }
        }
    })
}

impl Manifest {
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads `manifest.json` from a problem directory.
    pub async fn load(dir: &Path) -> Result<Self, ManifestError> {
        let json = tokio::fs::read_to_string(dir.join(MANIFEST_FILE)).await?;
        Self::from_json(&json)
    }

    pub fn total_points(&self) -> u32 {
        self.cases.iter().map(|case| case.points).sum()
    }

    pub fn has_subtasks(&self) -> bool {
        self.cases.iter().any(|case| case.subtask_id().is_some())
    }

    /// Per-case limits, falling back to the manifest defaults.
    pub fn effective_limits(&self, case: &Case) -> ExecutionLimits {
        ExecutionLimits {
            time_ms: Some(case.time_limit_ms.unwrap_or(self.default_time_limit_ms)),
            memory_kb: Some(case.memory_limit_kb.unwrap_or(self.default_memory_limit_kb)),
            output_bytes: None,
        }
    }

    /// Checks structural invariants. When `expected_total` is given the
    /// case points must add up to it exactly.
    pub fn validate(&self, expected_total: Option<u32>) -> Result<(), ManifestError> {
        let version_ok = self
            .version
            .strip_prefix("1.")
            .is_some_and(|minor| !minor.is_empty() && minor.chars().all(|c| c.is_ascii_digit()));
        if !version_ok {
            return Err(ManifestError::Version {
                version: self.version.clone(),
            });
        }
        if self.cases.is_empty() {
            return Err(ManifestError::NoCases);
        }
        if self.default_time_limit_ms < MIN_TIME_LIMIT_MS {
            return Err(ManifestError::InvalidDefault {
                field: "defaultTimeLimitMs",
                value: self.default_time_limit_ms,
            });
        }
        if self.default_memory_limit_kb < MIN_MEMORY_LIMIT_KB {
            return Err(ManifestError::InvalidDefault {
                field: "defaultMemoryLimitKb",
                value: self.default_memory_limit_kb,
            });
        }

        let mut seen = HashSet::new();
        for (index, case) in self.cases.iter().enumerate() {
            validate_case(index, case)?;
            for file in [&case.input_file, &case.output_file] {
                if !seen.insert(file.as_str()) {
                    return Err(ManifestError::DuplicateFile {
                        index,
                        file: file.clone(),
                    });
                }
            }
        }

        if let Some(expected) = expected_total {
            let actual = self.total_points();
            if actual != expected {
                return Err(ManifestError::PointsMismatch { expected, actual });
            }
        }
        Ok(())
    }
}

fn validate_case(index: usize, case: &Case) -> Result<(), ManifestError> {
    let invalid = |msg: String| ManifestError::InvalidCase { index, msg };

    if case.name.trim().is_empty() {
        return Err(invalid("name must not be empty".to_string()));
    }
    for file in [&case.input_file, &case.output_file] {
        if !is_safe_relative_path(file) {
            return Err(invalid(format!("`{file}` is not a safe relative path")));
        }
    }
    if let Some(time) = case.time_limit_ms.filter(|t| *t < MIN_TIME_LIMIT_MS) {
        return Err(invalid(format!("timeLimitMs {time} is below {MIN_TIME_LIMIT_MS}")));
    }
    if let Some(memory) = case.memory_limit_kb.filter(|m| *m < MIN_MEMORY_LIMIT_KB) {
        return Err(invalid(format!(
            "memoryLimitKb {memory} is below {MIN_MEMORY_LIMIT_KB}"
        )));
    }
    Ok(())
}

pub(crate) fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/' | '.'))
        && path.split('/').all(|segment| segment != "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "version": "1.0",
        "defaultTimeLimitMs": 1000,
        "defaultMemoryLimitKb": 262144,
        "cases": [
            {"name": "Sample 1", "inputFile": "input/01.in", "outputFile": "output/01.out",
             "points": 40, "isSample": true},
            {"name": "Subtask 2 - Case 1", "inputFile": "input/02.in", "outputFile": "output/02.out",
             "points": 30, "isSample": false, "timeLimitMs": 2000},
            {"name": "Hidden", "inputFile": "input/03.in", "outputFile": "output/03.out",
             "points": 30, "isSample": false, "memoryLimitKb": 65536, "subtask": "big"}
        ]
    }"#;

    fn create_manifest() -> Manifest {
        Manifest::from_json(MANIFEST).unwrap()
    }

    #[test]
    fn test_points_sum_to_problem_total() {
        let manifest = create_manifest();
        assert_eq!(manifest.total_points(), 100);
        assert!(manifest.validate(Some(100)).is_ok());
        assert!(matches!(
            manifest.validate(Some(120)),
            Err(ManifestError::PointsMismatch {
                expected: 120,
                actual: 100
            })
        ));
    }

    #[test]
    fn test_effective_limits_fall_back_to_defaults() {
        let manifest = create_manifest();
        let first = manifest.effective_limits(&manifest.cases[0]);
        assert_eq!(first.time_ms, Some(1000));
        assert_eq!(first.memory_kb, Some(262144));

        let second = manifest.effective_limits(&manifest.cases[1]);
        assert_eq!(second.time_ms, Some(2000));

        let third = manifest.effective_limits(&manifest.cases[2]);
        assert_eq!(third.memory_kb, Some(65536));
    }

    #[test]
    fn test_subtask_ids() {
        let manifest = create_manifest();
        let ids: Vec<_> = manifest.cases.iter().map(|c| c.subtask_id()).collect();
        assert_eq!(ids, vec![None, Some("2".to_string()), Some("big".to_string())]);
        assert!(manifest.has_subtasks());
    }

    #[test]
    fn test_subtask_prefix_needs_separator() {
        let case = Case {
            name: "Subtasks overview".to_string(),
            input_file: "a.in".to_string(),
            output_file: "a.out".to_string(),
            points: 0,
            is_sample: false,
            time_limit_ms: None,
            memory_limit_kb: None,
            subtask: None,
        };
        assert_eq!(case.subtask_id(), None);
    }

    #[test]
    fn test_duplicate_files_rejected() {
        let mut manifest = create_manifest();
        manifest.cases[1].input_file = "output/01.out".to_string();
        assert!(matches!(
            manifest.validate(None),
            Err(ManifestError::DuplicateFile { index: 1, .. })
        ));
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        let mut manifest = create_manifest();
        manifest.cases[0].input_file = "../secret".to_string();
        assert!(matches!(
            manifest.validate(None),
            Err(ManifestError::InvalidCase { index: 0, .. })
        ));
    }

    #[test]
    fn test_version_and_limits() {
        let mut manifest = create_manifest();
        manifest.version = "2.0".to_string();
        assert!(matches!(manifest.validate(None), Err(ManifestError::Version { .. })));

        let mut manifest = create_manifest();
        manifest.cases[0].time_limit_ms = Some(10);
        assert!(manifest.validate(None).is_err());

        let mut manifest = create_manifest();
        manifest.cases.clear();
        assert!(matches!(manifest.validate(None), Err(ManifestError::NoCases)));
    }

    #[test]
    fn test_numeric_version_accepted() {
        let json = MANIFEST.replace(r#""version": "1.0""#, r#""version": 1"#);
        let manifest = Manifest::from_json(&json).unwrap();
        assert_eq!(manifest.version, "1.0");
        assert!(manifest.validate(None).is_ok());
    }
}
