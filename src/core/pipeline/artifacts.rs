//! Files a run leaves behind in its case directory, picked up by exact path
//! or by glob pattern.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use tokio::io::AsyncReadExt;

use crate::core::manifest::is_safe_relative_path;

/// A case-relative artifact path. `*` and `?` stay inside one path
/// segment, `**` crosses directories.
#[derive(Clone, Debug)]
pub(crate) struct ArtifactPattern {
    pattern: String,
    matcher: Option<Regex>,
}

impl ArtifactPattern {
    pub fn parse(pattern: &str) -> Result<Self, String> {
        let literal = pattern.replace(['*', '?'], "x");
        if !is_safe_relative_path(&literal) {
            return Err(format!("artifact path `{pattern}` is not a safe relative path"));
        }
        let matcher = if literal == pattern {
            None
        } else {
            let matcher = glob_to_regex(pattern)
                .map_err(|e| format!("artifact pattern `{pattern}` is invalid: {e}"))?;
            Some(matcher)
        };
        Ok(Self {
            pattern: pattern.to_string(),
            matcher,
        })
    }

    fn is_glob(&self) -> bool {
        self.matcher.is_some()
    }

    fn matches(&self, relative: &str) -> bool {
        match &self.matcher {
            Some(matcher) => matcher.is_match(relative),
            None => relative == self.pattern,
        }
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    re.push_str("(?:[^/]+/)*");
                } else {
                    re.push_str(".*");
                }
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re)
}

#[derive(Debug, Default)]
pub(crate) struct Collected {
    pub files: BTreeMap<String, Vec<u8>>,
    /// Paths whose content was cut at the byte cap.
    pub truncated: Vec<String>,
}

/// Reads every file under `dir` that one of `patterns` names, keeping at
/// most `max_bytes` of each. Unreadable files are logged and skipped.
pub(crate) async fn collect(dir: &Path, patterns: &[ArtifactPattern], max_bytes: u64) -> Collected {
    let mut collected = Collected::default();
    if patterns.is_empty() {
        return collected;
    }

    let mut paths: Vec<String> = patterns
        .iter()
        .filter(|p| !p.is_glob())
        .map(|p| p.pattern.clone())
        .collect();
    if patterns.iter().any(ArtifactPattern::is_glob) {
        match list_files(dir).await {
            Ok(files) => paths.extend(
                files
                    .into_iter()
                    .filter(|file| patterns.iter().any(|p| p.is_glob() && p.matches(file))),
            ),
            Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "cannot list artifacts"),
        }
    }

    for path in paths {
        if collected.files.contains_key(&path) {
            continue;
        }
        match read_capped(&dir.join(&path), max_bytes).await {
            Ok((content, truncated)) => {
                if truncated {
                    tracing::warn!(path, max_bytes, "artifact truncated");
                    collected.truncated.push(path.clone());
                }
                collected.files.insert(path, content);
            }
            Err(e) => tracing::warn!(path, error = %e, "artifact not collected"),
        }
    }
    collected
}

async fn read_capped(path: &Path, max_bytes: u64) -> std::io::Result<(Vec<u8>, bool)> {
    let file = tokio::fs::File::open(path).await?;
    let mut content = Vec::new();
    file.take(max_bytes.saturating_add(1))
        .read_to_end(&mut content)
        .await?;
    let truncated = content.len() as u64 > max_bytes;
    content.truncate(max_bytes as usize);
    Ok((content, truncated))
}

/// Regular files under `root` as `/`-separated relative paths. Symlinks
/// are not followed.
async fn list_files(root: &Path) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let mut entries = tokio::fs::read_dir(root.join(&relative)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = relative.join(entry.file_name());
            let kind = entry.file_type().await?;
            if kind.is_dir() {
                pending.push(path);
            } else if kind.is_file() {
                files.push(path.to_string_lossy().into_owned());
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn create_patterns(patterns: &[&str]) -> Vec<ArtifactPattern> {
        patterns.iter().map(|p| ArtifactPattern::parse(p).unwrap()).collect()
    }

    fn write(dir: &TempDir, path: &str, content: &[u8]) {
        let path = dir.path().join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_glob_segments() {
        let star = ArtifactPattern::parse("out/*.txt").unwrap();
        assert!(star.matches("out/a.txt"));
        assert!(!star.matches("out/deep/a.txt"));
        assert!(!star.matches("out/a.txt.bak"));

        let deep = ArtifactPattern::parse("**/*.png").unwrap();
        assert!(deep.matches("plot.png"));
        assert!(deep.matches("figures/run/plot.png"));

        let single = ArtifactPattern::parse("log?.txt").unwrap();
        assert!(single.matches("log1.txt"));
        assert!(!single.matches("log12.txt"));
    }

    #[test]
    fn test_parse_rejects_escaping_patterns() {
        assert!(ArtifactPattern::parse("../*.txt").is_err());
        assert!(ArtifactPattern::parse("/tmp/*").is_err());
        assert!(ArtifactPattern::parse("out/[ab].txt").is_err());
        assert!(ArtifactPattern::parse("result.txt").is_ok());
    }

    #[tokio::test]
    async fn test_collects_glob_matches() {
        let dir = TempDir::new().unwrap();
        write(&dir, "out/a.csv", b"1");
        write(&dir, "out/b.csv", b"2");
        write(&dir, "out/notes.md", b"x");
        write(&dir, "main.py", b"print()");

        let collected = collect(dir.path(), &create_patterns(&["out/*.csv"]), 1024).await;

        let keys: Vec<&str> = collected.files.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["out/a.csv", "out/b.csv"]);
        assert!(collected.truncated.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_artifact_is_truncated() {
        let dir = TempDir::new().unwrap();
        write(&dir, "big.bin", &[7u8; 100]);
        write(&dir, "small.bin", b"ok");

        let collected = collect(dir.path(), &create_patterns(&["*.bin"]), 10).await;

        assert_eq!(collected.files["big.bin"], vec![7u8; 10]);
        assert_eq!(collected.files["small.bin"], b"ok");
        assert_eq!(collected.truncated, vec!["big.bin".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_literal_path_is_skipped() {
        let dir = TempDir::new().unwrap();
        write(&dir, "result.txt", b"42");

        let collected = collect(dir.path(), &create_patterns(&["result.txt", "missing.txt"]), 1024).await;

        assert_eq!(collected.files.len(), 1);
        assert_eq!(collected.files["result.txt"], b"42");
    }
}
