//! Fixtures shared by the stage tests.

use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::JudgeConfig;
use crate::core::{
    domain::{CaseResult, Language, SourceBundle, Status, Submission, SubmissionType},
    manifest::{Case, Manifest},
    pipeline::context::{PipelineConfig, PipelineContext, Problem},
};

pub fn unique_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}_{}", Uuid::new_v4()))
}

pub fn create_manifest(points: &[u32]) -> Manifest {
    Manifest {
        version: "1.0".to_string(),
        default_time_limit_ms: 1000,
        default_memory_limit_kb: 65536,
        cases: points
            .iter()
            .enumerate()
            .map(|(i, points)| Case {
                name: format!("Case {}", i + 1),
                input_file: format!("input/{:02}.in", i + 1),
                output_file: format!("output/{:02}.out", i + 1),
                points: *points,
                is_sample: i == 0,
                time_limit_ms: None,
                memory_limit_kb: None,
                subtask: None,
            })
            .collect(),
    }
}

/// Writes the case files of `manifest` into a fresh assets directory.
/// `files[i]` holds the (input, expected output) of case `i`.
pub fn create_assets(manifest: &Manifest, files: &[(&str, &str)]) -> PathBuf {
    let dir = unique_dir("judge_assets");
    for (case, (input, output)) in manifest.cases.iter().zip(files) {
        let input_path = dir.join(&case.input_file);
        let output_path = dir.join(&case.output_file);
        std::fs::create_dir_all(input_path.parent().unwrap()).unwrap();
        std::fs::create_dir_all(output_path.parent().unwrap()).unwrap();
        std::fs::write(input_path, input).unwrap();
        std::fs::write(output_path, output).unwrap();
    }
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn create_problem(manifest: Manifest, assets_dir: PathBuf) -> Problem {
    Problem {
        id: "problem-1".to_string(),
        total_points: Some(manifest.total_points()),
        manifest,
        pipeline: PipelineConfig::default(),
        assets_dir,
    }
}

pub fn create_submission(language: Language, source: SourceBundle) -> Submission {
    let submission_type = match source {
        SourceBundle::Single(_) => SubmissionType::SingleFile,
        SourceBundle::Files(_) => SubmissionType::MultiFile,
    };
    Submission::new("problem-1", language, submission_type, source, unique_dir("judge_job"))
}

pub fn context_for(submission: Submission, problem: Problem) -> PipelineContext {
    PipelineContext::new(
        Arc::new(submission),
        Arc::new(problem),
        Arc::new(JudgeConfig::default()),
    )
}

pub fn create_context(language: Language, source: SourceBundle) -> PipelineContext {
    let manifest = create_manifest(&[]);
    let problem = create_problem(manifest, unique_dir("judge_assets"));
    context_for(create_submission(language, source), problem)
}

pub fn create_case_result(case_no: usize, status: Status, points: u32) -> CaseResult {
    CaseResult {
        case_no,
        name: format!("Case {case_no}"),
        status,
        time_ms: 10,
        memory_kb: 1024,
        points,
        is_sample: case_no == 1,
        ..Default::default()
    }
}
