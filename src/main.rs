use std::collections::BTreeMap;
use std::panic;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use judge_pipeline::config::JudgeConfig;
use judge_pipeline::core::{
    domain::{Language, SourceBundle, Submission, SubmissionType},
    manifest::Manifest,
    pipeline::{
        context::{PipelineConfig, Problem},
        orchestrator::Orchestrator,
    },
};
use judge_pipeline::native::LocalSandbox;

/// Judges one submission against a problem directory and prints the
/// verdict as JSON.
#[derive(Debug, Parser)]
#[command(name = "judge", version)]
struct Cli {
    /// Source file, or a directory of files for multi-file submissions.
    #[arg(long)]
    source: PathBuf,
    #[arg(long)]
    language: Language,
    #[arg(long, default_value = "single-file")]
    submission_type: SubmissionType,
    /// Directory holding manifest.json, pipeline.json and the case files.
    #[arg(long)]
    problem_dir: PathBuf,
    /// Points the manifest must add up to.
    #[arg(long)]
    total_points: Option<u32>,
    /// RFC 3339 deadline, used by late-submission penalties.
    #[arg(long)]
    deadline: Option<DateTime<Utc>>,
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    set_panic_hook();

    let config = JudgeConfig::from_env().context("invalid judge environment")?;
    let manifest = Manifest::load(&cli.problem_dir)
        .await
        .with_context(|| format!("cannot load manifest from {}", cli.problem_dir.display()))?;
    manifest
        .validate(cli.total_points)
        .context("manifest rejected")?;
    let pipeline = PipelineConfig::load(&cli.problem_dir)
        .await
        .context("cannot load pipeline")?;

    let problem = Problem {
        id: cli
            .problem_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "problem".to_string()),
        total_points: cli.total_points.or(Some(manifest.total_points())),
        manifest,
        pipeline,
        assets_dir: std::path::absolute(&cli.problem_dir)?,
    };

    let source = read_source(&cli.source).await?;
    let submission_type = match (&source, cli.submission_type) {
        (SourceBundle::Files(_), SubmissionType::SingleFile) => SubmissionType::MultiFile,
        (_, submission_type) => submission_type,
    };
    let submission = Submission::new(
        problem.id.clone(),
        cli.language,
        submission_type,
        source,
        PathBuf::new(),
    );
    let submission = Submission {
        job_dir: config.work_dir.join(submission.id.to_string()),
        deadline: cli.deadline,
        ..submission
    };
    tracing::info!(
        submission_id = %submission.id,
        job_dir = %submission.job_dir.display(),
        "judging submission"
    );

    let verdict = Orchestrator::new(Arc::new(LocalSandbox::new()))
        .with_config(config)
        .run(&submission, &problem)
        .await;

    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(())
}

async fn read_source(path: &Path) -> anyhow::Result<SourceBundle> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    if !metadata.is_dir() {
        let code = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        return Ok(SourceBundle::Single(code));
    }

    let mut files = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let code = tokio::fs::read_to_string(entry.path())
            .await
            .with_context(|| format!("cannot read {}", entry.path().display()))?;
        files.insert(entry.file_name().to_string_lossy().into_owned(), code);
    }
    Ok(SourceBundle::Files(files))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
