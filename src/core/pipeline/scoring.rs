use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::{
    domain::{CaseResult, StageResult, StageType},
    errors::{ConfigError, StageError},
    pipeline::{
        StageOutput,
        context::{ContextDelta, PipelineContext},
        overall_status, parse_config,
    },
};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoringMode {
    #[default]
    Sum,
    /// A subtask earns its points only when all of its cases pass.
    #[serde(alias = "all-or-nothing")]
    Subtask,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PenaltyRule {
    LateSubmission {
        percent_per_day: f64,
        #[serde(default = "full_percent")]
        max_percent: f64,
    },
    TimeUsage {
        threshold_ms: u64,
        percent: f64,
    },
    MemoryUsage {
        threshold_kb: u64,
        percent: f64,
    },
}

fn full_percent() -> f64 {
    100.0
}

impl PenaltyRule {
    fn name(&self) -> &'static str {
        match self {
            PenaltyRule::LateSubmission { .. } => "late-submission",
            PenaltyRule::TimeUsage { .. } => "time-usage",
            PenaltyRule::MemoryUsage { .. } => "memory-usage",
        }
    }

    /// Percentage of the raw score this rule takes away.
    fn percent(&self, ctx: &PipelineContext, cases: &[CaseResult]) -> f64 {
        match self {
            PenaltyRule::LateSubmission {
                percent_per_day,
                max_percent,
            } => {
                let Some(deadline) = ctx.submission.deadline else {
                    return 0.0;
                };
                let late_seconds = (ctx.submission.submitted_at - deadline).num_seconds();
                if late_seconds <= 0 {
                    return 0.0;
                }
                let days = (late_seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY;
                (days as f64 * percent_per_day).min(*max_percent)
            }
            PenaltyRule::TimeUsage { threshold_ms, percent } => {
                let slowest = cases.iter().map(|c| c.time_ms).max().unwrap_or_default();
                if slowest > *threshold_ms { *percent } else { 0.0 }
            }
            PenaltyRule::MemoryUsage { threshold_kb, percent } => {
                let largest = cases.iter().map(|c| c.memory_kb).max().unwrap_or_default();
                if largest > *threshold_kb { *percent } else { 0.0 }
            }
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScoringConfig {
    #[serde(default)]
    mode: ScoringMode,
    #[serde(default, alias = "penaltyRules")]
    penalties: Vec<PenaltyRule>,
}

#[derive(Debug)]
pub struct ScoringStage {
    config: ScoringConfig,
}

/// Cases without a subtask form a group of their own.
#[derive(Debug, PartialEq, Eq, Hash)]
enum Group<'a> {
    Subtask(&'a str),
    Case(usize),
}

impl ScoringStage {
    pub fn validate_config(config: &serde_json::Value) -> Result<Self, ConfigError> {
        let config: ScoringConfig = parse_config(StageType::Scoring, config)?;
        let valid_percent = |p: f64| (0.0..=100.0).contains(&p);
        for rule in &config.penalties {
            let ok = match rule {
                PenaltyRule::LateSubmission {
                    percent_per_day,
                    max_percent,
                } => valid_percent(*percent_per_day) && valid_percent(*max_percent),
                PenaltyRule::TimeUsage { percent, .. } | PenaltyRule::MemoryUsage { percent, .. } => {
                    valid_percent(*percent)
                }
            };
            if !ok {
                return Err(ConfigError::invalid(
                    StageType::Scoring,
                    format!("{} percentages must be within 0..=100", rule.name()),
                ));
            }
        }
        Ok(Self { config })
    }

    #[tracing::instrument(skip_all, fields(submission_id = %ctx.submission.id, mode = ?self.config.mode))]
    pub async fn execute(&self, ctx: &PipelineContext) -> Result<StageOutput, StageError> {
        let cases = match &ctx.cases {
            Some(cases) if !cases.is_empty() => cases,
            _ => {
                return Ok(StageResult::judge_error(StageType::Scoring, "no case results to score").into());
            }
        };

        let raw = match self.config.mode {
            ScoringMode::Sum => sum_score(cases),
            ScoringMode::Subtask => {
                if !ctx.manifest().has_subtasks() {
                    tracing::warn!("subtask scoring on a manifest without subtasks");
                }
                subtask_score(cases)
            }
        };
        let max_score: u32 = cases.iter().map(|c| c.points).sum();
        let status = overall_status(cases, raw);

        let mut score = raw;
        let mut deductions = Vec::new();
        for rule in &self.config.penalties {
            let percent = rule.percent(ctx, cases);
            if percent > 0.0 {
                let deducted = raw * percent / 100.0;
                score = (score - deducted).max(0.0);
                deductions.push(json!({ "type": rule.name(), "percent": percent, "deducted": round2(deducted) }));
            }
        }
        let score = round2(score);
        tracing::info!(%status, raw, score, "scored submission");

        let result = StageResult::with_status(
            StageType::Scoring,
            status,
            format!("scored {score} of {max_score}"),
        )
        .details(json!({
            "mode": self.config.mode,
            "rawScore": round2(raw),
            "finalScore": score,
            "maxScore": max_score,
            "penaltyApplied": !deductions.is_empty(),
            "penalties": deductions,
        }));

        Ok(StageOutput::with_delta(
            result,
            ContextDelta {
                score: Some(score),
                ..Default::default()
            },
        ))
    }
}

fn sum_score(cases: &[CaseResult]) -> f64 {
    cases
        .iter()
        .filter(|c| c.status.is_accepted())
        .map(|c| c.points as f64)
        .sum()
}

fn subtask_score(cases: &[CaseResult]) -> f64 {
    cases
        .iter()
        .into_group_map_by(|&c| match &c.subtask {
            Some(id) => Group::Subtask(id),
            None => Group::Case(c.case_no),
        })
        .values()
        .filter(|group| group.iter().all(|c| c.status.is_accepted()))
        .flat_map(|group| group.iter().map(|c| c.points as f64))
        .sum()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
