//! Extension point for stages that are not built in. They are registered
//! by name and picked through the `name` field of a `CUSTOM` stage config.

use std::sync::Arc;

use dashmap::DashMap;

use crate::core::{
    domain::StageType,
    errors::{ConfigError, StageError},
    pipeline::{StageOutput, context::PipelineContext},
};

#[mockall::automock]
#[async_trait::async_trait]
pub trait CustomStage: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn validate_config(&self, config: &serde_json::Value) -> Result<(), ConfigError>;

    async fn execute(
        &self,
        ctx: &PipelineContext,
        config: &serde_json::Value,
    ) -> Result<StageOutput, StageError>;
}

#[derive(Debug, Default)]
pub struct StageRegistry {
    stages: DashMap<String, Arc<dyn CustomStage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `stage` under its own name, replacing an earlier one.
    pub fn register(&self, stage: Arc<dyn CustomStage>) {
        tracing::debug!(name = stage.name(), "registered custom stage");
        self.stages.insert(stage.name().to_string(), stage);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    pub fn resolve(&self, config: &serde_json::Value) -> Result<CustomStageCall, ConfigError> {
        let name = config
            .get("name")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ConfigError::invalid(StageType::Custom, "missing stage `name`"))?;
        let stage = self
            .stages
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ConfigError::UnknownCustomStage {
                name: name.to_string(),
            })?;
        stage.validate_config(config)?;
        Ok(CustomStageCall {
            stage,
            config: config.clone(),
        })
    }
}

/// A registered stage bound to the config it was validated with.
#[derive(Debug)]
pub struct CustomStageCall {
    stage: Arc<dyn CustomStage>,
    config: serde_json::Value,
}

impl CustomStageCall {
    pub fn name(&self) -> &str {
        self.stage.name()
    }

    pub async fn execute(&self, ctx: &PipelineContext) -> Result<StageOutput, StageError> {
        tracing::info!(name = self.stage.name(), "running custom stage");
        self.stage.execute(ctx, &self.config).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::{
        domain::{Language, SourceBundle, StageResult, Status},
        pipeline::testing::create_context,
    };

    fn create_custom_stage(name: &'static str) -> MockCustomStage {
        let mut stage = MockCustomStage::new();
        stage.expect_name().return_const(name.to_string());
        stage
    }

    #[test]
    fn test_resolve_by_name() {
        let mut stage = create_custom_stage("plagiarism");
        stage.expect_validate_config().returning(|_| Ok(()));
        let registry = StageRegistry::new();
        registry.register(Arc::new(stage));

        let call = registry.resolve(&json!({"name": "plagiarism", "threshold": 0.8})).unwrap();

        assert_eq!(call.name(), "plagiarism");
        assert!(registry.contains("plagiarism"));
    }

    #[test]
    fn test_unknown_or_missing_name() {
        let registry = StageRegistry::new();

        assert!(matches!(
            registry.resolve(&json!({"name": "nope"})),
            Err(ConfigError::UnknownCustomStage { .. })
        ));
        assert!(matches!(
            registry.resolve(&json!({})),
            Err(ConfigError::Invalid { stage: StageType::Custom, .. })
        ));
    }

    #[test]
    fn test_stage_config_validation_is_applied() {
        let mut stage = create_custom_stage("strict");
        stage
            .expect_validate_config()
            .returning(|_| Err(ConfigError::invalid(StageType::Custom, "bad threshold")));
        let registry = StageRegistry::new();
        registry.register(Arc::new(stage));

        assert!(registry.resolve(&json!({"name": "strict"})).is_err());
    }

    #[tokio::test]
    async fn test_call_passes_bound_config() {
        let mut stage = create_custom_stage("review");
        stage.expect_validate_config().returning(|_| Ok(()));
        stage
            .expect_execute()
            .withf(|_, config| config["weight"] == 2)
            .times(1)
            .returning(|_, _| {
                Ok(StageResult::with_status(StageType::Custom, Status::Wa, "rejected by review").into())
            });
        let registry = StageRegistry::new();
        registry.register(Arc::new(stage));
        let call = registry.resolve(&json!({"name": "review", "weight": 2})).unwrap();
        let ctx = create_context(Language::C, SourceBundle::Single(String::new()));

        let output = call.execute(&ctx).await.unwrap();

        assert_eq!(output.result.status, Status::Wa);
    }
}
