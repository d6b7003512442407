//! Fusion pipeline
//!
//! An explicit, ordered list of stages. Each stage takes the request
//! context by value and hands it back; the orchestrator decides whether a
//! stage runs, times it and records what happened.

use crate::config::{FusionConfig, PlannerKind};
use crate::core::fusion::aggregate::Aggregator;
use crate::core::fusion::aliases::ALIAS_TABLE_VERSION;
use crate::core::fusion::budget::BudgetValidator;
use crate::core::fusion::column_filter::ColumnFilter;
use crate::core::fusion::context::{BudgetCheckpoint, ProcessingContext, QueryIntent};
use crate::core::fusion::format::Formatter;
use crate::core::fusion::ingest::TableIngest;
use crate::core::fusion::intent::IntentExtractor;
use crate::core::fusion::kpi::KpiCalculator;
use crate::core::fusion::merge::Merger;
use crate::core::fusion::pre_aggregate::PreAggregator;
use crate::core::fusion::sort::Sorter;
use crate::core::fusion::strategy::{
    ExternalPlanner, FusionStrategy, LlmStrategyAdvisor, Planner, RuleBasedPlanner,
    StrategyPlanner,
};
use crate::core::fusion::strategy_cache::{CacheStats, StrategyCache};
use crate::data_utils::{dataframe_to_records, records_to_dataframe, Record};
use crate::error::Result;
use crate::llm::LlmClient;
use polars::prelude::DataFrame;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn};

pub trait FusionStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn should_run(&self, _ctx: &ProcessingContext) -> bool {
        true
    }

    fn run(&self, ctx: ProcessingContext) -> Result<ProcessingContext>;
}

impl<T: FusionStage + ?Sized> FusionStage for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn should_run(&self, ctx: &ProcessingContext) -> bool {
        (**self).should_run(ctx)
    }

    fn run(&self, ctx: ProcessingContext) -> Result<ProcessingContext> {
        (**self).run(ctx)
    }
}

/// Both datasets plus the caller's intent.
pub struct FusionRequest {
    pub primary: DataFrame,
    pub secondary: DataFrame,
    pub intent: Option<QueryIntent>,
}

impl FusionRequest {
    pub fn new(primary: DataFrame, secondary: DataFrame) -> Self {
        Self {
            primary,
            secondary,
            intent: None,
        }
    }

    pub fn from_records(primary: &[Record], secondary: &[Record]) -> Result<Self> {
        Ok(Self::new(
            records_to_dataframe(primary)?,
            records_to_dataframe(secondary)?,
        ))
    }

    pub fn with_intent(mut self, intent: QueryIntent) -> Self {
        self.intent = Some(intent);
        self
    }
}

pub struct FusionOutput {
    pub table: DataFrame,
    pub budget_note: String,
    pub warnings: Vec<String>,
    pub debug_log: Vec<String>,
    pub strategy: Option<FusionStrategy>,
    pub budget: BudgetCheckpoint,
}

#[derive(Serialize)]
struct FusionReport<'a> {
    rows: Vec<Record>,
    budget_note: &'a str,
    warnings: &'a [String],
    debug_log: &'a [String],
    strategy: &'a Option<FusionStrategy>,
    budget: &'a BudgetCheckpoint,
}

impl FusionOutput {
    fn from_context(ctx: ProcessingContext) -> Result<Self> {
        let table = ctx.result()?.clone();
        Ok(Self {
            table,
            budget_note: ctx.metadata.budget_note.unwrap_or_default(),
            warnings: ctx.warnings,
            debug_log: ctx.debug_log,
            strategy: ctx.metadata.strategy,
            budget: ctx.metadata.budget,
        })
    }

    pub fn to_records(&self) -> Result<Vec<Record>> {
        dataframe_to_records(&self.table)
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        let report = FusionReport {
            rows: self.to_records()?,
            budget_note: &self.budget_note,
            warnings: &self.warnings,
            debug_log: &self.debug_log,
            strategy: &self.strategy,
            budget: &self.budget,
        };
        Ok(serde_json::to_value(report)?)
    }
}

pub struct FusionPipeline {
    stages: Vec<Box<dyn FusionStage>>,
    planner: Arc<StrategyPlanner>,
}

impl FusionPipeline {
    /// Pipeline with the planner the configuration asks for. An LLM planner
    /// without an API key degrades to the rules.
    pub fn new(config: &FusionConfig) -> Result<Self> {
        let rules = RuleBasedPlanner::new(config.ranking_threshold);
        let planner: Box<dyn Planner> = match config.planner {
            PlannerKind::Rules => Box::new(rules),
            PlannerKind::Llm => match LlmClient::from_settings(&config.llm) {
                Some(client) => {
                    info!("🤖 Using LLM strategy planner ({})", client.model());
                    Box::new(ExternalPlanner::new(
                        Arc::new(LlmStrategyAdvisor::new(client)),
                        rules,
                        config.planner_timeout(),
                    )?)
                }
                None => {
                    warn!("LLM planner requested but no API key configured, using rules");
                    Box::new(rules)
                }
            },
        };
        Ok(Self::with_planner(config, planner))
    }

    pub fn with_planner(config: &FusionConfig, planner: Box<dyn Planner>) -> Self {
        let cache = StrategyCache::new(config.strategy_cache_ttl());
        let planner = Arc::new(
            StrategyPlanner::new(planner, cache).with_ranking_threshold(config.ranking_threshold),
        );
        let stages: Vec<Box<dyn FusionStage>> = vec![
            Box::new(TableIngest::new()),
            Box::new(PreAggregator::new()),
            Box::new(IntentExtractor::new()),
            Box::new(planner.clone()),
            Box::new(Merger::new()),
            Box::new(Aggregator::new()),
            Box::new(BudgetValidator::from_config(config)),
            Box::new(KpiCalculator::new()),
            Box::new(ColumnFilter::new()),
            Box::new(Sorter::new(config.ranking_threshold, config.row_limit)),
            Box::new(Formatter::new()),
        ];
        Self { stages, planner }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.planner.cache_stats()
    }

    pub fn run(&self, request: FusionRequest) -> Result<FusionOutput> {
        let mut ctx = ProcessingContext::new(request.primary, request.secondary, request.intent);
        let span = info_span!("fusion", request_id = %ctx.request_id);
        let _enter = span.enter();

        info!(alias_table = ALIAS_TABLE_VERSION, "🚀 Starting fusion");
        let started = Instant::now();
        for stage in &self.stages {
            if !stage.should_run(&ctx) {
                ctx.log(format!("{}: skipped", stage.name()));
                continue;
            }
            let stage_started = Instant::now();
            ctx = stage.run(ctx)?;
            let elapsed = stage_started.elapsed();
            debug!(
                stage = stage.name(),
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                "stage finished"
            );
            ctx.log(format!("{}: ran", stage.name()));
        }

        info!(
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            warnings = ctx.warnings.len(),
            "✅ Fusion complete"
        );
        FusionOutput::from_context(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FusionError;
    use polars::prelude::*;

    #[test]
    fn test_stage_order() {
        let pipeline = FusionPipeline::new(&FusionConfig::default()).unwrap();
        assert_eq!(
            pipeline.stage_names(),
            vec![
                "ingest",
                "pre_aggregate",
                "intent",
                "strategy_plan",
                "merge",
                "aggregate",
                "budget_validate",
                "kpi",
                "column_filter",
                "sort",
                "format"
            ]
        );
    }

    #[test]
    fn test_skipped_stages_are_logged() {
        let pipeline = FusionPipeline::new(&FusionConfig::default()).unwrap();
        let primary = df!("campaign_id" => &[1i64], "budget" => &[100.0]).unwrap();
        let output = pipeline
            .run(FusionRequest::new(primary, DataFrame::empty()))
            .unwrap();
        assert!(output.debug_log.iter().any(|l| l == "pre_aggregate: skipped"));
        assert!(output.debug_log.iter().any(|l| l == "kpi: skipped"));
        assert!(output.debug_log.iter().any(|l| l == "format: ran"));
    }

    #[test]
    fn test_empty_primary_is_an_error() {
        let pipeline = FusionPipeline::new(&FusionConfig::default()).unwrap();
        let result = pipeline.run(FusionRequest::new(DataFrame::empty(), DataFrame::empty()));
        assert!(matches!(result, Err(FusionError::MissingPrimaryData(_))));
    }

    #[test]
    fn test_llm_planner_without_key_uses_rules() {
        let mut config = FusionConfig::default();
        config.planner = PlannerKind::Llm;
        config.llm.api_key = None;
        let pipeline = FusionPipeline::new(&config).unwrap();
        assert_eq!(pipeline.planner.planner_name(), "rules");
    }
}
