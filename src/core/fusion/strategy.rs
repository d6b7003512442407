//! Strategy Planning
//!
//! Decides how a request is fused: join keys, pre-aggregation, aggregation
//! shape, ad-format filtering strictness, ordering and zero-KPI handling.
//!
//! The rule-based planner is authoritative. An external planner (LLM-backed
//! by default) may be consulted first, but any failure there falls back to
//! the rules so a broken advisor can never fail a request.

use crate::core::fusion::aliases::{
    is_ad_format_dimension, is_performance_metric, is_segment_dimension, AD_FORMAT_ID,
    CAMPAIGN_ID, FAN_OUT_CANDIDATES,
};
use crate::core::fusion::context::{CalculationType, ProcessingContext, QueryLevel};
use crate::core::fusion::pipeline::FusionStage;
use crate::core::fusion::strategy_cache::{CacheStats, DataShape, StrategyCache, StrategyCacheKey};
use crate::data_utils::column_names;
use crate::error::{FusionError, Result};
use crate::llm::{extract_json_from_response, LlmClient};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    Total,
    Dimension,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdFormatFilter {
    Strict,
    Loose,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortingStrategy {
    Ranking,
    Trend,
    None,
}

/// Immutable decision record, planned once per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionStrategy {
    pub use_pre_aggregation: bool,
    pub merge_keys: Vec<String>,
    pub aggregation_mode: AggregationMode,
    pub filter_ad_format: AdFormatFilter,
    pub sorting_strategy: SortingStrategy,
    #[serde(default = "default_hide_zero_metrics")]
    pub hide_zero_metrics: bool,
}

fn default_hide_zero_metrics() -> bool {
    true
}

/// Everything a planner may look at.
#[derive(Debug, Clone, Serialize)]
pub struct PlanningInput {
    pub query_level: QueryLevel,
    pub calculation_type: CalculationType,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub primary_columns: Vec<String>,
    pub secondary_columns: Vec<String>,
    pub primary_rows: usize,
}

impl PlanningInput {
    pub fn from_context(ctx: &ProcessingContext) -> Self {
        Self {
            query_level: ctx.query_level(),
            calculation_type: ctx.calculation_type(),
            dimensions: ctx.metadata.requested_dimensions.clone(),
            metrics: ctx.metadata.requested_metrics.clone(),
            primary_columns: column_names(&ctx.primary),
            secondary_columns: column_names(&ctx.secondary),
            primary_rows: ctx.primary.height(),
        }
    }

    /// The table properties the rules read, for cache keying.
    pub fn data_shape(&self, ranking_threshold: usize) -> DataShape {
        DataShape {
            calculation_type: self.calculation_type,
            primary_has_ad_format: self.primary_has(AD_FORMAT_ID),
            secondary_has_ad_format: self.secondary_has(AD_FORMAT_ID),
            has_fan_out: self.has_fan_out_column(),
            above_ranking_threshold: self.primary_rows > ranking_threshold,
        }
    }

    fn primary_has(&self, name: &str) -> bool {
        self.primary_columns.iter().any(|c| c == name)
    }

    fn secondary_has(&self, name: &str) -> bool {
        self.secondary_columns.iter().any(|c| c == name)
    }

    fn has_fan_out_column(&self) -> bool {
        FAN_OUT_CANDIDATES.iter().any(|c| self.primary_has(c))
    }

    fn wants_ad_format(&self) -> bool {
        self.dimensions.iter().any(|d| is_ad_format_dimension(d))
    }

    fn wants_segment(&self) -> bool {
        self.dimensions.iter().any(|d| is_segment_dimension(d))
    }

    fn wants_performance_metric(&self) -> bool {
        self.metrics.iter().any(|m| is_performance_metric(m))
    }
}

pub trait Planner: Send + Sync {
    fn name(&self) -> &'static str;

    fn plan(&self, input: &PlanningInput) -> Result<FusionStrategy>;
}

/// The load-bearing business rules.
#[derive(Debug, Clone)]
pub struct RuleBasedPlanner {
    ranking_threshold: usize,
}

impl Default for RuleBasedPlanner {
    fn default() -> Self {
        Self::new(20)
    }
}

impl RuleBasedPlanner {
    pub fn new(ranking_threshold: usize) -> Self {
        Self { ranking_threshold }
    }

    pub fn decide(&self, input: &PlanningInput) -> FusionStrategy {
        let use_pre_aggregation = input.query_level == QueryLevel::Audience
            && input.has_fan_out_column()
            && input.wants_segment();

        let merge_keys = if input.primary_has(AD_FORMAT_ID)
            && input.secondary_has(AD_FORMAT_ID)
            && (input.wants_ad_format() || input.wants_performance_metric())
        {
            vec![CAMPAIGN_ID.to_string(), AD_FORMAT_ID.to_string()]
        } else {
            vec![CAMPAIGN_ID.to_string()]
        };

        let aggregation_mode = if input.dimensions.is_empty() {
            AggregationMode::Total
        } else {
            AggregationMode::Dimension
        };

        let filter_ad_format = match (input.wants_ad_format(), input.wants_performance_metric()) {
            (true, true) => AdFormatFilter::Strict,
            (true, false) => AdFormatFilter::Loose,
            _ => AdFormatFilter::None,
        };

        let sorting_strategy = match input.calculation_type {
            CalculationType::Ranking => SortingStrategy::Ranking,
            CalculationType::Total if input.primary_rows > self.ranking_threshold => {
                SortingStrategy::Ranking
            }
            CalculationType::Trend => SortingStrategy::Trend,
            _ => SortingStrategy::None,
        };

        FusionStrategy {
            use_pre_aggregation,
            merge_keys,
            aggregation_mode,
            filter_ad_format,
            sorting_strategy,
            hide_zero_metrics: true,
        }
    }
}

impl Planner for RuleBasedPlanner {
    fn name(&self) -> &'static str {
        "rules"
    }

    fn plan(&self, input: &PlanningInput) -> Result<FusionStrategy> {
        Ok(self.decide(input))
    }
}

/// An optional, possibly slow or unreliable source of strategy advice.
#[async_trait]
pub trait StrategyAdvisor: Send + Sync {
    async fn advise(&self, input: &PlanningInput) -> Result<FusionStrategy>;
}

/// Asks a chat model for the decision record.
pub struct LlmStrategyAdvisor {
    llm: LlmClient,
}

impl LlmStrategyAdvisor {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    fn build_prompt(input: &PlanningInput) -> Result<String> {
        Ok(format!(
            r#"You plan how two advertising datasets are fused into one report table.

PRIMARY: budget/metadata rows (relational store)
SECONDARY: impression/click/view aggregates (event store)

REQUEST:
{}

DECIDE:
- use_pre_aggregation: collapse audience-segment fan-out rows before joining
- merge_keys: ["campaign_id"] or ["campaign_id", "ad_format_type_id"]; every key must exist in both tables
- aggregation_mode: "total" | "dimension" | "none"
- filter_ad_format: "strict" | "loose" | "none"
- sorting_strategy: "ranking" | "trend" | "none"
- hide_zero_metrics: drop all-zero KPI columns nobody asked for

Return JSON:
{{"use_pre_aggregation": false, "merge_keys": ["campaign_id"], "aggregation_mode": "total", "filter_ad_format": "none", "sorting_strategy": "none", "hide_zero_metrics": true}}"#,
            serde_json::to_string_pretty(input)?
        ))
    }
}

#[async_trait]
impl StrategyAdvisor for LlmStrategyAdvisor {
    async fn advise(&self, input: &PlanningInput) -> Result<FusionStrategy> {
        info!("🤖 Asking {} for a fusion strategy", self.llm.model());
        let prompt = Self::build_prompt(input)?;
        let response = self.llm.call_llm(&prompt).await?;
        let cleaned = extract_json_from_response(&response);
        serde_json::from_str(&cleaned).map_err(|e| {
            FusionError::Planning(format!(
                "Failed to parse fusion strategy: {}. Response: {}",
                e, cleaned
            ))
        })
    }
}

/// Consults an advisor synchronously and falls back to the rules on any
/// failure. Owns a current-thread runtime, so it must not be called from
/// inside another async executor.
pub struct ExternalPlanner {
    advisor: Arc<dyn StrategyAdvisor>,
    fallback: RuleBasedPlanner,
    runtime: tokio::runtime::Runtime,
    timeout: Duration,
}

impl ExternalPlanner {
    pub fn new(
        advisor: Arc<dyn StrategyAdvisor>,
        fallback: RuleBasedPlanner,
        timeout: Duration,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            advisor,
            fallback,
            runtime,
            timeout,
        })
    }

    fn consult(&self, input: &PlanningInput) -> Result<FusionStrategy> {
        let advice = self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, self.advisor.advise(input)).await });

        let strategy = match advice {
            Ok(result) => result?,
            Err(_) => {
                return Err(FusionError::Planning(format!(
                    "Strategy advisor timed out after {:?}",
                    self.timeout
                )))
            }
        };
        Self::validate(strategy, input)
    }

    /// Advice is only usable if every merge key exists where the join needs it.
    fn validate(strategy: FusionStrategy, input: &PlanningInput) -> Result<FusionStrategy> {
        if strategy.merge_keys.is_empty() {
            return Err(FusionError::Planning("Advice has no merge keys".to_string()));
        }
        for key in &strategy.merge_keys {
            let in_secondary = input.secondary_columns.is_empty() || input.secondary_has(key);
            if !input.primary_has(key) || !in_secondary {
                return Err(FusionError::Planning(format!(
                    "Advised merge key '{}' is not present in both tables",
                    key
                )));
            }
        }
        Ok(strategy)
    }
}

impl Planner for ExternalPlanner {
    fn name(&self) -> &'static str {
        "external"
    }

    fn plan(&self, input: &PlanningInput) -> Result<FusionStrategy> {
        match self.consult(input) {
            Ok(strategy) => Ok(strategy),
            Err(e) => {
                warn!("External strategy planning failed, using rules: {}", e);
                self.fallback.plan(input)
            }
        }
    }
}

/// Pipeline stage owning the planner and its decision cache.
pub struct StrategyPlanner {
    planner: Box<dyn Planner>,
    cache: StrategyCache,
    ranking_threshold: usize,
}

impl StrategyPlanner {
    pub fn new(planner: Box<dyn Planner>, cache: StrategyCache) -> Self {
        Self {
            planner,
            cache,
            ranking_threshold: 20,
        }
    }

    pub fn with_ranking_threshold(mut self, ranking_threshold: usize) -> Self {
        self.ranking_threshold = ranking_threshold;
        self
    }

    /// Planned strategy plus whether it came from the cache.
    pub fn plan(&self, input: &PlanningInput) -> Result<(FusionStrategy, bool)> {
        let key = StrategyCacheKey::new(input.query_level, &input.dimensions, &input.metrics)
            .with_shape(input.data_shape(self.ranking_threshold));
        if let Some(strategy) = self.cache.get(&key) {
            return Ok((strategy, true));
        }
        let strategy = self.planner.plan(input)?;
        self.cache.insert(key, strategy.clone());
        Ok((strategy, false))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn planner_name(&self) -> &'static str {
        self.planner.name()
    }
}

impl FusionStage for StrategyPlanner {
    fn name(&self) -> &'static str {
        "strategy_plan"
    }

    fn run(&self, mut ctx: ProcessingContext) -> Result<ProcessingContext> {
        let input = PlanningInput::from_context(&ctx);
        let (strategy, cached) = self.plan(&input)?;
        ctx.log(format!(
            "strategy from {} planner ({})",
            self.planner.name(),
            if cached { "cache hit" } else { "computed" }
        ));
        ctx.log(format!("strategy: {}", serde_json::to_string(&strategy)?));
        ctx.metadata.strategy = Some(strategy);
        Ok(ctx)
    }
}
