//! Processing context threaded through the fusion stages.

use crate::core::fusion::strategy::FusionStrategy;
use crate::error::{FusionError, Result};
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};
use uuid::Uuid;

/// Campaign-lifecycle granularity of the question, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryLevel {
    #[default]
    Contract,
    Strategy,
    Execution,
    Audience,
}

impl QueryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryLevel::Contract => "contract",
            QueryLevel::Strategy => "strategy",
            QueryLevel::Execution => "execution",
            QueryLevel::Audience => "audience",
        }
    }

    /// Levels below contract always carry the campaign name for auditability.
    pub fn groups_by_campaign_name(&self) -> bool {
        !matches!(self, QueryLevel::Contract)
    }
}

impl fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryLevel {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "contract" => Ok(QueryLevel::Contract),
            "strategy" => Ok(QueryLevel::Strategy),
            "execution" => Ok(QueryLevel::Execution),
            "audience" => Ok(QueryLevel::Audience),
            other => Err(FusionError::Config(format!("Unknown query level: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CalculationType {
    #[default]
    #[serde(alias = "total")]
    Total,
    #[serde(alias = "ranking")]
    Ranking,
    #[serde(alias = "trend")]
    Trend,
    #[serde(alias = "comparison")]
    Comparison,
}

impl FromStr for CalculationType {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "total" => Ok(CalculationType::Total),
            "ranking" => Ok(CalculationType::Ranking),
            "trend" => Ok(CalculationType::Trend),
            "comparison" => Ok(CalculationType::Comparison),
            other => Err(FusionError::Config(format!(
                "Unknown calculation type: {}",
                other
            ))),
        }
    }
}

/// What the caller asked for, as produced by the upstream intent layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryIntent {
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub calculation_type: CalculationType,
    #[serde(default)]
    pub query_level: QueryLevel,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl QueryIntent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dimensions<S: Into<String>>(mut self, dimensions: impl IntoIterator<Item = S>) -> Self {
        self.dimensions = dimensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metrics<S: Into<String>>(mut self, metrics: impl IntoIterator<Item = S>) -> Self {
        self.metrics = metrics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_calculation_type(mut self, calculation_type: CalculationType) -> Self {
        self.calculation_type = calculation_type;
        self
    }

    pub fn with_query_level(mut self, query_level: QueryLevel) -> Self {
        self.query_level = query_level;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Budget totals at the three validation points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetCheckpoint {
    pub raw: Option<f64>,
    pub post_merge: Option<f64>,
    pub post_aggregation: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct FusionMetadata {
    pub budget: BudgetCheckpoint,
    pub requested_dimensions: Vec<String>,
    pub requested_metrics: Vec<String>,
    /// Grouping columns the aggregator actually used.
    pub group_by_columns: Vec<String>,
    /// KPI columns that were kept without being requested.
    pub default_kpis: Vec<String>,
    pub strategy: Option<FusionStrategy>,
    pub budget_note: Option<String>,
}

/// Request-scoped state. Created per fusion request, never shared.
pub struct ProcessingContext {
    pub request_id: Uuid,
    pub primary_raw: DataFrame,
    pub secondary_raw: DataFrame,
    /// Standardized (and possibly pre-aggregated) primary table.
    pub primary: DataFrame,
    pub secondary: DataFrame,
    pub merged: Option<DataFrame>,
    /// Aggregated table; KPI columns are appended here.
    pub aggregated: Option<DataFrame>,
    pub result: Option<DataFrame>,
    pub intent: Option<QueryIntent>,
    pub metadata: FusionMetadata,
    pub debug_log: Vec<String>,
    pub warnings: Vec<String>,
}

impl ProcessingContext {
    pub fn new(primary: DataFrame, secondary: DataFrame, intent: Option<QueryIntent>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            primary_raw: primary,
            secondary_raw: secondary,
            primary: DataFrame::empty(),
            secondary: DataFrame::empty(),
            merged: None,
            aggregated: None,
            result: None,
            intent,
            metadata: FusionMetadata::default(),
            debug_log: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!(request_id = %self.request_id, "{}", message);
        self.debug_log.push(message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(request_id = %self.request_id, "{}", message);
        self.warnings.push(message);
    }

    pub fn query_level(&self) -> QueryLevel {
        self.intent.as_ref().map(|i| i.query_level).unwrap_or_default()
    }

    pub fn calculation_type(&self) -> CalculationType {
        self.intent
            .as_ref()
            .map(|i| i.calculation_type)
            .unwrap_or_default()
    }

    pub fn requested_limit(&self) -> Option<usize> {
        self.intent.as_ref().and_then(|i| i.limit)
    }

    pub fn strategy(&self) -> Result<&FusionStrategy> {
        self.metadata
            .strategy
            .as_ref()
            .ok_or_else(|| FusionError::Execution("Fusion strategy has not been planned".to_string()))
    }

    pub fn merged(&self) -> Result<&DataFrame> {
        self.merged
            .as_ref()
            .ok_or_else(|| FusionError::Execution("Merged table is not available".to_string()))
    }

    pub fn aggregated(&self) -> Result<&DataFrame> {
        self.aggregated
            .as_ref()
            .ok_or_else(|| FusionError::Execution("Aggregated table is not available".to_string()))
    }

    pub fn result(&self) -> Result<&DataFrame> {
        self.result
            .as_ref()
            .ok_or_else(|| FusionError::Execution("Result table is not available".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_deserializes_with_defaults() {
        let intent: QueryIntent =
            serde_json::from_str(r#"{"dimensions": ["Agency"], "query_level": "execution"}"#)
                .unwrap();
        assert_eq!(intent.dimensions, vec!["Agency"]);
        assert!(intent.metrics.is_empty());
        assert_eq!(intent.calculation_type, CalculationType::Total);
        assert_eq!(intent.query_level, QueryLevel::Execution);
        assert_eq!(intent.limit, None);

        let ranking: QueryIntent =
            serde_json::from_str(r#"{"calculation_type": "ranking"}"#).unwrap();
        assert_eq!(ranking.calculation_type, CalculationType::Ranking);
    }

    #[test]
    fn test_context_defaults_without_intent() {
        let mut ctx = ProcessingContext::new(DataFrame::empty(), DataFrame::empty(), None);
        assert_eq!(ctx.query_level(), QueryLevel::Contract);
        assert_eq!(ctx.calculation_type(), CalculationType::Total);
        assert!(ctx.strategy().is_err());

        ctx.log("stage ran");
        ctx.warn("budget drift");
        assert_eq!(ctx.debug_log, vec!["stage ran"]);
        assert_eq!(ctx.warnings, vec!["budget drift"]);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("Audience".parse::<QueryLevel>().unwrap(), QueryLevel::Audience);
        assert!("campaign".parse::<QueryLevel>().is_err());
        assert!(QueryLevel::Strategy.groups_by_campaign_name());
        assert!(!QueryLevel::Contract.groups_by_campaign_name());
    }
}
