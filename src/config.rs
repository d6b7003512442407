//! Fusion configuration
//!
//! Defaults mirror the pipeline's business constants. Values can be loaded
//! from a JSON file and overridden from the environment (a `.env` file is
//! honoured through `dotenv`).

use crate::error::{FusionError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Which planner drives the strategy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlannerKind {
    #[default]
    Rules,
    Llm,
}

impl FromStr for PlannerKind {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "rules" | "rule" | "rule_based" => Ok(PlannerKind::Rules),
            "llm" | "external" => Ok(PlannerKind::Llm),
            other => Err(FusionError::Config(format!("Unknown planner kind: {}", other))),
        }
    }
}

impl fmt::Display for PlannerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannerKind::Rules => write!(f, "rules"),
            PlannerKind::Llm => write!(f, "llm"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Rows kept after sorting when the caller gives no limit.
    pub row_limit: usize,

    /// Row count above which a Total query is presented as a ranking.
    pub ranking_threshold: usize,

    pub strategy_cache_ttl_secs: u64,

    /// Allowed raw vs. aggregated budget drift, in percent.
    pub budget_tolerance_pct: f64,

    /// Drift allowed at execution level while ad-format ids are still present.
    pub execution_tolerance_pct: f64,

    pub planner: PlannerKind,

    pub planner_timeout_secs: u64,

    pub llm: LlmSettings,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            row_limit: 20,
            ranking_threshold: 20,
            strategy_cache_ttl_secs: 3600,
            budget_tolerance_pct: 5.0,
            execution_tolerance_pct: 10.0,
            planner: PlannerKind::Rules,
            planner_timeout_secs: 20,
            llm: LlmSettings::default(),
        }
    }
}

impl FusionConfig {
    /// Load a JSON config file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FusionError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: FusionConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = env_parse::<usize>("FUSION_ROW_LIMIT")? {
            self.row_limit = v;
        }
        if let Some(v) = env_parse::<usize>("FUSION_RANKING_THRESHOLD")? {
            self.ranking_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("FUSION_STRATEGY_CACHE_TTL_SECS")? {
            self.strategy_cache_ttl_secs = v;
        }
        if let Some(v) = env_parse::<f64>("FUSION_BUDGET_TOLERANCE_PCT")? {
            self.budget_tolerance_pct = v;
        }
        if let Some(v) = env_parse::<f64>("FUSION_EXECUTION_TOLERANCE_PCT")? {
            self.execution_tolerance_pct = v;
        }
        if let Some(v) = env_parse::<PlannerKind>("FUSION_PLANNER")? {
            self.planner = v;
        }
        if let Some(v) = env_parse::<u64>("FUSION_PLANNER_TIMEOUT_SECS")? {
            self.planner_timeout_secs = v;
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            self.llm.model = model;
        }
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            self.llm.base_url = base_url;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.row_limit == 0 {
            return Err(FusionError::Config("row_limit must be at least 1".to_string()));
        }
        if self.budget_tolerance_pct < 0.0 || self.execution_tolerance_pct < 0.0 {
            return Err(FusionError::Config(
                "budget tolerances must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn strategy_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.strategy_cache_ttl_secs)
    }

    pub fn planner_timeout(&self) -> Duration {
        Duration::from_secs(self.planner_timeout_secs)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| FusionError::Config(format!("Invalid value for {}: {}", key, e))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_business_constants() {
        let config = FusionConfig::default();
        assert_eq!(config.row_limit, 20);
        assert_eq!(config.ranking_threshold, 20);
        assert_eq!(config.strategy_cache_ttl(), Duration::from_secs(3600));
        assert_eq!(config.budget_tolerance_pct, 5.0);
        assert_eq!(config.execution_tolerance_pct, 10.0);
        assert_eq!(config.planner, PlannerKind::Rules);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: FusionConfig =
            serde_json::from_str(r#"{"row_limit": 5, "planner": "llm"}"#).unwrap();
        assert_eq!(config.row_limit, 5);
        assert_eq!(config.planner, PlannerKind::Llm);
        assert_eq!(config.ranking_threshold, 20);
        assert_eq!(config.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn test_zero_row_limit_rejected() {
        let config = FusionConfig {
            row_limit: 0,
            ..FusionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_planner_kind_parsing() {
        assert_eq!("LLM".parse::<PlannerKind>().unwrap(), PlannerKind::Llm);
        assert_eq!("rules".parse::<PlannerKind>().unwrap(), PlannerKind::Rules);
        assert!("oracle".parse::<PlannerKind>().is_err());
    }
}
