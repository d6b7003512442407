//! Budget consistency checks between the raw and aggregated tables.

use crate::config::FusionConfig;
use crate::core::fusion::aliases::AD_FORMAT_ID;
use crate::core::fusion::context::{BudgetCheckpoint, ProcessingContext, QueryLevel};
use crate::core::fusion::pipeline::FusionStage;
use crate::data_utils::has_column;
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct BudgetValidator {
    tolerance_pct: f64,
    execution_tolerance_pct: f64,
}

impl Default for BudgetValidator {
    fn default() -> Self {
        Self::new(5.0, 10.0)
    }
}

impl BudgetValidator {
    pub fn new(tolerance_pct: f64, execution_tolerance_pct: f64) -> Self {
        Self {
            tolerance_pct,
            execution_tolerance_pct,
        }
    }

    pub fn from_config(config: &FusionConfig) -> Self {
        Self::new(config.budget_tolerance_pct, config.execution_tolerance_pct)
    }

    /// Execution-level tables still split by ad format carry rounding from
    /// the format split, so they get the wider tolerance.
    pub fn tolerance(&self, level: QueryLevel, has_ad_format_id: bool) -> f64 {
        if level == QueryLevel::Execution && has_ad_format_id {
            self.execution_tolerance_pct
        } else {
            self.tolerance_pct
        }
    }

    /// Warning text when the aggregated budget drifted too far from the raw
    /// budget. `None` when within tolerance or when there is nothing to check.
    pub fn check(
        &self,
        budget: &BudgetCheckpoint,
        level: QueryLevel,
        has_ad_format_id: bool,
    ) -> Option<String> {
        let raw = budget.raw.filter(|v| *v > 0.0)?;
        let aggregated = budget.post_aggregation.filter(|v| *v > 0.0)?;

        let pct_diff = (aggregated - raw).abs() / raw * 100.0;
        let tolerance = self.tolerance(level, has_ad_format_id);
        if pct_diff <= tolerance {
            return None;
        }
        Some(format!(
            "Budget mismatch at {} level: raw {:.2}, post-merge {}, post-aggregation {:.2} ({:.2}% drift, tolerance {:.1}%)",
            level,
            raw,
            budget
                .post_merge
                .map(|v| format!("{:.2}", v))
                .unwrap_or_else(|| "n/a".to_string()),
            aggregated,
            pct_diff,
            tolerance
        ))
    }
}

impl FusionStage for BudgetValidator {
    fn name(&self) -> &'static str {
        "budget_validate"
    }

    fn run(&self, mut ctx: ProcessingContext) -> Result<ProcessingContext> {
        let has_ad_format_id = has_column(ctx.aggregated()?, AD_FORMAT_ID);
        match self.check(&ctx.metadata.budget, ctx.query_level(), has_ad_format_id) {
            Some(warning) => ctx.warn(warning),
            None => ctx.log(format!(
                "budget_validate: raw {:?}, post-merge {:?}, post-aggregation {:?}",
                ctx.metadata.budget.raw,
                ctx.metadata.budget.post_merge,
                ctx.metadata.budget.post_aggregation
            )),
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(raw: f64, merged: f64, aggregated: f64) -> BudgetCheckpoint {
        BudgetCheckpoint {
            raw: Some(raw),
            post_merge: Some(merged),
            post_aggregation: Some(aggregated),
        }
    }

    #[test]
    fn test_within_tolerance_is_silent() {
        let validator = BudgetValidator::default();
        assert!(validator
            .check(&checkpoint(1000.0, 1000.0, 1040.0), QueryLevel::Contract, false)
            .is_none());
    }

    #[test]
    fn test_drift_produces_warning_with_all_totals() {
        let validator = BudgetValidator::default();
        let warning = validator
            .check(&checkpoint(1000.0, 2000.0, 2000.0), QueryLevel::Strategy, false)
            .unwrap();
        assert!(warning.contains("strategy"));
        assert!(warning.contains("1000.00"));
        assert!(warning.contains("2000.00"));
    }

    #[test]
    fn test_execution_level_with_ad_format_gets_wider_tolerance() {
        let validator = BudgetValidator::default();
        let budget = checkpoint(1000.0, 1080.0, 1080.0);
        assert!(validator.check(&budget, QueryLevel::Execution, true).is_none());
        assert!(validator.check(&budget, QueryLevel::Execution, false).is_some());
        assert!(validator.check(&budget, QueryLevel::Audience, true).is_some());
    }

    #[test]
    fn test_missing_or_zero_budget_skips() {
        let validator = BudgetValidator::default();
        let empty = BudgetCheckpoint::default();
        assert!(validator.check(&empty, QueryLevel::Contract, false).is_none());
        assert!(validator
            .check(&checkpoint(0.0, 0.0, 500.0), QueryLevel::Contract, false)
            .is_none());
    }
}
