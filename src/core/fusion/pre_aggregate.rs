//! Fan-out collapse
//!
//! Audience segments repeat a campaign's primary row once per segment, each
//! copy carrying the full budget. Joining or summing those rows would count
//! the money K times, so the primary table is collapsed first.

use crate::core::fusion::aliases::{FAN_OUT_CANDIDATES, FAN_OUT_COMPANIONS};
use crate::core::fusion::context::ProcessingContext;
use crate::core::fusion::pipeline::FusionStage;
use crate::data_utils::{
    budget_total, column_names, find_column, group_by_stable, is_numeric, select_columns,
    unique_join,
};
use crate::error::Result;
use polars::prelude::*;
use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
pub struct PreAggregator;

impl PreAggregator {
    pub fn new() -> Self {
        Self
    }

    pub fn fan_out_column(df: &DataFrame) -> Option<String> {
        find_column(df, FAN_OUT_CANDIDATES)
    }

    /// Collapse `df` to one row per non-numeric key. Budgets take the MAX,
    /// other numerics the MEAN, the fan-out column a sorted unique join and
    /// everything else its first value.
    pub fn collapse(&self, df: &DataFrame, fan_out: &str) -> Result<DataFrame> {
        let keys: Vec<String> = df
            .get_columns()
            .iter()
            .filter(|s| !is_numeric(s))
            .map(|s| s.name().to_string())
            .filter(|name| name != fan_out && !FAN_OUT_COMPANIONS.contains(&name.as_str()))
            .collect();

        let aggs: Vec<Expr> = df
            .get_columns()
            .iter()
            .filter(|s| !keys.iter().any(|k| k == s.name()))
            .map(|series| {
                let name = series.name();
                if name == fan_out {
                    unique_join(name)
                } else if is_numeric(series) && name.contains("budget") {
                    col(name).max()
                } else if is_numeric(series) {
                    col(name).cast(DataType::Float64).mean()
                } else {
                    col(name).first()
                }
            })
            .collect();

        let collapsed = group_by_stable(df, &keys, aggs)?;
        select_columns(&collapsed, &column_names(df))
    }
}

impl FusionStage for PreAggregator {
    fn name(&self) -> &'static str {
        "pre_aggregate"
    }

    fn should_run(&self, ctx: &ProcessingContext) -> bool {
        Self::fan_out_column(&ctx.primary).is_some()
    }

    fn run(&self, mut ctx: ProcessingContext) -> Result<ProcessingContext> {
        let Some(fan_out) = Self::fan_out_column(&ctx.primary) else {
            return Ok(ctx);
        };
        let before = ctx.primary.height();
        ctx.primary = self.collapse(&ctx.primary, &fan_out)?;
        let after = ctx.primary.height();

        // Budget drift is measured against the de-duplicated table.
        let deduplicated = budget_total(&ctx.primary)?;
        if deduplicated != ctx.metadata.budget.raw {
            ctx.log(format!(
                "pre_aggregate: raw budget {:?} -> {:?} after removing fan-out copies",
                ctx.metadata.budget.raw, deduplicated
            ));
            ctx.metadata.budget.raw = deduplicated;
        }

        info!(fan_out = %fan_out, before, after, "🧮 Collapsed fan-out rows");
        ctx.log(format!(
            "pre_aggregate: collapsed '{}' fan-out, {} -> {} rows",
            fan_out, before, after
        ));
        Ok(ctx)
    }
}
