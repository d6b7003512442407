//! Aggregation
//!
//! Re-aggregates the merged table to the grain of the requested
//! dimensions: a single "Total" row when nothing is grouped, otherwise one
//! row per distinct key combination.

use crate::core::fusion::aliases::{
    is_attribute_column, resolve_dimension, CAMPAIGN_NAME_CANDIDATES, ITEM, TOTAL_LABEL,
};
use crate::core::fusion::context::{ProcessingContext, QueryLevel};
use crate::core::fusion::pipeline::FusionStage;
use crate::core::fusion::strategy::AggregationMode;
use crate::data_utils::{
    budget_total, find_column, group_by_stable, is_date_column, is_identifier_column, is_numeric,
    numeric_values, ordering_key, replace_series, unique_join,
};
use crate::error::Result;
use polars::prelude::*;
use tracing::info;

/// Resolved grouping for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupKeys {
    pub columns: Vec<String>,
    pub unresolved: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Aggregator;

impl Aggregator {
    pub fn new() -> Self {
        Self
    }

    /// Physical key columns for the requested dimensions. Below contract
    /// level the campaign name joins the key.
    pub fn resolve_keys(df: &DataFrame, dimensions: &[String], level: QueryLevel) -> GroupKeys {
        let mut columns: Vec<String> = Vec::new();
        let mut unresolved = Vec::new();
        for dimension in dimensions {
            match resolve_dimension(df, dimension) {
                Some(column) if !columns.contains(&column) => columns.push(column),
                Some(_) => {}
                None => unresolved.push(dimension.clone()),
            }
        }
        if level.groups_by_campaign_name() {
            if let Some(name) = find_column(df, CAMPAIGN_NAME_CANDIDATES) {
                if !columns.contains(&name) {
                    columns.push(name);
                }
            }
        }
        GroupKeys {
            columns,
            unresolved,
        }
    }

    /// One row labelled `item = "Total"`: numerics summed (identifiers and
    /// dates excluded), attribute columns unique-joined, the rest dropped.
    pub fn total(&self, df: &DataFrame) -> Result<DataFrame> {
        let mut aggs = vec![lit(TOTAL_LABEL).alias(ITEM)];
        for series in df.get_columns() {
            let name = series.name();
            if is_identifier_column(name) || is_date_column(name) {
                continue;
            }
            if is_numeric(series) {
                aggs.push(col(name).sum());
            } else if is_attribute_column(name) {
                aggs.push(unique_join(name));
            }
        }
        group_by_stable(df, &[], aggs)
    }

    /// Group by `keys` in first-appearance order, null keys included.
    pub fn by_dimensions(&self, df: &DataFrame, keys: &[String]) -> Result<DataFrame> {
        let mut frame = df.clone();
        let mut aggs = Vec::with_capacity(df.width());
        for series in df.get_columns() {
            let name = series.name();
            if keys.iter().any(|k| k == name) {
                continue;
            }
            if name.contains("budget") || name.contains("sum") {
                if !is_numeric(series) {
                    replace_series(&mut frame, Series::new(name, numeric_values(series)?))?;
                }
                aggs.push(col(name).sum());
            } else if is_date_column(name) {
                aggs.push(latest(&mut frame, series)?);
            } else if is_identifier_column(name) {
                continue;
            } else if is_numeric(series) {
                aggs.push(col(name).sum());
            } else if is_attribute_column(name) {
                aggs.push(unique_join(name));
            }
        }
        group_by_stable(&frame, keys, aggs)
    }
}

/// Latest value per group. Numeric columns take the MAX; text is ordered as
/// dates when it parses, then as numbers, then lexicographically, through a
/// helper key column added to `frame`.
fn latest(frame: &mut DataFrame, series: &Series) -> Result<Expr> {
    let name = series.name();
    if is_numeric(series) {
        return Ok(col(name).max());
    }
    let key = format!("__order_{}", name);
    replace_series(frame, ordering_key(series, &key)?)?;
    let present = col(name)
        .cast(DataType::String)
        .str()
        .strip_chars(lit(NULL))
        .neq(lit(""));
    let value = col(name).filter(present.clone());
    let order = col(&key).filter(present);
    Ok(value
        .clone()
        .sort_by([order, value], SortMultipleOptions::default())
        .last()
        .alias(name))
}

impl FusionStage for Aggregator {
    fn name(&self) -> &'static str {
        "aggregate"
    }

    fn run(&self, mut ctx: ProcessingContext) -> Result<ProcessingContext> {
        let mode = ctx.strategy()?.aggregation_mode;
        let merged = ctx.merged()?.clone();
        let keys = Self::resolve_keys(&merged, &ctx.metadata.requested_dimensions, ctx.query_level());
        for dimension in &keys.unresolved {
            ctx.log(format!("aggregate: dimension '{}' not found, dropped", dimension));
        }

        let (aggregated, group_by) = match mode {
            AggregationMode::None => (merged, keys.columns),
            _ if keys.columns.is_empty() => (self.total(&merged)?, vec![ITEM.to_string()]),
            _ => (self.by_dimensions(&merged, &keys.columns)?, keys.columns),
        };

        ctx.metadata.budget.post_aggregation = budget_total(&aggregated)?;
        info!(
            rows = aggregated.height(),
            group_by = ?group_by,
            "📊 Aggregated fused table"
        );
        ctx.log(format!(
            "aggregate: {:?} mode, group by {:?}, {} rows, post-aggregation budget {:?}",
            mode,
            group_by,
            aggregated.height(),
            ctx.metadata.budget.post_aggregation
        ));
        ctx.metadata.group_by_columns = group_by;
        ctx.aggregated = Some(aggregated);
        Ok(ctx)
    }
}
