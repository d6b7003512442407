//! Column selection
//!
//! Reduces the aggregated table to what the caller asked for plus the
//! columns an auditor needs to trust the numbers.

use crate::core::fusion::aliases::{
    is_requested_kpi, resolve_metric, CAMPAIGN_NAME_CANDIDATES, EFFECTIVE_IMPRESSION_CANDIDATES,
    FAN_OUT_CANDIDATES, KPI_COLUMNS, TOTAL_IMPRESSION_CANDIDATES,
};
use crate::core::fusion::context::ProcessingContext;
use crate::core::fusion::pipeline::FusionStage;
use crate::data_utils::{budget_column, find_column, has_column, select_columns};
use crate::error::Result;
use polars::prelude::DataFrame;

#[derive(Debug, Default, Clone, Copy)]
pub struct ColumnFilter;

/// Columns kept and the KPI columns that were added without being asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSelection {
    pub columns: Vec<String>,
    pub default_kpis: Vec<String>,
}

impl ColumnFilter {
    pub fn new() -> Self {
        Self
    }

    pub fn visible_columns(
        df: &DataFrame,
        group_keys: &[String],
        requested_metrics: &[String],
    ) -> ColumnSelection {
        let mut columns: Vec<String> = Vec::new();
        let push = |name: String, columns: &mut Vec<String>| {
            if has_column(df, &name) && !columns.contains(&name) {
                columns.push(name);
            }
        };

        for key in group_keys {
            push(key.clone(), &mut columns);
        }
        if let Some(fan_out) = find_column(df, FAN_OUT_CANDIDATES) {
            push(fan_out, &mut columns);
        }
        for metric in requested_metrics {
            if let Some(column) = resolve_metric(df, metric) {
                push(column, &mut columns);
            }
        }

        let mut default_kpis = Vec::new();
        for kpi in KPI_COLUMNS {
            if has_column(df, kpi) {
                push(kpi.to_string(), &mut columns);
                if !is_requested_kpi(kpi, requested_metrics) {
                    default_kpis.push(kpi.to_string());
                }
            }
        }

        let audit = [
            find_column(df, CAMPAIGN_NAME_CANDIDATES),
            Some("start_date".to_string()),
            Some("end_date".to_string()),
            budget_column(df),
        ];
        for name in audit.into_iter().flatten() {
            push(name, &mut columns);
        }

        let key_count = group_keys.iter().filter(|k| has_column(df, k)).count();
        if columns.len() == key_count {
            let fallback = [
                budget_column(df),
                find_column(df, EFFECTIVE_IMPRESSION_CANDIDATES)
                    .or_else(|| find_column(df, TOTAL_IMPRESSION_CANDIDATES)),
            ];
            for name in fallback.into_iter().flatten() {
                push(name, &mut columns);
            }
        }

        ColumnSelection {
            columns,
            default_kpis,
        }
    }

    /// Project `df` to its visible columns. Applying this twice gives the
    /// same table.
    pub fn select(
        &self,
        df: &DataFrame,
        group_keys: &[String],
        requested_metrics: &[String],
    ) -> Result<(DataFrame, Vec<String>)> {
        let selection = Self::visible_columns(df, group_keys, requested_metrics);
        let filtered = select_columns(df, &selection.columns)?;
        Ok((filtered, selection.default_kpis))
    }
}

impl FusionStage for ColumnFilter {
    fn name(&self) -> &'static str {
        "column_filter"
    }

    fn run(&self, mut ctx: ProcessingContext) -> Result<ProcessingContext> {
        let aggregated = ctx.aggregated()?;
        let (filtered, default_kpis) = self.select(
            aggregated,
            &ctx.metadata.group_by_columns,
            &ctx.metadata.requested_metrics,
        )?;
        let message = format!(
            "column_filter: kept {:?}, default KPIs {:?}",
            filtered.get_column_names(),
            default_kpis
        );
        ctx.log(message);
        ctx.metadata.default_kpis = default_kpis;
        ctx.result = Some(filtered);
        Ok(ctx)
    }
}
