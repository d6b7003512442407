//! Presentation formatting
//!
//! Last stage. The steps run in a fixed order and each one is a plain
//! function over the frame so it can be checked on its own.

use crate::core::fusion::aliases::{
    display_name, is_ad_format_dimension, is_hidden_column, is_requested_kpi,
    AD_FORMAT_CANDIDATES, ADVERTISER_CANDIDATES, AGENCY_CANDIDATES, CAMPAIGN_NAME_CANDIDATES,
    KPI_COLUMNS, PREFERRED_ORDER,
};
use crate::core::fusion::context::{ProcessingContext, QueryLevel};
use crate::core::fusion::pipeline::FusionStage;
use crate::core::fusion::strategy::AdFormatFilter;
use crate::data_utils::{
    column_names, filter_rows, find_column, has_column, is_null_like, numeric_values,
    replace_series, select_columns, string_values,
};
use crate::error::Result;
use polars::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Default, Clone, Copy)]
pub struct Formatter;

impl Formatter {
    pub fn new() -> Self {
        Self
    }
}

/// Step 1: budget columns become whole numbers (fraction truncated).
pub fn budgets_to_integers(df: &mut DataFrame) -> Result<()> {
    for name in column_names(df) {
        let series = df.column(&name)?;
        if !name.contains("budget") || !series.dtype().is_numeric() {
            continue;
        }
        let values: Vec<Option<i64>> = numeric_values(series)?
            .into_iter()
            .map(|v| v.map(|x| x.trunc() as i64))
            .collect();
        replace_series(df, Series::new(&name, values))?;
    }
    Ok(())
}

/// Step 2: drop technical identifiers, except columns the table is grouped by.
pub fn drop_hidden_columns(df: &DataFrame, group_keys: &[String]) -> Result<DataFrame> {
    let keep: Vec<String> = column_names(df)
        .into_iter()
        .filter(|name| !is_hidden_column(name) || group_keys.contains(name))
        .collect();
    select_columns(df, &keep)
}

/// Step 3: preferred columns first, in their configured order.
pub fn reorder_columns(df: &DataFrame) -> Result<DataFrame> {
    let existing = column_names(df);
    let mut ordered: Vec<String> = PREFERRED_ORDER
        .iter()
        .filter(|name| existing.iter().any(|e| e == *name))
        .map(|name| name.to_string())
        .collect();
    for name in existing {
        if !ordered.contains(&name) {
            ordered.push(name);
        }
    }
    select_columns(df, &ordered)
}

/// Step 4: what kind of budget figure the table shows.
pub fn budget_note(level: QueryLevel) -> String {
    match level {
        QueryLevel::Contract => "Budget_Sum is the contracted campaign budget, counted once per \
            campaign regardless of audience segments or ad formats."
            .to_string(),
        level => format!(
            "Budget_Sum is the budget allocated at {} level; allocations are shown per campaign \
            and may not add up to the contracted total.",
            level
        ),
    }
}

/// Step 5: `"0"` is a placeholder for "no campaign", not a name.
pub fn drop_placeholder_campaigns(df: &DataFrame) -> Result<DataFrame> {
    let Some(column) = find_column(df, CAMPAIGN_NAME_CANDIDATES) else {
        return Ok(df.clone());
    };
    let keep: Vec<bool> = string_values(df.column(&column)?)?
        .iter()
        .map(|v| v.as_deref().map(str::trim) != Some("0"))
        .collect();
    filter_rows(df, &keep)
}

/// Step 6: ad-format row filtering. Strict filtering never empties the table;
/// when every row would go, the invalid values are blanked instead.
pub fn filter_ad_format(
    df: &DataFrame,
    mode: AdFormatFilter,
    requested_dimensions: &[String],
) -> Result<DataFrame> {
    let format_columns: Vec<&str> = AD_FORMAT_CANDIDATES
        .iter()
        .copied()
        .filter(|c| has_column(df, c))
        .collect();
    let Some(column) = format_columns.first().map(|c| c.to_string()) else {
        return Ok(df.clone());
    };

    match mode {
        AdFormatFilter::Strict => {
            let values = string_values(df.column(&column)?)?;
            let keep: Vec<bool> = values
                .iter()
                .map(|v| v.as_deref().is_some_and(|s| !is_null_like(s)))
                .collect();
            if keep.iter().any(|k| *k) {
                return filter_rows(df, &keep);
            }
            let blanked: Vec<String> = values
                .into_iter()
                .map(|v| match v {
                    Some(s) if !is_null_like(&s) => s,
                    _ => String::new(),
                })
                .collect();
            let mut out = df.clone();
            replace_series(&mut out, Series::new(&column, blanked))?;
            Ok(out)
        }
        AdFormatFilter::Loose => {
            let keep: Vec<bool> = string_values(df.column(&column)?)?
                .iter()
                .map(|v| v.as_deref().map(str::trim) != Some("0"))
                .collect();
            filter_rows(df, &keep)
        }
        AdFormatFilter::None => {
            if requested_dimensions.iter().any(|d| is_ad_format_dimension(d)) {
                return Ok(df.clone());
            }
            let mut out = df.clone();
            for column in format_columns {
                out = out.drop(column)?;
            }
            Ok(out)
        }
    }
}

/// Step 7: rows without an agency or advertiser are not reportable.
pub fn drop_unattributed_rows(df: &DataFrame) -> Result<DataFrame> {
    let mut keep = vec![true; df.height()];
    for candidates in [AGENCY_CANDIDATES, ADVERTISER_CANDIDATES] {
        let Some(column) = find_column(df, candidates) else {
            continue;
        };
        for (slot, value) in keep.iter_mut().zip(string_values(df.column(&column)?)?) {
            if value.as_deref().map_or(true, |s| s.trim().is_empty()) {
                *slot = false;
            }
        }
    }
    filter_rows(df, &keep)
}

/// Step 8: an all-zero KPI that nobody asked for is noise.
pub fn suppress_zero_kpis(
    df: &DataFrame,
    requested_metrics: &[String],
    default_kpis: &[String],
) -> Result<DataFrame> {
    let mut out = df.clone();
    for kpi in KPI_COLUMNS {
        if !has_column(&out, kpi) || is_requested_kpi(kpi, requested_metrics) {
            continue;
        }
        if !default_kpis.iter().any(|d| d == kpi) {
            continue;
        }
        let all_zero = numeric_values(out.column(kpi)?)?
            .into_iter()
            .all(|v| v.unwrap_or(0.0) == 0.0);
        if all_zero {
            out = out.drop(kpi)?;
        }
    }
    Ok(out)
}

/// Step 9: display names. A rename that would collide with an existing
/// column is skipped.
pub fn rename_for_display(df: &mut DataFrame) -> Result<()> {
    let mut taken: HashSet<String> = column_names(df).into_iter().collect();
    for name in column_names(df) {
        let Some(display) = display_name(&name) else {
            continue;
        };
        if display == name || taken.contains(display) {
            continue;
        }
        df.rename(&name, display)?;
        taken.remove(&name);
        taken.insert(display.to_string());
    }
    Ok(())
}

impl FusionStage for Formatter {
    fn name(&self) -> &'static str {
        "format"
    }

    fn run(&self, mut ctx: ProcessingContext) -> Result<ProcessingContext> {
        let strategy = ctx.strategy()?.clone();
        let mut df = ctx.result()?.clone();

        budgets_to_integers(&mut df)?;
        df = drop_hidden_columns(&df, &ctx.metadata.group_by_columns)?;
        df = reorder_columns(&df)?;
        ctx.metadata.budget_note = Some(budget_note(ctx.query_level()));
        df = drop_placeholder_campaigns(&df)?;
        df = filter_ad_format(
            &df,
            strategy.filter_ad_format,
            &ctx.metadata.requested_dimensions,
        )?;
        df = drop_unattributed_rows(&df)?;
        if strategy.hide_zero_metrics {
            df = suppress_zero_kpis(
                &df,
                &ctx.metadata.requested_metrics,
                &ctx.metadata.default_kpis,
            )?;
        }
        rename_for_display(&mut df)?;

        ctx.log(format!(
            "format: {} rows, columns {:?}",
            df.height(),
            df.get_column_names()
        ));
        ctx.result = Some(df);
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_budgets_are_truncated_to_integers() {
        let mut df = df!("budget" => &[1000.99, 5.5], "clicks" => &[1.5, 2.5]).unwrap();
        budgets_to_integers(&mut df).unwrap();
        let budget = df.column("budget").unwrap();
        assert_eq!(budget.dtype(), &DataType::Int64);
        assert_eq!(budget.i64().unwrap().get(0), Some(1000));
        assert_eq!(df.column("clicks").unwrap().dtype(), &DataType::Float64);
    }

    #[test]
    fn test_hidden_columns_spare_group_keys() {
        let df = df!(
            "Campaign_ID" => &["1"],
            "agency_id" => &["7"],
            "budget" => &[1i64]
        )
        .unwrap();
        let out = drop_hidden_columns(&df, &names(&["agency_id"])).unwrap();
        assert_eq!(out.get_column_names(), vec!["agency_id", "budget"]);
    }

    #[test]
    fn test_preferred_order_first() {
        let df = df!(
            "platform" => &["web"],
            "budget" => &[1i64],
            "agency" => &["A"],
            "ctr" => &[1.0]
        )
        .unwrap();
        let out = reorder_columns(&df).unwrap();
        assert_eq!(out.get_column_names(), vec!["agency", "budget", "ctr", "platform"]);
    }

    #[test]
    fn test_budget_note_depends_on_level() {
        assert!(budget_note(QueryLevel::Contract).contains("contracted"));
        assert!(budget_note(QueryLevel::Execution).contains("execution level"));
    }

    #[test]
    fn test_strict_filter_never_empties_table() {
        let df = df!("ad_format" => &["", "0"], "budget" => &[1i64, 2]).unwrap();
        let out = filter_ad_format(&df, AdFormatFilter::Strict, &names(&["Ad_Format"])).unwrap();
        assert_eq!(out.height(), 2);
        let formats: Vec<Option<&str>> = out.column("ad_format").unwrap().str().unwrap().into_iter().collect();
        assert_eq!(formats, vec![Some(""), Some("")]);

        let mixed = df!("ad_format" => &["Banner", "0", "null"], "budget" => &[1i64, 2, 3]).unwrap();
        let out = filter_ad_format(&mixed, AdFormatFilter::Strict, &names(&["Ad_Format"])).unwrap();
        assert_eq!(out.height(), 1);
    }

    #[test]
    fn test_loose_filter_keeps_unset_formats() {
        let df = df!("ad_format" => &["Banner", "", "0"]).unwrap();
        let out = filter_ad_format(&df, AdFormatFilter::Loose, &[]).unwrap();
        assert_eq!(out.height(), 2);
    }

    #[test]
    fn test_unrequested_format_columns_are_dropped() {
        let df = df!(
            "ad_format" => &["Banner"],
            "ad_format_type_id" => &["10"],
            "budget" => &[1i64]
        )
        .unwrap();
        let out = filter_ad_format(&df, AdFormatFilter::None, &names(&["Agency"])).unwrap();
        assert_eq!(out.get_column_names(), vec!["budget"]);
    }

    #[test]
    fn test_placeholder_and_unattributed_rows_removed() {
        let df = df!(
            "agency" => &["A", "", "B"],
            "campaign_name" => &["Spring", "Fall", "0"]
        )
        .unwrap();
        let out = drop_placeholder_campaigns(&df).unwrap();
        let out = drop_unattributed_rows(&out).unwrap();
        assert_eq!(out.height(), 1);
        assert_eq!(out.column("agency").unwrap().str().unwrap().get(0), Some("A"));
    }

    #[test]
    fn test_zero_kpi_suppression_rules() {
        let df = df!(
            "ctr" => &[0.0, 0.0],
            "vtr" => &[0.0, 0.0],
            "er" => &[0.0, 1.2]
        )
        .unwrap();
        let out = suppress_zero_kpis(&df, &names(&["VTR"]), &names(&["ctr", "er"])).unwrap();
        assert_eq!(out.get_column_names(), vec!["vtr", "er"]);
    }

    #[test]
    fn test_display_rename_skips_collisions() {
        let mut df = df!(
            "agency" => &["A"],
            "agency_name" => &["Acme"],
            "budget" => &[1i64],
            "ctr" => &[1.0]
        )
        .unwrap();
        rename_for_display(&mut df).unwrap();
        assert_eq!(
            df.get_column_names(),
            vec!["Agency", "agency_name", "Budget_Sum", "CTR"]
        );
    }
}
