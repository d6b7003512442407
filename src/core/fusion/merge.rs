//! Primary/secondary merge
//!
//! Left join anchored on the primary table: every budget row survives,
//! metrics attach where the keys line up.

use crate::core::fusion::aliases::{CAMPAIGN_ID, CAMPAIGN_NAME_CANDIDATES};
use crate::core::fusion::context::ProcessingContext;
use crate::core::fusion::pipeline::FusionStage;
use crate::data_utils::{
    budget_total, column_names, fill_numeric_nulls, fill_text_nulls, find_column,
    group_by_stable, has_column, is_numeric, replace_series, select_columns,
};
use crate::error::Result;
use polars::prelude::*;
use tracing::{debug, info};

pub const SECONDARY_SUFFIX: &str = "_secondary";
const ROW_ORDER: &str = "__fusion_row";

#[derive(Debug, Default, Clone, Copy)]
pub struct Merger;

impl Merger {
    pub fn new() -> Self {
        Self
    }

    /// Merge keys usable against these two tables.
    pub fn usable_keys(primary: &DataFrame, secondary: &DataFrame, wanted: &[String]) -> Vec<String> {
        wanted
            .iter()
            .filter(|k| has_column(primary, k) && has_column(secondary, k))
            .cloned()
            .collect()
    }

    /// Left join `primary` with `secondary` on `keys`, keeping primary row
    /// order. Returns the merged table and any notes for the debug log.
    pub fn merge(
        &self,
        primary: &DataFrame,
        secondary: &DataFrame,
        keys: &[String],
    ) -> Result<(DataFrame, Vec<String>)> {
        let mut notes = Vec::new();
        if secondary.width() == 0 || secondary.height() == 0 {
            notes.push("merge: secondary is empty, primary passed through".to_string());
            return Ok((primary.clone(), notes));
        }
        if !has_column(secondary, CAMPAIGN_ID) {
            notes.push(format!("merge: secondary has no {}, join skipped", CAMPAIGN_ID));
            return Ok((primary.clone(), notes));
        }
        let keys = Self::usable_keys(primary, secondary, keys);
        if keys.is_empty() {
            notes.push("merge: no merge key exists in both tables, join skipped".to_string());
            return Ok((primary.clone(), notes));
        }

        let primary_name = find_column(primary, CAMPAIGN_NAME_CANDIDATES);
        let secondary_name = find_column(secondary, CAMPAIGN_NAME_CANDIDATES)
            .filter(|name| !keys.contains(name));

        let mut right = roll_up(secondary, &keys)?;
        if right.height() < secondary.height() {
            notes.push(format!(
                "merge: secondary rolled up to {:?} grain, {} -> {} rows",
                keys,
                secondary.height(),
                right.height()
            ));
        }
        for name in column_names(&right) {
            if !keys.contains(&name) && has_column(primary, &name) {
                right.rename(&name, &format!("{}{}", name, SECONDARY_SUFFIX))?;
            }
        }

        let left = primary.with_row_index(ROW_ORDER, None)?;
        let on: Vec<Expr> = keys.iter().map(|k| col(k.as_str())).collect();
        let mut merged = left
            .lazy()
            .join(right.lazy(), on.clone(), on, JoinArgs::new(JoinType::Left))
            .sort([ROW_ORDER], SortMultipleOptions::default().with_maintain_order(true))
            .collect()?
            .drop(ROW_ORDER)?;

        for name in column_names(&merged) {
            let series = merged.column(&name)?;
            let filled = if is_numeric(series) {
                fill_numeric_nulls(series)?
            } else if series.dtype() == &DataType::String {
                fill_text_nulls(series)?
            } else {
                continue;
            };
            replace_series(&mut merged, filled)?;
        }
        if let (Some(primary_name), Some(secondary_name)) = (primary_name, secondary_name) {
            let incoming = if secondary_name == primary_name {
                format!("{}{}", secondary_name, SECONDARY_SUFFIX)
            } else {
                secondary_name
            };
            merged = coalesce_campaign_name(&merged, &primary_name, &incoming)?;
        }

        notes.push(format!(
            "merge: left join on {:?}, {} primary rows -> {} merged rows",
            keys,
            primary.height(),
            merged.height()
        ));
        Ok((merged, notes))
    }
}

/// Collapse duplicate key combinations so a join can never multiply primary
/// rows: numeric columns are summed, everything else keeps its first value.
fn roll_up(df: &DataFrame, keys: &[String]) -> Result<DataFrame> {
    let aggs: Vec<Expr> = df
        .get_columns()
        .iter()
        .filter(|s| !keys.iter().any(|k| k == s.name()))
        .map(|s| {
            if is_numeric(s) {
                col(s.name()).sum()
            } else {
                col(s.name()).first()
            }
        })
        .collect();
    let rolled = group_by_stable(df, keys, aggs)?;
    if rolled.height() == df.height() {
        return Ok(df.clone());
    }
    select_columns(&rolled, &column_names(df))
}

/// Keep the primary campaign name, fall back to the secondary's where the
/// primary one is empty, then drop the secondary copy. The name column is
/// resolved on the primary so a secondary alias never takes its place.
fn coalesce_campaign_name(df: &DataFrame, name: &str, incoming: &str) -> Result<DataFrame> {
    if !has_column(df, incoming) {
        return Ok(df.clone());
    }
    let primary = col(name).cast(DataType::String);
    let missing = primary
        .clone()
        .is_null()
        .or(primary.clone().str().strip_chars(lit(NULL)).eq(lit("")));
    let coalesced = df
        .clone()
        .lazy()
        .with_column(
            when(missing)
                .then(col(incoming).cast(DataType::String))
                .otherwise(primary)
                .fill_null(lit(""))
                .alias(name),
        )
        .collect()?
        .drop(incoming)?;
    debug!("Coalesced {} with {}", name, incoming);
    Ok(coalesced)
}

impl FusionStage for Merger {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn run(&self, mut ctx: ProcessingContext) -> Result<ProcessingContext> {
        let keys = ctx.strategy()?.merge_keys.clone();
        let (merged, notes) = self.merge(&ctx.primary, &ctx.secondary, &keys)?;
        for note in notes {
            ctx.log(note);
        }

        ctx.metadata.budget.post_merge = budget_total(&merged)?;
        info!(
            rows = merged.height(),
            columns = merged.width(),
            "🔗 Merged primary and secondary"
        );
        ctx.log(format!(
            "merge: post-merge budget {:?}",
            ctx.metadata.budget.post_merge
        ));
        ctx.merged = Some(merged);
        Ok(ctx)
    }
}
