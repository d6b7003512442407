//! Table ingestion
//!
//! Brings both raw inputs into canonical form before anything else looks at
//! them: lower-cased column names, canonical join keys, numeric metric
//! columns and trimmed text.

use crate::core::fusion::aliases::{is_metric_column, AD_FORMAT_ID, CAMPAIGN_ID};
use crate::core::fusion::context::ProcessingContext;
use crate::core::fusion::pipeline::FusionStage;
use crate::data_utils::{
    budget_total, column_names, has_column, is_identifier_column, numeric_values, replace_series,
    string_values,
};
use crate::error::{FusionError, Result};
use polars::prelude::*;
use std::collections::HashSet;
use tracing::{debug, info};

/// Rewrites inconsistent join-key columns to the identifiers both tables share.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyNormalizer;

impl KeyNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, mut df: DataFrame) -> Result<DataFrame> {
        if !has_column(&df, CAMPAIGN_ID) && has_column(&df, "id") {
            df.rename("id", CAMPAIGN_ID)?;
            debug!("Renamed id -> {}", CAMPAIGN_ID);
        }

        if !has_column(&df, AD_FORMAT_ID) {
            let variant = df
                .get_column_names()
                .iter()
                .find(|name| name.contains(AD_FORMAT_ID) || name.contains("adformattypeid"))
                .map(|name| name.to_string());
            if let Some(variant) = variant {
                df.rename(&variant, AD_FORMAT_ID)?;
                debug!("Renamed {} -> {}", variant, AD_FORMAT_ID);
            }
        }

        for key in [CAMPAIGN_ID, AD_FORMAT_ID] {
            if has_column(&df, key) {
                let keys = canonical_keys(df.column(key)?)?;
                replace_series(&mut df, keys)?;
            }
        }
        Ok(df)
    }
}

/// Join keys as trimmed text; integral floats lose their fraction.
fn canonical_keys(series: &Series) -> Result<Series> {
    let values: Vec<Option<String>> = string_values(series)?
        .into_iter()
        .map(|v| v.map(|s| s.trim().to_string()))
        .collect();
    Ok(Series::new(series.name(), values))
}

pub struct TableIngest {
    key_normalizer: KeyNormalizer,
}

impl Default for TableIngest {
    fn default() -> Self {
        Self::new()
    }
}

impl TableIngest {
    pub fn new() -> Self {
        Self {
            key_normalizer: KeyNormalizer::new(),
        }
    }

    /// Canonical form of one table. An empty frame stays empty.
    pub fn standardize(&self, df: &DataFrame) -> Result<DataFrame> {
        if df.width() == 0 {
            return Ok(DataFrame::empty());
        }
        let df = lowercase_columns(df)?;
        let mut df = self.key_normalizer.normalize(df)?;

        for name in column_names(&df) {
            let series = df.column(&name)?;
            if is_metric_column(&name) && !is_identifier_column(&name) {
                if let Some(coerced) = coerce_metric(series)? {
                    replace_series(&mut df, coerced)?;
                }
            } else if series.dtype() == &DataType::String {
                let trimmed = trim_text(series)?;
                replace_series(&mut df, trimmed)?;
            }
        }
        Ok(df)
    }
}

/// Trimmed, lower-cased names. A later column whose name collides with an
/// earlier one after lower-casing is dropped.
fn lowercase_columns(df: &DataFrame) -> Result<DataFrame> {
    let mut seen = HashSet::new();
    let mut columns = Vec::with_capacity(df.width());
    for series in df.get_columns() {
        let name = series.name().trim().to_lowercase();
        if !seen.insert(name.clone()) {
            debug!("Dropping duplicate column {} after lower-casing", series.name());
            continue;
        }
        let mut renamed = series.clone();
        renamed.rename(&name);
        columns.push(renamed);
    }
    Ok(DataFrame::new(columns)?)
}

/// Float64 version of a metric column. Text columns are only coerced when at
/// least one value parses, so descriptive columns that merely share a keyword
/// (`account_name` contains "count") stay text.
fn coerce_metric(series: &Series) -> Result<Option<Series>> {
    if series.dtype().is_numeric() {
        if series.dtype() == &DataType::Float64 {
            return Ok(None);
        }
        return Ok(Some(series.cast(&DataType::Float64)?));
    }
    if series.dtype() != &DataType::String {
        return Ok(None);
    }
    let values = numeric_values(series)?;
    let parsed = values.iter().filter(|v| v.is_some()).count();
    if parsed == 0 && series.null_count() < series.len() {
        return Ok(None);
    }
    Ok(Some(Series::new(series.name(), values)))
}

fn trim_text(series: &Series) -> Result<Series> {
    let values: Vec<Option<String>> = series
        .str()?
        .into_iter()
        .map(|v| v.map(|s| s.trim().to_string()))
        .collect();
    Ok(Series::new(series.name(), values))
}

impl FusionStage for TableIngest {
    fn name(&self) -> &'static str {
        "ingest"
    }

    fn run(&self, mut ctx: ProcessingContext) -> Result<ProcessingContext> {
        if ctx.primary_raw.width() == 0 {
            return Err(FusionError::MissingPrimaryData(
                "primary dataset has no columns".to_string(),
            ));
        }
        if ctx.primary_raw.height() == 0 {
            return Err(FusionError::MissingPrimaryData(
                "primary dataset has no rows".to_string(),
            ));
        }

        ctx.primary = self.standardize(&ctx.primary_raw)?;
        ctx.secondary = self.standardize(&ctx.secondary_raw)?;
        ctx.metadata.budget.raw = budget_total(&ctx.primary)?;

        info!(
            primary_rows = ctx.primary.height(),
            secondary_rows = ctx.secondary.height(),
            "📥 Ingested fusion inputs"
        );
        let message = format!(
            "ingest: primary {} rows x {} cols, secondary {} rows x {} cols, raw budget {:?}",
            ctx.primary.height(),
            ctx.primary.width(),
            ctx.secondary.height(),
            ctx.secondary.width(),
            ctx.metadata.budget.raw
        );
        ctx.log(message);
        Ok(ctx)
    }
}
