//! Column helpers shared by the fusion stages.
//!
//! Everything here works on plain polars `DataFrame`/`Series` values and
//! lazy expressions.

use crate::error::{FusionError, Result};
use chrono::{Datelike, NaiveDate};
use lazy_static::lazy_static;
use polars::prelude::*;
use regex::Regex;
use serde_json::{Map, Value};

/// One input/output row at the library boundary.
pub type Record = Map<String, Value>;

/// Separator used when several attribute values collapse into one cell.
pub const JOIN_SEPARATOR: &str = "; ";

lazy_static! {
    static ref NUMERIC_TEXT: Regex =
        Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?$").unwrap();
}

/// Parse a number from text, tolerating thousands separators and padding.
pub fn parse_number(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() || !NUMERIC_TEXT.is_match(&cleaned) {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Render a float the way identifiers are written: `10.0` -> `"10"`.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Empty, zero and the usual textual null spellings.
pub fn is_null_like(text: &str) -> bool {
    matches!(
        text.trim().to_lowercase().as_str(),
        "" | "0" | "0.0" | "null" | "none" | "nan" | "-"
    )
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    let head = trimmed.get(..10).unwrap_or(trimmed);
    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(head, fmt) {
            return Some(date);
        }
    }
    if trimmed.len() == 7 {
        if let Ok(date) = NaiveDate::parse_from_str(&format!("{}-01", trimmed), "%Y-%m-%d") {
            return Some(date);
        }
    }
    None
}

/// Sort key for date-like text: days since the common era when the value
/// parses as a date, the number itself when it parses as one, null otherwise.
pub fn ordering_key(series: &Series, name: &str) -> Result<Series> {
    if is_numeric(series) {
        let mut key = series.cast(&DataType::Float64)?;
        key.rename(name);
        return Ok(key);
    }
    let keys: Vec<Option<f64>> = string_values(series)?
        .into_iter()
        .map(|v| {
            v.and_then(|v| {
                parse_date(&v)
                    .map(|d| d.num_days_from_ce() as f64)
                    .or_else(|| parse_number(&v))
            })
        })
        .collect();
    Ok(Series::new(name, keys))
}

/// Distinct, sorted, `"; "`-joined text of one column within a group.
/// Already-joined cells are split first so repeated collapsing stays stable.
pub fn unique_join(name: &str) -> Expr {
    let parts = col(name)
        .cast(DataType::String)
        .str()
        .split(lit(JOIN_SEPARATOR))
        .explode()
        .str()
        .strip_chars(lit(NULL));
    parts
        .clone()
        .filter(parts.neq(lit("")))
        .unique()
        .sort(SortOptions::default())
        .str()
        .concat(JOIN_SEPARATOR, true)
        .alias(name)
}

/// Group by `keys` in order of first appearance and apply `aggs`. Null keys
/// form their own group; with no keys the whole frame is one group.
pub fn group_by_stable(df: &DataFrame, keys: &[String], aggs: Vec<Expr>) -> Result<DataFrame> {
    if keys.is_empty() {
        return Ok(df.clone().lazy().select(aggs).collect()?);
    }
    let by: Vec<Expr> = keys.iter().map(|k| col(k.as_str())).collect();
    Ok(df.clone().lazy().group_by_stable(by).agg(aggs).collect()?)
}

pub fn is_identifier_column(name: &str) -> bool {
    name == "id" || name.ends_with("_id")
}

pub fn is_date_column(name: &str) -> bool {
    name.contains("date") || name.contains("month")
}

pub fn is_numeric(series: &Series) -> bool {
    series.dtype().is_numeric()
}

pub fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names().iter().map(|s| s.to_string()).collect()
}

pub fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().iter().any(|c| *c == name)
}

/// First candidate that exists in the frame.
pub fn find_column(df: &DataFrame, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find(|c| has_column(df, c))
        .map(|c| c.to_string())
}

/// First column whose name contains any of the needles.
pub fn first_column_containing(df: &DataFrame, needles: &[&str]) -> Option<String> {
    df.get_column_names()
        .iter()
        .find(|name| needles.iter().any(|n| name.contains(n)))
        .map(|s| s.to_string())
}

/// The budget-bearing column: exactly `budget` when present, otherwise the
/// first column whose name contains "budget".
pub fn budget_column(df: &DataFrame) -> Option<String> {
    if has_column(df, "budget") {
        return Some("budget".to_string());
    }
    first_column_containing(df, &["budget"])
}

/// Sum of the budget column, `None` when the frame carries no budget.
pub fn budget_total(df: &DataFrame) -> Result<Option<f64>> {
    let Some(name) = budget_column(df) else {
        return Ok(None);
    };
    let values = numeric_values(df.column(&name)?)?;
    Ok(Some(values.into_iter().flatten().sum()))
}

/// Values as `f64`; text is parsed with [`parse_number`].
pub fn numeric_values(series: &Series) -> Result<Vec<Option<f64>>> {
    if series.dtype() == &DataType::String {
        return Ok(series
            .str()?
            .into_iter()
            .map(|v| v.and_then(parse_number))
            .collect());
    }
    let cast = series.cast(&DataType::Float64)?;
    Ok(cast.f64()?.into_iter().collect())
}

/// Values as text; floats render without a trailing `.0` when integral.
pub fn string_values(series: &Series) -> Result<Vec<Option<String>>> {
    if series.dtype().is_float() {
        let cast = series.cast(&DataType::Float64)?;
        return Ok(cast
            .f64()?
            .into_iter()
            .map(|v| v.map(format_number))
            .collect());
    }
    let cast = series.cast(&DataType::String)?;
    Ok(cast
        .str()?
        .into_iter()
        .map(|v| v.map(|s| s.to_string()))
        .collect())
}

/// Replace (or append) a column in place.
pub fn replace_series(df: &mut DataFrame, series: Series) -> Result<()> {
    df.with_column(series)?;
    Ok(())
}

/// Project to `names`, in that order. Unknown names are an error.
pub fn select_columns(df: &DataFrame, names: &[String]) -> Result<DataFrame> {
    let mut columns = Vec::with_capacity(names.len());
    for name in names {
        columns.push(df.column(name)?.clone());
    }
    Ok(DataFrame::new(columns)?)
}

pub fn filter_rows(df: &DataFrame, keep: &[bool]) -> Result<DataFrame> {
    if keep.len() != df.height() {
        return Err(FusionError::Execution(format!(
            "Row mask length {} does not match frame height {}",
            keep.len(),
            df.height()
        )));
    }
    let mask = BooleanChunked::from_slice("mask", keep);
    Ok(df.filter(&mask)?)
}

/// Fill nulls with zero, keeping integer columns integral.
pub fn fill_numeric_nulls(series: &Series) -> Result<Series> {
    if series.null_count() == 0 {
        return Ok(series.clone());
    }
    if series.dtype().is_integer() {
        let cast = series.cast(&DataType::Int64)?;
        let values: Vec<i64> = cast.i64()?.into_iter().map(|v| v.unwrap_or(0)).collect();
        return Ok(Series::new(series.name(), values));
    }
    let values: Vec<f64> = numeric_values(series)?
        .into_iter()
        .map(|v| v.unwrap_or(0.0))
        .collect();
    Ok(Series::new(series.name(), values))
}

pub fn fill_text_nulls(series: &Series) -> Result<Series> {
    if series.null_count() == 0 {
        return Ok(series.clone());
    }
    let values: Vec<String> = string_values(series)?
        .into_iter()
        .map(|v| v.unwrap_or_default())
        .collect();
    Ok(Series::new(series.name(), values))
}

/// Build a frame from JSON records. Column order follows first appearance;
/// a column is `Int64` when every present value is an integer, `Float64`
/// when every value is numeric, `Boolean` when every value is a bool, and
/// `String` otherwise.
pub fn records_to_dataframe(records: &[Record]) -> Result<DataFrame> {
    let mut names: Vec<String> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !names.contains(key) {
                names.push(key.clone());
            }
        }
    }
    if names.is_empty() {
        return Ok(DataFrame::empty());
    }

    let mut columns = Vec::with_capacity(names.len());
    for name in &names {
        let values: Vec<&Value> = records
            .iter()
            .map(|r| r.get(name).unwrap_or(&Value::Null))
            .collect();
        columns.push(series_from_json(name, &values));
    }
    Ok(DataFrame::new(columns)?)
}

fn series_from_json(name: &str, values: &[&Value]) -> Series {
    let present: Vec<&Value> = values.iter().copied().filter(|v| !v.is_null()).collect();

    if !present.is_empty() && present.iter().all(|v| v.is_i64()) {
        let data: Vec<Option<i64>> = values.iter().map(|v| v.as_i64()).collect();
        return Series::new(name, data);
    }
    if !present.is_empty() && present.iter().all(|v| v.is_number()) {
        let data: Vec<Option<f64>> = values.iter().map(|v| v.as_f64()).collect();
        return Series::new(name, data);
    }
    if !present.is_empty() && present.iter().all(|v| v.is_boolean()) {
        let data: Vec<Option<bool>> = values.iter().map(|v| v.as_bool()).collect();
        return Series::new(name, data);
    }

    let data: Vec<Option<String>> = values
        .iter()
        .map(|v| match v {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .collect();
    Series::new(name, data)
}

/// Convert a frame back into JSON records.
pub fn dataframe_to_records(df: &DataFrame) -> Result<Vec<Record>> {
    let mut rows = vec![Record::new(); df.height()];
    for series in df.get_columns() {
        let values = json_values(series)?;
        for (row, value) in rows.iter_mut().zip(values) {
            row.insert(series.name().to_string(), value);
        }
    }
    Ok(rows)
}

fn json_values(series: &Series) -> Result<Vec<Value>> {
    let dtype = series.dtype();
    if dtype == &DataType::Boolean {
        return Ok(series
            .bool()?
            .into_iter()
            .map(|v| v.map(Value::Bool).unwrap_or(Value::Null))
            .collect());
    }
    if dtype.is_integer() {
        let cast = series.cast(&DataType::Int64)?;
        return Ok(cast
            .i64()?
            .into_iter()
            .map(|v| v.map(Value::from).unwrap_or(Value::Null))
            .collect());
    }
    if dtype.is_float() {
        let cast = series.cast(&DataType::Float64)?;
        return Ok(cast
            .f64()?
            .into_iter()
            .map(|v| {
                v.and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            })
            .collect());
    }
    Ok(string_values(series)?
        .into_iter()
        .map(|v| v.map(Value::String).unwrap_or(Value::Null))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(value: Value) -> Vec<Record> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn test_parse_number_strips_separators() {
        assert_eq!(parse_number("1,234,567"), Some(1234567.0));
        assert_eq!(parse_number(" 12.5 "), Some(12.5));
        assert_eq!(parse_number("-3.97E+07"), Some(-39700000.0));
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn test_format_number_for_identifiers() {
        assert_eq!(format_number(10.0), "10");
        assert_eq!(format_number(10.5), "10.5");
    }

    #[test]
    fn test_unique_join_sorts_and_dedups() {
        let df = df!(
            "agency" => &["A", "A", "A", "A", "B"],
            "segment_name" => &[Some("Travel"), None, Some("Food"), Some("Food; Travel"), Some(" ")]
        )
        .unwrap();
        let out = group_by_stable(
            &df,
            &["agency".to_string()],
            vec![unique_join("segment_name")],
        )
        .unwrap();
        let joined = out.column("segment_name").unwrap().str().unwrap();
        assert_eq!(joined.get(0), Some("Food; Travel"));
        assert!(joined.get(1).unwrap_or("").is_empty());
    }

    #[test]
    fn test_ordering_key_prefers_dates() {
        let dates = Series::new("d", &[Some("2024-10-01"), Some("2024-02-01"), None]);
        let key = ordering_key(&dates, "k").unwrap();
        let key = key.f64().unwrap();
        assert!(key.get(1).unwrap() < key.get(0).unwrap());
        assert_eq!(key.get(2), None);

        let numbers = Series::new("d", &["9", "10"]);
        let key = ordering_key(&numbers, "k").unwrap();
        assert_eq!(key.f64().unwrap().get(0), Some(9.0));
    }

    #[test]
    fn test_records_roundtrip_infers_types() {
        let df = records_to_dataframe(&records(json!([
            {"campaign_id": 1, "agency": "A", "budget": 500.5},
            {"campaign_id": 2, "agency": null, "budget": 300}
        ])))
        .unwrap();

        assert_eq!(df.column("campaign_id").unwrap().dtype(), &DataType::Int64);
        assert_eq!(df.column("agency").unwrap().dtype(), &DataType::String);
        assert_eq!(df.column("budget").unwrap().dtype(), &DataType::Float64);

        let rows = dataframe_to_records(&df).unwrap();
        assert_eq!(rows[0]["agency"], json!("A"));
        assert_eq!(rows[1]["agency"], Value::Null);
        assert_eq!(rows[1]["budget"], json!(300.0));
    }

    #[test]
    fn test_group_by_stable_keeps_null_keys_in_order() {
        let df = records_to_dataframe(&records(json!([
            {"agency": "B", "budget": 1},
            {"agency": null, "budget": 2},
            {"agency": "B", "budget": 3},
            {"agency": null, "budget": 4}
        ])))
        .unwrap();
        let out = group_by_stable(&df, &["agency".to_string()], vec![col("budget").sum()]).unwrap();
        assert_eq!(out.height(), 2);
        let agencies = out.column("agency").unwrap().str().unwrap();
        assert_eq!(agencies.get(0), Some("B"));
        assert_eq!(agencies.get(1), None);
        let budget = out.column("budget").unwrap().i64().unwrap();
        assert_eq!(budget.get(0), Some(4));
        assert_eq!(budget.get(1), Some(6));
    }

    #[test]
    fn test_budget_total_prefers_exact_budget_column() {
        let df = df!(
            "planned_budget" => &[1.0, 2.0],
            "budget" => &[10.0, 20.0]
        )
        .unwrap();
        assert_eq!(budget_total(&df).unwrap(), Some(30.0));

        let no_budget = df!("clicks" => &[1i64, 2]).unwrap();
        assert_eq!(budget_total(&no_budget).unwrap(), None);
    }

    #[test]
    fn test_fill_nulls_by_kind() {
        let ints = Series::new("clicks", &[Some(1i64), None]);
        let filled = fill_numeric_nulls(&ints).unwrap();
        assert_eq!(filled.dtype(), &DataType::Int64);
        assert_eq!(filled.i64().unwrap().get(1), Some(0));

        let text = Series::new("agency", &[Some("A"), None]);
        let filled = fill_text_nulls(&text).unwrap();
        assert_eq!(filled.str().unwrap().get(1), Some(""));
    }
}
