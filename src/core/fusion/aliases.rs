//! Column Alias Table
//!
//! Canonical dimension/metric names mapped to ordered lists of candidate
//! physical columns. Resolution is done once per request against the
//! columns actually present; the first candidate that exists wins.

use polars::prelude::DataFrame;

use crate::data_utils::find_column;

/// Bumped whenever a candidate list changes meaningfully.
pub const ALIAS_TABLE_VERSION: u32 = 1;

pub const CAMPAIGN_ID: &str = "campaign_id";
pub const AD_FORMAT_ID: &str = "ad_format_type_id";
pub const ITEM: &str = "item";
pub const TOTAL_LABEL: &str = "Total";

pub const CTR: &str = "ctr";
pub const VTR: &str = "vtr";
pub const ER: &str = "er";
pub const KPI_COLUMNS: [&str; 3] = [CTR, VTR, ER];

/// One-to-many attribute that repeats primary rows (audience segments).
pub const FAN_OUT_CANDIDATES: &[&str] = &[
    "segment_name",
    "audience_segment",
    "segment",
    "target_audience",
];

/// Columns that vary together with the fan-out attribute.
pub const FAN_OUT_COMPANIONS: &[&str] = &["segment_id", "audience_segment_id"];

pub const CAMPAIGN_NAME_CANDIDATES: &[&str] = &["campaign_name", "campaign_title"];
pub const AD_FORMAT_CANDIDATES: &[&str] = &["ad_format", "ad_format_name", AD_FORMAT_ID];
pub const AGENCY_CANDIDATES: &[&str] = &["agency", "agency_name"];
pub const ADVERTISER_CANDIDATES: &[&str] = &["advertiser", "advertiser_name"];

pub const EFFECTIVE_IMPRESSION_CANDIDATES: &[&str] =
    &["effective_impressions", "effective_impression"];
pub const TOTAL_IMPRESSION_CANDIDATES: &[&str] =
    &["total_impressions", "impressions", "impression"];
pub const CLICK_CANDIDATES: &[&str] = &["clicks", "total_clicks", "click"];
pub const COMPLETE_VIEW_CANDIDATES: &[&str] =
    &["total_q100_views", "q100_views", "complete_views"];
pub const ENGAGEMENT_CANDIDATES: &[&str] =
    &["engagements", "total_engagements", "engagement"];

/// Name fragments that mark a column as a metric to be coerced to numbers.
pub const METRIC_KEYWORDS: &[&str] = &[
    "budget",
    "sum",
    "price",
    "count",
    "impression",
    "click",
    "view",
    "engagement",
];

pub const HIDDEN_COLUMNS: &[&str] = &[
    "id",
    CAMPAIGN_ID,
    "contract_id",
    "agency_id",
    "advertiser_id",
    "segment_id",
    "audience_segment_id",
];

pub const PREFERRED_ORDER: &[&str] = &[
    ITEM,
    "agency",
    "advertiser",
    "campaign_name",
    "ad_format",
    AD_FORMAT_ID,
    "segment_name",
    "start_date",
    "end_date",
    "budget",
    "effective_impressions",
    "total_impressions",
    "clicks",
    "total_q100_views",
    "engagements",
    CTR,
    VTR,
    ER,
];

pub struct AliasEntry {
    pub name: &'static str,
    pub candidates: &'static [&'static str],
}

pub const DIMENSION_ALIASES: &[AliasEntry] = &[
    AliasEntry { name: "Agency", candidates: AGENCY_CANDIDATES },
    AliasEntry { name: "Advertiser", candidates: ADVERTISER_CANDIDATES },
    AliasEntry { name: "Ad_Format", candidates: AD_FORMAT_CANDIDATES },
    AliasEntry { name: "Segment", candidates: FAN_OUT_CANDIDATES },
    AliasEntry { name: "Audience", candidates: FAN_OUT_CANDIDATES },
    AliasEntry { name: "Campaign", candidates: &["campaign_name", "campaign_title", CAMPAIGN_ID] },
    AliasEntry { name: "Month", candidates: &["month", "start_month"] },
    AliasEntry { name: "Date", candidates: &["start_date", "date"] },
    AliasEntry { name: "Platform", candidates: &["platform", "media"] },
];

pub const METRIC_ALIASES: &[AliasEntry] = &[
    AliasEntry { name: "Budget_Sum", candidates: &["budget", "budget_sum", "total_budget"] },
    AliasEntry { name: "Budget", candidates: &["budget", "budget_sum", "total_budget"] },
    AliasEntry {
        name: "Impression",
        candidates: &["effective_impressions", "total_impressions", "impressions"],
    },
    AliasEntry {
        name: "Impressions",
        candidates: &["effective_impressions", "total_impressions", "impressions"],
    },
    AliasEntry { name: "Click", candidates: CLICK_CANDIDATES },
    AliasEntry { name: "Clicks", candidates: CLICK_CANDIDATES },
    AliasEntry { name: "View", candidates: COMPLETE_VIEW_CANDIDATES },
    AliasEntry { name: "Views", candidates: COMPLETE_VIEW_CANDIDATES },
    AliasEntry { name: "Engagement", candidates: ENGAGEMENT_CANDIDATES },
    AliasEntry { name: "Engagements", candidates: ENGAGEMENT_CANDIDATES },
    AliasEntry { name: "CTR", candidates: &[CTR] },
    AliasEntry { name: "VTR", candidates: &[VTR] },
    AliasEntry { name: "ER", candidates: &[ER] },
];

const PERFORMANCE_METRICS: &[&str] = &[
    "ctr",
    "vtr",
    "er",
    "impression",
    "impressions",
    "click",
    "clicks",
];

const DISPLAY_NAMES: &[(&str, &str)] = &[
    (ITEM, "Item"),
    ("agency", "Agency"),
    ("agency_name", "Agency"),
    ("advertiser", "Advertiser"),
    ("advertiser_name", "Advertiser"),
    ("campaign_name", "Campaign_Name"),
    ("ad_format", "Ad_Format"),
    ("ad_format_name", "Ad_Format"),
    (AD_FORMAT_ID, "Ad_Format_ID"),
    ("segment_name", "Segment"),
    ("audience_segment", "Segment"),
    ("start_date", "Start_Date"),
    ("end_date", "End_Date"),
    ("month", "Month"),
    ("budget", "Budget_Sum"),
    ("budget_sum", "Budget_Sum"),
    ("effective_impressions", "Effective_Impressions"),
    ("total_impressions", "Impressions"),
    ("impressions", "Impressions"),
    ("clicks", "Clicks"),
    ("total_q100_views", "Complete_Views"),
    ("engagements", "Engagements"),
    (CTR, "CTR"),
    (VTR, "VTR"),
    (ER, "ER"),
];

/// Lower-case and drop separators: "Ad Format", "ad-format", "AD_FORMAT"
/// all become "adformat".
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn lookup(table: &'static [AliasEntry], name: &str) -> Option<&'static AliasEntry> {
    let wanted = normalize_name(name);
    table.iter().find(|e| normalize_name(e.name) == wanted)
}

pub fn dimension_candidates(dimension: &str) -> Option<&'static [&'static str]> {
    lookup(DIMENSION_ALIASES, dimension).map(|e| e.candidates)
}

/// Candidate columns for a metric; unknown metrics fall back to their
/// lower-cased name.
pub fn metric_candidates(metric: &str) -> Vec<String> {
    match lookup(METRIC_ALIASES, metric) {
        Some(entry) => entry.candidates.iter().map(|c| c.to_string()).collect(),
        None => vec![metric.trim().to_lowercase()],
    }
}

pub fn known_dimensions() -> impl Iterator<Item = &'static str> {
    DIMENSION_ALIASES.iter().map(|e| e.name)
}

pub fn resolve_dimension(df: &DataFrame, dimension: &str) -> Option<String> {
    dimension_candidates(dimension).and_then(|candidates| find_column(df, candidates))
}

pub fn resolve_metric(df: &DataFrame, metric: &str) -> Option<String> {
    let candidates = metric_candidates(metric);
    let refs: Vec<&str> = candidates.iter().map(String::as_str).collect();
    find_column(df, &refs)
}

pub fn is_ad_format_dimension(dimension: &str) -> bool {
    normalize_name(dimension) == "adformat"
}

pub fn is_segment_dimension(dimension: &str) -> bool {
    matches!(
        normalize_name(dimension).as_str(),
        "segment" | "audience" | "audiencesegment"
    )
}

pub fn is_performance_metric(metric: &str) -> bool {
    PERFORMANCE_METRICS.contains(&normalize_name(metric).as_str())
}

pub fn is_metric_column(name: &str) -> bool {
    METRIC_KEYWORDS.iter().any(|k| name.contains(k))
}

pub fn is_attribute_column(name: &str) -> bool {
    FAN_OUT_CANDIDATES.contains(&name)
}

pub fn is_hidden_column(name: &str) -> bool {
    HIDDEN_COLUMNS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

pub fn display_name(column: &str) -> Option<&'static str> {
    DISPLAY_NAMES
        .iter()
        .find(|(internal, _)| *internal == column)
        .map(|(_, display)| *display)
}

/// The caller's request names this KPI (e.g. "CTR" or "ctr").
pub fn is_requested_kpi(kpi: &str, requested_metrics: &[String]) -> bool {
    requested_metrics
        .iter()
        .any(|m| normalize_name(m) == normalize_name(kpi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;

    #[test]
    fn test_dimension_lookup_is_case_and_separator_insensitive() {
        assert_eq!(dimension_candidates("ad format"), Some(AD_FORMAT_CANDIDATES));
        assert_eq!(dimension_candidates("AGENCY"), Some(AGENCY_CANDIDATES));
        assert!(dimension_candidates("weather").is_none());
    }

    #[test]
    fn test_metric_candidates_fall_back_to_name() {
        assert_eq!(
            metric_candidates("Budget_Sum"),
            vec!["budget", "budget_sum", "total_budget"]
        );
        assert_eq!(metric_candidates(" Spend "), vec!["spend"]);
    }

    #[test]
    fn test_resolve_uses_priority_order() {
        let df = df!(
            "ad_format_type_id" => &["10"],
            "ad_format" => &["Banner"],
            "budget_sum" => &[1.0]
        )
        .unwrap();
        assert_eq!(resolve_dimension(&df, "Ad_Format").as_deref(), Some("ad_format"));
        assert_eq!(resolve_metric(&df, "Budget_Sum").as_deref(), Some("budget_sum"));
        assert_eq!(resolve_metric(&df, "CTR"), None);
    }

    #[test]
    fn test_metric_classification() {
        assert!(is_performance_metric("CTR"));
        assert!(is_performance_metric("Clicks"));
        assert!(!is_performance_metric("Budget_Sum"));
        assert!(is_metric_column("total_q100_views"));
        assert!(!is_metric_column("agency"));
        assert!(is_hidden_column("Campaign_ID"));
    }
}
