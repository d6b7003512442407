//! Derived KPIs: CTR, VTR and ER against a shared impression denominator.

use crate::core::fusion::aliases::{
    CLICK_CANDIDATES, COMPLETE_VIEW_CANDIDATES, CTR, EFFECTIVE_IMPRESSION_CANDIDATES,
    ENGAGEMENT_CANDIDATES, ER, TOTAL_IMPRESSION_CANDIDATES, VTR,
};
use crate::core::fusion::context::ProcessingContext;
use crate::core::fusion::pipeline::FusionStage;
use crate::data_utils::{find_column, first_column_containing, numeric_values, replace_series, round2};
use crate::error::Result;
use polars::prelude::*;

#[derive(Debug, Default, Clone, Copy)]
pub struct KpiCalculator;

impl KpiCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Effective impressions when present, total impressions otherwise.
    pub fn denominator_column(df: &DataFrame) -> Option<String> {
        find_column(df, EFFECTIVE_IMPRESSION_CANDIDATES)
            .or_else(|| find_column(df, TOTAL_IMPRESSION_CANDIDATES))
    }

    /// Adds `ctr`, `vtr` and `er` for every numerator present. Returns the
    /// names of the columns written.
    pub fn apply(&self, df: &mut DataFrame) -> Result<Vec<String>> {
        let Some(denominator) = Self::denominator_column(df) else {
            return Ok(Vec::new());
        };
        let den = numeric_values(df.column(&denominator)?)?;

        let mut written = Vec::new();
        for (kpi, numerators) in [
            (CTR, CLICK_CANDIDATES),
            (VTR, COMPLETE_VIEW_CANDIDATES),
            (ER, ENGAGEMENT_CANDIDATES),
        ] {
            let Some(numerator) = find_column(df, numerators) else {
                continue;
            };
            let num = numeric_values(df.column(&numerator)?)?;
            let ratios: Vec<f64> = num
                .iter()
                .zip(den.iter())
                .map(|(n, d)| ratio(*n, *d))
                .collect();
            replace_series(df, Series::new(kpi, ratios))?;
            written.push(kpi.to_string());
        }
        Ok(written)
    }
}

/// Percentage rounded to two decimals; zero when the denominator is zero or
/// missing.
pub fn ratio(numerator: Option<f64>, denominator: Option<f64>) -> f64 {
    match denominator {
        Some(d) if d != 0.0 => round2(numerator.unwrap_or(0.0) / d * 100.0),
        _ => 0.0,
    }
}

impl FusionStage for KpiCalculator {
    fn name(&self) -> &'static str {
        "kpi"
    }

    fn should_run(&self, ctx: &ProcessingContext) -> bool {
        ctx.aggregated
            .as_ref()
            .is_some_and(|df| first_column_containing(df, &["impression"]).is_some())
    }

    fn run(&self, mut ctx: ProcessingContext) -> Result<ProcessingContext> {
        let Some(mut aggregated) = ctx.aggregated.take() else {
            return Ok(ctx);
        };
        let denominator = Self::denominator_column(&aggregated);
        let written = self.apply(&mut aggregated)?;
        ctx.log(format!(
            "kpi: denominator {:?}, computed {:?}",
            denominator, written
        ));
        ctx.aggregated = Some(aggregated);
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratios_use_effective_impressions_first() {
        let mut df = df!(
            "effective_impressions" => &[1000.0, 0.0],
            "total_impressions" => &[4000.0, 10.0],
            "clicks" => &[20.0, 5.0],
            "total_q100_views" => &[333.0, 1.0]
        )
        .unwrap();
        let written = KpiCalculator::new().apply(&mut df).unwrap();
        assert_eq!(written, vec!["ctr", "vtr"]);

        let ctr = df.column("ctr").unwrap().f64().unwrap();
        assert_eq!(ctr.get(0), Some(2.0));
        assert_eq!(ctr.get(1), Some(0.0));
        assert_eq!(df.column("vtr").unwrap().f64().unwrap().get(0), Some(33.3));
        assert!(df.column("er").is_err());
    }

    #[test]
    fn test_total_impressions_fallback() {
        let mut df = df!("total_impressions" => &[200i64], "engagements" => &[3i64]).unwrap();
        KpiCalculator::new().apply(&mut df).unwrap();
        assert_eq!(df.column("er").unwrap().f64().unwrap().get(0), Some(1.5));
    }

    #[test]
    fn test_ratio_edge_cases() {
        assert_eq!(ratio(Some(1.0), Some(3.0)), 33.33);
        assert_eq!(ratio(Some(5.0), Some(0.0)), 0.0);
        assert_eq!(ratio(Some(5.0), None), 0.0);
        assert_eq!(ratio(None, Some(10.0)), 0.0);
    }

    #[test]
    fn test_skipped_without_impressions() {
        let mut ctx = ProcessingContext::new(DataFrame::empty(), DataFrame::empty(), None);
        ctx.aggregated = Some(df!("clicks" => &[1i64]).unwrap());
        assert!(!KpiCalculator::new().should_run(&ctx));
    }
}
