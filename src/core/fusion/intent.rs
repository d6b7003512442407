//! Intent extraction
//!
//! Copies the caller's requested dimensions and metrics into the metadata
//! the later stages read. Dimension names are snapped onto the known
//! vocabulary; nothing here touches the data.

use crate::core::fusion::aliases::{known_dimensions, normalize_name};
use crate::core::fusion::context::ProcessingContext;
use crate::core::fusion::pipeline::FusionStage;
use crate::error::Result;

const FUZZY_THRESHOLD: f64 = 0.92;

#[derive(Debug, Default, Clone, Copy)]
pub struct IntentExtractor;

impl IntentExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Known dimension name for `raw`: exact (normalized) match first, then
    /// the closest Jaro-Winkler match above the threshold. Unknown names are
    /// returned trimmed.
    pub fn canonical_dimension(raw: &str) -> String {
        let wanted = normalize_name(raw);
        if let Some(exact) = known_dimensions().find(|d| normalize_name(d) == wanted) {
            return exact.to_string();
        }

        let best = known_dimensions()
            .map(|d| (d, strsim::jaro_winkler(&wanted, &normalize_name(d))))
            .filter(|(_, score)| *score >= FUZZY_THRESHOLD)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((dimension, _)) => dimension.to_string(),
            None => raw.trim().to_string(),
        }
    }

    pub fn extract(&self, ctx: &ProcessingContext) -> (Vec<String>, Vec<String>) {
        let Some(intent) = ctx.intent.as_ref() else {
            return (Vec::new(), Vec::new());
        };

        let mut dimensions: Vec<String> = Vec::new();
        for raw in &intent.dimensions {
            if raw.trim().is_empty() {
                continue;
            }
            let canonical = Self::canonical_dimension(raw);
            if !dimensions.contains(&canonical) {
                dimensions.push(canonical);
            }
        }

        let metrics = intent
            .metrics
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();

        (dimensions, metrics)
    }
}

impl FusionStage for IntentExtractor {
    fn name(&self) -> &'static str {
        "intent"
    }

    fn run(&self, mut ctx: ProcessingContext) -> Result<ProcessingContext> {
        let (dimensions, metrics) = self.extract(&ctx);
        ctx.log(format!(
            "intent: dimensions {:?}, metrics {:?}, calculation {:?}, level {}",
            dimensions,
            metrics,
            ctx.calculation_type(),
            ctx.query_level()
        ));
        ctx.metadata.requested_dimensions = dimensions;
        ctx.metadata.requested_metrics = metrics;
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fusion::context::QueryIntent;
    use polars::prelude::DataFrame;

    #[test]
    fn test_canonical_dimension_matching() {
        assert_eq!(IntentExtractor::canonical_dimension("ad format"), "Ad_Format");
        assert_eq!(IntentExtractor::canonical_dimension("AGENCY"), "Agency");
        assert_eq!(IntentExtractor::canonical_dimension("Advertizer"), "Advertiser");
        assert_eq!(IntentExtractor::canonical_dimension(" Weather "), "Weather");
    }

    #[test]
    fn test_absent_intent_yields_empty_lists() {
        let ctx = ProcessingContext::new(DataFrame::empty(), DataFrame::empty(), None);
        let ctx = IntentExtractor::new().run(ctx).unwrap();
        assert!(ctx.metadata.requested_dimensions.is_empty());
        assert!(ctx.metadata.requested_metrics.is_empty());
    }

    #[test]
    fn test_dimensions_are_deduplicated_and_metrics_trimmed() {
        let intent = QueryIntent::new()
            .with_dimensions(["agency", "Agency", ""])
            .with_metrics([" CTR ", ""]);
        let ctx = ProcessingContext::new(DataFrame::empty(), DataFrame::empty(), Some(intent));
        let ctx = IntentExtractor::new().run(ctx).unwrap();
        assert_eq!(ctx.metadata.requested_dimensions, vec!["Agency"]);
        assert_eq!(ctx.metadata.requested_metrics, vec!["CTR"]);
    }
}
