//! Ordering and row limit.

use crate::core::fusion::context::{CalculationType, ProcessingContext};
use crate::core::fusion::pipeline::FusionStage;
use crate::core::fusion::strategy::SortingStrategy;
use crate::data_utils::{
    budget_column, first_column_containing, is_numeric, numeric_values, ordering_key,
};
use crate::error::Result;
use polars::prelude::*;

const SORT_KEY: &str = "__sort_key";

#[derive(Debug, Clone, Copy)]
pub struct Sorter {
    ranking_threshold: usize,
    default_limit: usize,
}

impl Default for Sorter {
    fn default() -> Self {
        Self::new(20, 20)
    }
}

impl Sorter {
    pub fn new(ranking_threshold: usize, default_limit: usize) -> Self {
        Self {
            ranking_threshold,
            default_limit,
        }
    }

    /// Ordering for this request. Large Total results are presented as a
    /// ranking; otherwise the planned strategy decides.
    pub fn effective_order(
        &self,
        calculation: CalculationType,
        rows: usize,
        planned: SortingStrategy,
    ) -> SortingStrategy {
        match calculation {
            CalculationType::Ranking => SortingStrategy::Ranking,
            CalculationType::Trend => SortingStrategy::Trend,
            CalculationType::Total if rows > self.ranking_threshold => SortingStrategy::Ranking,
            _ => planned,
        }
    }

    pub fn limit(&self, requested: Option<usize>) -> usize {
        requested.filter(|l| *l > 0).unwrap_or(self.default_limit)
    }

    /// Stable sort; nulls always last. Returns the frame unchanged when the
    /// sort column does not exist.
    pub fn sort(&self, df: &DataFrame, order: SortingStrategy) -> Result<(DataFrame, Option<String>)> {
        let (column, key, descending) = match order {
            SortingStrategy::Ranking => {
                let Some(column) = budget_column(df) else {
                    return Ok((df.clone(), None));
                };
                let series = df.column(&column)?;
                let key = if is_numeric(series) {
                    series.cast(&DataType::Float64)?
                } else {
                    Series::new(SORT_KEY, numeric_values(series)?)
                };
                (column, key, true)
            }
            SortingStrategy::Trend => {
                let Some(column) = first_column_containing(df, &["date", "month"]) else {
                    return Ok((df.clone(), None));
                };
                let key = ordering_key(df.column(&column)?, SORT_KEY)?;
                (column, key, false)
            }
            SortingStrategy::None => return Ok((df.clone(), None)),
        };

        let mut keyed = df.clone();
        keyed.with_column(key.with_name(SORT_KEY))?;
        let sorted = keyed
            .sort(
                [SORT_KEY],
                SortMultipleOptions::default()
                    .with_order_descending(descending)
                    .with_nulls_last(true)
                    .with_maintain_order(true),
            )?
            .drop(SORT_KEY)?;
        Ok((sorted, Some(column)))
    }
}

impl FusionStage for Sorter {
    fn name(&self) -> &'static str {
        "sort"
    }

    fn run(&self, mut ctx: ProcessingContext) -> Result<ProcessingContext> {
        let planned = ctx.strategy()?.sorting_strategy;
        let result = ctx.result()?;
        let order = self.effective_order(ctx.calculation_type(), result.height(), planned);
        let (sorted, column) = self.sort(result, order)?;

        let limit = self.limit(ctx.requested_limit());
        let before = sorted.height();
        let limited = sorted.head(Some(limit));
        ctx.log(format!(
            "sort: {:?} by {:?}, {} -> {} rows (limit {})",
            order,
            column,
            before,
            limited.height(),
            limit
        ));
        ctx.result = Some(limited);
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;

    #[test]
    fn test_large_total_becomes_ranking() {
        let sorter = Sorter::default();
        assert_eq!(
            sorter.effective_order(CalculationType::Total, 21, SortingStrategy::None),
            SortingStrategy::Ranking
        );
        assert_eq!(
            sorter.effective_order(CalculationType::Total, 20, SortingStrategy::None),
            SortingStrategy::None
        );
        assert_eq!(
            sorter.effective_order(CalculationType::Comparison, 3, SortingStrategy::Trend),
            SortingStrategy::Trend
        );
    }

    #[test]
    fn test_ranking_is_descending_with_nulls_last() {
        let df = df!(
            "agency" => &["A", "B", "C", "D"],
            "budget" => &[Some(100.0), None, Some(300.0), Some(100.0)]
        )
        .unwrap();
        let (sorted, column) = Sorter::default().sort(&df, SortingStrategy::Ranking).unwrap();
        assert_eq!(column.as_deref(), Some("budget"));
        let agencies: Vec<Option<&str>> = sorted.column("agency").unwrap().str().unwrap().into_iter().collect();
        assert_eq!(agencies, vec![Some("C"), Some("A"), Some("D"), Some("B")]);
    }

    #[test]
    fn test_trend_sorts_dates_ascending() {
        let df = df!(
            "start_date" => &["2024-10-01", "2024-02-01", "2024-03-15"],
            "budget" => &[1.0, 2.0, 3.0]
        )
        .unwrap();
        let (sorted, _) = Sorter::default().sort(&df, SortingStrategy::Trend).unwrap();
        let budgets: Vec<Option<f64>> = sorted.column("budget").unwrap().f64().unwrap().into_iter().collect();
        assert_eq!(budgets, vec![Some(2.0), Some(3.0), Some(1.0)]);
    }

    #[test]
    fn test_trend_compares_dates_not_text() {
        let df = df!(
            "start_month" => &[Some("2024/12/01"), None, Some("2024-03-01")],
            "budget" => &[1.0, 2.0, 3.0]
        )
        .unwrap();
        let (sorted, column) = Sorter::default().sort(&df, SortingStrategy::Trend).unwrap();
        assert_eq!(column.as_deref(), Some("start_month"));
        let budgets: Vec<Option<f64>> = sorted.column("budget").unwrap().f64().unwrap().into_iter().collect();
        assert_eq!(budgets, vec![Some(3.0), Some(1.0), Some(2.0)]);
        assert_eq!(sorted.width(), 2);
    }

    #[test]
    fn test_ranking_without_budget_is_unsorted() {
        let df = df!("agency" => &["B", "A"]).unwrap();
        let (sorted, column) = Sorter::default().sort(&df, SortingStrategy::Ranking).unwrap();
        assert!(column.is_none());
        assert!(sorted.equals(&df));
    }

    #[test]
    fn test_limit_defaults() {
        let sorter = Sorter::new(20, 20);
        assert_eq!(sorter.limit(None), 20);
        assert_eq!(sorter.limit(Some(5)), 5);
        assert_eq!(sorter.limit(Some(0)), 20);
    }
}
