//! Data Fusion Pipeline
//!
//! Reconciles a budget-grained primary table with an event-grained secondary
//! table into one de-duplicated, aggregated result:
//! - Table ingestion and join-key normalization
//! - Fan-out pre-aggregation
//! - Strategy planning (rules, optional external planner, decision cache)
//! - Merge, aggregation and budget validation
//! - KPIs, column selection, ordering and presentation

pub mod aggregate;
pub mod aliases;
pub mod budget;
pub mod column_filter;
pub mod context;
pub mod format;
pub mod ingest;
pub mod intent;
pub mod kpi;
pub mod merge;
pub mod pipeline;
pub mod pre_aggregate;
pub mod sort;
pub mod strategy;
pub mod strategy_cache;

pub use context::{BudgetCheckpoint, CalculationType, ProcessingContext, QueryIntent, QueryLevel};
pub use pipeline::{FusionOutput, FusionPipeline, FusionRequest, FusionStage};
pub use strategy::{
    AdFormatFilter, AggregationMode, FusionStrategy, Planner, RuleBasedPlanner, SortingStrategy,
};
