//! Strategy decision cache
//!
//! Repeated query shapes reuse their `FusionStrategy` for a TTL window. The
//! key covers the requested intent and every property of the input tables
//! the rules read, so two requests only share a strategy when planning them
//! would give the same answer.
//! Entries live in a `DashMap` so concurrent requests can share one cache;
//! a lost update only costs a miss.

use crate::core::fusion::context::{CalculationType, QueryLevel};
use crate::core::fusion::strategy::FusionStrategy;
use dashmap::DashMap;
use itertools::Itertools;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Time source, injectable so TTL expiry can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when advanced explicitly.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Table properties the planning rules depend on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DataShape {
    pub calculation_type: CalculationType,
    pub primary_has_ad_format: bool,
    pub secondary_has_ad_format: bool,
    pub has_fan_out: bool,
    pub above_ranking_threshold: bool,
}

/// (query level, sorted dimensions, sorted metrics, data shape)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StrategyCacheKey {
    level: QueryLevel,
    dimensions: Vec<String>,
    metrics: Vec<String>,
    shape: DataShape,
}

impl StrategyCacheKey {
    pub fn new(level: QueryLevel, dimensions: &[String], metrics: &[String]) -> Self {
        Self {
            level,
            dimensions: dimensions.iter().cloned().sorted().collect(),
            metrics: metrics.iter().cloned().sorted().collect(),
            shape: DataShape::default(),
        }
    }

    pub fn with_shape(mut self, shape: DataShape) -> Self {
        self.shape = shape;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CachedStrategy {
    strategy: FusionStrategy,
    inserted_at: Instant,
}

pub struct StrategyCache {
    entries: DashMap<StrategyCacheKey, CachedStrategy>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StrategyCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fresh entry for `key`; expired entries are evicted on the way.
    pub fn get(&self, key: &StrategyCacheKey) -> Option<FusionStrategy> {
        let now = self.clock.now();
        let lookup = self
            .entries
            .get(key)
            .map(|entry| (entry.strategy.clone(), entry.inserted_at));

        match lookup {
            Some((strategy, inserted_at)) if now.saturating_duration_since(inserted_at) < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(strategy)
            }
            Some(_) => {
                self.entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: StrategyCacheKey, strategy: FusionStrategy) {
        self.entries.insert(
            key,
            CachedStrategy {
                strategy,
                inserted_at: self.clock.now(),
            },
        );
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fusion::strategy::{AdFormatFilter, AggregationMode, SortingStrategy};

    fn strategy() -> FusionStrategy {
        FusionStrategy {
            use_pre_aggregation: false,
            merge_keys: vec!["campaign_id".to_string()],
            aggregation_mode: AggregationMode::Total,
            filter_ad_format: AdFormatFilter::None,
            sorting_strategy: SortingStrategy::None,
            hide_zero_metrics: true,
        }
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_key_ignores_request_order() {
        let a = StrategyCacheKey::new(
            QueryLevel::Execution,
            &names(&["Agency", "Ad_Format"]),
            &names(&["CTR", "Budget_Sum"]),
        );
        let b = StrategyCacheKey::new(
            QueryLevel::Execution,
            &names(&["Ad_Format", "Agency"]),
            &names(&["Budget_Sum", "CTR"]),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_separates_data_shapes() {
        let base = StrategyCacheKey::new(QueryLevel::Contract, &[], &names(&["Clicks"]));
        let with_formats = base.clone().with_shape(DataShape {
            primary_has_ad_format: true,
            secondary_has_ad_format: true,
            ..DataShape::default()
        });
        let trend = base.clone().with_shape(DataShape {
            calculation_type: CalculationType::Trend,
            ..DataShape::default()
        });
        assert_ne!(base, with_formats);
        assert_ne!(base, trend);
        assert_eq!(base, base.clone().with_shape(DataShape::default()));

        let cache = StrategyCache::new(Duration::from_secs(3600));
        cache.insert(base.clone(), strategy());
        assert!(cache.get(&with_formats).is_none());
        assert!(cache.get(&base).is_some());
    }

    #[test]
    fn test_hits_and_misses_are_counted() {
        let cache = StrategyCache::new(Duration::from_secs(3600));
        let key = StrategyCacheKey::new(QueryLevel::Contract, &[], &names(&["Budget_Sum"]));

        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), strategy());
        assert_eq!(cache.get(&key), Some(strategy()));
        assert_eq!(cache.get(&key), Some(strategy()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let clock = Arc::new(ManualClock::new());
        let cache = StrategyCache::with_clock(Duration::from_secs(3600), clock.clone());
        let key = StrategyCacheKey::new(QueryLevel::Strategy, &names(&["Agency"]), &[]);
        cache.insert(key.clone(), strategy());

        clock.advance(Duration::from_secs(3599));
        assert!(cache.get(&key).is_some());

        clock.advance(Duration::from_secs(2));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(StrategyCache::new(Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let key = StrategyCacheKey::new(
                        QueryLevel::Contract,
                        &[format!("dim{}", i % 2)],
                        &[],
                    );
                    if cache.get(&key).is_none() {
                        cache.insert(key, strategy());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 8);
        assert_eq!(stats.entries, 2);
    }
}
