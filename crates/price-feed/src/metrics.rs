//! Update latency, failure and source health counters

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use oracle_core::{AggregatedPrice, MetricsSnapshot, SourceHealth};

/// Smoothing factor for the commit latency average
const LATENCY_EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Default)]
struct MetricsInner {
    total_updates: u64,
    failed_updates: u64,
    failures_by_reason: HashMap<String, u64>,
    average_latency: Option<Duration>,
    last_update_time: Option<DateTime<Utc>>,
}

/// Thread-safe metrics accumulator
///
/// Readers get an owned `MetricsSnapshot`, never a view into live state.
/// Source health is sharded so ingestion for unrelated sources never
/// contends with commit bookkeeping.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    inner: RwLock<MetricsInner>,
    sources: DashMap<String, SourceHealth>,
    dropped_deliveries: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful commit
    pub fn record_update(&self, price: &AggregatedPrice, latency: Duration) {
        let mut inner = self.inner.write();
        inner.total_updates += 1;
        inner.last_update_time = Some(price.timestamp);
        inner.average_latency = Some(match inner.average_latency {
            None => latency,
            Some(avg) => Duration::from_secs_f64(
                LATENCY_EMA_ALPHA * latency.as_secs_f64()
                    + (1.0 - LATENCY_EMA_ALPHA) * avg.as_secs_f64(),
            ),
        });
    }

    /// Record a skipped or abandoned commit
    pub fn record_failed_update(&self, asset_id: &str, reason: &str) {
        let mut inner = self.inner.write();
        inner.failed_updates += 1;
        *inner.failures_by_reason.entry(reason.to_string()).or_insert(0) += 1;
        debug!("Failed update for {}: {}", asset_id, reason);
    }

    /// Overwrite a source's health score
    pub fn update_source_health(&self, source: &str, health_score: f64) -> SourceHealth {
        let mut health = self
            .sources
            .entry(source.to_string())
            .or_insert_with(|| SourceHealth::new(source));
        health.set_score(health_score);
        health.clone()
    }

    /// Record an accepted observation; returns the updated health
    pub fn record_source_success(&self, source: &str, latency: Duration) -> SourceHealth {
        let mut health = self
            .sources
            .entry(source.to_string())
            .or_insert_with(|| SourceHealth::new(source));
        health.record_success(Utc::now(), latency);
        health.clone()
    }

    /// Record a rejected observation or upstream failure; returns the updated health
    pub fn record_source_failure(&self, source: &str, reason: &str) -> SourceHealth {
        let mut health = self
            .sources
            .entry(source.to_string())
            .or_insert_with(|| SourceHealth::new(source));
        health.record_failure(Utc::now(), reason);
        health.clone()
    }

    /// A subscriber queue overflowed and lost its oldest update
    pub fn record_dropped_delivery(&self, asset_id: &str) {
        self.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
        debug!("Dropped oldest queued update for a slow {} subscriber", asset_id);
    }

    pub fn source_health(&self, source: &str) -> Option<SourceHealth> {
        self.sources.get(source).map(|h| h.value().clone())
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let inner = self.inner.read();
        MetricsSnapshot {
            total_updates: inner.total_updates,
            failed_updates: inner.failed_updates,
            failures_by_reason: inner.failures_by_reason.clone(),
            average_latency: inner.average_latency.unwrap_or_default(),
            last_update_time: inner.last_update_time,
            dropped_deliveries: self.dropped_deliveries.load(Ordering::Relaxed),
            per_source_health: self
                .sources
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }
}
