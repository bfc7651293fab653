//! Price aggregator - owns per-asset state and runs the commit cycle

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use oracle_core::{
    AggregatedPrice, AssetConfig, EngineConfig, MetricsSnapshot, OracleError, OracleResult,
    PricePoint, PriceUpdatePolicy, SourceHealth, StorageError, ValidationError,
};

use crate::aggregation::aggregate;
use crate::alerts::{AlertManager, AlertSink};
use crate::metrics::MetricsCollector;
use crate::state::{AssetState, PriceState, PriceStateStats};
use crate::store::{MemoryPriceStore, PriceStore};
use crate::subscription::{Subscription, SubscriptionId};
use crate::validator::PriceValidator;

/// Lifecycle of an aggregator instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    /// Terminal
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Created => "created",
            EngineState::Running => "running",
            EngineState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Shared by the facade and the background tasks
struct EngineCore {
    config: EngineConfig,
    state: PriceState,
    store: Arc<dyn PriceStore>,
    validator: PriceValidator,
    metrics: Arc<MetricsCollector>,
    alerts: Arc<AlertManager>,
    engine_state: RwLock<EngineState>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    /// Sources currently below the failure floor
    failing_sources: DashSet<String>,
}

struct Lifecycle {
    handles: Vec<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

/// Builder for `PriceAggregator`
pub struct AggregatorBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn PriceStore>>,
    alerts: Option<AlertManager>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl AggregatorBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            alerts: None,
            metrics: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn PriceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the default log sink with an explicit alert manager
    pub fn alerts(mut self, alerts: AlertManager) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Add a sink to the alert manager
    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        let alerts = self.alerts.take().unwrap_or_default();
        self.alerts = Some(alerts.with_sink(sink));
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> OracleResult<PriceAggregator> {
        self.config.validate()?;

        let state = PriceState::new(self.config.default_policy.clone());
        for asset in &self.config.assets {
            state.register(asset);
        }

        let core = EngineCore {
            state,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryPriceStore::new())),
            validator: PriceValidator::new(),
            metrics: self.metrics.unwrap_or_default(),
            alerts: Arc::new(self.alerts.unwrap_or_default()),
            engine_state: RwLock::new(EngineState::Created),
            started_at: RwLock::new(None),
            failing_sources: DashSet::new(),
            config: self.config,
        };

        Ok(PriceAggregator {
            core: Arc::new(core),
            lifecycle: Mutex::new(Lifecycle {
                handles: vec![],
                shutdown: None,
            }),
        })
    }
}

/// Main price aggregator
pub struct PriceAggregator {
    core: Arc<EngineCore>,
    lifecycle: Mutex<Lifecycle>,
}

impl PriceAggregator {
    /// Aggregator backed by an in-memory store
    pub fn new(config: EngineConfig) -> OracleResult<Self> {
        AggregatorBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> AggregatorBuilder {
        AggregatorBuilder::new(config)
    }

    pub fn state(&self) -> EngineState {
        *self.core.engine_state.read()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Track a new asset at runtime; false if it was already tracked
    pub fn register_asset(&self, config: AssetConfig) -> OracleResult<bool> {
        if config.asset_id.is_empty() {
            return Err(OracleError::Config("asset id must not be empty".into()));
        }
        if let Some(policy) = &config.policy {
            policy.validate()?;
        }
        let added = self.core.state.register(&config);
        if added {
            info!("Registered asset {} ({} sources)", config.asset_id, config.sources.len());
        }
        Ok(added)
    }

    pub fn asset_ids(&self) -> Vec<String> {
        self.core.state.asset_ids()
    }

    /// Buffer one observation. Never touches the store.
    pub fn ingest(&self, point: PricePoint) -> OracleResult<()> {
        self.core.ingest(point)
    }

    /// Connector-reported upstream failure for `source`
    pub fn report_source_failure(&self, source: &str, reason: &str) -> SourceHealth {
        let health = self.core.metrics.record_source_failure(source, reason);
        self.core.check_source_floor(&health);
        health
    }

    /// Operator override of a source's health score
    pub fn update_source_health(&self, source: &str, health_score: f64) -> SourceHealth {
        let health = self.core.metrics.update_source_health(source, health_score);
        self.core.check_source_floor(&health);
        health
    }

    /// Run one commit cycle for `asset_id` now
    pub async fn commit(&self, asset_id: &str) -> OracleResult<AggregatedPrice> {
        if self.state() == EngineState::Stopped {
            return Err(OracleError::InvalidState("aggregator is stopped".into()));
        }
        let asset = self.core.asset(asset_id)?;
        self.core.commit_asset(&asset).await
    }

    /// One scheduler pass; returns how many assets committed
    pub async fn commit_due(&self) -> usize {
        Arc::clone(&self.core).commit_due().await
    }

    /// One watchdog pass; returns how many stale alerts were raised
    pub fn check_staleness(&self) -> usize {
        self.core.check_staleness(Utc::now())
    }

    /// Latest committed value, falling back to the store
    pub async fn get_price(&self, asset_id: &str) -> OracleResult<AggregatedPrice> {
        let asset = self.core.asset(asset_id)?;
        if let Some(price) = asset.latest() {
            return Ok(price);
        }
        self.core
            .store
            .get(asset_id)
            .await?
            .ok_or_else(|| OracleError::NotFound(asset_id.to_string()))
    }

    /// Committed values with `start <= timestamp <= end`, oldest first
    pub async fn get_price_history(
        &self,
        asset_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> OracleResult<Vec<AggregatedPrice>> {
        self.core.asset(asset_id)?;
        Ok(self.core.store.get_range(asset_id, start, end).await?)
    }

    /// Administrative pruning of one stored value
    pub async fn delete_price(&self, asset_id: &str, timestamp: DateTime<Utc>) -> OracleResult<bool> {
        self.core.asset(asset_id)?;
        let deleted = self.core.store.delete(asset_id, timestamp).await?;
        if deleted {
            info!("Pruned {} @ {}", asset_id, timestamp.to_rfc3339());
        }
        Ok(deleted)
    }

    /// Stream of every future commit for `asset_id`
    ///
    /// After `stop` the returned subscription is already closed.
    pub fn subscribe(&self, asset_id: &str) -> OracleResult<Subscription> {
        let asset = self.core.asset(asset_id)?;
        if self.state() == EngineState::Stopped {
            return Ok(Subscription::closed(asset_id));
        }

        let subscription = asset
            .subscribers
            .subscribe(asset_id, self.core.config.subscriber_queue_capacity);

        // Stop may have closed the list between the check and the insert
        if self.state() == EngineState::Stopped {
            asset.subscribers.remove(subscription.id());
        }
        debug!("New subscriber {} for {}", subscription.id(), asset_id);
        Ok(subscription)
    }

    pub fn unsubscribe(&self, asset_id: &str, id: SubscriptionId) -> OracleResult<bool> {
        let asset = self.core.asset(asset_id)?;
        Ok(asset.subscribers.remove(id))
    }

    pub fn get_policy(&self) -> PriceUpdatePolicy {
        self.core.state.default_policy().as_ref().clone()
    }

    /// Policy in force for one asset
    pub fn get_asset_policy(&self, asset_id: &str) -> OracleResult<PriceUpdatePolicy> {
        let asset = self.core.asset(asset_id)?;
        Ok(self.core.state.policy_for(&asset).as_ref().clone())
    }

    /// Replace the default policy; applies from the next commit cycle
    pub fn update_policy(&self, policy: PriceUpdatePolicy) -> OracleResult<()> {
        policy.validate()?;
        info!(
            "Default policy updated: method={} min_sources={}",
            policy.aggregation_method, policy.min_data_sources
        );
        self.core.state.set_default_policy(policy);
        Ok(())
    }

    pub fn update_asset_policy(&self, asset_id: &str, policy: PriceUpdatePolicy) -> OracleResult<()> {
        let asset = self.core.asset(asset_id)?;
        policy.validate()?;
        info!("Policy override set for {}", asset_id);
        asset.set_policy_override(Some(policy));
        Ok(())
    }

    /// Drop an asset's override so it follows the default policy again
    pub fn clear_asset_policy(&self, asset_id: &str) -> OracleResult<()> {
        let asset = self.core.asset(asset_id)?;
        asset.set_policy_override(None);
        Ok(())
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.core.metrics.get_metrics()
    }

    pub fn alert_manager(&self) -> Arc<AlertManager> {
        Arc::clone(&self.core.alerts)
    }

    pub fn stats(&self) -> PriceStateStats {
        self.core.state.stats()
    }

    /// Start the commit scheduler and the staleness watchdog
    ///
    /// No-op while running; a stopped aggregator cannot be restarted.
    pub async fn start(&self) -> OracleResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match self.state() {
            EngineState::Running => return Ok(()),
            EngineState::Stopped => {
                return Err(OracleError::InvalidState(
                    "aggregator is stopped and cannot be restarted".into(),
                ))
            }
            EngineState::Created => {}
        }

        info!(
            "Starting price aggregator ({} assets, commit every {:?})",
            self.core.state.asset_ids().len(),
            self.core.config.commit_interval()
        );
        *self.core.started_at.write() = Some(Utc::now());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let core = Arc::clone(&self.core);
        let scheduler_rx = shutdown_rx.clone();
        lifecycle.handles.push(tokio::spawn(async move {
            core.run_scheduler(scheduler_rx).await;
        }));

        let core = Arc::clone(&self.core);
        lifecycle.handles.push(tokio::spawn(async move {
            core.run_watchdog(shutdown_rx).await;
        }));

        lifecycle.shutdown = Some(shutdown_tx);
        *self.core.engine_state.write() = EngineState::Running;
        Ok(())
    }

    /// Stop background work, wait for in-flight commits, discard buffers
    /// and close every subscription. Idempotent.
    pub async fn stop(&self) -> OracleResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        {
            let mut state = self.core.engine_state.write();
            if *state == EngineState::Stopped {
                return Ok(());
            }
            *state = EngineState::Stopped;
        }
        info!("Stopping price aggregator");

        let deadline = tokio::time::Instant::now() + self.core.config.shutdown_timeout();

        if let Some(shutdown) = lifecycle.shutdown.take() {
            let _ = shutdown.send(true);
        }
        for mut handle in lifecycle.handles.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Background task failed: {}", e),
                Err(_) => {
                    warn!("Background task did not finish before shutdown timeout");
                    handle.abort();
                }
            }
        }

        for asset in self.core.state.assets() {
            let guard = tokio::time::timeout_at(deadline, asset.commit_lock.lock()).await;
            if guard.is_err() {
                warn!("Commit for {} still running at shutdown", asset.asset_id());
            }
            asset.clear_buffer();
            asset.subscribers.close_all();
        }

        info!("Price aggregator stopped");
        Ok(())
    }
}

impl EngineCore {
    fn asset(&self, asset_id: &str) -> OracleResult<Arc<AssetState>> {
        self.state
            .asset(asset_id)
            .ok_or_else(|| OracleError::UnknownAsset(asset_id.to_string()))
    }

    fn ingest(&self, point: PricePoint) -> OracleResult<()> {
        let asset = self.asset(&point.asset_id)?;
        if !asset.accepts_source(&point.source) {
            warn!("Rejected point for {} from unconfigured source {}", point.asset_id, point.source);
            return Err(OracleError::UnknownSource {
                asset_id: point.asset_id,
                source_id: point.source,
            });
        }

        let now = Utc::now();
        if let Err(err) = self.validator.check_point(&point, now) {
            warn!("Rejected point for {} from {}: {}", point.asset_id, point.source, err);
            if !point.source.is_empty() {
                let health = self.metrics.record_source_failure(&point.source, err.reason());
                self.check_source_floor(&health);
            }
            return Err(err.into());
        }

        let latency = (now - point.timestamp).to_std().unwrap_or_default();
        let source = point.source.clone();
        asset.buffer_point(point);

        let health = self.metrics.record_source_success(&source, latency);
        self.check_source_floor(&health);
        Ok(())
    }

    /// Raise a source failure alert when a source first drops below the
    /// floor; recovery above it re-arms the alert.
    fn check_source_floor(&self, health: &SourceHealth) {
        let floor = self.config.source_failure_floor;
        if health.is_healthy(floor) {
            if self.failing_sources.remove(&health.source).is_some() {
                info!("Source {} recovered (success rate {:.2})", health.source, health.success_rate);
            }
        } else if self.failing_sources.insert(health.source.clone()) {
            let reason = match &health.last_error {
                Some(last) => format!(
                    "success rate {:.2} below {:.2} (last error: {})",
                    health.success_rate, floor, last
                ),
                None => format!("success rate {:.2} below {:.2}", health.success_rate, floor),
            };
            self.alerts.alert_source_failure(&health.source, &reason);
        }
    }

    /// Validate, compute, persist and broadcast for one asset
    async fn commit_asset(&self, asset: &AssetState) -> OracleResult<AggregatedPrice> {
        let _cycle = asset.commit_lock.lock().await;
        // Stop may have run while this cycle waited for the lock
        if *self.engine_state.read() == EngineState::Stopped {
            return Err(OracleError::InvalidState("aggregator is stopped".into()));
        }
        let started = Instant::now();
        let asset_id = asset.asset_id();
        let policy = self.state.policy_for(asset);

        let points = asset.take_snapshot();
        let previous = match asset.latest() {
            Some(latest) => Some(latest),
            None => self.store.get(asset_id).await.map_err(|e| {
                error!("Failed to read last stored price for {}: {}", asset_id, e);
                self.metrics.record_failed_update(asset_id, "storage");
                e
            })?,
        };

        let now = Utc::now();
        let floor = self.config.source_failure_floor;
        let is_healthy = |source: &str| {
            self.metrics
                .source_health(source)
                .map_or(true, |health| health.is_healthy(floor))
        };
        let fresh = match self
            .validator
            .validate_healthy(&points, is_healthy, previous.as_ref(), &policy, now)
        {
            Ok(fresh) => fresh,
            Err(err) => {
                self.reject(asset, &err);
                return Err(err.into());
            }
        };

        let Some(value) = aggregate(&fresh, &policy) else {
            let err = ValidationError::MalformedPoint(format!(
                "{} aggregation produced no value",
                policy.aggregation_method
            ));
            self.reject(asset, &err);
            return Err(err.into());
        };

        let total = asset.total_sources(points.len()).max(1);
        let price = AggregatedPrice {
            asset_id: asset_id.to_string(),
            value,
            timestamp: now,
            contributing_sources: fresh.iter().map(|p| p.source.clone()).collect(),
            confidence: (fresh.len() as f64 / total as f64).min(1.0),
            sequence: previous.as_ref().map_or(1, |p| p.sequence + 1),
            method: policy.aggregation_method,
        };

        if let Err(err) = self.persist(&price).await {
            match err {
                StorageError::OutOfOrderWrite { .. } => {
                    error!("Commit for {} abandoned: {}", asset_id, err);
                    self.metrics.record_failed_update(asset_id, "out_of_order_write");
                }
                _ => {
                    error!("Commit for {} failed to persist: {}", asset_id, err);
                    self.metrics.record_failed_update(asset_id, "storage");
                    asset.mark_dirty();
                }
            }
            return Err(err.into());
        }

        asset.set_latest(price.clone());
        self.metrics.record_update(&price, started.elapsed());

        if let Some(previous) = &previous {
            if price.deviation_from(previous) > policy.max_price_deviation {
                self.alerts.alert_deviation(
                    asset_id,
                    previous.value,
                    price.value,
                    policy.max_price_deviation,
                );
            }
        }

        let overwritten = asset.subscribers.broadcast(&price);
        for _ in 0..overwritten {
            self.metrics.record_dropped_delivery(asset_id);
        }

        debug!(
            "Committed {} = {} (seq {}, {} sources, {:?})",
            asset_id,
            price.value,
            price.sequence,
            price.source_count(),
            started.elapsed()
        );
        Ok(price)
    }

    fn reject(&self, asset: &AssetState, err: &ValidationError) {
        let asset_id = asset.asset_id();
        self.metrics.record_failed_update(asset_id, err.reason());
        if err.is_rate_limit() {
            // Observations stay buffered until the interval elapses
            asset.mark_dirty();
            debug!("Commit for {} deferred: {}", asset_id, err);
        } else {
            warn!("Commit for {} rejected: {}", asset_id, err);
            self.alerts.alert_validation_failure(asset_id, err);
        }
    }

    /// Save with bounded retry on I/O failures
    async fn persist(&self, price: &AggregatedPrice) -> Result<(), StorageError> {
        let retry = &self.config.store_retry;
        let mut attempt = 1;
        loop {
            match self.store.save(price).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                    let backoff = retry.backoff(attempt);
                    warn!(
                        "Save for {} failed (attempt {}/{}): {}; retrying in {:?}",
                        price.asset_id, attempt, retry.max_attempts, err, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Commit every asset with new observations whose interval has elapsed
    async fn commit_due(self: Arc<Self>) -> usize {
        let now = Utc::now();
        let mut commits = JoinSet::new();

        for asset in self.state.assets() {
            if !asset.is_dirty() {
                continue;
            }
            let min_interval = self.state.policy_for(&asset).min_update_interval();
            if let Some(last) = asset.last_commit_time() {
                if elapsed_since(last, now) < min_interval {
                    continue;
                }
            }

            let core = Arc::clone(&self);
            commits.spawn(async move { core.commit_asset(&asset).await.is_ok() });
        }

        let mut committed = 0;
        while let Some(result) = commits.join_next().await {
            match result {
                Ok(true) => committed += 1,
                Ok(false) => {}
                Err(e) => error!("Commit task failed: {}", e),
            }
        }
        committed
    }

    fn check_staleness(&self, now: DateTime<Utc>) -> usize {
        let started_at = *self.started_at.read();
        let mut raised = 0;

        for asset in self.state.assets() {
            let last_commit = asset.last_commit_time();
            let Some(reference) = last_commit.or(started_at) else {
                continue;
            };
            let max_age = self.state.policy_for(&asset).max_data_age();
            if elapsed_since(reference, now) > max_age && asset.mark_stale_alerted() {
                self.alerts
                    .alert_stale_price(asset.asset_id(), last_commit, max_age);
                raised += 1;
            }
        }
        raised
    }

    async fn run_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Commit scheduler started");
        let mut interval = tokio::time::interval(self.config.commit_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let committed = Arc::clone(&self).commit_due().await;
                    if committed > 0 {
                        debug!("Scheduler committed {} assets", committed);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Commit scheduler shutdown requested");
                        break;
                    }
                }
            }
        }
    }

    async fn run_watchdog(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.watchdog_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let raised = self.check_staleness(Utc::now());
                    if raised > 0 {
                        let stats = self.state.stats();
                        info!(
                            "Watchdog: {} stale assets ({} of {} committed, {} subscribers)",
                            raised, stats.committed_assets, stats.asset_count, stats.subscriber_count
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

fn elapsed_since(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertKind, MemoryAlertSink};
    use oracle_core::AggregationMethod;
    use rust_decimal_macros::dec;

    fn config() -> EngineConfig {
        let policy = PriceUpdatePolicy {
            min_update_interval_ms: 0,
            ..PriceUpdatePolicy::default()
        };
        EngineConfig {
            default_policy: policy,
            ..EngineConfig::default()
        }
        .with_asset(AssetConfig::new("NEO/USD").with_sources(["binance", "huobi", "okx"]))
        .with_asset(AssetConfig::new("GAS/USD"))
    }

    fn engine() -> (PriceAggregator, Arc<MemoryAlertSink>) {
        let sink = Arc::new(MemoryAlertSink::default());
        let engine = PriceAggregator::builder(config())
            .alerts(AlertManager::new().with_sink(sink.clone()))
            .build()
            .unwrap();
        (engine, sink)
    }

    fn point(asset: &str, source: &str, value: rust_decimal::Decimal) -> PricePoint {
        PricePoint::new(asset, value, Utc::now(), source)
    }

    #[tokio::test]
    async fn test_ingest_rejections() {
        let (engine, _) = engine();

        let err = engine.ingest(point("BTC/USD", "binance", dec!(1))).unwrap_err();
        assert!(matches!(err, OracleError::UnknownAsset(_)));

        let err = engine.ingest(point("NEO/USD", "kraken", dec!(1))).unwrap_err();
        assert!(matches!(err, OracleError::UnknownSource { .. }));

        let err = engine.ingest(point("NEO/USD", "binance", dec!(-1))).unwrap_err();
        assert!(matches!(
            err,
            OracleError::Validation(ValidationError::MalformedPoint(_))
        ));
        assert_eq!(engine.stats().buffered_points, 0);

        let health = engine.get_metrics().per_source_health["binance"].clone();
        assert_eq!(health.failure_count, 1);
    }

    #[tokio::test]
    async fn test_commit_confidence_and_sequence() {
        let (engine, _) = engine();
        engine.ingest(point("NEO/USD", "binance", dec!(10))).unwrap();
        engine.ingest(point("NEO/USD", "huobi", dec!(12))).unwrap();

        let first = engine.commit("NEO/USD").await.unwrap();
        assert_eq!(first.value, dec!(11));
        assert_eq!(first.sequence, 1);
        assert!((first.confidence - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(first.method, AggregationMethod::Median);

        let second = engine.commit("NEO/USD").await.unwrap();
        assert_eq!(second.sequence, 2);
        assert!(second.timestamp > first.timestamp);
        assert_eq!(engine.get_price("NEO/USD").await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_open_asset_confidence_uses_buffered_sources() {
        let (engine, _) = engine();
        engine.ingest(point("GAS/USD", "a", dec!(5))).unwrap();
        engine.ingest(point("GAS/USD", "b", dec!(5))).unwrap();

        let price = engine.commit("GAS/USD").await.unwrap();
        assert_eq!(price.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_get_price_not_found() {
        let (engine, _) = engine();
        let err = engine.get_price("NEO/USD").await.unwrap_err();
        assert!(matches!(err, OracleError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_validation_failure_alerts_but_rate_limit_does_not() {
        let (engine, sink) = engine();
        engine.ingest(point("NEO/USD", "binance", dec!(10))).unwrap();

        let err = engine.commit("NEO/USD").await.unwrap_err();
        assert!(matches!(
            err,
            OracleError::Validation(ValidationError::InsufficientSources { .. })
        ));
        assert_eq!(sink.alerts_of(AlertKind::ValidationFailure).len(), 1);

        let slow = PriceUpdatePolicy {
            min_update_interval_ms: 60_000,
            ..PriceUpdatePolicy::default()
        };
        engine.update_asset_policy("NEO/USD", slow).unwrap();
        engine.ingest(point("NEO/USD", "huobi", dec!(10))).unwrap();
        engine.commit("NEO/USD").await.unwrap();

        let err = engine.commit("NEO/USD").await.unwrap_err();
        assert!(matches!(
            err,
            OracleError::Validation(ValidationError::TooFrequent { .. })
        ));
        assert_eq!(sink.alerts_of(AlertKind::ValidationFailure).len(), 1);

        let metrics = engine.get_metrics();
        assert_eq!(metrics.failures_for("insufficient_sources"), 1);
        assert_eq!(metrics.failures_for("too_frequent"), 1);
    }

    #[tokio::test]
    async fn test_update_policy_rejects_invalid() {
        let (engine, _) = engine();
        let invalid = PriceUpdatePolicy::default().with_min_sources(0);

        assert!(matches!(
            engine.update_policy(invalid.clone()),
            Err(OracleError::InvalidPolicy(_))
        ));
        assert!(engine.update_asset_policy("NEO/USD", invalid).is_err());
        assert_eq!(engine.get_policy().min_data_sources, 2);

        engine
            .update_policy(PriceUpdatePolicy::default().with_method(AggregationMethod::Mean))
            .unwrap();
        assert_eq!(
            engine.get_asset_policy("GAS/USD").unwrap().aggregation_method,
            AggregationMethod::Mean
        );
    }

    #[tokio::test]
    async fn test_source_failure_alert_once_per_episode() {
        let (engine, sink) = engine();

        for _ in 0..10 {
            engine.report_source_failure("huobi", "timeout");
        }
        assert_eq!(sink.alerts_of(AlertKind::SourceFailure).len(), 1);

        engine.update_source_health("huobi", 1.0);
        engine.update_source_health("huobi", 0.1);
        assert_eq!(sink.alerts_of(AlertKind::SourceFailure).len(), 2);
    }

    #[tokio::test]
    async fn test_commit_due_skips_clean_assets() {
        let (engine, _) = engine();
        assert_eq!(engine.commit_due().await, 0);

        engine.ingest(point("GAS/USD", "a", dec!(5))).unwrap();
        engine.ingest(point("GAS/USD", "b", dec!(6))).unwrap();
        assert_eq!(engine.commit_due().await, 1);
        assert_eq!(engine.commit_due().await, 0);
    }

    #[tokio::test]
    async fn test_staleness_watchdog() {
        let (engine, sink) = engine();
        engine.start().await.unwrap();

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(engine.core.check_staleness(later), 2);
        assert_eq!(engine.core.check_staleness(later), 0);
        assert_eq!(sink.alerts_of(AlertKind::StalePrice).len(), 2);

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (engine, _) = engine();
        assert_eq!(engine.state(), EngineState::Created);

        engine.start().await.unwrap();
        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);

        engine.ingest(point("GAS/USD", "a", dec!(5))).unwrap();
        engine.stop().await.unwrap();
        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.stats().buffered_points, 0);

        assert!(matches!(engine.start().await, Err(OracleError::InvalidState(_))));
        assert!(matches!(engine.commit("GAS/USD").await, Err(OracleError::InvalidState(_))));

        let mut sub = engine.subscribe("GAS/USD").unwrap();
        assert!(sub.recv().await.is_none());
    }
}
