//! Price history storage
//!
//! One append-only series per asset. Series are independent: writes to one
//! asset never hold a lock another asset's readers need.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

use oracle_core::{AggregatedPrice, StorageError, StorageResult};

/// Time-series store keyed by asset
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Append a commit. Fails with `OutOfOrderWrite` unless `price.timestamp`
    /// is strictly after the last stored timestamp for the asset.
    async fn save(&self, price: &AggregatedPrice) -> StorageResult<()>;

    /// Latest stored value
    async fn get(&self, asset_id: &str) -> StorageResult<Option<AggregatedPrice>>;

    /// Stored values with `start <= timestamp <= end`, ascending
    async fn get_range(
        &self,
        asset_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<AggregatedPrice>>;

    /// Administrative pruning; returns whether an entry was removed
    async fn delete(&self, asset_id: &str, timestamp: DateTime<Utc>) -> StorageResult<bool>;
}

/// Ordered history of one asset
#[derive(Debug, Default, Clone)]
pub struct PriceSeries {
    entries: Vec<AggregatedPrice>,
}

impl PriceSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_append(&self, price: &AggregatedPrice) -> StorageResult<()> {
        match self.entries.last() {
            Some(last) if price.timestamp <= last.timestamp => Err(StorageError::OutOfOrderWrite {
                asset_id: price.asset_id.clone(),
                timestamp: price.timestamp.to_rfc3339(),
                last: last.timestamp.to_rfc3339(),
            }),
            _ => Ok(()),
        }
    }

    pub fn append(&mut self, price: AggregatedPrice) -> StorageResult<()> {
        self.check_append(&price)?;
        self.entries.push(price);
        Ok(())
    }

    pub fn latest(&self) -> Option<&AggregatedPrice> {
        self.entries.last()
    }

    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<AggregatedPrice> {
        if start > end {
            return vec![];
        }
        let lo = self.entries.partition_point(|p| p.timestamp < start);
        let hi = self.entries.partition_point(|p| p.timestamp <= end);
        self.entries[lo..hi].to_vec()
    }

    pub fn remove(&mut self, timestamp: DateTime<Utc>) -> bool {
        match self.entries.binary_search_by(|p| p.timestamp.cmp(&timestamp)) {
            Ok(idx) => {
                self.entries.remove(idx);
                true
            }
            Err(_) => false,
        }
    }

    pub fn entries(&self) -> &[AggregatedPrice] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryPriceStore {
    series: DashMap<String, Arc<RwLock<PriceSeries>>>,
}

impl MemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn series(&self, asset_id: &str) -> Option<Arc<RwLock<PriceSeries>>> {
        self.series.get(asset_id).map(|r| Arc::clone(r.value()))
    }

    pub fn asset_count(&self) -> usize {
        self.series.len()
    }
}

#[async_trait]
impl PriceStore for MemoryPriceStore {
    async fn save(&self, price: &AggregatedPrice) -> StorageResult<()> {
        // Clone the Arc so the shard lock is released before the series lock
        let series = Arc::clone(
            self.series
                .entry(price.asset_id.clone())
                .or_default()
                .value(),
        );
        let mut guard = series.write();
        guard.append(price.clone())
    }

    async fn get(&self, asset_id: &str) -> StorageResult<Option<AggregatedPrice>> {
        Ok(self
            .series(asset_id)
            .and_then(|s| s.read().latest().cloned()))
    }

    async fn get_range(
        &self,
        asset_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<AggregatedPrice>> {
        Ok(self
            .series(asset_id)
            .map(|s| s.read().range(start, end))
            .unwrap_or_default())
    }

    async fn delete(&self, asset_id: &str, timestamp: DateTime<Utc>) -> StorageResult<bool> {
        Ok(self
            .series(asset_id)
            .map(|s| s.write().remove(timestamp))
            .unwrap_or(false))
    }
}
