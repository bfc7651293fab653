//! Per-asset engine state
//!
//! Each asset owns its own buffer, commit lock, latest value and subscriber
//! list. Assets are indexed in a DashMap so work on one asset never waits on
//! another.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use oracle_core::{AggregatedPrice, AssetConfig, PricePoint, PriceUpdatePolicy};
use crate::subscription::SubscriberList;

/// Mutable state of one tracked asset
#[derive(Debug)]
pub struct AssetState {
    asset_id: String,
    /// Empty means any source is accepted
    configured_sources: BTreeSet<String>,
    policy_override: RwLock<Option<Arc<PriceUpdatePolicy>>>,
    /// Latest point per source
    buffer: Mutex<HashMap<String, PricePoint>>,
    latest: RwLock<Option<AggregatedPrice>>,
    /// Serializes validate, compute, persist, broadcast
    pub(crate) commit_lock: tokio::sync::Mutex<()>,
    pub(crate) subscribers: Arc<SubscriberList>,
    /// Set by ingestion, cleared when a commit cycle takes a snapshot
    dirty: AtomicBool,
    stale_alerted: AtomicBool,
}

impl AssetState {
    pub fn new(config: &AssetConfig) -> Self {
        Self {
            asset_id: config.asset_id.clone(),
            configured_sources: config.sources.iter().cloned().collect(),
            policy_override: RwLock::new(config.policy.clone().map(Arc::new)),
            buffer: Mutex::new(HashMap::new()),
            latest: RwLock::new(None),
            commit_lock: tokio::sync::Mutex::new(()),
            subscribers: Arc::new(SubscriberList::new()),
            dirty: AtomicBool::new(false),
            stale_alerted: AtomicBool::new(false),
        }
    }

    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn accepts_source(&self, source: &str) -> bool {
        self.configured_sources.is_empty() || self.configured_sources.contains(source)
    }

    /// Buffer a point, keeping the newest observation per source. Returns
    /// false when an equally new or newer point is already buffered.
    pub fn buffer_point(&self, point: PricePoint) -> bool {
        let mut buffer = self.buffer.lock();
        let replaced = match buffer.get(&point.source) {
            Some(existing) if existing.timestamp > point.timestamp => false,
            _ => {
                buffer.insert(point.source.clone(), point);
                true
            }
        };
        if replaced {
            self.dirty.store(true, Ordering::Release);
        }
        replaced
    }

    /// Copy of the buffered points; clears the dirty flag
    pub fn take_snapshot(&self) -> Vec<PricePoint> {
        let buffer = self.buffer.lock();
        self.dirty.store(false, Ordering::Release);
        let mut points: Vec<PricePoint> = buffer.values().cloned().collect();
        points.sort_by(|a, b| a.source.cmp(&b.source));
        points
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn clear_buffer(&self) {
        self.buffer.lock().clear();
        self.dirty.store(false, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Confidence denominator
    pub fn total_sources(&self, buffered: usize) -> usize {
        if self.configured_sources.is_empty() {
            buffered
        } else {
            self.configured_sources.len()
        }
    }

    pub fn latest(&self) -> Option<AggregatedPrice> {
        self.latest.read().clone()
    }

    pub fn last_commit_time(&self) -> Option<DateTime<Utc>> {
        self.latest.read().as_ref().map(|p| p.timestamp)
    }

    /// Install a value unless a newer one is already visible
    pub fn set_latest(&self, price: AggregatedPrice) {
        let mut latest = self.latest.write();
        let newer = latest
            .as_ref()
            .map_or(true, |current| price.timestamp > current.timestamp);
        if newer {
            *latest = Some(price);
            self.stale_alerted.store(false, Ordering::Release);
        }
    }

    pub fn policy_override(&self) -> Option<Arc<PriceUpdatePolicy>> {
        self.policy_override.read().clone()
    }

    pub fn set_policy_override(&self, policy: Option<PriceUpdatePolicy>) {
        *self.policy_override.write() = policy.map(Arc::new);
    }

    /// Returns true only for the first call of a staleness episode
    pub fn mark_stale_alerted(&self) -> bool {
        !self.stale_alerted.swap(true, Ordering::AcqRel)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// All tracked assets plus the global default policy
#[derive(Debug)]
pub struct PriceState {
    assets: DashMap<String, Arc<AssetState>>,
    default_policy: RwLock<Arc<PriceUpdatePolicy>>,
}

impl PriceState {
    pub fn new(default_policy: PriceUpdatePolicy) -> Self {
        Self {
            assets: DashMap::new(),
            default_policy: RwLock::new(Arc::new(default_policy)),
        }
    }

    /// Add an asset; false if it is already tracked
    pub fn register(&self, config: &AssetConfig) -> bool {
        match self.assets.entry(config.asset_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(AssetState::new(config)));
                true
            }
        }
    }

    pub fn asset(&self, asset_id: &str) -> Option<Arc<AssetState>> {
        self.assets.get(asset_id).map(|r| Arc::clone(r.value()))
    }

    /// Snapshot of every tracked asset
    pub fn assets(&self) -> Vec<Arc<AssetState>> {
        self.assets.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub fn asset_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.assets.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn default_policy(&self) -> Arc<PriceUpdatePolicy> {
        Arc::clone(&self.default_policy.read())
    }

    pub fn set_default_policy(&self, policy: PriceUpdatePolicy) {
        *self.default_policy.write() = Arc::new(policy);
    }

    /// Policy in force for `asset` right now
    pub fn policy_for(&self, asset: &AssetState) -> Arc<PriceUpdatePolicy> {
        asset
            .policy_override()
            .unwrap_or_else(|| self.default_policy())
    }

    pub fn stats(&self) -> PriceStateStats {
        let assets = self.assets();
        PriceStateStats {
            asset_count: assets.len(),
            committed_assets: assets.iter().filter(|a| a.latest().is_some()).count(),
            buffered_points: assets.iter().map(|a| a.buffered_len()).sum(),
            subscriber_count: assets.iter().map(|a| a.subscriber_count()).sum(),
        }
    }
}

/// Statistics about engine state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceStateStats {
    pub asset_count: usize,
    pub committed_assets: usize,
    pub buffered_points: usize,
    pub subscriber_count: usize,
}
