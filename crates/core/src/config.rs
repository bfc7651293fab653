//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::{OracleError, OracleResult, PriceUpdatePolicy};

/// One tracked asset pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetConfig {
    pub asset_id: String,
    /// Configured sources; empty accepts any source
    #[serde(default)]
    pub sources: Vec<String>,
    /// Overrides the engine default when set
    #[serde(default)]
    pub policy: Option<PriceUpdatePolicy>,
}

impl AssetConfig {
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            sources: vec![],
            policy: None,
        }
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_policy(mut self, policy: PriceUpdatePolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Bounded retry for storage I/O failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 50,
        }
    }
}

impl RetryConfig {
    /// Linear backoff before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(attempt as u64))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    File,
}

/// Which `PriceStore` backs the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_policy: PriceUpdatePolicy,
    pub assets: Vec<AssetConfig>,
    pub commit_interval_ms: u64,
    pub watchdog_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub subscriber_queue_capacity: usize,
    /// Success rate below which a source failure alert is raised
    pub source_failure_floor: f64,
    pub store_retry: RetryConfig,
    pub store: StoreConfig,
    pub log_format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_policy: PriceUpdatePolicy::default(),
            assets: vec![],
            commit_interval_ms: 1_000,
            watchdog_interval_ms: 5_000,
            shutdown_timeout_ms: 5_000,
            subscriber_queue_capacity: 100,
            source_failure_floor: 0.5,
            store_retry: RetryConfig::default(),
            store: StoreConfig::default(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl EngineConfig {
    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn with_asset(mut self, asset: AssetConfig) -> Self {
        self.assets.push(asset);
        self
    }

    pub fn get_asset_config(&self, asset_id: &str) -> Option<&AssetConfig> {
        self.assets.iter().find(|a| a.asset_id == asset_id)
    }

    pub fn validate(&self) -> OracleResult<()> {
        self.default_policy.validate()?;

        let mut seen = HashSet::new();
        for asset in &self.assets {
            if asset.asset_id.is_empty() {
                return Err(OracleError::Config("asset_id must not be empty".into()));
            }
            if !seen.insert(asset.asset_id.as_str()) {
                return Err(OracleError::Config(format!(
                    "asset {} configured twice",
                    asset.asset_id
                )));
            }
            if let Some(policy) = &asset.policy {
                policy.validate()?;
            }
        }

        if self.commit_interval_ms == 0 || self.watchdog_interval_ms == 0 {
            return Err(OracleError::Config(
                "commit and watchdog intervals must be positive".into(),
            ));
        }

        if self.subscriber_queue_capacity == 0 {
            return Err(OracleError::Config(
                "subscriber_queue_capacity must be positive".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.source_failure_floor) {
            return Err(OracleError::Config(format!(
                "source_failure_floor must be in [0, 1], got {}",
                self.source_failure_floor
            )));
        }

        if self.store.kind == StoreKind::File && self.store.path.is_none() {
            return Err(OracleError::Config("file store requires a path".into()));
        }

        Ok(())
    }
}
