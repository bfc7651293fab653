//! Core type definitions

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// How the per-source values of one asset are folded into a single price
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    Mean,
    #[default]
    Median,
    Weighted,
    TrimmedMean,
}

impl AggregationMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AggregationMethod::Mean => "mean",
            AggregationMethod::Median => "median",
            AggregationMethod::Weighted => "weighted",
            AggregationMethod::TrimmedMean => "trimmed_mean",
        }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One source's observation of an asset price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub asset_id: String,
    pub value: Decimal,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    /// Source-reported confidence in `[0, 1]`
    pub confidence: f64,
}

impl PricePoint {
    pub fn new(
        asset_id: impl Into<String>,
        value: Decimal,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            asset_id: asset_id.into(),
            value,
            timestamp,
            source: source.into(),
            confidence: 1.0,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }

    pub fn is_in_future(&self, now: DateTime<Utc>) -> bool {
        self.timestamp > now
    }
}

/// The committed, published value of an asset
///
/// Never mutated after the commit cycle that created it; the next accepted
/// commit supersedes it with a higher `sequence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPrice {
    pub asset_id: String,
    pub value: Decimal,
    pub timestamp: DateTime<Utc>,
    pub contributing_sources: BTreeSet<String>,
    /// Contributing sources over configured sources
    pub confidence: f64,
    pub sequence: u64,
    pub method: AggregationMethod,
}

impl AggregatedPrice {
    pub fn source_count(&self) -> usize {
        self.contributing_sources.len()
    }

    /// Fractional move from `previous` to this value
    pub fn deviation_from(&self, previous: &AggregatedPrice) -> Decimal {
        relative_deviation(previous.value, self.value)
    }
}

/// `|new - old| / |old|`, zero when `old` is zero
pub fn relative_deviation(old: Decimal, new: Decimal) -> Decimal {
    if old.is_zero() {
        return Decimal::ZERO;
    }
    ((new - old) / old).abs()
}
