//! Price update policy

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::{AggregationMethod, OracleError, OracleResult};

/// Rules a commit cycle must satisfy, per asset or as the global default
///
/// Read-only on the hot path: the engine swaps whole policies, it never
/// edits one in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceUpdatePolicy {
    pub min_update_interval_ms: u64,
    /// Fractional move between commits that raises a deviation alert
    pub max_price_deviation: Decimal,
    pub min_data_sources: usize,
    pub max_data_age_ms: u64,
    pub aggregation_method: AggregationMethod,
    /// Total fraction trimmed by `TrimmedMean`, split evenly across both tails
    pub trim_percentage: Option<f64>,
    /// Weights for `Weighted`; unlisted sources weigh 1
    pub source_weights: HashMap<String, Decimal>,
}

impl Default for PriceUpdatePolicy {
    fn default() -> Self {
        Self {
            min_update_interval_ms: 30_000,
            max_price_deviation: Decimal::new(1, 2), // 1%
            min_data_sources: 2,
            max_data_age_ms: 60_000,
            aggregation_method: AggregationMethod::Median,
            trim_percentage: None,
            source_weights: HashMap::new(),
        }
    }
}

impl PriceUpdatePolicy {
    pub fn min_update_interval(&self) -> Duration {
        Duration::from_millis(self.min_update_interval_ms)
    }

    pub fn max_data_age(&self) -> Duration {
        Duration::from_millis(self.max_data_age_ms)
    }

    pub fn weight(&self, source: &str) -> Decimal {
        self.source_weights
            .get(source)
            .copied()
            .unwrap_or(Decimal::ONE)
    }

    pub fn with_method(mut self, method: AggregationMethod) -> Self {
        self.aggregation_method = method;
        self
    }

    pub fn with_trim(mut self, trim_percentage: f64) -> Self {
        self.aggregation_method = AggregationMethod::TrimmedMean;
        self.trim_percentage = Some(trim_percentage);
        self
    }

    pub fn with_min_sources(mut self, min_data_sources: usize) -> Self {
        self.min_data_sources = min_data_sources;
        self
    }

    pub fn with_weight(mut self, source: impl Into<String>, weight: Decimal) -> Self {
        self.source_weights.insert(source.into(), weight);
        self
    }

    pub fn validate(&self) -> OracleResult<()> {
        if self.min_data_sources == 0 {
            return Err(OracleError::InvalidPolicy(
                "min_data_sources must be at least 1".into(),
            ));
        }

        if self.max_price_deviation.is_sign_negative() {
            return Err(OracleError::InvalidPolicy(format!(
                "max_price_deviation must be non-negative, got {}",
                self.max_price_deviation
            )));
        }

        if self.max_data_age_ms == 0 {
            return Err(OracleError::InvalidPolicy(
                "max_data_age_ms must be positive".into(),
            ));
        }

        if self.aggregation_method == AggregationMethod::TrimmedMean {
            match self.trim_percentage {
                Some(t) if (0.0..1.0).contains(&t) => {}
                Some(t) => {
                    return Err(OracleError::InvalidPolicy(format!(
                        "trim_percentage must be in [0, 1), got {t}"
                    )))
                }
                None => {
                    return Err(OracleError::InvalidPolicy(
                        "trimmed_mean requires trim_percentage".into(),
                    ))
                }
            }
        }

        if let Some((source, weight)) = self
            .source_weights
            .iter()
            .find(|(_, w)| **w <= Decimal::ZERO)
        {
            return Err(OracleError::InvalidPolicy(format!(
                "weight for {source} must be positive, got {weight}"
            )));
        }

        Ok(())
    }
}
