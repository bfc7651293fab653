//! Commit-cycle validation policy

use chrono::{DateTime, Utc};
use std::time::Duration;

use oracle_core::{AggregatedPrice, PricePoint, PriceUpdatePolicy, ValidationError};

/// Stateless policy evaluator
///
/// Checks run in a fixed order (quorum, freshness, interval, range) and the
/// first failure wins. `now` is passed in so validation is a pure function.
/// Points from sources the caller reports unhealthy never count towards the
/// quorum.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriceValidator;

impl PriceValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate one candidate set, returning the fresh points that may be
    /// aggregated.
    pub fn validate(
        &self,
        candidates: &[PricePoint],
        previous: Option<&AggregatedPrice>,
        policy: &PriceUpdatePolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>, ValidationError> {
        self.validate_healthy(candidates, |_| true, previous, policy, now)
    }

    /// As [`validate`](Self::validate), first dropping points whose source
    /// `is_healthy` rejects
    pub fn validate_healthy(
        &self,
        candidates: &[PricePoint],
        is_healthy: impl Fn(&str) -> bool,
        previous: Option<&AggregatedPrice>,
        policy: &PriceUpdatePolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>, ValidationError> {
        let required = policy.min_data_sources;

        let healthy: Vec<&PricePoint> = candidates
            .iter()
            .filter(|p| is_healthy(&p.source))
            .collect();

        if healthy.len() < required {
            return Err(ValidationError::InsufficientSources {
                required,
                available: healthy.len(),
            });
        }

        let max_age = policy.max_data_age();
        let fresh: Vec<PricePoint> = healthy
            .into_iter()
            .filter(|p| age(p.timestamp, now) <= max_age)
            .cloned()
            .collect();

        if fresh.len() < required {
            return Err(ValidationError::StaleData {
                required,
                fresh: fresh.len(),
            });
        }

        if let Some(previous) = previous {
            let elapsed = age(previous.timestamp, now);
            let min_interval = policy.min_update_interval();
            if elapsed < min_interval {
                return Err(ValidationError::TooFrequent {
                    elapsed_ms: elapsed.as_millis() as u64,
                    min_ms: min_interval.as_millis() as u64,
                });
            }
        }

        for point in &fresh {
            self.check_point(point, now)?;
        }

        Ok(fresh)
    }

    /// Range sanity for a single observation
    pub fn check_point(&self, point: &PricePoint, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if point.asset_id.is_empty() {
            return Err(ValidationError::MalformedPoint("empty asset id".into()));
        }

        if point.source.is_empty() {
            return Err(ValidationError::MalformedPoint(format!(
                "empty source for {}",
                point.asset_id
            )));
        }

        if point.value.is_sign_negative() || point.value.is_zero() {
            return Err(ValidationError::MalformedPoint(format!(
                "non-positive value {} from {}",
                point.value, point.source
            )));
        }

        if point.is_in_future(now) {
            return Err(ValidationError::MalformedPoint(format!(
                "timestamp {} from {} is in the future",
                point.timestamp, point.source
            )));
        }

        if !(0.0..=1.0).contains(&point.confidence) {
            return Err(ValidationError::MalformedPoint(format!(
                "confidence {} from {} outside [0, 1]",
                point.confidence, point.source
            )));
        }

        Ok(())
    }
}

/// Elapsed time since `at`, clamped to zero for instants ahead of `now`
fn age(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - at).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oracle_core::AggregationMethod;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::BTreeSet;

    fn point(source: &str, value: Decimal, age_secs: i64, now: DateTime<Utc>) -> PricePoint {
        PricePoint::new("NEO/USD", value, now - chrono::Duration::seconds(age_secs), source)
    }

    fn previous(at: DateTime<Utc>) -> AggregatedPrice {
        AggregatedPrice {
            asset_id: "NEO/USD".into(),
            value: dec!(10),
            timestamp: at,
            contributing_sources: BTreeSet::new(),
            confidence: 1.0,
            sequence: 1,
            method: AggregationMethod::Median,
        }
    }

    fn policy() -> PriceUpdatePolicy {
        PriceUpdatePolicy {
            min_update_interval_ms: 30_000,
            max_data_age_ms: 60_000,
            min_data_sources: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_accepts_fresh_quorum() {
        let now = Utc::now();
        let points = vec![point("binance", dec!(10), 1, now), point("huobi", dec!(11), 2, now)];

        let fresh = PriceValidator::new().validate(&points, None, &policy(), now).unwrap();
        assert_eq!(fresh.len(), 2);
    }

    #[test]
    fn test_insufficient_sources() {
        let now = Utc::now();
        let points = vec![point("binance", dec!(10), 1, now)];

        let err = PriceValidator::new().validate(&points, None, &policy(), now).unwrap_err();
        assert_eq!(err, ValidationError::InsufficientSources { required: 2, available: 1 });
    }

    #[test]
    fn test_stale_points_dropped_before_quorum() {
        let now = Utc::now();
        let points = vec![
            point("binance", dec!(10), 1, now),
            point("huobi", dec!(11), 120, now),
            point("coinbase", dec!(12), 2, now),
        ];

        let fresh = PriceValidator::new().validate(&points, None, &policy(), now).unwrap();
        assert_eq!(fresh.len(), 2);
        assert!(fresh.iter().all(|p| p.source != "huobi"));

        let points = vec![point("binance", dec!(10), 1, now), point("huobi", dec!(11), 120, now)];
        let err = PriceValidator::new().validate(&points, None, &policy(), now).unwrap_err();
        assert_eq!(err, ValidationError::StaleData { required: 2, fresh: 1 });
    }

    #[test]
    fn test_too_frequent() {
        let now = Utc::now();
        let points = vec![point("binance", dec!(10), 1, now), point("huobi", dec!(11), 1, now)];
        let prev = previous(now - chrono::Duration::seconds(10));

        let err = PriceValidator::new().validate(&points, Some(&prev), &policy(), now).unwrap_err();
        assert!(matches!(err, ValidationError::TooFrequent { min_ms: 30_000, .. }));

        let prev = previous(now - chrono::Duration::seconds(31));
        assert!(PriceValidator::new().validate(&points, Some(&prev), &policy(), now).is_ok());
    }

    #[test]
    fn test_malformed_points() {
        let now = Utc::now();
        let validator = PriceValidator::new();

        let points = vec![point("binance", dec!(10), 1, now), point("huobi", dec!(-1), 1, now)];
        let err = validator.validate(&points, None, &policy(), now).unwrap_err();
        assert!(matches!(err, ValidationError::MalformedPoint(_)));

        let future = PricePoint::new("NEO/USD", dec!(10), now + chrono::Duration::seconds(5), "huobi");
        assert!(validator.check_point(&future, now).is_err());

        let zero = point("binance", Decimal::ZERO, 0, now);
        assert!(validator.check_point(&zero, now).is_err());

        let overconfident = point("binance", dec!(1), 0, now).with_confidence(1.5);
        assert!(validator.check_point(&overconfident, now).is_err());

        let unnamed = point("", dec!(1), 0, now);
        assert!(validator.check_point(&unnamed, now).is_err());
    }

    #[test]
    fn test_quorum_checked_before_staleness() {
        let now = Utc::now();
        let points = vec![point("binance", dec!(10), 500, now)];

        let err = PriceValidator::new().validate(&points, None, &policy(), now).unwrap_err();
        assert!(matches!(err, ValidationError::InsufficientSources { .. }));
    }

    #[test]
    fn test_unhealthy_sources_excluded_from_quorum() {
        let now = Utc::now();
        let points = vec![
            point("binance", dec!(10), 1, now),
            point("huobi", dec!(11), 1, now),
            point("okx", dec!(12), 1, now),
        ];
        let validator = PriceValidator::new();

        let fresh = validator
            .validate_healthy(&points, |s| s != "huobi", None, &policy(), now)
            .unwrap();
        assert_eq!(fresh.len(), 2);
        assert!(fresh.iter().all(|p| p.source != "huobi"));

        let err = validator
            .validate_healthy(&points[..2], |s| s != "huobi", None, &policy(), now)
            .unwrap_err();
        assert_eq!(err, ValidationError::InsufficientSources { required: 2, available: 1 });
    }
}
