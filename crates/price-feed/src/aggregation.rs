//! Aggregation methods
//!
//! Each method is a pure function over the accepted points of one commit
//! cycle. Dispatch goes through a function table keyed by the closed
//! `AggregationMethod` enum.

use rust_decimal::Decimal;

use oracle_core::{AggregationMethod, PricePoint, PriceUpdatePolicy};

/// Signature shared by every aggregation method
pub type AggregateFn = fn(&[PricePoint], &PriceUpdatePolicy) -> Option<Decimal>;

/// Look up the function implementing `method`
pub fn aggregator_for(method: AggregationMethod) -> AggregateFn {
    match method {
        AggregationMethod::Mean => mean,
        AggregationMethod::Median => median,
        AggregationMethod::Weighted => weighted,
        AggregationMethod::TrimmedMean => trimmed_mean,
    }
}

/// Aggregate `points` with the policy's method. `None` on empty input or
/// arithmetic overflow.
pub fn aggregate(points: &[PricePoint], policy: &PriceUpdatePolicy) -> Option<Decimal> {
    aggregator_for(policy.aggregation_method)(points, policy)
}

fn mean(points: &[PricePoint], _policy: &PriceUpdatePolicy) -> Option<Decimal> {
    let values: Vec<Decimal> = points.iter().map(|p| p.value).collect();
    mean_of(&values)
}

fn median(points: &[PricePoint], _policy: &PriceUpdatePolicy) -> Option<Decimal> {
    let mut sorted = sorted_values(points);
    if sorted.is_empty() {
        return None;
    }

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        let pair = sorted[mid - 1].checked_add(sorted[mid])?;
        pair.checked_div(Decimal::from(2))
    } else {
        Some(sorted.swap_remove(mid))
    }
}

fn weighted(points: &[PricePoint], policy: &PriceUpdatePolicy) -> Option<Decimal> {
    let (sum, total_weight) = points.iter().try_fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(sum, total), p| {
            let weight = policy.weight(&p.source);
            Some((
                sum.checked_add(p.value.checked_mul(weight)?)?,
                total.checked_add(weight)?,
            ))
        },
    )?;

    if total_weight.is_zero() {
        return None;
    }
    sum.checked_div(total_weight)
}

fn trimmed_mean(points: &[PricePoint], policy: &PriceUpdatePolicy) -> Option<Decimal> {
    let sorted = sorted_values(points);
    let trim = trim_count(sorted.len(), policy.trim_percentage.unwrap_or(0.0));
    mean_of(&sorted[trim..sorted.len() - trim])
}

/// Values dropped from each tail. Never trims the last remaining value.
pub fn trim_count(len: usize, trim_percentage: f64) -> usize {
    if len == 0 || !trim_percentage.is_finite() || trim_percentage <= 0.0 {
        return 0;
    }
    let per_tail = (len as f64 * trim_percentage / 2.0).floor() as usize;
    per_tail.min((len - 1) / 2)
}

fn sorted_values(points: &[PricePoint]) -> Vec<Decimal> {
    let mut values: Vec<Decimal> = points.iter().map(|p| p.value).collect();
    values.sort();
    values
}

fn mean_of(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let sum = values
        .iter()
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(*v))?;
    sum.checked_div(Decimal::from(values.len()))
}
