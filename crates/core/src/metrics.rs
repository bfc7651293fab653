//! Health and metrics snapshot types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Smoothing factor for rolling success rates and latencies
pub const HEALTH_EMA_ALPHA: f64 = 0.2;

/// Rolling state of one data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source: String,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Exponentially weighted success rate in `[0, 1]`
    pub success_rate: f64,
    pub average_latency: Duration,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_error: Option<String>,
}

impl SourceHealth {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            last_success_at: None,
            last_failure_at: None,
            success_rate: 1.0,
            average_latency: Duration::ZERO,
            success_count: 0,
            failure_count: 0,
            last_error: None,
        }
    }

    pub fn record_success(&mut self, at: DateTime<Utc>, latency: Duration) {
        self.last_success_at = Some(at);
        self.success_count += 1;
        self.success_rate = ema(self.success_rate, 1.0);
        self.average_latency = if self.success_count == 1 {
            latency
        } else {
            Duration::from_secs_f64(ema(
                self.average_latency.as_secs_f64(),
                latency.as_secs_f64(),
            ))
        };
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>, reason: impl Into<String>) {
        self.last_failure_at = Some(at);
        self.failure_count += 1;
        self.success_rate = ema(self.success_rate, 0.0);
        self.last_error = Some(reason.into());
    }

    /// Operator override of the health score
    pub fn set_score(&mut self, score: f64) {
        self.success_rate = score.clamp(0.0, 1.0);
    }

    pub fn is_healthy(&self, floor: f64) -> bool {
        self.success_rate >= floor
    }
}

fn ema(current: f64, sample: f64) -> f64 {
    HEALTH_EMA_ALPHA * sample + (1.0 - HEALTH_EMA_ALPHA) * current
}

/// Point-in-time copy of the engine's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_updates: u64,
    pub failed_updates: u64,
    pub failures_by_reason: HashMap<String, u64>,
    /// Exponential moving average of commit latency
    pub average_latency: Duration,
    pub last_update_time: Option<DateTime<Utc>>,
    pub dropped_deliveries: u64,
    pub per_source_health: HashMap<String, SourceHealth>,
}

impl MetricsSnapshot {
    pub fn source_health(&self, source: &str) -> Option<&SourceHealth> {
        self.per_source_health.get(source)
    }

    pub fn failures_for(&self, reason: &str) -> u64 {
        self.failures_by_reason.get(reason).copied().unwrap_or(0)
    }
}
