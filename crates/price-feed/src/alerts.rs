//! Structured alerting
//!
//! The manager builds alert payloads and hands them to every registered
//! sink. Delivery is at-least-once with no ordering across alert kinds;
//! what a sink does with an alert (log, webhook, pager) is up to the sink.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use oracle_core::{relative_deviation, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    PriceDeviation,
    StalePrice,
    SourceFailure,
    ValidationFailure,
}

impl AlertKind {
    const ALL: [AlertKind; 4] = [
        AlertKind::PriceDeviation,
        AlertKind::StalePrice,
        AlertKind::SourceFailure,
        AlertKind::ValidationFailure,
    ];

    fn index(&self) -> usize {
        match self {
            AlertKind::PriceDeviation => 0,
            AlertKind::StalePrice => 1,
            AlertKind::SourceFailure => 2,
            AlertKind::ValidationFailure => 3,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertKind::PriceDeviation => "price_deviation",
            AlertKind::StalePrice => "stale_price",
            AlertKind::SourceFailure => "source_failure",
            AlertKind::ValidationFailure => "validation_failure",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Alert payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub asset_id: Option<String>,
    pub source: Option<String>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// Destination for raised alerts
///
/// `deliver` runs inline on the commit path, while that asset's commit lock
/// is held. Implementations must not block: a sink that does I/O should
/// push the alert onto a queue and return.
pub trait AlertSink: Send + Sync {
    fn deliver(&self, alert: &Alert);
}

/// Emits alerts as structured log events
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn deliver(&self, alert: &Alert) {
        let asset = alert.asset_id.as_deref().unwrap_or("-");
        let source = alert.source.as_deref().unwrap_or("-");
        match alert.severity {
            AlertSeverity::Info => info!(
                kind = %alert.kind, asset, source, details = %alert.details,
                "{}", alert.message
            ),
            AlertSeverity::Warning => warn!(
                kind = %alert.kind, asset, source, details = %alert.details,
                "{}", alert.message
            ),
            AlertSeverity::Error | AlertSeverity::Critical => error!(
                kind = %alert.kind, asset, source, details = %alert.details,
                severity = ?alert.severity, "{}", alert.message
            ),
        }
    }
}

/// Keeps the most recent alerts in memory
#[derive(Debug)]
pub struct MemoryAlertSink {
    alerts: Mutex<VecDeque<Alert>>,
    capacity: usize,
}

impl MemoryAlertSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            alerts: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    pub fn alerts_of(&self, kind: AlertKind) -> Vec<Alert> {
        self.alerts
            .lock()
            .iter()
            .filter(|a| a.kind == kind)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.alerts.lock().clear();
    }
}

impl Default for MemoryAlertSink {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl AlertSink for MemoryAlertSink {
    fn deliver(&self, alert: &Alert) {
        let mut alerts = self.alerts.lock();
        if alerts.len() == self.capacity {
            alerts.pop_front();
        }
        alerts.push_back(alert.clone());
    }
}

/// Hands alerts to a bounded queue for an async consumer (webhook, pager)
///
/// Never waits: when the queue is full the alert is counted and dropped.
#[derive(Debug)]
pub struct ChannelAlertSink {
    tx: mpsc::Sender<Alert>,
    dropped: AtomicU64,
}

impl ChannelAlertSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx,
            dropped: AtomicU64::new(0),
        };
        (sink, rx)
    }

    /// Alerts lost to a full queue
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AlertSink for ChannelAlertSink {
    fn deliver(&self, alert: &Alert) {
        match self.tx.try_send(alert.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(alert)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Alert queue full, dropping {} alert", alert.kind);
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                debug!("Alert consumer gone, dropping {} alert", alert.kind);
            }
        }
    }
}

/// Raises alerts and fans them out to sinks
pub struct AlertManager {
    sinks: Vec<Arc<dyn AlertSink>>,
    counts: [AtomicU64; 4],
}

impl AlertManager {
    pub fn new() -> Self {
        Self {
            sinks: vec![],
            counts: Default::default(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// An accepted commit moved more than the policy's deviation threshold
    pub fn alert_deviation(
        &self,
        asset_id: &str,
        old_value: Decimal,
        new_value: Decimal,
        threshold: Decimal,
    ) {
        let deviation = relative_deviation(old_value, new_value);
        self.raise(Alert {
            kind: AlertKind::PriceDeviation,
            severity: AlertSeverity::Warning,
            asset_id: Some(asset_id.to_string()),
            source: None,
            message: format!(
                "{} moved {} -> {} ({} > {})",
                asset_id, old_value, new_value, deviation, threshold
            ),
            raised_at: Utc::now(),
            details: serde_json::json!({
                "old_value": old_value.to_string(),
                "new_value": new_value.to_string(),
                "deviation": deviation.to_string(),
                "threshold": threshold.to_string(),
            }),
        });
    }

    /// No commit within the asset's max data age
    pub fn alert_stale_price(
        &self,
        asset_id: &str,
        last_update: Option<DateTime<Utc>>,
        max_age: Duration,
    ) {
        let message = match last_update {
            Some(at) => format!("{} not updated since {}", asset_id, at.to_rfc3339()),
            None => format!("{} has never been committed", asset_id),
        };
        self.raise(Alert {
            kind: AlertKind::StalePrice,
            severity: AlertSeverity::Warning,
            asset_id: Some(asset_id.to_string()),
            source: None,
            message,
            raised_at: Utc::now(),
            details: serde_json::json!({
                "last_update": last_update.map(|t| t.to_rfc3339()),
                "max_age_ms": max_age.as_millis() as u64,
            }),
        });
    }

    /// A source's rolling success rate fell below the operator floor
    pub fn alert_source_failure(&self, source: &str, reason: &str) {
        self.raise(Alert {
            kind: AlertKind::SourceFailure,
            severity: AlertSeverity::Critical,
            asset_id: None,
            source: Some(source.to_string()),
            message: format!("Data source {} failing: {}", source, reason),
            raised_at: Utc::now(),
            details: serde_json::json!({ "reason": reason }),
        });
    }

    /// A commit cycle was rejected by the validator
    pub fn alert_validation_failure(&self, asset_id: &str, err: &ValidationError) {
        self.raise(Alert {
            kind: AlertKind::ValidationFailure,
            severity: AlertSeverity::Warning,
            asset_id: Some(asset_id.to_string()),
            source: None,
            message: format!("Commit for {} rejected: {}", asset_id, err),
            raised_at: Utc::now(),
            details: serde_json::json!({ "reason": err.reason() }),
        });
    }

    pub fn count(&self, kind: AlertKind) -> u64 {
        self.counts[kind.index()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        AlertKind::ALL.iter().map(|k| self.count(*k)).sum()
    }

    fn raise(&self, alert: Alert) {
        self.counts[alert.kind.index()].fetch_add(1, Ordering::Relaxed);
        for sink in &self.sinks {
            sink.deliver(&alert);
        }
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new().with_sink(Arc::new(LogAlertSink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn manager() -> (AlertManager, Arc<MemoryAlertSink>) {
        let sink = Arc::new(MemoryAlertSink::new(10));
        let manager = AlertManager::new().with_sink(sink.clone());
        (manager, sink)
    }

    #[test]
    fn test_deviation_payload() {
        let (manager, sink) = manager();
        manager.alert_deviation("NEO/USD", dec!(100), dec!(110), dec!(0.05));

        let alerts = sink.alerts_of(AlertKind::PriceDeviation);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].asset_id.as_deref(), Some("NEO/USD"));
        assert_eq!(alerts[0].details["old_value"], "100");
        assert_eq!(alerts[0].details["new_value"], "110");
        assert_eq!(manager.count(AlertKind::PriceDeviation), 1);
    }

    #[test]
    fn test_source_failure_is_critical() {
        let (manager, sink) = manager();
        manager.alert_source_failure("huobi", "success rate 0.30 below 0.50");

        let alerts = sink.alerts();
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert_eq!(alerts[0].source.as_deref(), Some("huobi"));
    }

    #[test]
    fn test_validation_and_stale() {
        let (manager, sink) = manager();
        manager.alert_validation_failure(
            "NEO/USD",
            &ValidationError::StaleData { required: 2, fresh: 0 },
        );
        manager.alert_stale_price("NEO/USD", None, Duration::from_secs(60));

        assert_eq!(sink.alerts_of(AlertKind::ValidationFailure)[0].details["reason"], "stale_data");
        assert_eq!(sink.alerts_of(AlertKind::StalePrice)[0].details["max_age_ms"], 60_000);
        assert_eq!(manager.total(), 2);
    }

    #[test]
    fn test_memory_sink_is_bounded() {
        let sink = MemoryAlertSink::new(2);
        let manager = AlertManager::new().with_sink(Arc::new(LogAlertSink));
        let alert = Alert {
            kind: AlertKind::StalePrice,
            severity: AlertSeverity::Info,
            asset_id: None,
            source: None,
            message: String::new(),
            raised_at: Utc::now(),
            details: serde_json::Value::Null,
        };

        for _ in 0..5 {
            sink.deliver(&alert);
        }
        assert_eq!(sink.alerts().len(), 2);

        sink.clear();
        assert!(sink.alerts().is_empty());
        assert_eq!(manager.total(), 0);
    }

    #[tokio::test]
    async fn test_channel_sink_never_waits_on_consumer() {
        let (sink, mut rx) = ChannelAlertSink::new(1);
        let manager = AlertManager::new().with_sink(Arc::new(sink));

        manager.alert_source_failure("huobi", "timeout");
        manager.alert_source_failure("okx", "timeout");
        assert_eq!(manager.total(), 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.source.as_deref(), Some("huobi"));
        assert!(rx.try_recv().is_err());

        let (sink, rx) = ChannelAlertSink::new(1);
        drop(rx);
        sink.deliver(&first);
        assert_eq!(sink.dropped(), 0);

        let (sink, _rx) = ChannelAlertSink::new(1);
        sink.deliver(&first);
        sink.deliver(&first);
        assert_eq!(sink.dropped(), 1);
    }
}
