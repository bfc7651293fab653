//! Oracle price-feed engine
//!
//! Features:
//! - Per-asset buffering of the latest observation from each source
//! - Quorum, freshness, rate and range validation before every commit
//! - Mean, median, weighted and trimmed-mean aggregation
//! - Append-only price history (in-memory or JSON-lines files)
//! - Bounded drop-oldest subscriber fan-out
//! - Deviation, staleness, source and validation alerts

pub mod aggregation;
pub mod aggregator;
pub mod alerts;
pub mod file_store;
pub mod metrics;
pub mod state;
pub mod store;
pub mod subscription;
pub mod validator;

pub use aggregator::{AggregatorBuilder, EngineState, PriceAggregator};
pub use alerts::{
    Alert, AlertKind, AlertManager, AlertSeverity, AlertSink, ChannelAlertSink, LogAlertSink,
    MemoryAlertSink,
};
pub use file_store::FilePriceStore;
pub use metrics::MetricsCollector;
pub use state::{PriceState, PriceStateStats};
pub use store::{MemoryPriceStore, PriceStore};
pub use subscription::{Subscription, SubscriptionId};
pub use validator::PriceValidator;
