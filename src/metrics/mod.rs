//! Prometheus metrics for producers and consumers.
//!
//! # Example
//!
//! ```ignore
//! use blockq::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_produced("items");
//! collector.record_miss("items", 0.7);
//!
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use self::collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    CONSUMER_RUNS_TOTAL, ITEMS_CONSUMED_TOTAL, ITEMS_PRODUCED_TOTAL, POLL_MISSES_TOTAL,
    POLL_WAIT, QUEUE_DEPTH, REGISTRY,
};
