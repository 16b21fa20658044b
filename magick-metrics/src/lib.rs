//! # Magick Metrics
//!
//! Asynchronous usage metrics for the magick feature-flag engine.
//! Recording from the evaluation hot path is one channel send; a
//! background aggregator batches counters and flushes them to the
//! Remote store, where all processes aggregate under 7-day keys.
//!
//! ## Quick Start
//!
//! ```
//! use magick_core::config::MetricsConfig;
//! use magick_metrics::{MetricsPipeline, Operation};
//!
//! #[tokio::main]
//! async fn main() {
//!     let pipeline = MetricsPipeline::new(MetricsConfig::default(), None);
//!
//!     pipeline.record("dark_mode", Operation::Enabled, 0.08, true);
//!
//!     tokio::time::sleep(std::time::Duration::from_millis(50)).await;
//!     assert_eq!(pipeline.usage_count("dark_mode").await, 1);
//! }
//! ```

pub mod pipeline;

pub use pipeline::{MetricRecord, MetricsPipeline, Operation};
