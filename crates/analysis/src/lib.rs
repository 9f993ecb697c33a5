//! Analytical metrics for evaluating obfuscation transforms.

pub mod metrics;

pub use metrics::{Metrics, collect_metrics, compare};
