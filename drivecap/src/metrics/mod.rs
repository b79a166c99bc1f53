//! Metrics collection for a drive.
//!
//! All counters are monotonic (never decrease). Delta calculation is the
//! caller's responsibility.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example(drive: drivecap::Drive) {
//! let metrics = drive.metrics();
//! println!("zero I/Os: {}", metrics.zero_ios);
//! println!("metadata-only advances: {}", metrics.metadata_only_advances);
//! # }
//! ```

mod drive_metrics;

pub use drive_metrics::{DriveMetrics, DriveMetricsStorage};
