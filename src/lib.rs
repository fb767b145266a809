//! Kode Kronical - process-local performance telemetry
//!
//! This library times instrumented function calls, correlates each
//! timed call with host system load sampled by an independent collector
//! daemon, and captures structured diagnostics when instrumented code
//! fails — without ever changing the behavior of the code it observes.
//!
//! # Example
//!
//! ```
//! use kode_kronical::{KodeKronical, WrapOptions};
//!
//! let kron = KodeKronical::new();
//! let mut sum_range = kron.wrap("sum_range", WrapOptions::default(), |n: u64| {
//!     (0..n).sum::<u64>()
//! });
//!
//! assert_eq!(sum_range(100), 4950);
//! assert_eq!(kron.get_results().len(), 1);
//! ```

pub mod config;
pub mod context;
pub mod core;
pub mod correlation;
pub mod daemon_client;
pub mod failure_capture;
pub mod timing;

pub use crate::config::{ConfigError, KronicalConfig};
pub use crate::core::KodeKronical;
pub use crate::correlation::CorrelatedSummary;
pub use crate::daemon_client::{DaemonClient, SystemMetrics};
pub use crate::failure_capture::{
    capture_failure, CaptureOptions, FailureRecord, FailureSink, LogSink, MemorySink,
};
pub use crate::timing::{CallStatus, CaptureArgs, TimingRecord, WrapOptions};
