//! Call-timing records and the shared in-memory recorder
//!
//! Each instrumented call produces one [`TimingRecord`], sealed at call
//! exit and immutable afterwards. Records accumulate in a lock-guarded
//! buffer owned by the [`TimingRecorder`]; growth is unbounded within a
//! process lifetime unless [`TimingRecorder::clear`] is called. That is a
//! deliberate simplicity trade-off, not an oversight — callers that run
//! long should drain the buffer on their own cadence.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Placeholder stored when an argument cannot be rendered
pub const UNREPRESENTABLE: &str = "<unrepresentable>";

/// Seconds since the Unix epoch as a float
pub(crate) fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Truncate a representation to `max_len` bytes on a char boundary
pub(crate) fn truncate_repr(repr: String, max_len: usize) -> String {
    if repr.len() <= max_len {
        return repr;
    }
    let mut cut = max_len;
    while cut > 0 && !repr.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = repr[..cut].to_string();
    truncated.push('…');
    truncated
}

/// Outcome of an instrumented call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ok,
    Error,
}

/// One sealed timing measurement for an instrumented call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingRecord {
    /// Unique, monotonically increasing within one recorder
    pub call_id: u64,
    /// Label of the wrapped callable
    pub function_name: String,
    /// Wall-clock start, seconds since epoch
    pub start_ts: f64,
    /// Wall-clock end; computed as start plus a monotonic elapsed, so
    /// `end_ts >= start_ts` holds even across system clock steps
    pub end_ts: f64,
    /// Elapsed seconds, always `end_ts - start_ts`
    pub duration: f64,
    /// Shallow argument representation, present only with `store_args`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args_snapshot: Option<String>,
    pub status: CallStatus,
}

impl TimingRecord {
    /// Temporal midpoint of the call, for nearest-sample correlation
    pub fn midpoint(&self) -> f64 {
        (self.start_ts + self.end_ts) / 2.0
    }
}

/// Per-wrap options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapOptions {
    /// Capture a shallow, size-bounded argument representation
    pub store_args: bool,
    /// Per-wrap disable; a disabled wrapper is a pass-through
    pub enabled: bool,
}

impl Default for WrapOptions {
    fn default() -> Self {
        WrapOptions {
            store_args: false,
            enabled: true,
        }
    }
}

impl WrapOptions {
    pub fn store_args() -> Self {
        WrapOptions {
            store_args: true,
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        WrapOptions {
            store_args: false,
            enabled: false,
        }
    }
}

/// Shallow, size-bounded argument capture
///
/// Blanket-implemented for anything `Debug`. A `Debug` impl that panics
/// degrades to [`UNREPRESENTABLE`] rather than surfacing an error.
pub trait CaptureArgs {
    fn capture(&self, max_len: usize) -> String;
}

impl<T: fmt::Debug> CaptureArgs for T {
    fn capture(&self, max_len: usize) -> String {
        let repr = std::panic::catch_unwind(AssertUnwindSafe(|| format!("{self:?}")))
            .unwrap_or_else(|_| UNREPRESENTABLE.to_string());
        truncate_repr(repr, max_len)
    }
}

/// An open measurement, sealed exactly once at call exit
#[derive(Debug)]
pub struct CallTimer {
    call_id: u64,
    function_name: String,
    args_snapshot: Option<String>,
    start_ts: f64,
    started: Instant,
}

/// Buffers sealed timing records for all threads of one instance
///
/// Appends are serialized by a mutex; ordering between concurrently
/// completing calls is not guaranteed beyond each record's timestamps.
#[derive(Debug, Default)]
pub struct TimingRecorder {
    records: Mutex<Vec<TimingRecord>>,
    next_call_id: AtomicU64,
}

impl TimingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a measurement for a call that is about to run
    pub fn start_call(&self, function_name: &str, args_snapshot: Option<String>) -> CallTimer {
        CallTimer {
            call_id: self.next_call_id.fetch_add(1, Ordering::Relaxed),
            function_name: function_name.to_string(),
            args_snapshot,
            start_ts: epoch_secs(),
            started: Instant::now(),
        }
    }

    /// Seal a measurement and append it to the buffer
    pub fn seal(&self, timer: CallTimer, status: CallStatus) {
        let duration = timer.started.elapsed().as_secs_f64();
        let record = TimingRecord {
            call_id: timer.call_id,
            function_name: timer.function_name,
            start_ts: timer.start_ts,
            end_ts: timer.start_ts + duration,
            duration,
            args_snapshot: timer.args_snapshot,
            status,
        };
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => {
                tracing::debug!("timing buffer lock poisoned, recovering");
                poisoned.into_inner().push(record);
            }
        }
    }

    /// Snapshot copy of all sealed records since the last clear
    pub fn results(&self) -> Vec<TimingRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.records.lock() {
            Ok(records) => records.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all buffered records; call ids keep counting up
    pub fn clear(&self) {
        match self.records.lock() {
            Ok(mut records) => records.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_seal_produces_consistent_timestamps() {
        let recorder = TimingRecorder::new();
        let timer = recorder.start_call("op", None);
        thread::sleep(Duration::from_millis(5));
        recorder.seal(timer, CallStatus::Ok);

        let records = recorder.results();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.end_ts >= record.start_ts);
        assert!((record.duration - (record.end_ts - record.start_ts)).abs() < 1e-9);
        assert!(record.duration >= 0.005);
        assert_eq!(record.status, CallStatus::Ok);
    }

    #[test]
    fn test_call_ids_are_unique_and_monotonic() {
        let recorder = TimingRecorder::new();
        for _ in 0..5 {
            let timer = recorder.start_call("op", None);
            recorder.seal(timer, CallStatus::Ok);
        }

        let records = recorder.results();
        let ids: Vec<u64> = records.iter().map(|r| r.call_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_clear_resets_buffer_but_not_ids() {
        let recorder = TimingRecorder::new();
        let timer = recorder.start_call("op", None);
        recorder.seal(timer, CallStatus::Ok);
        recorder.clear();
        assert!(recorder.is_empty());

        let timer = recorder.start_call("op", None);
        recorder.seal(timer, CallStatus::Ok);
        assert_eq!(recorder.results()[0].call_id, 1);
    }

    #[test]
    fn test_results_is_a_snapshot_copy() {
        let recorder = TimingRecorder::new();
        let timer = recorder.start_call("op", None);
        recorder.seal(timer, CallStatus::Ok);

        let mut snapshot = recorder.results();
        snapshot.clear();
        assert_eq!(recorder.len(), 1);
    }

    #[test]
    fn test_concurrent_appends_lose_nothing() {
        let recorder = Arc::new(TimingRecorder::new());
        let mut handles = Vec::new();
        for t in 0..8 {
            let recorder = Arc::clone(&recorder);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let timer = recorder.start_call(&format!("worker_{t}"), None);
                    recorder.seal(timer, CallStatus::Ok);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let records = recorder.results();
        assert_eq!(records.len(), 400);
        let mut ids: Vec<u64> = records.iter().map(|r| r.call_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 400);
    }

    #[test]
    fn test_capture_args_formats_debug() {
        let captured = (10, "hello").capture(256);
        assert_eq!(captured, "(10, \"hello\")");
    }

    #[test]
    fn test_capture_args_truncates_long_values() {
        let long = "x".repeat(500);
        let captured = long.capture(16);
        assert!(captured.len() <= 16 + '…'.len_utf8());
        assert!(captured.ends_with('…'));
    }

    #[test]
    fn test_capture_args_panicking_debug_degrades() {
        struct Hostile;
        impl fmt::Debug for Hostile {
            fn fmt(&self, _: &mut fmt::Formatter<'_>) -> fmt::Result {
                panic!("no repr for you");
            }
        }

        let captured = Hostile.capture(256);
        assert_eq!(captured, UNREPRESENTABLE);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "αβγδε".to_string(); // two bytes per char
        let truncated = truncate_repr(s, 5);
        assert!(truncated.ends_with('…'));
        assert!(truncated.chars().count() <= 3);
    }

    #[test]
    fn test_midpoint_between_start_and_end() {
        let record = TimingRecord {
            call_id: 0,
            function_name: "f".to_string(),
            start_ts: 100.0,
            end_ts: 102.0,
            duration: 2.0,
            args_snapshot: None,
            status: CallStatus::Ok,
        };
        assert_eq!(record.midpoint(), 101.0);
    }

    #[test]
    fn test_record_serializes_without_absent_args() {
        let record = TimingRecord {
            call_id: 3,
            function_name: "f".to_string(),
            start_ts: 1.0,
            end_ts: 2.0,
            duration: 1.0,
            args_snapshot: None,
            status: CallStatus::Error,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("args_snapshot").is_none());
        assert_eq!(json["status"], "error");
    }
}
