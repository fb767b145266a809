//! The `KodeKronical` facade tying recording, discovery, correlation
//! and failure capture together
//!
//! One instance owns one timing buffer and one daemon client. Handles
//! are cheap to clone and share the same state, so wrapped callables
//! can outlive the handle that created them. Instrumentation runs on
//! the caller's thread; the only blocking this layer adds is the
//! bounded filesystem reads inside the daemon client, and only on
//! summary queries.

use crate::config::{ConfigError, KronicalConfig};
use crate::context;
use crate::correlation::{self, CorrelatedSummary};
use crate::daemon_client::DaemonClient;
use crate::failure_capture::{
    self, CaptureOptions, FailureRecord, FailureSink, LogSink,
};
use crate::timing::{CallStatus, CaptureArgs, TimingRecord, TimingRecorder, WrapOptions};
use serde_json::json;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Samples fetched from the daemon per summary computation
const METRICS_WINDOW: usize = 32;

struct Inner {
    config: KronicalConfig,
    recorder: TimingRecorder,
    daemon: DaemonClient,
    failure_sink: Mutex<Arc<dyn FailureSink>>,
}

/// Process-local performance telemetry entry point
///
/// Wrapping is invisible when nothing fails and strictly additive when
/// something does: return values, `Err` values and panics of wrapped
/// code pass through unchanged, and internal recording faults are
/// absorbed rather than surfaced.
#[derive(Clone)]
pub struct KodeKronical {
    inner: Arc<Inner>,
}

impl Default for KodeKronical {
    fn default() -> Self {
        Self::new()
    }
}

impl KodeKronical {
    /// Instance with default configuration
    pub fn new() -> Self {
        // The default config always validates
        Self::with_config(KronicalConfig::default()).expect("default config is valid")
    }

    /// Instance with explicit configuration, validated up front
    ///
    /// This is the one place the crate hard-fails: a config carrying
    /// unusable values is reported immediately, never silently fixed.
    pub fn with_config(config: KronicalConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let daemon = DaemonClient::new(&config);
        Ok(KodeKronical {
            inner: Arc::new(Inner {
                config,
                recorder: TimingRecorder::new(),
                daemon,
                failure_sink: Mutex::new(Arc::new(LogSink)),
            }),
        })
    }

    /// Instance configured from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::with_config(KronicalConfig::from_file(path)?)
    }

    pub fn config(&self) -> &KronicalConfig {
        &self.inner.config
    }

    pub fn daemon_client(&self) -> &DaemonClient {
        &self.inner.daemon
    }

    /// Replace the destination for failure records
    pub fn set_failure_sink(&self, sink: Arc<dyn FailureSink>) {
        match self.inner.failure_sink.lock() {
            Ok(mut current) => *current = sink,
            Err(poisoned) => *poisoned.into_inner() = sink,
        }
    }

    /// Wrap a callable; the wrapper times each invocation and passes
    /// arguments, return values and unwinds through unchanged
    pub fn wrap<A, R, F>(
        &self,
        label: impl Into<String>,
        options: WrapOptions,
        mut f: F,
    ) -> impl FnMut(A) -> R
    where
        A: CaptureArgs,
        F: FnMut(A) -> R,
    {
        let kron = self.clone();
        let label = label.into();
        move |args: A| {
            if !kron.recording_enabled(&options) {
                return f(args);
            }
            let snapshot = options
                .store_args
                .then(|| args.capture(kron.inner.config.kode_kronical.max_arg_capture_len));
            let _scope = context::scope(label.as_str());
            if let Some(snapshot) = &snapshot {
                context::record_local_raw("args", snapshot.clone());
            }
            let timer = kron.inner.recorder.start_call(&label, snapshot);
            match catch_unwind(AssertUnwindSafe(|| f(args))) {
                Ok(value) => {
                    kron.inner.recorder.seal(timer, CallStatus::Ok);
                    value
                }
                Err(payload) => {
                    kron.inner.recorder.seal(timer, CallStatus::Error);
                    let record = failure_capture::capture_panic(
                        &label,
                        payload.as_ref(),
                        kron.capture_options(),
                    );
                    kron.dispatch_failure(&record);
                    resume_unwind(payload)
                }
            }
        }
    }

    /// Time one infallible call
    pub fn time_call<R>(&self, label: &str, options: WrapOptions, f: impl FnOnce() -> R) -> R {
        if !self.recording_enabled(&options) {
            return f();
        }
        let _scope = context::scope(label);
        let timer = self.inner.recorder.start_call(label, None);
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => {
                self.inner.recorder.seal(timer, CallStatus::Ok);
                value
            }
            Err(payload) => {
                self.inner.recorder.seal(timer, CallStatus::Error);
                let record = failure_capture::capture_panic(
                    label,
                    payload.as_ref(),
                    self.capture_options(),
                );
                self.dispatch_failure(&record);
                resume_unwind(payload)
            }
        }
    }

    /// Time one fallible call; an `Err` seals the record with error
    /// status, captures diagnostics, and returns unchanged
    pub fn try_call<R, E>(
        &self,
        label: &str,
        options: WrapOptions,
        f: impl FnOnce() -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: std::error::Error,
    {
        if !self.recording_enabled(&options) {
            return f();
        }
        let _scope = context::scope(label);
        let timer = self.inner.recorder.start_call(label, None);
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => {
                self.inner.recorder.seal(timer, CallStatus::Ok);
                Ok(value)
            }
            Ok(Err(error)) => {
                self.inner.recorder.seal(timer, CallStatus::Error);
                let record =
                    failure_capture::capture_failure_with(label, &error, self.capture_options());
                self.dispatch_failure(&record);
                Err(error)
            }
            Err(payload) => {
                self.inner.recorder.seal(timer, CallStatus::Error);
                let record = failure_capture::capture_panic(
                    label,
                    payload.as_ref(),
                    self.capture_options(),
                );
                self.dispatch_failure(&record);
                resume_unwind(payload)
            }
        }
    }

    /// Snapshot copy of all sealed timing records since the last clear
    pub fn get_results(&self) -> Vec<TimingRecord> {
        self.inner.recorder.results()
    }

    /// Per-function aggregates enriched with daemon samples
    ///
    /// Performs exactly one daemon query; with no daemon running the
    /// summaries carry timing aggregates and unset metrics fields.
    pub fn get_summary(&self) -> BTreeMap<String, CorrelatedSummary> {
        let records = self.inner.recorder.results();
        let metrics = self.inner.daemon.get_recent_metrics(METRICS_WINDOW);
        correlation::correlate(&records, &metrics)
    }

    /// Effective configuration plus discovery state, for diagnostics
    pub fn get_config_info(&self) -> serde_json::Value {
        let mut info = self.inner.config.effective();
        if let serde_json::Value::Object(map) = &mut info {
            let dirs: Vec<String> = self
                .inner
                .daemon
                .data_dirs()
                .iter()
                .map(|d| d.display().to_string())
                .collect();
            map.insert("data_dirs".to_string(), json!(dirs));
            map.insert(
                "active_data_dir".to_string(),
                json!(self
                    .inner
                    .daemon
                    .active_data_dir()
                    .map(|d| d.display().to_string())),
            );
            map.insert(
                "daemon_running".to_string(),
                json!(self.inner.daemon.daemon_running()),
            );
            map.insert(
                "buffered_records".to_string(),
                json!(self.inner.recorder.len()),
            );
        }
        info
    }

    /// Build a failure record for `error` and hand it to the sink
    pub fn capture_failure<E>(&self, operation_label: &str, error: &E) -> FailureRecord
    where
        E: std::error::Error + ?Sized,
    {
        let record = failure_capture::capture_failure_with(
            operation_label,
            error,
            self.capture_options(),
        );
        self.dispatch_failure(&record);
        record
    }

    /// Drop all buffered timing records
    pub fn clear(&self) {
        self.inner.recorder.clear();
    }

    fn recording_enabled(&self, options: &WrapOptions) -> bool {
        self.inner.config.kode_kronical.enabled && options.enabled
    }

    fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            show_globals: self.inner.config.kode_kronical.exception_show_globals,
        }
    }

    /// Sinks are embedder code; a sink that misbehaves is absorbed the
    /// same way any other internal fault is
    fn dispatch_failure(&self, record: &FailureRecord) {
        let sink = match self.inner.failure_sink.lock() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        };
        if catch_unwind(AssertUnwindSafe(|| sink.record(record))).is_err() {
            tracing::debug!("failure sink panicked, record dropped");
        }
    }
}
