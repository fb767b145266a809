//! Fail-safe diagnostic capture for errors raised in instrumented code
//!
//! Capture must never destabilize the host program: every step in here
//! either succeeds or degrades. A frame that cannot be symbolized
//! becomes a tagged partial entry and the walk continues; if record
//! construction itself misbehaves, the caller still gets a minimal
//! partial record. Nothing in this module returns `Err` or panics
//! through to instrumented code.

use crate::context::{self, CapturedBinding};
use crate::timing::epoch_secs;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

/// Bounded stack walk, same cap as a reasonable backtrace
pub const MAX_STACK_DEPTH: usize = 64;

/// Marker function name for frames that failed to symbolize
pub const UNRESOLVED_FRAME: &str = "<unresolved>";

const MAX_ERROR_CHAIN: usize = 8;

/// One frame of the originating call stack
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackFrameRecord {
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Set when introspection of this frame degraded mid-capture
    pub partial: bool,
    /// Diagnostic bindings attached to this frame; always present
    pub locals: Vec<CapturedBinding>,
    /// Module-level state; omitted entirely when global capture is
    /// suppressed by configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub globals: Option<Vec<CapturedBinding>>,
}

/// Structured diagnostic record for one failure
///
/// Built synchronously at capture time, immutable afterwards, and handed
/// to a [`FailureSink`] rather than retained here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub operation_label: String,
    /// Concrete Rust type path of the error
    pub error_kind: String,
    pub error_message: String,
    /// `source()` chain, outermost cause first
    pub error_chain: Vec<String>,
    pub thread: String,
    pub captured_at: f64,
    /// Outermost to innermost
    pub stack_frames: Vec<StackFrameRecord>,
}

/// Controls optional parts of capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Include the module-level registry per frame (default true);
    /// when false the field is omitted, not masked
    pub show_globals: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        CaptureOptions { show_globals: true }
    }
}

/// Destination for completed failure records
///
/// The default [`LogSink`] emits each record as a structured log event;
/// reports and files are external collaborators behind this seam.
pub trait FailureSink: Send + Sync {
    fn record(&self, record: &FailureRecord);
}

/// Emits failure records to the `tracing` event stream as JSON
#[derive(Debug, Default)]
pub struct LogSink;

impl FailureSink for LogSink {
    fn record(&self, record: &FailureRecord) {
        let payload = serde_json::to_string(record)
            .unwrap_or_else(|_| format!("{{\"operation_label\":{:?}}}", record.operation_label));
        tracing::error!(
            operation = %record.operation_label,
            kind = %record.error_kind,
            "instrumented call failed: {payload}"
        );
    }
}

/// Buffers failure records in memory; used by tests and embedders that
/// drain diagnostics themselves
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<FailureRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
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

    /// Drain and return everything recorded so far
    pub fn take(&self) -> Vec<FailureRecord> {
        match self.records.lock() {
            Ok(mut records) => std::mem::take(&mut *records),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl FailureSink for MemorySink {
    fn record(&self, record: &FailureRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
    }
}

/// Capture a failure record for `error`, with default options
pub fn capture_failure<E>(operation_label: &str, error: &E) -> FailureRecord
where
    E: std::error::Error + ?Sized,
{
    capture_failure_with(operation_label, error, CaptureOptions::default())
}

/// Capture a failure record for `error`
///
/// Guaranteed not to panic; degraded inputs yield a partial record.
pub fn capture_failure_with<E>(
    operation_label: &str,
    error: &E,
    options: CaptureOptions,
) -> FailureRecord
where
    E: std::error::Error + ?Sized,
{
    let kind = std::any::type_name::<E>().to_string();
    let message = render_guarded(|| error.to_string());
    let chain = std::panic::catch_unwind(AssertUnwindSafe(|| error_chain(error)))
        .unwrap_or_default();
    build_guarded(operation_label, kind, message, chain, options)
}

/// Capture a failure record for a caught panic payload
pub fn capture_panic(
    operation_label: &str,
    payload: &(dyn Any + Send),
    options: CaptureOptions,
) -> FailureRecord {
    let message = panic_message(payload);
    build_guarded(
        operation_label,
        "panic".to_string(),
        message,
        Vec::new(),
        options,
    )
}

/// Best-effort string for a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

fn render_guarded(render: impl FnOnce() -> String) -> String {
    std::panic::catch_unwind(AssertUnwindSafe(render))
        .unwrap_or_else(|_| "<unrenderable error>".to_string())
}

fn error_chain<E: std::error::Error + ?Sized>(error: &E) -> Vec<String> {
    let mut chain = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        if chain.len() >= MAX_ERROR_CHAIN {
            break;
        }
        source = cause.source();
    }
    chain
}

fn build_guarded(
    operation_label: &str,
    error_kind: String,
    error_message: String,
    error_chain: Vec<String>,
    options: CaptureOptions,
) -> FailureRecord {
    let label = operation_label.to_string();
    let kind = error_kind.clone();
    let message = error_message.clone();
    match std::panic::catch_unwind(AssertUnwindSafe(move || FailureRecord {
        operation_label: label,
        error_kind,
        error_message,
        error_chain,
        thread: thread_label(),
        captured_at: epoch_secs(),
        stack_frames: build_frames(options),
    })) {
        Ok(record) => record,
        Err(_) => {
            tracing::debug!("failure capture degraded to a minimal record");
            FailureRecord {
                operation_label: operation_label.to_string(),
                error_kind: kind,
                error_message: message,
                error_chain: Vec::new(),
                thread: thread_label(),
                captured_at: epoch_secs(),
                stack_frames: vec![StackFrameRecord {
                    function: UNRESOLVED_FRAME.to_string(),
                    file: None,
                    line: None,
                    partial: true,
                    locals: Vec::new(),
                    globals: None,
                }],
            }
        }
    }
}

fn thread_label() -> String {
    std::thread::current()
        .name()
        .unwrap_or("<unnamed>")
        .to_string()
}

/// Frames belonging to the capture machinery or the panic runtime,
/// not to the instrumented code
fn is_machinery_frame(function: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "backtrace::",
        "kode_kronical::failure_capture",
        "std::panicking",
        "core::panicking",
        "std::panic",
        "std::rt::",
        "std::sys",
        "rust_begin_unwind",
        "__rust",
        "__libc_start",
        "_start",
    ];
    PREFIXES.iter().any(|prefix| function.starts_with(prefix))
}

fn build_frames(options: CaptureOptions) -> Vec<StackFrameRecord> {
    let backtrace = backtrace::Backtrace::new();
    let mut frames = Vec::new();
    for frame in backtrace.frames() {
        if frames.len() >= MAX_STACK_DEPTH {
            break;
        }
        let symbols = frame.symbols();
        if symbols.is_empty() {
            frames.push(StackFrameRecord {
                function: UNRESOLVED_FRAME.to_string(),
                file: None,
                line: None,
                partial: true,
                locals: Vec::new(),
                globals: None,
            });
            continue;
        }
        for symbol in symbols {
            let function = match symbol.name() {
                Some(name) => name.to_string(),
                None => UNRESOLVED_FRAME.to_string(),
            };
            if is_machinery_frame(&function) {
                continue;
            }
            frames.push(StackFrameRecord {
                partial: function == UNRESOLVED_FRAME,
                file: symbol.filename().map(|p| p.display().to_string()),
                line: symbol.lineno(),
                function,
                locals: Vec::new(),
                globals: None,
            });
        }
    }

    // Backtraces come innermost-first; records read outer to inner
    frames.reverse();
    attach_scopes(&mut frames);

    if options.show_globals {
        let globals = context::global_snapshot();
        for frame in &mut frames {
            if !frame.partial {
                frame.globals = Some(globals.clone());
            }
        }
    }
    frames
}

/// Pair diagnostic scopes with frames by label; scopes with no matching
/// frame attach to the innermost resolved frame so bindings are never
/// silently dropped
fn attach_scopes(frames: &mut [StackFrameRecord]) {
    let scopes = context::scope_snapshot();
    if scopes.is_empty() {
        return;
    }

    let mut cursor = 0;
    let mut unmatched: Vec<CapturedBinding> = Vec::new();
    for scope in scopes {
        let found = frames[cursor..]
            .iter()
            .position(|f| !f.partial && f.function.contains(&scope.label));
        match found {
            Some(offset) => {
                let index = cursor + offset;
                frames[index].locals.extend(scope.bindings);
                cursor = index;
            }
            None => unmatched.extend(scope.bindings),
        }
    }

    if !unmatched.is_empty() {
        if let Some(frame) = frames.iter_mut().rev().find(|f| !f.partial) {
            frame.locals.extend(unmatched);
        }
    }
}
