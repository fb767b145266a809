//! Integration tests for failure capture and the globals redaction gate

use kode_kronical::{context, KodeKronical, KronicalConfig, MemorySink, WrapOptions};
use serial_test::serial;
use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
struct AppError(&'static str);

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for AppError {}

fn config_with_globals(show: bool) -> KronicalConfig {
    KronicalConfig::from_toml_str(&format!(
        r#"
        [kode_kronical]
        exception_show_globals = {show}
    "#
    ))
    .unwrap()
}

#[test]
#[serial]
fn test_globals_shown_by_default() {
    context::clear_globals();
    context::register_global("CONFIG", &("setting", "value"));
    context::register_global("API_URL", &"https://api.example.com");

    let kron = KodeKronical::new();
    let record = kron.capture_failure("default globals", &AppError("boom"));

    let frame_globals: Vec<_> = record
        .stack_frames
        .iter()
        .filter_map(|f| f.globals.as_ref())
        .collect();
    assert!(!frame_globals.is_empty());
    assert!(frame_globals[0].iter().any(|b| b.name == "API_URL"));
    context::clear_globals();
}

#[test]
#[serial]
fn test_globals_omitted_when_disabled() {
    context::clear_globals();
    context::register_global("SECRET_TOKEN", &"hunter2");

    let kron = KodeKronical::with_config(config_with_globals(false)).unwrap();
    let sink = Arc::new(MemorySink::new());
    kron.set_failure_sink(sink.clone());

    let result: Result<(), AppError> = kron.try_call("redacted op", WrapOptions::default(), || {
        Err(AppError("sensitive failure"))
    });
    assert!(result.is_err());

    let failures = sink.take();
    assert_eq!(failures.len(), 1);
    let json = serde_json::to_value(&failures[0]).unwrap();
    for frame in json["stack_frames"].as_array().unwrap() {
        // Omitted, not masked: the key itself must be absent
        assert!(frame.get("globals").is_none());
    }
    let rendered = json.to_string();
    assert!(!rendered.contains("hunter2"));
    context::clear_globals();
}

#[test]
fn test_wrapped_failure_records_scope_locals() {
    let kron = KodeKronical::new();
    let sink = Arc::new(MemorySink::new());
    kron.set_failure_sink(sink.clone());

    let result: Result<(), AppError> =
        kron.try_call("lookup_user", WrapOptions::default(), || {
            context::record_local("user_id", &9001);
            context::record_local("attempt", &3);
            Err(AppError("user not found"))
        });
    assert!(result.is_err());

    let failures = sink.take();
    let locals: Vec<_> = failures[0]
        .stack_frames
        .iter()
        .flat_map(|f| f.locals.iter())
        .collect();
    assert!(locals.iter().any(|b| b.name == "user_id" && b.value == "9001"));
    assert!(locals.iter().any(|b| b.name == "attempt"));
}

#[test]
fn test_store_args_snapshot_reaches_failure_locals() {
    let kron = KodeKronical::new();
    let sink = Arc::new(MemorySink::new());
    kron.set_failure_sink(sink.clone());

    let mut wrapped = kron.wrap("divide", WrapOptions::store_args(), |(a, b): (i32, i32)| {
        if b == 0 {
            panic!("division by zero");
        }
        a / b
    });

    let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| wrapped((7, 0))));
    assert!(unwound.is_err());

    let failures = sink.take();
    assert_eq!(failures.len(), 1);
    let locals: Vec<_> = failures[0]
        .stack_frames
        .iter()
        .flat_map(|f| f.locals.iter())
        .collect();
    assert!(locals.iter().any(|b| b.name == "args" && b.value == "(7, 0)"));
}

#[test]
fn test_stack_frames_read_outer_to_inner() {
    fn outer_caller(kron: &KodeKronical) -> kode_kronical::FailureRecord {
        inner_callee(kron)
    }

    fn inner_callee(kron: &KodeKronical) -> kode_kronical::FailureRecord {
        kron.capture_failure("nested", &AppError("deep"))
    }

    let kron = KodeKronical::new();
    let record = outer_caller(&kron);

    let outer_pos = record
        .stack_frames
        .iter()
        .position(|f| f.function.contains("outer_caller"));
    let inner_pos = record
        .stack_frames
        .iter()
        .position(|f| f.function.contains("inner_callee"));
    if let (Some(outer), Some(inner)) = (outer_pos, inner_pos) {
        assert!(outer < inner, "outer frame must precede inner frame");
    }
}

#[test]
fn test_failure_record_serializes_for_handoff() {
    let record = kode_kronical::capture_failure("serialize me", &AppError("payload"));
    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["operation_label"], "serialize me");
    assert_eq!(json["error_message"], "payload");
    assert!(json["stack_frames"].is_array());
    assert!(json["captured_at"].as_f64().unwrap() > 0.0);
}

#[test]
fn test_capture_inside_tracing_subscriber_context() {
    // The default sink emits through `tracing`; make sure a live
    // subscriber does not disturb the capture path
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        let kron = KodeKronical::new();
        let record = kron.capture_failure("logged op", &AppError("seen by subscriber"));
        assert_eq!(record.error_message, "seen by subscriber");
    });
}
