//! Diagnostic bindings for failure capture
//!
//! Rust exposes no runtime reflection over frame locals, so diagnostic
//! state is collected through an explicit, capability-bounded interface:
//! a thread-local stack of labeled scopes for per-call bindings, and a
//! process-wide registry for module-level state. Wrapped calls push a
//! scope automatically; application code can add bindings to the current
//! scope or register globals it wants visible in failure records.

use crate::timing::truncate_repr;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, OnceLock};

/// Upper bound on a single rendered binding value
const MAX_BINDING_LEN: usize = 512;

/// One captured name/value pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapturedBinding {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub(crate) struct ScopeSnapshot {
    pub label: String,
    pub bindings: Vec<CapturedBinding>,
}

#[derive(Debug)]
struct Scope {
    label: String,
    bindings: Vec<CapturedBinding>,
}

thread_local! {
    static SCOPES: RefCell<Vec<Scope>> = const { RefCell::new(Vec::new()) };
}

fn globals() -> &'static Mutex<BTreeMap<String, String>> {
    static GLOBALS: OnceLock<Mutex<BTreeMap<String, String>>> = OnceLock::new();
    GLOBALS.get_or_init(|| Mutex::new(BTreeMap::new()))
}

fn render(value: &dyn fmt::Debug) -> String {
    let repr = std::panic::catch_unwind(AssertUnwindSafe(|| format!("{value:?}")))
        .unwrap_or_else(|_| crate::timing::UNREPRESENTABLE.to_string());
    truncate_repr(repr, MAX_BINDING_LEN)
}

/// RAII guard for one diagnostic scope; pops on drop
#[derive(Debug)]
pub struct ScopeGuard {
    // Depth at entry, so an unbalanced stack never pops someone else's scope
    depth: usize,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPES.with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            scopes.truncate(self.depth);
        });
    }
}

/// Enter a labeled diagnostic scope on the current thread
pub fn scope(label: impl Into<String>) -> ScopeGuard {
    SCOPES.with(|scopes| {
        let mut scopes = scopes.borrow_mut();
        let depth = scopes.len();
        scopes.push(Scope {
            label: label.into(),
            bindings: Vec::new(),
        });
        ScopeGuard { depth }
    })
}

/// Bind a value into the innermost scope on the current thread
///
/// A no-op outside any scope; diagnostics never fail the caller.
pub fn record_local(name: &str, value: &dyn fmt::Debug) {
    let rendered = render(value);
    SCOPES.with(|scopes| {
        let mut scopes = scopes.borrow_mut();
        match scopes.last_mut() {
            Some(scope) => scope.bindings.push(CapturedBinding {
                name: name.to_string(),
                value: rendered,
            }),
            None => tracing::trace!("record_local(\"{name}\") outside any scope, dropped"),
        }
    });
}

/// Bind an already-rendered value into the innermost scope
pub(crate) fn record_local_raw(name: &str, rendered: String) {
    SCOPES.with(|scopes| {
        let mut scopes = scopes.borrow_mut();
        if let Some(scope) = scopes.last_mut() {
            scope.bindings.push(CapturedBinding {
                name: name.to_string(),
                value: rendered,
            });
        }
    });
}

/// Register module-level state visible in failure records
pub fn register_global(name: &str, value: &dyn fmt::Debug) {
    let rendered = render(value);
    match globals().lock() {
        Ok(mut map) => {
            map.insert(name.to_string(), rendered);
        }
        Err(poisoned) => {
            tracing::debug!("global registry lock poisoned, recovering");
            poisoned.into_inner().insert(name.to_string(), rendered);
        }
    }
}

/// Remove a previously registered module-level value
pub fn unregister_global(name: &str) {
    match globals().lock() {
        Ok(mut map) => {
            map.remove(name);
        }
        Err(poisoned) => {
            poisoned.into_inner().remove(name);
        }
    }
}

/// Drop every registered module-level value
pub fn clear_globals() {
    match globals().lock() {
        Ok(mut map) => map.clear(),
        Err(poisoned) => poisoned.into_inner().clear(),
    }
}

/// Current thread's scope stack, outermost first
pub(crate) fn scope_snapshot() -> Vec<ScopeSnapshot> {
    SCOPES.with(|scopes| {
        scopes
            .borrow()
            .iter()
            .map(|scope| ScopeSnapshot {
                label: scope.label.clone(),
                bindings: scope.bindings.clone(),
            })
            .collect()
    })
}

/// Registry snapshot, sorted by name
pub(crate) fn global_snapshot() -> Vec<CapturedBinding> {
    let map = match globals().lock() {
        Ok(map) => map.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    map.into_iter()
        .map(|(name, value)| CapturedBinding { name, value })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_scope_guard_pops_on_drop() {
        {
            let _outer = scope("outer");
            record_local("x", &42);
            assert_eq!(scope_snapshot().len(), 1);
            {
                let _inner = scope("inner");
                assert_eq!(scope_snapshot().len(), 2);
            }
            assert_eq!(scope_snapshot().len(), 1);
        }
        assert!(scope_snapshot().is_empty());
    }

    #[test]
    fn test_record_local_binds_into_innermost_scope() {
        let _outer = scope("outer");
        let _inner = scope("inner");
        record_local("n", &7);

        let snapshot = scope_snapshot();
        assert!(snapshot[0].bindings.is_empty());
        assert_eq!(snapshot[1].bindings[0].name, "n");
        assert_eq!(snapshot[1].bindings[0].value, "7");
    }

    #[test]
    fn test_record_local_outside_scope_is_a_noop() {
        // Must not panic and must not leave residue for later scopes
        record_local("orphan", &1);
        let _guard = scope("fresh");
        assert!(scope_snapshot()[0].bindings.is_empty());
    }

    #[test]
    #[serial]
    fn test_global_registry_round_trip() {
        clear_globals();
        register_global("api_url", &"https://api.example.com");
        register_global("retries", &3);

        let snapshot = global_snapshot();
        assert_eq!(snapshot.len(), 2);
        // Sorted by name
        assert_eq!(snapshot[0].name, "api_url");
        assert_eq!(snapshot[1].name, "retries");
        assert_eq!(snapshot[1].value, "3");

        unregister_global("retries");
        assert_eq!(global_snapshot().len(), 1);
        clear_globals();
        assert!(global_snapshot().is_empty());
    }

    #[test]
    #[serial]
    fn test_register_global_overwrites_same_name() {
        clear_globals();
        register_global("mode", &"draft");
        register_global("mode", &"live");
        let snapshot = global_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].value, "\"live\"");
        clear_globals();
    }

    #[test]
    fn test_binding_values_are_bounded() {
        let _guard = scope("big");
        let huge = "y".repeat(10_000);
        record_local("huge", &huge);
        let snapshot = scope_snapshot();
        assert!(snapshot[0].bindings[0].value.len() <= MAX_BINDING_LEN + '…'.len_utf8());
    }

    #[test]
    fn test_scopes_are_thread_local() {
        let _guard = scope("main_thread");
        let other = std::thread::spawn(|| scope_snapshot().len()).join().unwrap();
        assert_eq!(other, 0);
        assert_eq!(scope_snapshot().len(), 1);
    }
}
