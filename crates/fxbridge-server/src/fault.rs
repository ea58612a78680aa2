//! Fault isolation around native plugin calls.
//!
//! Every vtable invocation runs under [`guard`]: a panic unwinding out of
//! the plugin (or out of marshaling around it) becomes a `PluginFault`
//! error instead of tearing the server down. Hard faults (SIGSEGV and
//! friends) still kill the process; that is the entire reason the plugin
//! lives in a separate process to begin with.

use fxbridge::error::{BridgeError, Result};
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// Run `f`, converting an unwind into a fault error named after `what`.
pub fn guard<T>(what: &str, f: impl FnOnce() -> T) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => {
            let detail = payload_message(&payload);
            error!("Plugin faulted during {}: {}", what, detail);
            Err(BridgeError::PluginFault(format!(
                "Fault during {}: {}",
                what, detail
            )))
        }
    }
}

fn payload_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic payload".to_string()
    }
}

/// Install a panic hook that leaves a dump file behind before the default
/// backtrace output, so a crashed server can be diagnosed post mortem even
/// when the host swallowed its stderr.
pub fn install_crash_handler() {
    let default = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let path = std::env::temp_dir().join(format!("fxbridge-crash-{}.log", std::process::id()));
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            let _ = writeln!(file, "{}", info);
        }
        default(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_passes_through_value() {
        let value = guard("test call", || 41 + 1).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_guard_converts_panic_to_fault() {
        let err = guard("explosive call", || panic!("boom")).unwrap_err();
        match err {
            BridgeError::PluginFault(message) => {
                assert!(message.contains("explosive call"));
                assert!(message.contains("boom"));
            }
            other => panic!("Unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_guard_recovers_for_subsequent_calls() {
        assert!(guard("first", || panic!("once")).is_err());
        assert_eq!(guard("second", || 7).unwrap(), 7);
    }
}
