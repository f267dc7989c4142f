//! Isolation of user-supplied callbacks
//!
//! Callbacks registered on the event log, the connection registry and the
//! alert engine must never take a sweep or a producer call down with them.

use std::panic::{catch_unwind, AssertUnwindSafe};

/// Run a callback, converting both `Err` results and panics into a message
pub(crate) fn run_isolated<F>(callback: F) -> Result<(), String>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_callback() {
        assert!(run_isolated(|| Ok(())).is_ok());
    }

    #[test]
    fn test_error_callback_is_reported() {
        let result = run_isolated(|| Err(anyhow::anyhow!("sink offline")));
        assert_eq!(result, Err("sink offline".to_string()));
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let result = run_isolated(|| panic!("boom"));
        assert_eq!(result, Err("panicked: boom".to_string()));
    }
}
