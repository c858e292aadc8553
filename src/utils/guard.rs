use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// Run a user-supplied callback, logging any error or panic instead of propagating it.
///
/// Returns `true` when the callback completed successfully.
pub fn run_guarded<F>(what: &str, callback: F) -> bool
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(callback = what, error = %e, "Callback failed");
            false
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!(callback = what, panic = %message, "Callback panicked");
            false
        }
    }
}
