//! Fail-open utilities for graceful degradation
//!
//! Some work around the pipeline is bookkeeping rather than correctness:
//! writing the run report, forwarding progress, cleaning temporary state.
//! Those operations should never halt a run.
//!
//! DO NOT use fail-open for:
//! - Tool output parsing (a silent parse failure hides real defects)
//! - Hook status decisions
//! - Agent routing and iteration accounting

use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open (bookkeeping, not pipeline logic)
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// # Usage
///
/// ```
/// use vigil_core::fail_open::fail_open;
/// use vigil_core::{Result, VigilError};
///
/// fn write_report() -> Result<()> {
///     Err(VigilError::Other("disk full".to_string()))
/// }
///
/// let written = fail_open("run_report", write_report);
/// assert!(written.is_none());
/// ```
pub fn fail_open<F, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Result<T>,
{
    match f() {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VigilError;

    #[test]
    fn test_fail_open_success() {
        let result = fail_open("test_op", || Ok::<_, VigilError>(42));
        assert_eq!(result, Some(42));
    }

    #[test]
    fn test_fail_open_failure() {
        let result = fail_open("test_op", || {
            Err::<i32, _>(VigilError::Other("test error".to_string()))
        });
        assert_eq!(result, None);
    }
}
