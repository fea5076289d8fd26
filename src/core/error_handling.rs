//! Startup error reporting
//!
//! The engine's runtime never surfaces errors to a caller, but startup can
//! still fail (bad configuration, duplicate handler bindings, logger setup).
//! Those errors are reported once, with the user-facing part at `error!` and
//! the full detail at `debug!`.

/// Errors that can tell a user-fixable problem apart from a system failure
///
/// When `is_user_actionable()` is true, `user_message()` should return the
/// message to show; otherwise it should return `None`.
pub trait ContextualError: std::error::Error {
    fn is_user_actionable(&self) -> bool;

    fn user_message(&self) -> Option<&str>;
}

/// Log a fatal startup error with the appropriate level of detail
pub fn log_error_with_context<E: ContextualError + std::fmt::Debug>(
    error: &E,
    operation_context: &str,
) {
    match error.user_message().filter(|_| error.is_user_actionable()) {
        Some(user_msg) => log::error!("FATAL: {}: {}", operation_context, user_msg),
        None => log::error!("FATAL: {}: {}", operation_context, error),
    }
    log::debug!("DEBUG_DETAILS: {:?}", error);
}
