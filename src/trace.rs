//! Verbosity-gated diagnostics
//!
//! Diagnostics go to stderr and never affect returned values; the functional
//! contract of every API is identical at all verbosity levels.

/// Log a diagnostic line to stderr when the configured verbosity is at least
/// the required level (`1` for progress messages, `2` for per-step timing).
#[macro_export]
macro_rules! vlog {
    ($verbose:expr, $level:expr, $($arg:tt)*) => {
        if $verbose >= $level {
            eprintln!("[relay-compass] {}", format_args!($($arg)*));
        }
    };
}
