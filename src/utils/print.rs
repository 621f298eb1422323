//! Helper macros for logging (console printing).

use env_logger::Env;

/// Initializes the global logger in the standard Rangemaster format. Called
/// once at executable startup.
pub fn logger_init() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .format_module_path(false)
        .format_target(false)
        .init();
}

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```
/// use rangemaster::pf_trace;
/// pf_trace!("m"; "got {} to print", 777);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $fmt_str:literal) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```
/// use rangemaster::pf_debug;
/// pf_debug!("m"; "got {} to print", 777);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $fmt_str:literal) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```
/// use rangemaster::pf_info;
/// pf_info!("m"; "got {} to print", 777);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $fmt_str:literal) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```
/// use rangemaster::pf_warn;
/// pf_warn!("m"; "got {} to print", 777);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $fmt_str:literal) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```
/// use rangemaster::pf_error;
/// pf_error!("m"; "got {} to print", 777);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $fmt_str:literal) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log an error string to logger and then return a `RangemasterError`
/// containing the string.
///
/// Example:
/// ```
/// use rangemaster::{logged_err, pf_error, RangemasterError};
/// let e: Result<(), RangemasterError> =
///     logged_err!("m"; "got {} to print", 777);
/// assert!(e.is_err());
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $fmt_str:literal) => {
        {
            pf_error!($prefix; $fmt_str);
            Err($crate::utils::RangemasterError::Msg(
                format!(concat!("({}) ", $fmt_str), $prefix),
            ))
        }
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        {
            pf_error!($prefix; $fmt_str, $($fmt_arg)*);
            Err($crate::utils::RangemasterError::Msg(
                format!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*),
            ))
        }
    };
}
