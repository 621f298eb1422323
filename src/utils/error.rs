//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

use serde::{Deserialize, Serialize};

/// Customized error type for Rangemaster. Most conversion sources collapse
/// into the `Msg` variant; the named variants are the error kinds that admin
/// clients and the main loop dispatch on.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RangemasterError {
    /// Master is not (or no longer) the active master.
    MasterNotRunning,

    /// Master is draining for cluster shutdown.
    MasterShuttingDown,

    /// Some META region is not yet online and scanned.
    NotAllMetaRegionsOnline,

    /// Not enough live region servers to host user regions.
    InsufficientServers,

    /// Table already has regions in the catalog.
    TableExists(String),

    /// Table has no regions in the catalog.
    TableNotFound(String),

    /// Operation targets the root or META catalog table.
    ProtectedTable(String),

    /// Rejected region assignment state transition.
    IllegalAssignmentTransition(String),

    /// Explicit split point outside the target region's key range.
    InvalidSplitPoint,

    /// Coordination store unreachable after configured retries.
    CoordUnavailable(String),

    /// Shared file system unavailable; the cluster cannot continue.
    FatalDfsUnavailable(String),

    /// On-disk layout version does not match this build.
    IncompatibleVersion { found: String, expected: String },

    /// Anything else (I/O, encoding, channel failures, ...).
    Msg(String),
}

impl RangemasterError {
    /// Creates an error out of anything that converts to a string.
    pub fn msg(m: impl ToString) -> Self {
        RangemasterError::Msg(m.to_string())
    }

    /// True if the error should be retried by requeueing the operation;
    /// false if the main loop should treat it as fatal.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            RangemasterError::FatalDfsUnavailable(_)
                | RangemasterError::IncompatibleVersion { .. }
                | RangemasterError::CoordUnavailable(_)
        )
    }
}

impl fmt::Display for RangemasterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RangemasterError::MasterNotRunning => write!(f, "master not running"),
            RangemasterError::MasterShuttingDown => {
                write!(f, "master shutting down")
            }
            RangemasterError::NotAllMetaRegionsOnline => {
                write!(f, "not all META regions online")
            }
            RangemasterError::InsufficientServers => {
                write!(f, "not enough region servers")
            }
            RangemasterError::TableExists(t) => {
                write!(f, "table '{}' already exists", t)
            }
            RangemasterError::TableNotFound(t) => {
                write!(f, "table '{}' not found", t)
            }
            RangemasterError::ProtectedTable(t) => {
                write!(f, "table '{}' is protected", t)
            }
            RangemasterError::IllegalAssignmentTransition(m) => {
                write!(f, "illegal assignment transition: {}", m)
            }
            RangemasterError::InvalidSplitPoint => {
                write!(f, "split point outside region's key range")
            }
            RangemasterError::CoordUnavailable(m) => {
                write!(f, "coordination store unavailable: {}", m)
            }
            RangemasterError::FatalDfsUnavailable(m) => {
                write!(f, "file system unavailable: {}", m)
            }
            RangemasterError::IncompatibleVersion { found, expected } => {
                write!(
                    f,
                    "layout version '{}' incompatible with expected '{}'",
                    found, expected
                )
            }
            RangemasterError::Msg(m) => write!(f, "{}", m), // no literal quotes
        }
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `RangemasterError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for RangemasterError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                RangemasterError::Msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(std::string::FromUtf8Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::sync::broadcast::error::RecvError);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RangemasterError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RangemasterError::Msg(e.to_string())
    }
}

impl<T> From<tokio::sync::watch::error::SendError<T>> for RangemasterError {
    fn from(e: tokio::sync::watch::error::SendError<T>) -> Self {
        RangemasterError::Msg(e.to_string())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = RangemasterError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = RangemasterError::from(io_error);
        assert!(matches!(e, RangemasterError::Msg(m) if m.contains("oh no!")));
    }

    #[test]
    fn transient_classification() {
        assert!(RangemasterError::NotAllMetaRegionsOnline.is_transient());
        assert!(RangemasterError::msg("socket reset").is_transient());
        assert!(!RangemasterError::FatalDfsUnavailable("gone".into())
            .is_transient());
        assert!(!RangemasterError::CoordUnavailable("gone".into())
            .is_transient());
    }
}
