//! Transient-failure classification.
//!
//! An error is transient iff it matches any of: an elapsed timeout, a
//! network-shaped I/O error, a known transient database error code, a
//! network-failure message fragment, or an inner source recursively
//! classified as transient. Cancellation is never transient.

use std::error::Error;
use std::io;

use crate::message::ProcessingError;

/// Database error codes treated as transient (deadlock victim, resource
/// throttling, connection loss).
pub const TRANSIENT_DB_ERROR_CODES: &[i32] = &[
    -2,    // client-side timeout
    53,    // network path not found
    1205,  // deadlock victim
    1222,  // lock request timeout
    10053, // transport-level connection aborted
    10054, // connection reset by peer
    10060, // connection attempt timed out
    40143, // connection could not be initialized
    40197, // service error during processing
    40501, // service busy
    40613, // database unavailable
    49918, // not enough resources to process request
];

/// Message fragments indicating network-level failures.
const TRANSIENT_MESSAGE_FRAGMENTS: &[&str] = &[
    "timeout expired",
    "timed out",
    "connection reset",
    "connection refused",
    "connection was forcibly closed",
    "network-related",
    "transport-level error",
    "broken pipe",
    "temporarily unavailable",
];

/// A storage-layer failure carrying the backend's numeric error code.
///
/// Collaborator storage implementations surface backend exceptions
/// through this type so classification can consult the code list.
#[derive(Debug, thiserror::Error)]
#[error("Storage failure (code {code}): {message}")]
pub struct StorageFailure {
    pub code: i32,
    pub message: String,
}

impl StorageFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        TRANSIENT_DB_ERROR_CODES.contains(&self.code)
    }
}

/// Classify an error as transient (retry-eligible).
pub fn is_transient_error(error: &(dyn Error + 'static)) -> bool {
    // Cancellation always wins: a cancelled pipeline error is final even
    // if a source in its chain would otherwise look transient.
    if let Some(processing) = error.downcast_ref::<ProcessingError>() {
        match processing {
            ProcessingError::Cancelled => return false,
            ProcessingError::Transient { .. } => return true,
            _ => {}
        }
    }

    if error.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return true;
    }

    if let Some(io_error) = error.downcast_ref::<io::Error>() {
        if matches!(
            io_error.kind(),
            io::ErrorKind::TimedOut
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::WouldBlock
        ) {
            return true;
        }
    }

    if let Some(storage) = error.downcast_ref::<StorageFailure>() {
        if storage.is_transient() {
            return true;
        }
    }

    let message = error.to_string().to_lowercase();
    if TRANSIENT_MESSAGE_FRAGMENTS
        .iter()
        .any(|fragment| message.contains(fragment))
    {
        return true;
    }

    // Recurse into the cause chain.
    error.source().is_some_and(is_transient_error)
}
