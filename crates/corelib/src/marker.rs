//! Greppable error markers.
//!
//! An infrastructure failure is logged once, in full, under a fresh marker.
//! Only the marker travels on into user-facing text, so the user can find
//! the details in the log of the node that reported the failure.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Prefix of every marker.
pub const MARKER_PREFIX: &str = "E#";

const MARKER_DIGITS: usize = 12;

/// A unique error correlation marker such as `E#3fa0c91b27de`.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorMarker(String);

impl ErrorMarker {
    pub fn generate() -> Self {
        let value: u64 = rand::thread_rng().gen_range(0..1u64 << (MARKER_DIGITS * 4));
        ErrorMarker(format!("{}{:012x}", MARKER_PREFIX, value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `text` has the shape of a marker.
    pub fn is_marker(text: &str) -> bool {
        text.strip_prefix(MARKER_PREFIX).is_some_and(|digits| {
            digits.len() == MARKER_DIGITS
                && digits.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        })
    }
}

impl fmt::Display for ErrorMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Log `message` at error level under a fresh marker and return the marker.
pub fn log_error_with_marker(message: impl fmt::Display) -> ErrorMarker {
    let marker = ErrorMarker::generate();
    tracing::error!(marker = %marker, "{}", message);
    marker
}

/// Like [`log_error_with_marker`], but at warn level; for failures that are
/// expected during normal operation (e.g. a peer disappearing).
pub fn log_warning_with_marker(message: impl fmt::Display) -> ErrorMarker {
    let marker = ErrorMarker::generate();
    tracing::warn!(marker = %marker, "{}", message);
    marker
}
