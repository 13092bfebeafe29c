//! # Engine Errors
//!
//! A single error hierarchy shared by every component of the engine (§7).
//! Each variant carries the HTTP status a caller should return and renders to
//! an OAuth2-shaped JSON body (`{error, error_description}`) so the OID4VCI
//! and OID4VP adapters can serialize it directly; the VC-API adapter wraps it
//! in the `{name, message, details}` envelope instead (§6).

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Result type for the exchange engine.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Engine-wide error kinds (§7).
#[derive(Error, Debug)]
pub enum Error {
    /// No such exchange, or it has expired (404).
    #[error("not_found: {0}")]
    NotFound(String),

    /// Malformed input, a cyclical step, a template error, or an unknown
    /// template id (400, or 500 for exchange timeout).
    #[error("data_error: {0}")]
    DataError(String),

    /// Replay of a completed/invalid exchange, or a failed JWT proof
    /// verification (403).
    #[error("not_allowed: {0}")]
    NotAllowed(String),

    /// The step or exchange does not support the protocol the request came
    /// in on (400).
    #[error("not_supported: {0}")]
    NotSupported(String),

    /// A compare-and-swap conflict on the exchange store (409). Callers with
    /// a retry loop (only `getAuthorizationRequest`, §4.9) may re-read and
    /// retry; all others must surface this to the client.
    #[error("invalid_state: {0}")]
    InvalidState(String),

    /// An `insert` raced another `insert` of the same id, or a `complete`
    /// raced another `complete` (409).
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A downstream capability (issuer, verifier, challenge, status service)
    /// failed (5xx).
    #[error("operation_error: {0}")]
    Operation(String),

    /// The processor's deadline elapsed mid-loop (§4.6 step 3). Wire shape
    /// is identical to [`Error::DataError`] (`code()` is also
    /// `"data_error"`), but this carries its own 500 status rather than
    /// 400, matching the spec's special case for exchange expiry.
    #[error("data_error: {0}")]
    Timeout(String),
}

impl Error {
    /// The HTTP status code a caller should return for this error.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::DataError(_) => 400,
            Self::NotAllowed(_) => 403,
            Self::NotSupported(_) => 400,
            Self::InvalidState(_) | Self::Duplicate(_) => 409,
            Self::Operation(_) => 502,
            Self::Timeout(_) => 500,
        }
    }

    /// The machine-readable, snake_case name of this error kind, used as the
    /// OAuth2 `error` field and the VC-API `name` field.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::DataError(_) => "data_error",
            Self::NotAllowed(_) => "not_allowed",
            Self::NotSupported(_) => "not_supported",
            Self::InvalidState(_) => "invalid_state",
            Self::Duplicate(_) => "duplicate",
            Self::Operation(_) => "operation_error",
            Self::Timeout(_) => "data_error",
        }
    }

    /// The human-readable message, with any nested stack trace stripped
    /// (§7 "Stack traces are stripped from persisted/returned error
    /// payloads").
    #[must_use]
    pub fn description(&self) -> String {
        let full = self.to_string();
        full.split("\n\tat ").next().unwrap_or(&full).to_string()
    }

    /// Renders this error as the OAuth2-style body used by the OID4VCI and
    /// OID4VP adapters: `{error, error_description}`.
    #[must_use]
    pub fn to_oauth_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.code(),
            "error_description": self.description(),
        })
    }

    /// Renders this error as the VC-API envelope: `{name, message, details}`.
    #[must_use]
    pub fn to_vcapi_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.code(),
            "message": self.description(),
            "details": {
                "httpStatusCode": self.status(),
                "public": true,
            },
        })
    }
}

impl Serialize for Error {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_oauth_json().serialize(serializer)
    }
}

/// Constructs a [`Error::DataError`] from a format string or an existing
/// error value.
#[macro_export]
macro_rules! invalid {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::DataError(format!($fmt, $($arg)*))
    };
    ($err:expr $(,)?) => {
        $crate::Error::DataError(format!($err))
    };
}

/// Constructs a [`Error::Operation`] from a format string or an existing
/// error value.
#[macro_export]
macro_rules! operation {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::Operation(format!($fmt, $($arg)*))
    };
    ($err:expr $(,)?) => {
        $crate::Error::Operation(format!($err))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_json_shape() {
        let err = invalid!("bad request");
        let json = err.to_oauth_json();
        assert_eq!(json["error"], "data_error");
        assert_eq!(json["error_description"], "data_error: bad request");
    }

    #[test]
    fn vcapi_json_shape() {
        let err = Error::NotAllowed("Exchange is complete".to_string());
        let json = err.to_vcapi_json();
        assert_eq!(json["name"], "not_allowed");
        assert_eq!(json["details"]["httpStatusCode"], 403);
    }

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(Error::NotFound(String::new()).status(), 404);
        assert_eq!(Error::DataError(String::new()).status(), 400);
        assert_eq!(Error::NotAllowed(String::new()).status(), 403);
        assert_eq!(Error::NotSupported(String::new()).status(), 400);
        assert_eq!(Error::InvalidState(String::new()).status(), 409);
        assert_eq!(Error::Duplicate(String::new()).status(), 409);
        assert_eq!(Error::Operation(String::new()).status(), 502);
        assert_eq!(Error::Timeout(String::new()).status(), 500);
    }
}
