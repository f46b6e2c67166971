//! Crate-wide error type and the taxonomy it realizes.

use std::fmt;

/// Errors returned by the session transport core.
#[derive(Debug)]
pub enum CoreError {
    /// Credentials or `DeviceConfig` failed validation before any network
    /// activity occurred.
    InvalidCredentials(String),
    /// KLAP candidate list, or AES login-candidate list, was exhausted
    /// without a match.
    AuthenticationFailed(String),
    /// Handshake response was malformed (wrong size, bad PKCS#1 padding,
    /// missing key material).
    HandshakeInvalid(String),
    /// Wire-format violation: bad JSON, missing fields, short ciphertext.
    Protocol(String),
    /// HTTP deadline elapsed.
    Timeout,
    /// Non-200 status outside the recoverable 403 cases.
    Http { status: u16, detail: String },
    /// Non-zero `error_code` in a SMART envelope (including a per-entry
    /// batch failure). `request_json`/`response_json` carry the raw
    /// envelope bodies for callers that want to log them (already redacted
    /// at the credential layer, never containing secrets).
    Smart {
        code: i64,
        method: String,
        request_json: Option<String>,
        response_json: Option<String>,
    },
    /// Socket/TLS-level failure underneath the HTTP layer.
    Transport(String),
    /// More than one `childId` supplied to a single SMART call.
    InvalidArgument(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::InvalidCredentials(msg) => write!(f, "invalid credentials: {msg}"),
            CoreError::AuthenticationFailed(msg) => write!(f, "authentication failed: {msg}"),
            CoreError::HandshakeInvalid(msg) => write!(f, "invalid handshake: {msg}"),
            CoreError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            CoreError::Timeout => write!(f, "request timed out"),
            CoreError::Http { status, detail } => write!(f, "http error {status}: {detail}"),
            CoreError::Smart { code, method, .. } => {
                write!(f, "smart error {code} from method '{method}'")
            }
            CoreError::Transport(msg) => write!(f, "transport error: {msg}"),
            CoreError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// AES-transport inner error codes that classify as an authentication
/// failure and trigger a session reset + one retry (spec §4.3, §6).
pub const AES_AUTH_ERROR_CODES: [i64; 6] = [-1501, 1111, -1005, 1100, 1003, -40412];

/// `true` when a SMART inner `error_code` should be treated as an
/// authentication failure rather than a generic protocol error.
pub fn is_auth_error_code(code: i64) -> bool {
    AES_AUTH_ERROR_CODES.contains(&code)
}

impl CoreError {
    /// Build a `Smart` error with no raw envelope context attached.
    pub fn smart(code: i64, method: impl Into<String>) -> Self {
        CoreError::Smart {
            code,
            method: method.into(),
            request_json: None,
            response_json: None,
        }
    }

    /// Build a `Smart` error carrying the raw request/response envelopes,
    /// for boundary-level diagnostics.
    pub fn smart_with_context(
        code: i64,
        method: impl Into<String>,
        request_json: impl Into<String>,
        response_json: impl Into<String>,
    ) -> Self {
        CoreError::Smart {
            code,
            method: method.into(),
            request_json: Some(request_json.into()),
            response_json: Some(response_json.into()),
        }
    }
}
