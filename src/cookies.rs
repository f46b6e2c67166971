//! `Set-Cookie` parsing shared by the KLAP and AES transports.
//!
//! Both transports need exactly two cookie fields out of a device's
//! response: the opaque session id (`TP_SESSIONID`, with `SESSIONID` as an
//! AES-transport fallback) and a `TIMEOUT` in seconds used to compute when
//! the session should be proactively renewed.

use std::time::{Duration, Instant};

/// Sessions are renewed this many seconds before the server-reported
/// timeout actually elapses (spec §3 invariant: `expiresAt` strictly less
/// than the server-reported timeout).
pub const EXPIRY_GUARD_BUFFER_SECS: u64 = 1200;

/// Default timeout (seconds) used when the `TIMEOUT` cookie is absent or
/// not a valid number.
pub const DEFAULT_TIMEOUT_SECS: u64 = 86400;

/// A parsed session cookie plus the timeout the server advertised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    pub value: String,
    pub timeout_secs: u64,
}

/// Parse cookie headers looking for `session_key` (falling back to
/// `fallback_key` if provided) and a `TIMEOUT` attribute. Header values are
/// expected in the raw `Set-Cookie: NAME=VALUE; ...` shape; multiple
/// `Set-Cookie` headers are scanned independently since each cookie is its
/// own header line.
pub fn parse_session_cookie<'a, I>(headers: I, session_key: &str, fallback_key: Option<&str>) -> Option<SessionCookie>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut value = None;
    let mut timeout_secs = None;

    for header in headers {
        for part in header.split(';') {
            let part = part.trim();
            let Some((name, raw_value)) = part.split_once('=') else {
                continue;
            };
            let name = name.trim();
            let raw_value = raw_value.trim();

            if name.eq_ignore_ascii_case(session_key)
                || fallback_key.is_some_and(|k| name.eq_ignore_ascii_case(k))
            {
                value = Some(raw_value.to_string());
            } else if name.eq_ignore_ascii_case("TIMEOUT") {
                timeout_secs = raw_value.parse::<u64>().ok();
            }
        }
    }

    value.map(|value| SessionCookie {
        value,
        timeout_secs: timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
    })
}

/// Compute the absolute expiry instant from a server-reported timeout,
/// applying the guard buffer so the client always renews proactively.
pub fn expires_at(timeout_secs: u64) -> Instant {
    let guarded = timeout_secs.saturating_sub(EXPIRY_GUARD_BUFFER_SECS).max(1);
    Instant::now() + Duration::from_secs(guarded)
}
