//! The shared capability both session engines implement.
//!
//! KLAP and AES diverge in framing and handshake shape but share session
//! lifecycle and queuing; rather than modeling that as inheritance, both
//! are concrete implementations of this one trait and the queue/redaction/
//! retry-once policy is shared by composition in [`crate::device`].

use async_trait::async_trait;

use crate::error::Result;

/// A session-oriented transport: send an already-framed SMART payload and
/// get back the decrypted/parsed inner plaintext, or drop the session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ensure a live session exists, send `payload`, and return the inner
    /// plaintext (KLAP) or stringified parsed JSON (AES). Handles the
    /// transport's own retry-once-after-reset policy internally.
    async fn send(&self, payload: &str) -> Result<String>;

    /// Reset session state synchronously. Idempotent, never fails.
    async fn close(&self);
}
