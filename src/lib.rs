//! Authenticated transport core for TP-Link-style smart-home devices.
//!
//! Exposes the two session-oriented transports devices speak — **KLAP**
//! (two-phase challenge handshake, signed AES framing) and **AES**
//! (RSA-wrapped key exchange, `securePassthrough`) — behind a single SMART
//! request API (single calls, batched calls, child-device routing).
//!
//! This crate never reads configuration from the environment or disk and
//! never spawns its own runtime; callers drive it from their own tokio
//! runtime and own credential storage.

pub mod aes_transport;
pub mod cookies;
pub mod credentials;
pub mod crypto;
pub mod device;
pub mod error;
pub mod http;
pub mod klap;
pub mod queue;
pub mod smart;
pub mod transport;

pub use credentials::{Credentials, CredentialsHash, MergedCredentialView};
pub use device::{Device, DeviceConfig, DeviceState, TransportKind};
pub use error::{CoreError, Result};
pub use smart::SmartRequest;
pub use transport::Transport;
