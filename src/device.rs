//! The façade wiring the session engines (C2/C3), HTTP mechanics (C4), and
//! SMART envelope layer (C5) into one per-device handle.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use serde_json::Value;

use crate::aes_transport::AesTransport;
use crate::credentials::{Credentials, CredentialsHash, MergedCredentialView, TerminalUuid};
use crate::error::{CoreError, Result};
use crate::klap::KlapTransport;
use crate::smart::{self, SmartRequest};
use crate::transport::Transport;

/// Which session engine a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Klap,
    Aes,
}

/// The flattened configuration a caller builds once per device.
#[derive(Clone)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub timeout_ms: u64,
    pub credentials: Option<Credentials>,
    pub credentials_hash: Option<String>,
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(CoreError::InvalidCredentials("timeout_ms must be > 0".into()));
        }
        if self.credentials.is_none() && self.credentials_hash.is_none() {
            return Err(CoreError::InvalidCredentials(
                "at least one of credentials or credentials_hash is required".into(),
            ));
        }
        if let Some(hash) = &self.credentials_hash {
            if hash.is_empty() {
                return Err(CoreError::InvalidCredentials("credentials_hash must be non-empty".into()));
            }
        }
        if let Some(creds) = &self.credentials {
            if creds.username.is_empty() || creds.password.is_empty() {
                return Err(CoreError::InvalidCredentials(
                    "credentials username and password must be non-empty".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Coarse observability state mirroring the per-device session state
/// machine; the transports own the actual retry/reset logic, this just
/// reflects it for logging and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Ensuring,
    Ready,
    Error,
}

pub struct Device {
    host: String,
    port: u16,
    transport: Box<dyn Transport>,
    terminal_uuid: TerminalUuid,
    state: StdMutex<DeviceState>,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        config.validate()?;

        let credentials_hash = config
            .credentials_hash
            .as_ref()
            .map(|h| CredentialsHash::new(h.clone()))
            .transpose()?;
        let view = MergedCredentialView::merge(config.credentials.clone(), credentials_hash, None, None)?;

        let transport: Box<dyn Transport> = match config.transport {
            TransportKind::Klap => Box::new(KlapTransport::new(
                config.host.clone(),
                config.port,
                config.timeout_ms,
                view,
            )),
            TransportKind::Aes => Box::new(AesTransport::new(
                config.host.clone(),
                config.port,
                config.timeout_ms,
                view,
            )),
        };

        Ok(Self {
            host: config.host,
            port: config.port,
            transport,
            terminal_uuid: TerminalUuid::generate(),
            state: StdMutex::new(DeviceState::Idle),
        })
    }

    fn set_state(&self, state: DeviceState) {
        *self.state.lock().expect("device state mutex poisoned") = state;
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock().expect("device state mutex poisoned")
    }

    async fn roundtrip(&self, envelope: Value) -> Result<Value> {
        self.set_state(DeviceState::Ensuring);
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| CoreError::Protocol(format!("failed to encode smart envelope: {e}")))?;

        let result = self.transport.send(&payload).await;
        match &result {
            Ok(_) => self.set_state(DeviceState::Ready),
            Err(CoreError::AuthenticationFailed(_)) => self.set_state(DeviceState::Error),
            Err(_) => self.set_state(DeviceState::Idle),
        }
        let response_str = result?;
        serde_json::from_str(&response_str)
            .map_err(|e| CoreError::Protocol(format!("smart response not json: {e}")))
    }

    /// Send a single SMART method, optionally wrapped as `control_child`
    /// for `child_id`.
    pub async fn send_smart_command(
        &self,
        method: &str,
        params: Option<Value>,
        child_id: Option<&str>,
    ) -> Result<Value> {
        tracing::debug!(host = %self.host, port = self.port, method, "send_smart_command");
        let request = SmartRequest::new(method, params);
        let envelope = smart::build_single_request(&request, child_id, &self.terminal_uuid);
        let response = self.roundtrip(envelope).await?;
        smart::unwrap_single_response(&response, method, child_id)
    }

    /// Send a `multipleRequest` batch, returning a `method -> result` map.
    pub async fn send_smart_requests(
        &self,
        requests: &[SmartRequest],
    ) -> Result<HashMap<String, Value>> {
        tracing::debug!(host = %self.host, port = self.port, count = requests.len(), "send_smart_requests");
        let envelope = smart::build_batch_request(requests, &self.terminal_uuid);
        let response = self.roundtrip(envelope).await?;
        smart::unwrap_batch_response(&response)
    }

    /// Reset session state. Idempotent, never fails.
    pub async fn close(&self) {
        self.transport.close().await;
        self.set_state(DeviceState::Idle);
    }
}
