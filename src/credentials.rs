//! Credential types, authentication-candidate derivation, and structural
//! redaction.
//!
//! Redaction here is a property of the type, not of a call site: `Debug`
//! and `Display` for [`Credentials`] and [`CredentialsHash`] always elide
//! the secret, so a stray `tracing::debug!("{:?}", creds)` can never leak
//! one.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::{md5, sha1, sha256};
use crate::error::{CoreError, Result};

/// Candidate username/password used by well-known fallback accounts
/// (the KASA cloud setup account and the TAPO setup account). Real device
/// firmwares fall back to these when no caller-supplied credential
/// matches, so clients must try them too.
const KASA_DEFAULT_USERNAME: &str = "kasa@tp-link.net";
const KASA_DEFAULT_PASSWORD: &str = "kasaSetup";
const TAPO_DEFAULT_USERNAME: &str = "tapo@tp-link.net";
const TAPO_DEFAULT_PASSWORD: &str = "tapoSetup";

/// A plaintext username/password pair. `Debug`/`Display` never render the
/// password.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let username = username.into();
        let password = password.into();
        if username.is_empty() || password.is_empty() {
            return Err(CoreError::InvalidCredentials(
                "username and password must be non-empty".into(),
            ));
        }
        Ok(Self { username, password })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:[REDACTED]", self.username)
    }
}

/// An opaque pre-derived credential hash: base64 of a raw auth digest for
/// KLAP, or base64 of a JSON `{username, password|password2}` object for
/// AES. Never rendered in full.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialsHash(String);

impl CredentialsHash {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(CoreError::InvalidCredentials(
                "credentialsHash must be non-empty".into(),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode as a raw KLAP auth-hash digest (16 or 32 bytes).
    pub fn decode_raw(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.0)
            .map_err(|e| CoreError::InvalidCredentials(format!("credentialsHash not base64: {e}")))
    }

    /// Decode as the AES login JSON object `{username, password|password2}`.
    pub fn decode_login_params(&self) -> Result<serde_json::Value> {
        let raw = self.decode_raw()?;
        let text = String::from_utf8(raw)
            .map_err(|e| CoreError::InvalidCredentials(format!("credentialsHash not utf-8: {e}")))?;
        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| CoreError::InvalidCredentials(format!("credentialsHash not json: {e}")))?;
        let obj = value.as_object().ok_or_else(|| {
            CoreError::InvalidCredentials("credentialsHash json must be an object".into())
        })?;
        if !obj.contains_key("username") {
            return Err(CoreError::InvalidCredentials(
                "credentialsHash missing username".into(),
            ));
        }
        if !obj.contains_key("password") && !obj.contains_key("password2") {
            return Err(CoreError::InvalidCredentials(
                "credentialsHash missing password or password2".into(),
            ));
        }
        Ok(value)
    }
}

impl fmt::Debug for CredentialsHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CredentialsHash").field(&"[REDACTED]").finish()
    }
}

impl fmt::Display for CredentialsHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// The resolved, per-device credential view: device-level overrides win
/// over client-wide defaults. Carries its own redaction the same way the
/// pieces it's built from do.
#[derive(Clone)]
pub struct MergedCredentialView {
    pub credentials: Option<Credentials>,
    pub credentials_hash: Option<CredentialsHash>,
}

impl MergedCredentialView {
    pub fn merge(
        device_credentials: Option<Credentials>,
        device_hash: Option<CredentialsHash>,
        default_credentials: Option<Credentials>,
        default_hash: Option<CredentialsHash>,
    ) -> Result<Self> {
        let credentials = device_credentials.or(default_credentials);
        let credentials_hash = device_hash.or(default_hash);
        if credentials.is_none() && credentials_hash.is_none() {
            return Err(CoreError::InvalidCredentials(
                "no credentials or credentialsHash supplied".into(),
            ));
        }
        Ok(Self {
            credentials,
            credentials_hash,
        })
    }
}

impl fmt::Debug for MergedCredentialView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedCredentialView")
            .field("credentials", &self.credentials)
            .field("credentials_hash", &self.credentials_hash)
            .finish()
    }
}

/// KLAP candidate auth-hash version; determines which challenge formula is
/// used, not the shape of the hash bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashVersion {
    V1,
    V2,
}

/// A single KLAP authentication candidate.
#[derive(Clone)]
pub struct AuthCandidate {
    pub label: &'static str,
    pub version: HashVersion,
    pub auth_hash: Vec<u8>,
}

impl fmt::Debug for AuthCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCandidate")
            .field("label", &self.label)
            .field("version", &self.version)
            .finish()
    }
}

pub fn auth_hash_v1(username: &str, password: &str) -> [u8; 16] {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(&md5(username.as_bytes()));
    buf.extend_from_slice(&md5(password.as_bytes()));
    md5(&buf)
}

pub fn auth_hash_v2(username: &str, password: &str) -> [u8; 32] {
    let mut buf = Vec::with_capacity(40);
    buf.extend_from_slice(&sha1(username.as_bytes()));
    buf.extend_from_slice(&sha1(password.as_bytes()));
    sha256(&buf)
}

/// Build the ordered, deduplicated KLAP candidate list: user hash, user
/// credentials, KASA defaults, TAPO defaults, blank — each contributing a
/// v2 candidate then a v1 candidate.
pub fn klap_candidates(view: &MergedCredentialView) -> Result<Vec<AuthCandidate>> {
    let mut candidates = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let mut push = |label: &'static str, version: HashVersion, auth_hash: Vec<u8>| {
        let key = (version, auth_hash.clone());
        if seen.insert(key) {
            candidates.push(AuthCandidate {
                label,
                version,
                auth_hash,
            });
        }
    };

    if let Some(hash) = &view.credentials_hash {
        let raw = hash.decode_raw()?;
        push("user-hash", HashVersion::V2, raw.clone());
        push("user-hash", HashVersion::V1, raw);
    }

    if let Some(creds) = &view.credentials {
        push(
            "user-credentials",
            HashVersion::V2,
            auth_hash_v2(&creds.username, &creds.password).to_vec(),
        );
        push(
            "user-credentials",
            HashVersion::V1,
            auth_hash_v1(&creds.username, &creds.password).to_vec(),
        );
    }

    push(
        "kasa-default",
        HashVersion::V2,
        auth_hash_v2(KASA_DEFAULT_USERNAME, KASA_DEFAULT_PASSWORD).to_vec(),
    );
    push(
        "kasa-default",
        HashVersion::V1,
        auth_hash_v1(KASA_DEFAULT_USERNAME, KASA_DEFAULT_PASSWORD).to_vec(),
    );

    push(
        "tapo-default",
        HashVersion::V2,
        auth_hash_v2(TAPO_DEFAULT_USERNAME, TAPO_DEFAULT_PASSWORD).to_vec(),
    );
    push(
        "tapo-default",
        HashVersion::V1,
        auth_hash_v1(TAPO_DEFAULT_USERNAME, TAPO_DEFAULT_PASSWORD).to_vec(),
    );

    push("blank", HashVersion::V2, auth_hash_v2("", "").to_vec());
    push("blank", HashVersion::V1, auth_hash_v1("", "").to_vec());

    Ok(candidates)
}

/// A single AES `login_device` candidate.
#[derive(Clone)]
pub struct LoginCandidate {
    pub label: &'static str,
    pub params: serde_json::Value,
}

impl fmt::Debug for LoginCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCandidate")
            .field("label", &self.label)
            .field("params", &"[REDACTED]")
            .finish()
    }
}

fn aes_username(username: &str) -> String {
    BASE64.encode(hex::encode(sha1(username.as_bytes())))
}

fn aes_password_v2(password: &str) -> String {
    BASE64.encode(hex::encode(sha1(password.as_bytes())))
}

fn aes_password_v1(password: &str) -> String {
    BASE64.encode(password)
}

/// Build the ordered AES login-candidate list: explicit credentialsHash,
/// user credentials v2/v1, default-TAPO v2/v1.
pub fn login_candidates(view: &MergedCredentialView) -> Result<Vec<LoginCandidate>> {
    let mut candidates = Vec::new();

    if let Some(hash) = &view.credentials_hash {
        candidates.push(LoginCandidate {
            label: "credentials-hash",
            params: hash.decode_login_params()?,
        });
    }

    if let Some(creds) = &view.credentials {
        candidates.push(LoginCandidate {
            label: "user-credentials-v2",
            params: serde_json::json!({
                "username": aes_username(&creds.username),
                "password2": aes_password_v2(&creds.password),
            }),
        });
        candidates.push(LoginCandidate {
            label: "user-credentials-v1",
            params: serde_json::json!({
                "username": aes_username(&creds.username),
                "password": aes_password_v1(&creds.password),
            }),
        });
    }

    candidates.push(LoginCandidate {
        label: "tapo-default-v2",
        params: serde_json::json!({
            "username": aes_username(TAPO_DEFAULT_USERNAME),
            "password2": aes_password_v2(TAPO_DEFAULT_PASSWORD),
        }),
    });
    candidates.push(LoginCandidate {
        label: "tapo-default-v1",
        params: serde_json::json!({
            "username": aes_username(TAPO_DEFAULT_USERNAME),
            "password": aes_password_v1(TAPO_DEFAULT_PASSWORD),
        }),
    });

    Ok(candidates)
}

/// Process-scoped random terminal identifier, stable for a device's
/// lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalUuid(String);

impl TerminalUuid {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(BASE64.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_username_or_password() {
        assert!(Credentials::new("", "pw").is_err());
        assert!(Credentials::new("user", "").is_err());
    }

    #[test]
    fn debug_and_display_never_render_password() {
        let creds = Credentials::new("user@example.com", "hunter2").unwrap();
        assert!(!format!("{creds:?}").contains("hunter2"));
        assert!(!format!("{creds}").contains("hunter2"));
    }

    #[test]
    fn credentials_hash_rejects_empty() {
        assert!(CredentialsHash::new("").is_err());
    }

    #[test]
    fn credentials_hash_debug_never_renders_value() {
        let hash = CredentialsHash::new("c29tZS1oYXNo").unwrap();
        assert!(!format!("{hash:?}").contains("c29tZS1oYXNo"));
    }

    #[test]
    fn klap_candidates_are_ordered_and_deduplicated() {
        let creds = Credentials::new("user@example.com", "secret").unwrap();
        let view = MergedCredentialView::merge(Some(creds), None, None, None).unwrap();
        let candidates = klap_candidates(&view).unwrap();

        // user-credentials v2, v1, then kasa v2/v1, tapo v2/v1, blank v2/v1 = 8
        assert_eq!(candidates.len(), 8);
        assert_eq!(candidates[0].label, "user-credentials");
        assert_eq!(candidates[0].version, HashVersion::V2);
        assert_eq!(candidates[1].label, "user-credentials");
        assert_eq!(candidates[1].version, HashVersion::V1);

        let mut seen = std::collections::HashSet::new();
        for c in &candidates {
            assert!(seen.insert((c.version, c.auth_hash.clone())));
        }
    }

    #[test]
    fn klap_user_hash_takes_precedence_position() {
        let raw = base64::engine::general_purpose::STANDARD.encode([1u8; 32]);
        let hash = CredentialsHash::new(raw).unwrap();
        let view = MergedCredentialView::merge(None, Some(hash), None, None).unwrap();
        let candidates = klap_candidates(&view).unwrap();
        assert_eq!(candidates[0].label, "user-hash");
        assert_eq!(candidates[1].label, "user-hash");
    }

    #[test]
    fn login_candidates_order_for_user_credentials() {
        let creds = Credentials::new("user@example.com", "secret").unwrap();
        let view = MergedCredentialView::merge(Some(creds), None, None, None).unwrap();
        let candidates = login_candidates(&view).unwrap();
        assert_eq!(
            candidates.iter().map(|c| c.label).collect::<Vec<_>>(),
            vec![
                "user-credentials-v2",
                "user-credentials-v1",
                "tapo-default-v2",
                "tapo-default-v1",
            ]
        );
    }

    #[test]
    fn login_candidates_credentials_hash_takes_priority_position() {
        let obj = serde_json::json!({"username": "dQ==", "password2": "cA=="});
        let raw = base64::engine::general_purpose::STANDARD.encode(obj.to_string());
        let hash = CredentialsHash::new(raw).unwrap();
        let view = MergedCredentialView::merge(None, Some(hash), None, None).unwrap();
        let candidates = login_candidates(&view).unwrap();
        assert_eq!(candidates[0].label, "credentials-hash");
        assert_eq!(candidates[0].params["username"], "dQ==");
    }

    #[test]
    fn merge_prefers_device_level_over_defaults() {
        let device_creds = Credentials::new("device-user", "device-pass").unwrap();
        let default_creds = Credentials::new("default-user", "default-pass").unwrap();
        let view =
            MergedCredentialView::merge(Some(device_creds), None, Some(default_creds), None)
                .unwrap();
        assert_eq!(view.credentials.unwrap().username, "device-user");
    }

    #[test]
    fn terminal_uuid_is_stable_once_generated() {
        let uuid = TerminalUuid::generate();
        assert_eq!(uuid.as_str(), uuid.as_str());
        assert!(!uuid.as_str().is_empty());
    }
}
