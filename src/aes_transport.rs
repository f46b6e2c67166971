//! AES session engine (C3): RSA-wrapped key exchange, `login_device` token
//! acquisition, and the `securePassthrough` envelope (Tapo-class devices).

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;

use crate::cookies::{expires_at, parse_session_cookie, SessionCookie};
use crate::credentials::{login_candidates, LoginCandidate, MergedCredentialView};
use crate::crypto::{aes128_cbc_decrypt, aes128_cbc_encrypt, rsa_generate_1024, rsa_pkcs1_raw_decrypt};
use crate::error::{is_auth_error_code, CoreError, Result};
use crate::http::{HttpClient, PostOptions};
use crate::queue::DeviceQueue;
use crate::transport::Transport;

const APP_PATH: &str = "/app";

struct AesSession {
    key: [u8; 16],
    iv: [u8; 16],
    token: Option<String>,
    session_cookie: String,
    expires_at: std::time::Instant,
}

impl AesSession {
    fn is_live(&self) -> bool {
        std::time::Instant::now() < self.expires_at
    }
}

pub struct AesTransport {
    host: String,
    port: u16,
    timeout_ms: u64,
    credentials: MergedCredentialView,
    http: HttpClient,
    session: DeviceQueue<Option<AesSession>>,
}

fn now_millis() -> u128 {
    // Device firmwares tolerate an approximate timestamp; this value is
    // only used as an envelope field, never compared for correctness.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn request_path(token: Option<&str>) -> String {
    match token {
        Some(t) => format!("{APP_PATH}?token={t}"),
        None => APP_PATH.to_string(),
    }
}

fn top_level_error_code(value: &serde_json::Value) -> Result<i64> {
    value
        .get("error_code")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| CoreError::Protocol("missing error_code in aes response".into()))
}

impl AesTransport {
    pub fn new(host: impl Into<String>, port: u16, timeout_ms: u64, credentials: MergedCredentialView) -> Self {
        Self {
            host: host.into(),
            port,
            timeout_ms,
            credentials,
            http: HttpClient::new(),
            session: DeviceQueue::new(None),
        }
    }

    /// Plain HTTP round-trip: no locking here. The queue slot is already
    /// held by whichever caller is running the ensure-session-then-send
    /// critical section, so the session cookie comes in and any renewed
    /// cookie goes back out as plain values rather than through
    /// `self.session` (re-locking the same non-reentrant mutex from inside
    /// its own critical section would deadlock).
    async fn post_json(
        &self,
        token: Option<&str>,
        cookie: Option<&str>,
        body: serde_json::Value,
    ) -> Result<(serde_json::Value, Option<SessionCookie>)> {
        let bytes = serde_json::to_vec(&body)
            .map_err(|e| CoreError::Protocol(format!("failed to encode aes request: {e}")))?;
        let response = self
            .http
            .post(
                &self.host,
                self.port,
                &request_path(token),
                bytes,
                self.timeout_ms,
                PostOptions {
                    cookie: cookie.map(String::from),
                    content_type: Some("application/json"),
                    ..Default::default()
                },
            )
            .await?;

        if response.status == 403 {
            return Err(CoreError::Http {
                status: 403,
                detail: "aes request forbidden".into(),
            });
        }
        if response.status != 200 {
            return Err(CoreError::Http {
                status: response.status,
                detail: "aes request failed".into(),
            });
        }

        let json_value = serde_json::from_slice::<serde_json::Value>(&response.body)
            .map_err(|e| CoreError::Protocol(format!("aes response not json: {e}")))?;
        let cookie_headers = response
            .header_values("set-cookie")
            .map(String::from)
            .collect::<Vec<_>>();
        let cookie_update = if cookie_headers.is_empty() {
            None
        } else {
            parse_session_cookie(cookie_headers.iter().map(String::as_str), "TP_SESSIONID", Some("SESSIONID"))
        };

        Ok((json_value, cookie_update))
    }

    /// RSA handshake: generate a keypair, send the public key, decrypt the
    /// returned key material, split into key/iv.
    async fn handshake(&self) -> Result<AesSession> {
        tracing::debug!(host = %self.host, "aes handshake start");
        let (pub_pem, priv_pem) = rsa_generate_1024()?;

        let request_body = json!({
            "method": "handshake",
            "params": { "key": pub_pem },
        });
        let bytes = serde_json::to_vec(&request_body)
            .map_err(|e| CoreError::Protocol(format!("failed to encode handshake request: {e}")))?;

        let response = self
            .http
            .post(
                &self.host,
                self.port,
                APP_PATH,
                bytes,
                self.timeout_ms,
                PostOptions {
                    content_type: Some("application/json"),
                    headers: vec![
                        ("requestByApp".to_string(), "true".to_string()),
                        ("Accept".to_string(), "application/json".to_string()),
                    ],
                    ..Default::default()
                },
            )
            .await?;
        if response.status != 200 {
            return Err(CoreError::Http {
                status: response.status,
                detail: "aes handshake failed".into(),
            });
        }

        let body: serde_json::Value = serde_json::from_slice(&response.body)
            .map_err(|e| CoreError::Protocol(format!("handshake response not json: {e}")))?;
        let code = top_level_error_code(&body)?;
        if code != 0 {
            return Err(CoreError::smart(code, "handshake"));
        }
        let key_b64 = body
            .get("result")
            .and_then(|r| r.get("key"))
            .and_then(|k| k.as_str())
            .ok_or_else(|| CoreError::HandshakeInvalid("handshake result missing key".into()))?;
        let cipher = BASE64
            .decode(key_b64)
            .map_err(|e| CoreError::HandshakeInvalid(format!("handshake key not base64: {e}")))?;
        let raw = rsa_pkcs1_raw_decrypt(&priv_pem, &cipher)?;
        if raw.len() < 32 {
            return Err(CoreError::HandshakeInvalid(format!(
                "aes handshake key material too short: {} bytes",
                raw.len()
            )));
        }
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&raw[0..16]);
        iv.copy_from_slice(&raw[16..32]);

        let cookie_headers = response
            .header_values("set-cookie")
            .map(String::from)
            .collect::<Vec<_>>();
        let cookie = parse_session_cookie(cookie_headers.iter().map(String::as_str), "TP_SESSIONID", Some("SESSIONID"))
            .ok_or_else(|| CoreError::HandshakeInvalid("missing session cookie".into()))?;

        Ok(AesSession {
            key,
            iv,
            token: None,
            session_cookie: cookie.value,
            expires_at: expires_at(cookie.timeout_secs),
        })
    }

    fn encrypt_passthrough(session: &AesSession, plaintext: &str) -> String {
        let cipher = aes128_cbc_encrypt(&session.key, &session.iv, plaintext.as_bytes());
        BASE64.encode(cipher)
    }

    /// Decrypt a `securePassthrough` response. Falls back to parsing the
    /// raw string as JSON directly when decryption or JSON parsing fails,
    /// tolerating mixed-mode error frames some firmwares emit unencrypted.
    fn decrypt_passthrough(session: &AesSession, response_str: &str) -> Result<serde_json::Value> {
        let attempt = (|| -> Result<serde_json::Value> {
            let cipher = BASE64
                .decode(response_str)
                .map_err(|e| CoreError::Protocol(format!("passthrough response not base64: {e}")))?;
            let plain = aes128_cbc_decrypt(&session.key, &session.iv, &cipher)?;
            let text = String::from_utf8(plain)
                .map_err(|e| CoreError::Protocol(format!("passthrough plaintext not utf-8: {e}")))?;
            serde_json::from_str(&text)
                .map_err(|e| CoreError::Protocol(format!("passthrough plaintext not json: {e}")))
        })();

        attempt.or_else(|_| {
            serde_json::from_str(response_str)
                .map_err(|e| CoreError::Protocol(format!("passthrough fallback parse failed: {e}")))
        })
    }

    async fn secure_passthrough(&self, session: &mut AesSession, inner: serde_json::Value) -> Result<serde_json::Value> {
        let inner_str = serde_json::to_string(&inner)
            .map_err(|e| CoreError::Protocol(format!("failed to encode passthrough inner: {e}")))?;
        let request_b64 = Self::encrypt_passthrough(session, &inner_str);
        let envelope = json!({
            "method": "securePassthrough",
            "params": { "request": request_b64 },
        });

        let cookie = format!("TP_SESSIONID={}", session.session_cookie);
        let (response, cookie_update) = self
            .post_json(session.token.as_deref(), Some(&cookie), envelope)
            .await?;
        if let Some(parsed) = cookie_update {
            session.session_cookie = parsed.value;
            session.expires_at = expires_at(parsed.timeout_secs);
        }
        let code = top_level_error_code(&response)?;
        if code != 0 {
            return Err(CoreError::smart(code, "securePassthrough"));
        }
        let inner_response = response
            .get("result")
            .and_then(|r| r.get("response"))
            .and_then(|r| r.as_str())
            .ok_or_else(|| CoreError::Protocol("passthrough result missing response string".into()))?;
        Self::decrypt_passthrough(session, inner_response)
    }

    async fn login(&self, session: &mut AesSession) -> Result<()> {
        let candidates = login_candidates(&self.credentials)?;
        let mut last_err = None;

        for candidate in &candidates {
            match self.try_login_candidate(session, candidate).await {
                Ok(token) => {
                    session.token = Some(token);
                    tracing::debug!(label = candidate.label, "aes login succeeded");
                    return Ok(());
                }
                Err(CoreError::Smart { code, method, .. }) if is_auth_error_code(code) => {
                    tracing::warn!(label = candidate.label, code, "aes login candidate rejected, resetting and retrying next");
                    *session = self.handshake().await?;
                    last_err = Some(CoreError::smart(code, method));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            CoreError::AuthenticationFailed("aes login candidates exhausted".into())
        }))
    }

    async fn try_login_candidate(&self, session: &mut AesSession, candidate: &LoginCandidate) -> Result<String> {
        let inner = json!({
            "method": "login_device",
            "params": candidate.params,
            "request_time_milis": now_millis() as u64,
        });
        let result = self.secure_passthrough(session, inner).await?;
        result
            .get("result")
            .and_then(|r| r.get("token"))
            .and_then(|t| t.as_str())
            .map(String::from)
            .ok_or_else(|| CoreError::Protocol("login_device result missing token".into()))
    }

    async fn send_once(&self, session: &mut AesSession, payload: &str) -> Result<serde_json::Value> {
        let inner: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| CoreError::Protocol(format!("aes send payload not json: {e}")))?;
        self.secure_passthrough(session, inner).await
    }
}

#[async_trait]
impl Transport for AesTransport {
    async fn send(&self, payload: &str) -> Result<String> {
        let mut guard = self.session.lock().await;

        if guard.as_ref().map_or(true, |s| !s.is_live() || s.token.is_none()) {
            let mut session = self.handshake().await?;
            self.login(&mut session).await?;
            *guard = Some(session);
        }

        let session = guard.as_mut().expect("just ensured present");
        let needs_reset = |err: &CoreError| match err {
            CoreError::Http { status: 403, .. } => true,
            CoreError::Smart { code, .. } => is_auth_error_code(*code),
            _ => false,
        };
        match self.send_once(session, payload).await {
            Ok(value) => Ok(value.to_string()),
            Err(e) if needs_reset(&e) => {
                tracing::warn!(host = %self.host, "aes request failed auth check, resetting and retrying once");
                let mut session = self.handshake().await?;
                self.login(&mut session).await?;
                let value = self.send_once(&mut session, payload).await?;
                *guard = Some(session);
                Ok(value.to_string())
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self) {
        let mut guard = self.session.lock().await;
        *guard = None;
    }
}
