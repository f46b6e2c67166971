//! KLAP session engine (C2): two-phase challenge handshake, candidate
//! selection, and sequence-numbered signed AES-128-CBC framing.

use async_trait::async_trait;
use rand::RngCore;

use crate::cookies::{expires_at, parse_session_cookie};
use crate::credentials::{klap_candidates, AuthCandidate, HashVersion, MergedCredentialView};
use crate::crypto::{aes128_cbc_decrypt, aes128_cbc_encrypt, sha256};
use crate::error::{CoreError, Result};
use crate::http::{HttpClient, PostOptions};
use crate::queue::DeviceQueue;
use crate::transport::Transport;

const HANDSHAKE1_PATH: &str = "/app/handshake1";
const HANDSHAKE2_PATH: &str = "/app/handshake2";
const REQUEST_PATH: &str = "/app/request";

/// Live KLAP session state, held after a successful two-phase handshake.
struct KlapSession {
    key: [u8; 16],
    iv_prefix: [u8; 12],
    sig_prefix: [u8; 28],
    sequence: i32,
    session_cookie: String,
    expires_at: std::time::Instant,
}

impl KlapSession {
    fn is_live(&self) -> bool {
        std::time::Instant::now() < self.expires_at
    }
}

pub struct KlapTransport {
    host: String,
    port: u16,
    timeout_ms: u64,
    credentials: MergedCredentialView,
    http: HttpClient,
    session: DeviceQueue<Option<KlapSession>>,
}

impl KlapTransport {
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

    fn challenge(version: HashVersion, local_seed: &[u8], remote_seed: &[u8], auth_hash: &[u8]) -> [u8; 32] {
        let mut buf = Vec::new();
        match version {
            HashVersion::V2 => {
                buf.extend_from_slice(local_seed);
                buf.extend_from_slice(remote_seed);
                buf.extend_from_slice(auth_hash);
            }
            HashVersion::V1 => {
                buf.extend_from_slice(local_seed);
                buf.extend_from_slice(auth_hash);
            }
        }
        sha256(&buf)
    }

    fn handshake2_body(version: HashVersion, local_seed: &[u8], remote_seed: &[u8], auth_hash: &[u8]) -> [u8; 32] {
        let mut buf = Vec::new();
        match version {
            HashVersion::V2 => {
                buf.extend_from_slice(remote_seed);
                buf.extend_from_slice(local_seed);
                buf.extend_from_slice(auth_hash);
            }
            HashVersion::V1 => {
                buf.extend_from_slice(remote_seed);
                buf.extend_from_slice(auth_hash);
            }
        }
        sha256(&buf)
    }

    fn select_candidate(local_seed: &[u8], remote_seed: &[u8], server_hash: &[u8], candidates: &[AuthCandidate]) -> Option<AuthCandidate> {
        candidates.iter().find_map(|candidate| {
            let computed = Self::challenge(candidate.version, local_seed, remote_seed, &candidate.auth_hash);
            (computed == server_hash).then(|| candidate.clone())
        })
    }

    /// Perform handshake-1 and handshake-2, deriving and installing a fresh
    /// session.
    async fn handshake(&self) -> Result<KlapSession> {
        let mut local_seed = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut local_seed);

        tracing::debug!(host = %self.host, port = self.port, "klap handshake1 start");
        let response = self
            .http
            .post(
                &self.host,
                self.port,
                HANDSHAKE1_PATH,
                local_seed.to_vec(),
                self.timeout_ms,
                PostOptions::default(),
            )
            .await?;

        if response.status != 200 {
            return Err(CoreError::Http {
                status: response.status,
                detail: "handshake1 failed".into(),
            });
        }
        if response.body.len() != 48 {
            return Err(CoreError::HandshakeInvalid(format!(
                "handshake1 response expected 48 bytes, got {}",
                response.body.len()
            )));
        }
        let remote_seed = &response.body[0..16];
        let server_hash = &response.body[16..48];
        let handshake1_cookie = response
            .header_values("set-cookie")
            .map(String::from)
            .collect::<Vec<_>>();

        let candidates = klap_candidates(&self.credentials)?;
        let matched = Self::select_candidate(&local_seed, remote_seed, server_hash, &candidates)
            .ok_or_else(|| CoreError::AuthenticationFailed("klap candidates exhausted".into()))?;
        tracing::debug!(label = matched.label, "klap candidate matched");

        let handshake1_cookie_value = parse_session_cookie(
            handshake1_cookie.iter().map(String::as_str),
            "TP_SESSIONID",
            None,
        )
        .ok_or_else(|| CoreError::HandshakeInvalid("missing TP_SESSIONID cookie".into()))?;

        let body2 = Self::handshake2_body(matched.version, &local_seed, remote_seed, &matched.auth_hash);
        let response2 = self
            .http
            .post(
                &self.host,
                self.port,
                HANDSHAKE2_PATH,
                body2.to_vec(),
                self.timeout_ms,
                PostOptions {
                    cookie: Some(format!("TP_SESSIONID={}", handshake1_cookie_value.value)),
                    ..Default::default()
                },
            )
            .await?;
        if response2.status != 200 {
            return Err(CoreError::Http {
                status: response2.status,
                detail: "handshake2 failed".into(),
            });
        }

        let cookie = response2
            .header_values("set-cookie")
            .map(String::from)
            .collect::<Vec<_>>();
        let cookie = parse_session_cookie(cookie.iter().map(String::as_str), "TP_SESSIONID", None)
            .unwrap_or(handshake1_cookie_value);

        let key_material = {
            let mut buf = Vec::new();
            buf.extend_from_slice(b"lsk");
            buf.extend_from_slice(&local_seed);
            buf.extend_from_slice(remote_seed);
            buf.extend_from_slice(&matched.auth_hash);
            sha256(&buf)
        };
        let mut key = [0u8; 16];
        key.copy_from_slice(&key_material[0..16]);

        let full_iv = {
            let mut buf = Vec::new();
            buf.extend_from_slice(b"iv");
            buf.extend_from_slice(&local_seed);
            buf.extend_from_slice(remote_seed);
            buf.extend_from_slice(&matched.auth_hash);
            sha256(&buf)
        };
        let mut iv_prefix = [0u8; 12];
        iv_prefix.copy_from_slice(&full_iv[0..12]);
        let initial_seq = i32::from_be_bytes(full_iv[28..32].try_into().unwrap());

        let sig_material = {
            let mut buf = Vec::new();
            buf.extend_from_slice(b"ldk");
            buf.extend_from_slice(&local_seed);
            buf.extend_from_slice(remote_seed);
            buf.extend_from_slice(&matched.auth_hash);
            sha256(&buf)
        };
        let mut sig_prefix = [0u8; 28];
        sig_prefix.copy_from_slice(&sig_material[0..28]);

        Ok(KlapSession {
            key,
            iv_prefix,
            sig_prefix,
            sequence: initial_seq,
            session_cookie: cookie.value,
            expires_at: expires_at(cookie.timeout_secs),
        })
    }

    fn frame_request(session: &KlapSession, plaintext: &str) -> (i32, Vec<u8>) {
        let next_seq = session.sequence.wrapping_add(1);
        let mut iv = [0u8; 16];
        iv[0..12].copy_from_slice(&session.iv_prefix);
        iv[12..16].copy_from_slice(&next_seq.to_be_bytes());

        let cipher = aes128_cbc_encrypt(&session.key, &iv, plaintext.as_bytes());

        let mut sig_input = Vec::with_capacity(28 + 4 + cipher.len());
        sig_input.extend_from_slice(&session.sig_prefix);
        sig_input.extend_from_slice(&next_seq.to_be_bytes());
        sig_input.extend_from_slice(&cipher);
        let sig = sha256(&sig_input);

        let mut body = Vec::with_capacity(32 + cipher.len());
        body.extend_from_slice(&sig);
        body.extend_from_slice(&cipher);
        (next_seq, body)
    }

    fn unframe_response(session: &KlapSession, seq: i32, body: &[u8]) -> Result<String> {
        if body.len() < 32 {
            return Err(CoreError::Protocol(format!(
                "klap response too short: {} bytes",
                body.len()
            )));
        }
        let mut iv = [0u8; 16];
        iv[0..12].copy_from_slice(&session.iv_prefix);
        iv[12..16].copy_from_slice(&seq.to_be_bytes());
        let plain = aes128_cbc_decrypt(&session.key, &iv, &body[32..])?;
        String::from_utf8(plain).map_err(|e| CoreError::Protocol(format!("klap response not utf-8: {e}")))
    }

    async fn send_once(&self, session: &mut KlapSession, payload: &str) -> Result<(u16, Option<String>)> {
        let (seq, body) = Self::frame_request(session, payload);
        let response = self
            .http
            .post(
                &self.host,
                self.port,
                REQUEST_PATH,
                body,
                self.timeout_ms,
                PostOptions {
                    query: vec![("seq".into(), seq.to_string())],
                    cookie: Some(format!("TP_SESSIONID={}", session.session_cookie)),
                    ..Default::default()
                },
            )
            .await?;
        session.sequence = seq;

        if response.status != 200 {
            return Ok((response.status, None));
        }
        let plaintext = Self::unframe_response(session, seq, &response.body)?;
        Ok((response.status, Some(plaintext)))
    }
}

#[async_trait]
impl Transport for KlapTransport {
    async fn send(&self, payload: &str) -> Result<String> {
        let mut guard = self.session.lock().await;

        if guard.as_ref().map_or(true, |s| !s.is_live()) {
            *guard = Some(self.handshake().await?);
        }

        let session = guard.as_mut().expect("just ensured present");
        match self.send_once(session, payload).await? {
            (200, Some(plaintext)) => Ok(plaintext),
            (403, _) => {
                tracing::warn!(host = %self.host, "klap 403 on request, resetting session and retrying once");
                *guard = Some(self.handshake().await?);
                let session = guard.as_mut().expect("just re-handshaked");
                match self.send_once(session, payload).await? {
                    (200, Some(plaintext)) => Ok(plaintext),
                    (status, _) => Err(CoreError::Http {
                        status,
                        detail: "klap request failed after 403 recovery".into(),
                    }),
                }
            }
            (status, _) => Err(CoreError::Http {
                status,
                detail: "klap request failed".into(),
            }),
        }
    }

    async fn close(&self) {
        let mut guard = self.session.lock().await;
        *guard = None;
    }
}
