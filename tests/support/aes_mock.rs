//! AES-transport mock device: answers the RSA handshake for real (decrypts
//! nothing the client didn't actually send) and tracks which `login_device`
//! candidates were attempted, so tests can assert plaintext credentials were
//! never put on the wire.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use serde_json::{json, Value};
use smart_session_core::crypto::{aes128_cbc_decrypt, aes128_cbc_encrypt};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

const SESSION_KEY: [u8; 16] = [3u8; 16];
const SESSION_IV: [u8; 16] = [4u8; 16];

fn rsa_encrypt_raw(pub_pem: &str, raw: &[u8]) -> Vec<u8> {
    let public_key = RsaPublicKey::from_public_key_pem(pub_pem).expect("client sends a valid public key");
    let modulus_len = public_key.n().to_bytes_be().len();
    let padding_len = modulus_len - raw.len() - 3;
    let mut block = vec![0x00u8, 0x02];
    block.extend(std::iter::repeat(0xFFu8).take(padding_len));
    block.push(0x00);
    block.extend_from_slice(raw);

    let m = BigUint::from_bytes_be(&block);
    let c = m.modpow(public_key.e(), public_key.n());
    let mut bytes = c.to_bytes_be();
    if bytes.len() < modulus_len {
        let mut padded = vec![0u8; modulus_len - bytes.len()];
        padded.append(&mut bytes);
        bytes = padded;
    }
    bytes
}

/// Single `/app` responder dispatching on the request's own `method` field,
/// since `handshake` and `securePassthrough` share one endpoint and a
/// wiremock path/method matcher alone can't tell them apart.
struct AppResponder {
    handshake_count: Arc<AtomicU32>,
    login_count: Arc<AtomicU32>,
    request_count: Arc<AtomicU32>,
    seen_login_params: Arc<Mutex<Vec<Value>>>,
}

impl AppResponder {
    fn encrypt_reply(&self, inner: &Value) -> String {
        let cipher = aes128_cbc_encrypt(&SESSION_KEY, &SESSION_IV, inner.to_string().as_bytes());
        BASE64.encode(cipher)
    }

    fn handle_handshake(&self, body: &Value) -> ResponseTemplate {
        self.handshake_count.fetch_add(1, Ordering::SeqCst);
        let pub_pem = body["params"]["key"].as_str().expect("handshake carries public key pem");

        let mut raw = Vec::with_capacity(32);
        raw.extend_from_slice(&SESSION_KEY);
        raw.extend_from_slice(&SESSION_IV);
        let cipher = rsa_encrypt_raw(pub_pem, &raw);

        ResponseTemplate::new(200)
            .set_body_json(json!({
                "error_code": 0,
                "result": { "key": BASE64.encode(cipher) },
            }))
            .append_header("Set-Cookie", "TP_SESSIONID=aessess; TIMEOUT=3600")
    }

    fn handle_passthrough(&self, body: &Value) -> ResponseTemplate {
        let request_b64 = body["params"]["request"].as_str().expect("passthrough carries request");
        let cipher = BASE64.decode(request_b64).expect("passthrough request is base64");
        let plain = aes128_cbc_decrypt(&SESSION_KEY, &SESSION_IV, &cipher).expect("passthrough request decrypts");
        let inner: Value = serde_json::from_slice(&plain).expect("passthrough plaintext is json");

        let inner_method = inner["method"].as_str().unwrap_or_default();
        let reply = if inner_method == "login_device" {
            self.login_count.fetch_add(1, Ordering::SeqCst);
            self.seen_login_params.lock().unwrap().push(inner["params"].clone());
            json!({"error_code": 0, "result": {"token": "tok-credentialshash"}})
        } else {
            self.request_count.fetch_add(1, Ordering::SeqCst);
            json!({"error_code": 0, "result": {"ok": true}})
        };

        ResponseTemplate::new(200).set_body_json(json!({
            "error_code": 0,
            "result": { "response": self.encrypt_reply(&reply) },
        }))
    }
}

impl Respond for AppResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).expect("app body is json");
        match body["method"].as_str() {
            Some("handshake") => self.handle_handshake(&body),
            Some("securePassthrough") => self.handle_passthrough(&body),
            other => panic!("unexpected aes app method: {other:?}"),
        }
    }
}

pub struct AesMockDevice {
    server: MockServer,
    handshake_count: Arc<AtomicU32>,
    login_count: Arc<AtomicU32>,
    request_count: Arc<AtomicU32>,
    seen_login_params: Arc<Mutex<Vec<Value>>>,
}

impl AesMockDevice {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let handshake_count = Arc::new(AtomicU32::new(0));
        let login_count = Arc::new(AtomicU32::new(0));
        let request_count = Arc::new(AtomicU32::new(0));
        let seen_login_params = Arc::new(Mutex::new(Vec::new()));

        Mock::given(method("POST"))
            .and(path("/app"))
            .respond_with(AppResponder {
                handshake_count: Arc::clone(&handshake_count),
                login_count: Arc::clone(&login_count),
                request_count: Arc::clone(&request_count),
                seen_login_params: Arc::clone(&seen_login_params),
            })
            .mount(&server)
            .await;

        Self {
            server,
            handshake_count,
            login_count,
            request_count,
            seen_login_params,
        }
    }

    pub fn host(&self) -> String {
        self.server.address().ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.server.address().port()
    }

    pub fn handshake_count(&self) -> u32 {
        self.handshake_count.load(Ordering::SeqCst)
    }

    pub fn login_count(&self) -> u32 {
        self.login_count.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn seen_login_params(&self) -> Vec<Value> {
        self.seen_login_params.lock().unwrap().clone()
    }
}
