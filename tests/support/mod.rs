//! Shared KLAP mock-device harness for the integration tests. Computes
//! the same cryptographic material a real device would, so the client
//! under test goes through a real handshake/framing round trip against
//! `wiremock` rather than a stubbed-out transport.

pub mod aes_mock;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use smart_session_core::crypto::{aes128_cbc_decrypt, aes128_cbc_encrypt, sha256};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub struct MockState {
    pub local_seed: Option<[u8; 16]>,
}

pub struct KlapMockDevice {
    pub server: MockServer,
    pub remote_seed: [u8; 16],
    pub auth_hash: [u8; 32],
    state: Arc<Mutex<MockState>>,
    pub handshake1_count: Arc<AtomicU32>,
    pub handshake2_count: Arc<AtomicU32>,
    pub request_count: Arc<AtomicU32>,
}

struct Handshake1Responder {
    remote_seed: [u8; 16],
    auth_hash: [u8; 32],
    state: Arc<Mutex<MockState>>,
    counter: Arc<AtomicU32>,
    timeout_secs: u32,
}

impl Respond for Handshake1Responder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.counter.fetch_add(1, Ordering::SeqCst);
        let mut local_seed = [0u8; 16];
        local_seed.copy_from_slice(&request.body[0..16]);
        self.state.lock().unwrap().local_seed = Some(local_seed);

        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&local_seed);
        buf.extend_from_slice(&self.remote_seed);
        buf.extend_from_slice(&self.auth_hash);
        let server_hash = sha256(&buf);

        let mut body = Vec::with_capacity(48);
        body.extend_from_slice(&self.remote_seed);
        body.extend_from_slice(&server_hash);

        ResponseTemplate::new(200)
            .set_body_raw(body, "application/octet-stream")
            .append_header(
                "Set-Cookie",
                format!("TP_SESSIONID=sess123; TIMEOUT={}", self.timeout_secs).as_str(),
            )
    }
}

struct Handshake2Responder {
    counter: Arc<AtomicU32>,
    timeout_secs: u32,
}

impl Respond for Handshake2Responder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.counter.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(200).append_header(
            "Set-Cookie",
            format!("TP_SESSIONID=sess123; TIMEOUT={}", self.timeout_secs).as_str(),
        )
    }
}

struct RequestResponder {
    remote_seed: [u8; 16],
    auth_hash: [u8; 32],
    state: Arc<Mutex<MockState>>,
    counter: Arc<AtomicU32>,
    force_403_on_call: Option<u32>,
    responses: Arc<Mutex<VecDeque<serde_json::Value>>>,
}

impl RequestResponder {
    fn derive_key_and_iv_prefix(&self, local_seed: &[u8; 16]) -> ([u8; 16], [u8; 12]) {
        let mut key_material = Vec::new();
        key_material.extend_from_slice(b"lsk");
        key_material.extend_from_slice(local_seed);
        key_material.extend_from_slice(&self.remote_seed);
        key_material.extend_from_slice(&self.auth_hash);
        let key_full = sha256(&key_material);
        let mut key = [0u8; 16];
        key.copy_from_slice(&key_full[0..16]);

        let mut iv_material = Vec::new();
        iv_material.extend_from_slice(b"iv");
        iv_material.extend_from_slice(local_seed);
        iv_material.extend_from_slice(&self.remote_seed);
        iv_material.extend_from_slice(&self.auth_hash);
        let iv_full = sha256(&iv_material);
        let mut iv_prefix = [0u8; 12];
        iv_prefix.copy_from_slice(&iv_full[0..12]);

        (key, iv_prefix)
    }
}

impl Respond for RequestResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let call_no = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        if self.force_403_on_call == Some(call_no) {
            return ResponseTemplate::new(403);
        }

        let local_seed = self
            .state
            .lock()
            .unwrap()
            .local_seed
            .expect("handshake1 must run before request");
        let (key, iv_prefix) = self.derive_key_and_iv_prefix(&local_seed);

        let seq: i32 = request
            .url
            .query_pairs()
            .find(|(k, _)| k == "seq")
            .map(|(_, v)| v.parse().expect("seq is a valid i32"))
            .expect("request carries a seq query param");
        let mut iv = [0u8; 16];
        iv[0..12].copy_from_slice(&iv_prefix);
        iv[12..16].copy_from_slice(&seq.to_be_bytes());

        let cipher = &request.body[32..];
        let _plaintext = aes128_cbc_decrypt(&key, &iv, cipher).expect("request ciphertext decrypts");

        let response_plain = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| serde_json::json!({"error_code": 0, "result": {"ok": true}}));
        let response_cipher = aes128_cbc_encrypt(&key, &iv, response_plain.to_string().as_bytes());

        let mut body = vec![0u8; 32];
        body.extend_from_slice(&response_cipher);
        ResponseTemplate::new(200).set_body_raw(body, "application/octet-stream")
    }
}

impl KlapMockDevice {
    /// Start a mock device whose matching candidate is `auth_hash` (the v2
    /// KLAP auth hash a real device would compute from its own stored
    /// credentials).
    pub async fn start(auth_hash: [u8; 32]) -> Self {
        Self::start_with_timeout(auth_hash, 3600).await
    }

    /// Like [`start`](Self::start), but with a caller-chosen `TIMEOUT` on
    /// the session cookie, for exercising renewal on expiry.
    pub async fn start_with_timeout(auth_hash: [u8; 32], timeout_secs: u32) -> Self {
        let server = MockServer::start().await;
        let remote_seed = [9u8; 16];
        let state = Arc::new(Mutex::new(MockState { local_seed: None }));
        let handshake1_count = Arc::new(AtomicU32::new(0));
        let handshake2_count = Arc::new(AtomicU32::new(0));
        let request_count = Arc::new(AtomicU32::new(0));

        Mock::given(method("POST"))
            .and(path("/app/handshake1"))
            .respond_with(Handshake1Responder {
                remote_seed,
                auth_hash,
                state: Arc::clone(&state),
                counter: Arc::clone(&handshake1_count),
                timeout_secs,
            })
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/app/handshake2"))
            .respond_with(Handshake2Responder {
                counter: Arc::clone(&handshake2_count),
                timeout_secs,
            })
            .mount(&server)
            .await;

        Self {
            server,
            remote_seed,
            auth_hash,
            state,
            handshake1_count,
            handshake2_count,
            request_count,
        }
    }

    /// Mount the `/app/request` handler. Separate from `start` so tests can
    /// configure `force_403_on_call` and the response plan before traffic
    /// flows.
    pub async fn mount_request_handler(
        &self,
        force_403_on_call: Option<u32>,
        responses: Vec<serde_json::Value>,
    ) {
        Mock::given(method("POST"))
            .and(path("/app/request"))
            .respond_with(RequestResponder {
                remote_seed: self.remote_seed,
                auth_hash: self.auth_hash,
                state: Arc::clone(&self.state),
                counter: Arc::clone(&self.request_count),
                force_403_on_call,
                responses: Arc::new(Mutex::new(responses.into())),
            })
            .mount(&self.server)
            .await;
    }

    pub fn host(&self) -> String {
        self.server.address().ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.server.address().port()
    }

    pub fn handshake1_count(&self) -> u32 {
        self.handshake1_count.load(Ordering::SeqCst)
    }

    pub fn handshake2_count(&self) -> u32 {
        self.handshake2_count.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::SeqCst)
    }
}
