//! Cookie-aware HTTP POST mechanics shared by the KLAP and AES transports.
//!
//! Devices use self-signed certificates on their HTTPS ports, so the
//! HTTPS-capable client always disables certificate verification; plain
//! HTTP never needs it. Both clients are built once and reused across
//! every device, matching reqwest's own connection-pooling design.

use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::Client;

use crate::error::{CoreError, Result};

/// Ports that select HTTPS (devices present a self-signed certificate on
/// these).
const TLS_PORTS: [u16; 2] = [443, 4433];

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .tcp_keepalive(Duration::from_secs(30))
        .build()
        .expect("http client construction is infallible with no custom TLS config")
});

static HTTPS_INSECURE_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .tcp_keepalive(Duration::from_secs(30))
        .danger_accept_invalid_certs(true)
        .build()
        .expect("https client construction is infallible with no custom TLS config")
});

/// A raw, uninterpreted HTTP response: status, body bytes, and headers
/// (duplicates preserved, e.g. multiple `Set-Cookie` lines).
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl HttpResponse {
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Optional extras for a POST: query params, a pre-built `Cookie` header,
/// the content type (KLAP uses `application/octet-stream`, AES uses
/// `application/json`), and any extra headers a device's handshake
/// demands verbatim (e.g. `requestByApp`, `Accept`).
#[derive(Debug, Clone, Default)]
pub struct PostOptions {
    pub query: Vec<(String, String)>,
    pub cookie: Option<String>,
    pub content_type: Option<&'static str>,
    pub headers: Vec<(String, String)>,
}

/// Stateless handle onto the two shared clients; cheap to construct, safe
/// to share across devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpClient;

impl HttpClient {
    pub fn new() -> Self {
        Self
    }

    fn select_client(port: u16) -> &'static Client {
        if TLS_PORTS.contains(&port) {
            &HTTPS_INSECURE_CLIENT
        } else {
            &HTTP_CLIENT
        }
    }

    fn scheme(port: u16) -> &'static str {
        if TLS_PORTS.contains(&port) {
            "https"
        } else {
            "http"
        }
    }

    /// `POST` `path` against `host:port`, returning the raw response.
    /// Enforces `timeout_ms` for the whole round trip; on expiry the
    /// in-flight request future is dropped (destroying the connection) and
    /// the call fails with `CoreError::Timeout`.
    pub async fn post(
        &self,
        host: &str,
        port: u16,
        path: &str,
        body: Vec<u8>,
        timeout_ms: u64,
        opts: PostOptions,
    ) -> Result<HttpResponse> {
        let scheme = Self::scheme(port);
        let mut url = reqwest::Url::parse(&format!("{scheme}://{host}:{port}{path}"))
            .map_err(|e| CoreError::Transport(format!("invalid device url: {e}")))?;
        if !opts.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &opts.query {
                pairs.append_pair(k, v);
            }
        }

        let client = Self::select_client(port);
        let content_type = opts.content_type.unwrap_or("application/octet-stream");
        let mut request = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CONTENT_LENGTH, body.len())
            .header(reqwest::header::CONNECTION, "keep-alive")
            .body(body);
        if let Some(cookie) = &opts.cookie {
            request = request.header(reqwest::header::COOKIE, cookie.as_str());
        }
        for (name, value) in &opts.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let send_fut = request.send();
        let response = tokio::time::timeout(Duration::from_millis(timeout_ms), send_fut)
            .await
            .map_err(|_| CoreError::Timeout)?
            .map_err(|e| CoreError::Transport(format!("http request failed: {e}")))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        let body_fut = response.bytes();
        let body = tokio::time::timeout(Duration::from_millis(timeout_ms), body_fut)
            .await
            .map_err(|_| CoreError::Timeout)?
            .map_err(|e| CoreError::Transport(format!("failed to read response body: {e}")))?
            .to_vec();

        Ok(HttpResponse {
            status,
            body,
            headers,
        })
    }
}
