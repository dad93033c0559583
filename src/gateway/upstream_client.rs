//! Per-call HTTP client for talking to an upstream decryption server.
//!
//! Each call opens a fresh connection (login and decrypt calls are
//! infrequent enough relative to their 30-second budget that pooling
//! isn't worth the complexity) and drains the full response body into
//! memory, the same shape as the framework's own outbound client.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::Url;
use webpki_roots::TLS_SERVER_ROOTS;

use super::registry::Upstream;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum ClientError {
    Transport(String),
    Timeout,
    /// The upstream answered with a redirect, which can only mean it
    /// isn't actually being served over HTTPS.
    RedirectMisconfiguration,
    MalformedBody(String),
    AuthFailed(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Transport(e) => write!(f, "transport error: {e}"),
            ClientError::Timeout => write!(f, "upstream call timed out"),
            ClientError::RedirectMisconfiguration => {
                write!(f, "upstream redirected; upstreams must be served over HTTPS directly")
            }
            ClientError::MalformedBody(e) => write!(f, "malformed upstream response: {e}"),
            ClientError::AuthFailed(e) => write!(f, "upstream authentication failed: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

async fn connect_and_send(url: &Url) -> Result<Response<Vec<u8>>, ClientError> {
    let host = url.host_str().ok_or_else(|| ClientError::Transport("missing host".into()))?;
    let https = url.scheme() == "https";
    let port = url.port().unwrap_or(if https { 443 } else { 80 });

    let path_and_query = url[url::Position::AfterPort..].to_string();
    let path_and_query = if path_and_query.is_empty() { "/".to_string() } else { path_and_query };

    let req = Request::builder()
        .method("GET")
        .uri(path_and_query)
        .header("host", host)
        .body(Empty::<Bytes>::new())
        .map_err(|e| ClientError::Transport(e.to_string()))?;

    let send = async {
        let addr = format!("{host}:{port}");
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if https {
            let mut roots = RootCertStore::empty();
            roots.extend(TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(config));
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            let stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            send_over(TokioIo::new(stream), req).await
        } else {
            send_over(TokioIo::new(tcp), req).await
        }
    };

    tokio::time::timeout(CALL_TIMEOUT, send)
        .await
        .map_err(|_| ClientError::Timeout)?
}

async fn send_over<IO>(io: IO, req: Request<Empty<Bytes>>) -> Result<Response<Vec<u8>>, ClientError>
where
    IO: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::handshake(io)
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut response = sender
        .send_request(req)
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;

    let mut body = Vec::new();
    while let Some(frame) = response.frame().await {
        let frame = frame.map_err(|e: Box<dyn StdError + Send + Sync>| {
            ClientError::Transport(e.to_string())
        })?;
        if let Some(chunk) = frame.data_ref() {
            body.extend_from_slice(chunk);
        }
    }

    let (parts, _) = response.into_parts();
    Ok(Response::from_parts(parts, body))
}

fn with_query(base: &str, path: &str, pairs: &[(&str, &str)]) -> Result<Url, ClientError> {
    let mut url = Url::parse(base)
        .map_err(|e| ClientError::Transport(format!("invalid upstream url: {e}")))?;
    url.set_path(path);
    {
        let mut q = url.query_pairs_mut();
        for (k, v) in pairs {
            q.append_pair(k, v);
        }
    }
    Ok(url)
}

fn is_redirect(status: http::StatusCode) -> bool {
    matches!(
        status.as_u16(),
        301 | 302 | 303 | 307 | 308
    )
}

/// Ensures `upstream` has a fresh token, refreshing it via `/api/login` if
/// absent or older than `refresh_after`.
pub async fn ensure_token(upstream: &Upstream, refresh_after: Duration) -> Result<String, ClientError> {
    if let Some(token) = upstream.current_token() {
        if !upstream.needs_token_refresh(refresh_after) {
            return Ok(token);
        }
    }

    let url = with_query(
        &upstream.url,
        "/api/login",
        &[("username", &upstream.username), ("password", &upstream.password)],
    )?;

    let response = connect_and_send(&url).await?;
    if is_redirect(response.status()) {
        return Err(ClientError::RedirectMisconfiguration);
    }

    let value: serde_json::Value = serde_json::from_slice(response.body())
        .map_err(|e| ClientError::MalformedBody(e.to_string()))?;

    let success = value.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
    let token = value
        .get("data")
        .and_then(|d| d.get("token"))
        .and_then(|t| t.as_str());

    match (success, token) {
        (true, Some(token)) => {
            upstream.store_token(token.to_string());
            Ok(token.to_string())
        }
        _ => Err(ClientError::AuthFailed(format!(
            "login did not return a token: {value}"
        ))),
    }
}

fn token_invalid_hint(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    let mentions_token = lower.contains("token") || msg.contains("失效");
    let invalid_or_expired =
        lower.contains("invalid") || lower.contains("expired") || msg.contains("失效");
    mentions_token && invalid_or_expired
}

/// Calls `/api/yd/decryptl` on `upstream`, retrying once with a freshly
/// refreshed token if the first attempt reports an invalid/expired token.
pub async fn call_decrypt(
    upstream: &Upstream,
    raw_hex: &str,
    refresh_after: Duration,
) -> Result<serde_json::Value, ClientError> {
    for attempt in 0..2 {
        let token = ensure_token(upstream, refresh_after).await?;
        let url = with_query(&upstream.url, "/api/yd/decryptl", &[("hex", raw_hex), ("token", &token)])?;
        let response = connect_and_send(&url).await?;

        if response.status() == http::StatusCode::UNAUTHORIZED {
            upstream.invalidate_token();
            if attempt == 0 {
                continue;
            }
        }

        let value: serde_json::Value = serde_json::from_slice(response.body())
            .map_err(|e| ClientError::MalformedBody(e.to_string()))?;

        if let Some(msg) = value.get("msg").and_then(|m| m.as_str()) {
            if token_invalid_hint(msg) {
                upstream.invalidate_token();
                if attempt == 0 {
                    continue;
                }
            }
        }

        return Ok(value);
    }

    Err(ClientError::AuthFailed("exhausted retries refreshing token".into()))
}
