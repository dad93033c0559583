//! Gateway error taxonomy and its HTTP rendering.
//!
//! Upstream failures are never surfaced verbatim to the caller: the
//! actual error is logged and the client sees a generic message, which
//! matches the upstream service's own "don't leak internals" posture.

use http::{Response, StatusCode};
use serde::Serialize;

use crate::body::TakoBody;
use crate::responder::Responder;

#[derive(Debug)]
pub enum GatewayError {
    /// Decoded length isn't 176 bytes, or the demasked first byte isn't
    /// one of the recognized markers.
    BadPacket(String),
    /// Unknown user, wrong password, or an invalid/expired token.
    AuthFail,
    /// The caller's quota is exhausted.
    QuotaExceeded,
    /// The priority queue is at capacity.
    QueueFull,
    /// No upstream went idle within the poll window.
    AllServersBusy,
    /// The task-result slot's TTL expired before a worker finished.
    WaitTimeout,
    /// Transport error, non-2xx, or malformed body from an upstream.
    UpstreamFail(anyhow::Error),
    /// Anything else.
    Internal(anyhow::Error),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::BadPacket(msg) => write!(f, "bad packet: {msg}"),
            GatewayError::AuthFail => write!(f, "authentication failed"),
            GatewayError::QuotaExceeded => write!(f, "quota exceeded"),
            GatewayError::QueueFull => write!(f, "queue full"),
            GatewayError::AllServersBusy => write!(f, "all servers busy"),
            GatewayError::WaitTimeout => write!(f, "wait timeout"),
            GatewayError::UpstreamFail(e) => write!(f, "upstream failure: {e}"),
            GatewayError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadPacket(_) => StatusCode::BAD_REQUEST,
            GatewayError::AuthFail => StatusCode::UNAUTHORIZED,
            GatewayError::QuotaExceeded => StatusCode::FORBIDDEN,
            GatewayError::QueueFull | GatewayError::AllServersBusy | GatewayError::WaitTimeout => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamFail(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The message shown to the caller. Upstream/internal details never
    /// leave the process; they are logged by the call site instead.
    fn public_message(&self) -> String {
        match self {
            GatewayError::BadPacket(msg) => format!("useless packet: {msg}"),
            GatewayError::AuthFail => "authentication failed".to_string(),
            GatewayError::QuotaExceeded => "quota exceeded".to_string(),
            GatewayError::QueueFull => "queue full, please retry later".to_string(),
            GatewayError::AllServersBusy => "Server busy, please retry later".to_string(),
            GatewayError::WaitTimeout => "Server busy, please retry later".to_string(),
            GatewayError::UpstreamFail(_) => "Task processing failed".to_string(),
            GatewayError::Internal(_) => "Task processing failed".to_string(),
        }
    }
}

impl Responder for GatewayError {
    fn into_response(self) -> Response<TakoBody> {
        if matches!(
            self,
            GatewayError::UpstreamFail(_) | GatewayError::Internal(_)
        ) {
            tracing::error!(error = %self, "gateway error");
        }

        json_error(self.status(), &self.public_message())
    }
}

#[derive(Serialize)]
struct JsonMessage<'a> {
    msg: &'a str,
}

/// Renders `{"msg": "..."}` with the given status code.
pub fn json_error(status: StatusCode, msg: &str) -> Response<TakoBody> {
    json_response(status, &JsonMessage { msg })
}

/// Serializes `body` as the JSON response payload with the given status code.
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<TakoBody> {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(TakoBody::from(payload))
        .unwrap_or_else(|_| Response::new(TakoBody::empty()))
}
