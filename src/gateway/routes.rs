//! The five HTTP endpoints the gateway exposes.
//!
//! Query strings are parsed by hand rather than through the framework's
//! typed `Query<T>` extractor: a couple of these endpoints need strict
//! extra-parameter rejection or "either of two params" auth logic that
//! doesn't fit a single deserialize-into-a-struct shape.

use std::collections::HashMap;
use std::sync::Arc;

use http::StatusCode;

use crate::responder::Responder;
use crate::state::get_state;
use crate::types::{Request, Response};

use super::dispatcher::Dispatcher;
use super::error::{json_error, json_response, GatewayError};
use super::packet::FrameKind;
use super::token::TokenIssuer;
use super::users::UserRecord;

fn query_params(req: &Request) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

fn dispatcher() -> Result<Arc<Dispatcher>, Response> {
    get_state::<Arc<Dispatcher>>()
        .map(|wrapped| (*wrapped).clone())
        .ok_or_else(|| json_error(StatusCode::INTERNAL_SERVER_ERROR, "dispatcher not initialized"))
}

fn token_issuer() -> Result<Arc<TokenIssuer>, Response> {
    get_state::<TokenIssuer>().ok_or_else(|| {
        json_error(StatusCode::INTERNAL_SERVER_ERROR, "token issuer not initialized")
    })
}

pub async fn index(_req: Request) -> impl Responder {
    json_response(
        StatusCode::OK,
        &serde_json::json!({ "service": "drone-gateway", "status": "ok" }),
    )
}

pub async fn server_stats(_req: Request) -> Response {
    let dispatcher = match dispatcher() {
        Ok(d) => d,
        Err(resp) => return resp,
    };

    let upstreams: Vec<_> = dispatcher
        .registry()
        .all()
        .iter()
        .map(|u| {
            serde_json::json!({
                "index": u.index,
                "url": u.url,
                "username": u.username,
                "status": u.status_label(),
                "token_status": u.token_status_label(dispatcher.config().token_refresh_after),
                "request_count": dispatcher.upstream_request_count(u.index),
            })
        })
        .collect();

    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "upstreams": upstreams,
            "affinity_map": { "size": dispatcher.affinity().len(), "capacity": dispatcher.affinity().capacity() },
            "processing_set": { "size": dispatcher.processing().len(), "capacity": dispatcher.processing().capacity() },
            "queue": { "size": dispatcher.queue().len(), "capacity": dispatcher.queue().capacity() },
        }),
    )
}

pub async fn login(req: Request) -> Response {
    let dispatcher = match dispatcher() {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    let issuer = match token_issuer() {
        Ok(i) => i,
        Err(resp) => return resp,
    };

    let params = query_params(&req);
    let (Some(username), Some(password)) = (params.get("username"), params.get("password")) else {
        return GatewayError::AuthFail.into_response();
    };

    let record = match dispatcher.users().authenticate(username, password) {
        Ok(record) => record,
        Err(_) => return GatewayError::AuthFail.into_response(),
    };

    let token = match issuer.issue(username) {
        Ok(token) => token,
        Err(e) => return GatewayError::Internal(e).into_response(),
    };

    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "success": true,
            "msg": "ok",
            "data": { "token": token, "orders": [record.orders_summary()] },
        }),
    )
}

/// Resolves the caller's identity from either a `token` param or a
/// `username`+`password` pair, in that order of preference.
fn resolve_caller(
    dispatcher: &Dispatcher,
    issuer: &TokenIssuer,
    params: &HashMap<String, String>,
) -> Result<UserRecord, GatewayError> {
    if let Some(token) = params.get("token") {
        let username = issuer.verify(token).map_err(|_| GatewayError::AuthFail)?;
        return dispatcher
            .users()
            .charge(&username)
            .map_err(|_| GatewayError::QuotaExceeded);
    }

    if let (Some(username), Some(password)) = (params.get("username"), params.get("password")) {
        dispatcher
            .users()
            .authenticate(username, password)
            .map_err(|_| GatewayError::AuthFail)?;
        return dispatcher
            .users()
            .charge(username)
            .map_err(|_| GatewayError::QuotaExceeded);
    }

    Err(GatewayError::AuthFail)
}

pub async fn decrypt(req: Request) -> Response {
    let dispatcher = match dispatcher() {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    let issuer = match token_issuer() {
        Ok(i) => i,
        Err(resp) => return resp,
    };

    let params = query_params(&req);
    let Some(hex) = params.get("hex") else {
        return GatewayError::BadPacket("missing hex parameter".to_string()).into_response();
    };

    let caller = match resolve_caller(&dispatcher, &issuer, &params) {
        Ok(caller) => caller,
        Err(e) => return e.into_response(),
    };

    let (kind, drone_id) = match dispatcher.classify(hex) {
        Ok(pair) => pair,
        Err(e) => return e.into_response(),
    };

    if let Err(e) = dispatcher.users().touch_last_request(&caller.username) {
        tracing::warn!(username = %caller.username, error = %e, "failed to record last-request timestamp");
    }

    let result = match kind {
        FrameKind::Data => dispatcher.handle_data_packet(&drone_id, hex).await,
        FrameKind::Key => {
            let task_id = format!("{}-{}", caller.username, drone_id);
            dispatcher
                .handle_key_packet(
                    task_id,
                    caller.username.clone(),
                    caller.priority,
                    caller.update_time_epoch,
                    drone_id,
                    hex.to_string(),
                )
                .await
        }
        FrameKind::Useless => unreachable!("classify() rejects useless frames"),
    };

    match result {
        Ok(body) => json_response(StatusCode::OK, &body),
        Err(e) => e.into_response(),
    }
}

pub async fn query_persondata(req: Request) -> Response {
    let dispatcher = match dispatcher() {
        Ok(d) => d,
        Err(resp) => return resp,
    };

    let params = query_params(&req);
    let allowed: std::collections::HashSet<&str> = ["username", "password"].into_iter().collect();
    if params.keys().any(|k| !allowed.contains(k.as_str())) {
        return json_error(StatusCode::BAD_REQUEST, "unexpected parameter");
    }

    let (Some(username), Some(password)) = (params.get("username"), params.get("password")) else {
        return json_error(StatusCode::BAD_REQUEST, "username and password are required");
    };

    let record = match dispatcher.users().authenticate(username, password) {
        Ok(record) => record,
        Err(_) => return GatewayError::AuthFail.into_response(),
    };

    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "code": 0,
            "message": "ok",
            "data": { "visitTimes": record.visit_times_summary() },
        }),
    )
}
