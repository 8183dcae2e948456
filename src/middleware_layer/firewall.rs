use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::FutureExt;
use serde_json::{Map, Value};
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    middleware_layer::auth::extract_session_token,
    models::security::SecurityContext,
    services::{pipeline::RequestSnapshot, threat},
    state::AppState,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const RISK_SCORE_HEADER: &str = "x-risk-score";
pub const THREAT_LEVEL_HEADER: &str = "x-threat-level";

/// Parses JSON and urlencoded form bodies; anything else is opaque.
fn parse_body(headers: &HeaderMap, bytes: &Bytes) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/json") {
        serde_json::from_slice(bytes).ok()
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let form: Map<String, Value> = url::form_urlencoded::parse(bytes)
            .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
            .collect();
        Some(Value::Object(form))
    } else {
        None
    }
}

fn tag_response(response: &mut Response, ctx: &SecurityContext, debug_headers: bool) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    if debug_headers {
        headers.insert(RISK_SCORE_HEADER, HeaderValue::from(ctx.risk_score()));
        headers.insert(
            THREAT_LEVEL_HEADER,
            HeaderValue::from_static(ctx.threat_level().as_str()),
        );
    }
}

/// Runs the risk pipeline over every request.
///
/// The body is buffered (up to the configured limit) so the pipeline can
/// inspect it, then handed on unchanged. The resulting [`SecurityContext`]
/// is inserted as a request extension for authentication, the guard and
/// the handlers.
pub async fn firewall(
    State(state): State<AppState>,
    cookies: Cookies,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let debug_headers = state.pipeline.config().debug_headers;

    let (bytes, body_overflow) =
        match axum::body::to_bytes(body, state.pipeline.config().max_body_bytes).await {
            Ok(bytes) => (bytes, false),
            Err(e) => {
                tracing::debug!("Request body rejected while buffering: {}", e);
                (Bytes::new(), true)
            }
        };

    let snapshot = RequestSnapshot {
        method: parts.method.clone(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers.clone(),
        peer: parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|c| c.0),
        body: parse_body(&parts.headers, &bytes),
        body_overflow,
        // Route parameters are matched later; the guard sanitizes them.
        path_params: HashMap::new(),
        session_id: extract_session_token(&parts.headers, &cookies)
            .and_then(|(token, _)| state.sessions.session_id_from_token(&token)),
    };

    let ctx = match AssertUnwindSafe(state.pipeline.inspect(&snapshot))
        .catch_unwind()
        .await
    {
        Ok(Ok(ctx)) => ctx,
        Ok(Err((ctx, err))) => {
            let mut response = err.into_response();
            tag_response(&mut response, &ctx, debug_headers);
            return response;
        }
        Err(_) => {
            let mut ctx = SecurityContext::new(Uuid::new_v4().to_string());
            ctx.client_ip = threat::resolve_client_ip(&snapshot.headers, snapshot.peer);
            state
                .pipeline
                .report_fault(&snapshot, &ctx, "pipeline", "panic during inspection");
            ctx
        }
    };

    parts.extensions.insert(ctx.clone());
    let request = Request::from_parts(parts, Body::from(bytes));

    let mut response = next.run(request).await;
    tag_response(&mut response, &ctx, debug_headers);
    response
}
