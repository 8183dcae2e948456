use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request, header},
    middleware::Next,
    response::Response,
};
use tower_cookies::cookie::time::Duration;
use tower_cookies::{Cookie, Cookies};

use crate::{
    error::{AppError, Result},
    models::security::{EventCategory, EventLevel, SecurityContext, SecurityEvent},
    services::threat,
    state::AppState,
};

pub const SESSION_COOKIE: &str = "session_id";

/// Where a session token was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Bearer,
    Cookie,
}

/// The presented session token: a bearer token, else the session cookie.
pub fn extract_session_token(headers: &HeaderMap, cookies: &Cookies) -> Option<(String, TokenSource)> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| (t.to_string(), TokenSource::Bearer));

    bearer.or_else(|| {
        cookies
            .get(SESSION_COOKIE)
            .map(|c| (c.value().to_string(), TokenSource::Cookie))
    })
}

fn clear_session_cookie(cookies: &Cookies) {
    let mut cookie = Cookie::new(SESSION_COOKIE, "");
    cookie.set_max_age(Duration::seconds(0));
    cookie.set_path("/");
    cookies.remove(cookie);
}

/// Resolves the caller's session into an [`AuthenticatedUser`] extension.
///
/// Requests without a token pass through anonymously; whether that is
/// acceptable is decided per route by the guard. A bearer token that does
/// not resolve to a valid session ends the request with `SessionInvalid`.
/// A stale session cookie is cleared and the request continues anonymously.
///
/// [`AuthenticatedUser`]: crate::models::user::AuthenticatedUser
pub async fn authenticate(
    State(state): State<AppState>,
    cookies: Cookies,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response> {
    let Some((token, source)) = extract_session_token(request.headers(), &cookies) else {
        tracing::debug!("🔓 Anonymous request");
        return Ok(next.run(request).await);
    };

    let ip = match request.extensions().get::<SecurityContext>() {
        Some(ctx) => ctx.client_ip.clone(),
        None => {
            let peer = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|c| c.0);
            threat::resolve_client_ip(request.headers(), peer)
        }
    };
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let reject = |reasons: Vec<String>| {
        if source == TokenSource::Cookie {
            clear_session_cookie(&cookies);
            None
        } else {
            Some(AppError::SessionInvalid(reasons))
        }
    };

    let Some(session_id) = state.sessions.session_id_from_token(&token) else {
        tracing::warn!(ip = %ip, source = ?source, "❌ Malformed or forged session token");
        return match reject(vec!["Invalid session token".to_string()]) {
            Some(err) => Err(err),
            None => Ok(next.run(request).await),
        };
    };

    let validation = state
        .sessions
        .validate_session(&session_id, Some(&ip), user_agent.as_deref())
        .await?;

    let session = match validation.session {
        Some(session) if validation.valid => session,
        _ => {
            let event = SecurityEvent::new(
                EventLevel::Warning,
                EventCategory::Session,
                "session_rejected",
                validation.reasons.join("; "),
            )
            .with_request(request.method().as_str(), request.uri().path(), &ip);
            state.events.log_security_event(&event);
            return match reject(validation.reasons) {
                Some(err) => Err(err),
                None => Ok(next.run(request).await),
            };
        }
    };

    if validation.should_extend {
        match state.sessions.extend_session(&session.id).await {
            Ok(true) => tracing::debug!(session_id = %session.id, "🔄 Session extended"),
            Ok(false) => {}
            Err(e) => tracing::warn!(session_id = %session.id, "⚠️ Session extension failed: {}", e),
        }
    }

    let user = state
        .users
        .find_user(&session.user_id)
        .await?
        .ok_or_else(|| {
            tracing::warn!(user_id = %session.user_id, "❌ Session references unknown user");
            AppError::SessionInvalid(vec!["User not found".to_string()])
        })?;

    tracing::debug!(user_id = %user.id, session_id = %session.id, "✅ User authenticated");

    request.extensions_mut().insert(user.identity(&session.id));
    request.extensions_mut().insert(session);

    Ok(next.run(request).await)
}
