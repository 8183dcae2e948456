use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_cookies::cookie::time::Duration;
use tower_cookies::{Cookie, Cookies};

use crate::{
    crypto::tokens::generate_csrf_token,
    error::{AppError, Result},
    middleware_layer::{auth::SESSION_COOKIE, csrf::CSRF_COOKIE},
    models::{
        security::{EventCategory, EventLevel, SecurityContext, SecurityEvent},
        session::{LoginMethod, NewSession},
        user::AuthenticatedUser,
    },
    state::AppState,
    validation::auth::{LoginRequest, MfaVerifyRequest, validated},
};

/// The response payload for authentication-related requests.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub success: bool,
    pub token: String,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
    pub csrf_token: String,
    /// The user has MFA enabled and this session is not yet verified.
    pub mfa_required: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutAllResponse {
    pub success: bool,
    pub sessions_revoked: usize,
}

/// Creates a cookie scoped to the whole site. Only the CSRF cookie is
/// readable from scripts.
fn create_secure_cookie(
    name: &'static str,
    value: String,
    max_age_secs: i64,
    secure: bool,
) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, value);
    cookie.set_http_only(name != CSRF_COOKIE);
    cookie.set_secure(secure);
    cookie.set_same_site(tower_cookies::cookie::SameSite::Lax);
    cookie.set_max_age(Duration::seconds(max_age_secs));
    cookie.set_path("/");
    cookie
}

fn clear_auth_cookies(cookies: &Cookies) {
    for name in [SESSION_COOKIE, CSRF_COOKIE] {
        let mut cookie = Cookie::new(name, "");
        cookie.set_max_age(Duration::seconds(0));
        cookie.set_path("/");
        cookies.remove(cookie);
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrfResponse {
    pub csrf_token: String,
}

/// Issues a CSRF token for clients that have none yet (the login form).
pub async fn csrf_token(State(state): State<AppState>, cookies: Cookies) -> Json<CsrfResponse> {
    let csrf_token = generate_csrf_token();
    cookies.add(create_secure_cookie(
        CSRF_COOKIE,
        csrf_token.clone(),
        state.config.session.session_timeout.as_secs() as i64,
        state.config.is_production(),
    ));
    Json(CsrfResponse { csrf_token })
}

/// Handles user login.
pub async fn login(
    State(state): State<AppState>,
    Extension(security): Extension<SecurityContext>,
    cookies: Cookies,
    Json(payload): Json<LoginRequest>,
) -> Result<Response> {
    let payload = validated(payload)?;
    tracing::info!(username = %payload.username, ip = %security.client_ip, "🔐 Login attempt");

    let Some(user) = state
        .users
        .verify_credentials(&payload.username, &payload.password)
        .await?
    else {
        let event = SecurityEvent::new(
            EventLevel::Warning,
            EventCategory::Authentication,
            "login_failed",
            "Invalid credentials",
        )
        .with_request("POST", "/api/auth/login", &security.client_ip)
        .with_security(&security);
        state.events.log_security_event(&event);
        return Err(AppError::Authentication("Invalid credentials".to_string()));
    };

    let mfa_verified = match payload.mfa_code.as_deref() {
        Some(code) if user.mfa_enabled() => {
            if !state.users.verify_mfa_code(&user.id, code).await? {
                tracing::warn!(user_id = %user.id, "❌ Invalid MFA code at login");
                return Err(AppError::Authentication("Invalid verification code".to_string()));
            }
            true
        }
        _ => false,
    };

    let issued = state
        .sessions
        .create_session(NewSession {
            user_id: user.id.clone(),
            ip_address: security.client_ip.clone(),
            user_agent: security.user_agent.clone().unwrap_or_default(),
            device_fingerprint: security.device_fingerprint.clone(),
            login_method: if mfa_verified {
                LoginMethod::Mfa
            } else {
                LoginMethod::Password
            },
            risk_score: security.risk_score(),
            mfa_verified,
        })
        .await?;

    let secure = state.config.is_production();
    let lifetime = state.config.session.session_timeout.as_secs() as i64;
    cookies.add(create_secure_cookie(
        SESSION_COOKIE,
        issued.token.clone(),
        lifetime,
        secure,
    ));

    let csrf_token = generate_csrf_token();
    cookies.add(create_secure_cookie(
        CSRF_COOKIE,
        csrf_token.clone(),
        lifetime,
        secure,
    ));

    let event = SecurityEvent::new(
        EventLevel::Info,
        EventCategory::Authentication,
        "login_succeeded",
        "User logged in",
    )
    .with_user(Some(&user.id))
    .with_request("POST", "/api/auth/login", &security.client_ip)
    .with_security(&security);
    state.events.log_security_event(&event);
    tracing::info!(user_id = %user.id, session_id = %issued.session.id, "✅ User logged in");

    let response = LoginResponse {
        success: true,
        token: issued.token,
        session_id: issued.session.id,
        expires_at: issued.session.expires_at,
        csrf_token,
        mfa_required: user.mfa_enabled() && !mfa_verified,
    };

    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Ends the current session.
pub async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    cookies: Cookies,
) -> Result<Response> {
    state.sessions.invalidate_session(&user.session_id).await?;
    clear_auth_cookies(&cookies);
    tracing::info!(user_id = %user.id, session_id = %user.session_id, "👋 User logged out");

    let response = AuthResponse {
        success: true,
        message: "Logout successful".to_string(),
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Ends every session of the current user, this one included.
pub async fn logout_all(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    cookies: Cookies,
) -> Result<Response> {
    let revoked = state
        .sessions
        .invalidate_all_user_sessions(&user.id, None)
        .await?;
    clear_auth_cookies(&cookies);

    let event = SecurityEvent::new(
        EventLevel::Info,
        EventCategory::Session,
        "logout_all",
        format!("{} sessions revoked", revoked),
    )
    .with_user(Some(&user.id));
    state.events.log_security_event(&event);

    let response = LogoutAllResponse {
        success: true,
        sessions_revoked: revoked,
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Marks the current session as MFA-verified.
pub async fn verify_mfa(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(payload): Json<MfaVerifyRequest>,
) -> Result<Response> {
    let payload = validated(payload)?;

    if !user.mfa_enabled {
        return Err(AppError::Validation("MFA is not enabled for this account".to_string()));
    }

    if !state.users.verify_mfa_code(&user.id, &payload.code).await? {
        let event = SecurityEvent::new(
            EventLevel::Warning,
            EventCategory::Authentication,
            "mfa_failed",
            "Invalid verification code",
        )
        .with_user(Some(&user.id));
        state.events.log_security_event(&event);
        return Err(AppError::Authentication("Invalid verification code".to_string()));
    }

    if !state.sessions.mark_mfa_verified(&user.session_id).await? {
        return Err(AppError::SessionInvalid(vec!["Session not found".to_string()]));
    }
    tracing::info!(user_id = %user.id, session_id = %user.session_id, "✅ MFA verified");

    let response = AuthResponse {
        success: true,
        message: "MFA verified".to_string(),
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}
