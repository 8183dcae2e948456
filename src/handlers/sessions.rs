use axum::{
    Extension, Json,
    extract::{Path, State},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    crypto::encryptor::mask_value,
    error::{AppError, Result},
    models::{
        security::SecurityContext,
        session::{DeviceSession, SessionSummary},
        user::AuthenticatedUser,
    },
    state::AppState,
};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendResponse {
    pub extended: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct TrustDeviceRequest {
    pub trusted: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub mfa_enabled: bool,
    pub roles: Vec<String>,
    pub premium: bool,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// Lists the caller's active sessions, marking the current one.
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Vec<SessionSummary>>> {
    let sessions = state.sessions.list_user_sessions(&user.id).await?;
    Ok(Json(
        sessions
            .iter()
            .map(|s| SessionSummary::from_session(s, Some(&user.session_id)))
            .collect(),
    ))
}

pub async fn extend_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<ExtendResponse>> {
    let extended = state.sessions.extend_session(&user.session_id).await?;
    let expires_at = state
        .sessions
        .get_session(&user.session_id)
        .await?
        .map(|s| s.expires_at);

    Ok(Json(ExtendResponse {
        extended,
        expires_at,
    }))
}

pub async fn list_devices(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Vec<DeviceSession>>> {
    Ok(Json(state.sessions.list_user_devices(&user.id).await?))
}

/// Marks one of the caller's devices as trusted or untrusted.
pub async fn trust_device(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Extension(security): Extension<SecurityContext>,
    Path(fingerprint): Path<String>,
    Json(payload): Json<TrustDeviceRequest>,
) -> Result<Json<DeviceSession>> {
    let fingerprint = security
        .sanitized_params
        .get("fingerprint")
        .cloned()
        .unwrap_or(fingerprint);

    let device = state
        .sessions
        .set_device_trust(&user.id, &fingerprint, payload.trusted)
        .await?;
    tracing::info!(
        user_id = %user.id,
        fingerprint = %fingerprint,
        trusted = payload.trusted,
        "🔐 Device trust updated"
    );
    Ok(Json(device))
}

/// Returns a user's profile. The email is masked unless the caller is the
/// profile owner.
pub async fn user_profile(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Extension(security): Extension<SecurityContext>,
    Path(user_id): Path<String>,
) -> Result<Json<ProfileResponse>> {
    let user_id = security
        .sanitized_params
        .get("userId")
        .cloned()
        .unwrap_or(user_id);

    let user = state
        .users
        .find_user(&user_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let email = if caller.id == user.id {
        user.email.clone()
    } else {
        user.email.as_deref().map(mask_value)
    };

    Ok(Json(ProfileResponse {
        id: user.id.clone(),
        username: user.username.clone(),
        email,
        email_verified: user.email_verified,
        mfa_enabled: user.mfa_enabled(),
        roles: user.roles.clone(),
        premium: user.premium,
    }))
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
    })
}
