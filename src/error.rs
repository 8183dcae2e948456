use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use thiserror::Error;

/// The application's error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// No authenticated identity was present on a protected endpoint.
    #[error("Authentication required")]
    AuthenticationRequired,

    /// The identity has not verified its email address.
    #[error("Email verification required")]
    EmailVerificationRequired,

    /// None of the required roles matched.
    #[error("Insufficient privilege")]
    InsufficientPrivilege,

    /// The RBAC resolver denied the action.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The session has not completed MFA verification.
    #[error("MFA verification required")]
    MfaRequired,

    /// The request does not come from a trusted device.
    #[error("Trusted device required")]
    TrustedDeviceRequired,

    /// The request's risk score exceeds the endpoint threshold.
    #[error("Risk threshold exceeded")]
    RiskThresholdExceeded,

    /// The rate limiter rejected the request.
    #[error("Rate limit exceeded: {current}/{limit}, retry after {retry_after}s")]
    RateLimitExceeded {
        limit: u64,
        current: u64,
        retry_after: u64,
    },

    /// Missing or malformed CSRF token on a state-changing request.
    #[error("CSRF token invalid")]
    CsrfInvalid,

    /// The firewall blocked the request.
    #[error("Request blocked: {0}")]
    RequestBlocked(String),

    /// An encryption error.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// A decryption or tag verification error.
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// The session failed validation.
    #[error("Session invalid: {}", .0.join(", "))]
    SessionInvalid(Vec<String>),

    /// Bad credentials at login.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A security dependency is down and the request cannot be vetted.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A store error that did not come from Redis (timeouts, serialization).
    #[error("Store error: {0}")]
    Store(String),

    /// A validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A resource not found error.
    #[error("Resource not found")]
    NotFound,

    /// An internal server error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Stable machine-readable code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            AppError::EmailVerificationRequired => "EMAIL_VERIFICATION_REQUIRED",
            AppError::InsufficientPrivilege => "INSUFFICIENT_PRIVILEGE",
            AppError::AccessDenied(_) => "ACCESS_DENIED",
            AppError::MfaRequired => "MFA_REQUIRED",
            AppError::TrustedDeviceRequired => "TRUSTED_DEVICE_REQUIRED",
            AppError::RiskThresholdExceeded => "RISK_THRESHOLD_EXCEEDED",
            AppError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            AppError::CsrfInvalid => "CSRF_INVALID",
            AppError::RequestBlocked(_) => "REQUEST_BLOCKED",
            AppError::Encryption(_) => "ENCRYPTION_ERROR",
            AppError::Decryption(_) => "DECRYPTION_ERROR",
            AppError::SessionInvalid(_) => "SESSION_INVALID",
            AppError::Authentication(_) => "AUTHENTICATION_FAILED",
            AppError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            AppError::Redis(_) | AppError::Store(_) => "STORE_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound => "NOT_FOUND",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::AuthenticationRequired
            | AppError::SessionInvalid(_)
            | AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::EmailVerificationRequired
            | AppError::InsufficientPrivilege
            | AppError::AccessDenied(_)
            | AppError::MfaRequired
            | AppError::TrustedDeviceRequired
            | AppError::RiskThresholdExceeded
            | AppError::CsrfInvalid
            | AppError::RequestBlocked(_) => StatusCode::FORBIDDEN,
            AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Encryption(_)
            | AppError::Decryption(_)
            | AppError::Redis(_)
            | AppError::Store(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error is an explicit policy decision rather than an infrastructure failure.
    pub fn is_policy_violation(&self) -> bool {
        !self.status().is_server_error()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (message, reason) = match self {
            AppError::AuthenticationRequired => {
                tracing::debug!("Authentication required");
                ("Authentication required".to_string(), "authentication_required".to_string())
            }

            AppError::EmailVerificationRequired => (
                "Email verification required".to_string(),
                "email_not_verified".to_string(),
            ),

            AppError::InsufficientPrivilege => (
                "Insufficient privileges".to_string(),
                "Insufficient role privileges".to_string(),
            ),

            AppError::AccessDenied(ref reason) => ("Access denied".to_string(), reason.clone()),

            AppError::MfaRequired => (
                "Multi-factor authentication required".to_string(),
                "mfa_not_verified".to_string(),
            ),

            AppError::TrustedDeviceRequired => (
                "Trusted device required".to_string(),
                "untrusted_device".to_string(),
            ),

            AppError::RiskThresholdExceeded => (
                "Request risk too high".to_string(),
                "risk_threshold_exceeded".to_string(),
            ),

            AppError::RateLimitExceeded { .. } => (
                "Too many requests".to_string(),
                "rate_limit_exceeded".to_string(),
            ),

            AppError::CsrfInvalid => (
                "Invalid CSRF token".to_string(),
                "csrf_token_invalid".to_string(),
            ),

            AppError::RequestBlocked(ref reason) => ("Request blocked".to_string(), reason.clone()),

            AppError::SessionInvalid(ref reasons) => {
                tracing::warn!("Session rejected: {}", reasons.join(", "));
                ("Session invalid".to_string(), reasons.join("; "))
            }

            AppError::Authentication(ref msg) => {
                tracing::warn!("Authentication failed: {}", msg);
                ("Authentication failed".to_string(), msg.clone())
            }

            AppError::Validation(ref msg) => {
                tracing::debug!("Validation error: {}", msg);
                ("Invalid request".to_string(), msg.clone())
            }

            AppError::NotFound => {
                tracing::debug!("Resource not found");
                ("Resource not found".to_string(), "not_found".to_string())
            }

            AppError::Encryption(ref msg) | AppError::Decryption(ref msg) => {
                tracing::error!("Crypto error: {}", msg);
                ("Internal server error".to_string(), "crypto_error".to_string())
            }

            AppError::ServiceUnavailable(ref reason) => {
                tracing::warn!("Service unavailable: {}", reason);
                ("Service unavailable".to_string(), reason.clone())
            }

            AppError::Redis(ref e) => {
                tracing::error!("Redis error: {}", e);
                ("Internal server error".to_string(), "store_unavailable".to_string())
            }

            AppError::Store(ref msg) => {
                tracing::error!("Store error: {}", msg);
                ("Internal server error".to_string(), "store_unavailable".to_string())
            }

            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                ("Internal server error".to_string(), "internal_error".to_string())
            }
        };

        let code = self.code();
        let timestamp = Utc::now().to_rfc3339();
        let body = sonic_rs::to_string(&sonic_rs::json!({
            "error": message,
            "code": code,
            "reason": reason,
            "timestamp": timestamp
        }))
        .unwrap_or_else(|_| r#"{"error":"Internal server error"}"#.to_string());

        let mut response = (
            self.status(),
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            body,
        )
            .into_response();

        if let AppError::RateLimitExceeded { retry_after, limit, .. } = self {
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
        }

        response
    }
}
