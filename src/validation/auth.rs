use serde::Deserialize;

use crate::error::{AppError, Result};

/// Usernames are ASCII letters, digits, `_` and `-`.
pub fn username_charset(username: &str, _ctx: &()) -> garde::Result {
    if username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Ok(())
    } else {
        Err(garde::Error::new(
            "can only contain letters, numbers, underscores, and hyphens",
        ))
    }
}

/// Verification codes are 6 to 8 ASCII digits.
pub fn numeric_code(code: &str, _ctx: &()) -> garde::Result {
    if (6..=8).contains(&code.len()) && code.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(garde::Error::new("must be 6 to 8 digits"))
    }
}

fn optional_numeric_code(code: &Option<String>, ctx: &()) -> garde::Result {
    match code {
        Some(code) => numeric_code(code, ctx),
        None => Ok(()),
    }
}

/// The request payload for user login.
#[derive(Deserialize, garde::Validate)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[garde(length(min = 3, max = 255), custom(username_charset))]
    pub username: String,
    #[garde(length(min = 8, max = 128))]
    pub password: String,
    /// Completes MFA during login for users that have it enabled.
    #[garde(custom(optional_numeric_code))]
    pub mfa_code: Option<String>,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// The request payload for `POST /api/auth/mfa/verify`.
#[derive(Debug, Deserialize, garde::Validate)]
pub struct MfaVerifyRequest {
    #[garde(custom(numeric_code))]
    pub code: String,
}

/// Runs the payload's garde rules, mapping the report to a validation error.
pub fn validated<T: garde::Validate<Context = ()>>(payload: T) -> Result<T> {
    payload.validate().map_err(|report| {
        tracing::debug!("❌ Payload validation failed: {}", report);
        AppError::Validation(report.to_string())
    })?;
    Ok(payload)
}
