use http::{HeaderMap, Method, header};
use serde_json::Value;
use subtle::ConstantTimeEq;
use tower_cookies::cookie::Cookie;

use crate::error::{AppError, Result};

pub const CSRF_HEADER: &str = "x-csrf-token";
pub const CSRF_COOKIE: &str = "csrf_token";
/// Body fields accepted in place of the header.
pub const CSRF_BODY_FIELDS: [&str; 2] = ["_csrf", "csrfToken"];
pub const MIN_CSRF_TOKEN_LENGTH: usize = 16;

pub fn is_safe_method(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS
}

/// The submitted token: the `x-csrf-token` header, else a body field.
pub fn submitted_token<'a>(headers: &'a HeaderMap, body: Option<&'a Value>) -> Option<&'a str> {
    headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            let body = body?;
            CSRF_BODY_FIELDS
                .iter()
                .find_map(|field| body.get(*field).and_then(Value::as_str))
        })
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(|c| c.ok())
        .find(|c| c.name() == CSRF_COOKIE)
        .map(|c| c.value().to_string())
}

/// Verifies the CSRF token of a state-changing request.
///
/// Safe methods are exempt. The token must be at least
/// [`MIN_CSRF_TOKEN_LENGTH`] characters, and when the browser also sent a
/// `csrf_token` cookie the two must match.
pub fn verify_csrf(method: &Method, headers: &HeaderMap, body: Option<&Value>) -> Result<()> {
    if is_safe_method(method) {
        tracing::debug!("✅ CSRF exemption: {} request", method);
        return Ok(());
    }

    let Some(token) = submitted_token(headers, body) else {
        tracing::warn!("❌ CSRF: token missing");
        return Err(AppError::CsrfInvalid);
    };

    if token.len() < MIN_CSRF_TOKEN_LENGTH {
        tracing::warn!(length = token.len(), "❌ CSRF: token too short");
        return Err(AppError::CsrfInvalid);
    }

    if let Some(cookie) = cookie_token(headers) {
        if !bool::from(cookie.as_bytes().ct_eq(token.as_bytes())) {
            tracing::warn!("❌ CSRF: tokens do not match");
            return Err(AppError::CsrfInvalid);
        }
    }

    tracing::debug!("✅ CSRF token accepted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use serde_json::json;

    const TOKEN: &str = "d2b1c3e4f5a6b7c8d9e0";

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn safe_methods_are_exempt() {
        for method in [Method::GET, Method::HEAD, Method::OPTIONS] {
            assert!(verify_csrf(&method, &HeaderMap::new(), None).is_ok());
        }
        assert!(verify_csrf(&Method::DELETE, &HeaderMap::new(), None).is_err());
    }

    #[test]
    fn header_or_body_token_is_accepted() {
        assert!(verify_csrf(&Method::POST, &headers(&[(CSRF_HEADER, TOKEN)]), None).is_ok());

        let body = json!({ "csrfToken": TOKEN });
        assert!(verify_csrf(&Method::PUT, &HeaderMap::new(), Some(&body)).is_ok());
        let body = json!({ "_csrf": TOKEN });
        assert!(verify_csrf(&Method::PATCH, &HeaderMap::new(), Some(&body)).is_ok());
    }

    #[test]
    fn short_tokens_are_rejected() {
        let result = verify_csrf(&Method::POST, &headers(&[(CSRF_HEADER, "short")]), None);
        assert!(matches!(result, Err(AppError::CsrfInvalid)));
    }

    #[test]
    fn cookie_must_match_when_present() {
        let matching = headers(&[
            (CSRF_HEADER, TOKEN),
            ("cookie", "theme=dark; csrf_token=d2b1c3e4f5a6b7c8d9e0"),
        ]);
        assert!(verify_csrf(&Method::POST, &matching, None).is_ok());

        let mismatched = headers(&[
            (CSRF_HEADER, TOKEN),
            ("cookie", "csrf_token=ffffffffffffffffffff"),
        ]);
        assert!(verify_csrf(&Method::POST, &mismatched, None).is_err());
    }
}
