use std::sync::Arc;
use std::time::Duration;

use http::{HeaderName, HeaderValue, Method, header, request::Parts};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::middleware_layer::csrf::CSRF_HEADER;
use crate::middleware_layer::firewall::{REQUEST_ID_HEADER, RISK_SCORE_HEADER, THREAT_LEVEL_HEADER};
use crate::models::security::{EventCategory, EventLevel, SecurityEvent};
use crate::services::audit::SecurityEventLogger;
use crate::services::authorization::SESSION_ID_HEADER;
use crate::services::origin::OriginValidator;

/// Builds the CORS layer around the origin validator.
///
/// Allowed origins are echoed back with credentials when configured; denied
/// origins get no CORS headers at all and a `cors` security event.
pub fn cors_layer(
    validator: Arc<OriginValidator>,
    events: Arc<dyn SecurityEventLogger>,
) -> CorsLayer {
    let allow_credentials = validator.allows_credentials();

    let predicate = move |origin: &HeaderValue, parts: &Parts| {
        let decision = validator.validate(origin.to_str().ok());
        if !decision.allowed {
            let event = SecurityEvent::new(
                EventLevel::Warning,
                EventCategory::Cors,
                "origin_rejected",
                format!(
                    "Origin {} rejected: {}",
                    origin.to_str().unwrap_or("<non-ascii>"),
                    decision.reason.as_str()
                ),
            )
            .with_request(parts.method.as_str(), parts.uri.path(), "-");
            events.log_security_event(&event);
        }
        decision.allowed
    };

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(predicate))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::COOKIE,
            HeaderName::from_static(CSRF_HEADER),
            HeaderName::from_static(SESSION_ID_HEADER),
        ])
        .allow_credentials(allow_credentials)
        .expose_headers([
            HeaderName::from_static(CSRF_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderName::from_static(RISK_SCORE_HEADER),
            HeaderName::from_static(THREAT_LEVEL_HEADER),
        ])
        .max_age(Duration::from_secs(86400))
}
