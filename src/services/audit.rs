//! Security event logging.
//!
//! Loggers are fire-and-forget: the methods return nothing and must never
//! panic into the request path.

use std::sync::Mutex;

use serde::Serialize;

use crate::models::security::{EventLevel, SecurityEvent};
use crate::models::user::ResourceRef;

/// Details attached to an authorization decision.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationDetails {
    pub user_id: Option<String>,
    pub method: String,
    pub path: String,
    pub action: Option<String>,
    pub resource: Option<ResourceRef>,
    pub reason: Option<String>,
}

/// Details attached to a rate limit decision.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDetails {
    pub route: String,
    pub identifier: String,
    pub limit: u64,
    pub current: u64,
    pub retry_after: u64,
}

pub trait SecurityEventLogger: Send + Sync {
    fn log_security_event(&self, event: &SecurityEvent);

    fn log_authorization_event(&self, event: &str, details: &AuthorizationDetails);

    fn log_rate_limit_event(&self, event: &str, details: &RateLimitDetails);
}

/// Writes every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSecurityLogger;

impl SecurityEventLogger for TracingSecurityLogger {
    fn log_security_event(&self, event: &SecurityEvent) {
        let category = format!("{:?}", event.category);
        let indicators = event.indicators.join(",");
        let user = event.user_id.as_deref().unwrap_or("anonymous");
        let ip = event.ip.as_deref().unwrap_or("-");
        let path = event.path.as_deref().unwrap_or("-");
        let risk = event.risk_score.unwrap_or_default();

        match event.level {
            EventLevel::Info => tracing::info!(
                target: "security",
                category = %category,
                event = %event.event,
                user_id = %user,
                ip = %ip,
                path = %path,
                risk_score = risk,
                indicators = %indicators,
                "{}",
                event.description
            ),
            EventLevel::Warning => tracing::warn!(
                target: "security",
                category = %category,
                event = %event.event,
                user_id = %user,
                ip = %ip,
                path = %path,
                risk_score = risk,
                indicators = %indicators,
                "{}",
                event.description
            ),
            EventLevel::Error | EventLevel::Critical => tracing::error!(
                target: "security",
                category = %category,
                event = %event.event,
                user_id = %user,
                ip = %ip,
                path = %path,
                risk_score = risk,
                indicators = %indicators,
                "{}",
                event.description
            ),
        }
    }

    fn log_authorization_event(&self, event: &str, details: &AuthorizationDetails) {
        let user = details.user_id.as_deref().unwrap_or("anonymous");
        let resource = details
            .resource
            .as_ref()
            .map(|r| r.resource_type.as_str())
            .unwrap_or("-");
        let action = details.action.as_deref().unwrap_or("-");
        let reason = details.reason.as_deref().unwrap_or("-");

        if event == "access_granted" {
            tracing::debug!(
                target: "security",
                event,
                user_id = %user,
                method = %details.method,
                path = %details.path,
                "✅ Access granted"
            );
        } else {
            tracing::warn!(
                target: "security",
                event,
                user_id = %user,
                method = %details.method,
                path = %details.path,
                resource = %resource,
                action = %action,
                reason = %reason,
                "🚫 Authorization denied"
            );
        }
    }

    fn log_rate_limit_event(&self, event: &str, details: &RateLimitDetails) {
        tracing::warn!(
            target: "security",
            event,
            route = %details.route,
            identifier = %details.identifier,
            limit = details.limit,
            current = details.current,
            retry_after = details.retry_after,
            "⏱️ Rate limit triggered"
        );
    }
}

/// One event captured by [`RecordingEventLogger`].
#[derive(Debug, Clone)]
pub enum RecordedEvent {
    Security(SecurityEvent),
    Authorization(String, AuthorizationDetails),
    RateLimit(String, RateLimitDetails),
}

/// Keeps events in memory so callers can inspect what was logged.
#[derive(Debug, Default)]
pub struct RecordingEventLogger {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Authorization events with the given name.
    pub fn authorization_events(&self, name: &str) -> Vec<AuthorizationDetails> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::Authorization(event, details) if event == name => Some(details),
                _ => None,
            })
            .collect()
    }

    pub fn security_events(&self) -> Vec<SecurityEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::Security(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: RecordedEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl SecurityEventLogger for RecordingEventLogger {
    fn log_security_event(&self, event: &SecurityEvent) {
        self.push(RecordedEvent::Security(event.clone()));
    }

    fn log_authorization_event(&self, event: &str, details: &AuthorizationDetails) {
        self.push(RecordedEvent::Authorization(event.to_string(), details.clone()));
    }

    fn log_rate_limit_event(&self, event: &str, details: &RateLimitDetails) {
        self.push(RecordedEvent::RateLimit(event.to_string(), details.clone()));
    }
}
