//! The per-request risk pipeline.
//!
//! Stages run in the order of [`STAGES`] over a [`RequestSnapshot`] and fill
//! in a [`SecurityContext`]. A policy violation stops the pipeline with its
//! error. Any other failure inside a stage is logged as a system-integrity
//! event and the remaining stages still run.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use http::{HeaderMap, Method, header};
use serde_json::Value;
use uuid::Uuid;

use crate::config::FirewallConfig;
use crate::error::AppError;
use crate::middleware_layer::csrf;
use crate::models::security::{
    EventCategory, EventLevel, SecurityContext, SecurityEvent, ThreatLevel,
};
use crate::services::audit::SecurityEventLogger;
use crate::services::rate_limit::RateLimiter;
use crate::services::sanitizer::{
    DEFAULT_MAX_DEPTH, SanitizationRules, TextOptions, sanitize_object, sanitize_text,
};
use crate::services::threat::{self, SUSPICIOUS_IP_WEIGHT};

/// Everything the pipeline looks at, detached from the HTTP framework.
#[derive(Debug, Clone, Default)]
pub struct RequestSnapshot {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub peer: Option<SocketAddr>,
    /// Parsed JSON or form body.
    pub body: Option<Value>,
    /// Set when the body could not be read within the size limit.
    pub body_overflow: bool,
    pub path_params: HashMap<String, String>,
    /// Session id carried by a correctly signed token. Not checked against the store.
    pub session_id: Option<String>,
}

impl RequestSnapshot {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            ..Self::default()
        }
    }

    fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn declared_length(&self) -> Option<u64> {
        self.header(header::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ClientIp,
    UserAgent,
    BodySize,
    RateLimit,
    Sanitization,
    PatternDetection,
    Csrf,
    Fingerprint,
    RiskLogging,
}

/// Stage execution order.
pub const STAGES: [Stage; 9] = [
    Stage::ClientIp,
    Stage::UserAgent,
    Stage::BodySize,
    Stage::RateLimit,
    Stage::Sanitization,
    Stage::PatternDetection,
    Stage::Csrf,
    Stage::Fingerprint,
    Stage::RiskLogging,
];

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::ClientIp => "client_ip",
            Stage::UserAgent => "user_agent",
            Stage::BodySize => "body_size",
            Stage::RateLimit => "rate_limit",
            Stage::Sanitization => "sanitization",
            Stage::PatternDetection => "pattern_detection",
            Stage::Csrf => "csrf",
            Stage::Fingerprint => "fingerprint",
            Stage::RiskLogging => "risk_logging",
        }
    }
}

enum StageError {
    Violation(AppError),
    Fault(String),
}

impl From<AppError> for StageError {
    fn from(err: AppError) -> Self {
        if err.is_policy_violation() {
            StageError::Violation(err)
        } else {
            StageError::Fault(err.to_string())
        }
    }
}

type StageResult = std::result::Result<(), StageError>;

/// The outcome of [`RiskPipeline::inspect`]. The context is returned in
/// both cases so the caller can still tag the response.
pub type Inspection = std::result::Result<SecurityContext, (SecurityContext, AppError)>;

fn sanitize_params(params: &HashMap<String, String>) -> HashMap<String, String> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), sanitize_text(v, TextOptions::default())))
        .collect()
}

pub struct RiskPipeline {
    config: FirewallConfig,
    rate_limiter: Arc<dyn RateLimiter>,
    events: Arc<dyn SecurityEventLogger>,
    rules: SanitizationRules,
}

impl RiskPipeline {
    pub fn new(
        config: FirewallConfig,
        rate_limiter: Arc<dyn RateLimiter>,
        events: Arc<dyn SecurityEventLogger>,
    ) -> Self {
        let fields = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<HashSet<_>>();
        let rules = SanitizationRules {
            email_fields: fields(&["email"]),
            url_fields: fields(&["url", "website", "homepage"]),
            ..SanitizationRules::default()
        };

        Self {
            config,
            rate_limiter,
            events,
            rules,
        }
    }

    pub fn config(&self) -> &FirewallConfig {
        &self.config
    }

    fn enabled(&self, stage: Stage) -> bool {
        match stage {
            Stage::ClientIp | Stage::BodySize | Stage::RiskLogging => true,
            Stage::UserAgent => self.config.enable_user_agent_checks,
            Stage::RateLimit => self.config.enable_rate_limit,
            Stage::Sanitization => self.config.enable_sanitization,
            Stage::PatternDetection => self.config.enable_pattern_detection,
            Stage::Csrf => self.config.enable_csrf,
            Stage::Fingerprint => self.config.enable_fingerprinting,
        }
    }

    /// Runs every enabled stage in order.
    pub async fn inspect(&self, request: &RequestSnapshot) -> Inspection {
        let mut ctx = SecurityContext::new(Uuid::new_v4().to_string());

        for stage in STAGES {
            if !self.enabled(stage) {
                continue;
            }
            match self.run_stage(stage, request, &mut ctx).await {
                Ok(()) => {}
                Err(StageError::Violation(err)) => {
                    self.block(request, &mut ctx, stage, &err);
                    return Err((ctx, err));
                }
                Err(StageError::Fault(message)) => {
                    self.report_fault(request, &ctx, stage.name(), &message);
                }
            }
        }

        tracing::debug!(
            request_id = %ctx.request_id,
            risk_score = ctx.risk_score(),
            threat_level = %ctx.threat_level(),
            "✅ Request inspected"
        );
        Ok(ctx)
    }

    async fn run_stage(
        &self,
        stage: Stage,
        request: &RequestSnapshot,
        ctx: &mut SecurityContext,
    ) -> StageResult {
        match stage {
            Stage::ClientIp => self.check_client_ip(request, ctx),
            Stage::UserAgent => {
                let user_agent = ctx.user_agent.clone();
                threat::score_user_agent(user_agent.as_deref(), ctx);
                Ok(())
            }
            Stage::BodySize => self.check_body_size(request),
            Stage::RateLimit => {
                let identifier = match &request.session_id {
                    Some(id) => format!("session:{}", id),
                    None => ctx.client_ip.clone(),
                };
                match self.rate_limiter.enforce_rate_limit(&request.path, &identifier).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_policy_violation() => Err(StageError::Violation(err)),
                    Err(err) => {
                        self.report_fault(request, ctx, stage.name(), &err.to_string());
                        Err(StageError::Violation(AppError::ServiceUnavailable(
                            "rate_limiter_unavailable".to_string(),
                        )))
                    }
                }
            }
            Stage::Sanitization => {
                self.sanitize(request, ctx);
                Ok(())
            }
            Stage::PatternDetection => {
                let found = threat::detect_patterns(
                    &request.method,
                    &request.path,
                    request.query.as_deref(),
                    &request.headers,
                );
                for pattern in found {
                    tracing::debug!(pattern = pattern.name(), path = %request.path, "🔍 Suspicious pattern");
                    ctx.add_risk(pattern.name(), pattern.weight());
                }
                Ok(())
            }
            Stage::Csrf => csrf::verify_csrf(&request.method, &request.headers, request.body.as_ref())
                .map_err(StageError::from),
            Stage::Fingerprint => {
                let language = request.header(header::ACCEPT_LANGUAGE).unwrap_or_default();
                let user_agent = ctx.user_agent.as_deref().unwrap_or_default();
                ctx.device_fingerprint =
                    Some(threat::device_fingerprint(user_agent, &ctx.client_ip, language));
                Ok(())
            }
            Stage::RiskLogging => {
                self.log_high_risk(request, ctx);
                Ok(())
            }
        }
    }

    fn check_client_ip(&self, request: &RequestSnapshot, ctx: &mut SecurityContext) -> StageResult {
        ctx.client_ip = threat::resolve_client_ip(&request.headers, request.peer);
        ctx.user_agent = request.header(header::USER_AGENT).map(str::to_string);

        if !self.config.enable_ip_checks {
            return Ok(());
        }
        if self.config.blocked_ips.contains(&ctx.client_ip) {
            return Err(StageError::Violation(AppError::RequestBlocked(
                "IP address is blocked".to_string(),
            )));
        }
        if self.config.suspicious_ips.contains(&ctx.client_ip) {
            ctx.add_risk("suspicious_ip", SUSPICIOUS_IP_WEIGHT);
        }
        Ok(())
    }

    fn check_body_size(&self, request: &RequestSnapshot) -> StageResult {
        let limit = self.config.max_body_bytes as u64;
        let declared_too_large = request.declared_length().is_some_and(|len| len > limit);

        if declared_too_large || request.body_overflow {
            return Err(StageError::Violation(AppError::RequestBlocked(
                "Request body too large".to_string(),
            )));
        }
        Ok(())
    }

    fn sanitize(&self, request: &RequestSnapshot, ctx: &mut SecurityContext) {
        ctx.sanitized_body = request
            .body
            .as_ref()
            .map(|body| sanitize_object(body, &self.rules, DEFAULT_MAX_DEPTH));

        ctx.sanitized_query = request
            .query
            .as_deref()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), sanitize_text(&v, TextOptions::default())))
                    .collect()
            })
            .unwrap_or_default();

        ctx.sanitized_params = sanitize_params(&request.path_params);
    }

    /// Fills in the sanitized path parameters once routing has matched them.
    pub fn sanitize_path_params(&self, params: &HashMap<String, String>, ctx: &mut SecurityContext) {
        if self.config.enable_sanitization {
            ctx.sanitized_params = sanitize_params(params);
        }
    }

    fn log_high_risk(&self, request: &RequestSnapshot, ctx: &SecurityContext) {
        if ctx.risk_score() <= self.config.risk_log_threshold {
            return;
        }
        let level = if ctx.threat_level() == ThreatLevel::Critical {
            EventLevel::Critical
        } else {
            EventLevel::Warning
        };
        let event = SecurityEvent::new(
            level,
            EventCategory::Firewall,
            "high_risk_request",
            format!("Request scored {} ({})", ctx.risk_score(), ctx.threat_level()),
        )
        .with_request(request.method.as_str(), &request.path, &ctx.client_ip)
        .with_security(ctx);
        self.events.log_security_event(&event);
    }

    fn block(&self, request: &RequestSnapshot, ctx: &mut SecurityContext, stage: Stage, err: &AppError) {
        let reason = match err {
            AppError::RequestBlocked(reason) | AppError::ServiceUnavailable(reason) => reason.clone(),
            other => other.code().to_lowercase(),
        };
        ctx.block(reason.clone());

        let event = SecurityEvent::new(
            EventLevel::Warning,
            EventCategory::Firewall,
            "request_blocked",
            format!("Blocked at {} stage: {}", stage.name(), reason),
        )
        .with_request(request.method.as_str(), &request.path, &ctx.client_ip)
        .with_security(ctx);
        self.events.log_security_event(&event);
    }

    /// Logs a failure of the pipeline itself. The request is not blocked.
    pub fn report_fault(
        &self,
        request: &RequestSnapshot,
        ctx: &SecurityContext,
        stage: &str,
        message: &str,
    ) {
        tracing::error!(stage, error = %message, path = %request.path, "❌ Firewall stage failed");
        let event = SecurityEvent::new(
            EventLevel::Error,
            EventCategory::SystemIntegrity,
            "firewall_error",
            format!("Firewall stage {} failed", stage),
        )
        .with_request(request.method.as_str(), &request.path, &ctx.client_ip);
        self.events.log_security_event(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::config::RateLimitConfig;
    use crate::error::Result;
    use crate::services::audit::RecordingEventLogger;
    use crate::services::rate_limit::StoreRateLimiter;
    use async_trait::async_trait;
    use http::HeaderValue;
    use serde_json::json;

    const BROWSER_UA: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/126.0 Safari/537.36";

    struct FailingLimiter;

    #[async_trait]
    impl RateLimiter for FailingLimiter {
        async fn enforce_rate_limit(&self, _route: &str, _identifier: &str) -> Result<()> {
            Err(AppError::Store("connection reset".to_string()))
        }
    }

    fn pipeline(config: FirewallConfig) -> (RiskPipeline, Arc<RecordingEventLogger>) {
        let events = Arc::new(RecordingEventLogger::new());
        let limiter = StoreRateLimiter::new(
            Arc::new(MemoryStore::new()),
            &RateLimitConfig::default(),
            events.clone(),
        );
        (RiskPipeline::new(config, Arc::new(limiter), events.clone()), events)
    }

    fn get(path: &str) -> RequestSnapshot {
        let mut request = RequestSnapshot::new(Method::GET, path);
        request
            .headers
            .insert(header::USER_AGENT, HeaderValue::from_static(BROWSER_UA));
        request.peer = Some("203.0.113.7:5000".parse().unwrap());
        request
    }

    #[test]
    fn stages_run_in_documented_order() {
        let names: Vec<_> = STAGES.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            [
                "client_ip",
                "user_agent",
                "body_size",
                "rate_limit",
                "sanitization",
                "pattern_detection",
                "csrf",
                "fingerprint",
                "risk_logging"
            ]
        );
    }

    #[tokio::test]
    async fn clean_request_passes_with_zero_risk() {
        let (pipeline, events) = pipeline(FirewallConfig::default());
        let ctx = pipeline.inspect(&get("/api/sessions?page=2")).await.unwrap();

        assert_eq!(ctx.risk_score(), 0);
        assert_eq!(ctx.client_ip, "203.0.113.7");
        assert_eq!(ctx.sanitized_query.get("page").map(String::as_str), Some("2"));
        assert_eq!(ctx.device_fingerprint.as_ref().map(String::len), Some(32));
        assert!(events.events().is_empty());
    }

    #[tokio::test]
    async fn path_traversal_adds_its_weight() {
        let (pipeline, _) = pipeline(FirewallConfig::default());
        let ctx = pipeline
            .inspect(&get("/api/files/../../etc/passwd"))
            .await
            .unwrap();

        assert!(ctx.has_indicator("path_traversal_attempt"));
        assert_eq!(ctx.risk_score(), 30);
        assert_eq!(ctx.threat_level(), ThreatLevel::Medium);
    }

    #[tokio::test]
    async fn blocked_ip_stops_before_later_stages() {
        let mut config = FirewallConfig::default();
        config.blocked_ips.insert("203.0.113.7".to_string());
        let (pipeline, events) = pipeline(config);

        let (ctx, err) = pipeline.inspect(&get("/wp-admin")).await.unwrap_err();
        assert!(matches!(err, AppError::RequestBlocked(_)));
        assert!(ctx.blocked);
        assert!(!ctx.has_indicator("admin_path_probe"));
        assert_eq!(events.security_events()[0].event, "request_blocked");
    }

    #[tokio::test]
    async fn suspicious_ip_adds_risk() {
        let mut config = FirewallConfig::default();
        config.suspicious_ips.insert("203.0.113.7".to_string());
        let (pipeline, _) = pipeline(config);

        let ctx = pipeline.inspect(&get("/health")).await.unwrap();
        assert!(ctx.has_indicator("suspicious_ip"));
        assert_eq!(ctx.risk_score(), SUSPICIOUS_IP_WEIGHT);
    }

    #[tokio::test]
    async fn oversized_body_is_blocked() {
        let mut config = FirewallConfig::default();
        config.max_body_bytes = 10;
        let (pipeline, _) = pipeline(config);

        let mut request = get("/api/auth/login");
        request
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("11"));
        let (_, err) = pipeline.inspect(&request).await.unwrap_err();
        assert!(matches!(err, AppError::RequestBlocked(ref r) if r == "Request body too large"));
    }

    #[tokio::test]
    async fn state_changing_requests_need_a_csrf_token() {
        let (pipeline, _) = pipeline(FirewallConfig::default());

        let mut request = get("/api/sessions/extend");
        request.method = Method::POST;
        let (_, err) = pipeline.inspect(&request).await.unwrap_err();
        assert!(matches!(err, AppError::CsrfInvalid));

        request.body = Some(json!({ "_csrf": "0123456789abcdef0123" }));
        assert!(pipeline.inspect(&request).await.is_ok());
    }

    #[tokio::test]
    async fn body_is_sanitized_into_shadow_copy() {
        let mut config = FirewallConfig::default();
        config.enable_csrf = false;
        let (pipeline, _) = pipeline(config);

        let mut request = get("/api/profile");
        request.method = Method::PUT;
        let original = json!({ "bio": "<b>hi</b>", "email": " Ada@Example.COM " });
        request.body = Some(original.clone());

        let ctx = pipeline.inspect(&request).await.unwrap();
        assert_eq!(request.body, Some(original));
        let shadow = ctx.sanitized_body.unwrap();
        assert!(!shadow["bio"].as_str().unwrap().contains('<'));
        assert_eq!(shadow["email"], "ada@example.com");
    }

    #[tokio::test]
    async fn limiter_outage_fails_closed() {
        let events = Arc::new(RecordingEventLogger::new());
        let pipeline = RiskPipeline::new(
            FirewallConfig::default(),
            Arc::new(FailingLimiter),
            events.clone(),
        );

        let (ctx, err) = pipeline.inspect(&get("/health")).await.unwrap_err();
        assert!(ctx.blocked);
        assert_eq!(ctx.block_reason.as_deref(), Some("rate_limiter_unavailable"));
        assert_eq!(err.status(), http::StatusCode::SERVICE_UNAVAILABLE);
        assert!(matches!(err, AppError::ServiceUnavailable(ref r) if r == "rate_limiter_unavailable"));

        let logged = events.security_events();
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[0].category, EventCategory::SystemIntegrity);
        assert_eq!(logged[1].event, "request_blocked");
    }

    #[tokio::test]
    async fn signed_session_is_limited_apart_from_its_address() {
        let rate = RateLimitConfig {
            max_requests: 1,
            ..RateLimitConfig::default()
        };
        let events = Arc::new(RecordingEventLogger::new());
        let limiter = StoreRateLimiter::new(Arc::new(MemoryStore::new()), &rate, events.clone());
        let pipeline = RiskPipeline::new(FirewallConfig::default(), Arc::new(limiter), events);

        let mut with_session = get("/api/data");
        with_session.session_id = Some("sess-1".to_string());
        assert!(pipeline.inspect(&with_session).await.is_ok());
        assert!(pipeline.inspect(&get("/api/data")).await.is_ok());

        let (_, err) = pipeline.inspect(&with_session).await.unwrap_err();
        assert!(matches!(err, AppError::RateLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn high_risk_requests_are_logged() {
        let (pipeline, events) = pipeline(FirewallConfig::default());
        let mut request = get("/admin.php?id=1%20UNION%20SELECT%20password");
        request.headers.remove(header::USER_AGENT);

        let ctx = pipeline.inspect(&request).await.unwrap();
        assert!(ctx.risk_score() > 50);
        let logged = events.security_events();
        assert_eq!(logged.last().map(|e| e.event.as_str()), Some("high_risk_request"));
    }
}
