use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::{Router, body::Body};
use http::{HeaderMap, Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use bastion::{
    app,
    cache::MemoryStore,
    config::{Config, Environment, RateLimitConfig},
    error::Result,
    models::user::{AccessDecision, AuthenticatedUser, ResourceRef, UserContext},
    services::{
        audit::RecordingEventLogger,
        rbac::{RbacResolver, StaticRbac},
        users::{MemoryUserDirectory, NewUser},
    },
    state::{AppState, Collaborators},
};

const BROWSER_UA: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";
const CSRF_TOKEN: &str = "4f3c2b1a0e9d8c7b6a5f";
const ADA_PASSWORD: &str = "correct horse battery";
const BOB_PASSWORD: &str = "purple monkey dishwasher";
const BOB_MFA_CODE: &str = "246810";

/// Counts calls into the default role table.
#[derive(Default)]
struct CountingRbac {
    inner: StaticRbac,
    contexts: AtomicUsize,
    checks: AtomicUsize,
}

impl CountingRbac {
    fn calls(&self) -> usize {
        self.contexts.load(Ordering::SeqCst) + self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RbacResolver for CountingRbac {
    async fn create_user_context(&self, user: &AuthenticatedUser) -> Result<UserContext> {
        self.contexts.fetch_add(1, Ordering::SeqCst);
        self.inner.create_user_context(user).await
    }

    async fn can_access_resource(
        &self,
        user: &UserContext,
        action: &str,
        resource: &ResourceRef,
    ) -> Result<AccessDecision> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.inner.can_access_resource(user, action, resource).await
    }
}

// Shared test context
struct TestContext {
    app: Router,
    state: AppState,
    events: Arc<RecordingEventLogger>,
    rbac: Arc<CountingRbac>,
}

struct TestResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl TestContext {
    async fn new() -> Self {
        Self::with_config(Config::for_environment(Environment::Test, [7u8; 32])).await
    }

    async fn with_config(config: Config) -> Self {
        let events = Arc::new(RecordingEventLogger::new());
        let rbac = Arc::new(CountingRbac::default());

        let users = Arc::new(MemoryUserDirectory::new());
        users
            .insert(NewUser {
                id: Some("user-ada".into()),
                username: "ada".into(),
                password: ADA_PASSWORD.into(),
                email: Some("ada@example.com".into()),
                email_verified: true,
                ..NewUser::default()
            })
            .await
            .unwrap();
        users
            .insert(NewUser {
                id: Some("user-bob".into()),
                username: "bob".into(),
                password: BOB_PASSWORD.into(),
                email: Some("bob@example.com".into()),
                email_verified: true,
                mfa_code: Some(BOB_MFA_CODE.into()),
                ..NewUser::default()
            })
            .await
            .unwrap();

        let state = AppState::from_parts(
            config,
            Arc::new(MemoryStore::new()),
            Collaborators {
                rbac: Some(rbac.clone()),
                events: Some(events.clone()),
                users: Some(users),
                ..Collaborators::default()
            },
        )
        .unwrap();

        Self {
            app: app::router(state.clone()),
            state,
            events,
            rbac,
        }
    }

    fn request(method: Method, uri: &str) -> http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::USER_AGENT, BROWSER_UA)
            .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
    }

    fn authed(method: Method, uri: &str, token: &str) -> http::request::Builder {
        Self::request(method, uri).header(header::AUTHORIZATION, format!("Bearer {}", token))
    }

    fn json_body(builder: http::request::Builder, body: Value) -> Request<Body> {
        builder
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-csrf-token", CSRF_TOKEN)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        TestResponse {
            status,
            headers,
            body,
        }
    }

    async fn login(&self, username: &str, password: &str) -> Value {
        let response = self
            .send(Self::json_body(
                Self::request(Method::POST, "/api/auth/login"),
                json!({ "username": username, "password": password }),
            ))
            .await;
        assert_eq!(response.status, StatusCode::OK, "login failed: {}", response.body);
        response.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn anonymous_endpoint_skips_rbac() {
        let context = TestContext::new().await;

        let response = context
            .send(TestContext::request(Method::GET, "/health").body(Body::empty()).unwrap())
            .await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body["status"], "ok");
        assert_eq!(context.rbac.calls(), 0);
        assert!(response.headers.contains_key("x-request-id"));
        assert_eq!(response.headers["x-risk-score"], "0");
        assert_eq!(response.headers["x-threat-level"], "low");
    }

    #[tokio::test]
    async fn request_ids_are_unique() {
        let context = TestContext::new().await;
        let first = context
            .send(TestContext::request(Method::GET, "/health").body(Body::empty()).unwrap())
            .await;
        let second = context
            .send(TestContext::request(Method::GET, "/health").body(Body::empty()).unwrap())
            .await;
        assert_ne!(first.headers["x-request-id"], second.headers["x-request-id"]);
    }

    #[tokio::test]
    async fn protected_endpoint_requires_authentication() {
        let context = TestContext::new().await;

        let response = context
            .send(TestContext::request(Method::GET, "/api/sessions").body(Body::empty()).unwrap())
            .await;

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.body["code"], "AUTHENTICATION_REQUIRED");
        assert!(response.body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn missing_permission_is_denied_and_logged() {
        let context = TestContext::new().await;
        let login = context.login("ada", ADA_PASSWORD).await;
        let token = login["token"].as_str().unwrap();

        // Own profile is readable through the `read:own` grant.
        let own = context
            .send(
                TestContext::authed(Method::GET, "/api/users/user-ada/profile", token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(own.status, StatusCode::OK);
        assert_eq!(own.body["email"], "ada@example.com");

        let other = context
            .send(
                TestContext::authed(Method::GET, "/api/users/user-bob/profile", token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(other.status, StatusCode::FORBIDDEN);
        assert_eq!(other.body["code"], "ACCESS_DENIED");
        assert_eq!(other.body["reason"], "Permission denied");

        let denied = context.events.authorization_events("access_denied");
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].action.as_deref(), Some("read"));
        assert_eq!(denied[0].user_id.as_deref(), Some("user-ada"));
        let resource = denied[0].resource.as_ref().unwrap();
        assert_eq!(resource.resource_type, "users");
        assert_eq!(resource.owner_id.as_deref(), Some("user-bob"));
    }

    #[tokio::test]
    async fn path_traversal_raises_risk() {
        let context = TestContext::new().await;

        let response = context
            .send(
                TestContext::request(Method::GET, "/api/files/../../etc/passwd")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.headers["x-risk-score"], "30");
        assert_eq!(response.headers["x-threat-level"], "medium");
    }

    #[tokio::test]
    async fn state_changing_request_without_csrf_token_is_rejected() {
        let context = TestContext::new().await;
        let login = context.login("ada", ADA_PASSWORD).await;
        let token = login["token"].as_str().unwrap();

        let rejected = context
            .send(
                TestContext::authed(Method::POST, "/api/sessions/extend", token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(rejected.status, StatusCode::FORBIDDEN);
        assert_eq!(rejected.body["code"], "CSRF_INVALID");
        assert!(rejected.headers.contains_key("x-request-id"));

        let accepted = context
            .send(
                TestContext::authed(Method::POST, "/api/sessions/extend", token)
                    .header("x-csrf-token", CSRF_TOKEN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(accepted.status, StatusCode::OK);
        assert_eq!(accepted.body["extended"], true);
    }

    #[tokio::test]
    async fn rate_limit_returns_retry_after() {
        let mut config = Config::for_environment(Environment::Test, [7u8; 32]);
        config.rate_limit = RateLimitConfig {
            max_requests: 2,
            ..RateLimitConfig::default()
        };
        let context = TestContext::with_config(config).await;

        for _ in 0..2 {
            let ok = context
                .send(TestContext::request(Method::GET, "/health").body(Body::empty()).unwrap())
                .await;
            assert_eq!(ok.status, StatusCode::OK);
        }

        let limited = context
            .send(TestContext::request(Method::GET, "/health").body(Body::empty()).unwrap())
            .await;
        assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limited.body["code"], "RATE_LIMIT_EXCEEDED");
        assert!(limited.headers.contains_key(header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn blocked_ip_is_rejected_before_routing() {
        let mut config = Config::for_environment(Environment::Test, [7u8; 32]);
        config.firewall.blocked_ips.insert("203.0.113.9".to_string());
        let context = TestContext::with_config(config).await;

        let response = context
            .send(
                TestContext::request(Method::GET, "/health")
                    .header("x-real-ip", "203.0.113.9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(response.body["code"], "REQUEST_BLOCKED");
        let blocked = context.events.security_events();
        assert!(blocked.iter().any(|e| e.event == "request_blocked"));
    }

    #[tokio::test]
    async fn blocked_ip_with_forged_token_is_still_blocked() {
        let mut config = Config::for_environment(Environment::Test, [7u8; 32]);
        config.firewall.blocked_ips.insert("203.0.113.9".to_string());
        let context = TestContext::with_config(config).await;

        let forged = format!("{}.{}", "a".repeat(64), "0".repeat(64));
        let response = context
            .send(
                TestContext::authed(Method::GET, "/api/sessions", &forged)
                    .header("x-real-ip", "203.0.113.9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(response.body["code"], "REQUEST_BLOCKED");
        assert!(response.headers.contains_key("x-request-id"));
        assert!(
            !context
                .events
                .security_events()
                .iter()
                .any(|e| e.event == "session_rejected")
        );
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let mut config = Config::for_environment(Environment::Test, [7u8; 32]);
        config.firewall.max_body_bytes = 64;
        let context = TestContext::with_config(config).await;

        let response = context
            .send(TestContext::json_body(
                TestContext::request(Method::POST, "/api/auth/login"),
                json!({ "username": "ada", "password": "x".repeat(128) }),
            ))
            .await;

        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(response.body["reason"], "Request body too large");
    }

    #[tokio::test]
    async fn login_issues_session_and_cookies() {
        let context = TestContext::new().await;

        let response = context
            .send(TestContext::json_body(
                TestContext::request(Method::POST, "/api/auth/login"),
                json!({ "username": "ada", "password": ADA_PASSWORD }),
            ))
            .await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body["mfaRequired"], false);

        let cookies: Vec<_> = response
            .headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        assert!(cookies.iter().any(|c| c.starts_with("session_id=") && c.contains("HttpOnly")));
        assert!(cookies.iter().any(|c| c.starts_with("csrf_token=")));

        let token = response.body["token"].as_str().unwrap();
        let sessions = context
            .send(
                TestContext::authed(Method::GET, "/api/sessions", token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(sessions.status, StatusCode::OK);
        let listed = sessions.body.as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["id"], response.body["sessionId"]);
        assert_eq!(listed[0]["current"], true);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let context = TestContext::new().await;

        let response = context
            .send(TestContext::json_body(
                TestContext::request(Method::POST, "/api/auth/login"),
                json!({ "username": "ada", "password": "not the password" }),
            ))
            .await;

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.body["code"], "AUTHENTICATION_FAILED");
        assert!(
            context
                .events
                .security_events()
                .iter()
                .any(|e| e.event == "login_failed")
        );
    }

    #[tokio::test]
    async fn forged_or_revoked_tokens_are_invalid() {
        let context = TestContext::new().await;

        let forged = context
            .send(
                TestContext::authed(Method::GET, "/api/sessions", &format!("{}.{}", "a".repeat(64), "0".repeat(64)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(forged.status, StatusCode::UNAUTHORIZED);
        assert_eq!(forged.body["code"], "SESSION_INVALID");
        assert!(forged.headers.contains_key("x-request-id"));

        let login = context.login("ada", ADA_PASSWORD).await;
        let token = login["token"].as_str().unwrap();
        let logout = context
            .send(
                TestContext::authed(Method::POST, "/api/auth/logout", token)
                    .header("x-csrf-token", CSRF_TOKEN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(logout.status, StatusCode::OK);

        let revoked = context
            .send(
                TestContext::authed(Method::GET, "/api/sessions", token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(revoked.status, StatusCode::UNAUTHORIZED);
        assert_eq!(revoked.body["reason"], "Session not found");
    }

    #[tokio::test]
    async fn device_trust_requires_verified_mfa() {
        let context = TestContext::new().await;
        let login = context.login("bob", BOB_PASSWORD).await;
        assert_eq!(login["mfaRequired"], true);
        let token = login["token"].as_str().unwrap();
        let session_id = login["sessionId"].as_str().unwrap();

        let devices = context
            .send(
                TestContext::authed(Method::GET, "/api/devices", token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(devices.status, StatusCode::OK);
        let fingerprint = devices.body[0]["fingerprint"].as_str().unwrap().to_string();
        assert_eq!(devices.body[0]["trusted"], false);
        let trust_uri = format!("/api/devices/{}/trust", fingerprint);

        let before = context
            .send(TestContext::json_body(
                TestContext::authed(Method::PUT, &trust_uri, token)
                    .header("x-session-id", session_id),
                json!({ "trusted": true }),
            ))
            .await;
        assert_eq!(before.status, StatusCode::FORBIDDEN);
        assert_eq!(before.body["code"], "MFA_REQUIRED");

        let verify = context
            .send(TestContext::json_body(
                TestContext::authed(Method::POST, "/api/auth/mfa/verify", token),
                json!({ "code": BOB_MFA_CODE }),
            ))
            .await;
        assert_eq!(verify.status, StatusCode::OK);

        let after = context
            .send(TestContext::json_body(
                TestContext::authed(Method::PUT, &trust_uri, token)
                    .header("x-session-id", session_id),
                json!({ "trusted": true }),
            ))
            .await;
        assert_eq!(after.status, StatusCode::OK);
        assert_eq!(after.body["trusted"], true);

        let stored = context
            .state
            .sessions
            .get_device("user-bob", &fingerprint)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.trusted);
    }

    #[tokio::test]
    async fn logout_all_revokes_every_session() {
        let context = TestContext::new().await;
        let first = context.login("ada", ADA_PASSWORD).await;
        let second = context.login("ada", ADA_PASSWORD).await;
        let token = second["token"].as_str().unwrap();

        let response = context
            .send(
                TestContext::authed(Method::POST, "/api/auth/logout-all", token)
                    .header("x-csrf-token", CSRF_TOKEN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body["sessionsRevoked"], 2);

        let old = context
            .send(
                TestContext::authed(Method::GET, "/api/sessions", first["token"].as_str().unwrap())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(old.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn stale_session_cookie_falls_back_to_anonymous() {
        let context = TestContext::new().await;
        let login = context.login("ada", ADA_PASSWORD).await;
        let token = login["token"].as_str().unwrap().to_string();
        let stale_cookie = format!("session_id={}", token);

        let revoked = context
            .send(
                TestContext::authed(Method::POST, "/api/auth/logout-all", &token)
                    .header("x-csrf-token", CSRF_TOKEN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(revoked.status, StatusCode::OK);

        let health = context
            .send(
                TestContext::request(Method::GET, "/health")
                    .header(header::COOKIE, &stale_cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(health.status, StatusCode::OK);
        assert!(
            health
                .headers
                .get_all(header::SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|c| c.starts_with("session_id=") && c.contains("Max-Age=0"))
        );

        let relogin = context
            .send(TestContext::json_body(
                TestContext::request(Method::POST, "/api/auth/login")
                    .header(header::COOKIE, &stale_cookie),
                json!({ "username": "ada", "password": ADA_PASSWORD }),
            ))
            .await;
        assert_eq!(relogin.status, StatusCode::OK);
        assert_ne!(relogin.body["token"], login["token"]);

        let protected = context
            .send(
                TestContext::request(Method::GET, "/api/sessions")
                    .header(header::COOKIE, &stale_cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(protected.status, StatusCode::UNAUTHORIZED);
        assert_eq!(protected.body["code"], "AUTHENTICATION_REQUIRED");
    }

    #[tokio::test]
    async fn cors_echoes_only_allowed_origins() {
        let mut config = Config::for_environment(Environment::Production, [7u8; 32]);
        config
            .cors
            .whitelist
            .insert("https://app.example.com".to_string());
        config
            .cors
            .blacklist
            .insert("https://evil.example.com".to_string());
        let context = TestContext::with_config(config).await;

        let allowed = context
            .send(
                TestContext::request(Method::GET, "/health")
                    .header(header::ORIGIN, "https://app.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(
            allowed.headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.example.com"
        );
        assert_eq!(allowed.headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        // Debug headers stay off in production.
        assert!(!allowed.headers.contains_key("x-risk-score"));
        assert!(allowed.headers.contains_key("x-request-id"));

        for origin in ["https://evil.example.com", "https://unknown.example.org"] {
            let denied = context
                .send(
                    TestContext::request(Method::GET, "/health")
                        .header(header::ORIGIN, origin)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await;
            assert!(!denied.headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
        }
    }
}
