use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post, put},
};
use tower_cookies::CookieManagerLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};
use tracing::Level;

use crate::{
    error::AppError,
    handlers::{auth, sessions},
    middleware_layer::{auth::authenticate, cors::cors_layer, firewall::firewall, guard::guarded},
    models::policy::SecurityGuardContext,
    state::AppState,
};

async fn fallback() -> AppError {
    AppError::NotFound
}

/// Builds the HTTP surface with the full security stack.
///
/// Layers, outermost first: tracing, cookies, CORS, the risk pipeline,
/// authentication, then each route's guard.
pub fn router(state: AppState) -> Router {
    let public = SecurityGuardContext::anonymous();
    let authenticated = SecurityGuardContext::new();
    let none = SecurityGuardContext::new();

    let routes = Router::new()
        .route(
            "/health",
            guarded(&state, "GET /health", &public, &none, get(sessions::health)),
        )
        .route(
            "/api/auth/csrf",
            guarded(&state, "GET /api/auth/csrf", &public, &none, get(auth::csrf_token)),
        )
        .route(
            "/api/auth/login",
            guarded(&state, "POST /api/auth/login", &public, &none, post(auth::login)),
        )
        .route(
            "/api/auth/logout",
            guarded(
                &state,
                "POST /api/auth/logout",
                &authenticated,
                &none,
                post(auth::logout),
            ),
        )
        .route(
            "/api/auth/logout-all",
            guarded(
                &state,
                "POST /api/auth/logout-all",
                &authenticated,
                &none,
                post(auth::logout_all),
            ),
        )
        .route(
            "/api/auth/mfa/verify",
            guarded(
                &state,
                "POST /api/auth/mfa/verify",
                &authenticated,
                &none,
                post(auth::verify_mfa),
            ),
        )
        .route(
            "/api/sessions",
            guarded(
                &state,
                "GET /api/sessions",
                &authenticated,
                &none,
                get(sessions::list_sessions),
            ),
        )
        .route(
            "/api/sessions/extend",
            guarded(
                &state,
                "POST /api/sessions/extend",
                &authenticated,
                &none,
                post(sessions::extend_session),
            ),
        )
        .route(
            "/api/devices",
            guarded(
                &state,
                "GET /api/devices",
                &authenticated,
                &none,
                get(sessions::list_devices),
            ),
        )
        .route(
            "/api/devices/{fingerprint}/trust",
            guarded(
                &state,
                "PUT /api/devices/{fingerprint}/trust",
                &authenticated,
                &SecurityGuardContext::new().require_mfa(true).risk_threshold(50),
                put(sessions::trust_device),
            ),
        )
        .route(
            "/api/users/{userId}/profile",
            guarded(
                &state,
                "GET /api/users/{userId}/profile",
                &authenticated,
                &SecurityGuardContext::new().permissions(["read"]),
                get(sessions::user_profile),
            ),
        )
        .fallback(fallback);

    tracing::debug!(policies = state.policies.len(), "✅ Route policies registered");

    routes
        .layer(from_fn_with_state(state.clone(), authenticate))
        .layer(from_fn_with_state(state.clone(), firewall))
        .layer(cors_layer(state.origins.clone(), state.events.clone()))
        .layer(CookieManagerLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true))
                .on_request(DefaultOnRequest::default().level(Level::DEBUG))
                .on_response(DefaultOnResponse::default().level(Level::DEBUG))
                .on_failure(DefaultOnFailure::default().level(Level::ERROR)),
        )
        .with_state(state)
}
