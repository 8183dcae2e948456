use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, RawPathParams, Request, State},
    middleware::{Next, from_fn_with_state},
    response::Response,
    routing::MethodRouter,
};

use crate::{
    error::Result,
    models::{policy::SecurityGuardContext, security::SecurityContext, user::AuthenticatedUser},
    services::authorization::{GuardRequest, SESSION_ID_HEADER},
    state::AppState,
};

/// State for one guarded route: the app plus its merged policy.
#[derive(Clone)]
pub struct GuardState {
    pub app: AppState,
    pub policy: Arc<SecurityGuardContext>,
}

/// Evaluates the route's policy before the handler runs.
pub async fn guard(
    State(guard): State<GuardState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    let (mut parts, body) = request.into_parts();

    let path_params: HashMap<String, String> =
        match RawPathParams::from_request_parts(&mut parts, &guard).await {
            Ok(params) => params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            Err(_) => HashMap::new(),
        };

    if let Some(ctx) = parts.extensions.get_mut::<SecurityContext>() {
        guard.app.pipeline.sanitize_path_params(&path_params, ctx);
    }

    let request_view = GuardRequest {
        method: parts.method.as_str(),
        path: parts.uri.path(),
        path_params: &path_params,
        user: parts.extensions.get::<AuthenticatedUser>(),
        security: parts.extensions.get::<SecurityContext>(),
        session_header: parts
            .headers
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
    };
    guard.app.guard.authorize(&guard.policy, &request_view).await?;

    Ok(next.run(Request::from_parts(parts, body)).await)
}

/// Attaches the merged `class` + `handler` policy to a method router and
/// records it in the registry under `route`.
pub fn guarded(
    state: &AppState,
    route: &str,
    class: &SecurityGuardContext,
    handler: &SecurityGuardContext,
    router: MethodRouter<AppState>,
) -> MethodRouter<AppState> {
    let policy = state.policies.register(route, class, handler);
    router.route_layer(from_fn_with_state(
        GuardState {
            app: state.clone(),
            policy,
        },
        guard,
    ))
}
