use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use callscribe_platform::auth::decode_auth;
use serde_json::json;
use tracing::warn;

use crate::state::AppState;

/// Shared-secret authentication for every control endpoint except the
/// heartbeat probe.
pub async fn require_app_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path() == "/heartbeat" {
        return next.run(request).await;
    }

    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let ex_app_id = header("EX-APP-ID");
    let auth_header = header("AUTHORIZATION-APP-API");

    if ex_app_id.is_empty() || auth_header.is_empty() {
        warn!(path = %request.uri().path(), "missing auth headers");
        return unauthorized("missing authentication headers");
    }

    if ex_app_id != state.settings.app.id {
        warn!(got = %ex_app_id, "invalid EX-APP-ID");
        return unauthorized("invalid EX-APP-ID");
    }

    let (username, secret) = decode_auth(&auth_header);
    if secret != state.settings.app.secret {
        warn!(%username, "invalid app secret");
        return unauthorized("invalid app secret");
    }

    next.run(request).await
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": message })),
    )
        .into_response()
}
