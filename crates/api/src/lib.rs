pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/heartbeat", get(routes::app::heartbeat))
        .route("/enabled", put(routes::app::set_enabled))
        .route("/enabled", get(routes::app::get_enabled))
        .route("/init", post(routes::app::init))
        .route("/capabilities", get(routes::app::capabilities))
        .route("/api/v1/languages", get(routes::app::languages))
        .route("/api/v1/call/transcribe", post(routes::call::transcribe))
        .route("/api/v1/call/leave", post(routes::call::leave))
        .route("/api/v1/call/set-language", post(routes::call::set_language))
        .route(
            "/api/v1/translation/languages",
            get(routes::translation::languages),
        )
        .route(
            "/api/v1/translation/set-target-language",
            post(routes::translation::set_target_language),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::require_app_auth,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
