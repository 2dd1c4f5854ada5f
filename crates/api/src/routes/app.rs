use std::sync::atomic::Ordering;

use axum::extract::{Query, State};
use axum::Json;
use callscribe_transcription::languages;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::state::AppState;

pub async fn heartbeat() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
pub struct EnabledQuery {
    #[serde(default)]
    enabled: String,
}

pub async fn set_enabled(
    State(state): State<AppState>,
    Query(query): Query<EnabledQuery>,
) -> Json<Value> {
    let enabled = query.enabled == "1" || query.enabled == "true";
    state.enabled.store(enabled, Ordering::SeqCst);
    info!(enabled, "app enabled state changed");
    Json(json!({ "error": "" }))
}

pub async fn get_enabled(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "enabled": state.enabled.load(Ordering::SeqCst) }))
}

/// Init handshake with the host platform. Model artifacts are provisioned
/// externally; this verifies what is present on persistent storage and
/// reports completion so the platform can enable the app.
pub async fn init(State(state): State<AppState>) -> Json<Value> {
    info!("init called");

    tokio::spawn(async move {
        let available = state.registry.model_registry().available_languages();
        info!(count = available.len(), "models present on persistent storage");

        if let Err(e) = state.platform.set_init_status(100).await {
            error!(error = %e, "failed to report init status");
        }
    });

    Json(json!({}))
}

pub async fn languages() -> Json<Value> {
    Json(languages::language_map())
}

pub async fn capabilities(State(state): State<AppState>) -> Json<Value> {
    let mut features = vec!["live_transcription"];
    let mut caps = serde_json::Map::new();
    caps.insert("version".into(), json!(state.settings.app.version));
    caps.insert(
        "live_transcription".into(),
        json!({ "supported_languages": languages::language_map() }),
    );

    if let Some(translation_langs) = state.registry.translation_languages("").await {
        features.push("live_translation");
        caps.insert(
            "live_translation".into(),
            json!({ "supported_translation_languages": translation_langs }),
        );
    }

    caps.insert("features".into(), json!(features));

    let mut doc = serde_json::Map::new();
    doc.insert(state.settings.app.id.clone(), Value::Object(caps));
    Json(Value::Object(doc))
}
