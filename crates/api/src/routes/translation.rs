use axum::extract::{Query, State};
use axum::Json;
use callscribe_translation::TranslateError;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::error::ApiError;
use crate::routes::MessageResponse;
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguagesQuery {
    #[serde(default)]
    pub room_token: String,
}

pub async fn languages(
    State(state): State<AppState>,
    Query(query): Query<LanguagesQuery>,
) -> Json<Value> {
    match state.registry.translation_languages(&query.room_token).await {
        Some(langs) => Json(json!(langs)),
        None => Json(json!({
            "origin_languages": {},
            "target_languages": {},
        })),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTargetLanguageRequest {
    pub room_token: String,
    pub platform_sid: String,
    #[serde(default)]
    pub lang_id: Option<String>,
}

pub async fn set_target_language(
    State(state): State<AppState>,
    Json(request): Json<SetTargetLanguageRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .registry
        .set_target_language(
            &request.room_token,
            &request.platform_sid,
            request.lang_id.as_deref(),
        )
        .await
        .map_err(|e| {
            error!(error = %e, "set target language failed");
            match e.downcast_ref::<TranslateError>() {
                Some(TranslateError::LangPair(msg)) => ApiError::BadRequest(msg.clone()),
                _ => ApiError::Internal(
                    "Failed to set the target translation language for the participant.".to_string(),
                ),
            }
        })?;

    Ok(Json(MessageResponse::new(
        "Target translation language set successfully for the participant.",
    )))
}
