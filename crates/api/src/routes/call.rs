use axum::extract::State;
use axum::Json;
use callscribe_transcription::languages;
use serde::Deserialize;
use tracing::error;

use crate::error::ApiError;
use crate::routes::MessageResponse;
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeRequest {
    pub room_token: String,
    pub platform_sid: String,
    #[serde(default)]
    pub enable: Option<bool>,
    #[serde(default)]
    pub lang_id: Option<String>,
}

pub async fn transcribe(
    State(state): State<AppState>,
    Json(request): Json<TranscribeRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let enable = request.enable.unwrap_or(true);
    let lang_id = match request.lang_id.as_deref() {
        Some(lang) if !lang.is_empty() => lang,
        _ => "en",
    };

    state
        .registry
        .transcribe_req(&request.room_token, &request.platform_sid, lang_id, enable)
        .await
        .map_err(|e| {
            error!(error = %e, room_token = %request.room_token, "transcribe request failed");
            ApiError::Unavailable(e.to_string())
        })?;

    Ok(Json(MessageResponse::new(
        "Transcription request processed successfully.",
    )))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequest {
    pub room_token: String,
}

pub async fn leave(
    State(state): State<AppState>,
    Json(request): Json<LeaveRequest>,
) -> Json<MessageResponse> {
    state.registry.leave_call(&request.room_token).await;
    Json(MessageResponse::new("Leave call request processed."))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLanguageRequest {
    pub room_token: String,
    #[serde(default)]
    pub lang_id: String,
}

pub async fn set_language(
    State(state): State<AppState>,
    Json(request): Json<SetLanguageRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    if request.lang_id.is_empty() || !languages::is_supported(&request.lang_id) {
        return Err(ApiError::BadRequest(
            "Invalid or unsupported language ID provided.".to_string(),
        ));
    }

    state
        .registry
        .set_call_language(&request.room_token, &request.lang_id)
        .await
        .map_err(|e| {
            error!(error = %e, "set call language failed");
            ApiError::Internal("Failed to set language for the call".to_string())
        })?;

    Ok(Json(MessageResponse::new(
        "Language set successfully for the call",
    )))
}
