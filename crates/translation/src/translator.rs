use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use callscribe_platform::PlatformClient;
use callscribe_transcription::languages;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub const TRANSLATE_TASK_TYPE: &str = "core:text2text:translate";
const AUTO_DETECT_ORIGIN: &str = "detect_language";

const SCHEDULE_RETRIES: u32 = 3;
const SCHEDULE_RETRY_DELAY: Duration = Duration::from_secs(2);
const TASK_TYPES_CACHE_TTL: Duration = Duration::from_secs(15 * 60);
const MAX_POLLS: u32 = 360;

#[derive(Debug, Error)]
pub enum TranslateError {
    /// No provider installed or the task types cannot be fetched; the pair
    /// stays inactive.
    #[error("translation unavailable: {0}")]
    Fatal(String),
    /// The origin/target combination is not offered by the provider.
    #[error("unsupported language pair: {0}")]
    LangPair(String),
    /// Transient failure after exhausting the operation's retry budget.
    #[error("translation failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SupportedTranslationLanguages {
    pub origin_languages: Value,
    pub target_languages: Value,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    task: Task,
}

#[derive(Debug, Deserialize)]
struct Task {
    #[serde(default)]
    id: i64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    output: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
struct InputShapeEnum {
    #[allow(dead_code)]
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TaskType {
    #[serde(rename = "inputShapeEnumValues", default)]
    input_shape_enum_values: HashMap<String, Vec<InputShapeEnum>>,
}

#[derive(Debug, Clone, Deserialize)]
struct TaskTypesResponse {
    #[serde(default)]
    types: HashMap<String, TaskType>,
}

/// One origin -> target translation channel over the host platform's
/// task-processing API: schedule a task, then poll it to completion.
pub struct TaskTranslator {
    client: PlatformClient,
    origin_lang: String,
    target_lang: String,
    room_token: String,
    /// Origin actually sent to the API; rewritten to the auto-detect sentinel
    /// when the provider does not list the room language.
    effective_origin: Mutex<String>,
    /// Platform session ids whose owners receive this translation.
    sessions: Mutex<HashSet<String>>,
    task_types_cache: Mutex<Option<(Instant, TaskTypesResponse)>>,
}

impl TaskTranslator {
    pub fn new(
        client: PlatformClient,
        origin_lang: impl Into<String>,
        target_lang: impl Into<String>,
        room_token: impl Into<String>,
    ) -> Self {
        let origin_lang = origin_lang.into();
        Self {
            client,
            effective_origin: Mutex::new(origin_lang.clone()),
            origin_lang,
            target_lang: target_lang.into(),
            room_token: room_token.into(),
            sessions: Mutex::new(HashSet::new()),
            task_types_cache: Mutex::new(None),
        }
    }

    pub fn origin_lang(&self) -> &str {
        &self.origin_lang
    }

    pub fn target_lang(&self) -> &str {
        &self.target_lang
    }

    pub fn add_session(&self, platform_sid: &str) {
        self.sessions.lock().unwrap().insert(platform_sid.to_string());
    }

    pub fn remove_session(&self, platform_sid: &str) {
        self.sessions.lock().unwrap().remove(platform_sid);
    }

    pub fn has_sessions(&self) -> bool {
        !self.sessions.lock().unwrap().is_empty()
    }

    pub fn session_ids(&self) -> HashSet<String> {
        self.sessions.lock().unwrap().clone()
    }

    /// Translates one message: schedule with bounded retries, then poll.
    pub async fn translate(&self, message: &str) -> Result<String, TranslateError> {
        let origin = self.effective_origin.lock().unwrap().clone();
        let body = serde_json::json!({
            "type": TRANSLATE_TASK_TYPE,
            "appId": self.client.app_id(),
            "customId": format!("lt-{}-{}-{}", self.room_token, self.origin_lang, self.target_lang),
            "input": {
                "input": message,
                "origin_language": origin,
                "target_language": self.target_lang,
            },
        });

        let mut last_err = String::new();
        for tries_left in (0..SCHEDULE_RETRIES).rev() {
            let data = match self
                .client
                .ocs_post("/ocs/v2.php/taskprocessing/tasks_consumer/schedule", "admin", &body)
                .await
            {
                Ok(data) => data,
                Err(e) => {
                    last_err = e.to_string();
                    warn!(error = %e, tries_left, "task scheduling failed, retrying");
                    tokio::time::sleep(SCHEDULE_RETRY_DELAY).await;
                    continue;
                }
            };

            let resp: TaskResponse = serde_json::from_value(data)
                .map_err(|e| TranslateError::Failed(format!("parse schedule response: {e}")))?;
            return self.poll_task(resp.task.id).await;
        }

        Err(TranslateError::Failed(format!(
            "scheduling failed after retries: {last_err}"
        )))
    }

    /// Polls one task to completion. Early polls back off 1,2,4,5,5,... s;
    /// after 180 polls the interval grows to 10 s. Gives up after
    /// [`MAX_POLLS`] polls (about 30 minutes).
    async fn poll_task(&self, task_id: i64) -> Result<String, TranslateError> {
        let path = format!("/ocs/v1.php/taskprocessing/tasks_consumer/task/{task_id}");

        for poll in 0..MAX_POLLS {
            let wait = match poll {
                0..=2 => 1u64 << poll,
                3..=179 => 5,
                _ => 10,
            };
            tokio::time::sleep(Duration::from_secs(wait)).await;

            let data = match self.client.ocs_get(&path, "admin").await {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, poll, "task poll error");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            // A malformed poll response is tolerated; the next poll retries.
            let Ok(resp) = serde_json::from_value::<TaskResponse>(data) else {
                continue;
            };

            match resp.task.status.as_str() {
                "STATUS_SUCCESSFUL" => {
                    let output = resp
                        .task
                        .output
                        .ok_or_else(|| TranslateError::Failed("no output in task result".into()))?;
                    return output
                        .get("output")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .ok_or_else(|| {
                            TranslateError::Failed("'output' key not found in task result".into())
                        });
                }
                "STATUS_FAILED" => {
                    return Err(TranslateError::Failed("task failed".into()));
                }
                _ => {}
            }
        }

        Err(TranslateError::Failed("task timed out".into()))
    }

    /// Checks the origin/target pair against the provider's enum values,
    /// rewriting the origin to the auto-detect sentinel when necessary.
    pub async fn is_language_pair_supported(&self) -> Result<(), TranslateError> {
        let task_types = self.get_task_types().await?;
        let task_type = task_types
            .types
            .get(TRANSLATE_TASK_TYPE)
            .ok_or_else(|| TranslateError::Fatal("no text2text translate task type".into()))?;

        let origins = task_type
            .input_shape_enum_values
            .get("origin_language")
            .map(|v| v.as_slice())
            .unwrap_or_default();
        let origin_supported = origins.iter().any(|v| v.value == self.origin_lang);
        let auto_detect = origins.iter().any(|v| v.value == AUTO_DETECT_ORIGIN);
        if !origin_supported {
            if !auto_detect {
                return Err(TranslateError::LangPair(format!(
                    "origin language '{}' not supported and no auto-detection",
                    self.origin_lang
                )));
            }
            *self.effective_origin.lock().unwrap() = AUTO_DETECT_ORIGIN.to_string();
        }

        let targets = task_type
            .input_shape_enum_values
            .get("target_language")
            .map(|v| v.as_slice())
            .unwrap_or_default();
        if !targets.iter().any(|v| v.value == self.target_lang) {
            return Err(TranslateError::LangPair(format!(
                "target language '{}' not supported",
                self.target_lang
            )));
        }

        Ok(())
    }

    /// Projects the provider's enum values into origin/target language maps,
    /// annotated from the known language table where possible.
    pub async fn get_translation_languages(
        &self,
    ) -> Result<SupportedTranslationLanguages, TranslateError> {
        let task_types = self.get_task_types().await?;
        let task_type = task_types
            .types
            .get(TRANSLATE_TASK_TYPE)
            .ok_or_else(|| TranslateError::Fatal("no text2text translate task type".into()))?;

        let project = |key: &str| -> Value {
            let mut map = serde_json::Map::new();
            for entry in task_type
                .input_shape_enum_values
                .get(key)
                .map(|v| v.as_slice())
                .unwrap_or_default()
            {
                let annotated = match languages::find(&entry.value) {
                    Some(info) => serde_json::json!({
                        "name": info.name,
                        "metadata": { "separator": info.separator },
                    }),
                    None => serde_json::json!({
                        "name": entry.value,
                        "metadata": { "separator": " " },
                    }),
                };
                map.insert(entry.value.clone(), annotated);
            }
            Value::Object(map)
        };

        Ok(SupportedTranslationLanguages {
            origin_languages: project("origin_language"),
            target_languages: project("target_language"),
        })
    }

    async fn get_task_types(&self) -> Result<TaskTypesResponse, TranslateError> {
        {
            let cache = self.task_types_cache.lock().unwrap();
            if let Some((at, types)) = cache.as_ref() {
                if at.elapsed() < TASK_TYPES_CACHE_TTL {
                    return Ok(types.clone());
                }
            }
        }

        let data = self
            .client
            .ocs_get("/ocs/v2.php/taskprocessing/tasks_consumer/tasktypes", "admin")
            .await
            .map_err(|e| TranslateError::Fatal(format!("fetch task types: {e}")))?;

        let resp: TaskTypesResponse = serde_json::from_value(data)
            .map_err(|e| TranslateError::Failed(format!("parse task types: {e}")))?;

        if !resp.types.contains_key(TRANSLATE_TASK_TYPE) {
            return Err(TranslateError::Fatal(
                "no text2text translate provider installed".into(),
            ));
        }

        *self.task_types_cache.lock().unwrap() = Some((Instant::now(), resp.clone()));
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use callscribe_config::{AppSettings, HpbSettings, Settings, StorageSettings, TlsSettings};

    fn ocs(data: Value) -> Json<Value> {
        Json(serde_json::json!({ "ocs": { "data": data } }))
    }

    fn task_types() -> Value {
        serde_json::json!({
            "types": {
                TRANSLATE_TASK_TYPE: {
                    "inputShapeEnumValues": {
                        "origin_language": [
                            { "name": "English", "value": "en" },
                            { "name": "Detect", "value": "detect_language" }
                        ],
                        "target_language": [
                            { "name": "German", "value": "de" },
                            { "name": "English", "value": "en" }
                        ]
                    }
                }
            }
        })
    }

    async fn spawn_platform_stub(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn settings_for(base_url: &str) -> Settings {
        Settings {
            app: AppSettings {
                id: "callscribe".to_string(),
                secret: "shh".to_string(),
                version: "1.0.0".to_string(),
                port: 0,
                platform_url: base_url.to_string(),
                shared_key: None,
            },
            hpb: HpbSettings {
                url: String::new(),
                internal_secret: String::new(),
            },
            storage: StorageSettings {
                persistent_dir: "/tmp".to_string(),
            },
            tls: TlsSettings {
                skip_cert_verify: false,
            },
        }
    }

    async fn translator_against(app: Router, origin: &str, target: &str) -> TaskTranslator {
        let base = spawn_platform_stub(app).await;
        let client = PlatformClient::new(&settings_for(&base)).unwrap();
        TaskTranslator::new(client, origin, target, "room-1")
    }

    #[tokio::test]
    async fn schedule_then_poll_returns_translation() {
        let app = Router::new()
            .route(
                "/ocs/v2.php/taskprocessing/tasks_consumer/schedule",
                post(|| async { ocs(serde_json::json!({ "task": { "id": 7, "status": "STATUS_SCHEDULED" } })) }),
            )
            .route(
                "/ocs/v1.php/taskprocessing/tasks_consumer/task/7",
                get(|| async {
                    ocs(serde_json::json!({
                        "task": {
                            "id": 7,
                            "status": "STATUS_SUCCESSFUL",
                            "output": { "output": "guten morgen" }
                        }
                    }))
                }),
            );
        let translator = translator_against(app, "en", "de").await;

        let translated = translator.translate("good morning").await.unwrap();
        assert_eq!(translated, "guten morgen");
    }

    #[tokio::test]
    async fn failed_task_is_an_error() {
        let app = Router::new()
            .route(
                "/ocs/v2.php/taskprocessing/tasks_consumer/schedule",
                post(|| async { ocs(serde_json::json!({ "task": { "id": 3 } })) }),
            )
            .route(
                "/ocs/v1.php/taskprocessing/tasks_consumer/task/3",
                get(|| async { ocs(serde_json::json!({ "task": { "id": 3, "status": "STATUS_FAILED" } })) }),
            );
        let translator = translator_against(app, "en", "de").await;

        assert!(matches!(
            translator.translate("hi").await,
            Err(TranslateError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn supported_pair_passes() {
        let app = Router::new().route(
            "/ocs/v2.php/taskprocessing/tasks_consumer/tasktypes",
            get(|| async { ocs(task_types()) }),
        );
        let translator = translator_against(app, "en", "de").await;
        translator.is_language_pair_supported().await.unwrap();
    }

    #[tokio::test]
    async fn unlisted_origin_falls_back_to_auto_detect() {
        let app = Router::new().route(
            "/ocs/v2.php/taskprocessing/tasks_consumer/tasktypes",
            get(|| async { ocs(task_types()) }),
        );
        let translator = translator_against(app, "fr", "de").await;
        translator.is_language_pair_supported().await.unwrap();
        assert_eq!(
            *translator.effective_origin.lock().unwrap(),
            AUTO_DETECT_ORIGIN
        );
    }

    #[tokio::test]
    async fn unsupported_target_is_a_lang_pair_error() {
        let app = Router::new().route(
            "/ocs/v2.php/taskprocessing/tasks_consumer/tasktypes",
            get(|| async { ocs(task_types()) }),
        );
        let translator = translator_against(app, "en", "tlh").await;
        assert!(matches!(
            translator.is_language_pair_supported().await,
            Err(TranslateError::LangPair(_))
        ));
    }

    #[tokio::test]
    async fn missing_provider_is_fatal() {
        let app = Router::new().route(
            "/ocs/v2.php/taskprocessing/tasks_consumer/tasktypes",
            get(|| async { ocs(serde_json::json!({ "types": {} })) }),
        );
        let translator = translator_against(app, "en", "de").await;
        assert!(matches!(
            translator.is_language_pair_supported().await,
            Err(TranslateError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn language_maps_carry_table_metadata() {
        let app = Router::new().route(
            "/ocs/v2.php/taskprocessing/tasks_consumer/tasktypes",
            get(|| async { ocs(task_types()) }),
        );
        let translator = translator_against(app, "en", "de").await;
        let langs = translator.get_translation_languages().await.unwrap();
        assert_eq!(langs.target_languages["de"]["name"], "German");
        // The auto-detect sentinel is not in the language table.
        assert_eq!(
            langs.origin_languages["detect_language"]["name"],
            "detect_language"
        );
    }
}
