use serde::Serialize;

/// Metadata for one supported transcription language.
#[derive(Debug, Clone, Serialize)]
pub struct LanguageInfo {
    #[serde(rename = "langId")]
    pub lang_id: &'static str,
    pub name: &'static str,
    /// Directory under persistent storage holding the acoustic model.
    #[serde(skip)]
    pub model_dir: &'static str,
    /// Word separator used when concatenating caption text.
    pub separator: &'static str,
}

/// Language table: id -> acoustic model directory and display metadata.
pub const SUPPORTED_LANGUAGES: &[LanguageInfo] = &[
    lang("en", "English", "vosk-model-small-en-us-0.15", " "),
    lang("de", "German", "vosk-model-small-de-0.15", " "),
    lang("fr", "French", "vosk-model-small-fr-0.22", " "),
    lang("es", "Spanish", "vosk-model-small-es-0.42", " "),
    lang("it", "Italian", "vosk-model-small-it-0.22", " "),
    lang("nl", "Dutch", "vosk-model-small-nl-0.22", " "),
    lang("pt", "Portuguese", "vosk-model-small-pt-0.3", " "),
    lang("ru", "Russian", "vosk-model-small-ru-0.22", " "),
    lang("tr", "Turkish", "vosk-model-small-tr-0.3", " "),
    lang("uk", "Ukrainian", "vosk-model-small-uk-v3-small", " "),
    lang("pl", "Polish", "vosk-model-small-pl-0.22", " "),
    lang("cs", "Czech", "vosk-model-small-cs-0.4-rhasspy", " "),
    lang("sv", "Swedish", "vosk-model-small-sv-rhasspy-0.15", " "),
    lang("hi", "Hindi", "vosk-model-small-hi-0.22", " "),
    lang("ja", "Japanese", "vosk-model-small-ja-0.22", ""),
    lang("zh", "Chinese", "vosk-model-small-cn-0.22", ""),
    lang("ko", "Korean", "vosk-model-small-ko-0.22", ""),
    lang("vi", "Vietnamese", "vosk-model-small-vn-0.4", " "),
    lang("ar", "Arabic", "vosk-model-ar-mgb2-0.4", " "),
    lang("fa", "Persian", "vosk-model-small-fa-0.42", " "),
];

const fn lang(
    lang_id: &'static str,
    name: &'static str,
    model_dir: &'static str,
    separator: &'static str,
) -> LanguageInfo {
    LanguageInfo {
        lang_id,
        name,
        model_dir,
        separator,
    }
}

pub fn find(lang_id: &str) -> Option<&'static LanguageInfo> {
    SUPPORTED_LANGUAGES.iter().find(|info| info.lang_id == lang_id)
}

pub fn model_dir(lang_id: &str) -> Option<&'static str> {
    find(lang_id).map(|info| info.model_dir)
}

pub fn is_supported(lang_id: &str) -> bool {
    find(lang_id).is_some()
}

/// Language map keyed by id, as served by the languages endpoint and the
/// capabilities document.
pub fn language_map() -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for info in SUPPORTED_LANGUAGES {
        map.insert(
            info.lang_id.to_string(),
            serde_json::json!({
                "name": info.name,
                "metadata": { "separator": info.separator },
            }),
        );
    }
    serde_json::Value::Object(map)
}
