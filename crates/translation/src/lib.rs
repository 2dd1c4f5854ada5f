pub mod fanout;
pub mod sender;
pub mod translator;

pub use fanout::TranslationFanout;
pub use sender::TranslatedSender;
pub use translator::{SupportedTranslationLanguages, TaskTranslator, TranslateError};

use std::collections::HashSet;

/// One caption moving through the translation pipeline, either awaiting
/// translation (fan-out input) or carrying translated text to its recipient
/// set (fan-out output).
#[derive(Debug, Clone)]
pub struct TranslatePayload {
    pub origin_lang: String,
    pub target_lang: String,
    pub message: String,
    pub speaker_session_id: String,
    /// Platform session ids receiving this translation.
    pub target_platform_sids: HashSet<String>,
}
