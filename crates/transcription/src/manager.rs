use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use callscribe_signaling::Transcript;
use tokio::sync::mpsc;
use tracing::info;

use crate::models::ModelRegistry;
use crate::recognizer::SpeakerRecognizer;

struct ManagerState {
    recognizers: HashMap<String, Arc<SpeakerRecognizer>>,
    language: String,
}

/// Per-call recognizer allocation, one recognizer per speaker.
///
/// The manager owns its recognizers exclusively and holds one model refcount
/// per live recognizer; a language switch closes them all and lets the next
/// PCM chunk re-create them lazily at the new language.
pub struct RecognizerManager {
    registry: Arc<ModelRegistry>,
    sample_rate: u32,
    transcript_tx: mpsc::Sender<Transcript>,
    state: Mutex<ManagerState>,
}

impl RecognizerManager {
    pub fn new(
        registry: Arc<ModelRegistry>,
        language: String,
        sample_rate: u32,
        transcript_tx: mpsc::Sender<Transcript>,
    ) -> Self {
        Self {
            registry,
            sample_rate,
            transcript_tx,
            state: Mutex::new(ManagerState {
                recognizers: HashMap::new(),
                language,
            }),
        }
    }

    pub fn language(&self) -> String {
        self.state.lock().unwrap().language.clone()
    }

    pub fn get_or_create(
        &self,
        speaker_sid: &str,
    ) -> anyhow::Result<Arc<SpeakerRecognizer>> {
        let mut state = self.state.lock().unwrap();

        if let Some(recognizer) = state.recognizers.get(speaker_sid) {
            return Ok(Arc::clone(recognizer));
        }

        let language = state.language.clone();
        let model = self.registry.acquire(&language)?;
        let sample_rate = self.sample_rate as f32;
        let factory_model = Arc::clone(&model);
        let recognizer = SpeakerRecognizer::new(
            Box::new(move || factory_model.new_engine(sample_rate)),
            speaker_sid.to_string(),
            language.clone(),
            self.transcript_tx.clone(),
        );

        let recognizer = match recognizer {
            Ok(recognizer) => Arc::new(recognizer),
            Err(e) => {
                // Balance the refcount taken for the failed construction.
                self.registry.release(&language);
                return Err(e);
            }
        };

        state
            .recognizers
            .insert(speaker_sid.to_string(), Arc::clone(&recognizer));
        info!(session_id = %speaker_sid, %language, "created recognizer");
        Ok(recognizer)
    }

    pub fn remove(&self, speaker_sid: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(recognizer) = state.recognizers.remove(speaker_sid) {
            recognizer.close();
            self.registry.release(&state.language);
        }
    }

    /// Switches the call language. Existing recognizers are closed (releasing
    /// the old language's refcounts); they re-acquire the new model lazily on
    /// the next `get_or_create`.
    pub fn set_language(&self, language: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.language == language {
            return Ok(());
        }

        // Verify the new language loads before tearing anything down.
        self.registry.acquire(language)?;

        let old_language = state.language.clone();
        for (_, recognizer) in state.recognizers.drain() {
            recognizer.close();
            self.registry.release(&old_language);
        }

        // Drop the probe refcount; recognizers re-acquire on demand.
        self.registry.release(language);

        state.language = language.to_string();
        info!(%language, "transcription language switched");
        Ok(())
    }

    pub fn close_all(&self) {
        let mut state = self.state.lock().unwrap();
        let language = state.language.clone();
        for (_, recognizer) in state.recognizers.drain() {
            recognizer.close();
            self.registry.release(&language);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Emission, RecognitionModel, SpeechEngine};
    use crate::languages;
    use std::path::Path;

    struct IdleEngine;

    impl SpeechEngine for IdleEngine {
        fn accept(&mut self, _pcm: &[i16]) -> anyhow::Result<Emission> {
            Ok(Emission::Partial(String::new()))
        }
        fn flush(&mut self) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    struct FakeModel;

    impl RecognitionModel for FakeModel {
        fn new_engine(&self, _sample_rate: f32) -> anyhow::Result<Box<dyn SpeechEngine>> {
            Ok(Box::new(IdleEngine))
        }
    }

    fn fake_registry(root: &Path) -> Arc<ModelRegistry> {
        Arc::new(ModelRegistry::with_loader(
            root,
            Box::new(|_lang, _path| Ok(Arc::new(FakeModel) as Arc<dyn RecognitionModel>)),
        ))
    }

    fn make_model_dir(root: &Path, lang: &str) {
        std::fs::create_dir_all(root.join(languages::model_dir(lang).unwrap())).unwrap();
    }

    fn manager(registry: Arc<ModelRegistry>) -> RecognizerManager {
        let (tx, _rx) = mpsc::channel(16);
        RecognizerManager::new(registry, "en".to_string(), 16_000, tx)
    }

    #[test]
    fn recognizers_share_one_model_per_language() {
        let dir = tempfile::tempdir().unwrap();
        make_model_dir(dir.path(), "en");
        let registry = fake_registry(dir.path());
        let mgr = manager(Arc::clone(&registry));

        mgr.get_or_create("T1").unwrap();
        mgr.get_or_create("T2").unwrap();
        // Same speaker again: no new refcount.
        mgr.get_or_create("T1").unwrap();

        assert_eq!(registry.ref_count("en"), Some(2));
        assert_eq!(registry.cached_count(), 1);
    }

    #[test]
    fn remove_releases_the_model() {
        let dir = tempfile::tempdir().unwrap();
        make_model_dir(dir.path(), "en");
        let registry = fake_registry(dir.path());
        let mgr = manager(Arc::clone(&registry));

        mgr.get_or_create("T1").unwrap();
        mgr.remove("T1");
        assert_eq!(registry.ref_count("en"), None);
        assert_eq!(registry.cached_count(), 0);
    }

    #[test]
    fn language_switch_frees_old_model_and_recreates_lazily() {
        let dir = tempfile::tempdir().unwrap();
        make_model_dir(dir.path(), "en");
        make_model_dir(dir.path(), "de");
        let registry = fake_registry(dir.path());
        let mgr = manager(Arc::clone(&registry));

        mgr.get_or_create("T1").unwrap();
        mgr.get_or_create("T2").unwrap();

        mgr.set_language("de").unwrap();
        // Old model fully released, new one not held until a speaker talks.
        assert_eq!(registry.ref_count("en"), None);
        assert_eq!(registry.ref_count("de"), None);
        assert_eq!(registry.cached_count(), 0);

        mgr.get_or_create("T1").unwrap();
        assert_eq!(registry.ref_count("de"), Some(1));
        assert_eq!(mgr.language(), "de");
    }

    #[test]
    fn language_switch_to_same_language_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        make_model_dir(dir.path(), "en");
        let registry = fake_registry(dir.path());
        let mgr = manager(Arc::clone(&registry));

        mgr.get_or_create("T1").unwrap();
        mgr.set_language("en").unwrap();
        assert_eq!(registry.ref_count("en"), Some(1));
    }

    #[test]
    fn language_switch_to_missing_model_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        make_model_dir(dir.path(), "en");
        let registry = fake_registry(dir.path());
        let mgr = manager(Arc::clone(&registry));

        mgr.get_or_create("T1").unwrap();
        assert!(mgr.set_language("de").is_err());
        // The failed switch must not disturb the running recognizers.
        assert_eq!(mgr.language(), "en");
        assert_eq!(registry.ref_count("en"), Some(1));
    }

    #[test]
    fn close_all_balances_every_refcount() {
        let dir = tempfile::tempdir().unwrap();
        make_model_dir(dir.path(), "en");
        let registry = fake_registry(dir.path());
        let mgr = manager(Arc::clone(&registry));

        for sid in ["T1", "T2", "T3"] {
            mgr.get_or_create(sid).unwrap();
        }
        mgr.close_all();
        assert_eq!(registry.cached_count(), 0);
    }
}
