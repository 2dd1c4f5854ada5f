use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::info;

use crate::engine::{RecognitionModel, VoskModel};
use crate::languages;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no model available for language: {0}")]
    UnknownLanguage(String),
    #[error("model directory not found: {0}")]
    MissingDirectory(String),
    #[error("failed to load model for {lang}: {message}")]
    LoadFailed { lang: String, message: String },
}

type ModelLoader =
    Box<dyn Fn(&str, &Path) -> anyhow::Result<Arc<dyn RecognitionModel>> + Send + Sync>;

struct ModelEntry {
    model: Arc<dyn RecognitionModel>,
    ref_count: usize,
}

/// Reference-counted cache of loaded acoustic models, keyed by language.
///
/// `acquire`/`release` calls must balance; an entry is dropped (and the model
/// freed once the last engine lets go of it) exactly when its count reaches
/// zero. The loader runs under the registry lock so each language is loaded
/// at most once regardless of concurrent acquires.
pub struct ModelRegistry {
    storage_root: PathBuf,
    entries: Mutex<HashMap<String, ModelEntry>>,
    loader: ModelLoader,
}

impl ModelRegistry {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self::with_loader(
            storage_root,
            Box::new(|_lang, path| Ok(Arc::new(VoskModel::load(path)?) as Arc<dyn RecognitionModel>)),
        )
    }

    pub fn with_loader(storage_root: impl Into<PathBuf>, loader: ModelLoader) -> Self {
        Self {
            storage_root: storage_root.into(),
            entries: Mutex::new(HashMap::new()),
            loader,
        }
    }

    pub fn acquire(&self, lang: &str) -> Result<Arc<dyn RecognitionModel>, ModelError> {
        let mut entries = self.entries.lock().unwrap();

        if let Some(entry) = entries.get_mut(lang) {
            entry.ref_count += 1;
            info!(lang, ref_count = entry.ref_count, "reusing cached model");
            return Ok(Arc::clone(&entry.model));
        }

        let model_dir = languages::model_dir(lang)
            .ok_or_else(|| ModelError::UnknownLanguage(lang.to_string()))?;
        let path = self.storage_root.join(model_dir);
        if !path.is_dir() {
            return Err(ModelError::MissingDirectory(path.display().to_string()));
        }

        info!(lang, path = %path.display(), "loading model");
        let model = (self.loader)(lang, &path).map_err(|e| ModelError::LoadFailed {
            lang: lang.to_string(),
            message: e.to_string(),
        })?;

        entries.insert(
            lang.to_string(),
            ModelEntry {
                model: Arc::clone(&model),
                ref_count: 1,
            },
        );
        info!(lang, "model loaded");
        Ok(model)
    }

    pub fn release(&self, lang: &str) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(lang) else {
            return;
        };

        entry.ref_count -= 1;
        info!(lang, ref_count = entry.ref_count, "released model");
        if entry.ref_count == 0 {
            entries.remove(lang);
            info!(lang, "freed model");
        }
    }

    pub fn is_available(&self, lang: &str) -> bool {
        let Some(model_dir) = languages::model_dir(lang) else {
            return false;
        };
        self.storage_root.join(model_dir).is_dir()
    }

    /// Languages whose model directory is present on persistent storage.
    pub fn available_languages(&self) -> Vec<&'static str> {
        languages::SUPPORTED_LANGUAGES
            .iter()
            .filter(|info| self.is_available(info.lang_id))
            .map(|info| info.lang_id)
            .collect()
    }

    pub fn cached_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn ref_count(&self, lang: &str) -> Option<usize> {
        self.entries.lock().unwrap().get(lang).map(|e| e.ref_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeModel;

    impl RecognitionModel for FakeModel {
        fn new_engine(
            &self,
            _sample_rate: f32,
        ) -> anyhow::Result<Box<dyn crate::engine::SpeechEngine>> {
            anyhow::bail!("fake model cannot build engines")
        }
    }

    fn registry_with_fake_loader(root: &Path, loads: Arc<AtomicUsize>) -> ModelRegistry {
        ModelRegistry::with_loader(
            root,
            Box::new(move |_lang, _path| {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(FakeModel) as Arc<dyn RecognitionModel>)
            }),
        )
    }

    fn make_model_dir(root: &Path, lang: &str) {
        std::fs::create_dir_all(root.join(languages::model_dir(lang).unwrap())).unwrap();
    }

    #[test]
    fn acquire_release_balance_empties_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let loads = Arc::new(AtomicUsize::new(0));
        let registry = registry_with_fake_loader(dir.path(), Arc::clone(&loads));
        make_model_dir(dir.path(), "en");

        let _a = registry.acquire("en").unwrap();
        let _b = registry.acquire("en").unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.ref_count("en"), Some(2));

        registry.release("en");
        assert_eq!(registry.ref_count("en"), Some(1));
        registry.release("en");
        assert_eq!(registry.ref_count("en"), None);
        assert_eq!(registry.cached_count(), 0);

        // Re-acquire loads again.
        let _c = registry.acquire("en").unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_language_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_fake_loader(dir.path(), Arc::new(AtomicUsize::new(0)));
        assert!(matches!(
            registry.acquire("tlh"),
            Err(ModelError::UnknownLanguage(_))
        ));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_fake_loader(dir.path(), Arc::new(AtomicUsize::new(0)));
        assert!(matches!(
            registry.acquire("en"),
            Err(ModelError::MissingDirectory(_))
        ));
        assert_eq!(registry.cached_count(), 0);
    }

    #[test]
    fn release_of_unknown_language_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_fake_loader(dir.path(), Arc::new(AtomicUsize::new(0)));
        registry.release("en");
        assert_eq!(registry.cached_count(), 0);
    }

    #[test]
    fn availability_probes_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_fake_loader(dir.path(), Arc::new(AtomicUsize::new(0)));
        assert!(!registry.is_available("de"));
        make_model_dir(dir.path(), "de");
        assert!(registry.is_available("de"));
        assert_eq!(registry.available_languages(), vec!["de"]);
    }
}
