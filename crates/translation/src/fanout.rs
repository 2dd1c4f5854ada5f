use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use callscribe_platform::PlatformClient;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::translator::{SupportedTranslationLanguages, TaskTranslator, TranslateError};
use crate::TranslatePayload;

const LANGS_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

struct FanoutState {
    /// Target language -> translation channel.
    translators: HashMap<String, Arc<TaskTranslator>>,
    /// Platform session id -> target language.
    sid_lang_map: HashMap<String, String>,
    origin_lang: String,
}

/// Per-call multiplexer from one final caption to N target languages.
///
/// Owns the participant -> target-language mapping and one translator per
/// distinct target. The fan-out worker runs only while at least one
/// participant has a target language set.
pub struct TranslationFanout {
    client: PlatformClient,
    room_token: String,
    state: Mutex<FanoutState>,
    should_translate: AtomicBool,
    translate_in_rx: Arc<AsyncMutex<mpsc::Receiver<TranslatePayload>>>,
    translate_out_tx: mpsc::Sender<TranslatePayload>,
    worker_cancel: Mutex<Option<CancellationToken>>,
    langs_cache: Mutex<Option<(Instant, SupportedTranslationLanguages)>>,
    scope: CancellationToken,
}

impl TranslationFanout {
    pub fn new(
        client: PlatformClient,
        room_token: String,
        origin_lang: String,
        translate_in_rx: mpsc::Receiver<TranslatePayload>,
        translate_out_tx: mpsc::Sender<TranslatePayload>,
        scope: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            room_token,
            state: Mutex::new(FanoutState {
                translators: HashMap::new(),
                sid_lang_map: HashMap::new(),
                origin_lang,
            }),
            should_translate: AtomicBool::new(false),
            translate_in_rx: Arc::new(AsyncMutex::new(translate_in_rx)),
            translate_out_tx,
            worker_cancel: Mutex::new(None),
            langs_cache: Mutex::new(None),
            scope,
        })
    }

    pub fn should_translate(&self) -> bool {
        self.should_translate.load(Ordering::SeqCst)
    }

    pub fn is_translation_target(&self, platform_sid: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .sid_lang_map
            .contains_key(platform_sid)
    }

    /// Routes a participant's captions into a target-language channel,
    /// creating the channel if needed. Support errors propagate without
    /// mutating state.
    pub async fn add_translator(
        self: &Arc<Self>,
        target_lang: &str,
        platform_sid: &str,
    ) -> Result<(), TranslateError> {
        {
            let state = self.state.lock().unwrap();
            if state.sid_lang_map.get(platform_sid).map(String::as_str) == Some(target_lang) {
                return Ok(());
            }
        }

        // The support probe does network I/O; never run it under the lock.
        let verified = {
            let state = self.state.lock().unwrap();
            if state.translators.contains_key(target_lang) {
                None
            } else {
                Some(Arc::new(TaskTranslator::new(
                    self.client.clone(),
                    state.origin_lang.clone(),
                    target_lang,
                    self.room_token.clone(),
                )))
            }
        };
        if let Some(translator) = &verified {
            translator.is_language_pair_supported().await?;
        }

        {
            let mut state = self.state.lock().unwrap();

            if let Some(previous_lang) = state.sid_lang_map.get(platform_sid).cloned() {
                if previous_lang == target_lang {
                    return Ok(());
                }
                Self::detach_session(&mut state, &previous_lang, platform_sid);
            }

            let translator = match state.translators.get(target_lang) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let translator = verified.unwrap_or_else(|| {
                        Arc::new(TaskTranslator::new(
                            self.client.clone(),
                            state.origin_lang.clone(),
                            target_lang,
                            self.room_token.clone(),
                        ))
                    });
                    state
                        .translators
                        .insert(target_lang.to_string(), Arc::clone(&translator));
                    translator
                }
            };

            translator.add_session(platform_sid);
            state
                .sid_lang_map
                .insert(platform_sid.to_string(), target_lang.to_string());
            self.should_translate.store(true, Ordering::SeqCst);
        }

        self.ensure_worker();
        info!(
            room_token = %self.room_token,
            target_lang,
            platform_sid,
            "added translator"
        );
        Ok(())
    }

    pub fn remove_translator(&self, platform_sid: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(target_lang) = state.sid_lang_map.remove(platform_sid) else {
            return;
        };
        Self::detach_session(&mut state, &target_lang, platform_sid);

        if state.sid_lang_map.is_empty() {
            self.should_translate.store(false, Ordering::SeqCst);
            drop(state);
            self.stop_worker();
        }
    }

    fn detach_session(state: &mut FanoutState, target_lang: &str, platform_sid: &str) {
        if let Some(translator) = state.translators.get(target_lang) {
            translator.remove_session(platform_sid);
            if !translator.has_sessions() {
                state.translators.remove(target_lang);
            }
        }
    }

    /// Changes the call's origin language: invalidates the cached language
    /// list and rebuilds each translator at the new origin, carrying its
    /// session set over.
    pub fn set_room_lang(&self, lang: &str) {
        let mut state = self.state.lock().unwrap();
        if state.origin_lang == lang {
            return;
        }
        state.origin_lang = lang.to_string();
        *self.langs_cache.lock().unwrap() = None;

        let targets: Vec<String> = state.translators.keys().cloned().collect();
        for target_lang in targets {
            let old = state.translators.remove(&target_lang);
            let rebuilt = Arc::new(TaskTranslator::new(
                self.client.clone(),
                lang,
                target_lang.clone(),
                self.room_token.clone(),
            ));
            if let Some(old) = old {
                for sid in old.session_ids() {
                    rebuilt.add_session(&sid);
                }
            }
            state.translators.insert(target_lang, rebuilt);
        }

        info!(room_token = %self.room_token, lang, "fan-out origin language updated");
    }

    /// Languages offered by the provider, cached for 15 minutes.
    pub async fn translation_languages(
        &self,
    ) -> Result<SupportedTranslationLanguages, TranslateError> {
        {
            let cache = self.langs_cache.lock().unwrap();
            if let Some((at, langs)) = cache.as_ref() {
                if at.elapsed() < LANGS_CACHE_TTL {
                    return Ok(langs.clone());
                }
            }
        }

        let origin = self.state.lock().unwrap().origin_lang.clone();
        let probe = TaskTranslator::new(self.client.clone(), origin, "en", self.room_token.clone());
        let langs = probe.get_translation_languages().await?;
        *self.langs_cache.lock().unwrap() = Some((Instant::now(), langs.clone()));
        Ok(langs)
    }

    pub fn shutdown(&self) {
        self.should_translate.store(false, Ordering::SeqCst);
        self.stop_worker();
    }

    fn ensure_worker(self: &Arc<Self>) {
        let mut guard = self.worker_cancel.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let cancel = self.scope.child_token();
        *guard = Some(cancel.clone());
        let fanout = Arc::clone(self);
        tokio::spawn(async move { fanout.run_worker(cancel).await });
    }

    fn stop_worker(&self) {
        if let Some(cancel) = self.worker_cancel.lock().unwrap().take() {
            cancel.cancel();
        }
    }

    /// Fan-out worker: for each incoming final, one translation task per
    /// active target language. Each task gets its own copy of the payload.
    async fn run_worker(self: Arc<Self>, cancel: CancellationToken) {
        debug!(room_token = %self.room_token, "translation fan-out worker started");

        loop {
            let payload = {
                let mut rx = self.translate_in_rx.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    payload = rx.recv() => match payload {
                        Some(payload) => payload,
                        None => break,
                    },
                }
            };

            let translators: Vec<Arc<TaskTranslator>> = {
                let state = self.state.lock().unwrap();
                state.translators.values().cloned().collect()
            };

            for translator in translators {
                let recipients = translator.session_ids();
                let out_tx = self.translate_out_tx.clone();
                let payload = payload.clone();
                tokio::spawn(async move {
                    match translator.translate(&payload.message).await {
                        Ok(translated) => {
                            let out = TranslatePayload {
                                origin_lang: payload.origin_lang,
                                target_lang: translator.target_lang().to_string(),
                                message: translated,
                                speaker_session_id: payload.speaker_session_id,
                                target_platform_sids: recipients,
                            };
                            if out_tx.try_send(out).is_err() {
                                warn!("translate output channel full, dropping");
                            }
                        }
                        Err(e) => {
                            error!(
                                error = %e,
                                target_lang = translator.target_lang(),
                                "translation failed"
                            );
                        }
                    }
                });
            }
        }

        debug!(room_token = %self.room_token, "translation fan-out worker stopped");
    }

    #[cfg(test)]
    fn translator_for(&self, target_lang: &str) -> Option<Arc<TaskTranslator>> {
        self.state.lock().unwrap().translators.get(target_lang).cloned()
    }
}
