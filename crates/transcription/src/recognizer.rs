use std::sync::Mutex;

use callscribe_signaling::Transcript;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::{Emission, SpeechEngine};

/// Chunks without a natural final before a final is forced. At 16kHz with
/// 20ms chunks this is 10 seconds of audio.
pub const CHUNKS_UNTIL_FORCED_FINAL: u32 = 500;

type EngineFactory = Box<dyn Fn() -> anyhow::Result<Box<dyn SpeechEngine>> + Send>;

struct RecognizerState {
    engine: Option<Box<dyn SpeechEngine>>,
    factory: EngineFactory,
    feed_count: u64,
    chunks_since_final: u32,
}

/// Speech recognizer for one speaker.
///
/// Feeds are serialized by the internal lock. After
/// [`CHUNKS_UNTIL_FORCED_FINAL`] feeds without a natural segment boundary the
/// recognizer forces a final and rebuilds its engine, returning any native
/// memory the engine accumulated for the open segment.
pub struct SpeakerRecognizer {
    session_id: String,
    language: String,
    transcript_tx: mpsc::Sender<Transcript>,
    state: Mutex<RecognizerState>,
}

impl SpeakerRecognizer {
    pub fn new(
        factory: EngineFactory,
        session_id: String,
        language: String,
        transcript_tx: mpsc::Sender<Transcript>,
    ) -> anyhow::Result<Self> {
        let engine = factory()?;
        Ok(Self {
            session_id,
            language,
            transcript_tx,
            state: Mutex::new(RecognizerState {
                engine: Some(engine),
                factory,
                feed_count: 0,
                chunks_since_final: 0,
            }),
        })
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Feeds one PCM chunk (16-bit mono at the recognizer rate) and publishes
    /// the resulting emission. Never blocks on the transcript channel.
    pub fn feed(&self, pcm: &[i16]) {
        let mut state = self.state.lock().unwrap();
        if state.engine.is_none() {
            return;
        }

        state.feed_count += 1;
        state.chunks_since_final += 1;

        let emission = match state.engine.as_mut().map(|e| e.accept(pcm)) {
            Some(Ok(emission)) => emission,
            Some(Err(e)) => {
                warn!(session_id = %self.session_id, error = %e, "recognizer feed failed");
                return;
            }
            None => return,
        };

        match emission {
            Emission::Final(text) => {
                state.chunks_since_final = 0;
                self.publish(&text, true);
            }
            Emission::Partial(text) => {
                if state.chunks_since_final >= CHUNKS_UNTIL_FORCED_FINAL {
                    self.force_final(&mut state);
                } else {
                    self.publish(&text, false);
                }
            }
        }
    }

    /// Flushes the open segment and rebuilds the engine to return native
    /// memory. Caller holds the state lock.
    fn force_final(&self, state: &mut RecognizerState) {
        let text = match state.engine.as_mut().map(|e| e.flush()) {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                warn!(session_id = %self.session_id, error = %e, "forced finalization failed");
                String::new()
            }
            None => return,
        };
        debug!(session_id = %self.session_id, "forced final after chunk budget");
        self.publish(&text, true);
        state.chunks_since_final = 0;

        // Drop the old engine before constructing the replacement.
        state.engine = None;
        match (state.factory)() {
            Ok(engine) => state.engine = Some(engine),
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "failed to rebuild recognizer engine");
            }
        }
    }

    fn publish(&self, message: &str, is_final: bool) {
        // Empty segments and the bare token "the" are decoder noise.
        if message.is_empty() || message == "the" {
            return;
        }

        let transcript = Transcript {
            is_final,
            lang_id: self.language.clone(),
            message: message.to_string(),
            speaker_session_id: self.session_id.clone(),
        };
        if self.transcript_tx.try_send(transcript).is_err() {
            warn!(session_id = %self.session_id, "transcript channel full, dropping message");
        }
    }

    /// Frees the engine; further feeds are no-ops.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.engine = None;
        debug!(session_id = %self.session_id, "recognizer closed");
    }
}
