use std::path::Path;

use vosk::{DecodingState, Model, Recognizer};

/// One recognizer emission per feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    Partial(String),
    Final(String),
}

/// Streaming speech recognition over 16-bit mono PCM at a fixed sample rate.
///
/// Implementations must be safe to drop and reconstruct between feeds; the
/// per-speaker recognizer relies on that to reclaim native memory after a
/// forced finalization.
pub trait SpeechEngine: Send {
    /// Feeds one chunk of PCM. Returns a final when the engine closed a
    /// segment on this feed, otherwise the current partial.
    fn accept(&mut self, pcm: &[i16]) -> anyhow::Result<Emission>;

    /// Forces the open segment closed and returns its text.
    fn flush(&mut self) -> anyhow::Result<String>;
}

/// A loaded acoustic model from which engines are constructed. Models are
/// large and immutable; the registry shares them across speakers.
pub trait RecognitionModel: Send + Sync {
    fn new_engine(&self, sample_rate: f32) -> anyhow::Result<Box<dyn SpeechEngine>>;
}

/// Acoustic model backed by a Vosk model directory on disk.
pub struct VoskModel {
    model: Model,
}

impl VoskModel {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let model = Model::new(path.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow::anyhow!("failed to load model at {}", path.display()))?;
        Ok(Self { model })
    }
}

impl RecognitionModel for VoskModel {
    fn new_engine(&self, sample_rate: f32) -> anyhow::Result<Box<dyn SpeechEngine>> {
        let mut recognizer = Recognizer::new(&self.model, sample_rate)
            .ok_or_else(|| anyhow::anyhow!("failed to create recognizer"))?;
        // No word-level timing.
        recognizer.set_words(false);
        Ok(Box::new(VoskEngine { recognizer }))
    }
}

struct VoskEngine {
    recognizer: Recognizer,
}

impl SpeechEngine for VoskEngine {
    fn accept(&mut self, pcm: &[i16]) -> anyhow::Result<Emission> {
        let state = self
            .recognizer
            .accept_waveform(pcm)
            .map_err(|e| anyhow::anyhow!("accept_waveform: {e}"))?;
        match state {
            DecodingState::Finalized => {
                let text = self
                    .recognizer
                    .result()
                    .single()
                    .map(|r| r.text.to_string())
                    .unwrap_or_default();
                Ok(Emission::Final(text))
            }
            DecodingState::Running => {
                Ok(Emission::Partial(self.recognizer.partial_result().partial.to_string()))
            }
            DecodingState::Failed => Err(anyhow::anyhow!("recognizer failed to decode waveform")),
        }
    }

    fn flush(&mut self) -> anyhow::Result<String> {
        Ok(self
            .recognizer
            .final_result()
            .single()
            .map(|r| r.text.to_string())
            .unwrap_or_default())
    }
}
