pub mod engine;
pub mod languages;
pub mod manager;
pub mod models;
pub mod recognizer;
pub mod worker;

pub use engine::{Emission, RecognitionModel, SpeechEngine};
pub use manager::RecognizerManager;
pub use models::{ModelError, ModelRegistry};
pub use recognizer::SpeakerRecognizer;
pub use worker::AudioWorker;

/// Sample rate the recognizers are constructed at. The transport delivers
/// 48 kHz; the audio worker downsamples at the boundary.
pub const RECOGNIZER_SAMPLE_RATE: u32 = 16_000;
