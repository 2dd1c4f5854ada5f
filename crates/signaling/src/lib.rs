pub mod client;
pub mod messages;
pub mod pacing;
pub mod peer;

pub use client::{ConnectOutcome, ReconnectMethod, SignalClient, SignalError};
pub use messages::{HpbServers, SignalingMessage};
pub use pacing::AdaptiveTimeout;

/// A caption emitted by a recognizer, routed to the HPB as a data message.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub is_final: bool,
    pub lang_id: String,
    pub message: String,
    pub speaker_session_id: String,
}

/// Decoded PCM from one speaker's audio track.
#[derive(Debug, Clone)]
pub struct PcmAudio {
    /// Transport session id of the speaker.
    pub session_id: String,
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}
