use std::convert::TryFrom;
use std::sync::Arc;

use audiopus::coder::Decoder;
use audiopus::packet::Packet;
use audiopus::{Channels, MutSignals, SampleRate};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::track::track_remote::TrackRemote;

use crate::messages::HpbServers;
use crate::PcmAudio;

/// Capture rate delivered by the transport.
pub const TRACK_SAMPLE_RATE: u32 = 48_000;

/// Max Opus frame: 120ms at 48kHz mono.
const MAX_FRAME_SAMPLES: usize = 5760;

/// Builds the WebRTC API with default codecs and interceptors.
pub fn build_api() -> anyhow::Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| anyhow::anyhow!("register codecs: {e}"))?;

    let registry = register_default_interceptors(
        webrtc::interceptor::registry::Registry::new(),
        &mut media_engine,
    )
    .map_err(|e| anyhow::anyhow!("register interceptors: {e}"))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Maps the platform-provided STUN/TURN settings into an ICE configuration.
pub fn ice_config(servers: &HpbServers) -> RTCConfiguration {
    let mut ice_servers = Vec::new();
    for stun in &servers.stun_servers {
        ice_servers.push(RTCIceServer {
            urls: stun.urls.clone(),
            ..Default::default()
        });
    }
    for turn in &servers.turn_servers {
        ice_servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }
    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

/// Reads RTP from one remote audio track, decodes the Opus payload to mono
/// PCM at the capture rate, and publishes it to the PCM channel.
///
/// The channel send never blocks; when the channel is full the frame is
/// dropped so the audio path stays live. Exits on read error or cancellation.
pub async fn read_audio_track(
    cancel: CancellationToken,
    speaker_sid: String,
    track: Arc<TrackRemote>,
    pcm_tx: mpsc::Sender<PcmAudio>,
) {
    info!(session_id = %speaker_sid, "audio track reader started");

    let mut decoder = match Decoder::new(SampleRate::Hz48000, Channels::Mono) {
        Ok(d) => d,
        Err(e) => {
            warn!(session_id = %speaker_sid, error = %e, "failed to create opus decoder");
            return;
        }
    };
    let mut pcm_buf = vec![0i16; MAX_FRAME_SAMPLES];

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            read = track.read_rtp() => match read {
                Ok((packet, _attrs)) => packet,
                Err(e) => {
                    debug!(session_id = %speaker_sid, error = %e, "track read ended");
                    break;
                }
            },
        };

        if packet.payload.is_empty() {
            continue;
        }

        let decoded = {
            let output = match MutSignals::try_from(&mut pcm_buf[..]) {
                Ok(o) => o,
                Err(e) => {
                    warn!(session_id = %speaker_sid, error = %e, "opus output buffer error");
                    continue;
                }
            };
            let opus = match Packet::try_from(&packet.payload[..]) {
                Ok(p) => p,
                Err(e) => {
                    debug!(session_id = %speaker_sid, error = %e, "invalid opus packet");
                    continue;
                }
            };
            match decoder.decode(Some(opus), output, false) {
                Ok(n) => n,
                Err(e) => {
                    debug!(session_id = %speaker_sid, error = %e, "opus decode error");
                    continue;
                }
            }
        };
        if decoded == 0 {
            continue;
        }

        let audio = PcmAudio {
            session_id: speaker_sid.clone(),
            samples: pcm_buf[..decoded].to_vec(),
            sample_rate: TRACK_SAMPLE_RATE,
        };
        if pcm_tx.try_send(audio).is_err() {
            // Full channel: drop the frame rather than stall the track reader.
            debug!(session_id = %speaker_sid, "pcm channel full, dropping frame");
        }
    }

    info!(session_id = %speaker_sid, "audio track reader stopped");
}
