use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use callscribe_signaling::pacing::MAX_TRANSCRIPT_SEND_TIMEOUT;
use callscribe_signaling::{AdaptiveTimeout, SignalClient, Transcript};
use callscribe_translation::{TranslatePayload, TranslationFanout};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const DEFUNCT_BACKOFF: Duration = Duration::from_secs(2);

/// Single consumer of the transcript channel.
///
/// Routes finals into the translation fan-out when it is active, excludes
/// translation recipients from the original-language caption, and dispatches
/// the fan-out to the HPB under an adaptive timeout.
pub struct TranscriptSender {
    client: Arc<SignalClient>,
    fanout: Arc<TranslationFanout>,
    translate_in_tx: mpsc::Sender<TranslatePayload>,
}

impl TranscriptSender {
    pub fn new(
        client: Arc<SignalClient>,
        fanout: Arc<TranslationFanout>,
        translate_in_tx: mpsc::Sender<TranslatePayload>,
    ) -> Self {
        Self {
            client,
            fanout,
            translate_in_tx,
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<Transcript>, cancel: CancellationToken) {
        debug!("transcript sender started");
        let mut pacing = AdaptiveTimeout::new(MAX_TRANSCRIPT_SEND_TIMEOUT);

        loop {
            let transcript = tokio::select! {
                _ = cancel.cancelled() => break,
                transcript = rx.recv() => match transcript {
                    Some(transcript) => transcript,
                    None => break,
                },
            };

            if self.client.is_defunct() {
                // The registry notices defunct clients via the leave callback;
                // just avoid spinning on the channel until cleanup happens.
                tokio::time::sleep(DEFUNCT_BACKOFF).await;
                continue;
            }

            let translating = transcript.is_final && self.fanout.should_translate();
            if translating {
                let payload = TranslatePayload {
                    origin_lang: transcript.lang_id.clone(),
                    target_lang: String::new(),
                    message: transcript.message.clone(),
                    speaker_session_id: transcript.speaker_session_id.clone(),
                    target_platform_sids: HashSet::new(),
                };
                if self.translate_in_tx.try_send(payload).is_err() {
                    warn!("translate input channel full, dropping caption");
                }
            }

            let client = Arc::clone(&self.client);
            let fanout = Arc::clone(&self.fanout);
            let send = tokio::spawn(async move {
                if translating {
                    // Translation recipients get the translated text instead
                    // of the original-language final.
                    let excluded = move |platform_sid: &str| fanout.is_translation_target(platform_sid);
                    client.send_transcript(&transcript, Some(&excluded));
                } else {
                    client.send_transcript(&transcript, None);
                }
            });

            match tokio::time::timeout(pacing.current(), send).await {
                Ok(_) => pacing.on_success(),
                Err(_) => {
                    error!(timeout = ?pacing.current(), "timeout sending transcript");
                    pacing.on_timeout();
                }
            }
        }

        debug!("transcript sender stopped");
    }
}
