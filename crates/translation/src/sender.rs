use std::sync::Arc;

use callscribe_signaling::pacing::MAX_TRANSLATION_SEND_TIMEOUT;
use callscribe_signaling::{AdaptiveTimeout, SignalClient};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::TranslatePayload;

/// Single consumer of the translate-out channel: delivers each translated
/// caption to its recipient set with an adaptive send timeout.
pub struct TranslatedSender {
    client: Arc<SignalClient>,
}

impl TranslatedSender {
    pub fn new(client: Arc<SignalClient>) -> Self {
        Self { client }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<TranslatePayload>, cancel: CancellationToken) {
        debug!("translated text sender started");
        let mut pacing = AdaptiveTimeout::new(MAX_TRANSLATION_SEND_TIMEOUT);

        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => break,
                payload = rx.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };

            let client = Arc::clone(&self.client);
            let send = tokio::spawn(async move {
                client.send_translated(
                    &payload.target_lang,
                    &payload.message,
                    &payload.speaker_session_id,
                    &payload.target_platform_sids,
                );
            });

            match tokio::time::timeout(pacing.current(), send).await {
                Ok(_) => pacing.on_success(),
                Err(_) => {
                    warn!(timeout = ?pacing.current(), "timeout sending translated text");
                    pacing.on_timeout();
                }
            }
        }

        debug!("translated text sender stopped");
    }
}
