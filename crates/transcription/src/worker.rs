use std::sync::Arc;

use callscribe_signaling::PcmAudio;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::manager::RecognizerManager;
use crate::RECOGNIZER_SAMPLE_RATE;

/// Single consumer of the room's PCM channel: routes each chunk to the
/// speaker's recognizer, downsampling to the recognizer rate at this
/// boundary.
pub struct AudioWorker {
    manager: Arc<RecognizerManager>,
}

impl AudioWorker {
    pub fn new(manager: Arc<RecognizerManager>) -> Self {
        Self { manager }
    }

    pub async fn run(self, mut pcm_rx: mpsc::Receiver<PcmAudio>, cancel: CancellationToken) {
        debug!("audio worker started");

        loop {
            let audio = tokio::select! {
                _ = cancel.cancelled() => break,
                audio = pcm_rx.recv() => match audio {
                    Some(audio) => audio,
                    None => break,
                },
            };

            if audio.samples.is_empty() {
                continue;
            }

            let recognizer = match self.manager.get_or_create(&audio.session_id) {
                Ok(recognizer) => recognizer,
                Err(e) => {
                    error!(
                        session_id = %audio.session_id,
                        error = %e,
                        "failed to get/create recognizer"
                    );
                    continue;
                }
            };

            if audio.sample_rate == RECOGNIZER_SAMPLE_RATE {
                recognizer.feed(&audio.samples);
            } else {
                recognizer.feed(&downsample_48k_to_16k(&audio.samples));
            }
        }

        self.manager.close_all();
        debug!("audio worker stopped");
    }
}

/// 48kHz -> 16kHz by a three-tap box average. Deliberately simple; the
/// quality is sufficient for speech recognition.
pub fn downsample_48k_to_16k(samples: &[i16]) -> Vec<i16> {
    const RATIO: usize = 3;
    let mut out = Vec::with_capacity(samples.len() / RATIO);
    for window in samples.chunks_exact(RATIO) {
        let sum = window[0] as i32 + window[1] as i32 + window[2] as i32;
        out.push((sum / RATIO as i32) as i16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Emission, RecognitionModel, SpeechEngine};
    use crate::languages;
    use crate::models::ModelRegistry;
    use callscribe_signaling::Transcript;

    #[test]
    fn downsample_averages_triples() {
        let samples = [3, 6, 9, 30, 30, 30, -3, 0, 3];
        assert_eq!(downsample_48k_to_16k(&samples), vec![6, 30, 0]);
    }

    #[test]
    fn downsample_drops_trailing_remainder() {
        let samples = [9, 9, 9, 1, 2];
        assert_eq!(downsample_48k_to_16k(&samples), vec![9]);
    }

    #[test]
    fn downsample_empty_is_empty() {
        assert!(downsample_48k_to_16k(&[]).is_empty());
    }

    /// Engine that echoes the number of samples it was fed as a final.
    struct LenEchoEngine;

    impl SpeechEngine for LenEchoEngine {
        fn accept(&mut self, pcm: &[i16]) -> anyhow::Result<Emission> {
            Ok(Emission::Final(format!("fed {}", pcm.len())))
        }
        fn flush(&mut self) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    struct LenEchoModel;

    impl RecognitionModel for LenEchoModel {
        fn new_engine(&self, _sample_rate: f32) -> anyhow::Result<Box<dyn SpeechEngine>> {
            Ok(Box::new(LenEchoEngine))
        }
    }

    #[tokio::test]
    async fn worker_downsamples_and_feeds_per_speaker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(languages::model_dir("en").unwrap())).unwrap();
        let registry = Arc::new(ModelRegistry::with_loader(
            dir.path(),
            Box::new(|_l, _p| Ok(Arc::new(LenEchoModel) as Arc<dyn RecognitionModel>)),
        ));

        let (transcript_tx, mut transcript_rx) = mpsc::channel::<Transcript>(16);
        let manager = Arc::new(RecognizerManager::new(
            Arc::clone(&registry),
            "en".to_string(),
            RECOGNIZER_SAMPLE_RATE,
            transcript_tx,
        ));

        let (pcm_tx, pcm_rx) = mpsc::channel::<PcmAudio>(16);
        let cancel = CancellationToken::new();
        let worker = AudioWorker::new(Arc::clone(&manager));
        let handle = tokio::spawn(worker.run(pcm_rx, cancel.clone()));

        pcm_tx
            .send(PcmAudio {
                session_id: "T1".to_string(),
                samples: vec![0; 960],
                sample_rate: 48_000,
            })
            .await
            .unwrap();
        // Empty chunks are skipped without touching the manager.
        pcm_tx
            .send(PcmAudio {
                session_id: "T2".to_string(),
                samples: vec![],
                sample_rate: 48_000,
            })
            .await
            .unwrap();

        let transcript = transcript_rx.recv().await.unwrap();
        assert_eq!(transcript.message, "fed 320");
        assert_eq!(transcript.speaker_session_id, "T1");

        cancel.cancel();
        handle.await.unwrap();
        // Worker exit closes every recognizer and balances the registry.
        assert_eq!(registry.cached_count(), 0);
    }
}
