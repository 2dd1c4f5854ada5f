use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use callscribe_config::Settings;
use callscribe_platform::PlatformClient;
use callscribe_signaling::client::SignalClientConfig;
use callscribe_signaling::messages::HpbServers;
use callscribe_signaling::{ConnectOutcome, ReconnectMethod, SignalClient};
use callscribe_transcription::{
    AudioWorker, ModelRegistry, RecognizerManager, RECOGNIZER_SAMPLE_RATE,
};
use callscribe_translation::{
    SupportedTranslationLanguages, TaskTranslator, TranslatedSender, TranslationFanout,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::transcript_sender::TranscriptSender;

const MAX_CONNECT_TRIES: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);
const DEFUNCT_RETRY_DELAY: Duration = Duration::from_secs(5);
const DEFUNCT_RETRY_ROUNDS: u32 = 3;
const SHUTDOWN_WINDOW: Duration = Duration::from_secs(30);

const TRANSLATE_CHANNEL_CAPACITY: usize = 100;

struct RoomState {
    client: Arc<SignalClient>,
    manager: Arc<RecognizerManager>,
    fanout: Arc<TranslationFanout>,
    cancel: CancellationToken,
}

/// Owns every active room: one signaling client plus its pipeline workers per
/// room token, created on the first transcribe request and torn down when the
/// client goes defunct or the service shuts down.
pub struct RoomRegistry {
    settings: Settings,
    platform: PlatformClient,
    models: Arc<ModelRegistry>,
    hpb_servers: Mutex<Option<HpbServers>>,
    rooms: Mutex<HashMap<String, RoomState>>,
}

impl RoomRegistry {
    pub fn new(settings: Settings, platform: PlatformClient, models: Arc<ModelRegistry>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            platform,
            models,
            hpb_servers: Mutex::new(None),
            rooms: Mutex::new(HashMap::new()),
        })
    }

    /// Fetches the HPB settings once at startup; failures are retried on the
    /// first call instead.
    pub async fn prefetch_hpb_settings(&self) {
        if self.settings.hpb.url.is_empty() || self.settings.hpb.internal_secret.is_empty() {
            info!("HPB not configured, call handling disabled until settings arrive");
            return;
        }
        if let Err(e) = self.ensure_hpb_servers().await {
            warn!(error = %e, "failed to fetch HPB settings on startup, will retry on first call");
        }
    }

    async fn ensure_hpb_servers(&self) -> anyhow::Result<HpbServers> {
        if let Some(servers) = self.hpb_servers.lock().await.clone() {
            return Ok(servers);
        }

        // Fetch outside the lock; the request is idempotent, so losing a
        // concurrent race just means one redundant fetch.
        let data = self
            .platform
            .ocs_get("/ocs/v2.php/apps/spreed/api/v3/signaling/settings", "admin")
            .await?;
        let servers: HpbServers = serde_json::from_value(data)?;
        info!(
            server = %servers.server,
            stun_count = servers.stun_servers.len(),
            turn_count = servers.turn_servers.len(),
            "HPB settings retrieved"
        );

        let mut cached = self.hpb_servers.lock().await;
        if let Some(existing) = cached.as_ref() {
            return Ok(existing.clone());
        }
        *cached = Some(servers.clone());
        Ok(servers)
    }

    /// Enables or disables captions for one participant, creating the room on
    /// first enable.
    pub async fn transcribe_req(
        self: &Arc<Self>,
        room_token: &str,
        platform_sid: &str,
        lang_id: &str,
        enable: bool,
    ) -> anyhow::Result<()> {
        // A defunct room is cleaned up by the leave callback; wait it out a
        // bounded number of rounds rather than recursing.
        for round in 0..=DEFUNCT_RETRY_ROUNDS {
            let defunct = {
                let rooms = self.rooms.lock().await;
                match rooms.get(room_token) {
                    Some(room) if room.client.is_defunct() => true,
                    Some(room) => {
                        if enable {
                            room.client.add_target(platform_sid);
                        } else {
                            room.client.remove_target(platform_sid);
                        }
                        return Ok(());
                    }
                    None => break,
                }
            };

            if defunct {
                if !enable {
                    return Ok(());
                }
                if round == DEFUNCT_RETRY_ROUNDS {
                    anyhow::bail!("room {room_token} still defunct after retries");
                }
                info!(room_token, "client defunct, deferring restart");
                tokio::time::sleep(DEFUNCT_RETRY_DELAY).await;
            }
        }

        if !enable {
            info!(room_token, "no active call, ignoring disable request");
            return Ok(());
        }

        let hpb_servers = self.ensure_hpb_servers().await?;
        self.create_room(room_token, platform_sid, lang_id, hpb_servers)
            .await
    }

    async fn create_room(
        self: &Arc<Self>,
        room_token: &str,
        platform_sid: &str,
        lang_id: &str,
        hpb_servers: HpbServers,
    ) -> anyhow::Result<()> {
        let scope = CancellationToken::new();

        let on_leave: Arc<dyn Fn(String) + Send + Sync> = {
            let registry = Arc::downgrade(self);
            Arc::new(move |token: String| {
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                tokio::spawn(async move { registry.on_leave(&token).await });
            })
        };

        let (client, transcript_rx, pcm_rx) = SignalClient::new(
            SignalClientConfig {
                room_token: room_token.to_string(),
                room_lang: lang_id.to_string(),
                hpb_url: self.settings.hpb.url.clone(),
                internal_secret: self.settings.hpb.internal_secret.clone(),
                backend_url: self.settings.signaling_backend_url(),
                hpb_servers,
                skip_cert_verify: self.settings.tls.skip_cert_verify,
            },
            scope.clone(),
            on_leave,
        )?;

        let manager = Arc::new(RecognizerManager::new(
            Arc::clone(&self.models),
            lang_id.to_string(),
            RECOGNIZER_SAMPLE_RATE,
            client.transcript_sender(),
        ));

        let (translate_in_tx, translate_in_rx) = mpsc::channel(TRANSLATE_CHANNEL_CAPACITY);
        let (translate_out_tx, translate_out_rx) = mpsc::channel(TRANSLATE_CHANNEL_CAPACITY);
        let fanout = TranslationFanout::new(
            self.platform.clone(),
            room_token.to_string(),
            lang_id.to_string(),
            translate_in_rx,
            translate_out_tx,
            scope.clone(),
        );

        tokio::spawn(
            TranscriptSender::new(Arc::clone(&client), Arc::clone(&fanout), translate_in_tx)
                .run(transcript_rx, scope.child_token()),
        );
        tokio::spawn(AudioWorker::new(Arc::clone(&manager)).run(pcm_rx, scope.child_token()));
        tokio::spawn(
            TranslatedSender::new(Arc::clone(&client)).run(translate_out_rx, scope.child_token()),
        );

        self.rooms.lock().await.insert(
            room_token.to_string(),
            RoomState {
                client: Arc::clone(&client),
                manager,
                fanout,
                cancel: scope.clone(),
            },
        );

        let mut last_err: Option<anyhow::Error> = None;
        for _ in 0..MAX_CONNECT_TRIES {
            match client.connect(ReconnectMethod::NoReconnect).await {
                Ok(ConnectOutcome::Connected) => {
                    client.add_target(platform_sid);
                    info!(room_token, "connected to signaling server");
                    return Ok(());
                }
                Ok(ConnectOutcome::Retry) => {
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(room_token, error = %e, "connection failed");
                    last_err = Some(e.into());
                    break;
                }
            }
        }

        client.close().await;
        scope.cancel();
        self.rooms.lock().await.remove(room_token);
        match last_err {
            Some(e) => Err(e.context("connection failed")),
            None => anyhow::bail!("failed to connect after {MAX_CONNECT_TRIES} attempts"),
        }
    }

    pub async fn leave_call(&self, room_token: &str) {
        let client = {
            let rooms = self.rooms.lock().await;
            rooms.get(room_token).map(|room| Arc::clone(&room.client))
        };
        if let Some(client) = client {
            client.close().await;
        }
    }

    /// Switches the call's source language: the signaling client's room
    /// language, the recognizers, and the translation fan-out origin.
    pub async fn set_call_language(&self, room_token: &str, lang_id: &str) -> anyhow::Result<()> {
        let room = {
            let rooms = self.rooms.lock().await;
            rooms.get(room_token).map(|room| {
                (
                    Arc::clone(&room.client),
                    Arc::clone(&room.manager),
                    Arc::clone(&room.fanout),
                )
            })
        };
        let Some((client, manager, fanout)) = room else {
            info!(room_token, lang_id, "set call language (no active room)");
            return Ok(());
        };

        client.set_room_lang(lang_id);
        manager.set_language(lang_id)?;
        fanout.set_room_lang(lang_id);

        info!(room_token, lang_id, "set call language");
        Ok(())
    }

    /// Sets or clears one participant's translation target language.
    pub async fn set_target_language(
        &self,
        room_token: &str,
        platform_sid: &str,
        lang_id: Option<&str>,
    ) -> anyhow::Result<()> {
        let fanout = {
            let rooms = self.rooms.lock().await;
            rooms.get(room_token).map(|room| Arc::clone(&room.fanout))
        };
        let Some(fanout) = fanout else {
            info!(room_token, "set target language (no active room)");
            return Ok(());
        };

        match lang_id {
            None | Some("") => {
                fanout.remove_translator(platform_sid);
                info!(room_token, platform_sid, "removed target language");
            }
            Some(lang_id) => {
                fanout.add_translator(lang_id, platform_sid).await?;
                info!(room_token, platform_sid, lang_id, "set target language");
            }
        }
        Ok(())
    }

    /// Languages the translation provider offers, preferring the room's
    /// cached list when a room is active.
    pub async fn translation_languages(
        &self,
        room_token: &str,
    ) -> Option<SupportedTranslationLanguages> {
        let fanout = {
            let rooms = self.rooms.lock().await;
            rooms.get(room_token).map(|room| Arc::clone(&room.fanout))
        };
        if let Some(fanout) = fanout {
            match fanout.translation_languages().await {
                Ok(langs) => return Some(langs),
                Err(e) => warn!(error = %e, "failed to get translation languages from fan-out"),
            }
        }

        let probe = TaskTranslator::new(self.platform.clone(), "en", "en", "languages-probe");
        probe.get_translation_languages().await.ok()
    }

    /// Invoked by a signaling client when it closes; removes the defunct room.
    async fn on_leave(&self, room_token: &str) {
        let mut rooms = self.rooms.lock().await;
        let defunct = rooms
            .get(room_token)
            .map(|room| room.client.is_defunct())
            .unwrap_or(false);
        if !defunct {
            return;
        }
        if let Some(room) = rooms.remove(room_token) {
            room.cancel.cancel();
            room.fanout.shutdown();
            info!(room_token, "cleaned up defunct room");
        }
    }

    /// Closes every room, bounded by the shutdown window.
    pub async fn shutdown(&self) {
        let result = tokio::time::timeout(SHUTDOWN_WINDOW, async {
            let rooms: Vec<(String, RoomState)> = {
                let mut map = self.rooms.lock().await;
                map.drain().collect()
            };
            for (token, room) in rooms {
                room.client.close().await;
                room.cancel.cancel();
                room.fanout.shutdown();
                info!(room_token = %token, "room closed");
            }
        })
        .await;

        if result.is_err() {
            warn!("shutdown window elapsed before all rooms closed");
        }
        info!("room registry shutdown complete");
    }

    pub fn model_registry(&self) -> &Arc<ModelRegistry> {
        &self.models
    }
}
