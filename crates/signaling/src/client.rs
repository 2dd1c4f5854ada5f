use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use crate::messages::{
    sanitize_ws_url, DataMessage, HelloAuth, HelloAuthParams, HelloMessage, HpbServers,
    InCallMessage, InternalMessage, MessagePayload, Recipient, RoomMessage, SdpPayload,
    SignalingMessage, UserUpdateEntry, CALL_FLAG_DISCONNECTED, CALL_FLAG_IN_CALL,
    CALL_FLAG_WITH_AUDIO,
};
use crate::{peer, PcmAudio, Transcript};

const MSG_RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);
const CALL_LEAVE_TIMEOUT: Duration = Duration::from_secs(60);
const HANDSHAKE_MAX_MESSAGES: usize = 10;
const HELLO_VERSION: &str = "2.0";

const TRANSCRIPT_CHANNEL_CAPACITY: usize = 1000;
const PCM_CHANNEL_CAPACITY: usize = 100;
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("duplicate session")]
    DuplicateSession,
    #[error("rate limited by HPB")]
    RateLimited,
    #[error("received bye during handshake")]
    ByeDuringHandshake,
    #[error("signaling handshake failed: {0}")]
    Handshake(String),
    #[error("signaling error: {0}")]
    Protocol(String),
    #[error("websocket transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectMethod {
    NoReconnect,
    ShortResume,
    FullReconnect,
}

/// Outcome of a [`SignalClient::connect`] attempt. Fatal failures are `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// Transient failure; the caller may retry with backoff.
    Retry,
}

/// Construction parameters for a [`SignalClient`].
pub struct SignalClientConfig {
    pub room_token: String,
    pub room_lang: String,
    pub hpb_url: String,
    pub internal_secret: String,
    /// Control-plane URL the HPB uses to call back into the host platform.
    pub backend_url: String,
    pub hpb_servers: HpbServers,
    pub skip_cert_verify: bool,
}

#[derive(Default)]
struct SessionIds {
    session_id: String,
    resume_id: String,
}

#[derive(Default)]
struct TargetState {
    /// Transport session ids currently receiving captions.
    targets: HashSet<String>,
    /// Platform session id -> transport session id.
    platform_to_transport: HashMap<String, String>,
    /// Platform session ids whose target add is waiting for the id mapping.
    pending: HashSet<String>,
}

/// Per-room signaling client: owns the HPB WebSocket, the peer connections
/// feeding speaker audio, and the caption target set.
pub struct SignalClient {
    room_token: String,
    room_lang: Mutex<String>,
    secret: String,
    ws_url: String,
    backend_url: String,
    hpb_servers: HpbServers,
    skip_cert_verify: bool,

    api: API,

    /// Sender half of the outbound frame channel. A dedicated writer task
    /// owns the socket sink; dropping this sender drains and closes it.
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    msg_id: AtomicI64,
    session: Mutex<SessionIds>,
    defunct: AtomicBool,

    peer_conns: Mutex<HashMap<String, Arc<RTCPeerConnection>>>,
    targets: Mutex<TargetState>,
    deferred_close: Mutex<Option<JoinHandle<()>>>,
    monitor_cancel: Mutex<Option<CancellationToken>>,

    /// Room scope; track readers run under child tokens of this.
    scope: CancellationToken,

    transcript_tx: mpsc::Sender<Transcript>,
    pcm_tx: mpsc::Sender<PcmAudio>,
    on_leave: Arc<dyn Fn(String) + Send + Sync>,
}

impl SignalClient {
    /// Creates the client together with the receiving halves of its
    /// transcript and PCM channels.
    pub fn new(
        config: SignalClientConfig,
        scope: CancellationToken,
        on_leave: Arc<dyn Fn(String) + Send + Sync>,
    ) -> anyhow::Result<(
        Arc<Self>,
        mpsc::Receiver<Transcript>,
        mpsc::Receiver<PcmAudio>,
    )> {
        let (transcript_tx, transcript_rx) = mpsc::channel(TRANSCRIPT_CHANNEL_CAPACITY);
        let (pcm_tx, pcm_rx) = mpsc::channel(PCM_CHANNEL_CAPACITY);

        let client = Arc::new(Self {
            room_token: config.room_token,
            room_lang: Mutex::new(config.room_lang),
            secret: config.internal_secret,
            ws_url: sanitize_ws_url(&config.hpb_url),
            backend_url: config.backend_url,
            hpb_servers: config.hpb_servers,
            skip_cert_verify: config.skip_cert_verify,
            api: peer::build_api()?,
            outbound: Mutex::new(None),
            msg_id: AtomicI64::new(0),
            session: Mutex::new(SessionIds::default()),
            defunct: AtomicBool::new(false),
            peer_conns: Mutex::new(HashMap::new()),
            targets: Mutex::new(TargetState::default()),
            deferred_close: Mutex::new(None),
            monitor_cancel: Mutex::new(None),
            scope,
            transcript_tx,
            pcm_tx,
            on_leave,
        });

        Ok((client, transcript_rx, pcm_rx))
    }

    pub fn room_token(&self) -> &str {
        &self.room_token
    }

    pub fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::SeqCst)
    }

    pub fn room_lang(&self) -> String {
        self.room_lang.lock().unwrap().clone()
    }

    pub fn set_room_lang(&self, lang: &str) {
        *self.room_lang.lock().unwrap() = lang.to_string();
    }

    pub fn transcript_sender(&self) -> mpsc::Sender<Transcript> {
        self.transcript_tx.clone()
    }

    /// Maps a platform session id to its transport session id, if known.
    pub fn resolve_platform_sid(&self, platform_sid: &str) -> Option<String> {
        self.targets
            .lock()
            .unwrap()
            .platform_to_transport
            .get(platform_sid)
            .cloned()
    }

    // ---- connection ------------------------------------------------------

    /// Dials the HPB and performs the hello handshake (or a short resume).
    pub async fn connect(
        self: &Arc<Self>,
        method: ReconnectMethod,
    ) -> Result<ConnectOutcome, SignalError> {
        if method != ReconnectMethod::FullReconnect
            && self.outbound.lock().unwrap().is_some()
            && !self.is_defunct()
        {
            debug!(room_token = %self.room_token, "already connected, skipping");
            return Ok(ConnectOutcome::Connected);
        }

        if method == ReconnectMethod::FullReconnect {
            info!(room_token = %self.room_token, "performing full reconnect");
            *self.outbound.lock().unwrap() = None;
            let mut session = self.session.lock().unwrap();
            session.session_id.clear();
            session.resume_id.clear();
        }

        let connector = self.tls_connector()?;
        let (stream, _) = match connect_async_tls_with_config(
            self.ws_url.as_str(),
            None,
            false,
            connector,
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                error!(room_token = %self.room_token, error = %e, "failed to connect to HPB");
                return Ok(ConnectOutcome::Retry);
            }
        };
        let (sink, mut reader) = stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        *self.outbound.lock().unwrap() = Some(outbound_tx);
        let room_token = self.room_token.clone();
        tokio::spawn(write_outbound(room_token, sink, outbound_rx));

        let resume_id = {
            let session = self.session.lock().unwrap();
            session.resume_id.clone()
        };

        let outcome = if method == ReconnectMethod::ShortResume && !resume_id.is_empty() {
            self.resume_handshake(&mut reader, &resume_id).await
        } else {
            self.hello_handshake(&mut reader).await
        };

        match outcome {
            Ok(ConnectOutcome::Connected) => {}
            other => {
                // Dropping the sender lets the writer drain and close the socket.
                *self.outbound.lock().unwrap() = None;
                return other;
            }
        }

        self.defunct.store(false, Ordering::SeqCst);

        let monitor_cancel = self.scope.child_token();
        *self.monitor_cancel.lock().unwrap() = Some(monitor_cancel.clone());
        let client = Arc::clone(self);
        tokio::spawn(async move { client.monitor(reader, monitor_cancel).await });

        self.send_in_call();
        self.send_join();

        let no_targets = self.targets.lock().unwrap().targets.is_empty();
        if no_targets {
            self.start_deferred_close();
        }

        info!(room_token = %self.room_token, "connected to signaling server");
        Ok(ConnectOutcome::Connected)
    }

    fn tls_connector(&self) -> Result<Option<Connector>, SignalError> {
        if !(self.ws_url.starts_with("wss://") && self.skip_cert_verify) {
            return Ok(None);
        }
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| SignalError::Transport(format!("TLS connector: {e}")))?;
        Ok(Some(Connector::NativeTls(tls)))
    }

    /// Full handshake: random nonce, HMAC token, wait for the server hello.
    async fn hello_handshake(
        &self,
        reader: &mut WsStream,
    ) -> Result<ConnectOutcome, SignalError> {
        let nonce = generate_nonce();
        let token = hmac_hex(&self.secret, &nonce);
        self.send(SignalingMessage {
            kind: "hello".to_string(),
            hello: Some(HelloMessage {
                version: Some(HELLO_VERSION.to_string()),
                auth: Some(HelloAuth {
                    kind: "internal".to_string(),
                    params: Some(HelloAuthParams {
                        random: nonce,
                        token,
                        backend: self.backend_url.clone(),
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });

        for _ in 0..HANDSHAKE_MAX_MESSAGES {
            let msg = self.receive_handshake_message(reader).await?;
            let kind = msg.kind.clone();
            match kind.as_str() {
                "welcome" => continue,
                "hello" => {
                    if let Some(hello) = msg.hello {
                        let mut session = self.session.lock().unwrap();
                        session.session_id = hello.session_id.unwrap_or_default();
                        session.resume_id = hello.resume_id.unwrap_or_default();
                        info!(
                            room_token = %self.room_token,
                            session_id = %session.session_id,
                            "hello handshake complete"
                        );
                    }
                    return Ok(ConnectOutcome::Connected);
                }
                "error" => {
                    let code = msg.error.map(|e| e.code).unwrap_or_default();
                    error!(room_token = %self.room_token, %code, "signaling error during connect");
                    return match code.as_str() {
                        "duplicate_session" => Err(SignalError::DuplicateSession),
                        "room_join_failed" => Ok(ConnectOutcome::Retry),
                        _ => Err(SignalError::Protocol(code)),
                    };
                }
                "bye" => {
                    info!(room_token = %self.room_token, "received bye during connect");
                    return Err(SignalError::ByeDuringHandshake);
                }
                _ => continue,
            }
        }
        Err(SignalError::Handshake("did not receive hello response".into()))
    }

    /// Short resume: present the cached resume id instead of re-authenticating.
    async fn resume_handshake(
        &self,
        reader: &mut WsStream,
        resume_id: &str,
    ) -> Result<ConnectOutcome, SignalError> {
        self.send(SignalingMessage {
            kind: "hello".to_string(),
            hello: Some(HelloMessage {
                version: Some(HELLO_VERSION.to_string()),
                resume_id: Some(resume_id.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });

        for _ in 0..HANDSHAKE_MAX_MESSAGES {
            let msg = match self.receive_handshake_message(reader).await {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(room_token = %self.room_token, error = %e, "short resume failed");
                    return Ok(ConnectOutcome::Retry);
                }
            };
            let kind = msg.kind.clone();
            match kind.as_str() {
                "hello" => {
                    if let Some(hello) = msg.hello {
                        let mut session = self.session.lock().unwrap();
                        session.session_id = hello.session_id.unwrap_or_default();
                    }
                    info!(room_token = %self.room_token, "resumed connection");
                    return Ok(ConnectOutcome::Connected);
                }
                "error" => {
                    let code = msg.error.map(|e| e.code).unwrap_or_default();
                    return match code.as_str() {
                        "no_such_session" => Ok(ConnectOutcome::Retry),
                        "too_many_requests" => Err(SignalError::RateLimited),
                        _ => Ok(ConnectOutcome::Retry),
                    };
                }
                _ => continue,
            }
        }
        Ok(ConnectOutcome::Retry)
    }

    async fn receive_handshake_message(
        &self,
        reader: &mut WsStream,
    ) -> Result<SignalingMessage, SignalError> {
        loop {
            let frame = timeout(MSG_RECEIVE_TIMEOUT, reader.next())
                .await
                .map_err(|_| SignalError::Handshake("timed out waiting for server".into()))?
                .ok_or_else(|| SignalError::Transport("connection closed during handshake".into()))?
                .map_err(|e| SignalError::Transport(e.to_string()))?;
            if let Some(msg) = decode_frame(frame) {
                return Ok(msg);
            }
        }
    }

    // ---- monitor ---------------------------------------------------------

    async fn monitor(self: Arc<Self>, mut reader: WsStream, cancel: CancellationToken) {
        debug!(room_token = %self.room_token, "signaling monitor started");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = reader.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    error!(room_token = %self.room_token, error = %e, "websocket error, closing");
                    self.close().await;
                    break;
                }
                None => {
                    if !cancel.is_cancelled() {
                        info!(room_token = %self.room_token, "connection closed by remote");
                        self.close().await;
                    }
                    break;
                }
            };

            let Some(msg) = decode_frame(frame) else {
                continue;
            };

            let kind = msg.kind.clone();
            match kind.as_str() {
                "error" => {
                    let code = msg.error.as_ref().map(|e| e.code.clone()).unwrap_or_default();
                    if code == "processing_failed" {
                        warn!(room_token = %self.room_token, "HPB failed to process a message");
                        continue;
                    }
                    error!(room_token = %self.room_token, %code, "signaling error, closing");
                    self.close().await;
                    break;
                }
                "event" => self.handle_event(&msg).await,
                "message" => self.handle_message(&msg).await,
                "bye" => {
                    info!(room_token = %self.room_token, "received bye, closing");
                    self.close().await;
                    break;
                }
                _ => {}
            }
        }

        debug!(room_token = %self.room_token, "signaling monitor stopped");
    }

    // ---- participants ----------------------------------------------------

    async fn handle_event(self: &Arc<Self>, msg: &SignalingMessage) {
        let Some(event) = &msg.event else { return };
        if event.target != "participants" || event.kind != "update" {
            return;
        }
        let Some(update) = &event.update else { return };

        if update.all && update.in_call == CALL_FLAG_DISCONNECTED {
            info!(room_token = %self.room_token, "call ended for everyone");
            self.close().await;
            return;
        }

        for user in &update.users {
            if user.internal {
                continue;
            }

            if user.in_call == CALL_FLAG_DISCONNECTED {
                debug!(session_id = %user.session_id, "user disconnected");
                self.remove_target_by_transport_sid(&user.session_id);

                let pc = self.peer_conns.lock().unwrap().remove(&user.session_id);
                if let Some(pc) = pc {
                    let _ = pc.close().await;
                }

                if !user.platform_session_id.is_empty() {
                    self.targets
                        .lock()
                        .unwrap()
                        .platform_to_transport
                        .remove(&user.platform_session_id);
                }
                continue;
            }

            if !user.platform_session_id.is_empty() {
                let mut state = self.targets.lock().unwrap();
                state
                    .platform_to_transport
                    .insert(user.platform_session_id.clone(), user.session_id.clone());
                if state.pending.remove(&user.platform_session_id) {
                    state.targets.insert(user.session_id.clone());
                    debug!(
                        platform_sid = %user.platform_session_id,
                        session_id = %user.session_id,
                        "resolved stashed target"
                    );
                }
            }

            if user.in_call & CALL_FLAG_IN_CALL != 0 && user.in_call & CALL_FLAG_WITH_AUDIO != 0 {
                let exists = self
                    .peer_conns
                    .lock()
                    .unwrap()
                    .contains_key(&user.session_id);
                if !exists {
                    debug!(session_id = %user.session_id, "user joined with audio, requesting offer");
                    self.send_offer_request(&user.session_id);
                }
            }
        }

        if update.users.len() == 2 {
            self.check_last_user_left(&update.users).await;
        }
    }

    async fn check_last_user_left(self: &Arc<Self>, users: &[UserUpdateEntry]) {
        let own_sid = self.session.lock().unwrap().session_id.clone();
        let mut us = None;
        let mut them = None;
        for user in users {
            if user.session_id == own_sid {
                us = Some(user);
            } else {
                them = Some(user);
            }
        }
        let (Some(us), Some(them)) = (us, them) else {
            return;
        };
        if us.in_call & CALL_FLAG_IN_CALL != 0 && them.in_call == CALL_FLAG_DISCONNECTED {
            info!(room_token = %self.room_token, "last user left the call, closing");
            self.close().await;
        }
    }

    // ---- peer connections ------------------------------------------------

    async fn handle_message(self: &Arc<Self>, msg: &SignalingMessage) {
        let Some(data_msg) = &msg.message else { return };
        let Some(data) = &data_msg.data else { return };
        match data.kind.as_str() {
            "offer" => self.handle_offer(data_msg).await,
            "candidate" => self.handle_candidate(data_msg).await,
            _ => {}
        }
    }

    async fn handle_offer(self: &Arc<Self>, data_msg: &DataMessage) {
        let Some(sender) = &data_msg.sender else { return };
        let Some(data) = &data_msg.data else { return };
        let Some(payload) = &data.payload else { return };
        let Some(sdp) = payload.sdp.clone() else { return };

        let speaker_sid = sender.session_id.clone();
        let offer_sid = data.sid.clone().unwrap_or_default();
        debug!(speaker_sid = %speaker_sid, offer_sid = %offer_sid, "received offer");

        // A re-offer replaces the previous peer connection for this speaker.
        let old = self.peer_conns.lock().unwrap().remove(&speaker_sid);
        if let Some(old) = old {
            let _ = old.close().await;
        }

        let config = peer::ice_config(&self.hpb_servers);
        let pc = match self.api.new_peer_connection(config).await {
            Ok(pc) => Arc::new(pc),
            Err(e) => {
                error!(error = %e, "failed to create peer connection");
                return;
            }
        };

        let transceiver_init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        };
        if let Err(e) = pc
            .add_transceiver_from_kind(RTPCodecType::Audio, Some(transceiver_init))
            .await
        {
            error!(error = %e, "failed to add audio transceiver");
            let _ = pc.close().await;
            return;
        }

        {
            let weak = Arc::downgrade(self);
            let sid = speaker_sid.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let weak = weak.clone();
                let sid = sid.clone();
                Box::pin(async move {
                    debug!(session_id = %sid, ?state, "peer connection state changed");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        if let Some(client) = weak.upgrade() {
                            client.peer_conns.lock().unwrap().remove(&sid);
                        }
                    }
                })
            }));
        }

        {
            let weak = Arc::downgrade(self);
            let sid = speaker_sid.clone();
            pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let weak = weak.clone();
                let sid = sid.clone();
                Box::pin(async move {
                    if track.kind() != RTPCodecType::Audio {
                        return;
                    }
                    let Some(client) = weak.upgrade() else { return };
                    debug!(session_id = %sid, "receiving audio track");
                    tokio::spawn(peer::read_audio_track(
                        client.scope.child_token(),
                        sid.clone(),
                        track,
                        client.pcm_tx.clone(),
                    ));
                })
            }));
        }

        {
            let weak = Arc::downgrade(self);
            let sid = speaker_sid.clone();
            let offer_sid = offer_sid.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let weak = weak.clone();
                let sid = sid.clone();
                let offer_sid = offer_sid.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    let Some(client) = weak.upgrade() else { return };
                    match candidate.to_json() {
                        Ok(init) => client.send_candidate(&sid, &offer_sid, &init.candidate),
                        Err(e) => warn!(error = %e, "failed to serialize ICE candidate"),
                    }
                })
            }));
        }

        let offer = match RTCSessionDescription::offer(sdp) {
            Ok(offer) => offer,
            Err(e) => {
                error!(error = %e, "invalid offer SDP");
                let _ = pc.close().await;
                return;
            }
        };
        if let Err(e) = pc.set_remote_description(offer).await {
            error!(error = %e, "failed to set remote description");
            let _ = pc.close().await;
            return;
        }

        let answer = match pc.create_answer(None).await {
            Ok(answer) => answer,
            Err(e) => {
                error!(error = %e, "failed to create answer");
                let _ = pc.close().await;
                return;
            }
        };
        let answer_sdp = answer.sdp.clone();
        if let Err(e) = pc.set_local_description(answer).await {
            error!(error = %e, "failed to set local description");
            let _ = pc.close().await;
            return;
        }

        self.peer_conns
            .lock()
            .unwrap()
            .insert(speaker_sid.clone(), Arc::clone(&pc));

        let reply_to = data
            .from
            .clone()
            .filter(|from| !from.is_empty())
            .unwrap_or_else(|| speaker_sid.clone());
        self.send_answer(&reply_to, &offer_sid, &answer_sdp);

        debug!(speaker_sid = %speaker_sid, "sent answer for offer");
    }

    async fn handle_candidate(&self, data_msg: &DataMessage) {
        let Some(sender) = &data_msg.sender else { return };
        let Some(data) = &data_msg.data else { return };
        let Some(payload) = &data.payload else { return };
        let Some(candidate) = &payload.candidate else { return };

        let pc = self
            .peer_conns
            .lock()
            .unwrap()
            .get(&sender.session_id)
            .cloned();
        // No peer connection for this sender: nothing to feed the candidate into.
        let Some(pc) = pc else { return };

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: Some(candidate.sdp_mid.clone()),
            sdp_mline_index: Some(candidate.sdp_mline_index as u16),
            username_fragment: None,
        };
        if let Err(e) = pc.add_ice_candidate(init).await {
            warn!(error = %e, session_id = %sender.session_id, "failed to add ICE candidate");
        }
    }

    // ---- target set ------------------------------------------------------

    /// Marks a participant (by platform session id) as a caption recipient.
    /// If the transport mapping is not known yet, the add is stashed until a
    /// participant update delivers it.
    pub fn add_target(self: &Arc<Self>, platform_sid: &str) {
        self.cancel_deferred_close();

        let mut state = self.targets.lock().unwrap();
        match state.platform_to_transport.get(platform_sid).cloned() {
            Some(transport_sid) => {
                state.pending.remove(platform_sid);
                state.targets.insert(transport_sid.clone());
                debug!(session_id = %transport_sid, platform_sid = %platform_sid, "added target");
            }
            None => {
                state.pending.insert(platform_sid.to_string());
                debug!(platform_sid = %platform_sid, "transport session unknown, stashing target");
            }
        }
    }

    pub fn remove_target(self: &Arc<Self>, platform_sid: &str) {
        let now_empty = {
            let mut state = self.targets.lock().unwrap();
            state.pending.remove(platform_sid);
            let Some(transport_sid) = state.platform_to_transport.get(platform_sid).cloned() else {
                return;
            };
            state.targets.remove(&transport_sid);
            debug!(session_id = %transport_sid, platform_sid = %platform_sid, "removed target");
            state.targets.is_empty()
        };
        if now_empty {
            self.start_deferred_close();
        }
    }

    fn remove_target_by_transport_sid(self: &Arc<Self>, transport_sid: &str) {
        let now_empty = {
            let mut state = self.targets.lock().unwrap();
            state.targets.remove(transport_sid);
            state.targets.is_empty()
        };
        if now_empty {
            self.start_deferred_close();
        }
    }

    fn start_deferred_close(self: &Arc<Self>) {
        let mut guard = self.deferred_close.lock().unwrap();
        if let Some(previous) = guard.take() {
            previous.abort();
        }
        debug!(room_token = %self.room_token, timeout = ?CALL_LEAVE_TIMEOUT, "starting deferred close timer");
        let weak = Arc::downgrade(self);
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(CALL_LEAVE_TIMEOUT).await;
            let Some(client) = weak.upgrade() else { return };
            if client.is_defunct() {
                return;
            }
            let no_targets = client.targets.lock().unwrap().targets.is_empty();
            if no_targets {
                info!(room_token = %client.room_token, "no targets after deferred close timeout, leaving call");
                client.close().await;
            }
        }));
    }

    fn cancel_deferred_close(&self) {
        if let Some(handle) = self.deferred_close.lock().unwrap().take() {
            handle.abort();
        }
    }

    // ---- outgoing messages -----------------------------------------------

    /// Queues one envelope for the writer task, stamping the next monotonic
    /// message id. Never blocks; a full outbound channel drops the message.
    pub fn send(&self, mut msg: SignalingMessage) {
        let id = self.msg_id.fetch_add(1, Ordering::SeqCst) + 1;
        msg.id = Some(id.to_string());

        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "failed to serialize signaling message");
                return;
            }
        };

        let tx = self.outbound.lock().unwrap().clone();
        let Some(tx) = tx else { return };
        match tx.try_send(Message::Text(text)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(room_token = %self.room_token, "outbound channel full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(room_token = %self.room_token, "writer gone, dropping message");
            }
        }
    }

    fn send_in_call(&self) {
        self.send(SignalingMessage {
            kind: "internal".to_string(),
            internal: Some(InternalMessage {
                kind: "incall".to_string(),
                incall: Some(InCallMessage {
                    incall: CALL_FLAG_IN_CALL,
                }),
            }),
            ..Default::default()
        });
    }

    fn send_join(&self) {
        let session_id = self.session.lock().unwrap().session_id.clone();
        self.send(SignalingMessage {
            kind: "room".to_string(),
            room: Some(RoomMessage {
                room_id: self.room_token.clone(),
                session_id: Some(session_id),
            }),
            ..Default::default()
        });
    }

    fn send_offer_request(&self, publisher_sid: &str) {
        self.send(SignalingMessage {
            kind: "message".to_string(),
            message: Some(DataMessage {
                recipient: Some(Recipient::session(publisher_sid)),
                sender: None,
                data: Some(MessagePayload {
                    kind: "requestoffer".to_string(),
                    room_type: Some("video".to_string()),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        });
    }

    fn send_answer(&self, publisher_sid: &str, offer_sid: &str, sdp: &str) {
        self.send(SignalingMessage {
            kind: "message".to_string(),
            message: Some(DataMessage {
                recipient: Some(Recipient::session(publisher_sid)),
                sender: None,
                data: Some(MessagePayload {
                    kind: "answer".to_string(),
                    room_type: Some("video".to_string()),
                    to: Some(publisher_sid.to_string()),
                    sid: Some(offer_sid.to_string()),
                    payload: Some(SdpPayload {
                        nick: Some("live_captions".to_string()),
                        kind: "answer".to_string(),
                        sdp: Some(sdp.to_string()),
                        candidate: None,
                    }),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        });
    }

    fn send_candidate(&self, publisher_sid: &str, offer_sid: &str, candidate: &str) {
        self.send(SignalingMessage {
            kind: "message".to_string(),
            message: Some(DataMessage {
                recipient: Some(Recipient::session(publisher_sid)),
                sender: None,
                data: Some(MessagePayload {
                    kind: "candidate".to_string(),
                    room_type: Some("video".to_string()),
                    to: Some(publisher_sid.to_string()),
                    sid: Some(offer_sid.to_string()),
                    payload: Some(SdpPayload {
                        nick: None,
                        kind: "candidate".to_string(),
                        sdp: None,
                        candidate: Some(crate::messages::CandidateInfo {
                            candidate: candidate.to_string(),
                            sdp_mline_index: 0,
                            sdp_mid: "0".to_string(),
                        }),
                    }),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        });
    }

    /// Fans one caption out to every target. When `exclude_platform_sid` is
    /// given, targets whose platform session id satisfies it are skipped
    /// (translation recipients get the translated text instead).
    pub fn send_transcript(
        &self,
        transcript: &Transcript,
        exclude_platform_sid: Option<&(dyn Fn(&str) -> bool + Send + Sync)>,
    ) {
        let targets: Vec<(String, String)> = {
            let state = self.targets.lock().unwrap();
            let reverse: Option<HashMap<&String, &String>> = exclude_platform_sid
                .map(|_| state.platform_to_transport.iter().map(|(p, t)| (t, p)).collect());
            state
                .targets
                .iter()
                .map(|transport_sid| {
                    let platform_sid = reverse
                        .as_ref()
                        .and_then(|r| r.get(transport_sid))
                        .map(|p| p.to_string())
                        .unwrap_or_default();
                    (transport_sid.clone(), platform_sid)
                })
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        for (transport_sid, platform_sid) in targets {
            if let Some(excluded) = exclude_platform_sid {
                if !platform_sid.is_empty() && excluded(&platform_sid) {
                    continue;
                }
            }
            self.send(SignalingMessage::transcript(
                &transport_sid,
                transcript.is_final,
                &transcript.lang_id,
                &transcript.message,
                &transcript.speaker_session_id,
            ));
        }
    }

    /// Delivers a translated caption to the given platform sessions,
    /// resolving each to its transport session id. Translated text is always
    /// final.
    pub fn send_translated(
        &self,
        target_lang: &str,
        message: &str,
        speaker_session_id: &str,
        recipients: &HashSet<String>,
    ) {
        let resolved: Vec<String> = {
            let state = self.targets.lock().unwrap();
            recipients
                .iter()
                .filter_map(|platform_sid| state.platform_to_transport.get(platform_sid).cloned())
                .collect()
        };
        for transport_sid in resolved {
            self.send(SignalingMessage::transcript(
                &transport_sid,
                true,
                target_lang,
                message,
                speaker_session_id,
            ));
        }
    }

    // ---- teardown --------------------------------------------------------

    /// Tears the client down: cancels the monitor, says bye, closes peer
    /// connections and the socket, and notifies the registry. Idempotent.
    pub async fn close(self: &Arc<Self>) {
        if self.defunct.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(cancel) = self.monitor_cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        self.cancel_deferred_close();

        // Queue the bye, then drop the outbound sender: the writer task
        // drains what is queued and closes the socket.
        self.send(SignalingMessage::bye());
        *self.outbound.lock().unwrap() = None;

        let conns: Vec<Arc<RTCPeerConnection>> = {
            let mut map = self.peer_conns.lock().unwrap();
            map.drain().map(|(_, pc)| pc).collect()
        };
        for pc in conns {
            let _ = pc.close().await;
        }

        info!(room_token = %self.room_token, "signaling client closed");

        // The leave callback may re-enter the registry; run it on its own task.
        let on_leave = Arc::clone(&self.on_leave);
        let room_token = self.room_token.clone();
        tokio::spawn(async move {
            on_leave(room_token);
        });
    }

    #[cfg(test)]
    fn target_transport_sids(&self) -> HashSet<String> {
        self.targets.lock().unwrap().targets.clone()
    }

    #[cfg(test)]
    fn pending_platform_sids(&self) -> HashSet<String> {
        self.targets.lock().unwrap().pending.clone()
    }
}

/// Writer task: sole owner of the socket sink. Drains the outbound channel
/// and closes the socket once every sender handle is gone.
async fn write_outbound(room_token: String, mut sink: WsSink, mut rx: mpsc::Receiver<Message>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            error!(room_token = %room_token, error = %e, "failed to send signaling message");
            break;
        }
    }
    let _ = sink.close().await;
}

fn decode_frame(frame: Message) -> Option<SignalingMessage> {
    let text = match frame {
        Message::Text(text) => text,
        _ => return None,
    };
    match serde_json::from_str::<SignalingMessage>(&text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!(error = %e, "ignoring unparseable signaling message");
            None
        }
    }
}

fn hmac_hex(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn generate_nonce() -> String {
    let mut buf = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{EventMessage, EventUpdate};

    fn test_client() -> (Arc<SignalClient>, mpsc::Receiver<Transcript>, mpsc::Receiver<PcmAudio>) {
        let config = SignalClientConfig {
            room_token: "room-1".to_string(),
            room_lang: "en".to_string(),
            hpb_url: "https://hpb.invalid".to_string(),
            internal_secret: "secret".to_string(),
            backend_url: "https://cloud.invalid/backend".to_string(),
            hpb_servers: HpbServers::default(),
            skip_cert_verify: false,
        };
        SignalClient::new(config, CancellationToken::new(), Arc::new(|_| {})).unwrap()
    }

    fn participant_update(users: Vec<UserUpdateEntry>) -> SignalingMessage {
        SignalingMessage {
            kind: "event".to_string(),
            event: Some(EventMessage {
                target: "participants".to_string(),
                kind: "update".to_string(),
                update: Some(EventUpdate {
                    all: false,
                    in_call: 0,
                    users,
                }),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn target_added_before_mapping_is_stashed_then_resolved() {
        let (client, _t, _p) = test_client();

        client.add_target("P1");
        assert!(client.target_transport_sids().is_empty());
        assert_eq!(client.pending_platform_sids().len(), 1);

        let update = participant_update(vec![UserUpdateEntry {
            session_id: "T1".to_string(),
            platform_session_id: "P1".to_string(),
            in_call: CALL_FLAG_IN_CALL,
            internal: false,
        }]);
        client.handle_event(&update).await;

        assert!(client.pending_platform_sids().is_empty());
        assert!(client.target_transport_sids().contains("T1"));
    }

    #[tokio::test]
    async fn internal_participants_are_ignored() {
        let (client, _t, _p) = test_client();
        client.add_target("P1");

        let update = participant_update(vec![UserUpdateEntry {
            session_id: "T1".to_string(),
            platform_session_id: "P1".to_string(),
            in_call: CALL_FLAG_IN_CALL,
            internal: true,
        }]);
        client.handle_event(&update).await;

        // Internal entries must not populate the mapping or drain the stash.
        assert!(client.target_transport_sids().is_empty());
        assert_eq!(client.pending_platform_sids().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_removes_target_and_mapping() {
        let (client, _t, _p) = test_client();
        client.add_target("P1");
        client
            .handle_event(&participant_update(vec![UserUpdateEntry {
                session_id: "T1".to_string(),
                platform_session_id: "P1".to_string(),
                in_call: CALL_FLAG_IN_CALL,
                internal: false,
            }]))
            .await;
        assert!(client.target_transport_sids().contains("T1"));

        client
            .handle_event(&participant_update(vec![UserUpdateEntry {
                session_id: "T1".to_string(),
                platform_session_id: "P1".to_string(),
                in_call: CALL_FLAG_DISCONNECTED,
                internal: false,
            }]))
            .await;

        assert!(client.target_transport_sids().is_empty());
        assert!(client.resolve_platform_sid("P1").is_none());
    }

    #[tokio::test]
    async fn remove_target_drains_stash() {
        let (client, _t, _p) = test_client();
        client.add_target("P2");
        assert_eq!(client.pending_platform_sids().len(), 1);
        client.remove_target("P2");
        assert!(client.pending_platform_sids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_close_fires_when_targets_stay_empty() {
        let (client, _t, _p) = test_client();
        client.start_deferred_close();

        tokio::time::sleep(CALL_LEAVE_TIMEOUT + Duration::from_secs(1)).await;
        // Let the deferred task run to completion.
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(client.is_defunct());
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_close_cancelled_by_new_target() {
        let (client, _t, _p) = test_client();
        client
            .handle_event(&participant_update(vec![UserUpdateEntry {
                session_id: "T1".to_string(),
                platform_session_id: "P1".to_string(),
                in_call: CALL_FLAG_IN_CALL,
                internal: false,
            }]))
            .await;

        client.start_deferred_close();
        tokio::time::sleep(Duration::from_secs(30)).await;
        client.add_target("P1");

        tokio::time::sleep(CALL_LEAVE_TIMEOUT).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!client.is_defunct());
        assert!(client.target_transport_sids().contains("T1"));
    }

    #[tokio::test]
    async fn last_user_left_closes_the_client() {
        let (client, _t, _p) = test_client();
        client.session.lock().unwrap().session_id = "US".to_string();

        client
            .handle_event(&participant_update(vec![
                UserUpdateEntry {
                    session_id: "US".to_string(),
                    platform_session_id: String::new(),
                    in_call: CALL_FLAG_IN_CALL,
                    internal: false,
                },
                UserUpdateEntry {
                    session_id: "T2".to_string(),
                    platform_session_id: "P2".to_string(),
                    in_call: CALL_FLAG_DISCONNECTED,
                    internal: false,
                },
            ]))
            .await;

        assert!(client.is_defunct());
    }

    #[tokio::test]
    async fn call_ended_for_everyone_closes_the_client() {
        let (client, _t, _p) = test_client();
        let msg = SignalingMessage {
            kind: "event".to_string(),
            event: Some(EventMessage {
                target: "participants".to_string(),
                kind: "update".to_string(),
                update: Some(EventUpdate {
                    all: true,
                    in_call: CALL_FLAG_DISCONNECTED,
                    users: vec![],
                }),
            }),
            ..Default::default()
        };
        client.handle_event(&msg).await;
        assert!(client.is_defunct());
    }
}
