use serde::{Deserialize, Serialize};

/// Call participation flags carried in `incall` fields.
pub const CALL_FLAG_DISCONNECTED: u32 = 0;
pub const CALL_FLAG_IN_CALL: u32 = 1;
pub const CALL_FLAG_WITH_AUDIO: u32 = 2;

/// Signaling settings fetched once from the host platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HpbServers {
    #[serde(default)]
    pub server: String,
    #[serde(rename = "stunservers", default)]
    pub stun_servers: Vec<StunServer>,
    #[serde(rename = "turnservers", default)]
    pub turn_servers: Vec<TurnServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StunServer {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Wire envelope for the HPB WebSocket protocol.
///
/// Exactly one of the payload fields is attached per message; absent fields
/// must be omitted from the wire, never serialized as null.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hello: Option<HelloMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<DataMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<InternalMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bye: Option<ByeMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelloMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "resumeid", default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    #[serde(rename = "sessionid", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAuth {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<HelloAuthParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAuthParams {
    pub random: String,
    pub token: String,
    pub backend: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMessage {
    #[serde(rename = "roomid")]
    pub room_id: String,
    #[serde(rename = "sessionid", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Recipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Sender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sessionid")]
    pub session_id: String,
}

impl Recipient {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            kind: "session".to_string(),
            session_id: session_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "sessionid", default)]
    pub session_id: String,
}

/// Embedded data-message payload: WebRTC negotiation or a caption.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "roomType", default, skip_serializing_if = "Option::is_none")]
    pub room_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<SdpPayload>,

    #[serde(rename = "final", default, skip_serializing_if = "Option::is_none")]
    pub is_final: Option<bool>,
    #[serde(rename = "langId", default, skip_serializing_if = "Option::is_none")]
    pub lang_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        rename = "speakerSessionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub speaker_session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nick: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<CandidateInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateInfo {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: i32,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incall: Option<InCallMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InCallMessage {
    pub incall: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(default)]
    pub target: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<EventUpdate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventUpdate {
    #[serde(default)]
    pub all: bool,
    #[serde(rename = "incall", default)]
    pub in_call: u32,
    #[serde(default)]
    pub users: Vec<UserUpdateEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserUpdateEntry {
    /// Transport session id assigned by the HPB.
    #[serde(rename = "sessionId", default)]
    pub session_id: String,
    /// Session id assigned by the host platform, if known.
    #[serde(
        rename = "nextcloudSessionId",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub platform_session_id: String,
    #[serde(rename = "inCall", default)]
    pub in_call: u32,
    #[serde(default)]
    pub internal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ByeMessage {}

impl SignalingMessage {
    pub fn bye() -> Self {
        Self {
            kind: "bye".to_string(),
            bye: Some(ByeMessage {}),
            ..Default::default()
        }
    }

    /// A `message` envelope carrying a caption to one transport session.
    pub fn transcript(
        recipient_sid: &str,
        is_final: bool,
        lang_id: &str,
        message: &str,
        speaker_session_id: &str,
    ) -> Self {
        Self {
            kind: "message".to_string(),
            message: Some(DataMessage {
                recipient: Some(Recipient::session(recipient_sid)),
                sender: None,
                data: Some(MessagePayload {
                    kind: "transcript".to_string(),
                    is_final: Some(is_final),
                    lang_id: Some(lang_id.to_string()),
                    message: Some(message.to_string()),
                    speaker_session_id: Some(speaker_session_id.to_string()),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        }
    }
}

/// Normalizes an HPB URL to the WebSocket endpoint: http(s) becomes ws(s),
/// trailing slashes are trimmed, and the standalone-signaling path suffix is
/// appended if missing.
pub fn sanitize_ws_url(url: &str) -> String {
    let mut out = if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    };
    while out.ends_with('/') {
        out.pop();
    }
    if !out.ends_with("/spreed") {
        out.push_str("/spreed");
    }
    out
}
