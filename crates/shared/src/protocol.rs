use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{
    ChatState, ContactId, MessageId, PresenceKind, SessionKey, SubscriptionKind,
};

pub const UPDATE_NEW_MESSAGE: i64 = 4;
pub const UPDATE_CONTACT_ONLINE: i64 = 8;
pub const UPDATE_CONTACT_OFFLINE: i64 = 9;
pub const UPDATE_TYPING: i64 = 61;

/// Envelope of every remote method response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error_code: u32,
    #[serde(default)]
    pub error_msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captcha_sid: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captcha_img: Option<String>,
}

impl ApiErrorBody {
    /// The sid arrives as either a number or a string depending on the endpoint.
    pub fn captcha_sid_string(&self) -> Option<String> {
        match self.captcha_sid.as_ref()? {
            Value::String(sid) => Some(sid.clone()),
            Value::Number(sid) => Some(sid.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthTokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub captcha_sid: Option<Value>,
    #[serde(default)]
    pub captcha_img: Option<String>,
}

/// Server-provided coordinates of one long-poll stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongPollEndpoint {
    pub server: String,
    pub key: String,
    #[serde(deserialize_with = "lenient_i64")]
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    NewMessage,
    ContactOnline(ContactId),
    ContactOffline(ContactId),
    Typing(ContactId),
    Other(i64),
}

impl UpdateEvent {
    pub fn from_value(value: &Value) -> Option<Self> {
        let fields = value.as_array()?;
        let tag = fields.first()?.as_i64()?;
        let contact = || fields.get(1).and_then(as_lenient_i64).map(ContactId::from_signed);
        let event = match tag {
            UPDATE_NEW_MESSAGE => Self::NewMessage,
            UPDATE_CONTACT_ONLINE => Self::ContactOnline(contact()?),
            UPDATE_CONTACT_OFFLINE => Self::ContactOffline(contact()?),
            UPDATE_TYPING => Self::Typing(contact()?),
            other => Self::Other(other),
        };
        Some(event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollPayload {
    /// The poll key or cursor is no longer valid; a fresh endpoint is required.
    Failed,
    Updates { ts: i64, updates: Vec<UpdateEvent> },
}

impl PollPayload {
    /// Returns `None` for empty or undecodable payloads.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        let value: Value = serde_json::from_slice(raw).ok()?;
        let object = value.as_object()?;
        if object.contains_key("failed") {
            return Some(Self::Failed);
        }
        let ts = object.get("ts").and_then(as_lenient_i64)?;
        let updates = object
            .get("updates")
            .and_then(Value::as_array)
            .map(|updates| updates.iter().filter_map(UpdateEvent::from_value).collect())
            .unwrap_or_default();
        Some(Self::Updates { ts, updates })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteMessage {
    pub id: Option<i64>,
    pub user_id: i64,
    pub date: i64,
    pub out: u8,
    pub body: String,
    pub chat_id: Option<i64>,
    pub attachments: Vec<Attachment>,
    pub fwd_messages: Vec<RemoteMessage>,
}

impl RemoteMessage {
    /// Missing ids sort first so malformed batches still have a total order.
    pub fn sort_key(&self) -> MessageId {
        MessageId(self.id.unwrap_or(0))
    }

    pub fn is_outgoing(&self) -> bool {
        self.out != 0
    }

    pub fn contact(&self) -> ContactId {
        ContactId::from_signed(self.user_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageBatch {
    pub count: i64,
    pub items: Vec<RemoteMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

const PHOTO_SIZES: [&str; 6] = [
    "photo_2560",
    "photo_1280",
    "photo_807",
    "photo_604",
    "photo_130",
    "photo_75",
];

impl Attachment {
    pub fn url(&self) -> Option<String> {
        let inner = self.payload.get(&self.kind)?.as_object()?;
        if let Some(url) = inner.get("url").and_then(Value::as_str) {
            return Some(url.to_string());
        }
        if let Some(url) = PHOTO_SIZES
            .iter()
            .find_map(|size| inner.get(*size).and_then(Value::as_str))
        {
            return Some(url.to_string());
        }
        let owner = inner.get("owner_id").and_then(as_lenient_i64)?;
        let id = inner.get("id").and_then(as_lenient_i64)?;
        Some(format!("https://vk.com/{}{owner}_{id}", self.kind))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteContact {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub online: u8,
}

impl RemoteContact {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactList {
    pub count: i64,
    pub items: Vec<RemoteContact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaForm {
    pub title: String,
    pub instructions: String,
    pub field_var: String,
    pub field_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaPrompt {
    pub to: SessionKey,
    pub image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    pub form: CaptchaForm,
}

/// Stanzas the gateway hands to the messaging-network side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundStanza {
    Message {
        to: SessionKey,
        #[serde(default)]
        from: Option<ContactId>,
        body: String,
    },
    Presence {
        to: SessionKey,
        #[serde(default)]
        from: Option<ContactId>,
        kind: PresenceKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nick: Option<String>,
    },
    ChatState {
        to: SessionKey,
        from: ContactId,
        state: ChatState,
    },
    Subscription {
        to: SessionKey,
        /// `None` addresses the gateway's own subscription.
        #[serde(default)]
        contact: Option<ContactId>,
        kind: SubscriptionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nick: Option<String>,
    },
    Captcha(CaptchaPrompt),
}

impl OutboundStanza {
    pub fn recipient(&self) -> &SessionKey {
        match self {
            Self::Message { to, .. }
            | Self::Presence { to, .. }
            | Self::ChatState { to, .. }
            | Self::Subscription { to, .. } => to,
            Self::Captcha(prompt) => &prompt.to,
        }
    }
}

/// Stanzas received from the messaging-network side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundStanza {
    Login {
        from: SessionKey,
        resource: String,
        username: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    Available {
        from: SessionKey,
        resource: String,
    },
    Unavailable {
        from: SessionKey,
        resource: String,
    },
    Message {
        from: SessionKey,
        to: ContactId,
        body: String,
    },
    CaptchaAnswer {
        from: SessionKey,
        answer: String,
    },
    Unregister {
        from: SessionKey,
    },
}

fn as_lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    as_lenient_i64(&value).ok_or_else(|| serde::de::Error::custom("expected integer timestamp"))
}
