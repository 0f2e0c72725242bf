//! Session data structures

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Title carried by a session until its first accepted turn
pub const PLACEHOLDER_TITLE: &str = "New Conversation";

/// Separates retained partial output from the failure explanation
pub const FAILURE_SEPARATOR: &str = "\n\n---\n";

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    /// Role name as understood by the generation service
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// Conversation mode; the prompt text for each mode lives in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Default,
    /// Answers grounded with web search; replies carry citations
    Research,
}

impl std::str::FromStr for Mode {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Mode::Default),
            "research" => Ok(Mode::Research),
            other => Err(crate::Error::Validation(format!("unknown mode: {}", other))),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Default => f.write_str("default"),
            Mode::Research => f.write_str("research"),
        }
    }
}

/// A source used to ground a model reply. Identity is the `uri`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub uri: String,
}

impl Citation {
    pub fn new(title: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            uri: uri.into(),
        }
    }
}

/// Binary content supplied alongside a user message.
///
/// The payload is reference counted, so cloning an attachment into the
/// outbound request and the persisted message shares one buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
    /// SHA-256 of `data`, hex encoded
    pub digest: String,
}

impl Attachment {
    /// Create an attachment, computing its content address
    pub fn new(mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let digest = format!("{:x}", Sha256::digest(&data));
        Self {
            mime_type: mime_type.into(),
            data,
            digest,
        }
    }

    /// Payload encoded for inline transport
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.data)
    }
}

mod base64_bytes {
    use super::BASE64_STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64_STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(raw)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// A single entry in a conversation transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub failed: bool,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
            citations: Vec::new(),
            attachments: Vec::new(),
            streaming: false,
            failed: false,
            timestamp: Utc::now(),
        }
    }

    /// Create a user message
    pub fn user(text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        let mut message = Self::new(Role::User, text);
        message.attachments = attachments;
        message
    }

    /// Create a finished model message
    pub fn model(text: impl Into<String>) -> Self {
        Self::new(Role::Model, text)
    }

    /// Create the empty model message that receives streamed text
    pub fn placeholder() -> Self {
        let mut message = Self::new(Role::Model, "");
        message.streaming = true;
        message
    }

    /// Whether the message can no longer change
    pub fn is_finished(&self) -> bool {
        !self.streaming
    }

    /// Stop streaming; the message becomes immutable
    pub fn mark_completed(&mut self) {
        self.streaming = false;
    }

    /// Keep any partial text, append the explanation and flag the failure
    pub fn mark_failed(&mut self, explanation: &str) {
        if self.text.is_empty() {
            self.text = explanation.to_string();
        } else {
            self.text.push_str(FAILURE_SEPARATOR);
            self.text.push_str(explanation);
        }
        self.failed = true;
        self.streaming = false;
    }

    /// Text produced by the model, without any failure annotation
    pub fn partial_text(&self) -> &str {
        if !self.failed {
            return &self.text;
        }
        match self.text.rfind(FAILURE_SEPARATOR) {
            Some(pos) => &self.text[..pos],
            None => "",
        }
    }
}

/// A conversation session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier
    pub id: Uuid,
    /// Owning user
    pub owner_id: String,
    /// Display title
    pub title: String,
    /// Messages in conversation order
    pub messages: Vec<Message>,
    /// Conversation mode
    #[serde(default)]
    pub mode: Mode,
    /// Session creation time
    pub created_at: DateTime<Utc>,
    /// Last update time, strictly increasing across mutations
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session seeded with a single welcome message
    pub fn seeded(owner_id: impl Into<String>, welcome: &str, mode: Mode) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            title: PLACEHOLDER_TITLE.to_string(),
            messages: vec![Message::model(welcome)],
            mode,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a mutation
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::microseconds(1)
        };
    }

    /// Append a message to the transcript
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    /// Replace the transcript with a fresh welcome message, keeping identity
    pub fn reset(&mut self, welcome: &str) {
        self.messages = vec![Message::model(welcome)];
        self.title = PLACEHOLDER_TITLE.to_string();
        self.touch();
    }

    /// Whether the session still carries its initial title
    pub fn has_placeholder_title(&self) -> bool {
        self.title == PLACEHOLDER_TITLE
    }

    /// Look up a message by id
    pub fn message(&self, id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Look up a message by id for mutation, searching from the end
    pub fn message_mut(&mut self, id: Uuid) -> Option<&mut Message> {
        self.messages.iter_mut().rev().find(|m| m.id == id)
    }
}

/// Display profile of a local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_ref: Option<String>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            photo_ref: None,
        }
    }
}
