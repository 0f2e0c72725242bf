//! Event types published to transcript observers

use crate::session::Citation;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A change to visible conversation state.
///
/// Events for one session are emitted in the order the changes were applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// The user's message was appended (before any network activity)
    UserMessageAppended {
        session_id: Uuid,
        message_id: Uuid,
        text: String,
    },
    /// An empty streaming model message was appended
    ModelMessageStarted { session_id: Uuid, message_id: Uuid },
    /// One fragment was applied to the streaming message
    ModelDelta {
        session_id: Uuid,
        message_id: Uuid,
        text_delta: String,
        /// Citations first seen in this fragment
        citations: Vec<Citation>,
    },
    /// The streaming message finished successfully
    TurnCompleted { session_id: Uuid, message_id: Uuid },
    /// The streaming message finished with a failure annotation
    TurnFailed {
        session_id: Uuid,
        message_id: Uuid,
        explanation: String,
    },
    /// The session title changed
    TitleChanged { session_id: Uuid, title: String },
    /// The transcript was reset to a single welcome message
    SessionCleared { session_id: Uuid },
    /// The session was removed
    SessionDeleted { session_id: Uuid },
    /// A session became the active one
    SessionSelected { session_id: Uuid },
    /// Writing the session to the store failed; memory is still authoritative
    PersistFailed { session_id: Uuid, error: String },
}

impl ChatEvent {
    /// Session the event refers to
    pub fn session_id(&self) -> Uuid {
        match self {
            ChatEvent::UserMessageAppended { session_id, .. }
            | ChatEvent::ModelMessageStarted { session_id, .. }
            | ChatEvent::ModelDelta { session_id, .. }
            | ChatEvent::TurnCompleted { session_id, .. }
            | ChatEvent::TurnFailed { session_id, .. }
            | ChatEvent::TitleChanged { session_id, .. }
            | ChatEvent::SessionCleared { session_id }
            | ChatEvent::SessionDeleted { session_id }
            | ChatEvent::SessionSelected { session_id }
            | ChatEvent::PersistFailed { session_id, .. } => *session_id,
        }
    }
}
