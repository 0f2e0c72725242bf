//! Conversation sessions and their persistence
//!
//! Sessions are stored in JSONL format: a metadata line followed by one
//! line per message, which keeps transcripts easy to read and append.

pub mod storage;
pub mod store;

pub use storage::{FileSessionStore, MemorySessionStore, SessionStore};
pub use store::{
    Attachment, Citation, Message, Mode, Role, Session, UserProfile, FAILURE_SEPARATOR,
    PLACEHOLDER_TITLE,
};
