//! Durable keyed storage for sessions and user profiles

use super::store::{Message, Mode, Session, UserProfile};
use crate::utils::safe_filename;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Keyed store for sessions and user profiles.
///
/// Every operation is atomic per key. Failures are reported as
/// [`Error::Storage`] and leave the caller's in-memory state untouched.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a session by id
    async fn get(&self, id: Uuid) -> Result<Option<Session>>;

    /// Insert or fully replace a session (last write wins)
    async fn put(&self, session: &Session) -> Result<()>;

    /// Remove a session; removing a missing session is not an error
    async fn delete(&self, id: Uuid) -> Result<()>;

    /// All sessions of an owner, most recently updated first
    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Session>>;

    /// Fetch a user profile
    async fn get_user(&self, id: &str) -> Result<Option<UserProfile>>;

    /// Insert or replace a user profile
    async fn put_user(&self, profile: &UserProfile) -> Result<()>;
}

fn storage_error(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Storage(format!("{}: {}", context, err))
}

fn sort_recent_first(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

/// First line of a session file
#[derive(Debug, Serialize, Deserialize)]
struct SessionHeader {
    #[serde(rename = "_type")]
    kind: String,
    id: Uuid,
    owner_id: String,
    title: String,
    #[serde(default)]
    mode: Mode,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SessionHeader {
    const KIND: &'static str = "metadata";

    fn from_session(session: &Session) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            id: session.id,
            owner_id: session.owner_id.clone(),
            title: session.title.clone(),
            mode: session.mode,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

/// Stores each session as a JSONL file: one metadata line followed by one
/// line per message. User profiles are stored as JSON documents.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    sessions_dir: PathBuf,
    users_dir: PathBuf,
}

impl FileSessionStore {
    /// Create a store rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            sessions_dir: root.join("sessions"),
            users_dir: root.join("users"),
        }
    }

    /// Directory holding the session files
    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    fn session_path(&self, id: Uuid) -> PathBuf {
        self.sessions_dir.join(format!("{}.jsonl", id))
    }

    fn user_path(&self, id: &str) -> PathBuf {
        self.users_dir.join(format!("{}.json", safe_filename(id)))
    }

    fn encode(session: &Session) -> Result<String> {
        let mut lines = Vec::with_capacity(session.messages.len() + 1);
        lines.push(serde_json::to_string(&SessionHeader::from_session(session))?);
        for msg in &session.messages {
            lines.push(serde_json::to_string(msg)?);
        }
        Ok(lines.join("\n"))
    }

    fn decode(content: &str) -> Result<Session> {
        let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());

        let header: SessionHeader = match lines.next() {
            Some(line) => serde_json::from_str(line)?,
            None => return Err(Error::Serialization("empty session file".to_string())),
        };
        if header.kind != SessionHeader::KIND {
            return Err(Error::Serialization(format!(
                "unexpected record type {:?} in session header",
                header.kind
            )));
        }

        let messages = lines
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str::<Message>(line).map_err(|e| {
                    Error::Serialization(format!(
                        "session {} message {}: {}",
                        header.id,
                        i + 1,
                        e
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if messages.is_empty() {
            return Err(Error::Serialization(format!(
                "session {} has no messages",
                header.id
            )));
        }

        Ok(Session {
            id: header.id,
            owner_id: header.owner_id,
            title: header.title,
            messages,
            mode: header.mode,
            created_at: header.created_at,
            updated_at: header.updated_at,
        })
    }

    /// Write through a temporary file so readers never see a partial record
    async fn write_atomic(dir: &Path, path: &Path, content: String) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| storage_error("create directory", e))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| storage_error("write", e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| storage_error("rename", e))?;
        Ok(())
    }

    async fn read_optional(path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("read", e)),
        }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, id: Uuid) -> Result<Option<Session>> {
        match Self::read_optional(&self.session_path(id)).await? {
            Some(content) => Ok(Some(Self::decode(&content)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, session: &Session) -> Result<()> {
        let content = Self::encode(session)?;
        Self::write_atomic(&self.sessions_dir, &self.session_path(session.id), content).await?;
        debug!(
            "Stored session {} ({} messages)",
            session.id,
            session.messages.len()
        );
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        match tokio::fs::remove_file(self.session_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error("delete", e)),
        }
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Session>> {
        let mut entries = match tokio::fs::read_dir(&self.sessions_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_error("list", e)),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_error("list", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(content) = Self::read_optional(&path).await? else {
                continue;
            };
            match Self::decode(&content) {
                Ok(session) if session.owner_id == owner_id => sessions.push(session),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable session file {:?}: {}", path, e),
            }
        }

        sort_recent_first(&mut sessions);
        Ok(sessions)
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserProfile>> {
        match Self::read_optional(&self.user_path(id)).await? {
            Some(content) => Ok(Some(serde_json::from_str(&content)?)),
            None => Ok(None),
        }
    }

    async fn put_user(&self, profile: &UserProfile) -> Result<()> {
        let content = serde_json::to_string_pretty(profile)?;
        Self::write_atomic(&self.users_dir, &self.user_path(&profile.id), content).await
    }
}

/// Process-local store; contents are lost on exit
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, Session>>,
    users: RwLock<HashMap<String, UserProfile>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: Uuid) -> Result<Option<Session>> {
        Ok(self.sessions.read().get(&id).cloned())
    }

    async fn put(&self, session: &Session) -> Result<()> {
        self.sessions.write().insert(session.id, session.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.sessions.write().remove(&id);
        Ok(())
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect();
        sort_recent_first(&mut sessions);
        Ok(sessions)
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserProfile>> {
        Ok(self.users.read().get(id).cloned())
    }

    async fn put_user(&self, profile: &UserProfile) -> Result<()> {
        self.users
            .write()
            .insert(profile.id.clone(), profile.clone());
        Ok(())
    }
}
