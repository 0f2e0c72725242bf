//! Session lifecycle: the per-user application context created on sign-in

use parking_lot::Mutex;
use parley_core::bus::{ChatEvent, EventSender};
use parley_core::config::ChatConfig;
use parley_core::session::{Attachment, Mode, Session, SessionStore, UserProfile};
use parley_core::{Error, Result};
use parley_providers::StreamingExecutor;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::ContextBuilder;
use crate::controller::{ConversationController, TurnOutcome};
use crate::failure::FailureCategory;
use crate::persist::Persister;
use crate::state::SessionRegistry;

/// Fail model messages left streaming by a process that exited mid-turn
fn recover_interrupted(session: &mut Session) -> bool {
    let explanation = FailureCategory::Network.explanation();
    let mut recovered = false;
    for message in session.messages.iter_mut().filter(|m| m.streaming) {
        message.mark_failed(explanation);
        recovered = true;
    }
    if recovered {
        session.touch();
    }
    recovered
}

/// Owns the signed-in user's sessions and the selection.
///
/// Created by [`sign_in`](Self::sign_in) and torn down by
/// [`sign_out`](Self::sign_out). The owner always has at least one session.
pub struct SessionLifecycle {
    profile: UserProfile,
    store: Arc<dyn SessionStore>,
    registry: SessionRegistry,
    persister: Persister,
    controller: ConversationController,
    active: Mutex<Option<Uuid>>,
    default_mode: Mode,
    events: Option<EventSender>,
}

impl SessionLifecycle {
    /// Store the profile, load the owner's sessions and select the most
    /// recent one, creating a seeded session if the owner has none.
    pub async fn sign_in(
        profile: UserProfile,
        store: Arc<dyn SessionStore>,
        executor: StreamingExecutor,
        chat: ChatConfig,
        events: Option<EventSender>,
    ) -> Result<Self> {
        store.put_user(&profile).await?;
        let sessions = store.list_by_owner(&profile.id).await?;

        let registry = SessionRegistry::new();
        let persister = Persister::new(store.clone(), registry.clone(), events.clone());
        let default_mode = chat.default_mode;
        let controller = ConversationController::new(
            registry.clone(),
            executor,
            ContextBuilder::new(chat),
            persister.clone(),
            events.clone(),
        );

        info!(
            "Signed in as {} with {} stored sessions",
            profile.id,
            sessions.len()
        );
        let mut interrupted = Vec::new();
        for mut session in sessions {
            if recover_interrupted(&mut session) {
                warn!("Session {} had a reply cut off mid-stream", session.id);
                interrupted.push(session.id);
            }
            registry.insert(session);
        }
        let most_recent = registry.list_for(&profile.id).first().map(|s| s.id);

        let lifecycle = Self {
            profile,
            store,
            registry,
            persister,
            controller,
            active: Mutex::new(most_recent),
            default_mode,
            events,
        };

        for id in interrupted {
            lifecycle.persister.persist(id).await;
        }
        if most_recent.is_none() {
            lifecycle.create_session().await?;
        }
        Ok(lifecycle)
    }

    /// Flush every loaded session and drop the context.
    ///
    /// Turns still streaming are discarded.
    pub async fn sign_out(self) {
        for id in self.registry.ids() {
            if let Err(e) = self.persister.flush(id).await {
                warn!("Failed to write session {} on sign-out: {}", id, e);
            }
        }
        self.registry.clear();
        info!("Signed out {}", self.profile.id);
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn controller(&self) -> &ConversationController {
        &self.controller
    }

    fn emit(&self, event: ChatEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn welcome(&self) -> &str {
        self.controller.context().welcome_message()
    }

    fn require(&self, id: Uuid) -> Result<()> {
        if self.registry.contains(id) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("session {}", id)))
        }
    }

    fn set_active(&self, id: Uuid) {
        *self.active.lock() = Some(id);
        self.emit(ChatEvent::SessionSelected { session_id: id });
    }

    /// Create, store and select a new seeded session
    pub async fn create_session(&self) -> Result<Session> {
        let session = Session::seeded(&self.profile.id, self.welcome(), self.default_mode);
        self.store.put(&session).await?;
        self.registry.insert(session.clone());
        info!("Created session {}", session.id);
        self.set_active(session.id);
        Ok(session)
    }

    /// Make `id` the active session
    pub fn select_session(&self, id: Uuid) -> Result<()> {
        self.require(id)?;
        self.set_active(id);
        Ok(())
    }

    /// Delete `id`; if it was the owner's last session a seeded replacement
    /// is created and selected.
    pub async fn delete_session(&self, id: Uuid) -> Result<()> {
        self.require(id)?;
        self.persister.delete(id).await?;
        info!("Deleted session {}", id);
        self.emit(ChatEvent::SessionDeleted { session_id: id });

        let remaining = self.registry.list_for(&self.profile.id);
        match remaining.first() {
            None => {
                // Memory first here: the owner must never be left without a
                // session even if the store write fails.
                let session =
                    Session::seeded(&self.profile.id, self.welcome(), self.default_mode);
                let replacement = session.id;
                self.registry.insert(session);
                self.set_active(replacement);
                self.persister.persist(replacement).await;
            }
            Some(next) => {
                let was_active = *self.active.lock() == Some(id);
                if was_active {
                    self.set_active(next.id);
                }
            }
        }
        Ok(())
    }

    /// Reset `id` to a single welcome message, keeping its id and owner.
    ///
    /// A turn streaming into the session is orphaned.
    pub async fn clear_session(&self, id: Uuid) -> Result<()> {
        let welcome = self.welcome().to_string();
        let title = self
            .registry
            .with_slot(id, |slot| {
                slot.reset(&welcome);
                slot.session.title.clone()
            })
            .ok_or_else(|| Error::NotFound(format!("session {}", id)))?;

        info!("Cleared session {}", id);
        self.emit(ChatEvent::SessionCleared { session_id: id });
        self.emit(ChatEvent::TitleChanged {
            session_id: id,
            title,
        });
        self.persister.flush(id).await
    }

    /// Set a user-chosen title
    pub async fn rename_session(&self, id: Uuid, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::Validation("title must not be empty".to_string()));
        }
        self.registry
            .with_slot(id, |slot| {
                slot.session.title = title.to_string();
                slot.session.touch();
            })
            .ok_or_else(|| Error::NotFound(format!("session {}", id)))?;

        self.emit(ChatEvent::TitleChanged {
            session_id: id,
            title: title.to_string(),
        });
        self.persister.flush(id).await
    }

    /// Switch the mode used for the session's next turns
    pub async fn set_mode(&self, id: Uuid, mode: Mode) -> Result<()> {
        self.registry
            .with_slot(id, |slot| {
                slot.session.mode = mode;
                slot.session.touch();
            })
            .ok_or_else(|| Error::NotFound(format!("session {}", id)))?;
        self.persister.flush(id).await
    }

    /// The owner's sessions, most recently updated first
    pub fn list_sessions(&self) -> Vec<Session> {
        self.registry.list_for(&self.profile.id)
    }

    pub fn active_session_id(&self) -> Option<Uuid> {
        *self.active.lock()
    }

    /// Snapshot of the selected session
    pub fn active_session(&self) -> Option<Session> {
        self.active_session_id()
            .and_then(|id| self.registry.snapshot(id))
    }

    /// Snapshot of any loaded session
    pub fn snapshot(&self, id: Uuid) -> Option<Session> {
        self.registry.snapshot(id)
    }

    /// Submit a turn to the active session
    pub async fn submit(&self, text: &str, attachments: Vec<Attachment>) -> Result<TurnOutcome> {
        let id = self
            .active_session_id()
            .ok_or_else(|| Error::Session("no active session".to_string()))?;
        self.submit_to(id, text, attachments).await
    }

    /// Submit a turn to a specific session
    pub async fn submit_to(
        &self,
        id: Uuid,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<TurnOutcome> {
        self.controller.submit_turn(id, text, attachments).await
    }
}
