//! In-memory session registry shared by the controller and the lifecycle

use parking_lot::RwLock;
use parley_core::session::Session;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Identifies the transcript a turn writes into.
///
/// A fragment is applied only while all three fields still match the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnToken {
    pub session_id: Uuid,
    pub generation: u64,
    pub turn_id: Uuid,
}

/// A session plus the bookkeeping needed to fence off stale turns
#[derive(Debug)]
pub(crate) struct SessionSlot {
    pub session: Session,
    /// Bumped whenever the message list is replaced
    pub generation: u64,
    /// Turn currently drafting or streaming, if any
    pub in_flight: Option<Uuid>,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            session,
            generation: 0,
            in_flight: None,
        }
    }

    pub fn accepts(&self, token: &TurnToken) -> bool {
        self.generation == token.generation && self.in_flight == Some(token.turn_id)
    }

    /// Replace the transcript; any in-flight turn is orphaned
    pub fn reset(&mut self, welcome: &str) {
        self.session.reset(welcome);
        self.generation += 1;
        self.in_flight = None;
    }
}

/// Owned collection of loaded sessions.
///
/// The lock is never held across an `.await`.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, SessionSlot>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) {
        self.inner
            .write()
            .insert(session.id, SessionSlot::new(session));
    }

    pub fn remove(&self, id: Uuid) -> Option<Session> {
        self.inner.write().remove(&id).map(|slot| slot.session)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.read().contains_key(&id)
    }

    pub fn snapshot(&self, id: Uuid) -> Option<Session> {
        self.inner.read().get(&id).map(|slot| slot.session.clone())
    }

    /// Sessions of `owner_id`, most recently updated first
    pub fn list_for(&self, owner_id: &str) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .read()
            .values()
            .filter(|slot| slot.session.owner_id == owner_id)
            .map(|slot| slot.session.clone())
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.inner.read().keys().copied().collect()
    }

    pub fn is_turn_in_flight(&self, id: Uuid) -> bool {
        self.inner
            .read()
            .get(&id)
            .is_some_and(|slot| slot.in_flight.is_some())
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// Run `f` against the slot under the write lock
    pub(crate) fn with_slot<R>(&self, id: Uuid, f: impl FnOnce(&mut SessionSlot) -> R) -> Option<R> {
        self.inner.write().get_mut(&id).map(f)
    }
}
