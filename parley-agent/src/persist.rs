//! Serialized, coalescing session writes

use parking_lot::Mutex;
use parley_core::bus::{ChatEvent, EventSender};
use parley_core::session::SessionStore;
use parley_core::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state::SessionRegistry;

/// Writes sessions from the registry to the store.
///
/// Writes for one session hold a per-session async lock and snapshot the
/// in-memory session only after acquiring it, so the last write to land is
/// always the latest state.
#[derive(Clone)]
pub struct Persister {
    store: Arc<dyn SessionStore>,
    registry: SessionRegistry,
    locks: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
    events: Option<EventSender>,
}

impl Persister {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: SessionRegistry,
        events: Option<EventSender>,
    ) -> Self {
        Self {
            store,
            registry,
            locks: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    fn lock_for(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Write the current in-memory state of `id`, propagating store errors.
    ///
    /// A session no longer in the registry is skipped.
    pub async fn flush(&self, id: Uuid) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let Some(session) = self.registry.snapshot(id) else {
            debug!("Session {} no longer loaded; skipping write", id);
            return Ok(());
        };
        self.store.put(&session).await
    }

    /// Write the current state of `id`; failures are logged and published
    /// but never returned.
    pub async fn persist(&self, id: Uuid) {
        if let Err(e) = self.flush(id).await {
            warn!("Failed to persist session {}: {}", id, e);
            if let Some(tx) = &self.events {
                let _ = tx.send(ChatEvent::PersistFailed {
                    session_id: id,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Delete `id` from the store, ordered after any write already running
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.store.delete(id).await?;
        self.registry.remove(id);
        self.locks.lock().remove(&id);
        Ok(())
    }
}
