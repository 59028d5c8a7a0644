//! Session registry: one live backend per workspace.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{OnceCell, RwLock};

use crate::backend::{BackendFactory, CodeBackend};
use crate::error::{SessionError, SessionResult};
use crate::workspace::{SessionKey, Workspace};

type Slot = Arc<OnceCell<Arc<dyn CodeBackend>>>;

/// Maps session keys to backends, created lazily and shared by all callers.
///
/// Construction runs through a per-key cell outside the map lock: callers
/// racing on one key wait for a single construction, while lookups of
/// other keys proceed. A failed construction leaves the cell empty so the
/// next call tries again.
pub struct SessionRegistry {
    factory: Arc<dyn BackendFactory>,
    sessions: RwLock<HashMap<SessionKey, Slot>>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            factory,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Return the workspace's backend, creating it on first use.
    pub async fn get_or_create(&self, workspace: &Workspace) -> SessionResult<Arc<dyn CodeBackend>> {
        let key = workspace.session_key();

        let existing = self.sessions.read().await.get(&key).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let mut sessions = self.sessions.write().await;
                sessions
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            }
        };

        if let Some(backend) = slot.get() {
            return Ok(backend.clone());
        }

        let backend = slot
            .get_or_try_init(|| async {
                debug!("constructing backend for {}", key);
                self.factory.create(workspace).await
            })
            .await
            .inspect_err(|e| warn!("failed to create session {}: {}", key, e))?
            .clone();

        // A close() that raced with construction removed the slot; the
        // new backend must not outlive it unregistered.
        let still_registered = self
            .sessions
            .read()
            .await
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &slot));
        if !still_registered {
            warn!("session {} was closed during construction", key);
            if let Err(e) = backend.close().await {
                warn!("closing orphaned backend for {} failed: {}", key, e);
            }
            return Err(SessionError::Closed);
        }

        Ok(backend)
    }

    /// Remove the workspace's session and close its backend. Unknown
    /// workspaces are a no-op.
    pub async fn close(&self, workspace: &Workspace) -> SessionResult<()> {
        let key = workspace.session_key();
        let slot = self.sessions.write().await.remove(&key);

        let Some(backend) = slot.as_ref().and_then(|slot| slot.get()) else {
            debug!("no live session for {}", key);
            return Ok(());
        };

        info!("closing {} session {}", backend.kind(), key);
        backend.close().await
    }

    /// Close every session, returning the first failure.
    pub async fn close_all(&self) -> SessionResult<()> {
        let drained: Vec<(SessionKey, Slot)> = self.sessions.write().await.drain().collect();

        let mut first_error = None;
        for (key, slot) in drained {
            let Some(backend) = slot.get() else {
                continue;
            };
            if let Err(e) = backend.close().await {
                warn!("closing session {} failed: {}", key, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether a live backend is registered for the workspace.
    pub async fn contains(&self, workspace: &Workspace) -> bool {
        self.sessions
            .read()
            .await
            .get(&workspace.session_key())
            .is_some_and(|slot| slot.initialized())
    }

    /// Number of live backends.
    pub async fn len(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
