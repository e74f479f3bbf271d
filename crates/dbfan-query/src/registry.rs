use crate::backend::{BackendHandle, Connector};
use crate::dispatcher::Outcome;
use crate::error::{DataError, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Registry mapping target identifiers to backend handles
pub struct HandleRegistry {
    handles: Arc<RwLock<HashMap<String, Arc<BackendHandle>>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            handles: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a connector under a target identifier. No connection is made.
    pub async fn register(
        &self,
        id: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Arc<BackendHandle> {
        let handle = Arc::new(BackendHandle::new(id, connector));
        self.insert(handle.clone()).await;
        handle
    }

    /// Insert a handle, replacing any handle with the same identifier
    pub async fn insert(&self, handle: Arc<BackendHandle>) {
        let mut handles = self.handles.write().await;
        let id = handle.id().to_string();

        if handles.contains_key(&id) {
            warn!("Overwriting existing handle for target: {}", id);
        }

        debug!("Registered target {} ({})", id, handle.kind());
        handles.insert(id, handle);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<BackendHandle>> {
        let handles = self.handles.read().await;
        handles.get(id).cloned()
    }

    /// Resolve a handle or fail with `UnknownTarget`
    pub async fn resolve(&self, id: &str) -> Result<Arc<BackendHandle>> {
        self.get(id)
            .await
            .ok_or_else(|| DataError::UnknownTarget(id.to_string()))
    }

    /// Point-in-time copy of the mapping
    pub async fn snapshot(&self) -> HashMap<String, Arc<BackendHandle>> {
        self.handles.read().await.clone()
    }

    /// Remove a handle and close its connection
    pub async fn remove(&self, id: &str) -> Result<()> {
        let removed = self.handles.write().await.remove(id);

        if let Some(handle) = removed {
            debug!("Closing target: {}", id);
            handle.close().await?;
        }

        Ok(())
    }

    /// Sorted target identifiers
    pub async fn list(&self) -> Vec<String> {
        let handles = self.handles.read().await;
        let mut ids: Vec<String> = handles.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.read().await.is_empty()
    }

    /// Close every handle, keeping them registered for later reconnects
    pub async fn close_all(&self) {
        for (id, handle) in self.snapshot().await {
            if let Err(e) = handle.close().await {
                warn!("Failed to close target {}: {}", id, e);
            }
        }
    }

    /// Connect every handle concurrently and report one outcome per target
    pub async fn ping_all(&self) -> Vec<Outcome> {
        let handles = self.snapshot().await;

        join_all(handles.into_iter().map(|(id, handle)| async move {
            match handle.ensure_ready().await {
                Ok(()) => Outcome::success(id, Vec::new()),
                Err(e) => {
                    warn!("Target {} is not reachable: {}", id, e);
                    Outcome::failure(id, e)
                }
            }
        }))
        .await
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
