//! Worker Registry
//!
//! Maps worker IDs to workers. Each worker is wrapped in a [`WorkerHandle`]
//! that runs `initialize` exactly once, lazily, before the first request.
//! A failed initialization leaves the handle uninitialized so the next
//! request tries again.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info, warn};
use tokio::sync::OnceCell;

use crate::error::WorkerError;

use super::{Worker, WorkerState};

/// A registered worker plus its one-shot initialization cell.
pub struct WorkerHandle {
    worker: Arc<dyn Worker>,
    init: OnceCell<()>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.worker.id())
            .field("initialized", &self.init.initialized())
            .finish()
    }
}

impl WorkerHandle {
    pub fn new(worker: Arc<dyn Worker>) -> Self {
        Self {
            worker,
            init: OnceCell::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.worker.id()
    }

    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }

    pub fn is_initialized(&self) -> bool {
        self.init.initialized()
    }

    /// Returns the worker, initializing it first if needed.
    ///
    /// Concurrent callers wait on the same initialization.
    pub async fn ready(&self) -> Result<&Arc<dyn Worker>, WorkerError> {
        self.init
            .get_or_try_init(|| async {
                debug!("Initializing worker '{}'", self.worker.id());
                self.worker.initialize().await
            })
            .await?;
        Ok(&self.worker)
    }
}

/// Thread-safe map of worker ID to [`WorkerHandle`].
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<WorkerHandle>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker under its own ID.
    ///
    /// Fails if a worker with the same ID is already registered.
    pub fn register(&self, worker: Arc<dyn Worker>) -> Result<(), WorkerError> {
        let id = worker.id().to_string();
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        if workers.contains_key(&id) {
            return Err(WorkerError::new(format!(
                "worker '{}' is already registered",
                id
            )));
        }
        workers.insert(id.clone(), Arc::new(WorkerHandle::new(worker)));
        info!("Registered worker '{}'", id);
        Ok(())
    }

    /// Removes a worker. Returns its handle if it was registered.
    pub fn unregister(&self, id: &str) -> Option<Arc<WorkerHandle>> {
        let removed = self
            .workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed.is_some() {
            info!("Unregistered worker '{}'", id);
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkerHandle>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Registered worker IDs, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.workers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handles(&self) -> Vec<Arc<WorkerHandle>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Eagerly initializes every registered worker.
    pub async fn initialize_all(&self) -> Result<(), WorkerError> {
        for handle in self.handles() {
            handle.ready().await.map_err(|e| {
                WorkerError::new(format!("worker '{}': {}", handle.id(), e))
            })?;
        }
        Ok(())
    }

    /// Calls `cleanup` on every worker, returning the failures.
    pub async fn cleanup_all(&self) -> Vec<(String, WorkerError)> {
        let mut failures = Vec::new();
        for handle in self.handles() {
            if let Err(e) = handle.worker.cleanup().await {
                warn!("Cleanup of worker '{}' failed: {}", handle.id(), e);
                failures.push((handle.id().to_string(), e));
            }
        }
        failures
    }
}
