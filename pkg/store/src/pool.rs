use std::sync::Arc;

use schema::QueryFilter;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{Cursor, DocumentStore, Projection, StoreError};

/// Bounds the number of concurrent store sessions.
#[derive(Clone)]
pub struct StorePool {
    store: Arc<dyn DocumentStore>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl StorePool {
    pub fn new(store: Arc<dyn DocumentStore>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            store,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Waits for a free session slot. The slot returns to the pool when the
    /// session is dropped.
    pub async fn checkout(&self) -> Result<StoreSession, StoreError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::PoolClosed)?;
        Ok(StoreSession {
            store: self.store.clone(),
            _permit: permit,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn close(&self) {
        self.permits.close();
    }
}

pub struct StoreSession {
    store: Arc<dyn DocumentStore>,
    _permit: OwnedSemaphorePermit,
}

impl StoreSession {
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    pub async fn find(
        &self,
        filter: &QueryFilter,
        projection: &Projection,
    ) -> Result<Box<dyn Cursor>, StoreError> {
        self.store.find(filter, projection).await
    }
}
