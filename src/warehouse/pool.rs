//! Bounded warehouse connection pool.

use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{Warehouse, WarehouseError};

/// Hands out at most `size` concurrent connections to a warehouse.
///
/// A connection is held for the duration of one task attempt and released
/// when its guard is dropped, whether the attempt succeeded, failed or
/// panicked.
#[derive(Clone)]
pub struct WarehousePool {
    warehouse: Arc<dyn Warehouse>,
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WarehousePool {
    /// Create a pool; a size of zero is treated as one.
    pub fn new(warehouse: Arc<dyn Warehouse>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            warehouse,
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Maximum number of concurrent connections.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Connections not currently checked out.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free connection.
    pub async fn acquire(&self) -> Result<PooledConnection, WarehouseError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| WarehouseError::Connection("connection pool closed".to_string()))?;

        Ok(PooledConnection {
            warehouse: Arc::clone(&self.warehouse),
            _permit: permit,
        })
    }

    /// Stop handing out connections; waiting and future `acquire` calls fail.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// A checked-out connection. Dereferences to the warehouse.
pub struct PooledConnection {
    warehouse: Arc<dyn Warehouse>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = dyn Warehouse;

    fn deref(&self) -> &Self::Target {
        self.warehouse.as_ref()
    }
}
