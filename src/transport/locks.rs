//! Exclusive ownership of transport resources.
//!
//! One table per process is shared by every session. Acquiring a resource that
//! is already held fails fast; the guard releases on `release()` or drop.

use crate::error::{BenchError, BenchResult};
use crate::transport::ResourceId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Shared table of held resources and their owners.
#[derive(Debug, Clone, Default)]
pub struct ResourceLocks {
    held: Arc<Mutex<HashMap<ResourceId, String>>>,
}

impl ResourceLocks {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take exclusive ownership of `resource` on behalf of `owner`.
    pub fn acquire(&self, resource: &ResourceId, owner: &str) -> BenchResult<ResourceLock> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(holder) = held.get(resource) {
            return Err(BenchError::ResourceBusy {
                resource: resource.to_string(),
                holder: holder.clone(),
            });
        }
        held.insert(resource.clone(), owner.to_string());
        debug!(resource = %resource, owner, "Resource acquired");
        Ok(ResourceLock {
            resource: resource.clone(),
            table: Arc::clone(&self.held),
            released: false,
        })
    }

    /// Current owner of a resource, if held.
    pub fn holder(&self, resource: &ResourceId) -> Option<String> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .cloned()
    }

    /// Number of held resources.
    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Guard for one held resource.
#[derive(Debug)]
pub struct ResourceLock {
    resource: ResourceId,
    table: Arc<Mutex<HashMap<ResourceId, String>>>,
    released: bool,
}

impl ResourceLock {
    /// The held resource.
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Release the resource. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.resource);
        debug!(resource = %self.resource, "Resource released");
    }
}

impl Drop for ResourceLock {
    fn drop(&mut self) {
        self.release();
    }
}
