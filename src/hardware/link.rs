//! Exclusive, timed command channel owned by one driver.

use crate::error::{BenchError, BenchResult};
use crate::transport::{ResourceId, ResourceLock, Transport, TransportError};
use std::time::Duration;
use tracing::{debug, trace};

/// An open transport plus the lock that makes it exclusive.
///
/// Every exchange is bounded by the per-kind timeout. Closing releases the lock.
pub(crate) struct Link {
    resource: ResourceId,
    transport: Box<dyn Transport>,
    lock: ResourceLock,
    timeout: Duration,
    closed: bool,
}

impl Link {
    pub(crate) fn new(transport: Box<dyn Transport>, lock: ResourceLock, timeout: Duration) -> Self {
        Self {
            resource: lock.resource().clone(),
            transport,
            lock,
            timeout,
            closed: false,
        }
    }

    fn fail(&self, err: TransportError) -> BenchError {
        BenchError::transport(self.resource.as_str(), err)
    }

    fn ensure_open(&self) -> BenchResult<()> {
        if self.closed {
            Err(self.fail(TransportError::NotConnected))
        } else {
            Ok(())
        }
    }

    pub(crate) fn resource(&self) -> &ResourceId {
        &self.resource
    }

    pub(crate) async fn write(&mut self, command: &str) -> BenchResult<()> {
        self.ensure_open()?;
        trace!(resource = %self.resource, command, "write");
        match tokio::time::timeout(self.timeout, self.transport.write(command)).await {
            Ok(result) => result.map_err(|e| self.fail(e)),
            Err(_) => Err(self.fail(TransportError::Timeout(self.timeout))),
        }
    }

    pub(crate) async fn query(&mut self, command: &str) -> BenchResult<String> {
        self.ensure_open()?;
        trace!(resource = %self.resource, command, "query");
        match tokio::time::timeout(self.timeout, self.transport.query(command)).await {
            Ok(result) => result.map(|r| r.trim().to_string()).map_err(|e| self.fail(e)),
            Err(_) => Err(self.fail(TransportError::Timeout(self.timeout))),
        }
    }

    pub(crate) async fn close(&mut self) -> BenchResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.transport.close().await;
        self.lock.release();
        debug!(resource = %self.resource, "Link closed");
        result.map_err(|e| self.fail(e))
    }
}
