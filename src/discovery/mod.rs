//! Discovery Service
//!
//! Enumerates every enabled transport, identifies each address concurrently,
//! and resolves the identifications through the registry into a catalog of
//! [`InstrumentRecord`]s sorted by transport kind, then address.
//!
//! ```text
//! enumerate(kind) ──▶ skip patterns ──▶ JoinSet { probe(address) } ──▶ registry ──▶ ScanReport
//! ```

pub mod probe;

pub use probe::{Identification, ProbeOutcome, TransportProbe};

use crate::config::BenchConfig;
use crate::error::{BenchError, BenchResult};
use crate::hardware::InstrumentRecord;
use crate::transport::{ResourceId, ResourceLocks, TransportBackend, TransportKind};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// An address that never answered identification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresponsiveAddress {
    /// Transport the address lives on
    pub kind: TransportKind,
    /// Raw address
    pub address: String,
    /// Last failure
    pub reason: String,
    /// Identification attempts made
    pub attempts: u32,
}

/// Result of one scan.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Catalog, one record per responsive address
    pub records: Vec<InstrumentRecord>,
    /// Addresses that did not answer after retries
    pub unresponsive: Vec<UnresponsiveAddress>,
    /// Addresses matching a skip pattern, never opened
    pub skipped: Vec<(TransportKind, String)>,
    /// Present but already held by a driver, so not probed
    pub held: Vec<ResourceId>,
    /// Transports that could not be enumerated
    pub enumeration_errors: Vec<(TransportKind, String)>,
}

impl ScanReport {
    /// Whether nothing at all was found.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.unresponsive.is_empty()
    }
}

/// Builds the instrument catalog.
pub struct DiscoveryService {
    probe: TransportProbe,
    transports: Vec<TransportKind>,
    locks: Option<ResourceLocks>,
}

impl DiscoveryService {
    /// Discovery over `backend` using the transports enabled in `config`.
    pub fn new(backend: Arc<dyn TransportBackend>, config: &BenchConfig) -> Self {
        let mut transports = config.discovery.transports.clone();
        transports.sort();
        transports.dedup();
        Self {
            probe: TransportProbe::new(backend, config),
            transports,
            locks: None,
        }
    }

    /// Leave resources held in `locks` unprobed and report them as held.
    pub fn with_locks(mut self, locks: ResourceLocks) -> Self {
        self.locks = Some(locks);
        self
    }

    /// The underlying probe.
    pub fn probe(&self) -> &TransportProbe {
        &self.probe
    }

    /// Scan every enabled transport.
    ///
    /// Fails with `NoTransport` only when the backend serves none of the
    /// enabled kinds. Individual enumeration or identification failures are
    /// reported in the [`ScanReport`].
    pub async fn find_all(&self) -> BenchResult<ScanReport> {
        let kinds: Vec<_> = self
            .transports
            .iter()
            .copied()
            .filter(|kind| self.probe.supports(*kind))
            .collect();
        if kinds.is_empty() {
            return Err(BenchError::NoTransport);
        }

        let mut report = ScanReport::default();
        let mut tasks = JoinSet::new();

        for kind in kinds {
            let addresses = match self.probe.enumerate(kind).await {
                Ok(addresses) => addresses,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Enumeration failed");
                    report.enumeration_errors.push((kind, e.to_string()));
                    continue;
                }
            };

            for address in addresses {
                if self.probe.is_skipped(&address) {
                    debug!(kind = %kind, address = %address, "Skipping address");
                    report.skipped.push((kind, address));
                    continue;
                }
                let id = ResourceId::new(kind, &address);
                if let Some(holder) = self.locks.as_ref().and_then(|l| l.holder(&id)) {
                    debug!(resource_id = %id, holder = %holder, "Held, not probing");
                    report.held.push(id);
                    continue;
                }
                let probe = self.probe.clone();
                tasks.spawn(async move {
                    let outcome = probe.probe(&address, kind).await;
                    (kind, address, outcome)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            let (kind, address, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Probe task failed");
                    continue;
                }
            };
            match outcome {
                ProbeOutcome::Identified(id) => {
                    let record =
                        InstrumentRecord::identified(kind, &address, &id.text, id.baud_rate);
                    info!(
                        resource_id = %record.resource_id,
                        model = %record.display_name(),
                        capabilities = %record.capability_list(),
                        "Found instrument"
                    );
                    report.records.push(record);
                }
                ProbeOutcome::Unresponsive { reason, attempts } => {
                    warn!(kind = %kind, address = %address, attempts, reason = %reason, "Unresponsive");
                    report.unresponsive.push(UnresponsiveAddress {
                        kind,
                        address,
                        reason,
                        attempts,
                    });
                }
            }
        }

        report
            .records
            .sort_by(|a, b| (a.transport_kind, &a.address).cmp(&(b.transport_kind, &b.address)));
        report
            .unresponsive
            .sort_by(|a, b| (a.kind, &a.address).cmp(&(b.kind, &b.address)));
        report.skipped.sort();
        report.held.sort();

        info!(
            found = report.records.len(),
            unresponsive = report.unresponsive.len(),
            skipped = report.skipped.len(),
            "Scan complete"
        );
        Ok(report)
    }
}
