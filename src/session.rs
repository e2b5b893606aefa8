//! Session state for the bench console.
//!
//! A [`Session`] is the one long-lived context the interpreter works against:
//!
//! - **catalog**: the records from the latest scan
//! - **bindings**: alias to open [`DriverHandle`], ordered by alias
//! - **selected alias**: the implicit target set by `use`
//! - **history**: every dispatched line with its outcome
//! - **recorder** and **sequence store** for record/replay
//! - **measurement log**: labelled supply and meter readings
//!
//! Driver exclusivity comes from the shared [`ResourceLocks`] table. Sessions
//! built with [`Session::with_locks`] over the same table contend for the same
//! resources.
//!
//! ## Safe state
//!
//! [`Session::enter_safe_state`] visits every binding, even after failures:
//! supplies and generators have their outputs switched off, scopes stop
//! acquiring, meters are left alone. Failures come back together in a
//! [`SafeStateReport`].

use crate::config::BenchConfig;
use crate::discovery::{DiscoveryService, ScanReport};
use crate::error::{BenchError, BenchResult, ErrorKind};
use crate::hardware::{open_driver, DriverContext, DriverHandle, Instrument, InstrumentRecord};
use crate::measurement::MeasurementLog;
use crate::sequence::{Recorder, SequenceStore};
use crate::transport::{ResourceId, ResourceLocks, TransportBackend};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Words that can never be used as aliases.
pub const RESERVED_WORDS: &[&str] = &[
    "scan", "list", "use", "state", "bind", "unbind", "idn", "raw", "status", "history", "sleep",
    "record", "replay", "sequences", "sequence", "log", "close", "help", "exit", "quit", "all",
];

static ALIAS_SYNTAX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("alias pattern is valid"));

/// Check alias syntax and reserved words.
pub fn validate_alias(alias: &str) -> BenchResult<()> {
    if !ALIAS_SYNTAX.is_match(alias) {
        return Err(BenchError::Usage(format!(
            "invalid alias '{alias}': start with a letter, then letters, digits, '_' or '-'"
        )));
    }
    if RESERVED_WORDS.iter().any(|w| w.eq_ignore_ascii_case(alias)) {
        return Err(BenchError::Usage(format!("'{alias}' is a command and cannot be an alias")));
    }
    Ok(())
}

/// Outcome of one dispatched line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Rendered result text (possibly empty)
    Success(String),
    /// Classified failure
    Failure {
        /// Error classification
        kind: ErrorKind,
        /// Rendered error
        message: String,
    },
}

impl Outcome {
    /// Record a result.
    pub fn from_result<T: fmt::Display>(result: &BenchResult<T>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value.to_string()),
            Err(e) => Outcome::Failure {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }

    /// Whether the dispatch succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

/// One history entry. Appended after each dispatch, never changed.
#[derive(Debug, Clone, Serialize)]
pub struct CommandEntry {
    /// When the line finished dispatching
    pub timestamp: DateTime<Utc>,
    /// The line as entered
    pub raw_text: String,
    /// Alias the line was dispatched to, for instrument verbs
    pub resolved_alias: Option<String>,
    /// Verb word
    pub verb: String,
    /// Remaining argument tokens
    pub args: Vec<String>,
    /// Result
    pub outcome: Outcome,
}

/// Result of a safe-state pass over every binding.
#[derive(Debug, Default)]
pub struct SafeStateReport {
    /// Aliases that reached their safe state
    pub applied: Vec<String>,
    /// Aliases that did not, with the first failure for each
    pub failures: Vec<(String, BenchError)>,
}

impl SafeStateReport {
    /// Whether every binding reached its safe state.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Aliases that failed.
    pub fn failed_aliases(&self) -> Vec<&str> {
        self.failures.iter().map(|(a, _)| a.as_str()).collect()
    }

    /// Collapse into a result, `SafeStateFailed` when anything failed.
    pub fn into_result(self) -> BenchResult<Vec<String>> {
        if self.failures.is_empty() {
            Ok(self.applied)
        } else {
            Err(BenchError::SafeStateFailed(self.failures))
        }
    }
}

/// Drive one instrument to its safe state. Every capability is visited; the
/// first failure is returned.
pub async fn apply_safe_state(driver: &dyn Instrument) -> BenchResult<()> {
    let mut first_error = None;
    if let Some(psu) = driver.as_power_supply() {
        if let Err(e) = psu.output_off().await {
            first_error.get_or_insert(e);
        }
    }
    if let Some(awg) = driver.as_function_generator() {
        if let Err(e) = awg.outputs_off().await {
            first_error.get_or_insert(e);
        }
    }
    if let Some(scope) = driver.as_oscilloscope() {
        if let Err(e) = scope.stop().await {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Process-wide console state.
pub struct Session {
    id: Uuid,
    backend: Arc<dyn TransportBackend>,
    locks: ResourceLocks,
    config: BenchConfig,
    catalog: Vec<InstrumentRecord>,
    bindings: BTreeMap<String, DriverHandle>,
    selected: Option<String>,
    history: Vec<CommandEntry>,
    recorder: Recorder,
    sequences: SequenceStore,
    measurements: MeasurementLog,
}

impl Session {
    /// New session with its own lock table.
    ///
    /// The sequence store is loaded from `config.sequences.path`. If it cannot
    /// be read the session starts with an in-memory store and logs why.
    pub fn new(backend: Arc<dyn TransportBackend>, config: BenchConfig) -> Self {
        let sequences = match &config.sequences.path {
            Some(path) => SequenceStore::open(path).unwrap_or_else(|e| {
                error!(path = %path.display(), error = %e, "Sequence store unreadable; sequences will not persist");
                SequenceStore::in_memory()
            }),
            None => SequenceStore::in_memory(),
        };
        let id = Uuid::new_v4();
        debug!(session = %id, "Session created");
        Self {
            id,
            backend,
            locks: ResourceLocks::new(),
            config,
            catalog: Vec::new(),
            bindings: BTreeMap::new(),
            selected: None,
            history: Vec::new(),
            recorder: Recorder::default(),
            sequences,
            measurements: MeasurementLog::default(),
        }
    }

    /// Share a lock table with other sessions.
    pub fn with_locks(mut self, locks: ResourceLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Replace the sequence store.
    pub fn with_sequence_store(mut self, store: SequenceStore) -> Self {
        self.sequences = store;
        self
    }

    /// Session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Active configuration.
    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// Transport backend drivers are opened on.
    pub fn backend(&self) -> Arc<dyn TransportBackend> {
        Arc::clone(&self.backend)
    }

    /// Lock table.
    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    fn owner(&self, alias: &str) -> String {
        let id = self.id.simple().to_string();
        format!("{alias}@{}", &id[..8])
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    /// Latest discovery result.
    pub fn catalog(&self) -> &[InstrumentRecord] {
        &self.catalog
    }

    /// Replace the catalog.
    pub fn set_catalog(&mut self, records: Vec<InstrumentRecord>) {
        self.catalog = records;
        for alias in self.stale_aliases() {
            warn!(alias = %alias, "Bound instrument is no longer in the catalog");
        }
    }

    /// Run discovery and replace the catalog with its records.
    ///
    /// Resources the discovery pass found but left alone because they are
    /// held keep their previous catalog entry.
    pub async fn rescan(&mut self, discovery: &DiscoveryService) -> BenchResult<ScanReport> {
        let report = discovery.find_all().await?;
        let mut records = report.records.clone();
        records.extend(
            report
                .held
                .iter()
                .filter_map(|id| self.catalog_entry(id).cloned()),
        );
        records.sort_by(|a, b| (a.transport_kind, &a.address).cmp(&(b.transport_kind, &b.address)));
        self.set_catalog(records);
        Ok(report)
    }

    /// Catalog record for a resource.
    pub fn catalog_entry(&self, resource: &ResourceId) -> Option<&InstrumentRecord> {
        self.catalog.iter().find(|r| &r.resource_id == resource)
    }

    /// Resolve `#n` (1-based catalog index) or a `<kind>:<address>` id.
    pub fn resolve_resource(&self, text: &str) -> BenchResult<ResourceId> {
        if let Some(index) = text.strip_prefix('#') {
            let n: usize = index
                .parse()
                .map_err(|_| BenchError::Usage(format!("'{text}' is not a catalog index")))?;
            return n
                .checked_sub(1)
                .and_then(|i| self.catalog.get(i))
                .map(|r| r.resource_id.clone())
                .ok_or_else(|| BenchError::UnknownResource(text.to_string()));
        }
        text.parse::<ResourceId>()
            .map_err(|_| BenchError::UnknownResource(text.to_string()))
    }

    /// Bound aliases whose resource vanished from the latest catalog.
    pub fn stale_aliases(&self) -> Vec<String> {
        self.bindings
            .iter()
            .filter(|(_, d)| self.catalog_entry(&d.record().resource_id).is_none())
            .map(|(alias, _)| alias.clone())
            .collect()
    }

    // =========================================================================
    // Bindings
    // =========================================================================

    /// Open a driver for `resource` and bind it to `alias`.
    ///
    /// Fails with `UnknownResource` if the resource is not in the catalog and
    /// with `ResourceBusy` if another alias, here or in a session sharing the
    /// lock table, holds it. An alias that is already bound is unbound first.
    pub async fn bind(&mut self, alias: &str, resource: &ResourceId) -> BenchResult<&DriverHandle> {
        validate_alias(alias)?;
        let record = self
            .catalog_entry(resource)
            .cloned()
            .ok_or_else(|| BenchError::UnknownResource(resource.to_string()))?;

        if let Some((holder, _)) = self
            .bindings
            .iter()
            .find(|(a, d)| a.as_str() != alias && &d.record().resource_id == resource)
        {
            return Err(BenchError::ResourceBusy {
                resource: resource.to_string(),
                holder: holder.clone(),
            });
        }
        let rebinding_same = self
            .bindings
            .get(alias)
            .is_some_and(|d| &d.record().resource_id == resource);
        if !rebinding_same {
            if let Some(holder) = self.locks.holder(resource) {
                return Err(BenchError::ResourceBusy {
                    resource: resource.to_string(),
                    holder,
                });
            }
        }

        if let Err(e) = self.unbind(alias).await {
            warn!(alias, error = %e, "Previous binding did not close cleanly");
        }

        let owner = self.owner(alias);
        let driver = open_driver(
            &record,
            &owner,
            DriverContext {
                backend: self.backend.as_ref(),
                locks: &self.locks,
                transport: &self.config.transport,
                safety: &self.config.safety,
            },
        )
        .await?;
        info!(alias, resource_id = %resource, "Bound");
        Ok(self.bindings.entry(alias.to_string()).or_insert(driver))
    }

    /// Close and forget a binding. Unbinding an unbound alias is a no-op.
    ///
    /// The binding is removed and its resource released even if closing fails.
    pub async fn unbind(&mut self, alias: &str) -> BenchResult<bool> {
        let Some(driver) = self.bindings.remove(alias) else {
            return Ok(false);
        };
        if self.selected.as_deref() == Some(alias) {
            self.selected = None;
        }
        let result = driver.close().await;
        info!(alias, resource_id = %driver.record().resource_id, "Unbound");
        result.map(|_| true)
    }

    /// Bind every unbound catalog record of a known model to its preferred
    /// alias, then its fallback alias, then `<preferred>_<n>`.
    ///
    /// Returns the new bindings. Failures are logged and skipped.
    pub async fn auto_bind(&mut self) -> Vec<(String, ResourceId)> {
        let mut bound = Vec::new();
        let records = self.catalog.clone();
        for record in records {
            if self.alias_for(&record.resource_id).is_some() {
                continue;
            }
            let Some(descriptor) = record.descriptor() else {
                debug!(resource_id = %record.resource_id, "Unknown model, not auto-binding");
                continue;
            };
            let alias = [descriptor.alias.to_string(), descriptor.fallback_alias.to_string()]
                .into_iter()
                .chain((2..).map(|n| format!("{}_{n}", descriptor.alias)))
                .find(|candidate| !self.bindings.contains_key(candidate))
                .unwrap_or_else(|| descriptor.fallback_alias.to_string());
            match self.bind(&alias, &record.resource_id).await {
                Ok(_) => bound.push((alias, record.resource_id.clone())),
                Err(e) => warn!(alias = %alias, resource_id = %record.resource_id, error = %e, "Auto-bind failed"),
            }
        }
        bound
    }

    /// Driver bound to an alias.
    pub fn driver(&self, alias: &str) -> Option<&DriverHandle> {
        self.bindings.get(alias)
    }

    /// Driver bound to an alias, or `UnknownAlias`.
    pub fn require(&self, alias: &str) -> BenchResult<&DriverHandle> {
        self.driver(alias)
            .ok_or_else(|| BenchError::UnknownAlias(alias.to_string()))
    }

    /// Alias a resource is bound to in this session.
    pub fn alias_for(&self, resource: &ResourceId) -> Option<&str> {
        self.bindings
            .iter()
            .find(|(_, d)| &d.record().resource_id == resource)
            .map(|(a, _)| a.as_str())
    }

    /// Bindings in alias order.
    pub fn bindings(&self) -> impl Iterator<Item = (&str, &DriverHandle)> {
        self.bindings.iter().map(|(a, d)| (a.as_str(), d))
    }

    /// Whether an alias is bound.
    pub fn is_bound(&self, alias: &str) -> bool {
        self.bindings.contains_key(alias)
    }

    /// Make `alias` the implicit target.
    pub fn select(&mut self, alias: &str) -> BenchResult<()> {
        self.require(alias)?;
        self.selected = Some(alias.to_string());
        Ok(())
    }

    /// Implicit target, if any.
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    // =========================================================================
    // Safe state and teardown
    // =========================================================================

    /// Drive every bound instrument to its safe state.
    pub async fn enter_safe_state(&self) -> SafeStateReport {
        let mut report = SafeStateReport::default();
        for (alias, driver) in &self.bindings {
            match apply_safe_state(driver.as_ref()).await {
                Ok(()) => {
                    debug!(alias = %alias, "Safe state applied");
                    report.applied.push(alias.clone());
                }
                Err(e) => {
                    error!(alias = %alias, error = %e, "Safe state failed");
                    report.failures.push((alias.clone(), e));
                }
            }
        }
        report
    }

    /// Unbind everything. Close errors are logged; teardown always completes.
    pub async fn teardown(&mut self) {
        let aliases: Vec<String> = self.bindings.keys().cloned().collect();
        for alias in aliases {
            if let Err(e) = self.unbind(&alias).await {
                error!(alias = %alias, error = %e, "Close failed during teardown");
            }
        }
        self.selected = None;
        info!(session = %self.id, "Session torn down");
    }

    /// Teardown and clear history. The catalog, sequences and measurement log
    /// are kept.
    pub async fn reset(&mut self) {
        self.teardown().await;
        self.history.clear();
    }

    // =========================================================================
    // History and sequences
    // =========================================================================

    /// Append a history entry.
    pub fn push_history(&mut self, entry: CommandEntry) {
        self.history.push(entry);
    }

    /// Full history, oldest first.
    pub fn history(&self) -> &[CommandEntry] {
        &self.history
    }

    /// Recorder.
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Recorder, mutably.
    pub fn recorder_mut(&mut self) -> &mut Recorder {
        &mut self.recorder
    }

    /// Sequence store.
    pub fn sequences(&self) -> &SequenceStore {
        &self.sequences
    }

    /// Sequence store, mutably.
    pub fn sequences_mut(&mut self) -> &mut SequenceStore {
        &mut self.sequences
    }

    /// Measurement log.
    pub fn measurements(&self) -> &MeasurementLog {
        &self.measurements
    }

    /// Measurement log, mutably.
    pub fn measurements_mut(&mut self) -> &mut MeasurementLog {
        &mut self.measurements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::SimulatedBench;
    use crate::transport::TransportKind;

    async fn demo_session() -> (SimulatedBench, Session) {
        let bench = SimulatedBench::demo();
        let backend: Arc<dyn TransportBackend> = Arc::new(bench.clone());
        let config = BenchConfig::ephemeral();
        let discovery = DiscoveryService::new(backend.clone(), &config);
        let mut session = Session::new(backend, config);
        let discovery = discovery.with_locks(session.locks().clone());
        session.rescan(&discovery).await.unwrap();
        (bench, session)
    }

    #[test]
    fn alias_rules() {
        assert!(validate_alias("psu").is_ok());
        assert!(validate_alias("psu_2").is_ok());
        assert!(validate_alias("scope-a").is_ok());
        assert!(validate_alias("2psu").is_err());
        assert!(validate_alias("my psu").is_err());
        assert!(validate_alias("scan").is_err());
        assert!(validate_alias("Record").is_err());
    }

    #[tokio::test]
    async fn auto_bind_uses_fallback_aliases() {
        let (_, mut session) = demo_session().await;
        let bound = session.auto_bind().await;
        let aliases: Vec<_> = bound.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(aliases, vec!["scope", "awg", "dmm", "psu", "awg_jds", "psu_matrix"]);
        assert_eq!(session.locks().held_count(), 6);
        assert!(session.auto_bind().await.is_empty());
    }

    #[tokio::test]
    async fn catalog_index_resolves() {
        let (_, session) = demo_session().await;
        assert_eq!(
            session.resolve_resource("#3").unwrap().as_str(),
            "gpib:GPIB0::22::INSTR"
        );
        assert!(matches!(session.resolve_resource("#99"), Err(BenchError::UnknownResource(_))));
        assert!(matches!(session.resolve_resource("nonsense"), Err(BenchError::UnknownResource(_))));
    }

    #[tokio::test]
    async fn rebinding_an_alias_releases_the_old_resource() {
        let (_, mut session) = demo_session().await;
        let hp = ResourceId::new(TransportKind::Gpib, "GPIB0::5::INSTR");
        let matrix = ResourceId::new(TransportKind::Serial, "/dev/ttyUSB1");
        session.bind("supply", &hp).await.unwrap();
        session.bind("supply", &matrix).await.unwrap();
        assert!(session.locks().holder(&hp).is_none());
        assert_eq!(session.alias_for(&matrix), Some("supply"));
        session.bind("supply", &matrix).await.unwrap();
        assert_eq!(session.locks().held_count(), 1);
    }

    #[tokio::test]
    async fn vanished_resources_are_flagged() {
        let (bench, mut session) = demo_session().await;
        let hp = ResourceId::new(TransportKind::Gpib, "GPIB0::5::INSTR");
        session.bind("psu", &hp).await.unwrap();
        bench.remove(TransportKind::Gpib, "GPIB0::5::INSTR");
        let discovery = DiscoveryService::new(session.backend(), session.config())
            .with_locks(session.locks().clone());
        session.rescan(&discovery).await.unwrap();
        assert_eq!(session.stale_aliases(), vec!["psu".to_string()]);
        assert!(session.is_bound("psu"));
    }

    #[tokio::test]
    async fn rescan_leaves_bound_resources_alone() {
        let (bench, mut session) = demo_session().await;
        let hp = ResourceId::new(TransportKind::Gpib, "GPIB0::5::INSTR");
        session.bind("psu", &hp).await.unwrap();
        let opens = bench.open_count(TransportKind::Gpib, "GPIB0::5::INSTR");
        let discovery = DiscoveryService::new(session.backend(), session.config())
            .with_locks(session.locks().clone());
        let report = session.rescan(&discovery).await.unwrap();
        assert_eq!(report.held, vec![hp.clone()]);
        assert_eq!(bench.open_count(TransportKind::Gpib, "GPIB0::5::INSTR"), opens);
        assert!(session.catalog_entry(&hp).is_some());
        assert!(session.stale_aliases().is_empty());
    }

    #[tokio::test]
    async fn unbinding_clears_selection() {
        let (_, mut session) = demo_session().await;
        session.auto_bind().await;
        session.select("dmm").unwrap();
        assert_eq!(session.selected(), Some("dmm"));
        assert!(session.unbind("dmm").await.unwrap());
        assert!(!session.unbind("dmm").await.unwrap());
        assert_eq!(session.selected(), None);
        assert!(matches!(session.select("dmm"), Err(BenchError::UnknownAlias(_))));
    }
}
