//! Sequence Recorder/Player
//!
//! A [`Recorder`] captures command lines verbatim between `record start` and
//! `record stop`. The finished [`RecordedSequence`] keeps each line together
//! with the `{name}` placeholders found in it, so rendering is a pure function
//! of the step text and the variable bindings.
//!
//! Sequences live in a [`SequenceStore`], persisted as pretty JSON.
//!
//! # Example
//!
//! ```
//! use lab_bench::sequence::Recorder;
//! use std::collections::BTreeMap;
//!
//! let mut recorder = Recorder::default();
//! recorder.start("sweep", BTreeMap::new(), false)?;
//! recorder.capture("awg wave 1 sine freq={f}");
//! let sequence = recorder.stop(None)?;
//!
//! let mut vars = BTreeMap::new();
//! vars.insert("f".to_string(), "2000".to_string());
//! assert_eq!(sequence.render(&vars)?, vec!["awg wave 1 sine freq=2000"]);
//! # Ok::<(), lab_bench::error::BenchError>(())
//! ```

use crate::error::{BenchError, BenchResult};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use strfmt::strfmt;
use tracing::{debug, info};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

/// Placeholder names in `text`, in order of first appearance.
pub fn placeholders(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    PLACEHOLDER
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// One captured command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceStep {
    /// Literal command text, placeholders included
    pub text: String,
    /// Placeholder names appearing in `text`
    pub placeholders: Vec<String>,
}

impl SequenceStep {
    /// Capture a line.
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            placeholders: placeholders(text),
        }
    }
}

/// A named, replayable command trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedSequence {
    /// Sequence name
    pub name: String,
    /// Steps in capture order
    pub steps: Vec<SequenceStep>,
    /// Values used when a replay does not bind a variable
    #[serde(default)]
    pub variable_defaults: BTreeMap<String, String>,
    /// Keep replaying after a failing step
    #[serde(default)]
    pub continue_on_error: bool,
    /// When recording finished
    pub created: DateTime<Utc>,
}

impl RecordedSequence {
    /// Every placeholder used by any step.
    pub fn variables(&self) -> BTreeSet<String> {
        self.steps
            .iter()
            .flat_map(|s| s.placeholders.iter().cloned())
            .collect()
    }

    /// Substitute every placeholder in every step.
    ///
    /// `bindings` take precedence over the stored defaults. Fails with
    /// `MissingVariable` naming every unbound placeholder, before any step is
    /// rendered.
    pub fn render(&self, bindings: &BTreeMap<String, String>) -> BenchResult<Vec<String>> {
        let mut values: HashMap<String, String> = self
            .variable_defaults
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        values.extend(bindings.iter().map(|(k, v)| (k.clone(), v.clone())));

        let missing: Vec<String> = self
            .variables()
            .into_iter()
            .filter(|name| !values.contains_key(name))
            .collect();
        if !missing.is_empty() {
            return Err(BenchError::MissingVariable(missing));
        }

        self.steps
            .iter()
            .map(|step| {
                if step.placeholders.is_empty() {
                    return Ok(step.text.clone());
                }
                strfmt(&step.text, &values).map_err(|e| {
                    BenchError::Usage(format!("cannot substitute into '{}': {e}", step.text))
                })
            })
            .collect()
    }
}

#[derive(Debug)]
struct ActiveRecording {
    name: String,
    steps: Vec<SequenceStep>,
    variable_defaults: BTreeMap<String, String>,
    continue_on_error: bool,
}

/// Captures command lines between `start` and `stop`.
#[derive(Debug, Default)]
pub struct Recorder {
    active: Option<ActiveRecording>,
}

impl Recorder {
    /// Begin a recording. Fails if one is already running.
    pub fn start(
        &mut self,
        name: &str,
        variable_defaults: BTreeMap<String, String>,
        continue_on_error: bool,
    ) -> BenchResult<()> {
        if let Some(active) = &self.active {
            return Err(BenchError::RecorderState(format!(
                "already recording '{}'; stop it before starting '{name}'",
                active.name
            )));
        }
        info!(sequence = name, "Recording started");
        self.active = Some(ActiveRecording {
            name: name.to_string(),
            steps: Vec::new(),
            variable_defaults,
            continue_on_error,
        });
        Ok(())
    }

    /// Finish the recording. `name`, when given, must match the running one.
    pub fn stop(&mut self, name: Option<&str>) -> BenchResult<RecordedSequence> {
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| BenchError::RecorderState("no recording in progress".to_string()))?;
        if let Some(name) = name {
            if name != active.name {
                return Err(BenchError::RecorderState(format!(
                    "recording '{}' is in progress, not '{name}'",
                    active.name
                )));
            }
        }
        let active = self
            .active
            .take()
            .ok_or_else(|| BenchError::RecorderState("no recording in progress".to_string()))?;
        info!(sequence = %active.name, steps = active.steps.len(), "Recording stopped");
        Ok(RecordedSequence {
            name: active.name,
            steps: active.steps,
            variable_defaults: active.variable_defaults,
            continue_on_error: active.continue_on_error,
            created: Utc::now(),
        })
    }

    /// Append a line to the running recording, if any.
    pub fn capture(&mut self, text: &str) {
        if let Some(active) = &mut self.active {
            active.steps.push(SequenceStep::new(text));
        }
    }

    /// Name of the running recording.
    pub fn active_name(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.name.as_str())
    }

    /// Steps captured so far.
    pub fn captured(&self) -> usize {
        self.active.as_ref().map_or(0, |a| a.steps.len())
    }
}

/// Named sequences, optionally backed by a JSON file.
#[derive(Debug, Default)]
pub struct SequenceStore {
    path: Option<PathBuf>,
    sequences: BTreeMap<String, RecordedSequence>,
}

impl SequenceStore {
    /// Store kept only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the store at `path`; a missing file yields an empty store.
    pub fn open(path: impl AsRef<Path>) -> BenchResult<Self> {
        let path = path.as_ref().to_path_buf();
        let sequences = if path.exists() {
            let text = fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&text)?
            }
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), count = sequences.len(), "Sequence store loaded");
        Ok(Self {
            path: Some(path),
            sequences,
        })
    }

    /// Backing file, if persistent.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Look a sequence up by name.
    pub fn get(&self, name: &str) -> Option<&RecordedSequence> {
        self.sequences.get(name)
    }

    /// Sequences in name order.
    pub fn iter(&self) -> impl Iterator<Item = &RecordedSequence> {
        self.sequences.values()
    }

    /// Number of stored sequences.
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Add or replace a sequence and persist.
    ///
    /// The sequence stays available in memory even if writing the file fails.
    pub fn insert(&mut self, sequence: RecordedSequence) -> BenchResult<()> {
        self.sequences.insert(sequence.name.clone(), sequence);
        self.save()
    }

    /// Remove a sequence and persist.
    pub fn remove(&mut self, name: &str) -> BenchResult<RecordedSequence> {
        let removed = self
            .sequences
            .remove(name)
            .ok_or_else(|| BenchError::UnknownSequence(name.to_string()))?;
        self.save()?;
        Ok(removed)
    }

    fn save(&self) -> BenchResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&self.sequences)?;
        fs::write(path, text)
            .map_err(|e| BenchError::Persistence(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), count = self.sequences.len(), "Sequence store saved");
        Ok(())
    }
}
