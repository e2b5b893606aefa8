//! Command Interpreter
//!
//! Turns one line of operator input into one dispatch against the
//! [`Session`]. The first token picks the target:
//!
//! - a session verb (`scan`, `bind`, `state`, `record`, ...)
//! - a bound alias, optionally followed by a capability keyword
//!   (`scope awg wave 1 sine`)
//! - anything else goes to the alias chosen with `use`
//!
//! Every dispatch lands in the session history with its outcome, and in the
//! active recording (if any) as the literal line. Errors never escape as
//! panics: [`Interpreter::execute`] returns them for display and the loop
//! carries on.
//!
//! Replays feed rendered lines back through [`Interpreter::execute`]. A stack
//! of running replays rejects recursion.

pub mod parser;
pub mod verbs;

use crate::config::BenchConfig;
use crate::discovery::DiscoveryService;
use crate::error::{BenchError, BenchResult};
use crate::hardware::capabilities::CapabilityTag;
use crate::hardware::Instrument;
use crate::measurement::LogFormat;
use crate::sequence::RecordedSequence;
use crate::session::{apply_safe_state, CommandEntry, Outcome, SafeStateReport, Session};
use crate::transport::TransportBackend;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use parser::{parse_bindings, parse_number, tokenize};
use std::fmt;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Session verbs: `(verb, usage, summary)`.
pub const SESSION_VERBS: &[(&str, &str, &str)] = &[
    ("scan", "scan", "discover instruments and bind known models"),
    ("list", "list", "show the catalog and bindings"),
    ("use", "use <alias>", "send unprefixed lines to <alias>"),
    ("bind", "bind <alias> <resource|#n>", "open a driver under an alias"),
    ("unbind", "unbind <alias>", "close a driver"),
    ("state", "state safe|off|on|reset  |  state <alias> safe|off|on|reset", "switch outputs or reset"),
    ("idn", "idn [alias]", "query identification"),
    ("raw", "raw [alias] <text>", "send text as-is; queries end in '?'"),
    ("status", "status", "session summary"),
    ("history", "history [n]", "last n dispatched lines"),
    ("sleep", "sleep <seconds>", "pause"),
    ("record", "record start <name> [--continue-on-error] [var=default]...  |  record stop [name]", "capture lines into a sequence"),
    ("replay", "replay <name> [var=value]...", "run a recorded sequence"),
    ("sequences", "sequences", "list recorded sequences"),
    ("sequence", "sequence show|delete <name>", "inspect or remove a sequence"),
    ("log", "log print|save <path> [csv|txt]|clear", "show, save or clear logged measurements"),
    ("close", "close", "safe state, close every instrument, clear history"),
    ("help", "help [verb|alias]", "this text"),
    ("exit", "exit", "safe state, close everything, leave"),
    ("quit", "quit", "same as exit"),
];

const DEFAULT_HISTORY_LINES: usize = 20;

fn is_session_verb(word: &str) -> bool {
    SESSION_VERBS.iter().any(|(verb, _, _)| *verb == word)
}

/// What a dispatch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Nothing to print
    Empty,
    /// Text for the operator
    Text(String),
    /// The operator asked to leave
    Exit,
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        if text.is_empty() {
            Reply::Empty
        } else {
            Reply::Text(text)
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Text(text) => f.write_str(text),
            Reply::Empty | Reply::Exit => Ok(()),
        }
    }
}

/// Where a line goes.
#[derive(Debug, Clone, PartialEq)]
enum Target {
    Session {
        verb: String,
        args: Vec<String>,
    },
    Instrument {
        alias: String,
        selector: Option<CapabilityTag>,
        verb: String,
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateAction {
    Safe,
    Off,
    On,
    Reset,
}

impl StateAction {
    fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "safe" => Some(StateAction::Safe),
            "off" => Some(StateAction::Off),
            "on" => Some(StateAction::On),
            "reset" => Some(StateAction::Reset),
            _ => None,
        }
    }

    async fn apply(self, driver: &dyn Instrument) -> BenchResult<()> {
        match self {
            StateAction::Safe => apply_safe_state(driver).await,
            StateAction::Reset => driver.reset().await,
            StateAction::Off => {
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
                first_error.map_or(Ok(()), Err)
            }
            StateAction::On => {
                if let Some(psu) = driver.as_power_supply() {
                    psu.output_on().await?;
                }
                if let Some(awg) = driver.as_function_generator() {
                    for channel in 1..=awg.channel_count() {
                        awg.set_output(channel, true).await?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for StateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            StateAction::Safe => "safe",
            StateAction::Off => "off",
            StateAction::On => "on",
            StateAction::Reset => "reset",
        };
        f.write_str(word)
    }
}

/// The line-oriented command surface.
pub struct Interpreter {
    session: Session,
    discovery: DiscoveryService,
    replaying: Vec<String>,
}

impl Interpreter {
    /// Interpreter over a fresh session on `backend`.
    pub fn new(backend: Arc<dyn TransportBackend>, config: BenchConfig) -> Self {
        Self::with_session(Session::new(backend, config))
    }

    /// Interpreter over an existing session.
    pub fn with_session(session: Session) -> Self {
        let discovery = DiscoveryService::new(session.backend(), session.config())
            .with_locks(session.locks().clone());
        Self {
            session,
            discovery,
            replaying: Vec::new(),
        }
    }

    /// Session state.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Session state, mutably.
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Scan, auto-bind, and apply the safe state when configured.
    pub async fn startup(&mut self) -> BenchResult<String> {
        let mut text = self.scan().await?;
        if self.session.config().session.safe_state_on_start && self.session.bindings().next().is_some() {
            let applied = self.session.enter_safe_state().await.into_result()?;
            let _ = write!(text, "\nSafe state: {}", applied.join(", "));
        }
        Ok(text)
    }

    /// Safe state on every binding, then teardown.
    pub async fn shutdown(&mut self) -> SafeStateReport {
        let report = self.session.enter_safe_state().await;
        self.session.teardown().await;
        report
    }

    /// Dispatch one line.
    ///
    /// Blank lines and `#` comments do nothing and are not recorded.
    pub async fn execute(&mut self, line: &str) -> BenchResult<Reply> {
        self.run_line(line).await
    }

    fn run_line<'a>(&'a mut self, line: &'a str) -> BoxFuture<'a, BenchResult<Reply>> {
        async move {
            let text = line.trim();
            if text.is_empty() || text.starts_with('#') {
                return Ok(Reply::Empty);
            }

            let (target, result) = match tokenize(text) {
                Ok(tokens) => {
                    let target = self.resolve(tokens);
                    let result = self.dispatch(&target).await;
                    (Some(target), result)
                }
                Err(e) => (None, Err(e)),
            };

            if let Err(e) = &result {
                debug!(line = text, error = %e, "Dispatch failed");
            }
            self.log_history(text, target, &result);

            let first = text.split_whitespace().next().unwrap_or_default().to_ascii_lowercase();
            if self.replaying.is_empty() && !matches!(first.as_str(), "record" | "exit" | "quit") {
                self.session.recorder_mut().capture(text);
            }
            result
        }
        .boxed()
    }

    fn log_history(&mut self, text: &str, target: Option<Target>, result: &BenchResult<Reply>) {
        let (resolved_alias, verb, args) = match target {
            Some(Target::Session { verb, args }) => (None, verb, args),
            Some(Target::Instrument { alias, verb, args, .. }) => (Some(alias), verb, args),
            None => (None, String::new(), Vec::new()),
        };
        self.session.push_history(CommandEntry {
            timestamp: Utc::now(),
            raw_text: text.to_string(),
            resolved_alias,
            verb,
            args,
            outcome: Outcome::from_result(result),
        });
    }

    fn resolve(&self, tokens: Vec<String>) -> Target {
        let mut words = tokens.into_iter();
        let first = words.next().unwrap_or_default();
        let lower = first.to_ascii_lowercase();
        if is_session_verb(&lower) {
            return Target::Session {
                verb: lower,
                args: words.collect(),
            };
        }
        if self.session.is_bound(&first) {
            return instrument_target(first, words.collect());
        }
        match self.session.selected() {
            Some(selected) => {
                let mut all = vec![first];
                all.extend(words);
                instrument_target(selected.to_string(), all)
            }
            // Unbound alias; dispatch reports it.
            None => instrument_target(first, words.collect()),
        }
    }

    async fn dispatch(&mut self, target: &Target) -> BenchResult<Reply> {
        match target {
            Target::Session { verb, args } => self.session_verb(verb, args).await,
            Target::Instrument {
                alias,
                selector,
                verb,
                args,
            } => {
                let driver = self.session.require(alias)?;
                if verb.is_empty() {
                    return Err(BenchError::Usage(format!(
                        "missing verb for '{alias}' (try `help {alias}`)"
                    )));
                }
                let output = verbs::dispatch(alias, driver.as_ref(), *selector, verb, args).await?;
                for measurement in output.measurements {
                    self.session.measurements_mut().push(measurement);
                }
                Ok(Reply::text(output.text))
            }
        }
    }

    async fn session_verb(&mut self, verb: &str, args: &[String]) -> BenchResult<Reply> {
        match verb {
            "scan" => self.scan().await.map(Reply::text),
            "list" => Ok(Reply::text(self.render_catalog())),
            "use" => {
                let alias = required(args, 0, "usage: use <alias>")?;
                self.session.select(alias)?;
                Ok(Reply::text(format!("Using '{alias}'")))
            }
            "bind" => {
                let alias = required(args, 0, "usage: bind <alias> <resource|#n>")?;
                let resource = required(args, 1, "usage: bind <alias> <resource|#n>")?;
                let id = self.session.resolve_resource(resource)?;
                let driver = self.session.bind(alias, &id).await?;
                Ok(Reply::text(format!(
                    "Bound '{alias}' to {id} ({})",
                    driver.record().display_name()
                )))
            }
            "unbind" => {
                let alias = required(args, 0, "usage: unbind <alias>")?;
                if self.session.unbind(alias).await? {
                    Ok(Reply::text(format!("Unbound '{alias}'")))
                } else {
                    Ok(Reply::text(format!("'{alias}' was not bound")))
                }
            }
            "state" => self.state(args).await.map(Reply::text),
            "idn" => {
                let alias = match args.first() {
                    Some(alias) => alias.as_str(),
                    None => self.selected_alias()?,
                };
                let driver = self.session.require(alias)?;
                driver.identify().await.map(Reply::text)
            }
            "raw" => {
                let (alias, words) = match args.split_first() {
                    Some((first, rest)) if !rest.is_empty() && self.session.is_bound(first) => {
                        (first.as_str(), rest)
                    }
                    _ => (self.selected_alias()?, args),
                };
                if words.is_empty() {
                    return Err(BenchError::Usage("usage: raw [alias] <text>".to_string()));
                }
                let driver = self.session.require(alias)?;
                let response = driver.raw(&words.join(" ")).await?;
                Ok(Reply::text(response.unwrap_or_default()))
            }
            "status" => Ok(Reply::text(self.render_status())),
            "history" => {
                let count = match args.first() {
                    Some(n) => n
                        .parse::<usize>()
                        .map_err(|_| BenchError::Usage(format!("'{n}' is not a count")))?,
                    None => DEFAULT_HISTORY_LINES,
                };
                Ok(Reply::text(self.render_history(count)))
            }
            "sleep" => {
                let seconds = parse_number(required(args, 0, "usage: sleep <seconds>")?)?;
                if !seconds.is_finite() || seconds < 0.0 {
                    return Err(BenchError::Usage("sleep needs a non-negative duration".to_string()));
                }
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                Ok(Reply::Empty)
            }
            "record" => self.record(args).map(Reply::text),
            "replay" => {
                let name = required(args, 0, "usage: replay <name> [var=value]...")?;
                let bindings = parse_bindings(&args[1..])?;
                self.replay(name, &bindings).await.map(Reply::text)
            }
            "sequences" => Ok(Reply::text(self.render_sequences())),
            "sequence" => {
                let usage = "usage: sequence show|delete <name>";
                let action = required(args, 0, usage)?;
                let name = required(args, 1, usage)?;
                match action.to_ascii_lowercase().as_str() {
                    "show" => {
                        let sequence = self
                            .session
                            .sequences()
                            .get(name)
                            .ok_or_else(|| BenchError::UnknownSequence(name.to_string()))?;
                        Ok(Reply::text(render_sequence(sequence)))
                    }
                    "delete" => {
                        self.session.sequences_mut().remove(name)?;
                        Ok(Reply::text(format!("Deleted '{name}'")))
                    }
                    _ => Err(BenchError::Usage(usage.to_string())),
                }
            }
            "log" => self.log(args).map(Reply::text),
            "close" => self.close().await.map(Reply::text),
            "help" => self.help(args.first().map(String::as_str)).map(Reply::text),
            _ => Ok(Reply::Exit),
        }
    }

    fn selected_alias(&self) -> BenchResult<&str> {
        self.session
            .selected()
            .ok_or_else(|| BenchError::Usage("no alias given and none selected with `use`".to_string()))
    }

    // =========================================================================
    // Scanning and listing
    // =========================================================================

    async fn scan(&mut self) -> BenchResult<String> {
        let report = self.session.rescan(&self.discovery).await?;
        let bound = if self.session.config().session.auto_bind {
            self.session.auto_bind().await
        } else {
            Vec::new()
        };

        let mut text = self.render_catalog();
        for address in &report.unresponsive {
            let _ = write!(
                text,
                "\nNo answer from {}:{} after {} attempt(s): {}",
                address.kind, address.address, address.attempts, address.reason
            );
        }
        for (kind, error) in &report.enumeration_errors {
            let _ = write!(text, "\nCould not enumerate {kind}: {error}");
        }
        if !bound.is_empty() {
            let aliases: Vec<&str> = bound.iter().map(|(alias, _)| alias.as_str()).collect();
            let _ = write!(text, "\nBound: {}", aliases.join(", "));
        }
        info!(
            found = report.records.len(),
            bound = bound.len(),
            "Catalog refreshed"
        );
        Ok(text)
    }

    fn render_catalog(&self) -> String {
        let catalog = self.session.catalog();
        let mut text = String::new();
        if catalog.is_empty() {
            text.push_str("No instruments in the catalog. Run `scan`.");
        } else {
            let _ = write!(
                text,
                "{:>3}  {:<48}  {:<26}  {:<30}  {}",
                "#", "RESOURCE", "MODEL", "CAPABILITIES", "ALIAS"
            );
            for (index, record) in catalog.iter().enumerate() {
                let alias = self.session.alias_for(&record.resource_id).unwrap_or("-");
                let _ = write!(
                    text,
                    "\n{:>3}  {:<48}  {:<26}  {:<30}  {}",
                    index + 1,
                    record.resource_id.to_string(),
                    record.display_name(),
                    record.capability_list(),
                    alias
                );
            }
        }
        for alias in self.session.stale_aliases() {
            if let Some(driver) = self.session.driver(&alias) {
                let _ = write!(
                    text,
                    "\n  ! '{alias}' is bound to {} which was not found by the last scan",
                    driver.record().resource_id
                );
            }
        }
        text
    }

    fn render_status(&self) -> String {
        let session = &self.session;
        let mut text = format!("Session {}", session.id());
        let _ = write!(text, "\nSelected: {}", session.selected().unwrap_or("none"));
        let _ = write!(text, "\nCatalog: {} instrument(s)", session.catalog().len());
        let stale = session.stale_aliases();
        for (alias, driver) in session.bindings() {
            let record = driver.record();
            let mut flags = Vec::new();
            if !driver.state_known() {
                flags.push("state unknown, reset advised");
            }
            if stale.iter().any(|s| s == alias) {
                flags.push("not seen in last scan");
            }
            let _ = write!(
                text,
                "\n  {alias:<12} {:<26} {}",
                record.display_name(),
                record.resource_id
            );
            if !flags.is_empty() {
                let _ = write!(text, "  [{}]", flags.join("; "));
            }
        }
        match session.recorder().active_name() {
            Some(name) => {
                let _ = write!(
                    text,
                    "\nRecording: '{name}' ({} step(s))",
                    session.recorder().captured()
                );
            }
            None => text.push_str("\nRecording: off"),
        }
        let store = session.sequences();
        let _ = write!(text, "\nSequences: {}", store.len());
        if let Some(path) = store.path() {
            let _ = write!(text, " ({})", path.display());
        }
        let _ = write!(text, "\nHistory: {} line(s)", session.history().len());
        text
    }

    fn render_history(&self, count: usize) -> String {
        let history = self.session.history();
        let start = history.len().saturating_sub(count);
        let lines: Vec<String> = history[start..]
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let outcome = match &entry.outcome {
                    Outcome::Success(_) => "ok".to_string(),
                    Outcome::Failure { kind, .. } => kind.to_string(),
                };
                format!(
                    "{:>4}  {}  {:<40}  {}",
                    start + i + 1,
                    entry.timestamp.format("%H:%M:%S"),
                    entry.raw_text,
                    outcome
                )
            })
            .collect();
        if lines.is_empty() {
            "History is empty.".to_string()
        } else {
            lines.join("\n")
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    async fn state(&mut self, args: &[String]) -> BenchResult<String> {
        let usage = || BenchError::Usage("usage: state safe|off|on|reset  or  state <alias> safe|off|on|reset".to_string());
        match args {
            [word] => {
                let action = StateAction::parse(word).ok_or_else(usage)?;
                let report = match action {
                    StateAction::Safe => self.session.enter_safe_state().await,
                    _ => self.apply_everywhere(action).await,
                };
                let applied = report.into_result()?;
                if applied.is_empty() {
                    Ok("No instruments bound.".to_string())
                } else {
                    Ok(format!("{action}: {}", applied.join(", ")))
                }
            }
            [alias, word] => {
                let action = StateAction::parse(word).ok_or_else(usage)?;
                let driver = self.session.require(alias)?;
                action.apply(driver.as_ref()).await?;
                Ok(format!("{alias}: {action}"))
            }
            _ => Err(usage()),
        }
    }

    /// Safe state, then close every binding and clear history. Teardown runs
    /// even when safe state fails; the failure is reported afterwards.
    async fn close(&mut self) -> BenchResult<String> {
        let closed = self.session.bindings().count();
        let report = self.session.enter_safe_state().await;
        self.session.reset().await;
        report.into_result()?;
        info!(closed, "Instruments closed");
        Ok(format!("Closed {closed} instrument(s); history cleared"))
    }

    // =========================================================================
    // Measurement log
    // =========================================================================

    fn log(&mut self, args: &[String]) -> BenchResult<String> {
        let usage = "usage: log print|save <path> [csv|txt]|clear";
        let action = args.first().map(|a| a.to_ascii_lowercase());
        match action.as_deref() {
            None | Some("print") => {
                let log = self.session.measurements();
                if log.is_empty() {
                    Ok("No measurements recorded.".to_string())
                } else {
                    Ok(log.render_table())
                }
            }
            Some("save") => {
                let path = Path::new(required(args, 1, usage)?);
                let format = match args.get(2) {
                    Some(format) => format.parse()?,
                    None => LogFormat::from_path(path).ok_or_else(|| {
                        BenchError::Usage(format!(
                            "cannot tell the format of '{}'; add csv or txt",
                            path.display()
                        ))
                    })?,
                };
                let rows = self.session.measurements().save(path, format)?;
                Ok(format!("Saved {rows} measurement(s) to {}", path.display()))
            }
            Some("clear") => {
                let removed = self.session.measurements_mut().clear();
                Ok(format!("Cleared {removed} measurement(s)"))
            }
            Some(_) => Err(BenchError::Usage(usage.to_string())),
        }
    }

    async fn apply_everywhere(&self, action: StateAction) -> SafeStateReport {
        let mut report = SafeStateReport::default();
        for (alias, driver) in self.session.bindings() {
            match action.apply(driver.as_ref()).await {
                Ok(()) => report.applied.push(alias.to_string()),
                Err(e) => {
                    warn!(alias, action = %action, error = %e, "State change failed");
                    report.failures.push((alias.to_string(), e));
                }
            }
        }
        report
    }

    // =========================================================================
    // Record and replay
    // =========================================================================

    fn record(&mut self, args: &[String]) -> BenchResult<String> {
        let usage = "usage: record start <name> [--continue-on-error] [var=default]...  or  record stop [name]";
        let action = required(args, 0, usage)?;
        match action.to_ascii_lowercase().as_str() {
            "start" => {
                let name = required(args, 1, usage)?;
                if name.starts_with('-') || name.contains('=') {
                    return Err(BenchError::Usage(usage.to_string()));
                }
                if !self.replaying.is_empty() {
                    return Err(BenchError::RecorderState(
                        "cannot start recording during a replay".to_string(),
                    ));
                }
                let mut continue_on_error = false;
                let mut defaults = Vec::new();
                for token in &args[2..] {
                    match token.as_str() {
                        "--continue-on-error" => continue_on_error = true,
                        _ => defaults.push(token.clone()),
                    }
                }
                let defaults = parse_bindings(&defaults)?;
                self.session
                    .recorder_mut()
                    .start(name, defaults, continue_on_error)?;
                Ok(format!("Recording '{name}'. Finish with `record stop`."))
            }
            "stop" => {
                let sequence = self
                    .session
                    .recorder_mut()
                    .stop(args.get(1).map(String::as_str))?;
                let name = sequence.name.clone();
                let steps = sequence.steps.len();
                let variables: Vec<String> = sequence.variables().into_iter().collect();
                // Kept in memory even when writing the store fails.
                self.session.sequences_mut().insert(sequence)?;
                let mut text = format!("Saved '{name}' ({steps} step(s))");
                if !variables.is_empty() {
                    let _ = write!(text, ", variables: {}", variables.join(", "));
                }
                Ok(text)
            }
            _ => Err(BenchError::Usage(usage.to_string())),
        }
    }

    async fn replay(
        &mut self,
        name: &str,
        bindings: &std::collections::BTreeMap<String, String>,
    ) -> BenchResult<String> {
        if self.replaying.iter().any(|running| running == name) {
            return Err(BenchError::RecorderState(format!(
                "'{name}' is already replaying; a sequence cannot replay itself"
            )));
        }
        let sequence = self
            .session
            .sequences()
            .get(name)
            .cloned()
            .ok_or_else(|| BenchError::UnknownSequence(name.to_string()))?;
        let lines = sequence.render(bindings)?;

        info!(sequence = name, steps = lines.len(), "Replay started");
        self.replaying.push(name.to_string());
        let result = self.replay_lines(&sequence, &lines).await;
        self.replaying.pop();
        result
    }

    async fn replay_lines(
        &mut self,
        sequence: &RecordedSequence,
        lines: &[String],
    ) -> BenchResult<String> {
        let mut failures = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            let step = index + 1;
            debug!(sequence = %sequence.name, step, line = %line, "Replaying");
            match self.run_line(line).await {
                Ok(_) => {}
                Err(e) if sequence.continue_on_error => {
                    warn!(sequence = %sequence.name, step, error = %e, "Step failed, continuing");
                    failures.push(format!("step {step}: {e}"));
                }
                Err(e) => {
                    return Err(BenchError::ReplayAborted {
                        sequence: sequence.name.clone(),
                        step,
                        source: Box::new(e),
                    })
                }
            }
        }
        let mut text = format!(
            "Replayed '{}': {} of {} step(s) succeeded",
            sequence.name,
            lines.len() - failures.len(),
            lines.len()
        );
        for failure in failures {
            let _ = write!(text, "\n  {failure}");
        }
        Ok(text)
    }

    fn render_sequences(&self) -> String {
        let store = self.session.sequences();
        if store.is_empty() {
            return "No recorded sequences.".to_string();
        }
        store
            .iter()
            .map(|sequence| {
                let variables: Vec<String> = sequence.variables().into_iter().collect();
                let mut line = format!("{:<20} {:>3} step(s)", sequence.name, sequence.steps.len());
                if !variables.is_empty() {
                    let _ = write!(line, "  vars: {}", variables.join(", "));
                }
                if sequence.continue_on_error {
                    line.push_str("  [continue-on-error]");
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    // =========================================================================
    // Help
    // =========================================================================

    fn help(&self, topic: Option<&str>) -> BenchResult<String> {
        let mut text = String::new();
        match topic {
            None => {
                text.push_str("Session commands:");
                for (_, usage, summary) in SESSION_VERBS {
                    let _ = write!(text, "\n  {usage}\n      {summary}");
                }
                text.push_str("\n\nInstrument commands: <alias> [capability] <verb> <args>");
                for tag in verbs::LOOKUP_ORDER {
                    let _ = write!(text, "\n  {} ({tag}):", tag.keyword());
                    for (_, usage) in verbs::verb_table(tag) {
                        let _ = write!(text, "\n      {usage}");
                    }
                }
                let _ = write!(text, "\n  any alias: {}", verbs::UNIFORM_VERBS.join(", "));
            }
            Some(word) if self.session.is_bound(word) => {
                let driver = self.session.require(word)?;
                let record = driver.record();
                let _ = write!(text, "{word}: {} ({})", record.display_name(), record.capability_list());
                for tag in verbs::LOOKUP_ORDER.into_iter().filter(|t| record.has(*t)) {
                    for (_, usage) in verbs::verb_table(tag) {
                        let _ = write!(text, "\n  {word} {usage}");
                    }
                }
                let _ = write!(text, "\n  {word} {}", verbs::UNIFORM_VERBS.join("|"));
            }
            Some(word) => {
                let lower = word.to_ascii_lowercase();
                let (_, usage, summary) = SESSION_VERBS
                    .iter()
                    .find(|(verb, _, _)| *verb == lower)
                    .ok_or_else(|| BenchError::Usage(format!("no help for '{word}'")))?;
                let _ = write!(text, "{usage}\n    {summary}");
            }
        }
        Ok(text)
    }
}

fn instrument_target(alias: String, words: Vec<String>) -> Target {
    let mut words = words.into_iter().peekable();
    let selector = match words.peek().map(|w| CapabilityTag::from_keyword(w)) {
        Some(Some(tag)) if words.len() > 1 => {
            words.next();
            Some(tag)
        }
        _ => None,
    };
    let verb = words.next().unwrap_or_default();
    Target::Instrument {
        alias,
        selector,
        verb,
        args: words.collect(),
    }
}

fn required<'a>(args: &'a [String], index: usize, usage: &str) -> BenchResult<&'a str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| BenchError::Usage(usage.to_string()))
}

fn render_sequence(sequence: &RecordedSequence) -> String {
    let mut text = format!(
        "{} (recorded {})",
        sequence.name,
        sequence.created.format("%Y-%m-%d %H:%M")
    );
    if sequence.continue_on_error {
        text.push_str(" [continue-on-error]");
    }
    for (index, step) in sequence.steps.iter().enumerate() {
        let _ = write!(text, "\n  {:>3}  {}", index + 1, step.text);
    }
    for variable in sequence.variables() {
        match sequence.variable_defaults.get(&variable) {
            Some(default) => {
                let _ = write!(text, "\n  {{{variable}}} defaults to '{default}'");
            }
            None => {
                let _ = write!(text, "\n  {{{variable}}} required");
            }
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::SimulatedBench;

    async fn demo() -> (SimulatedBench, Interpreter) {
        let bench = SimulatedBench::demo();
        let mut repl = Interpreter::new(Arc::new(bench.clone()), BenchConfig::ephemeral());
        repl.execute("scan").await.unwrap();
        (bench, repl)
    }

    #[test]
    fn session_verbs_are_reserved_words() {
        for (verb, _, _) in SESSION_VERBS {
            assert!(crate::session::validate_alias(verb).is_err(), "{verb}");
        }
    }

    #[test]
    fn capability_keyword_becomes_selector() {
        let words = |s: &str| s.split_whitespace().map(String::from).collect::<Vec<_>>();
        assert_eq!(
            instrument_target("scope".into(), words("awg wave 1 sine")),
            Target::Instrument {
                alias: "scope".into(),
                selector: Some(CapabilityTag::FunctionGenerator),
                verb: "wave".into(),
                args: words("1 sine"),
            }
        );
        // A lone keyword is a verb, not a selector.
        assert!(matches!(
            instrument_target("x".into(), words("psu")),
            Target::Instrument { selector: None, .. }
        ));
    }

    #[tokio::test]
    async fn selected_alias_receives_unprefixed_lines() {
        let (_, mut repl) = demo().await;
        assert!(matches!(repl.execute("meas p6v").await, Err(BenchError::UnknownAlias(_))));
        repl.execute("use psu").await.unwrap();
        let reply = repl.execute("meas p6v").await.unwrap();
        assert_eq!(reply, Reply::Text("P6V: 5.0012 V  0.1020 A".to_string()));
        let last = repl.session().history().last().unwrap();
        assert_eq!(last.resolved_alias.as_deref(), Some("psu"));
        assert_eq!(last.verb, "meas");
    }

    #[tokio::test]
    async fn comments_and_blank_lines_are_ignored() {
        let (_, mut repl) = demo().await;
        let before = repl.session().history().len();
        assert_eq!(repl.execute("   ").await.unwrap(), Reply::Empty);
        assert_eq!(repl.execute("# note").await.unwrap(), Reply::Empty);
        assert_eq!(repl.session().history().len(), before);
    }

    #[tokio::test]
    async fn exit_is_not_recorded() {
        let (_, mut repl) = demo().await;
        repl.execute("record start s").await.unwrap();
        repl.execute("status").await.unwrap();
        assert_eq!(repl.execute("quit").await.unwrap(), Reply::Exit);
        assert_eq!(repl.session().recorder().captured(), 1);
    }

    #[tokio::test]
    async fn state_reset_per_alias() {
        let (bench, mut repl) = demo().await;
        bench.clear_traffic();
        repl.execute("state dmm reset").await.unwrap();
        let sent = bench.commands(crate::transport::TransportKind::Gpib, "GPIB0::22::INSTR");
        assert_eq!(sent, vec!["*RST", "*CLS"]);
        assert!(repl.execute("state dmm explode").await.is_err());
    }
}
