// src/transaction/mod.rs

//! The transaction: one client-requested unit of package management work
//!
//! A transaction is created in *setting-up*, may be configured and simulated
//! by its owner, is then authorized and queued, runs in the worker, and ends
//! with a single write of its exit state.
//!
//! ```text
//! setting-up -> authenticating -> waiting -> running -> ... -> finished
//!      |              |              |          |
//!      +--------------+--------------+----------+--> cancelling -> finished
//! ```
//!
//! All mutation goes through setters which emit a [`TransactionEvent`] on a
//! broadcast channel and bump a generation counter. Async code waits for a
//! condition on the state with [`Transaction::wait_for`] instead of polling.

mod events;
mod types;

pub use events::TransactionEvent;
pub use types::{
    package_name, parse_package_spec, Caller, ConfigFileConflict, Dependencies,
    DownloadProgress, PackageSets, PackageTarget, ProgressDetails, RepositorySpec,
    RequiredMedium, RoleArgs, TransactionError,
};

use crate::enums::{ConflictAnswer, ErrorKind, ExitState, Role, Status};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

/// Object path prefix of every transaction
pub const TID_PREFIX: &str = "/org/debian/apt/transaction/";

static LOCALE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(C|POSIX|[a-z]{2,3}(_[A-Z]{2})?(\.[A-Za-z0-9-]+)?(@[A-Za-z0-9]+)?)$")
        .expect("valid regex")
});

static METADATA_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]+_[A-Za-z0-9_-]+$").expect("valid regex"));

/// Outcome of a dry run, cached on the transaction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationResult {
    /// Changes the resolver added on top of the request
    pub depends: Dependencies,
    /// The full change set, request included
    pub changes: Dependencies,
    pub download: u64,
    pub space: i64,
    pub unauthenticated: Vec<String>,
    pub high_trust_packages: Vec<String>,
    /// Fingerprint of the package system the result was computed against
    pub stamp: u64,
}

/// What a cancel request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRequest {
    /// The transaction had already finished
    AlreadyFinished,
    /// Cancellable: status is now cancelling and the worker stops at once
    Immediate,
    /// Not cancellable right now: honoured at the next safe point
    Deferred,
}

/// Mutable state of a transaction
#[derive(Debug, Clone, Default)]
pub struct TransactionState {
    pub role: Role,
    pub status: Status,
    pub status_details: String,
    pub progress: u32,
    pub progress_details: ProgressDetails,
    pub progress_download: DownloadProgress,
    pub progress_package: (String, String),
    pub cancellable: bool,
    pub cancelled: bool,
    pub paused: bool,
    pub terminal_attached: bool,
    pub required_medium: Option<RequiredMedium>,
    pub config_file_conflict: Option<ConfigFileConflict>,
    pub config_file_answer: Option<ConflictAnswer>,
    pub exit: ExitState,
    pub error: Option<TransactionError>,
    pub packages: PackageSets,
    pub args: RoleArgs,
    pub depends: Dependencies,
    pub download: u64,
    pub space: i64,
    pub unauthenticated: Vec<String>,
    pub high_trust_packages: Vec<String>,
    pub simulation: Option<SimulationResult>,
    pub simulating: bool,
    /// Passed the authorization gate
    pub authorized: bool,
    pub allow_unauthenticated: bool,
    pub remove_obsoleted_depends: bool,
    pub locale: String,
    pub http_proxy: String,
    pub terminal: String,
    pub debconf_socket: String,
    pub metadata: BTreeMap<String, String>,
    /// Transaction to queue once this one succeeds
    pub after: Option<Arc<Transaction>>,
    /// Terminal output of the package manager, escape sequences removed
    pub output: String,
}

pub struct Transaction {
    tid: String,
    caller: Caller,
    created: DateTime<Utc>,
    state: Mutex<TransactionState>,
    events: broadcast::Sender<TransactionEvent>,
    generation: watch::Sender<u64>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Transaction")
            .field("tid", &self.tid)
            .field("role", &state.role)
            .field("status", &state.status)
            .field("exit", &state.exit)
            .finish()
    }
}

impl Transaction {
    pub fn new(role: Role, caller: Caller, packages: PackageSets, args: RoleArgs) -> Self {
        let tid = format!("{}{}", TID_PREFIX, uuid::Uuid::new_v4().simple());
        let (events, _) = broadcast::channel(1024);
        let (generation, _) = watch::channel(0);
        let state = TransactionState {
            role,
            cancellable: true,
            packages,
            args,
            ..Default::default()
        };
        debug!("Created transaction {} ({}) for uid {}", tid, role, caller.uid);
        Self {
            tid,
            caller,
            created: Utc::now(),
            state: Mutex::new(state),
            events,
            generation,
        }
    }

    pub fn tid(&self) -> &str {
        &self.tid
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    pub fn uid(&self) -> u32 {
        self.caller.uid
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Receive every change made from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEvent> {
        self.events.subscribe()
    }

    /// A copy of the current state
    pub fn snapshot(&self) -> TransactionState {
        self.state.lock().clone()
    }

    /// Read the state without copying it
    pub fn with_state<R>(&self, f: impl FnOnce(&TransactionState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn exit(&self) -> ExitState {
        self.state.lock().exit
    }

    pub fn error(&self) -> Option<TransactionError> {
        self.state.lock().error.clone()
    }

    pub fn progress(&self) -> u32 {
        self.state.lock().progress
    }

    pub fn cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    pub fn cancellable(&self) -> bool {
        self.state.lock().cancellable
    }

    pub fn paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().exit.is_finished()
    }

    pub fn packages(&self) -> PackageSets {
        self.state.lock().packages.clone()
    }

    pub fn args(&self) -> RoleArgs {
        self.state.lock().args.clone()
    }

    pub fn after(&self) -> Option<Arc<Transaction>> {
        self.state.lock().after.clone()
    }

    pub fn simulation(&self) -> Option<SimulationResult> {
        self.state.lock().simulation.clone()
    }

    pub fn output(&self) -> String {
        self.state.lock().output.clone()
    }

    /// Mutate the state, then publish the collected events and wake waiters
    fn update<R>(&self, f: impl FnOnce(&mut TransactionState, &mut Vec<TransactionEvent>) -> R) -> R {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock();
            f(&mut state, &mut events)
        };
        for event in events {
            trace!("{}: {:?}", self.tid, event);
            // No subscribers is fine
            let _ = self.events.send(event);
        }
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
        result
    }

    /// Wait until `cond` holds for the state
    pub async fn wait_for(&self, mut cond: impl FnMut(&TransactionState) -> bool) {
        let mut rx = self.generation.subscribe();
        loop {
            let done = {
                let state = self.state.lock();
                cond(&state)
            };
            if done || rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn wait_until_finished(&self) -> ExitState {
        self.wait_for(|s| s.exit.is_finished()).await;
        self.exit()
    }

    /// Refuse callers other than the creator
    pub fn check_owner(&self, uid: u32) -> Result<()> {
        if uid != self.caller.uid {
            return Err(Error::ForeignTransaction);
        }
        Ok(())
    }

    fn check_setting_up(state: &TransactionState) -> Result<()> {
        if state.status != Status::SettingUp {
            return Err(Error::AlreadyRunning);
        }
        Ok(())
    }

    /// Set the role once; any later attempt fails and changes nothing
    pub fn set_role(&self, role: Role) -> Result<()> {
        self.update(|s, ev| {
            if s.role != Role::Unset {
                return Err(Error::RoleAlreadySet);
            }
            s.role = role;
            ev.push(TransactionEvent::Role(role));
            Ok(())
        })
    }

    /// Leave setting-up for authenticating; only the first call succeeds
    pub fn begin_authentication(&self) -> Result<()> {
        self.update(|s, ev| {
            Self::check_setting_up(s)?;
            s.status = Status::Authenticating;
            ev.push(TransactionEvent::Status(Status::Authenticating));
            Ok(())
        })
    }

    pub fn mark_authorized(&self) {
        self.update(|s, _| s.authorized = true)
    }

    pub fn authorized(&self) -> bool {
        self.with_state(|s| s.authorized)
    }

    pub fn set_status(&self, status: Status) {
        self.update(|s, ev| {
            if s.status != status && !s.exit.is_finished() {
                s.status = status;
                ev.push(TransactionEvent::Status(status));
            }
        })
    }

    pub fn set_status_details(&self, details: impl Into<String>) {
        let details = details.into();
        self.update(|s, ev| {
            if s.status_details != details {
                s.status_details = details.clone();
                ev.push(TransactionEvent::StatusDetails(details));
            }
        })
    }

    pub fn set_progress(&self, progress: u32) {
        let progress = progress.min(100);
        self.update(|s, ev| {
            if s.progress != progress {
                s.progress = progress;
                ev.push(TransactionEvent::Progress(progress));
            }
        })
    }

    pub fn set_progress_details(&self, details: ProgressDetails) {
        self.update(|s, ev| {
            if s.progress_details != details {
                s.progress_details = details.clone();
                ev.push(TransactionEvent::ProgressDetails(details));
            }
        })
    }

    pub fn set_progress_download(&self, download: DownloadProgress) {
        self.update(|s, ev| {
            s.progress_download = download.clone();
            ev.push(TransactionEvent::ProgressDownload(download));
        })
    }

    pub fn set_progress_package(&self, package: impl Into<String>, message: impl Into<String>) {
        let entry = (package.into(), message.into());
        self.update(|s, ev| {
            if s.progress_package != entry {
                s.progress_package = entry.clone();
                ev.push(TransactionEvent::ProgressPackage {
                    package: entry.0,
                    message: entry.1,
                });
            }
        })
    }

    pub fn set_cancellable(&self, cancellable: bool) {
        self.update(|s, ev| {
            if s.cancellable != cancellable {
                s.cancellable = cancellable;
                ev.push(TransactionEvent::Cancellable(cancellable));
            }
        })
    }

    pub fn set_paused(&self, paused: bool) {
        self.update(|s, ev| {
            if s.paused != paused {
                s.paused = paused;
                ev.push(TransactionEvent::Paused(paused));
            }
        })
    }

    pub fn set_terminal_attached(&self, attached: bool) {
        self.update(|s, ev| {
            if s.terminal_attached != attached {
                s.terminal_attached = attached;
                ev.push(TransactionEvent::TerminalAttached(attached));
            }
        })
    }

    /// Add a client metadata entry; keys are `<client>_<key>` and write-once
    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        if !METADATA_KEY_RE.is_match(key) {
            return Err(Error::InvalidMetaData(format!(
                "The key '{}' must be prefixed with the client name and an underscore",
                key
            )));
        }
        self.update(|s, ev| {
            if s.metadata.contains_key(key) {
                return Err(Error::InvalidMetaData(format!(
                    "The key '{}' has already been set",
                    key
                )));
            }
            s.metadata.insert(key.to_string(), value.to_string());
            ev.push(TransactionEvent::MetaData(s.metadata.clone()));
            Ok(())
        })
    }

    pub fn metadata(&self) -> BTreeMap<String, String> {
        self.state.lock().metadata.clone()
    }

    pub fn set_locale(&self, locale: &str) -> Result<()> {
        if !LOCALE_RE.is_match(locale) {
            return Err(Error::InvalidProperty(format!("Invalid locale '{}'", locale)));
        }
        self.update(|s, ev| {
            Self::check_setting_up(s)?;
            s.locale = locale.to_string();
            ev.push(TransactionEvent::Locale(s.locale.clone()));
            Ok(())
        })
    }

    pub fn set_http_proxy(&self, proxy: &str) -> Result<()> {
        if !proxy.is_empty() {
            let url = url::Url::parse(proxy)
                .map_err(|e| Error::InvalidProxy(format!("{}: {}", proxy, e)))?;
            if url.scheme() != "http" || url.host_str().is_none() {
                return Err(Error::InvalidProxy(proxy.to_string()));
            }
        }
        self.update(|s, ev| {
            Self::check_setting_up(s)?;
            s.http_proxy = proxy.to_string();
            ev.push(TransactionEvent::HttpProxy(s.http_proxy.clone()));
            Ok(())
        })
    }

    /// Attach a terminal; it must be a character device owned by the caller
    pub fn set_terminal(&self, terminal: &str) -> Result<()> {
        let meta = std::fs::metadata(terminal)
            .map_err(|e| Error::InvalidProperty(format!("{}: {}", terminal, e)))?;
        if !meta.file_type().is_char_device() {
            return Err(Error::InvalidProperty(format!(
                "{} is not a terminal",
                terminal
            )));
        }
        if meta.uid() != self.caller.uid {
            return Err(Error::InvalidProperty(format!(
                "{} is not owned by the caller",
                terminal
            )));
        }
        self.update(|s, ev| {
            Self::check_setting_up(s)?;
            s.terminal = terminal.to_string();
            ev.push(TransactionEvent::Terminal(s.terminal.clone()));
            Ok(())
        })
    }

    /// Forward debconf questions to a socket owned by the caller
    pub fn set_debconf_socket(&self, socket: &str) -> Result<()> {
        let meta = std::fs::metadata(socket)
            .map_err(|e| Error::InvalidProperty(format!("{}: {}", socket, e)))?;
        if !meta.file_type().is_socket() {
            return Err(Error::InvalidProperty(format!("{} is not a socket", socket)));
        }
        if meta.uid() != self.caller.uid {
            return Err(Error::InvalidProperty(format!(
                "{} is not owned by the caller",
                socket
            )));
        }
        self.update(|s, ev| {
            Self::check_setting_up(s)?;
            s.debconf_socket = socket.to_string();
            ev.push(TransactionEvent::DebconfSocket(s.debconf_socket.clone()));
            Ok(())
        })
    }

    pub fn set_allow_unauthenticated(&self, allow: bool) -> Result<()> {
        self.update(|s, ev| {
            Self::check_setting_up(s)?;
            if s.allow_unauthenticated != allow {
                s.allow_unauthenticated = allow;
                ev.push(TransactionEvent::AllowUnauthenticated(allow));
            }
            Ok(())
        })
    }

    /// Changing this invalidates a cached simulation
    pub fn set_remove_obsoleted_depends(&self, remove: bool) -> Result<()> {
        self.update(|s, ev| {
            Self::check_setting_up(s)?;
            if s.remove_obsoleted_depends != remove {
                s.remove_obsoleted_depends = remove;
                s.simulation = None;
                ev.push(TransactionEvent::RemoveObsoletedDepends(remove));
            }
            Ok(())
        })
    }

    /// Claim the simulation slot
    ///
    /// Returns the cached result if there is one, `None` if the caller now
    /// owns the slot and must call [`Transaction::finish_simulation`].
    pub fn begin_simulation(&self) -> Result<Option<SimulationResult>> {
        let mut state = self.state.lock();
        if state.simulating {
            return Err(Error::AlreadySimulating);
        }
        if let Some(ref cached) = state.simulation {
            return Ok(Some(cached.clone()));
        }
        state.simulating = true;
        Ok(None)
    }

    /// Release the simulation slot, storing the result on success
    pub fn finish_simulation(&self, result: Option<&SimulationResult>) {
        self.update(|s, ev| {
            s.simulating = false;
            let Some(result) = result else {
                return;
            };
            s.simulation = Some(result.clone());
            if s.depends != result.depends {
                s.depends = result.depends.clone();
                ev.push(TransactionEvent::Dependencies(s.depends.clone()));
            }
            if s.download != result.download {
                s.download = result.download;
                ev.push(TransactionEvent::Download(s.download));
            }
            if s.space != result.space {
                s.space = result.space;
                ev.push(TransactionEvent::Space(s.space));
            }
            if s.unauthenticated != result.unauthenticated {
                s.unauthenticated = result.unauthenticated.clone();
                ev.push(TransactionEvent::Unauthenticated(s.unauthenticated.clone()));
            }
            if s.high_trust_packages != result.high_trust_packages {
                s.high_trust_packages = result.high_trust_packages.clone();
                ev.push(TransactionEvent::HighTrustPackages(
                    s.high_trust_packages.clone(),
                ));
            }
        })
    }

    /// Queue `next` after this transaction succeeds
    pub fn set_after(&self, next: Arc<Transaction>) -> Result<()> {
        self.update(|s, _| {
            if s.after.is_some() {
                return Err(Error::InvalidArgument(format!(
                    "{} already has a follow-up transaction",
                    self.tid
                )));
            }
            s.after = Some(next);
            Ok(())
        })
    }

    /// Whether `other` is reachable by following `after` links from here
    pub fn chain_contains(&self, other: &Transaction) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let mut next = self.after();
        while let Some(trans) = next {
            if std::ptr::eq(trans.as_ref(), other) {
                return true;
            }
            next = trans.after();
        }
        false
    }

    /// The package manager asked for a medium; blocks the run until provided
    pub fn request_medium(&self, label: &str, drive: &str) {
        self.update(|s, ev| {
            let medium = RequiredMedium {
                label: label.to_string(),
                drive: drive.to_string(),
            };
            s.required_medium = Some(medium.clone());
            ev.push(TransactionEvent::RequiredMedium(Some(medium)));
            s.status = Status::WaitingMedium;
            ev.push(TransactionEvent::Status(s.status));
            s.paused = true;
            ev.push(TransactionEvent::Paused(true));
        })
    }

    /// The client inserted the medium with `label`
    pub fn provide_medium(&self, label: &str) -> Result<()> {
        self.update(|s, ev| {
            match s.required_medium {
                Some(ref medium) if medium.label == label => {}
                Some(ref medium) => {
                    return Err(Error::InvalidArgument(format!(
                        "Medium '{}' is not the required '{}'",
                        label, medium.label
                    )));
                }
                None => {
                    return Err(Error::InvalidArgument("No medium is required".into()));
                }
            }
            s.required_medium = None;
            ev.push(TransactionEvent::RequiredMedium(None));
            s.paused = false;
            ev.push(TransactionEvent::Paused(false));
            Ok(())
        })
    }

    /// dpkg wants to know what to do with a modified configuration file
    pub fn request_config_file_answer(&self, old: &str, new: &str) {
        self.update(|s, ev| {
            let conflict = ConfigFileConflict {
                old: old.to_string(),
                new: new.to_string(),
            };
            s.config_file_conflict = Some(conflict.clone());
            s.config_file_answer = None;
            ev.push(TransactionEvent::ConfigFileConflict(Some(conflict)));
            s.status = Status::WaitingConfigFilePrompt;
            ev.push(TransactionEvent::Status(s.status));
            s.paused = true;
            ev.push(TransactionEvent::Paused(true));
        })
    }

    /// The client decided about the pending configuration file
    pub fn resolve_config_file_conflict(&self, config: &str, answer: ConflictAnswer) -> Result<()> {
        self.update(|s, ev| {
            match s.config_file_conflict {
                Some(ref conflict) if conflict.old == config => {}
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "No pending conflict for {}",
                        config
                    )));
                }
            }
            s.config_file_answer = Some(answer);
            s.paused = false;
            ev.push(TransactionEvent::Paused(false));
            Ok(())
        })
    }

    /// Take the answer and return to `status`
    pub fn finish_config_file_prompt(&self, status: Status) -> Option<ConflictAnswer> {
        self.update(|s, ev| {
            let answer = s.config_file_answer.take();
            s.config_file_conflict = None;
            ev.push(TransactionEvent::ConfigFileConflict(None));
            if s.paused {
                s.paused = false;
                ev.push(TransactionEvent::Paused(false));
            }
            if !s.exit.is_finished() && s.status != status {
                s.status = status;
                ev.push(TransactionEvent::Status(status));
            }
            answer
        })
    }

    /// Leave a pause without an answer (used when cancelling)
    pub fn clear_required_medium(&self, status: Status) {
        self.update(|s, ev| {
            if s.required_medium.take().is_some() {
                ev.push(TransactionEvent::RequiredMedium(None));
            }
            if s.paused {
                s.paused = false;
                ev.push(TransactionEvent::Paused(false));
            }
            if !s.exit.is_finished() && s.status != status {
                s.status = status;
                ev.push(TransactionEvent::Status(status));
            }
        })
    }

    /// Record a cancel request from the owner
    pub fn request_cancel(&self) -> CancelRequest {
        self.update(|s, ev| {
            if s.exit.is_finished() {
                return CancelRequest::AlreadyFinished;
            }
            if !s.cancelled {
                s.cancelled = true;
            }
            if !s.cancellable {
                return CancelRequest::Deferred;
            }
            if s.status != Status::Cancelling {
                s.status = Status::Cancelling;
                ev.push(TransactionEvent::Status(Status::Cancelling));
            }
            if s.paused {
                s.paused = false;
                ev.push(TransactionEvent::Paused(false));
            }
            CancelRequest::Immediate
        })
    }

    /// Turn a pending cancel request into `Err(Cancelled)` at a safe point
    pub fn check_cancelled(&self) -> Result<()> {
        if !self.cancelled() {
            return Ok(());
        }
        self.set_status(Status::Cancelling);
        Err(Error::Cancelled)
    }

    /// Record the error shown to clients
    pub fn set_error(&self, kind: ErrorKind, details: impl Into<String>) {
        let error = TransactionError {
            kind,
            details: details.into(),
        };
        self.update(|s, ev| {
            if s.exit.is_finished() {
                return;
            }
            s.error = Some(error.clone());
            ev.push(TransactionEvent::Error(Some(error)));
        })
    }

    /// Set the exit state; only the first terminal value sticks
    ///
    /// Returns false if the transaction had already finished.
    pub fn set_exit(&self, exit: ExitState) -> bool {
        if !exit.is_finished() {
            return false;
        }
        let changed = self.update(|s, ev| {
            if s.exit.is_finished() {
                return false;
            }
            s.exit = exit;
            ev.push(TransactionEvent::Exit(exit));
            if s.status != Status::Finished {
                s.status = Status::Finished;
                ev.push(TransactionEvent::Status(Status::Finished));
            }
            if exit == ExitState::Success && s.progress != 100 {
                s.progress = 100;
                ev.push(TransactionEvent::Progress(100));
            }
            if s.cancellable {
                s.cancellable = false;
                ev.push(TransactionEvent::Cancellable(false));
            }
            if s.paused {
                s.paused = false;
                ev.push(TransactionEvent::Paused(false));
            }
            ev.push(TransactionEvent::Finished(exit));
            true
        });
        if changed {
            debug!("Transaction {} finished: {}", self.tid, exit);
        }
        changed
    }

    /// Fail with a classified error
    pub fn fail(&self, kind: ErrorKind, details: impl Into<String>) -> bool {
        self.set_error(kind, details);
        self.set_exit(ExitState::Failed)
    }

    pub fn append_output(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.state.lock().output.push_str(text);
    }

    /// Terminal path, if one is attached
    pub fn terminal(&self) -> Option<String> {
        let state = self.state.lock();
        (!state.terminal.is_empty()).then(|| state.terminal.clone())
    }

    /// Environment for child processes
    pub fn child_env(&self) -> Vec<(String, String)> {
        let state = self.state.lock();
        let mut env = vec![("APT_LISTCHANGES_FRONTEND".to_string(), "none".to_string())];
        if !state.locale.is_empty() {
            env.push(("LANG".into(), state.locale.clone()));
            env.push(("LANGUAGE".into(), state.locale.clone()));
        }
        if !state.http_proxy.is_empty() {
            env.push(("http_proxy".into(), state.http_proxy.clone()));
        }
        if !state.debconf_socket.is_empty() {
            env.push(("DEBIAN_FRONTEND".into(), "passthrough".into()));
            env.push(("DEBCONF_PIPE".into(), state.debconf_socket.clone()));
        } else if state.terminal.is_empty() {
            env.push(("DEBIAN_FRONTEND".into(), "noninteractive".into()));
        }
        env
    }
}

/// Whether `path` is readable by `uid`/`gid` according to its mode bits
pub fn readable_by(path: &Path, uid: u32, gid: u32) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if uid == 0 {
        return true;
    }
    let mode = meta.mode();
    if meta.uid() == uid {
        mode & 0o400 != 0
    } else if meta.gid() == gid {
        mode & 0o040 != 0
    } else {
        mode & 0o004 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trans(role: Role) -> Transaction {
        Transaction::new(
            role,
            Caller::new(4242, 1000, 1000),
            PackageSets::install(vec!["foo".into()]),
            RoleArgs::None,
        )
    }

    #[test]
    fn test_new_transaction_defaults() {
        let t = trans(Role::InstallPackages);
        assert!(t.tid().starts_with(TID_PREFIX));
        assert_eq!(t.tid().len(), TID_PREFIX.len() + 32);
        assert_eq!(t.status(), Status::SettingUp);
        assert_eq!(t.exit(), ExitState::Unfinished);
        assert!(t.cancellable());
        assert!(!t.paused());
    }

    #[test]
    fn test_role_is_write_once() {
        let t = trans(Role::Unset);
        t.set_role(Role::RemovePackages).unwrap();
        assert!(matches!(
            t.set_role(Role::InstallPackages),
            Err(Error::RoleAlreadySet)
        ));
        assert_eq!(t.role(), Role::RemovePackages);

        let t = trans(Role::InstallPackages);
        assert!(t.set_role(Role::Clean).is_err());
        assert_eq!(t.role(), Role::InstallPackages);
    }

    #[test]
    fn test_metadata_write_once_and_key_format() {
        let t = trans(Role::InstallPackages);
        t.set_metadata("softwarecenter_appname", "Firefox").unwrap();
        assert!(matches!(
            t.set_metadata("softwarecenter_appname", "Other"),
            Err(Error::InvalidMetaData(_))
        ));
        assert!(t.set_metadata("noprefix", "x").is_err());
        assert_eq!(t.metadata()["softwarecenter_appname"], "Firefox");
    }

    #[test]
    fn test_exit_is_write_once() {
        let t = trans(Role::InstallPackages);
        let mut rx = t.subscribe();
        assert!(t.set_exit(ExitState::Failed));
        assert!(!t.set_exit(ExitState::Success));
        assert_eq!(t.exit(), ExitState::Failed);
        assert_eq!(t.status(), Status::Finished);

        let mut finished = 0;
        while let Ok(event) = rx.try_recv() {
            if let TransactionEvent::Finished(exit) = event {
                assert_eq!(exit, ExitState::Failed);
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
    }

    #[test]
    fn test_unfinished_is_not_an_exit() {
        let t = trans(Role::InstallPackages);
        assert!(!t.set_exit(ExitState::Unfinished));
        assert_eq!(t.status(), Status::SettingUp);
    }

    #[test]
    fn test_owner_check() {
        let t = trans(Role::InstallPackages);
        assert!(t.check_owner(1000).is_ok());
        assert!(matches!(t.check_owner(1001), Err(Error::ForeignTransaction)));
    }

    #[test]
    fn test_writable_properties_only_while_setting_up() {
        let t = trans(Role::InstallPackages);
        t.set_locale("de_DE.UTF-8").unwrap();
        t.set_http_proxy("http://proxy.example.com:3128").unwrap();
        t.set_allow_unauthenticated(true).unwrap();
        assert!(matches!(
            t.set_http_proxy("ftp://proxy"),
            Err(Error::InvalidProxy(_))
        ));
        assert!(matches!(
            t.set_http_proxy("https://proxy.example.com:3128"),
            Err(Error::InvalidProxy(_))
        ));
        assert!(t.set_locale("not a locale").is_err());

        t.set_status(Status::Waiting);
        assert!(matches!(t.set_locale("C"), Err(Error::AlreadyRunning)));
        assert!(matches!(
            t.set_remove_obsoleted_depends(true),
            Err(Error::AlreadyRunning)
        ));

        let env = t.child_env();
        assert!(env.contains(&("LANG".into(), "de_DE.UTF-8".into())));
        assert!(env.contains(&("http_proxy".into(), "http://proxy.example.com:3128".into())));
        assert!(env.contains(&("DEBIAN_FRONTEND".into(), "noninteractive".into())));
        assert!(env.contains(&("APT_LISTCHANGES_FRONTEND".into(), "none".into())));
    }

    #[test]
    fn test_terminal_must_be_char_device() {
        let t = trans(Role::InstallPackages);
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(t.set_terminal(file.path().to_str().unwrap()).is_err());
        assert!(t.set_terminal("/nonexistent/tty").is_err());
        assert!(t.terminal().is_none());
    }

    #[test]
    fn test_simulation_slot() {
        let t = trans(Role::InstallPackages);
        assert!(t.begin_simulation().unwrap().is_none());
        assert!(matches!(t.begin_simulation(), Err(Error::AlreadySimulating)));

        let result = SimulationResult {
            download: 1024,
            space: 4096,
            ..Default::default()
        };
        t.finish_simulation(Some(&result));
        assert_eq!(t.begin_simulation().unwrap(), Some(result));
        t.with_state(|s| {
            assert_eq!(s.download, 1024);
            assert_eq!(s.space, 4096);
        });

        t.set_remove_obsoleted_depends(true).unwrap();
        assert!(t.begin_simulation().unwrap().is_none());
    }

    #[test]
    fn test_failed_simulation_releases_slot() {
        let t = trans(Role::InstallPackages);
        assert!(t.begin_simulation().unwrap().is_none());
        t.finish_simulation(None);
        assert!(t.begin_simulation().unwrap().is_none());
    }

    #[test]
    fn test_cancel_when_cancellable() {
        let t = trans(Role::InstallPackages);
        t.set_status(Status::Downloading);
        assert_eq!(t.request_cancel(), CancelRequest::Immediate);
        assert_eq!(t.status(), Status::Cancelling);
        assert!(t.cancelled());
        assert!(matches!(t.check_cancelled(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_cancel_deferred_when_not_cancellable() {
        let t = trans(Role::InstallPackages);
        t.set_status(Status::Committing);
        t.set_cancellable(false);
        assert_eq!(t.request_cancel(), CancelRequest::Deferred);
        assert_eq!(t.status(), Status::Committing);
        assert!(t.check_cancelled().is_err());
        assert_eq!(t.status(), Status::Cancelling);

        t.set_exit(ExitState::Cancelled);
        assert_eq!(t.request_cancel(), CancelRequest::AlreadyFinished);
    }

    #[test]
    fn test_medium_round_trip() {
        let t = trans(Role::InstallPackages);
        t.request_medium("Debian 12 DVD 1", "/media/cdrom");
        assert!(t.paused());
        assert_eq!(t.status(), Status::WaitingMedium);
        assert!(t.provide_medium("Other disc").is_err());
        assert!(t.paused());
        t.provide_medium("Debian 12 DVD 1").unwrap();
        assert!(!t.paused());
        t.with_state(|s| assert!(s.required_medium.is_none()));
    }

    #[test]
    fn test_config_file_prompt_round_trip() {
        let t = trans(Role::InstallPackages);
        t.set_status(Status::Committing);
        t.request_config_file_answer("/etc/foo.conf", "/etc/foo.conf.dpkg-new");
        assert_eq!(t.status(), Status::WaitingConfigFilePrompt);
        assert!(t.paused());
        assert!(t
            .resolve_config_file_conflict("/etc/bar.conf", ConflictAnswer::Keep)
            .is_err());
        t.resolve_config_file_conflict("/etc/foo.conf", ConflictAnswer::Keep)
            .unwrap();
        assert!(!t.paused());
        assert_eq!(
            t.finish_config_file_prompt(Status::Committing),
            Some(ConflictAnswer::Keep)
        );
        assert_eq!(t.status(), Status::Committing);
        t.with_state(|s| assert!(s.config_file_conflict.is_none()));
    }

    #[test]
    fn test_chain_contains() {
        let a = Arc::new(trans(Role::UpdateCache));
        let b = Arc::new(trans(Role::InstallPackages));
        a.set_after(b.clone()).unwrap();
        assert!(a.chain_contains(&b));
        assert!(!b.chain_contains(&a));
        assert!(a.set_after(b.clone()).is_err());
    }

    #[tokio::test]
    async fn test_wait_for_wakes_on_change() {
        let t = Arc::new(trans(Role::InstallPackages));
        t.request_medium("disc", "/dev/sr0");
        let waiter = {
            let t = t.clone();
            tokio::spawn(async move {
                t.wait_for(|s| !s.paused).await;
            })
        };
        tokio::task::yield_now().await;
        t.provide_medium("disc").unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_readable_by_mode_bits() {
        use std::os::unix::fs::PermissionsExt;
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600)).unwrap();
        let owner = std::fs::metadata(file.path()).unwrap().uid();
        assert!(readable_by(file.path(), owner, 12345));
        assert!(readable_by(file.path(), 0, 0));
        if owner != 54321 {
            assert!(!readable_by(file.path(), 54321, 54321));
        }
    }
}
