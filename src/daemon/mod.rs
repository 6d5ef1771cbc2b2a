// src/daemon/mod.rs

//! aptd daemon state and main loop
//!
//! [`DaemonState`] is built once at startup and shared by every bus object.
//! It validates requests, creates transactions in limbo, walks them through
//! simulation and authorization into the queue, and forgets them again once
//! they finished.
//!
//! ```text
//! client                                    aptd
//!   │ InstallPackages(["hello"]) ──────────►│ validate, create in limbo
//!   │◄──────── /org/debian/apt/transaction/… │
//!   │ Set Locale, HttpProxy, ... ──────────►│ only while setting-up
//!   │ Run() ───────────────────────────────►│ simulate, authorize, queue
//!   │◄──────────────── PropertyChanged(...) ─┤ worker executes
//!   │◄─────────────── Finished(exit-success) ┤ kept for a grace period
//! ```
//!
//! The daemon exits after a period without activity, or on `Quit()` once
//! nothing is queued or running.

pub mod periodic;
pub mod systemd;

pub use periodic::{PeriodicConfig, PeriodicKey};
pub use systemd::{IdleTracker, SystemdManager, WatchdogTask};

use crate::auth::{Action, AuthGate, Authority, PolkitAuthority, StaticAuthority};
use crate::config::DaemonConfig;
use crate::dbus;
use crate::enums::{ConflictAnswer, ErrorKind, Role, Status};
use crate::error::{Error, Result};
use crate::queue::{ActiveTransactions, TransactionQueue};
use crate::transaction::{Caller, PackageSets, RepositorySpec, RoleArgs, Transaction};
use crate::worker::{self, Worker};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9\-+.]+$").expect("valid regex"));
static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9.+:~\-]+$").expect("valid regex"));
static RELEASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9\-.]+$").expect("valid regex"));

/// debconf priorities accepted by `Reconfigure`
const PRIORITIES: [&str; 5] = ["default", "low", "medium", "high", "critical"];

/// Check a package name without version or release
pub fn validate_package_name(name: &str) -> Result<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("Invalid package name '{}'", name)))
    }
}

/// Check a request item: `name`, `name=version` or `name/release`
pub fn validate_package_spec(spec: &str) -> Result<()> {
    let valid = if let Some((name, version)) = spec.split_once('=') {
        NAME_RE.is_match(name) && VERSION_RE.is_match(version)
    } else if let Some((name, release)) = spec.split_once('/') {
        NAME_RE.is_match(name) && RELEASE_RE.is_match(release)
    } else {
        NAME_RE.is_match(spec)
    };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "Invalid package specification '{}'",
            spec
        )))
    }
}

fn validate_packages(packages: &PackageSets) -> Result<()> {
    for (_, list) in packages.iter() {
        for spec in list {
            validate_package_spec(spec)?;
        }
    }
    Ok(())
}

fn absolute_path(path: &str) -> Result<()> {
    if Path::new(path).is_absolute() {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "The path '{}' must be absolute",
            path
        )))
    }
}

/// Daemon-wide events for the bus layer
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonEvent {
    /// A transaction is no longer addressable
    TransactionRemoved(String),
    /// A periodic setting was written
    PropertyChanged { key: PeriodicKey, value: i32 },
}

/// Shared state of the running daemon
pub struct DaemonState {
    config: Arc<DaemonConfig>,
    queue: Arc<TransactionQueue>,
    worker: Arc<Worker>,
    auth: Arc<AuthGate>,
    periodic: PeriodicConfig,
    /// Every addressable transaction, finished ones included until their
    /// grace period ends
    transactions: Mutex<HashMap<String, Arc<Transaction>>>,
    event_tx: broadcast::Sender<DaemonEvent>,
    idle: Option<Mutex<IdleTracker>>,
    quit: watch::Sender<bool>,
}

impl DaemonState {
    /// Create the state and start the task executing queued transactions
    pub fn start(worker: Worker, authority: Arc<dyn Authority>) -> Arc<Self> {
        let config = worker.config().clone();
        let (queue, dispatched) = TransactionQueue::new();
        let queue = Arc::new(queue);
        let worker = Arc::new(worker);
        let (event_tx, _) = broadcast::channel(256);
        let (quit, _) = watch::channel(false);
        let auth = Arc::new(AuthGate::new(authority));

        let state = Arc::new(Self {
            periodic: PeriodicConfig::new(&config.paths.periodic_conf),
            idle: config
                .timeouts
                .inactivity()
                .map(|timeout| Mutex::new(IdleTracker::new(timeout))),
            auth: auth.clone(),
            transactions: Mutex::new(HashMap::new()),
            config,
            queue: queue.clone(),
            worker: worker.clone(),
            event_tx,
            quit,
        });

        tokio::spawn(async move { worker.serve(&queue, &auth, dispatched).await });
        state
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn queue(&self) -> &TransactionQueue {
        &self.queue
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: DaemonEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Record activity for the inactivity timer
    pub fn touch(&self) {
        if let Some(ref idle) = self.idle {
            idle.lock().activity();
        }
    }

    /// Nothing to do and no calls within the inactivity window
    pub fn idle_expired(&self) -> bool {
        let Some(ref idle) = self.idle else {
            return false;
        };
        self.queue.is_idle() && self.queue.limbo().is_empty() && idle.lock().is_expired()
    }

    /// Ask the main loop to exit once the queue drained
    pub fn quit(&self) {
        info!("Quit requested");
        self.quit.send_replace(true);
    }

    pub fn quit_requested(&self) -> bool {
        *self.quit.borrow()
    }

    pub fn transaction(&self, tid: &str) -> Option<Arc<Transaction>> {
        self.transactions.lock().get(tid).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.lock().len()
    }

    /// `(current, queued)` as reported by `GetActiveTransactions`
    pub fn active_transactions(&self) -> ActiveTransactions {
        self.touch();
        self.queue.active()
    }

    fn forget(&self, tid: &str) {
        if self.transactions.lock().remove(tid).is_some() {
            debug!("Removed transaction {}", tid);
            self.emit(DaemonEvent::TransactionRemoved(tid.to_string()));
        }
    }

    /// Create a transaction in limbo
    ///
    /// Fails without creating anything if a package item is malformed.
    pub fn create(
        self: &Arc<Self>,
        caller: Caller,
        role: Role,
        packages: PackageSets,
        args: RoleArgs,
    ) -> Result<Arc<Transaction>> {
        self.touch();
        validate_packages(&packages)?;
        let trans = Arc::new(Transaction::new(role, caller, packages, args));
        info!(
            "Created {} ({}) for uid {}",
            trans.tid(),
            role,
            trans.uid()
        );
        self.transactions
            .lock()
            .insert(trans.tid().to_string(), trans.clone());
        self.queue.add_limbo(trans.clone());
        self.track(trans.clone());
        Ok(trans)
    }

    /// Evict `trans` if it stays in limbo too long, and forget it after the
    /// grace period once it finished
    fn track(self: &Arc<Self>, trans: Arc<Transaction>) {
        let state = Arc::downgrade(self);
        let limbo_idle = self.config.timeouts.limbo_idle();
        let grace = self.config.timeouts.finished_grace();
        tokio::spawn(async move {
            let left_limbo = tokio::time::timeout(
                limbo_idle,
                trans.wait_for(|s| s.status != Status::SettingUp || s.exit.is_finished()),
            )
            .await
            .is_ok();
            if !left_limbo {
                let Some(state) = state.upgrade() else {
                    return;
                };
                if state.queue.cancel_waiting(&trans) {
                    info!("{} was never run, dropped it", trans.tid());
                    state.forget(trans.tid());
                    return;
                }
            }
            trans.wait_until_finished().await;
            tokio::time::sleep(grace).await;
            if let Some(state) = state.upgrade() {
                state.forget(trans.tid());
            }
        });
    }

    pub fn install_packages(
        self: &Arc<Self>,
        caller: Caller,
        packages: Vec<String>,
    ) -> Result<Arc<Transaction>> {
        self.create(
            caller,
            Role::InstallPackages,
            PackageSets::install(packages),
            RoleArgs::None,
        )
    }

    pub fn remove_packages(
        self: &Arc<Self>,
        caller: Caller,
        packages: Vec<String>,
    ) -> Result<Arc<Transaction>> {
        self.create(
            caller,
            Role::RemovePackages,
            PackageSets::remove(packages),
            RoleArgs::None,
        )
    }

    pub fn upgrade_packages(
        self: &Arc<Self>,
        caller: Caller,
        packages: Vec<String>,
    ) -> Result<Arc<Transaction>> {
        self.create(
            caller,
            Role::UpgradePackages,
            PackageSets::upgrade(packages),
            RoleArgs::None,
        )
    }

    pub fn commit_packages(
        self: &Arc<Self>,
        caller: Caller,
        packages: PackageSets,
    ) -> Result<Arc<Transaction>> {
        self.create(caller, Role::CommitPackages, packages, RoleArgs::None)
    }

    pub fn update_cache(self: &Arc<Self>, caller: Caller) -> Result<Arc<Transaction>> {
        self.create(
            caller,
            Role::UpdateCache,
            PackageSets::default(),
            RoleArgs::UpdateCache { sources_list: None },
        )
    }

    /// Refresh only the sources in one file
    ///
    /// `sources_list` is either the main sources.list, a file below
    /// sources.list.d, or the bare name of a file there.
    pub fn update_cache_partially(
        self: &Arc<Self>,
        caller: Caller,
        sources_list: String,
    ) -> Result<Arc<Transaction>> {
        let path = Path::new(&sources_list);
        let valid = if path.is_absolute() {
            path == self.config.paths.sources_list
                || path.parent() == Some(self.config.paths.sources_parts.as_path())
        } else {
            !sources_list.is_empty() && !sources_list.contains('/') && !sources_list.starts_with('.')
        };
        if !valid {
            return Err(Error::InvalidArgument(format!(
                "Invalid sources list '{}'",
                sources_list
            )));
        }
        self.create(
            caller,
            Role::UpdateCache,
            PackageSets::default(),
            RoleArgs::UpdateCache {
                sources_list: Some(sources_list),
            },
        )
    }

    pub fn upgrade_system(self: &Arc<Self>, caller: Caller, safe_mode: bool) -> Result<Arc<Transaction>> {
        self.create(
            caller,
            Role::UpgradeSystem,
            PackageSets::default(),
            RoleArgs::UpgradeSystem { safe_mode },
        )
    }

    pub fn install_file(
        self: &Arc<Self>,
        caller: Caller,
        path: String,
        force: bool,
    ) -> Result<Arc<Transaction>> {
        absolute_path(&path)?;
        self.create(
            caller,
            Role::InstallFile,
            PackageSets::default(),
            RoleArgs::InstallFile { path, force },
        )
    }

    pub fn fix_broken_depends(self: &Arc<Self>, caller: Caller) -> Result<Arc<Transaction>> {
        self.create(caller, Role::FixBrokenDepends, PackageSets::default(), RoleArgs::None)
    }

    pub fn fix_incomplete_install(self: &Arc<Self>, caller: Caller) -> Result<Arc<Transaction>> {
        self.create(
            caller,
            Role::FixIncompleteInstall,
            PackageSets::default(),
            RoleArgs::None,
        )
    }

    pub fn add_vendor_key_from_file(
        self: &Arc<Self>,
        caller: Caller,
        path: String,
    ) -> Result<Arc<Transaction>> {
        absolute_path(&path)?;
        self.create(
            caller,
            Role::AddVendorKeyFile,
            PackageSets::default(),
            RoleArgs::AddVendorKeyFile { path },
        )
    }

    pub fn add_vendor_key_from_keyserver(
        self: &Arc<Self>,
        caller: Caller,
        key_id: String,
        keyserver: String,
    ) -> Result<Arc<Transaction>> {
        worker::check_key_id(&key_id, ErrorKind::KeyNotInstalled)?;
        worker::check_keyserver(&keyserver)?;
        self.create(
            caller,
            Role::AddVendorKeyFromKeyserver,
            PackageSets::default(),
            RoleArgs::AddVendorKeyFromKeyserver { key_id, keyserver },
        )
    }

    pub fn remove_vendor_key(
        self: &Arc<Self>,
        caller: Caller,
        fingerprint: String,
    ) -> Result<Arc<Transaction>> {
        worker::check_key_id(&fingerprint, ErrorKind::KeyNotRemoved)?;
        self.create(
            caller,
            Role::RemoveVendorKey,
            PackageSets::default(),
            RoleArgs::RemoveVendorKey { fingerprint },
        )
    }

    pub fn add_repository(
        self: &Arc<Self>,
        caller: Caller,
        spec: RepositorySpec,
    ) -> Result<Arc<Transaction>> {
        worker::entry_from_spec(&spec)?;
        self.create(
            caller,
            Role::AddRepository,
            PackageSets::default(),
            RoleArgs::AddRepository(spec),
        )
    }

    pub fn enable_distro_component(
        self: &Arc<Self>,
        caller: Caller,
        component: String,
    ) -> Result<Arc<Transaction>> {
        if component.is_empty() || component.contains(char::is_whitespace) {
            return Err(Error::InvalidArgument(format!(
                "Invalid component '{}'",
                component
            )));
        }
        self.create(
            caller,
            Role::EnableDistroComponent,
            PackageSets::default(),
            RoleArgs::EnableDistroComponent { component },
        )
    }

    pub fn reconfigure(
        self: &Arc<Self>,
        caller: Caller,
        packages: Vec<String>,
        priority: String,
    ) -> Result<Arc<Transaction>> {
        for name in &packages {
            validate_package_name(name)?;
        }
        if !PRIORITIES.contains(&priority.as_str()) {
            return Err(Error::InvalidArgument(format!(
                "Invalid debconf priority '{}'",
                priority
            )));
        }
        self.create(
            caller,
            Role::Reconfigure,
            PackageSets::default(),
            RoleArgs::Reconfigure { packages, priority },
        )
    }

    pub fn clean(self: &Arc<Self>, caller: Caller) -> Result<Arc<Transaction>> {
        self.create(caller, Role::Clean, PackageSets::default(), RoleArgs::None)
    }

    pub fn add_license_key(
        self: &Arc<Self>,
        caller: Caller,
        package: String,
        key: String,
        server: String,
    ) -> Result<Arc<Transaction>> {
        validate_package_name(&package)?;
        self.create(
            caller,
            Role::AddLicenseKey,
            PackageSets::default(),
            RoleArgs::AddLicenseKey {
                package,
                key,
                server,
            },
        )
    }

    /// Dry-run a transaction for its owner
    pub async fn simulate(&self, trans: &Arc<Transaction>, caller: &Caller) -> Result<()> {
        self.touch();
        trans.check_owner(caller.uid)?;
        if trans.status() != Status::SettingUp {
            return Err(Error::AlreadyRunning);
        }
        self.worker.simulate(trans).await?;
        Ok(())
    }

    /// Simulate, authorize and queue a transaction
    ///
    /// A failed simulation finishes the transaction and is reported through
    /// its exit state; a failed authorization is also returned to the caller.
    pub async fn run(&self, trans: &Arc<Transaction>, caller: &Caller) -> Result<()> {
        self.touch();
        trans.check_owner(caller.uid)?;
        self.claim(trans)?;
        if self.authorize(trans).await? {
            self.queue.put(trans.clone());
        }
        Ok(())
    }

    /// Like [`DaemonState::run`], but start only once `first_tid` succeeded
    ///
    /// The transaction is simulated now and authorized when its turn comes,
    /// so a failed predecessor means it is never authorized at all.
    pub async fn run_after(
        &self,
        trans: &Arc<Transaction>,
        caller: &Caller,
        first_tid: &str,
    ) -> Result<()> {
        self.touch();
        trans.check_owner(caller.uid)?;
        let first = self.transaction(first_tid).ok_or_else(|| {
            Error::InvalidArgument(format!("Unknown transaction {}", first_tid))
        })?;
        if trans.chain_contains(&first) || first.after().is_some() {
            return Err(Error::InvalidArgument(format!(
                "{} cannot run after {}",
                trans.tid(),
                first_tid
            )));
        }
        self.claim(trans)?;
        if !self.prepare(trans).await? {
            return Ok(());
        }
        if let Err(e) = self.queue.chain(&first, trans.clone()) {
            self.abandon(trans, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Move a limbo transaction to authenticating, once
    fn claim(&self, trans: &Transaction) -> Result<()> {
        if self.queue.limbo_get(trans.tid()).is_none() {
            return Err(Error::AlreadyRunning);
        }
        trans.begin_authentication()
    }

    /// Simulate a claimed transaction; returns false if it failed and is
    /// finished
    async fn prepare(&self, trans: &Arc<Transaction>) -> Result<bool> {
        match self.worker.simulate(trans).await {
            Ok(_) => Ok(!trans.is_finished()),
            Err(Error::AlreadySimulating) => {
                trans.set_status(Status::SettingUp);
                Err(Error::AlreadySimulating)
            }
            Err(e) => {
                info!("{}: simulation failed: {}", trans.tid(), e);
                self.abandon(trans, &e);
                Ok(false)
            }
        }
    }

    /// Simulate and authorize; returns false if the transaction finished on
    /// the way
    async fn authorize(&self, trans: &Arc<Transaction>) -> Result<bool> {
        if !self.prepare(trans).await? {
            return Ok(false);
        }
        if let Err(e) = self.auth.check_transaction(trans).await {
            self.abandon(trans, &e);
            return Err(e);
        }
        trans.mark_authorized();
        Ok(!trans.is_finished())
    }

    /// Fail a transaction that never reached the queue
    fn abandon(&self, trans: &Arc<Transaction>, error: &Error) {
        trans.fail(error.kind(), error.details());
        self.queue.abandon(trans);
    }

    /// Cancel a transaction
    ///
    /// Waiting ones finish right away together with their chain; a running
    /// one stops at its next safe point. Other users need `cancel-foreign`.
    pub async fn cancel(&self, trans: &Arc<Transaction>, caller: &Caller) -> Result<()> {
        self.touch();
        if trans.check_owner(caller.uid).is_err() {
            self.auth.check_action(caller, Action::CancelForeign).await?;
        }
        if trans.is_finished() {
            debug!("{} already finished, nothing to cancel", trans.tid());
            return Ok(());
        }
        info!("Cancelling {} on behalf of uid {}", trans.tid(), caller.uid);
        if !self.queue.cancel_waiting(trans) {
            trans.request_cancel();
        }
        Ok(())
    }

    pub fn provide_medium(&self, trans: &Transaction, caller: &Caller, label: &str) -> Result<()> {
        self.touch();
        trans.check_owner(caller.uid)?;
        trans.provide_medium(label)
    }

    pub fn resolve_config_file_conflict(
        &self,
        trans: &Transaction,
        caller: &Caller,
        config: &str,
        answer: ConflictAnswer,
    ) -> Result<()> {
        self.touch();
        trans.check_owner(caller.uid)?;
        trans.resolve_config_file_conflict(config, answer)
    }

    pub async fn get_trusted_vendor_keys(&self, caller: &Caller) -> Result<Vec<String>> {
        self.touch();
        self.auth
            .check_action(caller, Action::GetTrustedVendorKeys)
            .await?;
        self.worker.trusted_vendor_keys().await
    }

    pub fn periodic(&self, key: PeriodicKey) -> Result<i32> {
        self.periodic.get(key)
    }

    /// Write a periodic setting on behalf of `caller`
    pub async fn set_periodic(&self, caller: &Caller, key: PeriodicKey, value: i32) -> Result<()> {
        self.touch();
        self.auth.check_action(caller, Action::ChangeConfig).await?;
        if self.periodic.set(key, value)? {
            self.emit(DaemonEvent::PropertyChanged { key, value });
        }
        Ok(())
    }
}

/// How the daemon attaches to the bus
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    /// Use the session bus instead of the system bus
    pub session_bus: bool,
    /// Take over the bus name from a running instance
    pub replace: bool,
    /// Authorize everything; only for development
    pub dummy: bool,
}

/// Run the daemon until it is idle, told to quit, or signalled
pub async fn run_daemon(config: DaemonConfig, options: DaemonOptions) -> Result<()> {
    info!("Starting aptd version {}", env!("CARGO_PKG_VERSION"));

    let mut systemd = SystemdManager::new();
    if systemd.is_systemd() {
        info!("Running under systemd supervision");
    }

    let connection = dbus::connect(options.session_bus).await?;
    let authority: Arc<dyn Authority> = if options.dummy {
        warn!("Dummy mode: every request is authorized");
        Arc::new(StaticAuthority::allow_all())
    } else if options.session_bus {
        // PolicyKit only listens on the system bus
        Arc::new(PolkitAuthority::new(zbus::Connection::system().await?))
    } else {
        Arc::new(PolkitAuthority::new(connection.clone()))
    };

    let worker = Worker::from_config(Arc::new(config))?;
    let state = DaemonState::start(worker, authority);
    dbus::serve(&connection, state.clone()).await?;
    dbus::request_name(&connection, options.replace).await?;

    systemd.notify_ready(Some("Waiting for transactions"));
    info!("Daemon ready");

    let mut terminate = signal(SignalKind::terminate())?;
    let mut tick = tokio::time::interval(systemd.tick_interval());
    loop {
        tokio::select! {
            _ = tick.tick() => {
                systemd.watchdog_tick();
                if !state.queue().is_idle() {
                    state.touch();
                    continue;
                }
                if state.quit_requested() {
                    info!("Queue is idle, quitting");
                    break;
                }
                if state.idle_expired() {
                    info!("Shutting down after inactivity");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = terminate.recv() => {
                info!("Terminated, shutting down");
                break;
            }
        }
    }

    systemd.notify_stopping();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, Timeouts};
    use crate::enums::ExitState;
    use crate::transaction::TransactionEvent;
    use crate::worker::memory::{MemorySystem, Universe};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    struct Fixture {
        _dir: TempDir,
        system: Arc<MemorySystem>,
        state: Arc<DaemonState>,
    }

    fn fixture_with(
        authority: StaticAuthority,
        timeouts: Timeouts,
        gate: Option<Arc<Semaphore>>,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::default()
            .with_root(dir.path())
            .with_backend(BackendKind::Memory)
            .with_timeouts(timeouts);
        let mut system =
            MemorySystem::new(Universe::demo()).with_journal_dir(config.paths.dpkg_updates.clone());
        if let Some(gate) = gate {
            system = system.with_install_gate(gate);
        }
        let system = Arc::new(system);
        let worker = Worker::new(Arc::new(config), system.clone());
        let state = DaemonState::start(worker, Arc::new(authority));
        Fixture {
            _dir: dir,
            system,
            state,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(StaticAuthority::allow_all(), Timeouts::default(), None)
    }

    fn user() -> Caller {
        Caller::new(4242, 1000, 1000)
    }

    async fn finish(trans: &Transaction) -> ExitState {
        tokio::time::timeout(Duration::from_secs(10), trans.wait_until_finished())
            .await
            .expect("transaction did not finish")
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition never held");
    }

    #[test]
    fn test_package_spec_validation() {
        for spec in ["hello", "libc6", "g++", "hello=2.10-3", "hello=1:2.0~rc1", "hello/bookworm-backports"] {
            assert!(validate_package_spec(spec).is_ok(), "{}", spec);
        }
        for spec in ["", "h", "Hello", "-hello", "hello world", "hello=2.0 beta", "hello/Stable", "hello;rm"] {
            assert!(validate_package_spec(spec).is_err(), "{}", spec);
        }
    }

    #[tokio::test]
    async fn test_invalid_request_creates_nothing() {
        let f = fixture();
        let err = f
            .state
            .install_packages(user(), vec!["hello".into(), "Bad Name".into()])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(f.state.transaction_count(), 0);
        assert!(f.state.queue().limbo().is_empty());

        assert!(f.state.install_file(user(), "hello.deb".into(), false).is_err());
        assert!(f
            .state
            .reconfigure(user(), vec!["hello".into()], "urgent".into())
            .is_err());
        assert!(f.state.update_cache_partially(user(), "../evil".into()).is_err());
        assert_eq!(f.state.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_run_installs() {
        let f = fixture();
        let trans = f.state.install_packages(user(), vec!["hello".into()]).unwrap();
        assert_eq!(trans.status(), Status::SettingUp);
        assert!(f.state.queue().limbo_get(trans.tid()).is_some());

        f.state.run(&trans, &user()).await.unwrap();
        assert_eq!(finish(&trans).await, ExitState::Success);
        assert_eq!(f.system.installed_version("hello").as_deref(), Some("2.10-3"));
        assert!(f.state.queue().limbo().is_empty());
        // still addressable during the grace period
        assert!(f.state.transaction(trans.tid()).is_some());
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture_with(StaticAuthority::allow_all(), Timeouts::default(), Some(gate.clone()));
        let trans = f.state.install_packages(user(), vec!["hello".into()]).unwrap();
        f.state.run(&trans, &user()).await.unwrap();
        assert!(matches!(
            f.state.run(&trans, &user()).await,
            Err(Error::AlreadyRunning)
        ));
        gate.add_permits(1);
        assert_eq!(finish(&trans).await, ExitState::Success);
    }

    #[tokio::test]
    async fn test_foreign_caller_cannot_run() {
        let f = fixture();
        let trans = f.state.install_packages(user(), vec!["hello".into()]).unwrap();
        let other = Caller::new(1, 1001, 1001);
        assert!(matches!(
            f.state.run(&trans, &other).await,
            Err(Error::ForeignTransaction)
        ));
        assert!(matches!(
            f.state.simulate(&trans, &other).await,
            Err(Error::ForeignTransaction)
        ));
        assert_eq!(trans.status(), Status::SettingUp);
    }

    #[tokio::test]
    async fn test_unknown_package_fails_before_queueing() {
        let f = fixture();
        let trans = f
            .state
            .install_packages(user(), vec!["nonexistent-pkg".into()])
            .unwrap();
        let mut events = trans.subscribe();
        f.state.run(&trans, &user()).await.unwrap();

        assert_eq!(trans.exit(), ExitState::Failed);
        assert_eq!(trans.error().unwrap().kind, ErrorKind::NoPackage);
        while let Ok(event) = events.try_recv() {
            assert_ne!(event, TransactionEvent::Status(Status::Waiting));
        }
        assert!(f.state.queue().limbo().is_empty());
    }

    #[tokio::test]
    async fn test_denied_run_fails_transaction() {
        let f = fixture_with(StaticAuthority::deny_all(), Timeouts::default(), None);
        let trans = f.state.install_packages(user(), vec!["hello".into()]).unwrap();
        let err = f.state.run(&trans, &user()).await.unwrap_err();
        assert!(matches!(err, Error::NotAuthorized(_)));
        assert_eq!(trans.exit(), ExitState::Failed);
        assert_eq!(trans.error().unwrap().kind, ErrorKind::NotAuthorized);
        assert_eq!(f.system.installed_version("hello"), None);
    }

    #[tokio::test]
    async fn test_simulate_keeps_setting_up() {
        let f = fixture();
        let trans = f.state.install_packages(user(), vec!["hello".into()]).unwrap();
        f.state.simulate(&trans, &user()).await.unwrap();
        assert_eq!(trans.status(), Status::SettingUp);
        let sim = trans.simulation().unwrap();
        assert_eq!(sim.changes.install, vec!["hello=2.10-3"]);
        // properties can still be set
        trans.set_locale("de_DE.UTF-8").unwrap();
    }

    #[tokio::test]
    async fn test_limbo_eviction() {
        let timeouts = Timeouts {
            limbo_idle: 1,
            ..Default::default()
        };
        let f = fixture_with(StaticAuthority::allow_all(), timeouts, None);
        let mut events = f.state.subscribe();
        let trans = f.state.install_packages(user(), vec!["hello".into()]).unwrap();

        assert_eq!(finish(&trans).await, ExitState::Cancelled);
        let state = f.state.clone();
        let tid = trans.tid().to_string();
        eventually(|| state.transaction(&tid).is_none()).await;
        assert!(f.state.queue().limbo().is_empty());
        assert_eq!(
            events.recv().await.unwrap(),
            DaemonEvent::TransactionRemoved(trans.tid().to_string())
        );
    }

    #[tokio::test]
    async fn test_finished_transactions_are_forgotten() {
        let timeouts = Timeouts {
            finished_grace: 0,
            ..Default::default()
        };
        let f = fixture_with(StaticAuthority::allow_all(), timeouts, None);
        let trans = f.state.install_packages(user(), vec!["hello".into()]).unwrap();
        f.state.run(&trans, &user()).await.unwrap();
        finish(&trans).await;
        let state = f.state.clone();
        eventually(|| state.transaction_count() == 0).await;
    }

    #[tokio::test]
    async fn test_cancel_queued_transaction() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture_with(StaticAuthority::allow_all(), Timeouts::default(), Some(gate.clone()));
        let first = f.state.install_packages(user(), vec!["hello".into()]).unwrap();
        let second = f.state.install_packages(user(), vec!["cowsay".into()]).unwrap();
        f.state.run(&first, &user()).await.unwrap();
        f.state.run(&second, &user()).await.unwrap();

        let active = f.state.active_transactions();
        assert_eq!(active.current.as_deref(), Some(first.tid()));
        assert_eq!(active.queued, vec![second.tid().to_string()]);

        // someone else needs cancel-foreign
        let f2 = fixture_with(StaticAuthority::deny_all(), Timeouts::default(), None);
        let foreign = f2.state.install_packages(user(), vec!["hello".into()]).unwrap();
        assert!(f2
            .state
            .cancel(&foreign, &Caller::new(2, 1001, 1001))
            .await
            .is_err());

        f.state.cancel(&second, &user()).await.unwrap();
        assert_eq!(second.exit(), ExitState::Cancelled);
        assert!(f.state.active_transactions().queued.is_empty());

        gate.add_permits(1);
        assert_eq!(finish(&first).await, ExitState::Success);
        assert_eq!(f.system.installed_version("cowsay"), None);
    }

    #[tokio::test]
    async fn test_run_after_waits_for_first() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture_with(StaticAuthority::allow_all(), Timeouts::default(), Some(gate.clone()));
        let first = f.state.install_packages(user(), vec!["hello".into()]).unwrap();
        let second = f.state.install_packages(user(), vec!["perl".into()]).unwrap();

        f.state.run_after(&second, &user(), first.tid()).await.unwrap();
        assert_eq!(second.status(), Status::Waiting);
        f.state.run(&first, &user()).await.unwrap();

        gate.add_permits(2);
        assert_eq!(finish(&first).await, ExitState::Success);
        assert_eq!(finish(&second).await, ExitState::Success);

        let unknown = f.state.install_packages(user(), vec!["perl".into()]).unwrap();
        assert!(matches!(
            f.state.run_after(&unknown, &user(), "/org/debian/apt/transaction/nope").await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_periodic_settings_need_change_config() {
        let f = fixture_with(StaticAuthority::deny_all(), Timeouts::default(), None);
        let err = f
            .state
            .set_periodic(&user(), PeriodicKey::AutoUpdateInterval, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotAuthorized(_)));
        assert_eq!(f.state.periodic(PeriodicKey::AutoUpdateInterval).unwrap(), 0);

        let f = fixture_with(
            StaticAuthority::allowing(&[Action::ChangeConfig]),
            Timeouts::default(),
            None,
        );
        let mut events = f.state.subscribe();
        f.state
            .set_periodic(&user(), PeriodicKey::AutoUpdateInterval, 7)
            .await
            .unwrap();
        assert_eq!(f.state.periodic(PeriodicKey::AutoUpdateInterval).unwrap(), 7);
        assert_eq!(
            events.recv().await.unwrap(),
            DaemonEvent::PropertyChanged {
                key: PeriodicKey::AutoUpdateInterval,
                value: 7
            }
        );
    }

    #[tokio::test]
    async fn test_idle_and_quit() {
        let timeouts = Timeouts {
            inactivity: Some(0),
            ..Default::default()
        };
        let f = fixture_with(StaticAuthority::allow_all(), timeouts, None);
        assert!(f.state.idle_expired());
        let trans = f.state.install_packages(user(), vec!["hello".into()]).unwrap();
        // a transaction in limbo keeps the daemon up
        assert!(!f.state.idle_expired());
        f.state.run(&trans, &user()).await.unwrap();
        finish(&trans).await;

        assert!(!f.state.quit_requested());
        f.state.quit();
        assert!(f.state.quit_requested());

        let f = fixture();
        assert!(!f.state.idle_expired());
    }
}
