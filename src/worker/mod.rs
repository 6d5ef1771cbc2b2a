// src/worker/mod.rs

//! Execution backends
//!
//! The [`Worker`] turns a transaction into work on a [`PackageSystem`]:
//! it simulates package changes for clients, and executes dispatched
//! transactions one at a time under the package system locks. Which
//! package system is used, apt-get or the in-memory model, is decided once
//! from the configuration.
//!
//! Execution of one transaction:
//!
//! 1. wait for the four package system locks
//! 2. finish an interrupted dpkg run if the journal is dirty
//! 3. snapshot the status file so concurrent simulations see a stable system
//! 4. run the role, reusing the simulation if the system did not change
//! 5. classify the outcome into the transaction's exit state

pub mod apt;
pub mod cache;
mod debfile;
mod keys;
pub mod memory;
pub mod progress;
mod sources;

pub use cache::{
    CachePlugin, ExecContext, Mark, Origin, PackageCache, PackageInfo, PackageSystem, Resolution,
    ResolveOptions,
};
pub use debfile::DebControl;
pub use keys::{check_key_id, check_keyserver};
pub use sources::entry_from_spec;

use crate::auth::AuthGate;
use crate::config::{BackendKind, DaemonConfig};
use crate::crash;
use crate::enums::{ErrorKind, ExitState, Role, Status};
use crate::error::{Error, Result};
use crate::lock::LockSet;
use crate::queue::TransactionQueue;
use crate::runner::RunnerOptions;
use crate::transaction::{
    package_name, parse_package_spec, readable_by, PackageSets, PackageTarget, RoleArgs,
    SimulationResult, Transaction,
};
use crate::version::{compare_versions, parse_depends};
use apt::AptSystem;
use keys::Keyring;
use memory::{MemorySystem, Universe};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Whether dpkg left an interrupted run behind
///
/// dpkg journals pending status updates as numbered files next to the
/// status file; `dpkg --configure -a` folds them back in.
pub fn journal_dirty(updates: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(updates) else {
        return false;
    };
    entries.flatten().any(|entry| {
        entry
            .file_name()
            .to_str()
            .is_some_and(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()))
    })
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1000;
    const MB: u64 = KB * 1000;
    const GB: u64 = MB * 1000;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} kB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Delete the downloaded files in `dir`, returning the bytes freed
fn remove_archives(dir: &Path) -> Result<u64> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut freed = 0;
    for entry in entries {
        let entry = entry?;
        if entry.file_name() == "lock" {
            continue;
        }
        let meta = entry.metadata()?;
        if meta.is_file() {
            std::fs::remove_file(entry.path())?;
            freed += meta.len();
        }
    }
    Ok(freed)
}

fn no_package(name: &str) -> Error {
    Error::failed(
        ErrorKind::NoPackage,
        format!("Package {} isn't available", name),
    )
}

async fn lookup(cache: &mut dyn PackageCache, name: &str) -> Result<PackageInfo> {
    cache.package_info(name).await?.ok_or_else(|| no_package(name))
}

/// The exact version a pin or release request refers to
fn pinned_version(info: &PackageInfo, target: &PackageTarget) -> Result<Option<String>> {
    match target {
        PackageTarget::Candidate => Ok(None),
        PackageTarget::Version(version) if info.has_version(version) => Ok(Some(version.clone())),
        PackageTarget::Version(version) => Err(Error::failed(
            ErrorKind::NoPackage,
            format!("The version {} of {} isn't available", version, info.name),
        )),
        PackageTarget::Release(release) => info
            .version_from_release(release)
            .map(|v| Some(v.to_string()))
            .ok_or_else(|| {
                Error::failed(
                    ErrorKind::NoPackage,
                    format!("The release {} of {} isn't available", release, info.name),
                )
            }),
    }
}

fn not_installed(name: &str) -> Error {
    Error::failed(
        ErrorKind::PackageNotInstalled,
        format!("Package {} isn't installed", name),
    )
}

async fn mark_install(cache: &mut dyn PackageCache, spec: &str) -> Result<()> {
    let (name, target) = parse_package_spec(spec);
    let info = lookup(cache, name).await?;
    let version = pinned_version(&info, &target)?;
    match (&info.installed, &version) {
        (Some(_), None) => {
            return Err(Error::failed(
                ErrorKind::PackageAlreadyInstalled,
                format!("Package {} is already installed", name),
            ));
        }
        (Some(installed), Some(wanted)) if installed == wanted => {
            return Err(Error::failed(
                ErrorKind::PackageAlreadyInstalled,
                format!("The version {} of {} is already installed", wanted, name),
            ));
        }
        _ => {}
    }
    if version.is_none() && info.candidate.is_none() {
        return Err(no_package(name));
    }
    cache.mark(Mark::Install {
        name: name.to_string(),
        version,
    });
    Ok(())
}

async fn mark_reinstall(cache: &mut dyn PackageCache, spec: &str) -> Result<()> {
    let (name, target) = parse_package_spec(spec);
    let info = lookup(cache, name).await?;
    let Some(ref installed) = info.installed else {
        return Err(not_installed(name));
    };
    if let Some(wanted) = pinned_version(&info, &target)?
        && &wanted != installed
    {
        return Err(Error::failed(
            ErrorKind::PackageNotInstalled,
            format!("The version {} of {} isn't installed", wanted, name),
        ));
    }
    cache.mark(Mark::Reinstall {
        name: name.to_string(),
    });
    Ok(())
}

async fn mark_remove(cache: &mut dyn PackageCache, spec: &str, purge: bool) -> Result<()> {
    let name = package_name(spec);
    let info = lookup(cache, name).await?;
    if info.installed.is_none() {
        return Err(not_installed(name));
    }
    if info.essential {
        return Err(Error::failed(
            ErrorKind::NotRemoveEssentialPackage,
            format!("Package {} cannot be removed", name),
        ));
    }
    cache.mark(Mark::Remove {
        name: name.to_string(),
        purge,
    });
    Ok(())
}

async fn mark_upgrade(cache: &mut dyn PackageCache, spec: &str) -> Result<()> {
    let (name, target) = parse_package_spec(spec);
    let info = lookup(cache, name).await?;
    let Some(ref installed) = info.installed else {
        return Err(not_installed(name));
    };
    match pinned_version(&info, &target)? {
        None => {
            let newer = info
                .candidate
                .as_deref()
                .is_some_and(|c| compare_versions(c, installed) == Ordering::Greater);
            if !newer {
                return Err(Error::failed(
                    ErrorKind::PackageUpToDate,
                    format!("Package {} is already up to date", name),
                ));
            }
            cache.mark(Mark::Upgrade {
                name: name.to_string(),
                version: None,
            });
        }
        Some(wanted) => {
            if compare_versions(&wanted, installed) != Ordering::Greater {
                return Err(Error::failed(
                    ErrorKind::PackageAlreadyInstalled,
                    format!(
                        "The version {} of {} is not newer than the installed {}",
                        wanted, name, installed
                    ),
                ));
            }
            cache.mark(Mark::Upgrade {
                name: name.to_string(),
                version: Some(wanted),
            });
        }
    }
    Ok(())
}

async fn mark_downgrade(cache: &mut dyn PackageCache, spec: &str) -> Result<()> {
    let (name, target) = parse_package_spec(spec);
    let info = lookup(cache, name).await?;
    let Some(ref installed) = info.installed else {
        return Err(not_installed(name));
    };
    let Some(wanted) = pinned_version(&info, &target)? else {
        return Err(Error::failed(
            ErrorKind::NoPackage,
            format!("A version to downgrade {} to is required", name),
        ));
    };
    if compare_versions(&wanted, installed) != Ordering::Less {
        return Err(Error::failed(
            ErrorKind::PackageAlreadyInstalled,
            format!(
                "The version {} of {} is not older than the installed {}",
                wanted, name, installed
            ),
        ));
    }
    cache.mark(Mark::Downgrade {
        name: name.to_string(),
        version: wanted,
    });
    Ok(())
}

/// Mark the requested changes of a package role
async fn mark_request(
    cache: &mut dyn PackageCache,
    role: Role,
    packages: &PackageSets,
    args: &RoleArgs,
) -> Result<()> {
    match role {
        Role::UpgradeSystem => {
            let safe_mode = matches!(args, RoleArgs::UpgradeSystem { safe_mode: true });
            cache.mark(Mark::UpgradeAll { safe_mode });
            return Ok(());
        }
        Role::FixBrokenDepends => {
            cache.mark(Mark::FixBroken);
            return Ok(());
        }
        _ => {}
    }
    for spec in &packages.install {
        mark_install(cache, spec).await?;
    }
    for spec in &packages.reinstall {
        mark_reinstall(cache, spec).await?;
    }
    for spec in &packages.remove {
        mark_remove(cache, spec, false).await?;
    }
    for spec in &packages.purge {
        mark_remove(cache, spec, true).await?;
    }
    for spec in &packages.upgrade {
        mark_upgrade(cache, spec).await?;
    }
    for spec in &packages.downgrade {
        mark_downgrade(cache, spec).await?;
    }
    Ok(())
}

fn args_error(role: Role) -> Error {
    Error::InvalidArgument(format!("Missing arguments for {}", role))
}

/// Simulates and executes transactions
pub struct Worker {
    config: Arc<DaemonConfig>,
    system: Arc<dyn PackageSystem>,
    plugins: Vec<Arc<dyn CachePlugin>>,
    locks: tokio::sync::Mutex<LockSet>,
    /// Status snapshot taken while a transaction executes
    frozen: Mutex<Option<Arc<NamedTempFile>>>,
}

impl Worker {
    pub fn new(config: Arc<DaemonConfig>, system: Arc<dyn PackageSystem>) -> Self {
        let locks = tokio::sync::Mutex::new(LockSet::new(&config.paths));
        Self {
            config,
            system,
            plugins: Vec::new(),
            locks,
            frozen: Mutex::new(None),
        }
    }

    /// Build the package system the configuration asks for
    pub fn from_config(config: Arc<DaemonConfig>) -> Result<Self> {
        let system: Arc<dyn PackageSystem> = match config.backend {
            BackendKind::Apt => Arc::new(AptSystem::new(config.tools.clone(), config.paths.clone())),
            BackendKind::Memory => {
                let universe = match config.memory_universe {
                    Some(ref path) => Universe::load(path)?,
                    None => Universe::demo(),
                };
                Arc::new(MemorySystem::new(universe).with_journal_dir(config.paths.dpkg_updates.clone()))
            }
        };
        info!("Using the {:?} package system", config.backend);
        Ok(Self::new(config, system))
    }

    /// Register a resolver hook; ignored when plugins are disabled
    pub fn with_plugin(mut self, plugin: Arc<dyn CachePlugin>) -> Self {
        if self.config.disable_plugins {
            debug!("Plugins disabled, not loading {}", plugin.name());
        } else {
            self.plugins.push(plugin);
        }
        self
    }

    pub fn config(&self) -> &Arc<DaemonConfig> {
        &self.config
    }

    pub fn system(&self) -> &Arc<dyn PackageSystem> {
        &self.system
    }

    /// Dry-run `trans`, caching the result on it
    ///
    /// A second call returns the cached result without resolving again; a
    /// call while another one is in flight fails with `AlreadySimulating`.
    pub async fn simulate(&self, trans: &Transaction) -> Result<SimulationResult> {
        if let Some(cached) = trans.begin_simulation()? {
            debug!("{}: using cached simulation", trans.tid());
            return Ok(cached);
        }
        let frozen = self.frozen.lock().clone();
        let status = frozen.as_deref().map(NamedTempFile::path);
        let result = self.plan(trans, status).await;
        trans.finish_simulation(result.as_ref().ok());
        match result {
            Ok(ref sim) => debug!(
                "{}: simulated {} bytes to download, {} bytes of space",
                trans.tid(),
                sim.download,
                sim.space
            ),
            Err(ref e) => info!("{}: simulation failed: {}", trans.tid(), e),
        }
        result
    }

    /// Compute the change set of `trans` against the system, or against
    /// the installed state in `status`
    async fn plan(&self, trans: &Transaction, status: Option<&Path>) -> Result<SimulationResult> {
        let stamp = self.system.state_stamp().await?;
        let role = trans.role();
        if !role.changes_packages() {
            return Ok(SimulationResult {
                stamp,
                ..Default::default()
            });
        }

        let mut cache = self.system.open(status).await?;
        let packages = trans.packages();
        match trans.args() {
            RoleArgs::InstallFile { path, force } => {
                self.mark_file(cache.as_mut(), trans, Path::new(&path), force)
                    .await?;
            }
            args => mark_request(cache.as_mut(), role, &packages, &args).await?,
        }
        let resolution = self.resolve(cache.as_mut(), trans).await?;

        let high_trust_packages = resolution
            .changes
            .install
            .iter()
            .map(|spec| package_name(spec))
            .filter(|name| {
                resolution.origins.get(*name).is_some_and(|o| {
                    o.trusted
                        && self
                            .config
                            .high_trust_repos
                            .iter()
                            .any(|repo| repo.covers(&o.origin, &o.component, name))
                })
            })
            .map(str::to_string)
            .collect();

        Ok(SimulationResult {
            depends: resolution.changes.without_requested(&packages.names()),
            changes: resolution.changes,
            download: resolution.download,
            space: resolution.space,
            unauthenticated: resolution.unauthenticated,
            high_trust_packages,
            stamp,
        })
    }

    /// Resolve the marks, giving the plugins a chance to adjust them
    async fn resolve(&self, cache: &mut dyn PackageCache, trans: &Transaction) -> Result<Resolution> {
        let options = ResolveOptions {
            remove_obsoleted: trans.with_state(|s| s.remove_obsoleted_depends),
        };
        for plugin in &self.plugins {
            if plugin.modify_before(&mut *cache, trans) {
                debug!("{}: plugin {} changed the request", trans.tid(), plugin.name());
            }
        }
        let mut resolution = cache.resolve(options).await?;

        let mut again = false;
        for plugin in &self.plugins {
            if plugin.modify_after(&mut *cache, trans, &resolution) {
                debug!("{}: plugin {} changed the resolution", trans.tid(), plugin.name());
                again = true;
            }
        }
        if again {
            resolution = cache.resolve(options).await?;
        }
        Ok(resolution)
    }

    /// Validate a local package file and mark what it depends on
    async fn mark_file(
        &self,
        cache: &mut dyn PackageCache,
        trans: &Transaction,
        path: &Path,
        force: bool,
    ) -> Result<()> {
        let caller = trans.caller();
        if !readable_by(path, caller.uid, caller.gid) {
            return Err(Error::failed(
                ErrorKind::UnreadablePackageFile,
                format!("The package file {} could not be read", path.display()),
            ));
        }
        let control = DebControl::read(path)?;

        if !force && let Some(ref lintian) = self.config.tools.lintian {
            let errors = debfile::lint(lintian, path, caller).await?;
            if !errors.is_empty() {
                return Err(Error::failed(
                    ErrorKind::InvalidPackageFile,
                    format!(
                        "{} violates the packaging rules:\n{}",
                        path.display(),
                        errors.join("\n")
                    ),
                ));
            }
        }

        if !force
            && let Some(info) = cache.package_info(&control.package).await?
            && let Some(ref installed) = info.installed
            && compare_versions(installed, &control.version) == Ordering::Greater
        {
            return Err(Error::failed(
                ErrorKind::PackageAlreadyInstalled,
                format!(
                    "The newer version {} of {} is already installed",
                    installed, control.package
                ),
            ));
        }

        let groups = parse_depends(&control.all_depends()).map_err(|e| {
            Error::failed(ErrorKind::InvalidPackageFile, e.to_string())
        })?;
        for group in groups {
            let mut satisfied = false;
            let mut chosen: Option<(String, String)> = None;
            for relation in &group {
                let Some(info) = cache.package_info(&relation.name).await? else {
                    continue;
                };
                if info
                    .installed
                    .as_deref()
                    .is_some_and(|v| relation.constraint.satisfies(v))
                {
                    satisfied = true;
                    break;
                }
                if chosen.is_none() {
                    chosen = info
                        .versions
                        .iter()
                        .map(|(v, _)| v)
                        .filter(|v| relation.constraint.satisfies(v))
                        .max_by(|a, b| compare_versions(a, b))
                        .map(|v| (relation.name.clone(), v.clone()));
                }
            }
            if satisfied {
                continue;
            }
            let Some((name, version)) = chosen else {
                let group: Vec<String> = group.iter().map(ToString::to_string).collect();
                return Err(Error::failed(
                    ErrorKind::DepResolutionFailed,
                    format!("Dependency is not satisfiable: {}", group.join(" | ")),
                ));
            };
            cache.mark(Mark::Install {
                name,
                version: Some(version),
            });
        }
        debug!("{}: {} {} can be installed", trans.tid(), control.package, control.version);
        Ok(())
    }

    /// Execute dispatched transactions until the queue goes away
    ///
    /// Chained transactions reach the worker unauthorized; they pass `auth`
    /// here, once their predecessor has succeeded.
    pub async fn serve(
        &self,
        queue: &TransactionQueue,
        auth: &AuthGate,
        mut dispatched: mpsc::UnboundedReceiver<Arc<Transaction>>,
    ) {
        while let Some(trans) = dispatched.recv().await {
            if !trans.authorized() {
                trans.set_status(Status::Authenticating);
                match auth.check_transaction(&trans).await {
                    Ok(()) => trans.mark_authorized(),
                    Err(e) => {
                        info!("{}: not authorized: {}", trans.tid(), e);
                        trans.fail(e.kind(), e.details());
                        queue.done(&trans);
                        continue;
                    }
                }
            }
            self.run(&trans).await;
            queue.done(&trans);
        }
        debug!("Dispatch channel closed, worker exits");
    }

    /// Execute `trans` and record how it ended
    pub async fn run(&self, trans: &Transaction) -> ExitState {
        info!("{}: running {}", trans.tid(), trans.role());
        match self.execute(trans).await {
            Ok(()) => {
                trans.set_exit(ExitState::Success);
            }
            Err(Error::Cancelled) => {
                info!("{}: cancelled", trans.tid());
                trans.set_exit(ExitState::Cancelled);
            }
            Err(e) => {
                let kind = e.kind();
                let details = e.details();
                if kind == ErrorKind::Unknown {
                    error!("{}: unexpected failure: {}", trans.tid(), details);
                    crash::report(&self.config.paths.crash_dir, trans, &details);
                } else {
                    warn!("{}: {}: {}", trans.tid(), kind, details);
                }
                trans.fail(kind, details);
            }
        }
        trans.exit()
    }

    async fn execute(&self, trans: &Transaction) -> Result<()> {
        trans.check_cancelled()?;
        trans.set_status(Status::Running);
        let mut locks = self.locks.lock().await;
        locks
            .wait_for_lock(trans, self.config.timeouts.lock_poll())
            .await?;
        let result = self.execute_locked(trans, &mut locks).await;
        locks.release();
        self.frozen.lock().take();
        result
    }

    async fn execute_locked(&self, trans: &Transaction, locks: &mut LockSet) -> Result<()> {
        let mut ctx = ExecContext {
            trans,
            locks,
            runner: RunnerOptions {
                status_fd: self.config.status_fd,
                liveness: self.config.timeouts.child_liveness(),
            },
        };
        let role = trans.role();
        let paths = &self.config.paths;

        if role != Role::FixIncompleteInstall && journal_dirty(&paths.dpkg_updates) {
            warn!("{}: dpkg was interrupted, configuring pending packages first", trans.tid());
            match self.system.fix_incomplete(&mut ctx).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if role.needs_clean_journal() => {
                    return Err(Error::failed(
                        ErrorKind::IncompleteInstall,
                        format!("The previous installation hasn't been completed: {}", e.details()),
                    ));
                }
                Err(e) => warn!("{}: repairing dpkg failed: {}", trans.tid(), e),
            }
        }
        if role.changes_packages() {
            self.freeze().await?;
        }
        trans.check_cancelled()?;

        let args = trans.args();
        match role {
            Role::InstallFile => {
                let RoleArgs::InstallFile { ref path, force } = args else {
                    return Err(args_error(role));
                };
                let plan = self.execution_plan(trans).await?;
                if !plan.changes.is_empty() {
                    self.commit_plan(&mut ctx, &plan).await?;
                }
                trans.check_cancelled()?;
                self.system.install_file(&mut ctx, Path::new(path), force).await
            }
            r if r.changes_packages() => {
                let plan = self.execution_plan(trans).await?;
                self.commit_plan(&mut ctx, &plan).await
            }
            Role::FixIncompleteInstall => self.system.fix_incomplete(&mut ctx).await,
            Role::UpdateCache => {
                let RoleArgs::UpdateCache { sources_list } = args else {
                    return Err(args_error(role));
                };
                let sources_list = sources_list.map(|list| {
                    if Path::new(&list).is_absolute() {
                        PathBuf::from(list)
                    } else {
                        paths.sources_parts.join(list)
                    }
                });
                self.system
                    .update_cache(&mut ctx, sources_list.as_deref())
                    .await
            }
            Role::Clean => self.clean(trans),
            Role::AddRepository => {
                let RoleArgs::AddRepository(spec) = args else {
                    return Err(args_error(role));
                };
                let entry = sources::entry_from_spec(&spec)?;
                let file = sources::target_file(&paths.sources_list, &paths.sources_parts, &spec.sources_file)?;
                if !sources::add_source(&file, &entry)? {
                    info!("{}: {} is already configured", trans.tid(), entry);
                }
                Ok(())
            }
            Role::EnableDistroComponent => {
                let RoleArgs::EnableDistroComponent { component } = args else {
                    return Err(args_error(role));
                };
                self.enable_component(&component)
            }
            Role::AddVendorKeyFile => {
                let RoleArgs::AddVendorKeyFile { path } = args else {
                    return Err(args_error(role));
                };
                let caller = trans.caller();
                if !readable_by(Path::new(&path), caller.uid, caller.gid) {
                    return Err(Error::failed(
                        ErrorKind::KeyNotInstalled,
                        format!("The key file {} could not be read", path),
                    ));
                }
                self.keyring().import_file(&mut ctx, Path::new(&path)).await
            }
            Role::AddVendorKeyFromKeyserver => {
                let RoleArgs::AddVendorKeyFromKeyserver { key_id, keyserver } = args else {
                    return Err(args_error(role));
                };
                self.keyring().receive(&mut ctx, &key_id, &keyserver).await
            }
            Role::RemoveVendorKey => {
                let RoleArgs::RemoveVendorKey { fingerprint } = args else {
                    return Err(args_error(role));
                };
                self.keyring().remove(&mut ctx, &fingerprint).await
            }
            Role::Reconfigure => {
                let RoleArgs::Reconfigure { packages, priority } = args else {
                    return Err(args_error(role));
                };
                self.system.reconfigure(&mut ctx, &packages, &priority).await
            }
            Role::AddLicenseKey => {
                let RoleArgs::AddLicenseKey { package, key, server } = args else {
                    return Err(args_error(role));
                };
                self.add_license_key(&package, &key, &server).await
            }
            Role::Query => Ok(()),
            _ => Err(Error::InvalidArgument(format!(
                "{} cannot be executed",
                role
            ))),
        }
    }

    async fn freeze(&self) -> Result<()> {
        let file = tempfile::Builder::new().prefix("aptd-status.").tempfile()?;
        self.system.freeze(file.path()).await?;
        *self.frozen.lock() = Some(Arc::new(file));
        Ok(())
    }

    /// The change set to commit: the simulation if the system is unchanged
    /// since, otherwise a fresh one published on the transaction
    async fn execution_plan(&self, trans: &Transaction) -> Result<SimulationResult> {
        let stamp = self.system.state_stamp().await?;
        if let Some(sim) = trans.simulation()
            && sim.stamp == stamp
        {
            debug!("{}: reusing the simulated changes", trans.tid());
            return Ok(sim);
        }
        trans.set_status(Status::ResolvingDep);
        let plan = self.plan(trans, None).await?;
        trans.finish_simulation(Some(&plan));
        Ok(plan)
    }

    async fn commit_plan(&self, ctx: &mut ExecContext<'_>, plan: &SimulationResult) -> Result<()> {
        let allow_unauthenticated = ctx.trans.with_state(|s| s.allow_unauthenticated);
        if !plan.unauthenticated.is_empty() && !allow_unauthenticated {
            return Err(Error::failed(
                ErrorKind::PackageUnauthenticated,
                format!(
                    "The following packages cannot be authenticated: {}",
                    plan.unauthenticated.join(" ")
                ),
            ));
        }
        ctx.trans.check_cancelled()?;
        self.system
            .commit(ctx, &plan.changes, allow_unauthenticated)
            .await
    }

    fn clean(&self, trans: &Transaction) -> Result<()> {
        trans.set_status(Status::CleaningUp);
        let archives = &self.config.paths.archives_dir;
        let freed = remove_archives(archives)? + remove_archives(&archives.join("partial"))?;
        info!("{}: removed {} of package files", trans.tid(), format_bytes(freed));
        trans.set_status_details(format!("Freed {} of disk space", format_bytes(freed)));
        Ok(())
    }

    fn enable_component(&self, component: &str) -> Result<()> {
        let paths = &self.config.paths;
        let codename = sources::distro_codename(&paths.os_release).map_err(|e| {
            Error::failed(
                ErrorKind::RepositoryInvalid,
                format!("The distribution is unknown: {}", e.details()),
            )
        })?;
        let mut files = vec![paths.sources_list.clone()];
        if let Ok(entries) = std::fs::read_dir(&paths.sources_parts) {
            let mut parts: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "list"))
                .collect();
            parts.sort();
            files.extend(parts);
        }

        let mut found = false;
        let mut last_error = None;
        for file in &files {
            match sources::enable_component(file, &codename, component) {
                Ok(_) => found = true,
                Err(e) if e.kind() == ErrorKind::RepositoryInvalid => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        match (found, last_error) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(Error::failed(
                ErrorKind::RepositoryInvalid,
                format!("No software source of {} is configured", codename),
            )),
        }
    }

    /// Fingerprints of the vendor keys APT trusts
    pub async fn trusted_vendor_keys(&self) -> Result<Vec<String>> {
        self.keyring().fingerprints().await
    }

    fn keyring(&self) -> Keyring<'_> {
        Keyring::new(&self.config.tools.gpg, &self.config.paths.trusted_keyring)
    }

    async fn add_license_key(&self, package: &str, key: &str, server: &str) -> Result<()> {
        if !self.config.allowed_license_servers.iter().any(|s| s == server) {
            return Err(Error::failed(
                ErrorKind::LicenseKeyInstallFailed,
                format!("The license key server {} is not trusted", server),
            ));
        }
        if package.is_empty() || package.starts_with('.') || package.contains('/') {
            return Err(Error::failed(
                ErrorKind::LicenseKeyInstallFailed,
                format!("Invalid package name '{}'", package),
            ));
        }
        let mut cache = self.system.open(None).await?;
        if cache.package_info(package).await?.is_none() {
            return Err(no_package(package));
        }

        let dir = &self.config.paths.license_key_dir;
        let path = dir.join(package);
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(dir)?;
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)?;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
            file.write_all(key.as_bytes())
        };
        write().map_err(|e| {
            Error::failed(
                ErrorKind::LicenseKeyInstallFailed,
                format!("Failed to write {}: {}", path.display(), e),
            )
        })?;
        info!("Installed the license key of {}", package);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HighTrustRepo;
    use crate::transaction::{Caller, RepositorySpec};
    use memory::{AvailableVersion, InstalledPackage};
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use tempfile::TempDir;

    fn universe() -> Universe {
        Universe::new()
            .with_available(
                "foo",
                AvailableVersion::new("1.0")
                    .depends("bar (>= 1.0)")
                    .origin("Vendor", "main")
                    .sizes(100, 1000),
            )
            .with_available("bar", AvailableVersion::new("1.0").origin("Vendor", "main"))
            .with_available("bar", AvailableVersion::new("1.2").origin("Vendor", "main"))
            .with_available("bar", AvailableVersion::new("2.0").origin("Vendor", "main"))
            .with_available("shady", AvailableVersion::new("0.1").untrusted())
            .with_available("old", AvailableVersion::new("1.0"))
            .with_available("old", AvailableVersion::new("2.0"))
            .with_installed("old", InstalledPackage::new("1.0"))
            .with_available("base", AvailableVersion::new("1.0"))
            .with_installed("base", InstalledPackage::new("1.0"))
            .with_essential("base")
    }

    struct Fixture {
        dir: TempDir,
        system: Arc<MemorySystem>,
        worker: Worker,
    }

    fn fixture_with(configure: impl FnOnce(DaemonConfig) -> DaemonConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = configure(
            DaemonConfig::default()
                .with_root(dir.path())
                .with_backend(BackendKind::Memory),
        );
        let system = Arc::new(
            MemorySystem::new(universe()).with_journal_dir(config.paths.dpkg_updates.clone()),
        );
        let worker = Worker::new(Arc::new(config), system.clone());
        Fixture {
            dir,
            system,
            worker,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|c| c)
    }

    fn trans(role: Role, packages: PackageSets, args: RoleArgs) -> Transaction {
        Transaction::new(role, Caller::new(1, 0, 0), packages, args)
    }

    fn install(names: &[&str]) -> Transaction {
        trans(
            Role::InstallPackages,
            PackageSets::install(names.iter().map(|s| s.to_string()).collect()),
            RoleArgs::None,
        )
    }

    #[tokio::test]
    async fn test_simulate_keeps_version_pin() {
        let f = fixture();
        let t = install(&["foo", "bar=1.2"]);
        let sim = f.worker.simulate(&t).await.unwrap();
        assert_eq!(sim.changes.install, vec!["bar=1.2", "foo=1.0"]);
        assert!(sim.depends.is_empty());
        assert_eq!(sim.download, 100);
    }

    #[tokio::test]
    async fn test_simulate_reports_dependencies() {
        let f = fixture();
        let t = install(&["foo"]);
        let sim = f.worker.simulate(&t).await.unwrap();
        assert_eq!(sim.depends.install, vec!["bar=2.0"]);
        assert_eq!(t.snapshot().depends, sim.depends);
    }

    #[tokio::test]
    async fn test_simulate_twice_resolves_once() {
        let f = fixture();
        let t = install(&["foo"]);
        let first = f.worker.simulate(&t).await.unwrap();
        let second = f.worker.simulate(&t).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.system.resolve_calls(), 1);
    }

    #[tokio::test]
    async fn test_request_validation() {
        let f = fixture();
        let cases = [
            (install(&["nonexistent-pkg"]), ErrorKind::NoPackage),
            (install(&["bar=9.9"]), ErrorKind::NoPackage),
            (install(&["old"]), ErrorKind::PackageAlreadyInstalled),
            (
                trans(Role::RemovePackages, PackageSets::remove(vec!["base".into()]), RoleArgs::None),
                ErrorKind::NotRemoveEssentialPackage,
            ),
            (
                trans(Role::RemovePackages, PackageSets::remove(vec!["foo".into()]), RoleArgs::None),
                ErrorKind::PackageNotInstalled,
            ),
            (
                trans(Role::UpgradePackages, PackageSets::upgrade(vec!["base".into()]), RoleArgs::None),
                ErrorKind::PackageUpToDate,
            ),
        ];
        for (t, kind) in cases {
            let err = f.worker.simulate(&t).await.unwrap_err();
            assert_eq!(err.kind(), kind, "{:?}", t.packages());
            assert!(t.simulation().is_none());
        }
    }

    #[tokio::test]
    async fn test_high_trust_packages() {
        let f = fixture_with(|c| {
            c.with_high_trust_repo(HighTrustRepo {
                origin: "Vendor".into(),
                component: "main".into(),
                packages: vec!["foo".into(), "bar".into()],
            })
        });
        let t = install(&["foo"]);
        let sim = f.worker.simulate(&t).await.unwrap();
        assert_eq!(sim.high_trust_packages, vec!["bar", "foo"]);
    }

    #[tokio::test]
    async fn test_run_install() {
        let f = fixture();
        let t = install(&["foo"]);
        assert_eq!(f.worker.run(&t).await, ExitState::Success);
        assert_eq!(f.system.installed_version("foo").as_deref(), Some("1.0"));
        assert_eq!(f.system.installed_version("bar").as_deref(), Some("2.0"));
        assert_eq!(t.progress(), 100);
    }

    #[tokio::test]
    async fn test_run_failure_is_classified() {
        let f = fixture();
        let t = install(&["nonexistent-pkg"]);
        assert_eq!(f.worker.run(&t).await, ExitState::Failed);
        assert_eq!(t.error().unwrap().kind, ErrorKind::NoPackage);
    }

    #[tokio::test]
    async fn test_unauthenticated_packages_refused() {
        let f = fixture();
        let t = install(&["shady"]);
        assert_eq!(f.worker.run(&t).await, ExitState::Failed);
        assert_eq!(t.error().unwrap().kind, ErrorKind::PackageUnauthenticated);
        assert!(f.system.installed_version("shady").is_none());

        let t = install(&["shady"]);
        t.set_allow_unauthenticated(true).unwrap();
        assert_eq!(f.worker.run(&t).await, ExitState::Success);
    }

    #[tokio::test]
    async fn test_dirty_journal_repaired_first() {
        let f = fixture();
        let updates = &f.worker.config().paths.dpkg_updates;
        std::fs::create_dir_all(updates).unwrap();
        std::fs::write(updates.join("0001"), "Package: foo\n").unwrap();
        assert!(journal_dirty(updates));

        let t = install(&["foo"]);
        assert_eq!(f.worker.run(&t).await, ExitState::Success);
        assert!(!journal_dirty(updates));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let f = fixture();
        let t = install(&["foo"]);
        t.request_cancel();
        assert_eq!(f.worker.run(&t).await, ExitState::Cancelled);
        assert!(f.system.installed_version("foo").is_none());
    }

    #[tokio::test]
    async fn test_changed_system_is_resolved_again() {
        let f = fixture();
        let t = install(&["foo"]);
        f.worker.simulate(&t).await.unwrap();
        assert_eq!(f.worker.run(&install(&["bar=1.0"])).await, ExitState::Success);

        assert_eq!(f.worker.run(&t).await, ExitState::Success);
        assert_eq!(f.system.resolve_calls(), 3);
        assert!(t.snapshot().depends.is_empty());
        assert_eq!(f.system.installed_version("bar").as_deref(), Some("1.0"));
    }

    #[tokio::test]
    async fn test_clean_removes_archives() {
        let f = fixture();
        let archives = &f.worker.config().paths.archives_dir;
        std::fs::create_dir_all(archives.join("partial")).unwrap();
        std::fs::write(archives.join("foo_1.0_all.deb"), vec![0u8; 1500]).unwrap();
        std::fs::write(archives.join("partial/bar_2.0_all.deb"), vec![0u8; 500]).unwrap();

        let t = trans(Role::Clean, PackageSets::default(), RoleArgs::None);
        assert_eq!(f.worker.run(&t).await, ExitState::Success);
        assert!(!archives.join("foo_1.0_all.deb").exists());
        assert!(!archives.join("partial/bar_2.0_all.deb").exists());
        assert!(archives.join("lock").exists());
        assert_eq!(t.snapshot().status_details, "Freed 2.0 kB of disk space");
    }

    #[tokio::test]
    async fn test_add_repository() {
        let f = fixture();
        let spec = RepositorySpec {
            src_type: "deb".into(),
            uri: "http://archive.example.com/debian".into(),
            dist: "stable".into(),
            components: vec!["main".into()],
            comment: String::new(),
            sources_file: "example.list".into(),
        };
        let t = trans(Role::AddRepository, PackageSets::default(), RoleArgs::AddRepository(spec));
        assert_eq!(f.worker.run(&t).await, ExitState::Success);
        let written = f.dir.path().join("etc/apt/sources.list.d/example.list");
        let text = std::fs::read_to_string(written).unwrap();
        assert!(text.contains("http://archive.example.com/debian stable main"));
    }

    #[tokio::test]
    async fn test_enable_component() {
        let f = fixture();
        let paths = &f.worker.config().paths;
        std::fs::create_dir_all(paths.os_release.parent().unwrap()).unwrap();
        std::fs::write(&paths.os_release, "ID=debian\nVERSION_CODENAME=bookworm\n").unwrap();
        std::fs::create_dir_all(paths.sources_parts.parent().unwrap()).unwrap();
        std::fs::write(
            &paths.sources_list,
            "deb http://deb.debian.org/debian bookworm main\n",
        )
        .unwrap();

        let t = trans(
            Role::EnableDistroComponent,
            PackageSets::default(),
            RoleArgs::EnableDistroComponent {
                component: "contrib".into(),
            },
        );
        assert_eq!(f.worker.run(&t).await, ExitState::Success);
        let text = std::fs::read_to_string(&paths.sources_list).unwrap();
        assert!(text.contains("bookworm main contrib"));

        let t = trans(
            Role::EnableDistroComponent,
            PackageSets::default(),
            RoleArgs::EnableDistroComponent {
                component: "non free".into(),
            },
        );
        assert_eq!(f.worker.run(&t).await, ExitState::Failed);
        assert_eq!(t.error().unwrap().kind, ErrorKind::RepositoryInvalid);
    }

    fn license(server: &str) -> Transaction {
        trans(
            Role::AddLicenseKey,
            PackageSets::default(),
            RoleArgs::AddLicenseKey {
                package: "foo".into(),
                key: "{\"serial\": \"1234\"}".into(),
                server: server.into(),
            },
        )
    }

    #[tokio::test]
    async fn test_add_license_key() {
        let f = fixture_with(|mut c| {
            c.allowed_license_servers = vec!["vendor".into()];
            c
        });
        let t = license("vendor");
        assert_eq!(f.worker.run(&t).await, ExitState::Success);
        let path = f.worker.config().paths.license_key_dir.join("foo");
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert!(std::fs::read_to_string(&path).unwrap().contains("1234"));

        let t = license("elsewhere");
        assert_eq!(f.worker.run(&t).await, ExitState::Failed);
        assert_eq!(t.error().unwrap().kind, ErrorKind::LicenseKeyInstallFailed);
    }

    struct PullBar(AtomicBool);

    impl CachePlugin for PullBar {
        fn name(&self) -> &str {
            "pull-bar"
        }

        fn modify_after(
            &self,
            cache: &mut dyn PackageCache,
            _trans: &Transaction,
            _resolution: &Resolution,
        ) -> bool {
            if self.0.swap(true, AtomicOrdering::SeqCst) {
                return false;
            }
            cache.mark(Mark::Install {
                name: "bar".into(),
                version: Some("1.0".into()),
            });
            true
        }
    }

    #[tokio::test]
    async fn test_plugin_triggers_second_resolution() {
        let f = fixture();
        let worker = f.worker.with_plugin(Arc::new(PullBar(AtomicBool::new(false))));
        let t = install(&["old=2.0"]);
        let sim = worker.simulate(&t).await.unwrap();
        assert_eq!(f.system.resolve_calls(), 2);
        assert_eq!(sim.depends.install, vec!["bar=1.0"]);
    }

    #[tokio::test]
    async fn test_plugins_can_be_disabled() {
        let f = fixture_with(|mut c| {
            c.disable_plugins = true;
            c
        });
        let worker = f.worker.with_plugin(Arc::new(PullBar(AtomicBool::new(false))));
        let t = install(&["old=2.0"]);
        worker.simulate(&t).await.unwrap();
        assert_eq!(f.system.resolve_calls(), 1);
    }
}
