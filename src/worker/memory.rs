// src/worker/memory.rs

//! In-memory package system
//!
//! Backs `--dummy` mode and the test suite. The universe (available
//! versions, installed packages, essential set and a mirror to refresh
//! from) is plain serde data, loadable from JSON. The resolver follows
//! apt's behaviour closely enough for the daemon's purposes: first
//! satisfiable alternative wins, removals cascade to dependents, upgrades
//! that cannot be satisfied are kept back.

use super::cache::{
    resolution_failed, BrokenDependency, BrokenPackage, BrokenReason, ExecContext, Mark,
    Origin, PackageCache, PackageInfo, PackageSystem, Resolution, ResolveOptions,
};
use super::debfile::DebControl;
use super::progress::{Phase, TransactionProgress};
use crate::enums::ErrorKind;
use crate::error::{Error, Result};
use crate::transaction::{package_name, Dependencies};
use crate::version::{compare_versions, parse_depends, Relation, VersionConstraint};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};

fn default_release() -> String {
    "stable".to_string()
}

fn default_component() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

/// One version a repository offers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableVersion {
    pub version: String,
    #[serde(default)]
    pub depends: String,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default = "default_release")]
    pub release: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default = "default_component")]
    pub component: String,
    #[serde(default = "default_true")]
    pub trusted: bool,
    /// Download size in bytes
    #[serde(default)]
    pub size: u64,
    /// Unpacked size in bytes
    #[serde(default)]
    pub installed_size: u64,
}

impl AvailableVersion {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            depends: String::new(),
            provides: Vec::new(),
            release: default_release(),
            origin: String::new(),
            component: default_component(),
            trusted: true,
            size: 0,
            installed_size: 0,
        }
    }

    pub fn depends(mut self, depends: &str) -> Self {
        self.depends = depends.to_string();
        self
    }

    pub fn provides(mut self, name: &str) -> Self {
        self.provides.push(name.to_string());
        self
    }

    pub fn release(mut self, release: &str) -> Self {
        self.release = release.to_string();
        self
    }

    pub fn origin(mut self, origin: &str, component: &str) -> Self {
        self.origin = origin.to_string();
        self.component = component.to_string();
        self
    }

    pub fn untrusted(mut self) -> Self {
        self.trusted = false;
        self
    }

    pub fn sizes(mut self, size: u64, installed_size: u64) -> Self {
        self.size = size;
        self.installed_size = installed_size;
        self
    }
}

/// A package as recorded in the installed state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub version: String,
    #[serde(default)]
    pub depends: String,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub installed_size: u64,
    /// Installed only to satisfy a dependency
    #[serde(default)]
    pub auto: bool,
}

impl InstalledPackage {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            depends: String::new(),
            provides: Vec::new(),
            installed_size: 0,
            auto: false,
        }
    }

    pub fn depends(mut self, depends: &str) -> Self {
        self.depends = depends.to_string();
        self
    }

    pub fn auto(mut self) -> Self {
        self.auto = true;
        self
    }

    fn from_available(available: &AvailableVersion, auto: bool) -> Self {
        Self {
            version: available.version.clone(),
            depends: available.depends.clone(),
            provides: available.provides.clone(),
            installed_size: available.installed_size,
            auto,
        }
    }
}

/// Everything the memory backend knows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Universe {
    pub available: BTreeMap<String, Vec<AvailableVersion>>,
    pub installed: BTreeMap<String, InstalledPackage>,
    pub essential: BTreeSet<String>,
    /// Lists served by the mirror; a cache update copies them to `available`
    pub mirror: Option<BTreeMap<String, Vec<AvailableVersion>>>,
    pub mirror_reachable: bool,
    /// Packages whose archive download fails
    pub broken_downloads: BTreeSet<String>,
}

impl Default for Universe {
    fn default() -> Self {
        Self {
            available: BTreeMap::new(),
            installed: BTreeMap::new(),
            essential: BTreeSet::new(),
            mirror: None,
            mirror_reachable: true,
            broken_downloads: BTreeSet::new(),
        }
    }
}

impl Universe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// A small universe for `--dummy` when no file is configured
    pub fn demo() -> Self {
        Self::new()
            .with_available("base-files", AvailableVersion::new("12.4"))
            .with_installed("base-files", InstalledPackage::new("12.4"))
            .with_essential("base-files")
            .with_available(
                "hello",
                AvailableVersion::new("2.10-3")
                    .depends("libc6 (>= 2.34)")
                    .origin("Debian", "main")
                    .sizes(53_000, 280_000),
            )
            .with_available(
                "libc6",
                AvailableVersion::new("2.36-9")
                    .origin("Debian", "main")
                    .sizes(2_700_000, 12_900_000),
            )
            .with_installed("libc6", InstalledPackage::new("2.36-9"))
            .with_available(
                "cowsay",
                AvailableVersion::new("3.03+dfsg2-8")
                    .depends("perl")
                    .origin("Debian", "main")
                    .sizes(18_000, 91_000),
            )
            .with_available("perl", AvailableVersion::new("5.36.0-7").sizes(235_000, 720_000))
    }

    pub fn with_available(mut self, name: &str, version: AvailableVersion) -> Self {
        self.available.entry(name.to_string()).or_default().push(version);
        self
    }

    pub fn with_installed(mut self, name: &str, package: InstalledPackage) -> Self {
        self.installed.insert(name.to_string(), package);
        self
    }

    pub fn with_essential(mut self, name: &str) -> Self {
        self.essential.insert(name.to_string());
        self
    }

    pub fn with_mirror(mut self, mirror: BTreeMap<String, Vec<AvailableVersion>>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    fn candidate(&self, name: &str) -> Option<&AvailableVersion> {
        self.available
            .get(name)?
            .iter()
            .max_by(|a, b| compare_versions(&a.version, &b.version))
    }

    fn version(&self, name: &str, version: &str) -> Option<&AvailableVersion> {
        self.available
            .get(name)?
            .iter()
            .find(|v| v.version == version)
    }

    fn best_for(&self, relation: &Relation) -> Option<&AvailableVersion> {
        self.available
            .get(&relation.name)?
            .iter()
            .filter(|v| relation.constraint.satisfies(&v.version))
            .max_by(|a, b| compare_versions(&a.version, &b.version))
    }

    /// Available packages providing the virtual package `name`
    fn providers(&self, name: &str) -> Vec<&str> {
        self.available
            .iter()
            .filter(|(_, versions)| versions.iter().any(|v| v.provides.iter().any(|p| p == name)))
            .map(|(pkg, _)| pkg.as_str())
            .collect()
    }
}

/// Working state of one resolver run
struct Resolver<'u> {
    universe: &'u Universe,
    /// Version of every package after the change
    target: BTreeMap<String, String>,
    /// Explicitly requested; the resolver never changes these
    protected: BTreeSet<String>,
    removed: BTreeSet<String>,
    purge: BTreeSet<String>,
    reinstall: BTreeSet<String>,
    /// Given up on; never brought back in
    rejected: BTreeSet<String>,
    /// Version changed by the resolver itself
    touched: BTreeSet<String>,
    kept: BTreeSet<String>,
    fix_broken: bool,
}

impl<'u> Resolver<'u> {
    fn new(universe: &'u Universe) -> Self {
        Self {
            universe,
            target: universe
                .installed
                .iter()
                .map(|(name, pkg)| (name.clone(), pkg.version.clone()))
                .collect(),
            protected: BTreeSet::new(),
            removed: BTreeSet::new(),
            purge: BTreeSet::new(),
            reinstall: BTreeSet::new(),
            rejected: BTreeSet::new(),
            touched: BTreeSet::new(),
            kept: BTreeSet::new(),
            fix_broken: false,
        }
    }

    fn installed_version(&self, name: &str) -> Option<&'u str> {
        self.universe.installed.get(name).map(|p| p.version.as_str())
    }

    fn apply(&mut self, mark: &Mark) -> Result<()> {
        let missing = |name: &str, version: &str| {
            Error::failed(
                ErrorKind::NoPackage,
                format!("The version {} of {} isn't available", version, name),
            )
        };
        match mark {
            Mark::Install { name, version } | Mark::Upgrade { name, version } => {
                let chosen = match version {
                    Some(v) => self.universe.version(name, v).ok_or_else(|| missing(name, v))?,
                    None => self.universe.candidate(name).ok_or_else(|| {
                        Error::failed(
                            ErrorKind::NoPackage,
                            format!("Package {} isn't available", name),
                        )
                    })?,
                };
                self.target.insert(name.clone(), chosen.version.clone());
                self.protected.insert(name.clone());
            }
            Mark::Downgrade { name, version } => {
                let chosen = self
                    .universe
                    .version(name, version)
                    .ok_or_else(|| missing(name, version))?;
                self.target.insert(name.clone(), chosen.version.clone());
                self.protected.insert(name.clone());
            }
            Mark::Reinstall { name } => {
                self.reinstall.insert(name.clone());
                self.protected.insert(name.clone());
            }
            Mark::Remove { name, purge } => {
                self.target.remove(name);
                self.removed.insert(name.clone());
                if *purge {
                    self.purge.insert(name.clone());
                }
                self.protected.insert(name.clone());
            }
            Mark::UpgradeAll { safe_mode } => self.upgrade_all(*safe_mode)?,
            Mark::FixBroken => self.fix_broken = true,
        }
        Ok(())
    }

    fn depends_of(&self, name: &str, version: &str) -> Result<Vec<Vec<Relation>>> {
        let field = match self.universe.installed.get(name) {
            Some(pkg) if pkg.version == version => pkg.depends.as_str(),
            _ => self
                .universe
                .version(name, version)
                .map(|v| v.depends.as_str())
                .unwrap_or_default(),
        };
        parse_depends(field).map_err(|e| {
            Error::failed(
                ErrorKind::CacheBroken,
                format!("Invalid dependencies of {} {}: {}", name, version, e),
            )
        })
    }

    fn provides_of(&self, name: &str, version: &str) -> &[String] {
        match self.universe.installed.get(name) {
            Some(pkg) if pkg.version == version => &pkg.provides,
            _ => self
                .universe
                .version(name, version)
                .map(|v| v.provides.as_slice())
                .unwrap_or_default(),
        }
    }

    fn satisfied(&self, relation: &Relation) -> bool {
        if let Some(version) = self.target.get(&relation.name)
            && relation.constraint.satisfies(version)
        {
            return true;
        }
        relation.constraint == VersionConstraint::Any
            && self
                .target
                .iter()
                .any(|(name, version)| self.provides_of(name, version).contains(&relation.name))
    }

    fn blocked(&self, name: &str) -> bool {
        self.removed.contains(name) || self.rejected.contains(name)
    }

    /// Pull in the first alternative of `group` that can be installed
    fn try_satisfy(&mut self, group: &[Relation]) -> bool {
        for relation in group {
            let name = &relation.name;
            if self.blocked(name) {
                continue;
            }
            let changing = self.target.contains_key(name);
            if changing && (self.protected.contains(name) || self.touched.contains(name)) {
                continue;
            }
            if let Some(best) = self.universe.best_for(relation) {
                self.target.insert(name.clone(), best.version.clone());
                self.touched.insert(name.clone());
                return true;
            }
            if relation.constraint == VersionConstraint::Any {
                let provider = self
                    .universe
                    .providers(name)
                    .into_iter()
                    .find(|p| !self.blocked(p) && !self.target.contains_key(*p));
                if let Some(provider) = provider
                    && let Some(candidate) = self.universe.candidate(provider)
                {
                    self.target.insert(provider.to_string(), candidate.version.clone());
                    self.touched.insert(provider.to_string());
                    return true;
                }
            }
        }
        false
    }

    /// Whether dropping a dependency alternative made `group` unsatisfied
    fn lost_dependency(&self, group: &[Relation]) -> bool {
        group.iter().any(|r| {
            self.universe.installed.contains_key(&r.name) && !self.target.contains_key(&r.name)
        })
    }

    /// Give up on `name` because `group` cannot be satisfied
    ///
    /// Returns false when the package is requested and must stay broken.
    fn give_up(&mut self, name: &str, group: &[Relation]) -> bool {
        if self.protected.contains(name) {
            return false;
        }
        match self.installed_version(name) {
            Some(installed) if self.target.get(name).map(String::as_str) != Some(installed) => {
                // Keep back at the installed version
                let installed = installed.to_string();
                self.target.insert(name.to_string(), installed);
                self.kept.insert(name.to_string());
                true
            }
            Some(_) if self.fix_broken || self.lost_dependency(group) => {
                debug!("Removing {} since its dependencies are gone", name);
                self.target.remove(name);
                self.rejected.insert(name.to_string());
                true
            }
            Some(_) => false,
            None => {
                self.target.remove(name);
                self.rejected.insert(name.to_string());
                true
            }
        }
    }

    fn settle(&mut self) -> Result<()> {
        loop {
            let mut changed = false;
            let snapshot: Vec<(String, String)> = self
                .target
                .iter()
                .map(|(n, v)| (n.clone(), v.clone()))
                .collect();
            for (name, version) in snapshot {
                if self.target.get(&name) != Some(&version) {
                    continue;
                }
                for group in self.depends_of(&name, &version)? {
                    if group.iter().any(|r| self.satisfied(r)) {
                        continue;
                    }
                    if self.try_satisfy(&group) {
                        changed = true;
                        continue;
                    }
                    if self.give_up(&name, &group) {
                        changed = true;
                        break;
                    }
                }
            }
            if !changed {
                return Ok(());
            }
        }
    }

    fn upgrade_all(&mut self, safe_mode: bool) -> Result<()> {
        let mut upgraded = BTreeSet::new();
        for (name, installed) in &self.universe.installed {
            if self.protected.contains(name) {
                continue;
            }
            if let Some(candidate) = self.universe.candidate(name)
                && compare_versions(&candidate.version, &installed.version) == Ordering::Greater
            {
                self.target.insert(name.clone(), candidate.version.clone());
                self.touched.insert(name.clone());
                upgraded.insert(name.clone());
            }
        }
        if !safe_mode {
            return Ok(());
        }
        // Safe mode: keep back anything that needs installs or breaks others
        loop {
            let mut reverted = None;
            'scan: for (name, version) in &self.target {
                for group in self.depends_of(name, version)? {
                    if group.iter().any(|r| self.satisfied(r)) {
                        continue;
                    }
                    let culprit = if upgraded.contains(name) {
                        Some(name.clone())
                    } else {
                        group.iter().map(|r| &r.name).find(|n| upgraded.contains(*n)).cloned()
                    };
                    if culprit.is_some() {
                        reverted = culprit;
                        break 'scan;
                    }
                }
            }
            let Some(name) = reverted else {
                return Ok(());
            };
            if let Some(installed) = self.universe.installed.get(&name) {
                self.target.insert(name.clone(), installed.version.clone());
            }
            upgraded.remove(&name);
            self.kept.insert(name);
        }
    }

    /// Drop automatically installed packages nothing depends on anymore
    fn remove_obsoleted(&mut self) -> Result<()> {
        loop {
            let mut needed = BTreeSet::new();
            for (name, version) in &self.target {
                for group in self.depends_of(name, version)? {
                    for relation in group {
                        needed.insert(relation.name.clone());
                        for (provider, pv) in &self.target {
                            if self.provides_of(provider, pv).contains(&relation.name) {
                                needed.insert(provider.clone());
                            }
                        }
                    }
                }
            }
            let obsolete: Vec<String> = self
                .universe
                .installed
                .iter()
                .filter(|(name, pkg)| {
                    pkg.auto
                        && self.target.contains_key(*name)
                        && !self.protected.contains(*name)
                        && !needed.contains(*name)
                })
                .map(|(name, _)| name.clone())
                .collect();
            if obsolete.is_empty() {
                return Ok(());
            }
            for name in obsolete {
                self.target.remove(&name);
            }
        }
    }

    fn broken(&self) -> Result<Vec<BrokenPackage>> {
        let mut broken = Vec::new();
        for (name, version) in &self.target {
            let mut dependencies = Vec::new();
            for group in self.depends_of(name, version)? {
                if group.iter().any(|r| self.satisfied(r)) {
                    continue;
                }
                let alternatives = group
                    .into_iter()
                    .map(|relation| {
                        let reason = self.broken_reason(&relation);
                        (relation, reason)
                    })
                    .collect();
                dependencies.push(BrokenDependency {
                    field: "Depends".to_string(),
                    alternatives,
                });
            }
            if !dependencies.is_empty() {
                broken.push(BrokenPackage {
                    name: name.clone(),
                    dependencies,
                });
            }
        }
        Ok(broken)
    }

    fn broken_reason(&self, relation: &Relation) -> BrokenReason {
        let name = &relation.name;
        if self.blocked(name) {
            return BrokenReason::NotGoingToBeInstalled;
        }
        let installed = self.installed_version(name);
        let version = self
            .target
            .get(name)
            .map(String::as_str)
            .or_else(|| self.universe.candidate(name).map(|v| v.version.as_str()))
            .or(installed);
        match version {
            Some(version) => BrokenReason::VersionMismatch {
                version: version.to_string(),
                installed: installed == Some(version),
            },
            None if !self.universe.providers(name).is_empty() => BrokenReason::Virtual,
            None => BrokenReason::NotInstallable,
        }
    }

    fn into_resolution(self) -> Resolution {
        let universe = self.universe;
        let mut resolution = Resolution::default();
        let mut changes = Dependencies::default();
        let mut space: i64 = 0;

        for (name, version) in &self.target {
            let entry = format!("{}={}", name, version);
            let installed = universe.installed.get(name);
            let list = match installed {
                None => &mut changes.install,
                Some(pkg) => match compare_versions(version, &pkg.version) {
                    Ordering::Greater => &mut changes.upgrade,
                    Ordering::Less => &mut changes.downgrade,
                    Ordering::Equal if self.reinstall.contains(name) => &mut changes.reinstall,
                    Ordering::Equal => continue,
                },
            };
            list.push(entry);
            if let Some(available) = universe.version(name, version) {
                resolution.download += available.size;
                space += available.installed_size as i64;
                if !available.trusted {
                    resolution.unauthenticated.push(name.clone());
                }
                resolution.origins.insert(
                    name.clone(),
                    Origin {
                        origin: available.origin.clone(),
                        component: available.component.clone(),
                        trusted: available.trusted,
                    },
                );
            }
            if let Some(pkg) = installed {
                space -= pkg.installed_size as i64;
            }
        }
        for (name, pkg) in &universe.installed {
            if self.target.contains_key(name) {
                continue;
            }
            let entry = format!("{}={}", name, pkg.version);
            if self.purge.contains(name) {
                changes.purge.push(entry);
            } else {
                changes.remove.push(entry);
            }
            space -= pkg.installed_size as i64;
        }
        changes.kept = self
            .kept
            .iter()
            .filter_map(|name| {
                universe
                    .installed
                    .get(name)
                    .map(|pkg| format!("{}={}", name, pkg.version))
            })
            .collect();

        resolution.changes = changes;
        resolution.space = space;
        resolution
    }
}

/// A cache over a snapshot of the universe
pub struct MemoryCache {
    universe: Universe,
    marks: Vec<Mark>,
    resolve_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl PackageCache for MemoryCache {
    async fn package_info(&mut self, name: &str) -> Result<Option<PackageInfo>> {
        let available = self.universe.available.get(name);
        let installed = self.universe.installed.get(name);
        if available.is_none() && installed.is_none() {
            return Ok(None);
        }
        Ok(Some(PackageInfo {
            name: name.to_string(),
            installed: installed.map(|p| p.version.clone()),
            candidate: self.universe.candidate(name).map(|v| v.version.clone()),
            versions: available
                .map(|versions| {
                    versions
                        .iter()
                        .map(|v| (v.version.clone(), v.release.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            essential: self.universe.essential.contains(name),
        }))
    }

    fn mark(&mut self, mark: Mark) {
        self.marks.push(mark);
    }

    fn marks(&self) -> &[Mark] {
        &self.marks
    }

    async fn resolve(&mut self, options: ResolveOptions) -> Result<Resolution> {
        self.resolve_calls.fetch_add(1, AtomicOrdering::SeqCst);
        let mut resolver = Resolver::new(&self.universe);
        for mark in &self.marks {
            resolver.apply(mark)?;
        }
        resolver.settle()?;

        for name in &self.universe.essential {
            if self.universe.installed.contains_key(name) && !resolver.target.contains_key(name) {
                return Err(Error::failed(
                    ErrorKind::NotRemoveEssentialPackage,
                    format!("Package {} cannot be removed", name),
                ));
            }
        }
        let broken = resolver.broken()?;
        if !broken.is_empty() {
            return Err(resolution_failed(&broken));
        }
        if options.remove_obsoleted {
            resolver.remove_obsoleted()?;
        }
        Ok(resolver.into_resolution())
    }
}

/// The memory package system
pub struct MemorySystem {
    universe: Mutex<Universe>,
    stamp: AtomicU64,
    resolve_calls: Arc<AtomicUsize>,
    install_gate: Option<Arc<Semaphore>>,
    journal_dir: Option<PathBuf>,
    step_delay: Duration,
}

impl MemorySystem {
    pub fn new(universe: Universe) -> Self {
        Self {
            universe: Mutex::new(universe),
            stamp: AtomicU64::new(1),
            resolve_calls: Arc::new(AtomicUsize::new(0)),
            install_gate: None,
            journal_dir: None,
            step_delay: Duration::ZERO,
        }
    }

    /// Every installed package waits for a permit from `gate`
    pub fn with_install_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.install_gate = Some(gate);
        self
    }

    /// Directory whose numbered files mark an interrupted run
    pub fn with_journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }

    /// Pause between steps so clients can watch progress
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Number of dependency resolutions run so far
    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(AtomicOrdering::SeqCst)
    }

    pub fn installed_version(&self, name: &str) -> Option<String> {
        self.universe.lock().installed.get(name).map(|p| p.version.clone())
    }

    pub fn universe(&self) -> Universe {
        self.universe.lock().clone()
    }

    pub fn set_mirror_reachable(&self, reachable: bool) {
        self.universe.lock().mirror_reachable = reachable;
    }

    fn bump(&self) {
        self.stamp.fetch_add(1, AtomicOrdering::SeqCst);
    }

    async fn pause(&self) {
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
    }

    fn apply_change(&self, name: &str, version: Option<&str>, requested: &BTreeSet<String>) {
        let mut universe = self.universe.lock();
        let Some(version) = version else {
            universe.installed.remove(name);
            return;
        };
        let auto = match universe.installed.get(name) {
            Some(existing) => existing.auto && !requested.contains(name),
            None => !requested.contains(name),
        };
        let package = match universe.version(name, version) {
            Some(available) => InstalledPackage::from_available(available, auto),
            None => InstalledPackage {
                auto,
                ..InstalledPackage::new(version)
            },
        };
        universe.installed.insert(name.to_string(), package);
    }

    async fn wait_for_permit(&self, ctx: &ExecContext<'_>) -> Result<()> {
        let Some(ref gate) = self.install_gate else {
            return Ok(());
        };
        tokio::select! {
            permit = gate.acquire() => {
                let permit = permit.map_err(|e| Error::IoError(e.to_string()))?;
                permit.forget();
            }
            _ = ctx.trans.wait_for(|s| s.cancelled) => {}
        }
        Ok(())
    }
}

#[async_trait]
impl PackageSystem for MemorySystem {
    async fn state_stamp(&self) -> Result<u64> {
        Ok(self.stamp.load(AtomicOrdering::SeqCst))
    }

    async fn open(&self, status: Option<&Path>) -> Result<Box<dyn PackageCache>> {
        let mut universe = self.universe();
        if let Some(path) = status {
            let text = tokio::fs::read_to_string(path).await?;
            universe.installed = serde_json::from_str(&text)?;
        }
        Ok(Box::new(MemoryCache {
            universe,
            marks: Vec::new(),
            resolve_calls: Arc::clone(&self.resolve_calls),
        }))
    }

    async fn freeze(&self, dest: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.universe.lock().installed)?;
        tokio::fs::write(dest, text).await?;
        Ok(())
    }

    async fn commit(
        &self,
        ctx: &mut ExecContext<'_>,
        changes: &Dependencies,
        allow_unauthenticated: bool,
    ) -> Result<()> {
        let requested: BTreeSet<String> = ctx
            .trans
            .packages()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut progress = TransactionProgress::new(ctx.trans, Phase::Commit);

        let fetch: Vec<String> = changes.unpacked_names().into_iter().map(str::to_string).collect();
        for (i, name) in fetch.iter().enumerate() {
            ctx.trans.check_cancelled()?;
            let spec = changes
                .install
                .iter()
                .chain(&changes.reinstall)
                .chain(&changes.upgrade)
                .chain(&changes.downgrade)
                .find(|s| package_name(s) == name);
            let version = spec.and_then(|s| s.split_once('=')).map(|(_, v)| v);
            {
                let universe = self.universe.lock();
                if universe.broken_downloads.contains(name) {
                    return Err(Error::failed(
                        ErrorKind::PackageDownloadFailed,
                        format!("Failed to fetch {}", name),
                    ));
                }
                let trusted = version
                    .and_then(|v| universe.version(name, v))
                    .is_none_or(|v| v.trusted);
                if !trusted && !allow_unauthenticated {
                    return Err(Error::failed(
                        ErrorKind::PackageUnauthenticated,
                        format!("The package {} cannot be authenticated", name),
                    ));
                }
            }
            let percent = (i + 1) as f64 * 100.0 / fetch.len() as f64;
            progress.download(name, percent, &format!("Downloading {}", name));
            self.pause().await;
        }

        let mut steps: Vec<(String, Option<String>)> = Vec::new();
        for spec in changes
            .install
            .iter()
            .chain(&changes.reinstall)
            .chain(&changes.upgrade)
            .chain(&changes.downgrade)
        {
            let (name, version) = spec.split_once('=').unwrap_or((spec.as_str(), ""));
            steps.push((name.to_string(), Some(version.to_string())));
        }
        for spec in changes.remove.iter().chain(&changes.purge) {
            steps.push((package_name(spec).to_string(), None));
        }

        let total = steps.len();
        for (i, (name, version)) in steps.iter().enumerate() {
            self.wait_for_permit(ctx).await?;
            ctx.trans.check_cancelled()?;
            let message = match version {
                Some(_) => format!("Installing {}", name),
                None => format!("Removing {}", name),
            };
            progress.install(name, i as f64 * 100.0 / total as f64, &message);
            self.apply_change(name, version.as_deref(), &requested);
            self.bump();
            self.pause().await;
        }
        if total > 0 {
            info!("Committed {} package changes", total);
        }
        Ok(())
    }

    async fn update_cache(&self, ctx: &mut ExecContext<'_>, sources_list: Option<&Path>) -> Result<()> {
        let mut progress = TransactionProgress::new(ctx.trans, Phase::Update);
        if !self.universe.lock().mirror_reachable {
            return Err(Error::failed(
                ErrorKind::RepoDownloadFailed,
                "Failed to download package lists: the mirror is unreachable",
            ));
        }
        let source = sources_list
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "mirror".to_string());
        for step in 1..=4u32 {
            ctx.trans.check_cancelled()?;
            progress.download(&source, f64::from(step) * 25.0, &format!("Get:{} {}", step, source));
            self.pause().await;
        }
        {
            let mut universe = self.universe.lock();
            if let Some(mirror) = universe.mirror.clone() {
                universe.available = mirror;
            }
        }
        self.bump();
        Ok(())
    }

    async fn fix_incomplete(&self, ctx: &mut ExecContext<'_>) -> Result<()> {
        let mut progress = TransactionProgress::new(ctx.trans, Phase::Dpkg { total: 1 });
        progress.install("dpkg", 0.0, "Configuring unpacked packages");
        if let Some(ref dir) = self.journal_dir {
            for entry in std::fs::read_dir(dir)?.flatten() {
                let numbered = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(|c: char| c.is_ascii_digit()));
                if numbered {
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
        self.bump();
        Ok(())
    }

    async fn install_file(&self, ctx: &mut ExecContext<'_>, path: &Path, _force: bool) -> Result<()> {
        let control = DebControl::read(path)?;
        let mut progress = TransactionProgress::new(ctx.trans, Phase::Dpkg { total: 1 });
        progress.install(&control.package, 0.0, &format!("Installing {}", control.package));
        {
            let mut universe = self.universe.lock();
            universe.installed.insert(
                control.package.clone(),
                InstalledPackage {
                    version: control.version.clone(),
                    depends: control.depends.clone(),
                    provides: control.provides.clone(),
                    installed_size: control.installed_size_kib * 1024,
                    auto: false,
                },
            );
        }
        self.bump();
        Ok(())
    }

    async fn reconfigure(
        &self,
        ctx: &mut ExecContext<'_>,
        packages: &[String],
        _priority: &str,
    ) -> Result<()> {
        let total = packages.len().max(1) as u32;
        let mut progress = TransactionProgress::new(ctx.trans, Phase::Dpkg { total });
        for (i, name) in packages.iter().enumerate() {
            if !self.universe.lock().installed.contains_key(name) {
                return Err(Error::failed(
                    ErrorKind::PackageNotInstalled,
                    format!("Package {} isn't installed", name),
                ));
            }
            ctx.trans.check_cancelled()?;
            progress.install(
                name,
                i as f64 * 100.0 / f64::from(total),
                &format!("Reconfiguring {}", name),
            );
            self.pause().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn universe() -> Universe {
        Universe::new()
            .with_available(
                "foo",
                AvailableVersion::new("1.0")
                    .depends("bar (>= 1.0)")
                    .origin("Debian", "main")
                    .sizes(100, 1000),
            )
            .with_available("bar", AvailableVersion::new("1.0").sizes(50, 500))
            .with_available("bar", AvailableVersion::new("1.2").sizes(60, 600))
            .with_available("bar", AvailableVersion::new("2.0").release("unstable"))
            .with_available("baz", AvailableVersion::new("2.0").depends("qux (>= 3)"))
            .with_available("qux", AvailableVersion::new("1.0"))
            .with_available("libold", AvailableVersion::new("1.0"))
            .with_installed("libold", InstalledPackage::new("1.0").auto())
            .with_available("app", AvailableVersion::new("1.0").depends("libold"))
            .with_installed("app", InstalledPackage::new("1.0").depends("libold"))
            .with_available("base", AvailableVersion::new("1.0"))
            .with_installed("base", InstalledPackage::new("1.0"))
            .with_essential("base")
    }

    async fn resolve(universe: Universe, marks: Vec<Mark>) -> Result<Resolution> {
        let system = MemorySystem::new(universe);
        let mut cache = system.open(None).await?;
        for mark in marks {
            cache.mark(mark);
        }
        cache.resolve(ResolveOptions::default()).await
    }

    fn install(name: &str) -> Mark {
        Mark::Install {
            name: name.into(),
            version: None,
        }
    }

    #[tokio::test]
    async fn test_install_pulls_dependency() {
        let res = resolve(universe(), vec![install("foo")]).await.unwrap();
        assert_eq!(res.changes.install, vec!["bar=2.0", "foo=1.0"]);
        assert_eq!(res.download, 100);
        assert_eq!(res.origins["foo"].origin, "Debian");
    }

    #[tokio::test]
    async fn test_pinned_version_is_respected() {
        let res = resolve(
            universe(),
            vec![
                install("foo"),
                Mark::Install {
                    name: "bar".into(),
                    version: Some("1.2".into()),
                },
            ],
        )
        .await
        .unwrap();
        assert_eq!(res.changes.install, vec!["bar=1.2", "foo=1.0"]);
        assert_eq!(res.space, 1600);
    }

    #[tokio::test]
    async fn test_unsatisfiable_dependency_is_explained() {
        let err = resolve(universe(), vec![install("baz")]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DepResolutionFailed);
        assert!(
            err.details().contains("baz: Depends: qux (>= 3) but 1.0 is to be installed"),
            "{}",
            err.details()
        );
    }

    #[tokio::test]
    async fn test_removal_cascades_to_dependents() {
        let res = resolve(
            universe(),
            vec![Mark::Remove {
                name: "libold".into(),
                purge: true,
            }],
        )
        .await
        .unwrap();
        assert_eq!(res.changes.purge, vec!["libold=1.0"]);
        assert_eq!(res.changes.remove, vec!["app=1.0"]);
    }

    #[tokio::test]
    async fn test_essential_package_is_protected() {
        let err = resolve(
            universe(),
            vec![Mark::Remove {
                name: "base".into(),
                purge: false,
            }],
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRemoveEssentialPackage);
    }

    #[tokio::test]
    async fn test_remove_obsoleted_drops_auto_packages() {
        let system = MemorySystem::new(universe());
        let mut cache = system.open(None).await.unwrap();
        cache.mark(Mark::Remove {
            name: "app".into(),
            purge: false,
        });
        let plain = cache.resolve(ResolveOptions::default()).await.unwrap();
        assert_eq!(plain.changes.remove, vec!["app=1.0"]);

        let res = cache
            .resolve(ResolveOptions {
                remove_obsoleted: true,
            })
            .await
            .unwrap();
        assert_eq!(res.changes.remove, vec!["app=1.0", "libold=1.0"]);
        assert_eq!(system.resolve_calls(), 2);
    }

    #[tokio::test]
    async fn test_safe_upgrade_keeps_back_new_dependencies() {
        let universe = Universe::new()
            .with_installed("tool", InstalledPackage::new("1.0"))
            .with_available("tool", AvailableVersion::new("1.0"))
            .with_available("tool", AvailableVersion::new("2.0").depends("libnew"))
            .with_available("libnew", AvailableVersion::new("1.0"))
            .with_installed("lib", InstalledPackage::new("1.0"))
            .with_available("lib", AvailableVersion::new("1.1"));

        let safe = resolve(universe.clone(), vec![Mark::UpgradeAll { safe_mode: true }])
            .await
            .unwrap();
        assert_eq!(safe.changes.upgrade, vec!["lib=1.1"]);
        assert_eq!(safe.changes.kept, vec!["tool=1.0"]);
        assert!(safe.changes.install.is_empty());

        let full = resolve(universe, vec![Mark::UpgradeAll { safe_mode: false }])
            .await
            .unwrap();
        assert_eq!(full.changes.upgrade, vec!["lib=1.1", "tool=2.0"]);
        assert_eq!(full.changes.install, vec!["libnew=1.0"]);
    }

    #[tokio::test]
    async fn test_freeze_and_open_frozen_state() {
        let system = MemorySystem::new(universe());
        let dir = tempfile::tempdir().unwrap();
        let frozen = dir.path().join("status");
        system.freeze(&frozen).await.unwrap();

        system.universe.lock().installed.clear();
        let mut cache = system.open(Some(&frozen)).await.unwrap();
        let info = cache.package_info("app").await.unwrap().unwrap();
        assert_eq!(info.installed.as_deref(), Some("1.0"));
    }

    #[tokio::test]
    async fn test_package_info() {
        let system = MemorySystem::new(universe());
        let mut cache = system.open(None).await.unwrap();
        let bar = cache.package_info("bar").await.unwrap().unwrap();
        assert_eq!(bar.candidate.as_deref(), Some("2.0"));
        assert_eq!(bar.installed, None);
        assert_eq!(bar.version_from_release("stable"), Some("1.2"));
        assert!(cache.package_info("nope").await.unwrap().is_none());
        assert!(cache.package_info("base").await.unwrap().unwrap().essential);
    }
}
