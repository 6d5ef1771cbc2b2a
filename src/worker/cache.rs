// src/worker/cache.rs

//! The package cache seen by the worker
//!
//! A [`PackageSystem`] is the installed system plus its repositories: it
//! opens caches, commits change sets and runs the maintenance commands. A
//! [`PackageCache`] is one scratch view of it on which packages get marked
//! and resolved. Simulation and execution use separate caches, so a dry run
//! never disturbs a commit in progress.

use crate::error::{Error, Result};
use crate::enums::ErrorKind;
use crate::lock::LockSet;
use crate::runner::RunnerOptions;
use crate::transaction::{Dependencies, Transaction};
use crate::version::Relation;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

/// A change requested on one package
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mark {
    /// Install, optionally a specific version
    Install { name: String, version: Option<String> },
    Reinstall { name: String },
    Remove { name: String, purge: bool },
    /// Upgrade to the candidate or to a specific version
    Upgrade { name: String, version: Option<String> },
    Downgrade { name: String, version: String },
    /// Upgrade everything; safe mode never installs or removes
    UpgradeAll { safe_mode: bool },
    /// Satisfy broken dependencies of installed packages
    FixBroken,
}

/// What the cache knows about a package
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    pub installed: Option<String>,
    pub candidate: Option<String>,
    /// Every available version with the release (archive or codename) it comes from
    pub versions: Vec<(String, String)>,
    pub essential: bool,
}

impl PackageInfo {
    pub fn has_version(&self, version: &str) -> bool {
        self.versions.iter().any(|(v, _)| v == version)
    }

    /// Newest version available from `release`
    pub fn version_from_release(&self, release: &str) -> Option<&str> {
        self.versions
            .iter()
            .filter(|(_, r)| r == release)
            .map(|(v, _)| v.as_str())
            .max_by(|a, b| crate::version::compare_versions(a, b))
    }
}

/// Where a version comes from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Origin {
    pub origin: String,
    pub component: String,
    pub trusted: bool,
}

/// Outcome of resolving the marked changes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Entries are `name=version`
    pub changes: Dependencies,
    pub download: u64,
    pub space: i64,
    pub unauthenticated: Vec<String>,
    /// Origin of every package that gets unpacked, keyed by name
    pub origins: HashMap<String, Origin>,
}

/// Why one dependency alternative could not be satisfied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokenReason {
    /// The only version around does not satisfy the constraint
    VersionMismatch { version: String, installed: bool },
    /// Only provided by other packages
    Virtual,
    /// No installable version at all
    NotInstallable,
    /// Installable but the resolver decided against it
    NotGoingToBeInstalled,
}

/// One unsatisfied dependency group of a broken package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenDependency {
    /// `Depends`, `PreDepends`, ...
    pub field: String,
    /// The alternatives of the group with the reason each failed
    pub alternatives: Vec<(Relation, BrokenReason)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenPackage {
    pub name: String,
    pub dependencies: Vec<BrokenDependency>,
}

fn describe(relation: &Relation, reason: &BrokenReason) -> String {
    let mut text = relation.to_string();
    match reason {
        BrokenReason::VersionMismatch { version, installed } => {
            let what = if *installed { "is installed" } else { "is to be installed" };
            let _ = write!(text, " but {} {}", version, what);
        }
        BrokenReason::Virtual => text.push_str(" but it is a virtual package"),
        BrokenReason::NotInstallable => text.push_str(" but it is not installable"),
        BrokenReason::NotGoingToBeInstalled => {
            text.push_str(" but it is not going to be installed")
        }
    }
    text
}

/// Report broken packages the way `apt-get -f install` does
pub fn explain_broken(broken: &[BrokenPackage]) -> String {
    let mut out = String::from("The following packages have unmet dependencies:\n\n");
    for package in broken {
        let indent = " ".repeat(package.name.len() + 2);
        let mut first = true;
        for dep in &package.dependencies {
            let prefix = if first {
                format!("{}: ", package.name)
            } else {
                indent.clone()
            };
            first = false;
            let alternatives: Vec<String> = dep
                .alternatives
                .iter()
                .map(|(relation, reason)| describe(relation, reason))
                .collect();
            let _ = writeln!(
                out,
                "{}{}: {}",
                prefix,
                dep.field,
                alternatives.join(&format!(" or\n{}{}", indent, " ".repeat(dep.field.len() + 2)))
            );
        }
    }
    out
}

/// Error for a resolver failure with the explanation attached
pub fn resolution_failed(broken: &[BrokenPackage]) -> Error {
    Error::failed(ErrorKind::DepResolutionFailed, explain_broken(broken))
}

/// Options that influence resolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Also remove automatically installed packages nothing needs anymore
    pub remove_obsoleted: bool,
}

/// A scratch view of the package system
#[async_trait]
pub trait PackageCache: Send {
    /// Look a package up; `None` if it is unknown
    async fn package_info(&mut self, name: &str) -> Result<Option<PackageInfo>>;

    fn mark(&mut self, mark: Mark);

    fn marks(&self) -> &[Mark];

    /// Resolve the marks into a full change set
    ///
    /// Unsatisfiable requests fail with DEP_RESOLUTION_FAILED and an
    /// explanation of every broken package.
    async fn resolve(&mut self, options: ResolveOptions) -> Result<Resolution>;
}

/// Everything a privileged step needs
pub struct ExecContext<'a> {
    pub trans: &'a Transaction,
    pub locks: &'a mut LockSet,
    pub runner: RunnerOptions,
}

/// The installed system and its repositories
#[async_trait]
pub trait PackageSystem: Send + Sync {
    /// Fingerprint of the installed state and the package lists
    async fn state_stamp(&self) -> Result<u64>;

    /// Open a cache, reading the installed state from `status` if given
    async fn open(&self, status: Option<&Path>) -> Result<Box<dyn PackageCache>>;

    /// Snapshot the installed state into `dest`
    async fn freeze(&self, dest: &Path) -> Result<()>;

    /// Download and install a resolved change set
    async fn commit(
        &self,
        ctx: &mut ExecContext<'_>,
        changes: &Dependencies,
        allow_unauthenticated: bool,
    ) -> Result<()>;

    /// Refresh the package lists, optionally from one sources file only
    async fn update_cache(&self, ctx: &mut ExecContext<'_>, sources_list: Option<&Path>) -> Result<()>;

    /// Finish an interrupted dpkg run (`dpkg --configure -a`)
    async fn fix_incomplete(&self, ctx: &mut ExecContext<'_>) -> Result<()>;

    /// Install a local package file with dpkg
    async fn install_file(&self, ctx: &mut ExecContext<'_>, path: &Path, force: bool) -> Result<()>;

    /// Re-run the configuration of installed packages
    async fn reconfigure(
        &self,
        ctx: &mut ExecContext<'_>,
        packages: &[String],
        priority: &str,
    ) -> Result<()>;
}

/// Hook run around dependency resolution
///
/// A plugin may add marks; returning true makes the worker resolve again.
pub trait CachePlugin: Send + Sync {
    fn name(&self) -> &str;

    fn modify_before(&self, _cache: &mut dyn PackageCache, _trans: &Transaction) -> bool {
        false
    }

    fn modify_after(
        &self,
        _cache: &mut dyn PackageCache,
        _trans: &Transaction,
        _resolution: &Resolution,
    ) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explain_broken_lists_every_reason() {
        let broken = vec![BrokenPackage {
            name: "foo".into(),
            dependencies: vec![
                BrokenDependency {
                    field: "Depends".into(),
                    alternatives: vec![(
                        Relation::parse("bar (>= 2.0)").unwrap(),
                        BrokenReason::VersionMismatch {
                            version: "1.0".into(),
                            installed: false,
                        },
                    )],
                },
                BrokenDependency {
                    field: "Depends".into(),
                    alternatives: vec![
                        (Relation::parse("mail-transport-agent").unwrap(), BrokenReason::Virtual),
                        (Relation::parse("qux").unwrap(), BrokenReason::NotInstallable),
                    ],
                },
            ],
        }];
        let text = explain_broken(&broken);
        assert!(text.starts_with("The following packages have unmet dependencies:"));
        assert!(text.contains("foo: Depends: bar (>= 2.0) but 1.0 is to be installed"));
        assert!(text.contains("mail-transport-agent but it is a virtual package or"));
        assert!(text.contains("qux but it is not installable"));
    }

    #[test]
    fn test_version_from_release() {
        let info = PackageInfo {
            name: "bar".into(),
            versions: vec![
                ("1.0".into(), "stable".into()),
                ("1.2".into(), "stable".into()),
                ("2.0".into(), "unstable".into()),
            ],
            ..Default::default()
        };
        assert_eq!(info.version_from_release("stable"), Some("1.2"));
        assert_eq!(info.version_from_release("testing"), None);
        assert!(info.has_version("2.0"));
    }
}
