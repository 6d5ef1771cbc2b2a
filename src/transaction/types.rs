// src/transaction/types.rs

//! Value types carried by a transaction

use crate::enums::{DownloadStatus, ErrorKind};
use serde::{Deserialize, Serialize};

/// Strip a version (`foo=1.2`) or release (`foo/unstable`) pin from a request
pub fn package_name(spec: &str) -> &str {
    let end = spec.find(['=', '/']).unwrap_or(spec.len());
    &spec[..end]
}

/// What exactly a client asked for with one package string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageTarget {
    /// Whatever the policy picks
    Candidate,
    /// `name=version`
    Version(String),
    /// `name/release`
    Release(String),
}

/// Split `foo=1.2` / `foo/unstable` / `foo` into the name and its target
pub fn parse_package_spec(spec: &str) -> (&str, PackageTarget) {
    if let Some((name, version)) = spec.split_once('=') {
        (name, PackageTarget::Version(version.to_string()))
    } else if let Some((name, release)) = spec.split_once('/') {
        (name, PackageTarget::Release(release.to_string()))
    } else {
        (spec, PackageTarget::Candidate)
    }
}

fn push_unique(list: &mut Vec<String>, spec: String) {
    let name = package_name(&spec).to_string();
    if !list.iter().any(|existing| package_name(existing) == name) {
        list.push(spec);
    }
}

/// The six package groups a client can request
///
/// Each list keeps the client's order and holds a package name at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSets {
    pub install: Vec<String>,
    pub reinstall: Vec<String>,
    pub remove: Vec<String>,
    pub purge: Vec<String>,
    pub upgrade: Vec<String>,
    pub downgrade: Vec<String>,
}

impl PackageSets {
    pub fn new(
        install: Vec<String>,
        reinstall: Vec<String>,
        remove: Vec<String>,
        purge: Vec<String>,
        upgrade: Vec<String>,
        downgrade: Vec<String>,
    ) -> Self {
        let dedup = |specs: Vec<String>| {
            let mut out = Vec::with_capacity(specs.len());
            for spec in specs {
                push_unique(&mut out, spec);
            }
            out
        };
        Self {
            install: dedup(install),
            reinstall: dedup(reinstall),
            remove: dedup(remove),
            purge: dedup(purge),
            upgrade: dedup(upgrade),
            downgrade: dedup(downgrade),
        }
    }

    pub fn install(packages: Vec<String>) -> Self {
        Self::new(packages, vec![], vec![], vec![], vec![], vec![])
    }

    pub fn remove(packages: Vec<String>) -> Self {
        Self::new(vec![], vec![], packages, vec![], vec![], vec![])
    }

    pub fn upgrade(packages: Vec<String>) -> Self {
        Self::new(vec![], vec![], vec![], vec![], packages, vec![])
    }

    pub fn is_empty(&self) -> bool {
        self.iter().all(|(_, list)| list.is_empty())
    }

    /// All lists in wire order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Vec<String>)> {
        [
            ("install", &self.install),
            ("reinstall", &self.reinstall),
            ("remove", &self.remove),
            ("purge", &self.purge),
            ("upgrade", &self.upgrade),
            ("downgrade", &self.downgrade),
        ]
        .into_iter()
    }

    /// Every package name mentioned in any list
    pub fn names(&self) -> Vec<&str> {
        self.iter()
            .flat_map(|(_, list)| list.iter().map(|s| package_name(s)))
            .collect()
    }

    pub fn to_tuple(&self) -> [Vec<String>; 6] {
        [
            self.install.clone(),
            self.reinstall.clone(),
            self.remove.clone(),
            self.purge.clone(),
            self.upgrade.clone(),
            self.downgrade.clone(),
        ]
    }
}

/// The resolver's full change set, each entry formatted `name=version`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependencies {
    pub install: Vec<String>,
    pub reinstall: Vec<String>,
    pub remove: Vec<String>,
    pub purge: Vec<String>,
    pub upgrade: Vec<String>,
    pub downgrade: Vec<String>,
    pub kept: Vec<String>,
}

impl Dependencies {
    pub fn is_empty(&self) -> bool {
        self.lists().iter().all(|list| list.is_empty())
    }

    fn lists(&self) -> [&Vec<String>; 7] {
        [
            &self.install,
            &self.reinstall,
            &self.remove,
            &self.purge,
            &self.upgrade,
            &self.downgrade,
            &self.kept,
        ]
    }

    fn lists_mut(&mut self) -> [&mut Vec<String>; 7] {
        [
            &mut self.install,
            &mut self.reinstall,
            &mut self.remove,
            &mut self.purge,
            &mut self.upgrade,
            &mut self.downgrade,
            &mut self.kept,
        ]
    }

    /// Drop the packages a client explicitly asked for, leaving what the
    /// resolver pulled in on its own
    pub fn without_requested(&self, requested: &[&str]) -> Dependencies {
        let mut out = self.clone();
        for list in out.lists_mut() {
            list.retain(|spec| !requested.contains(&package_name(spec)));
        }
        out
    }

    /// Names of everything that gets unpacked (install, reinstall, upgrade, downgrade)
    pub fn unpacked_names(&self) -> Vec<&str> {
        [&self.install, &self.reinstall, &self.upgrade, &self.downgrade]
            .into_iter()
            .flat_map(|list| list.iter().map(|s| package_name(s)))
            .collect()
    }

    /// True if nothing but new installs are planned
    pub fn only_installs(&self) -> bool {
        self.reinstall.is_empty()
            && self.remove.is_empty()
            && self.purge.is_empty()
            && self.upgrade.is_empty()
            && self.downgrade.is_empty()
    }

    /// True if nothing but upgrades are planned
    pub fn only_upgrades(&self) -> bool {
        self.install.is_empty()
            && self.reinstall.is_empty()
            && self.remove.is_empty()
            && self.purge.is_empty()
            && self.downgrade.is_empty()
    }

    pub fn to_tuple(&self) -> [Vec<String>; 7] {
        [
            self.install.clone(),
            self.reinstall.clone(),
            self.remove.clone(),
            self.purge.clone(),
            self.upgrade.clone(),
            self.downgrade.clone(),
            self.kept.clone(),
        ]
    }
}

/// Aggregate download progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressDetails {
    pub items_done: u32,
    pub items_total: u32,
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Bytes per second
    pub speed: f64,
    /// Seconds remaining
    pub eta: u64,
}

/// Progress of one download item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub uri: String,
    pub status: DownloadStatus,
    pub description: String,
    pub size: u64,
    pub downloaded: u64,
    pub message: String,
}

/// A removable medium the package manager asked for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredMedium {
    pub label: String,
    pub drive: String,
}

/// A modified configuration file dpkg wants to replace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFileConflict {
    /// The installed file
    pub old: String,
    /// The maintainer's new version
    pub new: String,
}

/// Error reported on a failed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionError {
    pub kind: ErrorKind,
    pub details: String,
}

/// Identity of the client that created a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
    pub cmdline: String,
    /// Unique bus name, when the request came over D-Bus
    pub sender: Option<String>,
}

impl Caller {
    pub fn new(pid: u32, uid: u32, gid: u32) -> Self {
        Self {
            pid,
            uid,
            gid,
            cmdline: String::new(),
            sender: None,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.cmdline = cmdline.into();
        self
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// A software source line to add
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySpec {
    /// "deb" or "deb-src"
    pub src_type: String,
    pub uri: String,
    pub dist: String,
    pub components: Vec<String>,
    pub comment: String,
    /// File below sources.list.d, empty for the main sources.list
    pub sources_file: String,
}

/// Role specific arguments a transaction was created with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleArgs {
    #[default]
    None,
    UpgradeSystem {
        safe_mode: bool,
    },
    UpdateCache {
        /// Restrict the refresh to one sources file
        sources_list: Option<String>,
    },
    InstallFile {
        path: String,
        force: bool,
    },
    AddVendorKeyFile {
        path: String,
    },
    AddVendorKeyFromKeyserver {
        key_id: String,
        keyserver: String,
    },
    RemoveVendorKey {
        fingerprint: String,
    },
    AddRepository(RepositorySpec),
    EnableDistroComponent {
        component: String,
    },
    Reconfigure {
        packages: Vec<String>,
        priority: String,
    },
    AddLicenseKey {
        package: String,
        key: String,
        server: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_name_strips_pins() {
        assert_eq!(package_name("bar=1.2"), "bar");
        assert_eq!(package_name("bar/unstable"), "bar");
        assert_eq!(package_name("bar"), "bar");
    }

    #[test]
    fn test_parse_package_spec() {
        assert_eq!(
            parse_package_spec("bar=1.2"),
            ("bar", PackageTarget::Version("1.2".into()))
        );
        assert_eq!(
            parse_package_spec("bar/unstable"),
            ("bar", PackageTarget::Release("unstable".into()))
        );
        assert_eq!(parse_package_spec("bar"), ("bar", PackageTarget::Candidate));
    }

    #[test]
    fn test_package_sets_unique_by_name() {
        let sets = PackageSets::install(vec![
            "foo".into(),
            "bar=1.2".into(),
            "foo=2.0".into(),
            "baz".into(),
        ]);
        assert_eq!(sets.install, vec!["foo", "bar=1.2", "baz"]);
        assert_eq!(sets.names(), vec!["foo", "bar", "baz"]);
        assert!(!sets.is_empty());
        assert!(PackageSets::default().is_empty());
    }

    #[test]
    fn test_dependencies_without_requested() {
        let deps = Dependencies {
            install: vec!["foo=1.0".into(), "libfoo=1.0".into()],
            remove: vec!["old=0.9".into()],
            ..Default::default()
        };
        let extra = deps.without_requested(&["foo"]);
        assert_eq!(extra.install, vec!["libfoo=1.0"]);
        assert_eq!(extra.remove, vec!["old=0.9"]);
        assert!(!deps.only_installs());
        assert_eq!(deps.unpacked_names(), vec!["foo", "libfoo"]);
    }

    #[test]
    fn test_only_upgrades() {
        let deps = Dependencies {
            upgrade: vec!["a=2".into()],
            kept: vec!["b=1".into()],
            ..Default::default()
        };
        assert!(deps.only_upgrades());
        assert!(!deps.only_installs());
    }
}
