// src/config.rs

//! Daemon configuration
//!
//! Loaded from `/etc/aptd/aptd.toml` when present. Every field has a default
//! so an empty file (or no file) yields a working system daemon. All system
//! paths are derived from `root`, which lets tests and `--chroot` point the
//! daemon at a scratch tree.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/aptd/aptd.toml";

/// Which package cache implementation the worker drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// apt-get / apt-cache / dpkg on the host
    #[default]
    Apt,
    /// In-memory package universe (`--dummy`)
    Memory,
}

/// Filesystem locations used by the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemPaths {
    pub dpkg_status: PathBuf,
    pub dpkg_updates: PathBuf,
    pub lock_frontend: PathBuf,
    pub lock_status: PathBuf,
    pub lock_archives: PathBuf,
    pub lock_lists: PathBuf,
    pub archives_dir: PathBuf,
    pub lists_dir: PathBuf,
    pub sources_list: PathBuf,
    pub sources_parts: PathBuf,
    pub trusted_keyring: PathBuf,
    pub periodic_conf: PathBuf,
    pub license_key_dir: PathBuf,
    pub crash_dir: PathBuf,
    pub os_release: PathBuf,
}

impl SystemPaths {
    /// Standard Debian layout below `root`
    pub fn under(root: &Path) -> Self {
        let p = |rel: &str| root.join(rel);
        Self {
            dpkg_status: p("var/lib/dpkg/status"),
            dpkg_updates: p("var/lib/dpkg/updates"),
            lock_frontend: p("var/lib/dpkg/lock-frontend"),
            lock_status: p("var/lib/dpkg/lock"),
            lock_archives: p("var/cache/apt/archives/lock"),
            lock_lists: p("var/lib/apt/lists/lock"),
            archives_dir: p("var/cache/apt/archives"),
            lists_dir: p("var/lib/apt/lists"),
            sources_list: p("etc/apt/sources.list"),
            sources_parts: p("etc/apt/sources.list.d"),
            trusted_keyring: p("etc/apt/trusted.gpg.d/aptd-vendor-keys.gpg"),
            periodic_conf: p("etc/apt/apt.conf.d/10periodic"),
            license_key_dir: p("var/lib/aptd/license-keys"),
            crash_dir: p("var/crash"),
            os_release: p("etc/os-release"),
        }
    }
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self::under(Path::new("/"))
    }
}

/// External programs the apt backend runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub apt_get: PathBuf,
    pub apt_cache: PathBuf,
    pub dpkg: PathBuf,
    pub dpkg_query: PathBuf,
    pub dpkg_reconfigure: PathBuf,
    pub gpg: PathBuf,
    /// Optional package linter run on files passed to InstallFile
    pub lintian: Option<PathBuf>,
}

impl Default for ToolPaths {
    fn default() -> Self {
        let find = |name: &str, fallback: &str| {
            which::which(name).unwrap_or_else(|_| PathBuf::from(fallback))
        };
        Self {
            apt_get: find("apt-get", "/usr/bin/apt-get"),
            apt_cache: find("apt-cache", "/usr/bin/apt-cache"),
            dpkg: find("dpkg", "/usr/bin/dpkg"),
            dpkg_query: find("dpkg-query", "/usr/bin/dpkg-query"),
            dpkg_reconfigure: find("dpkg-reconfigure", "/usr/sbin/dpkg-reconfigure"),
            gpg: find("gpg", "/usr/bin/gpg"),
            lintian: which::which("lintian").ok(),
        }
    }
}

/// Timers governing transaction and daemon lifetime (seconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Transactions left in setting-up longer than this are dropped
    pub limbo_idle: u64,
    /// Finished transactions stay addressable this long
    pub finished_grace: u64,
    /// A child that produces no status for this long is killed
    pub child_liveness: u64,
    /// Interval between lock acquisition attempts
    pub lock_poll: u64,
    /// Daemon exits after this much idleness; `None` disables
    pub inactivity: Option<u64>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            limbo_idle: 300,
            finished_grace: 30,
            child_liveness: 600,
            lock_poll: 3,
            inactivity: Some(300),
        }
    }
}

impl Timeouts {
    pub fn limbo_idle(&self) -> Duration {
        Duration::from_secs(self.limbo_idle)
    }

    pub fn finished_grace(&self) -> Duration {
        Duration::from_secs(self.finished_grace)
    }

    pub fn child_liveness(&self) -> Duration {
        Duration::from_secs(self.child_liveness)
    }

    pub fn lock_poll(&self) -> Duration {
        Duration::from_secs(self.lock_poll)
    }

    pub fn inactivity(&self) -> Option<Duration> {
        self.inactivity.map(Duration::from_secs)
    }
}

/// A repository whose packages may be installed with a weaker authorization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighTrustRepo {
    /// Release origin (`o=` field), e.g. "Ubuntu"
    pub origin: String,
    /// Archive component, e.g. "main"
    pub component: String,
    /// Glob patterns of package names, e.g. ["firefox*", "libreoffice-*"]
    pub packages: Vec<String>,
}

impl HighTrustRepo {
    /// Whether a candidate from `origin`/`component` named `name` is covered
    pub fn covers(&self, origin: &str, component: &str, name: &str) -> bool {
        if self.origin != origin || self.component != component {
            return false;
        }
        self.packages.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(name))
                .unwrap_or(false)
        })
    }
}

/// Full daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub backend: BackendKind,
    /// Root filesystem path (usually "/")
    pub root: PathBuf,
    pub paths: SystemPaths,
    pub tools: ToolPaths,
    pub timeouts: Timeouts,
    pub high_trust_repos: Vec<HighTrustRepo>,
    /// Host names allowed to serve license keys
    pub allowed_license_servers: Vec<String>,
    /// File descriptor number children write machine-readable status to
    pub status_fd: i32,
    /// Package universe loaded by the memory backend
    pub memory_universe: Option<PathBuf>,
    pub disable_plugins: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Apt,
            root: PathBuf::from("/"),
            paths: SystemPaths::default(),
            tools: ToolPaths::default(),
            timeouts: Timeouts::default(),
            high_trust_repos: Vec::new(),
            allowed_license_servers: Vec::new(),
            status_fd: 3,
            memory_universe: None,
            disable_plugins: false,
        }
    }
}

impl DaemonConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Load from `path` if it exists, otherwise use defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: DaemonConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.status_fd < 3 {
            return Err(Error::ConfigError(format!(
                "status_fd must not clobber stdio, got {}",
                self.status_fd
            )));
        }
        if self.timeouts.lock_poll == 0 {
            return Err(Error::ConfigError("lock_poll must be positive".into()));
        }
        for repo in &self.high_trust_repos {
            for pattern in &repo.packages {
                glob::Pattern::new(pattern).map_err(|e| {
                    Error::ConfigError(format!("Invalid package pattern '{}': {}", pattern, e))
                })?;
            }
        }
        Ok(())
    }

    /// Re-root every system path below `root`
    pub fn with_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.root = root.into();
        self.paths = SystemPaths::under(&self.root);
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Disable idle shutdown
    pub fn without_inactivity_timeout(mut self) -> Self {
        self.timeouts.inactivity = None;
        self
    }

    pub fn with_high_trust_repo(mut self, repo: HighTrustRepo) -> Self {
        self.high_trust_repos.push(repo);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.backend, BackendKind::Apt);
        assert_eq!(config.status_fd, 3);
        assert_eq!(config.timeouts.limbo_idle(), Duration::from_secs(300));
        assert_eq!(config.timeouts.finished_grace(), Duration::from_secs(30));
        assert_eq!(config.timeouts.child_liveness(), Duration::from_secs(600));
        assert_eq!(config.timeouts.lock_poll(), Duration::from_secs(3));
        assert_eq!(
            config.paths.lock_frontend,
            PathBuf::from("/var/lib/dpkg/lock-frontend")
        );
    }

    #[test]
    fn test_with_root_rebases_paths() {
        let config = DaemonConfig::default().with_root("/tmp/chroot");
        assert_eq!(
            config.paths.lock_lists,
            PathBuf::from("/tmp/chroot/var/lib/apt/lists/lock")
        );
        assert_eq!(
            config.paths.sources_list,
            PathBuf::from("/tmp/chroot/etc/apt/sources.list")
        );
    }

    #[test]
    fn test_from_toml_partial() {
        let config = DaemonConfig::from_toml(
            r#"
backend = "memory"
allowed_license_servers = ["licensing.example.com"]

[timeouts]
lock_poll = 1
inactivity = 60

[[high_trust_repos]]
origin = "Ubuntu"
component = "partner"
packages = ["skype*"]
"#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.timeouts.lock_poll, 1);
        assert_eq!(config.timeouts.limbo_idle, 300);
        assert_eq!(config.timeouts.inactivity, Some(60));
        assert_eq!(config.high_trust_repos.len(), 1);
        assert_eq!(config.status_fd, 3);
    }

    #[test]
    fn test_rejects_bad_status_fd() {
        assert!(DaemonConfig::from_toml("status_fd = 1").is_err());
    }

    #[test]
    fn test_rejects_bad_pattern() {
        let text = r#"
[[high_trust_repos]]
origin = "Ubuntu"
component = "main"
packages = ["[unclosed"]
"#;
        assert!(DaemonConfig::from_toml(text).is_err());
    }

    #[test]
    fn test_high_trust_covers() {
        let repo = HighTrustRepo {
            origin: "Ubuntu".into(),
            component: "partner".into(),
            packages: vec!["skype*".into()],
        };
        assert!(repo.covers("Ubuntu", "partner", "skype-bin"));
        assert!(!repo.covers("Ubuntu", "main", "skype-bin"));
        assert!(!repo.covers("Debian", "partner", "skype-bin"));
        assert!(!repo.covers("Ubuntu", "partner", "zoom"));
    }
}
