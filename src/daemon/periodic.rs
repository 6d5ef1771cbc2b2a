// src/daemon/periodic.rs

//! `APT::Periodic` settings exported as daemon properties
//!
//! The values live in one apt configuration file (usually
//! `/etc/apt/apt.conf.d/10periodic`) as lines of the form
//! `APT::Periodic::Update-Package-Lists "1";`. Writing a value replaces the
//! matching line or appends a new one; every other line is kept as is.

use crate::error::{Error, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use strum_macros::{Display, EnumIter};
use tracing::info;

static SETTING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(APT::Periodic::[A-Za-z-]+)\s+"([^"]*)"\s*;"#).expect("valid regex")
});

/// A periodic setting and the property name it is exported as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum PeriodicKey {
    /// Days between package list refreshes, 0 disables
    AutoUpdateInterval,
    /// Download upgradable packages in the background
    AutoDownload,
    /// Days between cleanups of the archive cache, 0 disables
    AutoCleanInterval,
    /// Days between unattended upgrades, 0 disables
    UnattendedUpgrade,
}

impl PeriodicKey {
    pub fn apt_key(&self) -> &'static str {
        match self {
            PeriodicKey::AutoUpdateInterval => "APT::Periodic::Update-Package-Lists",
            PeriodicKey::AutoDownload => "APT::Periodic::Download-Upgradeable-Packages",
            PeriodicKey::AutoCleanInterval => "APT::Periodic::AutocleanInterval",
            PeriodicKey::UnattendedUpgrade => "APT::Periodic::Unattended-Upgrade",
        }
    }

    /// Whether the property is a boolean on the bus
    pub fn is_flag(&self) -> bool {
        matches!(self, PeriodicKey::AutoDownload)
    }

    pub fn from_property(name: &str) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|k| k.to_string() == name)
    }
}

/// The configuration file holding the periodic settings
#[derive(Debug, Clone)]
pub struct PeriodicConfig {
    path: PathBuf,
}

impl PeriodicConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(text.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::IoError(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Current value; unset or unparsable values read as 0
    pub fn get(&self, key: PeriodicKey) -> Result<i32> {
        let value = self
            .read_lines()?
            .iter()
            .filter_map(|line| SETTING_RE.captures(line))
            .filter(|caps| &caps[1] == key.apt_key())
            .last()
            .and_then(|caps| caps[2].trim().parse().ok())
            .unwrap_or(0);
        Ok(value)
    }

    /// Store a value; returns whether the file changed
    pub fn set(&self, key: PeriodicKey, value: i32) -> Result<bool> {
        if value < 0 {
            return Err(Error::InvalidArgument(format!(
                "{} must not be negative",
                key
            )));
        }
        let new_line = format!("{} \"{}\";", key.apt_key(), value);
        let mut lines = self.read_lines()?;
        let mut found = false;
        for line in lines.iter_mut() {
            let matches = SETTING_RE
                .captures(line)
                .is_some_and(|caps| &caps[1] == key.apt_key());
            if matches {
                if *line == new_line {
                    return Ok(false);
                }
                *line = new_line.clone();
                found = true;
            }
        }
        if !found {
            lines.push(new_line);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut text = lines.join("\n");
        text.push('\n');
        std::fs::write(&self.path, text)?;
        info!("Set {} to {} in {}", key.apt_key(), value, self.path.display());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_existing_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("10periodic");
        std::fs::write(
            &path,
            "APT::Periodic::Update-Package-Lists \"1\";\n\
             APT::Periodic::Download-Upgradeable-Packages \"0\";\n\
             // APT::Periodic::AutocleanInterval \"7\";\n",
        )
        .unwrap();
        let config = PeriodicConfig::new(&path);
        assert_eq!(config.get(PeriodicKey::AutoUpdateInterval).unwrap(), 1);
        assert_eq!(config.get(PeriodicKey::AutoDownload).unwrap(), 0);
        assert_eq!(config.get(PeriodicKey::AutoCleanInterval).unwrap(), 0);
    }

    #[test]
    fn test_set_replaces_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apt.conf.d/10periodic");
        let config = PeriodicConfig::new(&path);
        assert_eq!(config.get(PeriodicKey::UnattendedUpgrade).unwrap(), 0);

        assert!(config.set(PeriodicKey::AutoUpdateInterval, 1).unwrap());
        assert!(config.set(PeriodicKey::AutoUpdateInterval, 7).unwrap());
        assert!(!config.set(PeriodicKey::AutoUpdateInterval, 7).unwrap());
        assert!(config.set(PeriodicKey::UnattendedUpgrade, 1).unwrap());

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "APT::Periodic::Update-Package-Lists \"7\";\nAPT::Periodic::Unattended-Upgrade \"1\";\n"
        );
        assert!(config.set(PeriodicKey::AutoCleanInterval, -1).is_err());
    }

    #[test]
    fn test_property_names() {
        assert_eq!(
            PeriodicKey::from_property("AutoDownload"),
            Some(PeriodicKey::AutoDownload)
        );
        assert!(PeriodicKey::AutoDownload.is_flag());
        assert_eq!(PeriodicKey::from_property("PopConParticipation"), None);
    }
}
