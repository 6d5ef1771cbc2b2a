// src/enums.rs

//! Enumerations shared by the daemon, the worker and D-Bus clients
//!
//! Every value has a stable string identifier which is what travels over
//! the bus (`role-install-packages`, `status-waiting`, `exit-success`, ...)
//! plus a short human readable text.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

/// The kind of work a transaction performs
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    IntoStaticStr,
    EnumIter,
)]
pub enum Role {
    #[default]
    #[strum(serialize = "role-unset")]
    #[serde(rename = "role-unset")]
    Unset,
    #[strum(serialize = "role-install-packages")]
    #[serde(rename = "role-install-packages")]
    InstallPackages,
    #[strum(serialize = "role-install-file")]
    #[serde(rename = "role-install-file")]
    InstallFile,
    #[strum(serialize = "role-upgrade-packages")]
    #[serde(rename = "role-upgrade-packages")]
    UpgradePackages,
    #[strum(serialize = "role-upgrade-system")]
    #[serde(rename = "role-upgrade-system")]
    UpgradeSystem,
    #[strum(serialize = "role-update-cache")]
    #[serde(rename = "role-update-cache")]
    UpdateCache,
    #[strum(serialize = "role-remove-packages")]
    #[serde(rename = "role-remove-packages")]
    RemovePackages,
    #[strum(serialize = "role-commit-packages")]
    #[serde(rename = "role-commit-packages")]
    CommitPackages,
    #[strum(serialize = "role-add-vendor-key-file")]
    #[serde(rename = "role-add-vendor-key-file")]
    AddVendorKeyFile,
    #[strum(serialize = "role-add-vendor-key-from-keyserver")]
    #[serde(rename = "role-add-vendor-key-from-keyserver")]
    AddVendorKeyFromKeyserver,
    #[strum(serialize = "role-remove-vendor-key")]
    #[serde(rename = "role-remove-vendor-key")]
    RemoveVendorKey,
    #[strum(serialize = "role-fix-incomplete-install")]
    #[serde(rename = "role-fix-incomplete-install")]
    FixIncompleteInstall,
    #[strum(serialize = "role-fix-broken-depends")]
    #[serde(rename = "role-fix-broken-depends")]
    FixBrokenDepends,
    #[strum(serialize = "role-add-repository")]
    #[serde(rename = "role-add-repository")]
    AddRepository,
    #[strum(serialize = "role-enable-distro-component")]
    #[serde(rename = "role-enable-distro-component")]
    EnableDistroComponent,
    #[strum(serialize = "role-clean")]
    #[serde(rename = "role-clean")]
    Clean,
    #[strum(serialize = "role-reconfigure")]
    #[serde(rename = "role-reconfigure")]
    Reconfigure,
    #[strum(serialize = "role-add-license-key")]
    #[serde(rename = "role-add-license-key")]
    AddLicenseKey,
    #[strum(serialize = "role-query")]
    #[serde(rename = "role-query")]
    Query,
}

impl Role {
    /// Present-progressive description shown while the transaction runs
    pub fn text(&self) -> &'static str {
        match self {
            Role::Unset => "Unknown",
            Role::InstallPackages => "Installing packages",
            Role::InstallFile => "Installing file",
            Role::UpgradePackages => "Upgrading packages",
            Role::UpgradeSystem => "Upgrading system",
            Role::UpdateCache => "Refreshing software list",
            Role::RemovePackages => "Removing packages",
            Role::CommitPackages => "Applying changes",
            Role::AddVendorKeyFile => "Adding key from file",
            Role::AddVendorKeyFromKeyserver => "Downloading and adding key",
            Role::RemoveVendorKey => "Removing trusted key",
            Role::FixIncompleteInstall => "Repairing incomplete installation",
            Role::FixBrokenDepends => "Repairing software packages",
            Role::AddRepository => "Adding software source",
            Role::EnableDistroComponent => "Enabling component of the distribution",
            Role::Clean => "Removing downloaded package files",
            Role::Reconfigure => "Reconfiguring installed packages",
            Role::AddLicenseKey => "Adding license key",
            Role::Query => "Searching",
        }
    }

    /// Headline used when a transaction of this role fails
    pub fn error_text(&self) -> &'static str {
        match self {
            Role::Unset => "The transaction failed",
            Role::InstallPackages => "Installation of software failed",
            Role::InstallFile => "Installation of the package file failed",
            Role::UpgradePackages => "Upgrade of software failed",
            Role::UpgradeSystem => "Upgrade of the system failed",
            Role::UpdateCache => "Refreshing the software list failed",
            Role::RemovePackages => "Removal of software failed",
            Role::CommitPackages => "Applying software changes failed",
            Role::AddVendorKeyFile | Role::AddVendorKeyFromKeyserver => "Adding the key failed",
            Role::RemoveVendorKey => "Removing the key failed",
            Role::FixIncompleteInstall => "Repairing incomplete installation failed",
            Role::FixBrokenDepends => "Repairing of software failed",
            Role::AddRepository => "Adding the software source failed",
            Role::EnableDistroComponent => "Enabling the component failed",
            Role::Clean => "Removing downloaded package files failed",
            Role::Reconfigure => "Reconfiguration of packages failed",
            Role::AddLicenseKey => "Adding the license key failed",
            Role::Query => "Search failed",
        }
    }

    /// Roles that change the installed package set through the resolver
    pub fn changes_packages(&self) -> bool {
        matches!(
            self,
            Role::InstallPackages
                | Role::RemovePackages
                | Role::UpgradePackages
                | Role::CommitPackages
                | Role::UpgradeSystem
                | Role::FixBrokenDepends
                | Role::InstallFile
        )
    }

    /// Roles which refuse to run on top of an interrupted dpkg run
    pub fn needs_clean_journal(&self) -> bool {
        self.changes_packages() || matches!(self, Role::Reconfigure)
    }
}

/// Lifecycle status of a transaction
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    IntoStaticStr,
    EnumIter,
)]
pub enum Status {
    #[default]
    #[strum(serialize = "status-setting-up")]
    #[serde(rename = "status-setting-up")]
    SettingUp,
    #[strum(serialize = "status-authenticating")]
    #[serde(rename = "status-authenticating")]
    Authenticating,
    #[strum(serialize = "status-query")]
    #[serde(rename = "status-query")]
    Query,
    #[strum(serialize = "status-waiting")]
    #[serde(rename = "status-waiting")]
    Waiting,
    #[strum(serialize = "status-waiting-medium")]
    #[serde(rename = "status-waiting-medium")]
    WaitingMedium,
    #[strum(serialize = "status-waiting-config-file-prompt")]
    #[serde(rename = "status-waiting-config-file-prompt")]
    WaitingConfigFilePrompt,
    #[strum(serialize = "status-waiting-lock")]
    #[serde(rename = "status-waiting-lock")]
    WaitingLock,
    #[strum(serialize = "status-running")]
    #[serde(rename = "status-running")]
    Running,
    #[strum(serialize = "status-loading-cache")]
    #[serde(rename = "status-loading-cache")]
    LoadingCache,
    #[strum(serialize = "status-downloading-repo")]
    #[serde(rename = "status-downloading-repo")]
    DownloadingRepo,
    #[strum(serialize = "status-downloading")]
    #[serde(rename = "status-downloading")]
    Downloading,
    #[strum(serialize = "status-committing")]
    #[serde(rename = "status-committing")]
    Committing,
    #[strum(serialize = "status-cleaning-up")]
    #[serde(rename = "status-cleaning-up")]
    CleaningUp,
    #[strum(serialize = "status-resolving-dep")]
    #[serde(rename = "status-resolving-dep")]
    ResolvingDep,
    #[strum(serialize = "status-cancelling")]
    #[serde(rename = "status-cancelling")]
    Cancelling,
    #[strum(serialize = "status-finished")]
    #[serde(rename = "status-finished")]
    Finished,
}

impl Status {
    pub fn text(&self) -> &'static str {
        match self {
            Status::SettingUp => "Waiting for service to start",
            Status::Authenticating => "Waiting for authentication",
            Status::Query => "Searching",
            Status::Waiting => "Waiting for other software managers to quit",
            Status::WaitingMedium => "Waiting for required medium",
            Status::WaitingConfigFilePrompt => "Waiting for configuration file prompt",
            Status::WaitingLock => "Waiting for other software managers to quit",
            Status::Running => "Running task",
            Status::LoadingCache => "Loading software list",
            Status::DownloadingRepo => "Downloading package lists",
            Status::Downloading => "Downloading",
            Status::Committing => "Applying changes",
            Status::CleaningUp => "Cleaning up",
            Status::ResolvingDep => "Resolving dependencies",
            Status::Cancelling => "Cancelling",
            Status::Finished => "Finished",
        }
    }

    /// The transaction is blocked on something outside the daemon
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            Status::Waiting
                | Status::WaitingMedium
                | Status::WaitingConfigFilePrompt
                | Status::WaitingLock
        )
    }
}

/// Final outcome of a transaction
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    IntoStaticStr,
    EnumIter,
)]
pub enum ExitState {
    #[default]
    #[strum(serialize = "exit-unfinished")]
    #[serde(rename = "exit-unfinished")]
    Unfinished,
    #[strum(serialize = "exit-success")]
    #[serde(rename = "exit-success")]
    Success,
    #[strum(serialize = "exit-cancelled")]
    #[serde(rename = "exit-cancelled")]
    Cancelled,
    #[strum(serialize = "exit-failed")]
    #[serde(rename = "exit-failed")]
    Failed,
    #[strum(serialize = "exit-previous-failed")]
    #[serde(rename = "exit-previous-failed")]
    PreviousFailed,
}

impl ExitState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ExitState::Unfinished)
    }

    pub fn text(&self) -> &'static str {
        match self {
            ExitState::Unfinished => "Unfinished",
            ExitState::Success => "Successful",
            ExitState::Cancelled => "Canceled",
            ExitState::Failed => "Failed",
            ExitState::PreviousFailed => "Previous transaction failed",
        }
    }
}

/// Classification of transaction failures
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    IntoStaticStr,
    EnumIter,
)]
pub enum ErrorKind {
    #[strum(serialize = "error-not-authorized")]
    #[serde(rename = "error-not-authorized")]
    NotAuthorized,
    #[strum(serialize = "error-auth-failed")]
    #[serde(rename = "error-auth-failed")]
    AuthFailed,
    #[strum(serialize = "error-no-lock")]
    #[serde(rename = "error-no-lock")]
    NoLock,
    #[strum(serialize = "error-no-cache")]
    #[serde(rename = "error-no-cache")]
    NoCache,
    #[strum(serialize = "error-cache-broken")]
    #[serde(rename = "error-cache-broken")]
    CacheBroken,
    #[strum(serialize = "error-dep-resolution-failed")]
    #[serde(rename = "error-dep-resolution-failed")]
    DepResolutionFailed,
    #[strum(serialize = "error-no-package")]
    #[serde(rename = "error-no-package")]
    NoPackage,
    #[strum(serialize = "error-package-not-installed")]
    #[serde(rename = "error-package-not-installed")]
    PackageNotInstalled,
    #[strum(serialize = "error-package-already-installed")]
    #[serde(rename = "error-package-already-installed")]
    PackageAlreadyInstalled,
    #[strum(serialize = "error-package-up-to-date")]
    #[serde(rename = "error-package-up-to-date")]
    PackageUpToDate,
    #[strum(serialize = "error-not-remove-essential-package")]
    #[serde(rename = "error-not-remove-essential-package")]
    NotRemoveEssentialPackage,
    #[strum(serialize = "error-package-download-failed")]
    #[serde(rename = "error-package-download-failed")]
    PackageDownloadFailed,
    #[strum(serialize = "error-repo-download-failed")]
    #[serde(rename = "error-repo-download-failed")]
    RepoDownloadFailed,
    #[strum(serialize = "error-package-unauthenticated")]
    #[serde(rename = "error-package-unauthenticated")]
    PackageUnauthenticated,
    #[strum(serialize = "error-key-not-installed")]
    #[serde(rename = "error-key-not-installed")]
    KeyNotInstalled,
    #[strum(serialize = "error-key-not-removed")]
    #[serde(rename = "error-key-not-removed")]
    KeyNotRemoved,
    #[strum(serialize = "error-package-manager-failed")]
    #[serde(rename = "error-package-manager-failed")]
    PackageManagerFailed,
    #[strum(serialize = "error-incomplete-install")]
    #[serde(rename = "error-incomplete-install")]
    IncompleteInstall,
    #[strum(serialize = "error-unreadable-package-file")]
    #[serde(rename = "error-unreadable-package-file")]
    UnreadablePackageFile,
    #[strum(serialize = "error-invalid-package-file")]
    #[serde(rename = "error-invalid-package-file")]
    InvalidPackageFile,
    #[strum(serialize = "error-license-key-install-failed")]
    #[serde(rename = "error-license-key-install-failed")]
    LicenseKeyInstallFailed,
    #[strum(serialize = "error-repository-invalid")]
    #[serde(rename = "error-repository-invalid")]
    RepositoryInvalid,
    #[strum(serialize = "error-daemon-died")]
    #[serde(rename = "error-daemon-died")]
    DaemonDied,
    #[strum(serialize = "error-unknown")]
    #[serde(rename = "error-unknown")]
    Unknown,
}

impl ErrorKind {
    pub fn text(&self) -> &'static str {
        match self {
            ErrorKind::NotAuthorized => "Not authorized",
            ErrorKind::AuthFailed => "Authentication failed",
            ErrorKind::NoLock => "Failed to lock the package manager",
            ErrorKind::NoCache => "Failed to load the package list",
            ErrorKind::CacheBroken => "Broken dependencies",
            ErrorKind::DepResolutionFailed => "Package dependencies cannot be resolved",
            ErrorKind::NoPackage => "Package does not exist",
            ErrorKind::PackageNotInstalled => "Package is not installed",
            ErrorKind::PackageAlreadyInstalled => "Package is already installed",
            ErrorKind::PackageUpToDate => "Package is already up to date",
            ErrorKind::NotRemoveEssentialPackage => "Essential package could not be removed",
            ErrorKind::PackageDownloadFailed => "Failed to download package files",
            ErrorKind::RepoDownloadFailed => "Failed to download package lists",
            ErrorKind::PackageUnauthenticated => "Package is not authenticated",
            ErrorKind::KeyNotInstalled => "The key was not installed",
            ErrorKind::KeyNotRemoved => "The key was not removed",
            ErrorKind::PackageManagerFailed => "Package manager failed",
            ErrorKind::IncompleteInstall => "An earlier installation was interrupted",
            ErrorKind::UnreadablePackageFile => "Package file could not be opened",
            ErrorKind::InvalidPackageFile => "Invalid package file",
            ErrorKind::LicenseKeyInstallFailed => "The license key could not be installed",
            ErrorKind::RepositoryInvalid => "The software source is invalid",
            ErrorKind::DaemonDied => "The daemon died unexpectedly",
            ErrorKind::Unknown => "An unhandled error occurred",
        }
    }
}

/// Answer to a configuration file conflict
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConflictAnswer {
    Keep,
    Replace,
}

/// State of a single item in the download list
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
    AsRefStr,
)]
pub enum DownloadStatus {
    #[default]
    #[strum(serialize = "download-idle")]
    #[serde(rename = "download-idle")]
    Idle,
    #[strum(serialize = "download-fetching")]
    #[serde(rename = "download-fetching")]
    Fetching,
    #[strum(serialize = "download-done")]
    #[serde(rename = "download-done")]
    Done,
    #[strum(serialize = "download-failed")]
    #[serde(rename = "download-failed")]
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_role_identifiers_round_trip() {
        for role in Role::iter() {
            let id = role.to_string();
            assert!(id.starts_with("role-"), "{}", id);
            assert_eq!(Role::from_str(&id).unwrap(), role);
        }
    }

    #[test]
    fn test_status_identifiers() {
        assert_eq!(Status::WaitingLock.as_ref(), "status-waiting-lock");
        assert_eq!(
            Status::from_str("status-waiting-config-file-prompt").unwrap(),
            Status::WaitingConfigFilePrompt
        );
        assert!(Status::WaitingMedium.is_waiting());
        assert!(!Status::Running.is_waiting());
    }

    #[test]
    fn test_exit_finished() {
        assert!(!ExitState::Unfinished.is_finished());
        for exit in ExitState::iter().filter(|e| *e != ExitState::Unfinished) {
            assert!(exit.is_finished());
        }
    }

    #[test]
    fn test_error_kind_serde_matches_display() {
        for kind in ErrorKind::iter() {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_conflict_answer_parse() {
        assert_eq!(ConflictAnswer::from_str("keep").unwrap(), ConflictAnswer::Keep);
        assert_eq!(ConflictAnswer::from_str("replace").unwrap(), ConflictAnswer::Replace);
        assert!(ConflictAnswer::from_str("maybe").is_err());
    }
}
