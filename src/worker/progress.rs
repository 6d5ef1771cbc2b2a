// src/worker/progress.rs

//! Mapping child status lines onto a transaction's 0-100 progress
//!
//! Each phase owns a sub-range of the overall scale: downloading archives
//! 15-50, installing 50-90, refreshing the package lists 10-90. Progress
//! never moves backwards within one transaction.

use crate::enums::{DownloadStatus, Status};
use crate::runner::StatusEvent;
use crate::transaction::{DownloadProgress, Transaction};

/// A part of the overall progress scale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressRange {
    pub start: u32,
    pub end: u32,
}

impl ProgressRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Position of `percent` (0-100) inside the range
    pub fn scale(&self, percent: f64) -> u32 {
        let percent = percent.clamp(0.0, 100.0);
        let span = f64::from(self.end.saturating_sub(self.start));
        self.start + (span * percent / 100.0).round() as u32
    }
}

pub const DOWNLOAD_RANGE: ProgressRange = ProgressRange::new(15, 50);
pub const INSTALL_RANGE: ProgressRange = ProgressRange::new(50, 90);
pub const UPDATE_RANGE: ProgressRange = ProgressRange::new(10, 90);

/// What the child being watched is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// apt-get download then install
    Commit,
    /// apt-get update
    Update,
    /// dpkg run directly, `total` packages expected
    Dpkg { total: u32 },
}

/// Feeds status events into a transaction
pub struct TransactionProgress<'a> {
    trans: &'a Transaction,
    phase: Phase,
    last: u32,
    dpkg_done: u32,
}

impl<'a> TransactionProgress<'a> {
    pub fn new(trans: &'a Transaction, phase: Phase) -> Self {
        Self {
            trans,
            phase,
            last: trans.progress(),
            dpkg_done: 0,
        }
    }

    /// Move progress forward to `value`; lower values are ignored
    pub fn set(&mut self, value: u32) {
        let value = value.min(100);
        if value > self.last {
            self.last = value;
            self.trans.set_progress(value);
        }
    }

    /// Downloading one item of a larger download
    pub fn download(&mut self, item: &str, percent: f64, message: &str) {
        let (status, range) = match self.phase {
            Phase::Update => (Status::DownloadingRepo, UPDATE_RANGE),
            _ => (Status::Downloading, DOWNLOAD_RANGE),
        };
        self.trans.set_status(status);
        self.trans.set_progress_download(DownloadProgress {
            uri: item.to_string(),
            status: DownloadStatus::Fetching,
            description: message.to_string(),
            ..Default::default()
        });
        self.set(range.scale(percent));
    }

    /// The package manager is working on `package`
    ///
    /// The first call ends the cancellable part of the transaction.
    pub fn install(&mut self, package: &str, percent: f64, message: &str) {
        if self.trans.cancellable() {
            self.trans.set_cancellable(false);
        }
        self.trans.set_status(Status::Committing);
        self.trans.set_progress_package(package, message);
        self.set(INSTALL_RANGE.scale(percent));
    }

    pub fn on_event(&mut self, event: &StatusEvent) {
        match event {
            StatusEvent::Download {
                item,
                percent,
                message,
            } => self.download(item, *percent, message),
            StatusEvent::Package {
                package,
                percent,
                message,
            } => self.install(package, *percent, message),
            StatusEvent::DpkgProcessing { action, package } => {
                self.dpkg_step(package, action, false);
            }
            StatusEvent::DpkgState { package, state } => {
                let finished = matches!(state.as_str(), "installed" | "not-installed" | "config-files");
                self.dpkg_step(package, state, finished);
            }
            _ => {}
        }
    }

    fn dpkg_step(&mut self, package: &str, message: &str, finished: bool) {
        let total = match self.phase {
            Phase::Dpkg { total } => total.max(1),
            _ => return,
        };
        if finished {
            self.dpkg_done = (self.dpkg_done + 1).min(total);
        }
        let percent = f64::from(self.dpkg_done) * 100.0 / f64::from(total);
        self.install(package, percent, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::Role;
    use crate::transaction::{Caller, PackageSets, RoleArgs};

    fn trans() -> Transaction {
        Transaction::new(
            Role::InstallPackages,
            Caller::new(1, 1000, 1000),
            PackageSets::install(vec!["foo".into()]),
            RoleArgs::None,
        )
    }

    #[test]
    fn test_range_scale() {
        assert_eq!(DOWNLOAD_RANGE.scale(0.0), 15);
        assert_eq!(DOWNLOAD_RANGE.scale(100.0), 50);
        assert_eq!(INSTALL_RANGE.scale(50.0), 70);
        assert_eq!(UPDATE_RANGE.scale(250.0), 90);
    }

    #[test]
    fn test_commit_phase_events() {
        let t = trans();
        let mut progress = TransactionProgress::new(&t, Phase::Commit);
        progress.on_event(&StatusEvent::Download {
            item: "1".into(),
            percent: 50.0,
            message: "Retrieving file 1 of 2".into(),
        });
        assert_eq!(t.status(), Status::Downloading);
        assert_eq!(t.progress(), 33);
        assert!(t.cancellable());

        progress.on_event(&StatusEvent::Package {
            package: "foo".into(),
            percent: 25.0,
            message: "Unpacking foo".into(),
        });
        assert_eq!(t.status(), Status::Committing);
        assert_eq!(t.progress(), 60);
        assert!(!t.cancellable());
        assert_eq!(
            t.snapshot().progress_package,
            ("foo".to_string(), "Unpacking foo".to_string())
        );
    }

    #[test]
    fn test_progress_is_monotonic() {
        let t = trans();
        let mut progress = TransactionProgress::new(&t, Phase::Update);
        progress.download("1", 80.0, "Get:1");
        progress.download("2", 10.0, "Get:2");
        assert_eq!(t.status(), Status::DownloadingRepo);
        assert_eq!(t.progress(), UPDATE_RANGE.scale(80.0));
    }

    #[test]
    fn test_dpkg_phase_counts_packages() {
        let t = trans();
        let mut progress = TransactionProgress::new(&t, Phase::Dpkg { total: 2 });
        progress.on_event(&StatusEvent::DpkgProcessing {
            action: "install".into(),
            package: "foo".into(),
        });
        assert_eq!(t.progress(), 50);
        progress.on_event(&StatusEvent::DpkgState {
            package: "foo".into(),
            state: "installed".into(),
        });
        assert_eq!(t.progress(), 70);
    }
}
