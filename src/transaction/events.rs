// src/transaction/events.rs

//! Change notifications emitted by a transaction

use super::types::{
    ConfigFileConflict, Dependencies, DownloadProgress, ProgressDetails, RequiredMedium,
    TransactionError,
};
use crate::enums::{ExitState, Role, Status};
use std::collections::BTreeMap;

/// One observable change of a transaction
///
/// Every variant except `Finished` corresponds to a property of the
/// transaction object on the bus. `Finished` is sent exactly once, right
/// after the final `Exit` change.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionEvent {
    Role(Role),
    Status(Status),
    StatusDetails(String),
    Progress(u32),
    ProgressDetails(ProgressDetails),
    ProgressDownload(DownloadProgress),
    ProgressPackage { package: String, message: String },
    Cancellable(bool),
    Paused(bool),
    TerminalAttached(bool),
    RequiredMedium(Option<RequiredMedium>),
    ConfigFileConflict(Option<ConfigFileConflict>),
    Exit(ExitState),
    Error(Option<TransactionError>),
    Dependencies(Dependencies),
    Download(u64),
    Space(i64),
    Unauthenticated(Vec<String>),
    HighTrustPackages(Vec<String>),
    AllowUnauthenticated(bool),
    RemoveObsoletedDepends(bool),
    Locale(String),
    HttpProxy(String),
    Terminal(String),
    DebconfSocket(String),
    MetaData(BTreeMap<String, String>),
    Finished(ExitState),
}

impl TransactionEvent {
    /// The bus property this event updates, `None` for `Finished`
    pub fn property_name(&self) -> Option<&'static str> {
        let name = match self {
            TransactionEvent::Role(_) => "Role",
            TransactionEvent::Status(_) => "Status",
            TransactionEvent::StatusDetails(_) => "StatusDetails",
            TransactionEvent::Progress(_) => "Progress",
            TransactionEvent::ProgressDetails(_) => "ProgressDetails",
            TransactionEvent::ProgressDownload(_) => "ProgressDownload",
            TransactionEvent::ProgressPackage { .. } => "ProgressPackage",
            TransactionEvent::Cancellable(_) => "Cancellable",
            TransactionEvent::Paused(_) => "Paused",
            TransactionEvent::TerminalAttached(_) => "TerminalAttached",
            TransactionEvent::RequiredMedium(_) => "RequiredMedium",
            TransactionEvent::ConfigFileConflict(_) => "ConfigFileConflict",
            TransactionEvent::Exit(_) => "ExitState",
            TransactionEvent::Error(_) => "Error",
            TransactionEvent::Dependencies(_) => "Dependencies",
            TransactionEvent::Download(_) => "Download",
            TransactionEvent::Space(_) => "Space",
            TransactionEvent::Unauthenticated(_) => "Unauthenticated",
            TransactionEvent::HighTrustPackages(_) => "HighTrustPackages",
            TransactionEvent::AllowUnauthenticated(_) => "AllowUnauthenticated",
            TransactionEvent::RemoveObsoletedDepends(_) => "RemoveObsoletedDepends",
            TransactionEvent::Locale(_) => "Locale",
            TransactionEvent::HttpProxy(_) => "HttpProxy",
            TransactionEvent::Terminal(_) => "Terminal",
            TransactionEvent::DebconfSocket(_) => "DebconfSocket",
            TransactionEvent::MetaData(_) => "MetaData",
            TransactionEvent::Finished(_) => return None,
        };
        Some(name)
    }
}
