// src/dbus/transaction.rs

//! The `org.debian.apt.transaction` object
//!
//! One object per transaction, exported at its tid. Methods and writable
//! properties are restricted to the creator; reading is open to everyone.
//! Every [`TransactionEvent`] is forwarded as a `PropertyChanged` signal,
//! followed by exactly one `Finished`.

use super::caller::caller_from_header;
use super::error::{property_error, AptdError};
use crate::daemon::DaemonState;
use crate::enums::ConflictAnswer;
use crate::transaction::{
    ConfigFileConflict, Dependencies, DownloadProgress, ProgressDetails, RequiredMedium,
    Transaction, TransactionError, TransactionEvent,
};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use zbus::fdo;
use zbus::message::Header;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedObjectPath, Value};
use zbus::Connection;

type ProgressTuple = (u32, u32, u64, u64, f64, u64);
type DownloadTuple = (String, String, String, u64, u64, String);
type PackagesTuple = (
    Vec<String>,
    Vec<String>,
    Vec<String>,
    Vec<String>,
    Vec<String>,
    Vec<String>,
);
type DependenciesTuple = (
    Vec<String>,
    Vec<String>,
    Vec<String>,
    Vec<String>,
    Vec<String>,
    Vec<String>,
    Vec<String>,
);

fn progress_tuple(d: &ProgressDetails) -> ProgressTuple {
    (d.items_done, d.items_total, d.bytes_done, d.bytes_total, d.speed, d.eta)
}

fn download_tuple(d: &DownloadProgress) -> DownloadTuple {
    (
        d.uri.clone(),
        d.status.to_string(),
        d.description.clone(),
        d.size,
        d.downloaded,
        d.message.clone(),
    )
}

fn medium_tuple(medium: Option<&RequiredMedium>) -> (String, String) {
    medium
        .map(|m| (m.label.clone(), m.drive.clone()))
        .unwrap_or_default()
}

fn conflict_tuple(conflict: Option<&ConfigFileConflict>) -> (String, String) {
    conflict
        .map(|c| (c.old.clone(), c.new.clone()))
        .unwrap_or_default()
}

fn error_tuple(error: Option<&TransactionError>) -> (String, String) {
    error
        .map(|e| (e.kind.to_string(), e.details.clone()))
        .unwrap_or_default()
}

fn dependencies_tuple(d: &Dependencies) -> DependenciesTuple {
    let [install, reinstall, remove, purge, upgrade, downgrade, kept] = d.to_tuple();
    (install, reinstall, remove, purge, upgrade, downgrade, kept)
}

fn metadata_map(metadata: &BTreeMap<String, String>) -> HashMap<String, String> {
    metadata
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// The new value of the property an event changed
fn event_value(event: &TransactionEvent) -> Value<'static> {
    match event {
        TransactionEvent::Role(role) => Value::from(role.to_string()),
        TransactionEvent::Status(status) => Value::from(status.to_string()),
        TransactionEvent::StatusDetails(details) => Value::from(details.clone()),
        TransactionEvent::Progress(progress) => Value::from(*progress),
        TransactionEvent::ProgressDetails(details) => Value::from(progress_tuple(details)),
        TransactionEvent::ProgressDownload(download) => Value::from(download_tuple(download)),
        TransactionEvent::ProgressPackage { package, message } => {
            Value::from((package.clone(), message.clone()))
        }
        TransactionEvent::Cancellable(flag)
        | TransactionEvent::Paused(flag)
        | TransactionEvent::TerminalAttached(flag)
        | TransactionEvent::AllowUnauthenticated(flag)
        | TransactionEvent::RemoveObsoletedDepends(flag) => Value::from(*flag),
        TransactionEvent::RequiredMedium(medium) => Value::from(medium_tuple(medium.as_ref())),
        TransactionEvent::ConfigFileConflict(conflict) => {
            Value::from(conflict_tuple(conflict.as_ref()))
        }
        TransactionEvent::Exit(exit) | TransactionEvent::Finished(exit) => {
            Value::from(exit.to_string())
        }
        TransactionEvent::Error(error) => Value::from(error_tuple(error.as_ref())),
        TransactionEvent::Dependencies(depends) => Value::from(dependencies_tuple(depends)),
        TransactionEvent::Download(bytes) => Value::from(*bytes),
        TransactionEvent::Space(bytes) => Value::from(*bytes),
        TransactionEvent::Unauthenticated(names) | TransactionEvent::HighTrustPackages(names) => {
            Value::from(names.clone())
        }
        TransactionEvent::Locale(text)
        | TransactionEvent::HttpProxy(text)
        | TransactionEvent::Terminal(text)
        | TransactionEvent::DebconfSocket(text) => Value::from(text.clone()),
        TransactionEvent::MetaData(metadata) => Value::from(metadata_map(metadata)),
    }
}

pub struct TransactionInterface {
    state: Arc<DaemonState>,
    trans: Arc<Transaction>,
}

impl TransactionInterface {
    /// Identify the caller and make sure it created the transaction
    async fn owner(
        &self,
        connection: &Connection,
        header: &Header<'_>,
    ) -> fdo::Result<crate::transaction::Caller> {
        let caller = caller_from_header(connection, header).await?;
        self.trans
            .check_owner(caller.uid)
            .map_err(property_error)?;
        self.state.touch();
        Ok(caller)
    }
}

#[zbus::interface(name = "org.debian.apt.transaction")]
impl TransactionInterface {
    async fn run(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> Result<(), AptdError> {
        let caller = caller_from_header(connection, &header).await?;
        self.state.run(&self.trans, &caller).await?;
        Ok(())
    }

    async fn run_after(
        &self,
        tid: OwnedObjectPath,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> Result<(), AptdError> {
        let caller = caller_from_header(connection, &header).await?;
        self.state
            .run_after(&self.trans, &caller, tid.as_str())
            .await?;
        Ok(())
    }

    async fn simulate(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> Result<(), AptdError> {
        let caller = caller_from_header(connection, &header).await?;
        self.state.simulate(&self.trans, &caller).await?;
        Ok(())
    }

    async fn cancel(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> Result<(), AptdError> {
        let caller = caller_from_header(connection, &header).await?;
        self.state.cancel(&self.trans, &caller).await?;
        Ok(())
    }

    async fn provide_medium(
        &self,
        medium: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> Result<(), AptdError> {
        let caller = caller_from_header(connection, &header).await?;
        self.state.provide_medium(&self.trans, &caller, &medium)?;
        Ok(())
    }

    async fn resolve_config_file_conflict(
        &self,
        config: String,
        answer: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> Result<(), AptdError> {
        let answer = ConflictAnswer::from_str(&answer).map_err(|_| {
            AptdError::InvalidArguments(format!("Answer must be keep or replace, got '{}'", answer))
        })?;
        let caller = caller_from_header(connection, &header).await?;
        self.state
            .resolve_config_file_conflict(&self.trans, &caller, &config, answer)?;
        Ok(())
    }

    #[zbus(signal)]
    async fn property_changed(
        emitter: &SignalEmitter<'_>,
        property: &str,
        value: Value<'_>,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn finished(emitter: &SignalEmitter<'_>, exit: &str) -> zbus::Result<()>;

    #[zbus(property)]
    fn tid(&self) -> String {
        self.trans.tid().to_string()
    }

    #[zbus(property)]
    fn role(&self) -> String {
        self.trans.role().to_string()
    }

    #[zbus(property)]
    fn status(&self) -> String {
        self.trans.status().to_string()
    }

    #[zbus(property)]
    fn status_details(&self) -> String {
        self.trans.with_state(|s| s.status_details.clone())
    }

    #[zbus(property)]
    fn progress(&self) -> u32 {
        self.trans.progress()
    }

    #[zbus(property)]
    fn progress_details(&self) -> ProgressTuple {
        self.trans.with_state(|s| progress_tuple(&s.progress_details))
    }

    #[zbus(property)]
    fn progress_download(&self) -> DownloadTuple {
        self.trans.with_state(|s| download_tuple(&s.progress_download))
    }

    #[zbus(property)]
    fn progress_package(&self) -> (String, String) {
        self.trans.with_state(|s| s.progress_package.clone())
    }

    #[zbus(property)]
    fn cancellable(&self) -> bool {
        self.trans.cancellable()
    }

    #[zbus(property)]
    fn terminal_attached(&self) -> bool {
        self.trans.with_state(|s| s.terminal_attached)
    }

    #[zbus(property)]
    fn paused(&self) -> bool {
        self.trans.paused()
    }

    #[zbus(property)]
    fn required_medium(&self) -> (String, String) {
        self.trans
            .with_state(|s| medium_tuple(s.required_medium.as_ref()))
    }

    #[zbus(property)]
    fn config_file_conflict(&self) -> (String, String) {
        self.trans
            .with_state(|s| conflict_tuple(s.config_file_conflict.as_ref()))
    }

    #[zbus(property)]
    fn exit_state(&self) -> String {
        self.trans.exit().to_string()
    }

    #[zbus(property)]
    fn error(&self) -> (String, String) {
        error_tuple(self.trans.error().as_ref())
    }

    #[zbus(property)]
    fn packages(&self) -> PackagesTuple {
        let [install, reinstall, remove, purge, upgrade, downgrade] =
            self.trans.packages().to_tuple();
        (install, reinstall, remove, purge, upgrade, downgrade)
    }

    #[zbus(property)]
    fn dependencies(&self) -> DependenciesTuple {
        self.trans.with_state(|s| dependencies_tuple(&s.depends))
    }

    #[zbus(property)]
    fn download(&self) -> u64 {
        self.trans.with_state(|s| s.download)
    }

    #[zbus(property)]
    fn space(&self) -> i64 {
        self.trans.with_state(|s| s.space)
    }

    #[zbus(property)]
    fn unauthenticated(&self) -> Vec<String> {
        self.trans.with_state(|s| s.unauthenticated.clone())
    }

    #[zbus(property)]
    fn high_trust_packages(&self) -> Vec<String> {
        self.trans.with_state(|s| s.high_trust_packages.clone())
    }

    #[zbus(property)]
    fn uid(&self) -> u32 {
        self.trans.uid()
    }

    #[zbus(property)]
    fn gid(&self) -> u32 {
        self.trans.caller().gid
    }

    #[zbus(property)]
    fn allow_unauthenticated(&self) -> bool {
        self.trans.with_state(|s| s.allow_unauthenticated)
    }

    #[zbus(property)]
    async fn set_allow_unauthenticated(
        &self,
        allow: bool,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.owner(connection, &header).await?;
        self.trans
            .set_allow_unauthenticated(allow)
            .map_err(property_error)
    }

    #[zbus(property)]
    fn remove_obsoleted_depends(&self) -> bool {
        self.trans.with_state(|s| s.remove_obsoleted_depends)
    }

    #[zbus(property)]
    async fn set_remove_obsoleted_depends(
        &self,
        remove: bool,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.owner(connection, &header).await?;
        self.trans
            .set_remove_obsoleted_depends(remove)
            .map_err(property_error)
    }

    #[zbus(property)]
    fn locale(&self) -> String {
        self.trans.with_state(|s| s.locale.clone())
    }

    #[zbus(property)]
    async fn set_locale(
        &self,
        locale: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.owner(connection, &header).await?;
        self.trans.set_locale(&locale).map_err(property_error)
    }

    #[zbus(property)]
    fn http_proxy(&self) -> String {
        self.trans.with_state(|s| s.http_proxy.clone())
    }

    #[zbus(property)]
    async fn set_http_proxy(
        &self,
        proxy: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.owner(connection, &header).await?;
        self.trans.set_http_proxy(&proxy).map_err(property_error)
    }

    #[zbus(property)]
    fn terminal(&self) -> String {
        self.trans.with_state(|s| s.terminal.clone())
    }

    #[zbus(property)]
    async fn set_terminal(
        &self,
        terminal: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.owner(connection, &header).await?;
        self.trans.set_terminal(&terminal).map_err(property_error)
    }

    #[zbus(property)]
    fn debconf_socket(&self) -> String {
        self.trans.with_state(|s| s.debconf_socket.clone())
    }

    #[zbus(property)]
    async fn set_debconf_socket(
        &self,
        socket: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.owner(connection, &header).await?;
        self.trans
            .set_debconf_socket(&socket)
            .map_err(property_error)
    }

    #[zbus(property)]
    fn meta_data(&self) -> HashMap<String, String> {
        metadata_map(&self.trans.metadata())
    }

    /// Entries are merged into the existing ones; keys cannot be rewritten
    #[zbus(property)]
    async fn set_meta_data(
        &self,
        metadata: HashMap<String, String>,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.owner(connection, &header).await?;
        for (key, value) in &metadata {
            self.trans
                .set_metadata(key, value)
                .map_err(property_error)?;
        }
        Ok(())
    }
}

/// Export `trans` at its tid and start forwarding its events
pub async fn export(
    connection: &Connection,
    state: &Arc<DaemonState>,
    trans: Arc<Transaction>,
) -> zbus::Result<OwnedObjectPath> {
    let path = OwnedObjectPath::try_from(trans.tid().to_string())?;
    let events = trans.subscribe();
    let iface = TransactionInterface {
        state: state.clone(),
        trans,
    };
    connection.object_server().at(path.clone(), iface).await?;
    tokio::spawn(forward_events(connection.clone(), path.clone(), events));
    debug!("Exported {}", path.as_str());
    Ok(path)
}

async fn forward_events(
    connection: Connection,
    path: OwnedObjectPath,
    mut events: broadcast::Receiver<TransactionEvent>,
) {
    let emitter = match SignalEmitter::new(&connection, path) {
        Ok(emitter) => emitter,
        Err(e) => {
            warn!("Cannot emit transaction signals: {}", e);
            return;
        }
    };
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!("{}: dropped {} property changes", emitter.path(), n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let sent = match event {
            TransactionEvent::Finished(exit) => {
                let sent = TransactionInterface::finished(&emitter, &exit.to_string()).await;
                if let Err(e) = sent {
                    warn!("{}: failed to send Finished: {}", emitter.path(), e);
                }
                break;
            }
            ref event => match event.property_name() {
                Some(name) => {
                    TransactionInterface::property_changed(&emitter, name, event_value(event)).await
                }
                None => Ok(()),
            },
        };
        if let Err(e) = sent {
            debug!("{}: failed to send PropertyChanged: {}", emitter.path(), e);
        }
    }
}
