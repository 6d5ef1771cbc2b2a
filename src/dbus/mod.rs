// src/dbus/mod.rs

//! D-Bus surface of aptd
//!
//! The daemon object lives at [`DAEMON_PATH`] under the well-known name
//! [`BUS_NAME`]; every transaction is exported at its tid until the daemon
//! forgets it. The objects are thin: they identify the caller and hand the
//! call to [`DaemonState`].

pub mod caller;
mod daemon;
mod error;
mod transaction;

pub use daemon::{periodic_value, DaemonInterface};
pub use error::{property_error, AptdError};
pub use transaction::TransactionInterface;

use crate::daemon::{DaemonEvent, DaemonState};
use crate::error::{Error, Result};
use crate::queue::ActiveTransactions;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use zbus::fdo::{RequestNameFlags, RequestNameReply};
use zbus::object_server::SignalEmitter;
use zbus::Connection;

pub const BUS_NAME: &str = "org.debian.apt";
pub const DAEMON_PATH: &str = "/org/debian/apt";

/// Connect to the system bus, or the session bus for development
pub async fn connect(session_bus: bool) -> Result<Connection> {
    let connection = if session_bus {
        Connection::session().await?
    } else {
        Connection::system().await?
    };
    Ok(connection)
}

/// Take the well-known name; with `replace` an existing owner is pushed out
pub async fn request_name(connection: &Connection, replace: bool) -> Result<()> {
    let flags = if replace {
        RequestNameFlags::AllowReplacement
            | RequestNameFlags::ReplaceExisting
            | RequestNameFlags::DoNotQueue
    } else {
        RequestNameFlags::AllowReplacement | RequestNameFlags::DoNotQueue
    };
    match connection.request_name_with_flags(BUS_NAME, flags).await? {
        RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => {
            info!("Acquired bus name {}", BUS_NAME);
            Ok(())
        }
        reply => Err(Error::DbusError(format!(
            "{} is owned by another process ({:?}), use --replace",
            BUS_NAME, reply
        ))),
    }
}

/// Export the daemon object and start forwarding daemon-wide signals
pub async fn serve(connection: &Connection, state: Arc<DaemonState>) -> Result<()> {
    connection
        .object_server()
        .at(DAEMON_PATH, DaemonInterface::new(state.clone()))
        .await?;
    tokio::spawn(forward_active_transactions(
        connection.clone(),
        state.queue().subscribe(),
    ));
    tokio::spawn(forward_daemon_events(connection.clone(), state.subscribe()));
    tokio::spawn(quit_on_name_lost(connection.clone(), state));
    Ok(())
}

async fn forward_active_transactions(
    connection: Connection,
    mut active: watch::Receiver<ActiveTransactions>,
) {
    let emitter = match SignalEmitter::new(&connection, DAEMON_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            warn!("Cannot emit daemon signals: {}", e);
            return;
        }
    };
    while active.changed().await.is_ok() {
        let (current, queued) = active.borrow_and_update().to_tuple();
        debug!("Active transactions: '{}' {:?}", current, queued);
        if let Err(e) =
            DaemonInterface::active_transactions_changed(&emitter, &current, queued).await
        {
            warn!("Failed to send ActiveTransactionsChanged: {}", e);
        }
    }
}

async fn forward_daemon_events(connection: Connection, mut events: broadcast::Receiver<DaemonEvent>) {
    let emitter = match SignalEmitter::new(&connection, DAEMON_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            warn!("Cannot emit daemon signals: {}", e);
            return;
        }
    };
    loop {
        match events.recv().await {
            Ok(DaemonEvent::TransactionRemoved(tid)) => {
                let removed = connection
                    .object_server()
                    .remove::<TransactionInterface, _>(tid.as_str())
                    .await;
                if let Err(e) = removed {
                    warn!("Failed to unexport {}: {}", tid, e);
                }
            }
            Ok(DaemonEvent::PropertyChanged { key, value }) => {
                let sent = DaemonInterface::property_changed(
                    &emitter,
                    &key.to_string(),
                    periodic_value(key, value),
                )
                .await;
                if let Err(e) = sent {
                    warn!("Failed to send PropertyChanged: {}", e);
                }
            }
            Err(RecvError::Lagged(n)) => warn!("Dropped {} daemon events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Another instance started with `--replace` took over
async fn quit_on_name_lost(connection: Connection, state: Arc<DaemonState>) {
    use futures::StreamExt;

    let proxy = match zbus::fdo::DBusProxy::new(&connection).await {
        Ok(proxy) => proxy,
        Err(e) => {
            debug!("Cannot watch the bus name: {}", e);
            return;
        }
    };
    let mut lost = match proxy.receive_name_lost().await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Cannot watch the bus name: {}", e);
            return;
        }
    };
    while let Some(signal) = lost.next().await {
        let is_ours = signal.args().is_ok_and(|args| args.name().as_str() == BUS_NAME);
        if is_ours {
            info!("Lost {} to another instance", BUS_NAME);
            state.quit();
            break;
        }
    }
}
