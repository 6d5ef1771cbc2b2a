// src/dbus/daemon.rs

//! The `org.debian.apt` object at `/org/debian/apt`

use super::caller::caller_from_header;
use super::error::{property_error, AptdError};
use super::transaction;
use crate::daemon::{DaemonState, PeriodicKey};
use crate::error::Result;
use crate::transaction::{Caller, PackageSets, RepositorySpec, Transaction};
use std::sync::Arc;
use tracing::warn;
use zbus::fdo;
use zbus::message::Header;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedObjectPath, Value};
use zbus::Connection;

pub struct DaemonInterface {
    state: Arc<DaemonState>,
}

impl DaemonInterface {
    pub fn new(state: Arc<DaemonState>) -> Self {
        Self { state }
    }

    async fn caller(
        &self,
        connection: &Connection,
        header: &Header<'_>,
    ) -> std::result::Result<Caller, AptdError> {
        Ok(caller_from_header(connection, header).await?)
    }

    /// Export a freshly created transaction
    async fn export(
        &self,
        connection: &Connection,
        created: Result<Arc<Transaction>>,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let trans = created?;
        transaction::export(connection, &self.state, trans)
            .await
            .map_err(AptdError::ZBus)
    }

    fn periodic(&self, key: PeriodicKey) -> i32 {
        self.state.periodic(key).unwrap_or_else(|e| {
            warn!("Cannot read {}: {}", key, e);
            0
        })
    }

    async fn set_periodic(
        &self,
        key: PeriodicKey,
        value: i32,
        connection: &Connection,
        header: &Header<'_>,
    ) -> fdo::Result<()> {
        let caller = caller_from_header(connection, header).await?;
        self.state
            .set_periodic(&caller, key, value)
            .await
            .map_err(property_error)
    }
}

/// Value of a periodic setting as sent in `PropertyChanged`
pub fn periodic_value(key: PeriodicKey, value: i32) -> Value<'static> {
    if key.is_flag() {
        Value::from(value != 0)
    } else {
        Value::from(value)
    }
}

#[zbus::interface(name = "org.debian.apt")]
impl DaemonInterface {
    async fn install_packages(
        &self,
        package_names: Vec<String>,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(connection, self.state.install_packages(caller, package_names))
            .await
    }

    async fn remove_packages(
        &self,
        package_names: Vec<String>,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(connection, self.state.remove_packages(caller, package_names))
            .await
    }

    async fn upgrade_packages(
        &self,
        package_names: Vec<String>,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(connection, self.state.upgrade_packages(caller, package_names))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_packages(
        &self,
        install: Vec<String>,
        reinstall: Vec<String>,
        remove: Vec<String>,
        purge: Vec<String>,
        upgrade: Vec<String>,
        downgrade: Vec<String>,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        let packages = PackageSets::new(install, reinstall, remove, purge, upgrade, downgrade);
        self.export(connection, self.state.commit_packages(caller, packages))
            .await
    }

    async fn update_cache(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(connection, self.state.update_cache(caller)).await
    }

    async fn update_cache_partially(
        &self,
        sources_list: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(
            connection,
            self.state.update_cache_partially(caller, sources_list),
        )
        .await
    }

    async fn upgrade_system(
        &self,
        safe_mode: bool,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(connection, self.state.upgrade_system(caller, safe_mode))
            .await
    }

    async fn install_file(
        &self,
        path: String,
        force: bool,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(connection, self.state.install_file(caller, path, force))
            .await
    }

    async fn fix_broken_depends(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(connection, self.state.fix_broken_depends(caller))
            .await
    }

    async fn fix_incomplete_install(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(connection, self.state.fix_incomplete_install(caller))
            .await
    }

    async fn add_vendor_key_from_file(
        &self,
        path: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(connection, self.state.add_vendor_key_from_file(caller, path))
            .await
    }

    async fn add_vendor_key_from_keyserver(
        &self,
        keyid: String,
        keyserver: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(
            connection,
            self.state
                .add_vendor_key_from_keyserver(caller, keyid, keyserver),
        )
        .await
    }

    async fn remove_vendor_key(
        &self,
        fingerprint: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(connection, self.state.remove_vendor_key(caller, fingerprint))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn add_repository(
        &self,
        src_type: String,
        uri: String,
        dist: String,
        comps: Vec<String>,
        comment: String,
        sourcesfile: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        let spec = RepositorySpec {
            src_type,
            uri,
            dist,
            components: comps,
            comment,
            sources_file: sourcesfile,
        };
        self.export(connection, self.state.add_repository(caller, spec))
            .await
    }

    async fn enable_distro_component(
        &self,
        component: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(
            connection,
            self.state.enable_distro_component(caller, component),
        )
        .await
    }

    async fn reconfigure(
        &self,
        packages: Vec<String>,
        priority: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(connection, self.state.reconfigure(caller, packages, priority))
            .await
    }

    async fn clean(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(connection, self.state.clean(caller)).await
    }

    async fn add_license_key(
        &self,
        pkg_name: String,
        json_token: String,
        server_name: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<OwnedObjectPath, AptdError> {
        let caller = self.caller(connection, &header).await?;
        self.export(
            connection,
            self.state
                .add_license_key(caller, pkg_name, json_token, server_name),
        )
        .await
    }

    async fn get_trusted_vendor_keys(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> std::result::Result<Vec<String>, AptdError> {
        let caller = self.caller(connection, &header).await?;
        Ok(self.state.get_trusted_vendor_keys(&caller).await?)
    }

    /// The running transaction (empty if none) and the queued ones
    async fn get_active_transactions(&self) -> (String, Vec<String>) {
        self.state.active_transactions().to_tuple()
    }

    async fn quit(&self) {
        self.state.quit();
    }

    #[zbus(signal)]
    pub async fn active_transactions_changed(
        emitter: &SignalEmitter<'_>,
        current: &str,
        queued: Vec<String>,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn property_changed(
        emitter: &SignalEmitter<'_>,
        property: &str,
        value: Value<'_>,
    ) -> zbus::Result<()>;

    #[zbus(property)]
    fn auto_update_interval(&self) -> i32 {
        self.periodic(PeriodicKey::AutoUpdateInterval)
    }

    #[zbus(property)]
    async fn set_auto_update_interval(
        &self,
        days: i32,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.set_periodic(PeriodicKey::AutoUpdateInterval, days, connection, &header)
            .await
    }

    #[zbus(property)]
    fn auto_download(&self) -> bool {
        self.periodic(PeriodicKey::AutoDownload) != 0
    }

    #[zbus(property)]
    async fn set_auto_download(
        &self,
        enabled: bool,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.set_periodic(PeriodicKey::AutoDownload, i32::from(enabled), connection, &header)
            .await
    }

    #[zbus(property)]
    fn auto_clean_interval(&self) -> i32 {
        self.periodic(PeriodicKey::AutoCleanInterval)
    }

    #[zbus(property)]
    async fn set_auto_clean_interval(
        &self,
        days: i32,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.set_periodic(PeriodicKey::AutoCleanInterval, days, connection, &header)
            .await
    }

    #[zbus(property)]
    fn unattended_upgrade(&self) -> i32 {
        self.periodic(PeriodicKey::UnattendedUpgrade)
    }

    #[zbus(property)]
    async fn set_unattended_upgrade(
        &self,
        days: i32,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.set_periodic(PeriodicKey::UnattendedUpgrade, days, connection, &header)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_periodic_values() {
        assert_eq!(periodic_value(PeriodicKey::AutoDownload, 1), Value::from(true));
        assert_eq!(periodic_value(PeriodicKey::AutoDownload, 0), Value::from(false));
        assert_eq!(
            periodic_value(PeriodicKey::AutoCleanInterval, 7),
            Value::from(7i32)
        );
    }
}
