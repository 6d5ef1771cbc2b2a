// src/auth/mod.rs

//! Authorization for transactions and daemon calls
//!
//! Every role maps to one PolicyKit action. Two narrowings apply once a
//! transaction has been simulated:
//!
//! - installs that only pull packages from a configured high-trust
//!   repository need the weaker `install-packages.high-trust-repo` action
//! - a commit which only upgrades needs `upgrade-packages`
//!
//! For a few roles a silent check of the higher level store actions
//! (`install-packages-from-new-repo`, `install-purchased-packages`) runs first;
//! if the caller already holds one of them the primary check is skipped.
//!
//! Decisions are written to the log as `AUDIT:` lines and kept in a bounded
//! in-memory history.

mod polkit;

pub use polkit::PolkitAuthority;

use crate::enums::Role;
use crate::error::{Error, Result};
use crate::transaction::{package_name, Caller, SimulationResult, Transaction};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// PolicyKit actions used by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    InstallOrRemovePackages,
    InstallPackagesFromHighTrustRepo,
    InstallPackagesFromNewRepo,
    InstallPurchasedPackages,
    InstallFile,
    UpgradePackages,
    UpdateCache,
    ChangeRepository,
    ChangeConfig,
    SetProxy,
    Clean,
    CancelForeign,
    GetTrustedVendorKeys,
}

impl Action {
    /// The PolicyKit action id
    pub fn polkit_action(&self) -> &'static str {
        match self {
            Action::InstallOrRemovePackages => "org.debian.apt.install-or-remove-packages",
            Action::InstallPackagesFromHighTrustRepo => {
                "org.debian.apt.install-packages.high-trust-repo"
            }
            Action::InstallPackagesFromNewRepo => "org.debian.apt.install-packages-from-new-repo",
            Action::InstallPurchasedPackages => "org.debian.apt.install-purchased-packages",
            Action::InstallFile => "org.debian.apt.install-file",
            Action::UpgradePackages => "org.debian.apt.upgrade-packages",
            Action::UpdateCache => "org.debian.apt.update-cache",
            Action::ChangeRepository => "org.debian.apt.change-repository",
            Action::ChangeConfig => "org.debian.apt.change-config",
            Action::SetProxy => "org.debian.apt.set-proxy",
            Action::Clean => "org.debian.apt.clean",
            Action::CancelForeign => "org.debian.apt.cancel-foreign",
            Action::GetTrustedVendorKeys => "org.debian.apt.get-trusted-vendor-keys",
        }
    }

    /// Action required for a role before any narrowing; `None` for roles
    /// which change nothing
    pub fn for_role(role: Role) -> Option<Action> {
        match role {
            Role::InstallPackages
            | Role::RemovePackages
            | Role::CommitPackages
            | Role::FixIncompleteInstall
            | Role::FixBrokenDepends
            | Role::Reconfigure
            | Role::AddLicenseKey => Some(Action::InstallOrRemovePackages),
            Role::UpgradePackages | Role::UpgradeSystem => Some(Action::UpgradePackages),
            Role::UpdateCache => Some(Action::UpdateCache),
            Role::InstallFile => Some(Action::InstallFile),
            Role::AddVendorKeyFile
            | Role::AddVendorKeyFromKeyserver
            | Role::RemoveVendorKey
            | Role::AddRepository
            | Role::EnableDistroComponent => Some(Action::ChangeRepository),
            Role::Clean => Some(Action::Clean),
            Role::Query | Role::Unset => None,
        }
    }
}

/// Roles for which the store actions are checked silently first
const ALT_AUTH_ROLES: [Role; 5] = [
    Role::AddRepository,
    Role::AddVendorKeyFromKeyserver,
    Role::UpdateCache,
    Role::InstallPackages,
    Role::AddLicenseKey,
];

const ALT_AUTH_ACTIONS: [Action; 2] = [
    Action::InstallPackagesFromNewRepo,
    Action::InstallPurchasedPackages,
];

/// Answer of an authority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Authorized,
    /// Outright denial
    NotAuthorized,
    /// The caller was asked and failed or dismissed the dialog
    Challenged,
}

/// Something that decides whether a caller may perform an action
#[async_trait]
pub trait Authority: Send + Sync {
    async fn check(&self, caller: &Caller, action: Action, interactive: bool) -> Result<AuthResult>;
}

/// Authority with a fixed answer per action, for `--dummy` mode and tests
#[derive(Debug, Default)]
pub struct StaticAuthority {
    allowed: HashSet<Action>,
    allow_all: bool,
    challenge: bool,
    calls: Mutex<Vec<(Action, bool)>>,
}

impl StaticAuthority {
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            ..Default::default()
        }
    }

    pub fn deny_all() -> Self {
        Self::default()
    }

    pub fn allowing(actions: &[Action]) -> Self {
        Self {
            allowed: actions.iter().copied().collect(),
            ..Default::default()
        }
    }

    /// Report denials as failed challenges instead of plain refusals
    pub fn challenging(mut self) -> Self {
        self.challenge = true;
        self
    }

    /// Every `(action, interactive)` pair asked so far
    pub fn calls(&self) -> Vec<(Action, bool)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Authority for StaticAuthority {
    async fn check(&self, _caller: &Caller, action: Action, interactive: bool) -> Result<AuthResult> {
        self.calls.lock().push((action, interactive));
        if self.allow_all || self.allowed.contains(&action) {
            Ok(AuthResult::Authorized)
        } else if self.challenge && interactive {
            Ok(AuthResult::Challenged)
        } else {
            Ok(AuthResult::NotAuthorized)
        }
    }
}

/// One authorization decision
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub caller: Caller,
    pub action: Action,
    pub allowed: bool,
    pub details: Option<String>,
}

impl AuditEntry {
    pub fn new(caller: Caller, action: Action, allowed: bool) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            caller,
            action,
            allowed,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn to_log_message(&self) -> String {
        let allowed_str = if self.allowed { "ALLOWED" } else { "DENIED" };
        format!(
            "[{}] {} {} uid={} pid={} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            allowed_str,
            self.action.polkit_action(),
            self.caller.uid,
            self.caller.pid,
            self.details.as_deref().unwrap_or("")
        )
    }
}

/// Bounded history of decisions
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
    max_entries: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_entries: 1000,
        }
    }
}

impl AuditLog {
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Default::default()
        }
    }

    pub fn log(&self, entry: AuditEntry) {
        let msg = entry.to_log_message();
        if entry.allowed {
            info!("AUDIT: {}", msg);
        } else {
            warn!("AUDIT: {}", msg);
        }
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    pub fn recent(&self, count: usize) -> Vec<AuditEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(count);
        entries.iter().skip(skip).cloned().collect()
    }
}

/// True if the simulated change set consists only of new installs which all
/// come from a high-trust repository
pub fn is_high_trust_install(role: Role, sim: &SimulationResult) -> bool {
    if !matches!(role, Role::InstallPackages | Role::CommitPackages) {
        return false;
    }
    if !sim.changes.only_installs()
        || !sim.unauthenticated.is_empty()
        || sim.high_trust_packages.is_empty()
    {
        return false;
    }
    let installs: BTreeSet<&str> = sim.changes.install.iter().map(|s| package_name(s)).collect();
    let trusted: BTreeSet<&str> = sim.high_trust_packages.iter().map(|s| package_name(s)).collect();
    installs == trusted
}

/// The action a transaction needs, narrowed by its simulation result
pub fn required_action(trans: &Transaction) -> Option<Action> {
    let role = trans.role();
    let action = Action::for_role(role)?;
    let simulation = trans.simulation();

    if let Some(ref sim) = simulation
        && is_high_trust_install(role, sim)
    {
        return Some(Action::InstallPackagesFromHighTrustRepo);
    }

    if role == Role::CommitPackages {
        let packages = trans.packages();
        let only_upgrade = !packages.upgrade.is_empty()
            && packages.install.is_empty()
            && packages.reinstall.is_empty()
            && packages.remove.is_empty()
            && packages.purge.is_empty()
            && packages.downgrade.is_empty();
        if only_upgrade {
            return Some(Action::UpgradePackages);
        }
    }
    Some(action)
}

/// Runs authorization checks against an [`Authority`]
pub struct AuthGate {
    authority: Arc<dyn Authority>,
    audit: AuditLog,
}

impl AuthGate {
    pub fn new(authority: Arc<dyn Authority>) -> Self {
        Self {
            authority,
            audit: AuditLog::default(),
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Check one action for a caller, interactively
    pub async fn check_action(&self, caller: &Caller, action: Action) -> Result<()> {
        if caller.is_root() {
            self.audit
                .log(AuditEntry::new(caller.clone(), action, true).with_details("root"));
            return Ok(());
        }
        let result = match self.authority.check(caller, action, true).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Authority failed for {}: {}", action.polkit_action(), e);
                self.audit.log(
                    AuditEntry::new(caller.clone(), action, false).with_details(e.to_string()),
                );
                return Err(Error::AuthFailed(action.polkit_action().to_string()));
            }
        };
        let allowed = result == AuthResult::Authorized;
        self.audit.log(AuditEntry::new(caller.clone(), action, allowed));
        match result {
            AuthResult::Authorized => Ok(()),
            AuthResult::NotAuthorized => {
                Err(Error::NotAuthorized(action.polkit_action().to_string()))
            }
            AuthResult::Challenged => Err(Error::AuthFailed(action.polkit_action().to_string())),
        }
    }

    /// Silent check of the store actions; errors count as "no"
    async fn alternative_auth(&self, caller: &Caller) -> bool {
        for action in ALT_AUTH_ACTIONS {
            match self.authority.check(caller, action, false).await {
                Ok(AuthResult::Authorized) => {
                    debug!("Caller {} holds {}", caller.uid, action.polkit_action());
                    self.audit.log(
                        AuditEntry::new(caller.clone(), action, true)
                            .with_details("alternative authorization"),
                    );
                    return true;
                }
                Ok(_) => {}
                Err(e) => debug!("Silent check of {} failed: {}", action.polkit_action(), e),
            }
        }
        false
    }

    /// Authorize running `trans`
    pub async fn check_transaction(&self, trans: &Transaction) -> Result<()> {
        let caller = trans.caller();
        let role = trans.role();

        if !caller.is_root() && ALT_AUTH_ROLES.contains(&role) && self.alternative_auth(caller).await
        {
            return Ok(());
        }

        if let Some(action) = required_action(trans) {
            debug!("{} requires {}", trans.tid(), action.polkit_action());
            self.check_action(caller, action).await?;
        }

        let has_proxy = trans.with_state(|s| !s.http_proxy.is_empty());
        if has_proxy {
            self.check_action(caller, Action::SetProxy).await?;
        }
        Ok(())
    }
}
