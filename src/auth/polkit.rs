// src/auth/polkit.rs

//! PolicyKit authority over the system bus

use super::{Action, AuthResult, Authority};
use crate::error::Result;
use crate::transaction::Caller;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;
use zbus::zvariant::Value;

/// `CheckAuthorization` flag asking PolicyKit to show a dialog
const ALLOW_USER_INTERACTION: u32 = 1;

#[zbus::proxy(
    interface = "org.freedesktop.PolicyKit1.Authority",
    default_service = "org.freedesktop.PolicyKit1",
    default_path = "/org/freedesktop/PolicyKit1/Authority"
)]
trait PolicyKitAuthority {
    fn check_authorization(
        &self,
        subject: &(&str, HashMap<&str, Value<'_>>),
        action_id: &str,
        details: HashMap<&str, &str>,
        flags: u32,
        cancellation_id: &str,
    ) -> zbus::Result<(bool, bool, HashMap<String, String>)>;
}

/// Asks the system PolicyKit daemon
pub struct PolkitAuthority {
    connection: zbus::Connection,
}

impl PolkitAuthority {
    pub fn new(connection: zbus::Connection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl Authority for PolkitAuthority {
    async fn check(&self, caller: &Caller, action: Action, interactive: bool) -> Result<AuthResult> {
        let proxy = PolicyKitAuthorityProxy::new(&self.connection).await?;

        let mut subject_details: HashMap<&str, Value<'_>> = HashMap::new();
        let kind = match caller.sender {
            Some(ref sender) => {
                subject_details.insert("name", Value::from(sender.as_str()));
                "system-bus-name"
            }
            None => {
                subject_details.insert("pid", Value::from(caller.pid));
                subject_details.insert("start-time", Value::from(0u64));
                "unix-process"
            }
        };
        let flags = if interactive { ALLOW_USER_INTERACTION } else { 0 };

        let (authorized, challenge, details) = proxy
            .check_authorization(
                &(kind, subject_details),
                action.polkit_action(),
                HashMap::new(),
                flags,
                "",
            )
            .await?;
        debug!(
            "PolicyKit {} for uid {}: authorized={} challenge={} {:?}",
            action.polkit_action(),
            caller.uid,
            authorized,
            challenge,
            details
        );

        if authorized {
            return Ok(AuthResult::Authorized);
        }
        let dismissed = details
            .get("polkit.dismissed")
            .is_some_and(|v| v == "true");
        if interactive && (challenge || dismissed) {
            Ok(AuthResult::Challenged)
        } else {
            Ok(AuthResult::NotAuthorized)
        }
    }
}
