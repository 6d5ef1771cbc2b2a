// src/dbus/caller.rs

//! Identify the process behind a method call
//!
//! The bus daemon vouches for the uid and pid of a unique name. The group
//! and the command line are read from `/proc`; they are informational and
//! never used for access decisions.

use crate::transaction::Caller;
use zbus::fdo::{self, DBusProxy};
use zbus::message::Header;
use zbus::names::BusName;
use zbus::Connection;

/// Real gid from the text of `/proc/<pid>/status`
fn parse_gid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Gid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|gid| gid.parse().ok())
}

/// NUL separated `/proc/<pid>/cmdline` as one line
fn parse_cmdline(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Look up the caller of the message with `header`
pub async fn caller_from_header(connection: &Connection, header: &Header<'_>) -> fdo::Result<Caller> {
    let sender = header
        .sender()
        .ok_or_else(|| fdo::Error::AccessDenied("The message has no sender".into()))?;
    let proxy = DBusProxy::new(connection).await?;
    let uid = proxy
        .get_connection_unix_user(BusName::from(sender.clone()))
        .await?;
    let pid = proxy
        .get_connection_unix_process_id(BusName::from(sender.clone()))
        .await?;

    let gid = std::fs::read_to_string(format!("/proc/{}/status", pid))
        .ok()
        .and_then(|status| parse_gid(&status))
        .unwrap_or(uid);
    let cmdline = std::fs::read(format!("/proc/{}/cmdline", pid))
        .map(|raw| parse_cmdline(&raw))
        .unwrap_or_default();

    Ok(Caller::new(pid, uid, gid)
        .with_sender(sender.as_str())
        .with_cmdline(cmdline))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gid() {
        let status = "Name:\tsoftware-center\nUid:\t1000\t1000\t1000\t1000\nGid:\t1001\t1001\t1001\t1001\n";
        assert_eq!(parse_gid(status), Some(1001));
        assert_eq!(parse_gid("Name:\tx\n"), None);
    }

    #[test]
    fn test_parse_cmdline() {
        assert_eq!(
            parse_cmdline(b"/usr/bin/python3\0/usr/bin/update-manager\0"),
            "/usr/bin/python3 /usr/bin/update-manager"
        );
        assert_eq!(parse_cmdline(b""), "");
    }
}
