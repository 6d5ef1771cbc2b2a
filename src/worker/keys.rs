// src/worker/keys.rs

//! Managing the vendor keyring APT trusts
//!
//! gpg runs through the child runner like every other tool, against a
//! throwaway home directory so root's own keyring is never touched.

use super::cache::ExecContext;
use crate::enums::ErrorKind;
use crate::error::{Error, Result};
use crate::runner::{ChildCommand, ChildRunner, StatusProtocol};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tracing::info;

static KEY_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(0x)?([0-9A-Fa-f]{8}|[0-9A-Fa-f]{16}|[0-9A-Fa-f]{40})$").expect("valid regex")
});

const KEYSERVER_SCHEMES: &[&str] = &["hkp", "hkps", "http", "https"];

/// Validate a key server URL
pub fn check_keyserver(keyserver: &str) -> Result<url::Url> {
    let url = url::Url::parse(keyserver).map_err(|e| {
        Error::failed(
            ErrorKind::KeyNotInstalled,
            format!("Invalid key server '{}': {}", keyserver, e),
        )
    })?;
    if !KEYSERVER_SCHEMES.contains(&url.scheme()) || url.host_str().is_none() {
        return Err(Error::failed(
            ErrorKind::KeyNotInstalled,
            format!("Unsupported key server '{}'", keyserver),
        ));
    }
    Ok(url)
}

/// Validate a short, long or full key id
pub fn check_key_id(key_id: &str, kind: ErrorKind) -> Result<()> {
    if KEY_ID_RE.is_match(key_id) {
        Ok(())
    } else {
        Err(Error::failed(kind, format!("Invalid key id '{}'", key_id)))
    }
}

/// Primary key fingerprints from `gpg --with-colons` output
fn parse_fingerprints(colons: &str) -> Vec<String> {
    let mut fingerprints = Vec::new();
    let mut primary = false;
    for line in colons.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first().copied() {
            Some("pub") => primary = true,
            Some("sub") => primary = false,
            Some("fpr") if primary => {
                if let Some(fpr) = fields.get(9).filter(|f| !f.is_empty()) {
                    fingerprints.push(fpr.to_string());
                }
                primary = false;
            }
            _ => {}
        }
    }
    fingerprints
}

/// gpg bound to one keyring
pub struct Keyring<'a> {
    gpg: &'a Path,
    keyring: &'a Path,
}

impl<'a> Keyring<'a> {
    pub fn new(gpg: &'a Path, keyring: &'a Path) -> Self {
        Self { gpg, keyring }
    }

    async fn run(
        &self,
        ctx: &mut ExecContext<'_>,
        args: &[&str],
        kind: ErrorKind,
        what: &str,
    ) -> Result<()> {
        let home = tempfile::tempdir()?;
        if let Some(parent) = self.keyring.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let cmd = ChildCommand::new(self.gpg, StatusProtocol::Apt)
            .args([
                "--homedir".to_string(),
                home.path().display().to_string(),
                "--no-default-keyring".to_string(),
                "--no-auto-check-trustdb".to_string(),
                "--batch".to_string(),
                "--yes".to_string(),
                "--keyring".to_string(),
                self.keyring.display().to_string(),
            ])
            .args(args.iter().copied());
        let output_before = ctx.trans.output().len();
        let outcome = ChildRunner::new(ctx.trans, ctx.runner.clone())
            .run(cmd, &mut |_| {})
            .await?;
        if outcome.success() {
            info!("{}: {}", ctx.trans.tid(), what);
            return Ok(());
        }
        let output = ctx.trans.output();
        let details = output.get(output_before..).unwrap_or_default().trim();
        let details = if details.is_empty() { "gpg error" } else { details };
        Err(Error::failed(kind, format!("{} failed: {}", what, details)))
    }

    pub async fn import_file(&self, ctx: &mut ExecContext<'_>, path: &Path) -> Result<()> {
        let path = path.display().to_string();
        self.run(
            ctx,
            &["--import", &path],
            ErrorKind::KeyNotInstalled,
            &format!("Importing key file {}", path),
        )
        .await
    }

    pub async fn receive(&self, ctx: &mut ExecContext<'_>, key_id: &str, keyserver: &str) -> Result<()> {
        check_key_id(key_id, ErrorKind::KeyNotInstalled)?;
        let url = check_keyserver(keyserver)?;
        self.run(
            ctx,
            &["--keyserver", url.as_str(), "--recv-keys", key_id],
            ErrorKind::KeyNotInstalled,
            &format!("Downloading key {} from {}", key_id, url),
        )
        .await
    }

    /// Fingerprints of the keys in the keyring
    pub async fn fingerprints(&self) -> Result<Vec<String>> {
        if !self.keyring.exists() {
            return Ok(Vec::new());
        }
        let home = tempfile::tempdir()?;
        let output = tokio::process::Command::new(self.gpg)
            .arg("--homedir")
            .arg(home.path())
            .args(["--no-default-keyring", "--batch", "--with-colons", "--fingerprint"])
            .arg("--keyring")
            .arg(self.keyring)
            .arg("--list-keys")
            .env("LANG", "C")
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| Error::IoError(format!("Failed to run {}: {}", self.gpg.display(), e)))?;
        if !output.status.success() {
            return Err(Error::IoError(format!(
                "Listing {} failed: {}",
                self.keyring.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_fingerprints(&String::from_utf8_lossy(&output.stdout)))
    }

    pub async fn remove(&self, ctx: &mut ExecContext<'_>, fingerprint: &str) -> Result<()> {
        check_key_id(fingerprint, ErrorKind::KeyNotRemoved)?;
        self.run(
            ctx,
            &["--delete-keys", fingerprint],
            ErrorKind::KeyNotRemoved,
            &format!("Removing key {}", fingerprint),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ids() {
        assert!(check_key_id("0x4F25E3B6", ErrorKind::KeyNotInstalled).is_ok());
        assert!(check_key_id("A1B2C3D4E5F60718", ErrorKind::KeyNotInstalled).is_ok());
        assert!(check_key_id(&"AB".repeat(20), ErrorKind::KeyNotRemoved).is_ok());
        let err = check_key_id("--delete-secret-keys", ErrorKind::KeyNotRemoved).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyNotRemoved);
    }

    #[test]
    fn test_parse_fingerprints() {
        let colons = "\
tru::1:1700000000:0:3:1:5
pub:-:4096:1:648ACFD622F3D138:1560000000:::-:::scSC::::::23::0:
fpr:::::::::0146DC6D4A0B2914BDED34DB648ACFD622F3D138:
uid:-::::1560000000::ABCD::Debian Archive Automatic Signing Key::::::::::0:
sub:-:4096:1:0E98404D386FA1D9:1560000000::::::s::::::23:
fpr:::::::::1111222233334444555566660E98404D386FA1D9:
";
        assert_eq!(
            parse_fingerprints(colons),
            vec!["0146DC6D4A0B2914BDED34DB648ACFD622F3D138"]
        );
        assert!(parse_fingerprints("").is_empty());
    }

    #[test]
    fn test_keyservers() {
        assert!(check_keyserver("hkps://keyserver.ubuntu.com").is_ok());
        assert!(check_keyserver("hkp://pool.sks-keyservers.net:80").is_ok());
        let err = check_keyserver("file:///etc/passwd").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyNotInstalled);
        assert!(check_keyserver("keyserver.ubuntu.com").is_err());
    }
}
