// src/worker/debfile.rs

//! Reading the control data of a local .deb file
//!
//! A .deb is an ar archive holding `debian-binary`, `control.tar.*` and
//! `data.tar.*`. Only the control member is opened; it may be stored
//! uncompressed or compressed with gzip, xz or zstd.

use crate::enums::ErrorKind;
use crate::error::{Error, Result};
use crate::transaction::Caller;
use crate::version::parse_depends;
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use tar::Archive;
use tracing::{debug, warn};
use xz2::read::XzDecoder;

fn invalid(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::failed(
        ErrorKind::InvalidPackageFile,
        format!("{} is not a valid package file: {}", path.display(), reason),
    )
}

/// Fields of `DEBIAN/control` the daemon cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebControl {
    pub package: String,
    pub version: String,
    pub architecture: String,
    pub depends: String,
    pub pre_depends: String,
    pub provides: Vec<String>,
    pub installed_size_kib: u64,
    pub description: String,
}

impl DebControl {
    /// Open `path` and parse its control file
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::failed(
                ErrorKind::UnreadablePackageFile,
                format!("Failed to open {}: {}", path.display(), e),
            )
        })?;
        let mut archive = ar::Archive::new(file);

        while let Some(entry) = archive.next_entry() {
            let mut entry = entry.map_err(|e| invalid(path, e))?;
            let name = String::from_utf8_lossy(entry.header().identifier())
                .trim_end_matches('/')
                .to_string();
            if !name.starts_with("control.tar") {
                continue;
            }
            let mut compressed = Vec::new();
            entry
                .read_to_end(&mut compressed)
                .map_err(|e| invalid(path, e))?;
            let reader: Box<dyn Read> = match name.as_str() {
                "control.tar" => Box::new(Cursor::new(compressed)),
                "control.tar.gz" => Box::new(GzDecoder::new(Cursor::new(compressed))),
                "control.tar.xz" => Box::new(XzDecoder::new(Cursor::new(compressed))),
                "control.tar.zst" => Box::new(
                    zstd::Decoder::new(Cursor::new(compressed)).map_err(|e| invalid(path, e))?,
                ),
                other => return Err(invalid(path, format!("unsupported member {}", other))),
            };
            let text = read_control_member(reader).map_err(|e| invalid(path, e))?;
            let control = Self::parse(&text).map_err(|e| invalid(path, e))?;
            debug!("Read control of {} {}", control.package, control.version);
            return Ok(control);
        }
        Err(invalid(path, "no control archive"))
    }

    /// Parse deb822 control text
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let fields = parse_fields(text);
        let get = |key: &str| fields.get(key).cloned().unwrap_or_default();

        let control = Self {
            package: get("package"),
            version: get("version"),
            architecture: get("architecture"),
            depends: get("depends"),
            pre_depends: get("pre-depends"),
            provides: get("provides")
                .split(',')
                .map(|p| p.split('(').next().unwrap_or(p).trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            installed_size_kib: get("installed-size").trim().parse().unwrap_or(0),
            description: get("description").lines().next().unwrap_or("").to_string(),
        };
        if control.package.is_empty() {
            return Err("missing Package field".to_string());
        }
        if control.version.is_empty() {
            return Err("missing Version field".to_string());
        }
        parse_depends(&control.depends).map_err(|e| e.to_string())?;
        parse_depends(&control.pre_depends).map_err(|e| e.to_string())?;
        Ok(control)
    }

    /// `Pre-Depends` and `Depends` together
    pub fn all_depends(&self) -> String {
        [self.pre_depends.as_str(), self.depends.as_str()]
            .into_iter()
            .filter(|f| !f.trim().is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn read_control_member(reader: Box<dyn Read>) -> std::io::Result<String> {
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().to_string();
        if path.trim_start_matches("./") == "control" {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            return Ok(text);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "control file missing",
    ))
}

/// Field names are lowercased; continuation lines are joined with newlines
fn parse_fields(text: &str) -> HashMap<String, String> {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some(ref key) = current
                && let Some(value) = fields.get_mut(key)
            {
                value.push('\n');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_lowercase();
            fields.insert(key.clone(), value.trim().to_string());
            current = Some(key);
        }
    }
    fields
}

/// Run the package linter on `path` as the calling user
///
/// Returns the error tags it reported. Privileges are only dropped when the
/// daemon runs as root.
pub async fn lint(lintian: &Path, path: &Path, caller: &Caller) -> Result<Vec<String>> {
    let mut cmd = tokio::process::Command::new(lintian);
    cmd.arg("--no-tag-display-limit")
        .arg(path)
        .env("LANG", "C")
        .stdin(std::process::Stdio::null());
    if nix::unistd::geteuid().is_root() && !caller.is_root() {
        cmd.uid(caller.uid).gid(caller.gid);
    }
    let output = cmd.output().await.map_err(|e| {
        Error::failed(
            ErrorKind::Unknown,
            format!("Failed to run {}: {}", lintian.display(), e),
        )
    })?;
    let errors: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| l.starts_with("E: "))
        .map(str::to_string)
        .collect();
    if !errors.is_empty() {
        warn!("lintian reported {} errors on {}", errors.len(), path.display());
    }
    Ok(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const CONTROL: &str = "Package: hello\n\
Version: 2.10-3\n\
Architecture: amd64\n\
Installed-Size: 280\n\
Pre-Depends: dpkg (>= 1.19)\n\
Depends: libc6 (>= 2.34), perl | perl-base\n\
Provides: greeter (= 1.0), hello-world\n\
Description: example package\n \
 prints a greeting\n";

    fn build_deb(dir: &Path, control: &str) -> std::path::PathBuf {
        let mut tar_data = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_data);
            let mut header = tar::Header::new_gnu();
            header.set_size(control.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "./control", control.as_bytes())
                .unwrap();
            builder.finish().unwrap();
        }
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar_data).unwrap();
        let control_tar = gz.finish().unwrap();

        let path = dir.join("hello.deb");
        let mut ar = ar::Builder::new(File::create(&path).unwrap());
        ar.append(&ar::Header::new(b"debian-binary".to_vec(), 4), &b"2.0\n"[..])
            .unwrap();
        ar.append(
            &ar::Header::new(b"control.tar.gz".to_vec(), control_tar.len() as u64),
            &control_tar[..],
        )
        .unwrap();
        path
    }

    #[test]
    fn test_read_control_from_deb() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_deb(dir.path(), CONTROL);
        let control = DebControl::read(&path).unwrap();
        assert_eq!(control.package, "hello");
        assert_eq!(control.version, "2.10-3");
        assert_eq!(control.installed_size_kib, 280);
        assert_eq!(control.provides, vec!["greeter", "hello-world"]);
        assert_eq!(
            control.all_depends(),
            "dpkg (>= 1.19), libc6 (>= 2.34), perl | perl-base"
        );
        assert_eq!(control.description, "example package");
    }

    #[test]
    fn test_not_a_deb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.deb");
        std::fs::write(&path, b"certainly not an ar archive").unwrap();
        let err = DebControl::read(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPackageFile);
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let err = DebControl::read(Path::new("/nonexistent/file.deb")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnreadablePackageFile);
    }

    #[test]
    fn test_control_requires_version() {
        assert!(DebControl::parse("Package: foo\n").is_err());
        assert!(DebControl::parse("Package: foo\nVersion: 1.0\nDepends: (broken\n").is_err());
    }
}
