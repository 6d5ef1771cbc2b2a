// src/worker/sources.rs

//! Editing APT software source lists
//!
//! One-line `sources.list` format only:
//!
//! ```text
//! deb [arch=amd64] http://deb.debian.org/debian bookworm main contrib # comment
//! ```
//!
//! Lines the daemon does not understand are written back untouched.

use crate::enums::ErrorKind;
use crate::error::{Error, Result};
use crate::transaction::RepositorySpec;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::info;

static COMPONENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9+.-]*$").expect("valid regex"));

static SOURCES_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+\.list$").expect("valid regex"));

const URI_SCHEMES: &[&str] = &["http", "https", "ftp", "file", "cdrom", "copy", "mirror"];

fn invalid(message: impl Into<String>) -> Error {
    Error::failed(ErrorKind::RepositoryInvalid, message)
}

/// One `deb`/`deb-src` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Commented out with `#`
    pub disabled: bool,
    pub src_type: String,
    /// Bracketed option block including the brackets, if any
    pub options: Option<String>,
    pub uri: String,
    pub dist: String,
    pub components: Vec<String>,
    pub comment: String,
}

impl SourceEntry {
    /// Parse a line; `None` for blank lines, plain comments and other noise
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim();
        let mut disabled = false;
        if let Some(stripped) = rest.strip_prefix('#') {
            disabled = true;
            rest = stripped.trim_start();
        }
        let (body, comment) = match rest.split_once('#') {
            Some((body, comment)) => (body.trim(), comment.trim().to_string()),
            None => (rest, String::new()),
        };

        let (src_type, mut tail) = body.split_once(char::is_whitespace)?;
        if src_type != "deb" && src_type != "deb-src" {
            return None;
        }
        tail = tail.trim_start();
        let mut options = None;
        if tail.starts_with('[') {
            let end = tail.find(']')?;
            options = Some(tail[..=end].to_string());
            tail = tail[end + 1..].trim_start();
        }
        let mut words = tail.split_whitespace();
        let uri = words.next()?.to_string();
        let dist = words.next()?.to_string();
        let components = words.map(str::to_string).collect();
        Some(Self {
            disabled,
            src_type: src_type.to_string(),
            options,
            uri,
            dist,
            components,
            comment,
        })
    }

    /// Same source, ignoring enablement, options and comment
    fn same_source(&self, other: &SourceEntry) -> bool {
        self.src_type == other.src_type
            && self.uri.trim_end_matches('/') == other.uri.trim_end_matches('/')
            && self.dist == other.dist
    }
}

impl fmt::Display for SourceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.disabled {
            write!(f, "# ")?;
        }
        write!(f, "{}", self.src_type)?;
        if let Some(ref options) = self.options {
            write!(f, " {}", options)?;
        }
        write!(f, " {} {}", self.uri, self.dist)?;
        for component in &self.components {
            write!(f, " {}", component)?;
        }
        if !self.comment.is_empty() {
            write!(f, " # {}", self.comment)?;
        }
        Ok(())
    }
}

/// Check a repository request and turn it into a source line
pub fn entry_from_spec(spec: &RepositorySpec) -> Result<SourceEntry> {
    if spec.src_type != "deb" && spec.src_type != "deb-src" {
        return Err(invalid(format!("Unknown source type '{}'", spec.src_type)));
    }
    let uri = url::Url::parse(&spec.uri)
        .map_err(|e| invalid(format!("Invalid URI '{}': {}", spec.uri, e)))?;
    if !URI_SCHEMES.contains(&uri.scheme()) {
        return Err(invalid(format!("Unsupported URI scheme '{}'", uri.scheme())));
    }
    let dist = spec.dist.trim();
    if dist.is_empty() || dist.contains(char::is_whitespace) || dist.contains('#') {
        return Err(invalid(format!("Invalid distribution '{}'", spec.dist)));
    }
    // A distribution ending in '/' is an exact path and takes no components
    if !dist.ends_with('/') && spec.components.is_empty() {
        return Err(invalid("At least one component is required"));
    }
    for component in &spec.components {
        if !COMPONENT_RE.is_match(component) {
            return Err(invalid(format!("Invalid component '{}'", component)));
        }
    }
    if spec.comment.contains('\n') {
        return Err(invalid("The comment must be a single line"));
    }
    Ok(SourceEntry {
        disabled: false,
        src_type: spec.src_type.clone(),
        options: None,
        uri: spec.uri.clone(),
        dist: dist.to_string(),
        components: spec.components.clone(),
        comment: spec.comment.trim().to_string(),
    })
}

/// Where a repository request should be written
pub fn target_file(sources_list: &Path, sources_parts: &Path, sources_file: &str) -> Result<PathBuf> {
    if sources_file.is_empty() {
        return Ok(sources_list.to_path_buf());
    }
    let name = sources_file
        .strip_prefix(&format!("{}/", sources_parts.display()))
        .unwrap_or(sources_file);
    if !SOURCES_FILE_RE.is_match(name) {
        return Err(invalid(format!("Invalid sources file '{}'", sources_file)));
    }
    Ok(sources_parts.join(name))
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut text = lines.join("\n");
    text.push('\n');
    std::fs::write(path, text)?;
    Ok(())
}

/// Add `entry` to `path` unless an identical source is already enabled
///
/// A disabled line for the same source is enabled instead, merging in the
/// requested components. Returns whether the file changed.
pub fn add_source(path: &Path, entry: &SourceEntry) -> Result<bool> {
    let mut lines = read_lines(path)?;
    for line in lines.iter_mut() {
        let Some(mut existing) = SourceEntry::parse(line) else {
            continue;
        };
        if !existing.same_source(entry) {
            continue;
        }
        let missing: Vec<String> = entry
            .components
            .iter()
            .filter(|c| !existing.components.contains(c))
            .cloned()
            .collect();
        if !existing.disabled && missing.is_empty() {
            return Ok(false);
        }
        existing.disabled = false;
        existing.components.extend(missing);
        let enabled = existing.to_string();
        *line = enabled.clone();
        write_lines(path, &lines)?;
        info!("Enabled software source {} in {}", enabled, path.display());
        return Ok(true);
    }
    lines.push(entry.to_string());
    write_lines(path, &lines)?;
    info!("Added software source to {}", path.display());
    Ok(true)
}

/// Read `VERSION_CODENAME` from an os-release file
pub fn distro_codename(os_release: &Path) -> Result<String> {
    let text = std::fs::read_to_string(os_release)?;
    text.lines()
        .filter_map(|l| l.split_once('='))
        .find(|(k, _)| *k == "VERSION_CODENAME")
        .map(|(_, v)| v.trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| invalid("The distribution codename is unknown"))
}

/// Add `component` to every enabled source of the distribution `codename`
///
/// Sources of `codename-updates`, `codename-security` and friends count too.
pub fn enable_component(path: &Path, codename: &str, component: &str) -> Result<bool> {
    if !COMPONENT_RE.is_match(component) {
        return Err(invalid(format!("Invalid component '{}'", component)));
    }
    let mut lines = read_lines(path)?;
    let mut matched = false;
    let mut changed = false;
    for line in lines.iter_mut() {
        let Some(mut entry) = SourceEntry::parse(line) else {
            continue;
        };
        let of_distro = entry.dist == codename || entry.dist.starts_with(&format!("{}-", codename));
        if entry.disabled || !of_distro {
            continue;
        }
        matched = true;
        if !entry.components.iter().any(|c| c == component) {
            entry.components.push(component.to_string());
            *line = entry.to_string();
            changed = true;
        }
    }
    if !matched {
        return Err(invalid(format!(
            "No software source of {} found in {}",
            codename,
            path.display()
        )));
    }
    if changed {
        write_lines(path, &lines)?;
        info!("Enabled component {} of {}", component, codename);
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(uri: &str, dist: &str, components: &[&str]) -> RepositorySpec {
        RepositorySpec {
            src_type: "deb".into(),
            uri: uri.into(),
            dist: dist.into(),
            components: components.iter().map(|c| c.to_string()).collect(),
            comment: "added by test".into(),
            sources_file: String::new(),
        }
    }

    #[test]
    fn test_parse_and_display() {
        let line = "deb [arch=amd64 signed-by=/k.gpg] http://deb.debian.org/debian bookworm main contrib # stock";
        let entry = SourceEntry::parse(line).unwrap();
        assert_eq!(entry.options.as_deref(), Some("[arch=amd64 signed-by=/k.gpg]"));
        assert_eq!(entry.components, vec!["main", "contrib"]);
        assert_eq!(entry.comment, "stock");
        assert_eq!(entry.to_string(), line);

        let disabled = SourceEntry::parse("# deb-src http://x/ sid main").unwrap();
        assert!(disabled.disabled);
        assert!(SourceEntry::parse("# just a comment").is_none());
        assert!(SourceEntry::parse("").is_none());
    }

    #[test]
    fn test_add_source_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.list");
        let entry = entry_from_spec(&spec("http://example.com/debian", "stable", &["main"])).unwrap();
        assert!(add_source(&path, &entry).unwrap());
        assert!(!add_source(&path, &entry).unwrap());
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "deb http://example.com/debian stable main # added by test\n");
    }

    #[test]
    fn test_add_source_enables_disabled_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.list");
        std::fs::write(&path, "# deb http://example.com/debian stable main\n").unwrap();
        let entry =
            entry_from_spec(&spec("http://example.com/debian/", "stable", &["main", "non-free"]))
                .unwrap();
        assert!(add_source(&path, &entry).unwrap());
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "deb http://example.com/debian stable main non-free\n");
    }

    #[test]
    fn test_add_source_merges_components_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.list");
        std::fs::write(
            &path,
            "deb http://example.com/debian stable main\ndeb http://other.org/ sid main\n",
        )
        .unwrap();
        let entry =
            entry_from_spec(&spec("http://example.com/debian", "stable", &["contrib"])).unwrap();
        assert!(add_source(&path, &entry).unwrap());
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "deb http://example.com/debian stable main contrib\ndeb http://other.org/ sid main\n"
        );
    }

    #[test]
    fn test_invalid_specs() {
        assert!(entry_from_spec(&spec("not a uri", "stable", &["main"])).is_err());
        assert!(entry_from_spec(&spec("gopher://x/", "stable", &["main"])).is_err());
        assert!(entry_from_spec(&spec("http://x/", "", &["main"])).is_err());
        assert!(entry_from_spec(&spec("http://x/", "stable", &[])).is_err());
        assert!(entry_from_spec(&spec("http://x/", "./", &[])).is_ok());
        let err = entry_from_spec(&spec("http://x/", "stable", &["Main Stuff"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RepositoryInvalid);
    }

    #[test]
    fn test_target_file() {
        let list = Path::new("/etc/apt/sources.list");
        let parts = Path::new("/etc/apt/sources.list.d");
        assert_eq!(target_file(list, parts, "").unwrap(), list);
        assert_eq!(
            target_file(list, parts, "vendor.list").unwrap(),
            parts.join("vendor.list")
        );
        assert_eq!(
            target_file(list, parts, "/etc/apt/sources.list.d/vendor.list").unwrap(),
            parts.join("vendor.list")
        );
        assert!(target_file(list, parts, "../../shadow.list").is_err());
        assert!(target_file(list, parts, "vendor.conf").is_err());
    }

    #[test]
    fn test_enable_component() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.list");
        std::fs::write(
            &path,
            "deb http://deb.debian.org/debian bookworm main\n\
             deb http://security.debian.org bookworm-security main\n\
             deb http://example.com/ other main\n",
        )
        .unwrap();
        assert!(enable_component(&path, "bookworm", "contrib").unwrap());
        assert!(!enable_component(&path, "bookworm", "contrib").unwrap());
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("bookworm main contrib\n"));
        assert!(text.contains("bookworm-security main contrib\n"));
        assert!(text.contains("other main\n"));

        let err = enable_component(&path, "trixie", "contrib").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RepositoryInvalid);
    }

    #[test]
    fn test_distro_codename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("os-release");
        std::fs::write(&path, "NAME=\"Debian GNU/Linux\"\nVERSION_CODENAME=bookworm\n").unwrap();
        assert_eq!(distro_codename(&path).unwrap(), "bookworm");
    }
}
