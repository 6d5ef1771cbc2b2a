// src/worker/apt.rs

//! Package system backed by the host's apt and dpkg
//!
//! Resolution runs `apt-get -s` (simulation, no locking) against the live or
//! a frozen dpkg status file and parses its report. Origins come from
//! `apt-cache policy`. Commits, list refreshes and dpkg runs go through the
//! child runner with the inner locks handed over to the child.

use super::cache::{
    ExecContext, Mark, Origin, PackageCache, PackageInfo, PackageSystem, Resolution,
    ResolveOptions,
};
use super::progress::{Phase, TransactionProgress};
use crate::config::{SystemPaths, ToolPaths};
use crate::enums::ErrorKind;
use crate::error::{Error, Result};
use crate::lock::LockFailure;
use crate::runner::{ChildCommand, ChildOutcome, ChildRunner, StatusProtocol};
use crate::transaction::{package_name, Dependencies};
use async_trait::async_trait;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::UNIX_EPOCH;
use tokio::process::Command;
use tracing::{debug, info, warn};

static INST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Inst (\S+) (?:\[(\S+)\] )?\((\S+) ([^\[]*?)\s*(?:\[[^\]]*\])?\)")
        .expect("valid regex")
});

static REMV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(Remv|Purg) (\S+)(?: \[(\S+)\])?").expect("valid regex"));

static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9][0-9,]*(?:\.[0-9]+)?) ?(B|kB|MB|GB|TB)\b").expect("valid regex")
});

static PACKAGE_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*-?\d+ (\S+ .+)$").expect("valid regex"));

/// Metadata of one package index from `apt-cache policy`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageFile {
    pub origin: String,
    pub archive: String,
    pub codename: String,
    pub component: String,
}

/// Parse the "Package files" part of `apt-cache policy`
pub fn parse_package_files(text: &str) -> HashMap<String, PackageFile> {
    let mut files = HashMap::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(release) = trimmed.strip_prefix("release ") {
            let Some(key) = current.take() else {
                continue;
            };
            let mut file = PackageFile::default();
            for field in release.split(',') {
                match field.split_once('=') {
                    Some(("o", v)) => file.origin = v.to_string(),
                    Some(("a", v)) => file.archive = v.to_string(),
                    Some(("n", v)) => file.codename = v.to_string(),
                    Some(("c", v)) => file.component = v.to_string(),
                    _ => {}
                }
            }
            files.insert(key, file);
        } else if let Some(caps) = PACKAGE_FILE_RE.captures(line) {
            current = Some(caps[1].trim().to_string());
        }
    }
    files
}

/// One package block of `apt-cache policy <names>`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyEntry {
    pub name: String,
    pub installed: Option<String>,
    pub candidate: Option<String>,
    /// Every version with the package files offering it
    pub versions: Vec<(String, Vec<String>)>,
}

fn none_to_option(value: &str) -> Option<String> {
    let value = value.trim();
    (value != "(none)" && !value.is_empty()).then(|| value.to_string())
}

/// Parse the per-package output of `apt-cache policy`
pub fn parse_policy(text: &str) -> Vec<PolicyEntry> {
    let mut entries: Vec<PolicyEntry> = Vec::new();
    for line in text.lines() {
        if !line.starts_with(' ') {
            if let Some(name) = line.strip_suffix(':')
                && !name.contains(' ')
            {
                entries.push(PolicyEntry {
                    name: name.split(':').next().unwrap_or(name).to_string(),
                    ..Default::default()
                });
            }
            continue;
        }
        let Some(entry) = entries.last_mut() else {
            continue;
        };
        let trimmed = line.trim();
        if let Some(v) = trimmed.strip_prefix("Installed:") {
            entry.installed = none_to_option(v);
        } else if let Some(v) = trimmed.strip_prefix("Candidate:") {
            entry.candidate = none_to_option(v);
        } else if trimmed == "Version table:" {
            continue;
        } else {
            let tokens: Vec<&str> = trimmed.trim_start_matches("*** ").split_whitespace().collect();
            if tokens.len() == 2 && tokens[1].parse::<i32>().is_ok() {
                entry.versions.push((tokens[0].to_string(), Vec::new()));
            } else if tokens.len() >= 2 && tokens[0].parse::<i32>().is_ok() {
                if let Some((_, files)) = entry.versions.last_mut() {
                    files.push(tokens[1..].join(" "));
                }
            }
        }
    }
    entries
}

/// Parse a human readable apt size like `1,234 kB`
pub fn parse_size(text: &str) -> Option<u64> {
    let caps = SIZE_RE.captures(text)?;
    let value: f64 = caps[1].replace(',', "").parse().ok()?;
    let unit = match &caps[2] {
        "B" => 1.0,
        "kB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        _ => 1e12,
    };
    Some((value * unit).round() as u64)
}

/// What `apt-get -s` reported
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Simulated {
    pub changes: Dependencies,
    pub download: u64,
    pub space: i64,
    pub unauthenticated: Vec<String>,
}

/// Collect the indented package names following a section header
fn section<'a>(lines: &[&'a str], header: &str) -> Vec<&'a str> {
    let Some(start) = lines.iter().position(|l| l.starts_with(header)) else {
        return Vec::new();
    };
    lines[start + 1..]
        .iter()
        .take_while(|l| l.starts_with(' '))
        .flat_map(|l| l.split_whitespace())
        .filter(|w| !w.starts_with('(') && !w.ends_with(')') && *w != "=>")
        .collect()
}

/// Turn the report of `apt-get -s` into a change set, or the error it shows
pub fn parse_simulation(text: &str) -> Result<Simulated> {
    let lines: Vec<&str> = text.lines().collect();

    if let Some(start) = lines
        .iter()
        .position(|l| l.starts_with("The following packages have unmet dependencies"))
    {
        let block: Vec<&str> = lines[start..]
            .iter()
            .take_while(|l| !l.starts_with("E:"))
            .copied()
            .collect();
        return Err(Error::failed(
            ErrorKind::DepResolutionFailed,
            block.join("\n").trim_end().to_string(),
        ));
    }
    if lines
        .iter()
        .any(|l| l.contains("The following essential packages will be removed"))
    {
        let names: Vec<&str> = lines
            .iter()
            .skip_while(|l| !l.contains("essential packages will be removed"))
            .skip(1)
            .skip_while(|l| !l.starts_with(' '))
            .take_while(|l| l.starts_with(' '))
            .flat_map(|l| l.split_whitespace())
            .collect();
        return Err(Error::failed(
            ErrorKind::NotRemoveEssentialPackage,
            format!("Package {} cannot be removed", names.join(", ")),
        ));
    }
    if let Some(error) = lines.iter().find_map(|l| l.strip_prefix("E: ")) {
        let kind = if error.starts_with("Unable to locate package")
            || (error.starts_with("Version '") && error.ends_with("was not found"))
            || (error.starts_with("Release '") && error.ends_with("was not found"))
            || error.starts_with("Couldn't find any package")
        {
            ErrorKind::NoPackage
        } else {
            ErrorKind::CacheBroken
        };
        return Err(Error::failed(kind, error.to_string()));
    }

    let mut sim = Simulated::default();
    for line in &lines {
        if let Some(caps) = INST_RE.captures(line) {
            let name = &caps[1];
            let new = &caps[3];
            let entry = format!("{}={}", name, new);
            match caps.get(2).map(|m| m.as_str()) {
                None => sim.changes.install.push(entry),
                Some(old) => match crate::version::compare_versions(new, old) {
                    std::cmp::Ordering::Greater => sim.changes.upgrade.push(entry),
                    std::cmp::Ordering::Less => sim.changes.downgrade.push(entry),
                    std::cmp::Ordering::Equal => sim.changes.reinstall.push(entry),
                },
            }
        } else if let Some(caps) = REMV_RE.captures(line) {
            let name = &caps[2];
            let version = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
            let entry = format!("{}={}", name, version);
            if &caps[1] == "Purg" {
                sim.changes.purge.push(entry);
            } else {
                sim.changes.remove.push(entry);
            }
        } else if let Some(rest) = line.strip_prefix("Need to get ") {
            sim.download = parse_size(rest).unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("After this operation, ") {
            let size = parse_size(rest).unwrap_or(0) as i64;
            sim.space = if rest.contains("freed") { -size } else { size };
        }
    }
    sim.changes.kept = section(&lines, "The following packages have been kept back")
        .into_iter()
        .map(str::to_string)
        .collect();
    sim.unauthenticated = section(&lines, "WARNING: The following packages cannot be authenticated")
        .into_iter()
        .map(str::to_string)
        .collect();
    for list in [
        &mut sim.changes.install,
        &mut sim.changes.reinstall,
        &mut sim.changes.remove,
        &mut sim.changes.purge,
        &mut sim.changes.upgrade,
        &mut sim.changes.downgrade,
        &mut sim.changes.kept,
    ] {
        list.sort();
    }
    Ok(sim)
}

/// apt-get command line for a set of marks
pub fn resolve_args(marks: &[Mark], options: ResolveOptions) -> Vec<String> {
    let mut command = "install";
    let mut flags: Vec<String> = Vec::new();
    let mut names: Vec<String> = Vec::new();
    fn flag(f: &str, flags: &mut Vec<String>) {
        if !flags.iter().any(|x| x == f) {
            flags.push(f.to_string());
        }
    }
    for mark in marks {
        match mark {
            Mark::Install { name, version } | Mark::Upgrade { name, version } => {
                names.push(match version {
                    Some(v) => format!("{}={}", name, v),
                    None => name.clone(),
                });
            }
            Mark::Reinstall { name } => {
                flag("--reinstall", &mut flags);
                names.push(name.clone());
            }
            Mark::Remove { name, purge } => {
                if *purge {
                    flag("--purge", &mut flags);
                }
                names.push(format!("{}-", name));
            }
            Mark::Downgrade { name, version } => {
                flag("--allow-downgrades", &mut flags);
                names.push(format!("{}={}", name, version));
            }
            Mark::UpgradeAll { safe_mode } => {
                command = if *safe_mode { "upgrade" } else { "dist-upgrade" };
            }
            Mark::FixBroken => flag("--fix-broken", &mut flags),
        }
    }
    if options.remove_obsoleted {
        flag("--auto-remove", &mut flags);
    }
    let mut args = vec![command.to_string()];
    args.extend(flags);
    args.extend(names);
    args
}

/// apt-get command line committing a resolved change set
pub fn commit_args(changes: &Dependencies, allow_unauthenticated: bool) -> Vec<String> {
    let mut args = vec!["install".to_string()];
    if !changes.reinstall.is_empty() {
        args.push("--reinstall".into());
    }
    if !changes.downgrade.is_empty() {
        args.push("--allow-downgrades".into());
    }
    if !changes.purge.is_empty() {
        args.push("-o".into());
        args.push("APT::Get::Purge=true".into());
    }
    if allow_unauthenticated {
        args.push("--allow-unauthenticated".into());
    }
    for spec in changes
        .install
        .iter()
        .chain(&changes.reinstall)
        .chain(&changes.upgrade)
        .chain(&changes.downgrade)
    {
        args.push(spec.clone());
    }
    for spec in changes.remove.iter().chain(&changes.purge) {
        args.push(format!("{}-", package_name(spec)));
    }
    args
}

/// Classify a failed apt or dpkg run from its errors and terminal output
pub fn classify_failure(outcome: &ChildOutcome, output: &str, fallback: ErrorKind) -> Error {
    let lines: Vec<&str> = output.lines().map(str::trim).collect();
    let pick = |pred: &dyn Fn(&str) -> bool| -> Vec<String> {
        lines.iter().filter(|l| pred(l)).map(|l| l.to_string()).collect()
    };

    let lock = pick(&|l| l.contains("Could not get lock") || l.contains("Unable to acquire the dpkg"));
    if !lock.is_empty() {
        return Error::failed(ErrorKind::NoLock, lock.join("\n"));
    }
    let unauth = pick(&|l| l.contains("unauthenticated packages") || l.contains("cannot be authenticated"));
    if !unauth.is_empty() {
        return Error::failed(ErrorKind::PackageUnauthenticated, unauth.join("\n"));
    }
    let fetch = pick(&|l| l.contains("Failed to fetch") || l.contains("failed to download"));
    if !fetch.is_empty() {
        let kind = if fallback == ErrorKind::RepoDownloadFailed {
            ErrorKind::RepoDownloadFailed
        } else {
            ErrorKind::PackageDownloadFailed
        };
        return Error::failed(kind, fetch.join("\n"));
    }
    if !outcome.errors.is_empty() {
        return Error::failed(fallback, outcome.errors.join("\n"));
    }
    let errors = pick(&|l| l.starts_with("E:") || l.starts_with("dpkg: error"));
    if !errors.is_empty() {
        return Error::failed(fallback, errors.join("\n"));
    }
    Error::failed(fallback, format!("The package manager exited with {}", outcome.status))
}

async fn query(program: &Path, args: &[String]) -> Result<String> {
    debug!("Running {} {}", program.display(), args.join(" "));
    let output = Command::new(program)
        .args(args)
        .env("LANG", "C")
        .env("LC_ALL", "C")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            Error::failed(
                ErrorKind::NoCache,
                format!("Failed to run {}: {}", program.display(), e),
            )
        })?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

fn status_override(status: Option<&Path>) -> Vec<String> {
    match status {
        Some(path) => vec!["-o".into(), format!("Dir::State::status={}", path.display())],
        None => Vec::new(),
    }
}

/// A cache over the host's apt configuration
pub struct AptCache {
    tools: ToolPaths,
    status: Option<PathBuf>,
    marks: Vec<Mark>,
    files: Option<HashMap<String, PackageFile>>,
}

impl AptCache {
    async fn package_files(&mut self) -> Result<&HashMap<String, PackageFile>> {
        if self.files.is_none() {
            let mut args = status_override(self.status.as_deref());
            args.push("policy".into());
            let text = query(&self.tools.apt_cache, &args).await?;
            self.files = Some(parse_package_files(&text));
        }
        Ok(self.files.get_or_insert_with(HashMap::new))
    }

    async fn policy(&self, names: &[&str]) -> Result<Vec<PolicyEntry>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = status_override(self.status.as_deref());
        args.push("policy".into());
        args.extend(names.iter().map(|n| n.to_string()));
        Ok(parse_policy(&query(&self.tools.apt_cache, &args).await?))
    }

    async fn origins(
        &mut self,
        changes: &Dependencies,
        unauthenticated: &[String],
    ) -> Result<HashMap<String, Origin>> {
        let names: Vec<&str> = changes.unpacked_names();
        let entries = self.policy(&names).await?;
        let files = self.package_files().await?;
        let mut origins = HashMap::new();
        for spec in changes
            .install
            .iter()
            .chain(&changes.reinstall)
            .chain(&changes.upgrade)
            .chain(&changes.downgrade)
        {
            let Some((name, version)) = spec.split_once('=') else {
                continue;
            };
            let file = entries
                .iter()
                .filter(|e| e.name == name)
                .flat_map(|e| e.versions.iter())
                .filter(|(v, _)| v == version)
                .flat_map(|(_, sources)| sources.iter())
                .find_map(|source| files.get(source));
            if let Some(file) = file {
                origins.insert(
                    name.to_string(),
                    Origin {
                        origin: file.origin.clone(),
                        component: file.component.clone(),
                        trusted: !unauthenticated.iter().any(|u| u == name),
                    },
                );
            }
        }
        Ok(origins)
    }

    async fn essential(&self, name: &str) -> Result<bool> {
        let mut args = status_override(self.status.as_deref());
        args.extend(["show".to_string(), "--no-all-versions".to_string(), name.to_string()]);
        let text = query(&self.tools.apt_cache, &args).await?;
        Ok(text.lines().any(|l| l.trim() == "Essential: yes"))
    }
}

#[async_trait]
impl PackageCache for AptCache {
    async fn package_info(&mut self, name: &str) -> Result<Option<PackageInfo>> {
        let Some(entry) = self.policy(&[name]).await?.into_iter().find(|e| e.name == name) else {
            return Ok(None);
        };
        if entry.installed.is_none() && entry.candidate.is_none() && entry.versions.is_empty() {
            return Ok(None);
        }
        let files = self.package_files().await?.clone();
        let mut versions = Vec::new();
        for (version, sources) in &entry.versions {
            for source in sources {
                if let Some(file) = files.get(source) {
                    for release in [&file.archive, &file.codename] {
                        if !release.is_empty() {
                            versions.push((version.clone(), release.clone()));
                        }
                    }
                }
            }
            if !versions.iter().any(|(v, _)| v == version) {
                versions.push((version.clone(), String::new()));
            }
        }
        let essential = match entry.installed {
            Some(_) => self.essential(name).await?,
            None => false,
        };
        Ok(Some(PackageInfo {
            name: entry.name,
            installed: entry.installed,
            candidate: entry.candidate,
            versions,
            essential,
        }))
    }

    fn mark(&mut self, mark: Mark) {
        self.marks.push(mark);
    }

    fn marks(&self) -> &[Mark] {
        &self.marks
    }

    async fn resolve(&mut self, options: ResolveOptions) -> Result<Resolution> {
        let mut args = vec![
            "-s".to_string(),
            "-o".to_string(),
            "Debug::NoLocking=true".to_string(),
        ];
        args.extend(status_override(self.status.as_deref()));
        args.extend(resolve_args(&self.marks, options));
        let text = query(&self.tools.apt_get, &args).await?;
        let mut sim = parse_simulation(&text)?;
        let origins = self.origins(&sim.changes, &sim.unauthenticated).await?;
        if !sim.changes.kept.is_empty() {
            let names: Vec<&str> = sim.changes.kept.iter().map(String::as_str).collect();
            let kept = self
                .policy(&names)
                .await?
                .into_iter()
                .map(|e| match e.installed {
                    Some(version) => format!("{}={}", e.name, version),
                    None => e.name,
                })
                .collect();
            sim.changes.kept = kept;
        }
        Ok(Resolution {
            changes: sim.changes,
            download: sim.download,
            space: sim.space,
            unauthenticated: sim.unauthenticated,
            origins,
        })
    }
}

/// The host package system
pub struct AptSystem {
    tools: ToolPaths,
    paths: SystemPaths,
}

impl AptSystem {
    pub fn new(tools: ToolPaths, paths: SystemPaths) -> Self {
        Self { tools, paths }
    }

    /// Run a child with the inner locks handed over to it
    async fn run_child(
        &self,
        ctx: &mut ExecContext<'_>,
        command: ChildCommand,
        phase: Phase,
    ) -> Result<(ChildOutcome, String)> {
        let output_before = ctx.trans.output().len();
        ctx.locks.release_inner();
        let result = {
            let mut progress = TransactionProgress::new(ctx.trans, phase);
            ChildRunner::new(ctx.trans, ctx.runner.clone())
                .run(
                    command.env("DPKG_FRONTEND_LOCKED", "1"),
                    &mut |event| progress.on_event(event),
                )
                .await
        };
        let relocked = ctx.locks.reacquire_inner();
        let outcome = result?;
        relocked.map_err(LockFailure::into_error)?;
        let output = ctx.trans.output();
        let output = output.get(output_before..).unwrap_or_default().to_string();
        Ok((outcome, output))
    }

    fn apt_get(&self, status_fd: i32) -> ChildCommand {
        ChildCommand::new(&self.tools.apt_get, StatusProtocol::Apt).args([
            "-q".to_string(),
            "-o".to_string(),
            format!("APT::Status-Fd={}", status_fd),
        ])
    }
}

fn stamp_file(hasher: &mut DefaultHasher, path: &Path) {
    path.hash(hasher);
    if let Ok(meta) = std::fs::metadata(path) {
        meta.len().hash(hasher);
        if let Ok(modified) = meta.modified() {
            modified
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
                .hash(hasher);
        }
    }
}

#[async_trait]
impl PackageSystem for AptSystem {
    async fn state_stamp(&self) -> Result<u64> {
        let mut hasher = DefaultHasher::new();
        stamp_file(&mut hasher, &self.paths.dpkg_status);
        stamp_file(&mut hasher, &self.paths.sources_list);
        if let Ok(entries) = std::fs::read_dir(&self.paths.lists_dir) {
            let mut lists: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
            lists.sort();
            for path in lists {
                stamp_file(&mut hasher, &path);
            }
        }
        Ok(hasher.finish())
    }

    async fn open(&self, status: Option<&Path>) -> Result<Box<dyn PackageCache>> {
        if !self.tools.apt_get.exists() {
            return Err(Error::failed(
                ErrorKind::NoCache,
                format!("{} is not installed", self.tools.apt_get.display()),
            ));
        }
        Ok(Box::new(AptCache {
            tools: self.tools.clone(),
            status: status.map(Path::to_path_buf),
            marks: Vec::new(),
            files: None,
        }))
    }

    async fn freeze(&self, dest: &Path) -> Result<()> {
        tokio::fs::copy(&self.paths.dpkg_status, dest).await?;
        Ok(())
    }

    async fn commit(
        &self,
        ctx: &mut ExecContext<'_>,
        changes: &Dependencies,
        allow_unauthenticated: bool,
    ) -> Result<()> {
        let nothing = changes.unpacked_names().is_empty()
            && changes.remove.is_empty()
            && changes.purge.is_empty();
        if nothing {
            info!("{}: nothing to commit", ctx.trans.tid());
            return Ok(());
        }
        let command = self
            .apt_get(ctx.runner.status_fd)
            .arg("-y")
            .args(commit_args(changes, allow_unauthenticated));
        let (outcome, output) = self.run_child(ctx, command, Phase::Commit).await?;
        if outcome.success() {
            return Ok(());
        }
        warn!("{}: apt-get failed: {}", ctx.trans.tid(), outcome.status);
        Err(classify_failure(&outcome, &output, ErrorKind::PackageManagerFailed))
    }

    async fn update_cache(&self, ctx: &mut ExecContext<'_>, sources_list: Option<&Path>) -> Result<()> {
        let mut command = self.apt_get(ctx.runner.status_fd).arg("update");
        if let Some(list) = sources_list {
            if !list.is_file() {
                return Err(Error::failed(
                    ErrorKind::RepositoryInvalid,
                    format!("Sources list {} does not exist", list.display()),
                ));
            }
            command = command.args([
                "-o".to_string(),
                format!("Dir::Etc::sourcelist={}", list.display()),
                "-o".to_string(),
                "Dir::Etc::sourceparts=-".to_string(),
                "-o".to_string(),
                "APT::List-Cleanup=0".to_string(),
            ]);
        }
        let (outcome, output) = self.run_child(ctx, command, Phase::Update).await?;
        let fetch_failed = output.lines().any(|l| l.contains("Failed to fetch"));
        if outcome.success() && !fetch_failed {
            return Ok(());
        }
        Err(classify_failure(&outcome, &output, ErrorKind::RepoDownloadFailed))
    }

    async fn fix_incomplete(&self, ctx: &mut ExecContext<'_>) -> Result<()> {
        let command = ChildCommand::new(&self.tools.dpkg, StatusProtocol::Dpkg).args([
            "--configure".to_string(),
            "-a".to_string(),
            "--status-fd".to_string(),
            ctx.runner.status_fd.to_string(),
        ]);
        let (outcome, output) = self.run_child(ctx, command, Phase::Dpkg { total: 1 }).await?;
        if outcome.success() {
            return Ok(());
        }
        Err(classify_failure(&outcome, &output, ErrorKind::PackageManagerFailed))
    }

    async fn install_file(&self, ctx: &mut ExecContext<'_>, path: &Path, _force: bool) -> Result<()> {
        let command = ChildCommand::new(&self.tools.dpkg, StatusProtocol::Dpkg).args([
            "--status-fd".to_string(),
            ctx.runner.status_fd.to_string(),
            "-i".to_string(),
            path.display().to_string(),
        ]);
        let (outcome, output) = self.run_child(ctx, command, Phase::Dpkg { total: 1 }).await?;
        if outcome.success() {
            return Ok(());
        }
        Err(classify_failure(&outcome, &output, ErrorKind::PackageManagerFailed))
    }

    async fn reconfigure(
        &self,
        ctx: &mut ExecContext<'_>,
        packages: &[String],
        priority: &str,
    ) -> Result<()> {
        let mut command = ChildCommand::new(&self.tools.dpkg_reconfigure, StatusProtocol::Apt);
        if !priority.is_empty() && priority != "default" {
            command = command.arg(format!("--priority={}", priority));
        }
        let command = command.args(packages.iter().cloned());
        let total = packages.len().max(1) as u32;
        let (outcome, output) = self.run_child(ctx, command, Phase::Dpkg { total }).await?;
        if outcome.success() {
            return Ok(());
        }
        Err(classify_failure(&outcome, &output, ErrorKind::PackageManagerFailed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY_FILES: &str = "\
Package files:
 100 /var/lib/dpkg/status
     release a=now
 500 http://deb.debian.org/debian bookworm/main amd64 Packages
     release v=12.5,o=Debian,a=stable,n=bookworm,l=Debian,c=main,b=amd64
     origin deb.debian.org
 500 http://example.com/vendor stable/non-free amd64 Packages
     release o=Vendor,a=stable,n=stable,l=Vendor,c=non-free,b=amd64
     origin example.com
Pinned packages:
";

    const POLICY_PACKAGES: &str = "\
hello:
  Installed: 2.10-2
  Candidate: 2.10-3
  Version table:
     2.10-3 500
        500 http://deb.debian.org/debian bookworm/main amd64 Packages
 *** 2.10-2 100
        100 /var/lib/dpkg/status
tool:
  Installed: (none)
  Candidate: 1.0
  Version table:
     1.0 500
        500 http://example.com/vendor stable/non-free amd64 Packages
";

    const SIMULATION: &str = "\
NOTE: This is only a simulation!
      apt-get needs root privileges for real execution.
Reading package lists...
The following additional packages will be installed:
  libfoo
The following packages will be REMOVED:
  oldpkg*
The following NEW packages will be installed:
  foo libfoo
The following packages have been kept back:
  held
The following packages will be upgraded:
  hello
WARNING: The following packages cannot be authenticated!
  foo
1 upgraded, 2 newly installed, 1 to remove and 1 not upgraded.
Need to get 1,234 kB of archives.
After this operation, 5.5 MB of additional disk space will be used.
Purg oldpkg [0.9]
Inst libfoo (1.0-1 Debian:12.5/stable [amd64])
Inst foo (1.2-1 Vendor:stable [amd64]) []
Inst hello [2.10-2] (2.10-3 Debian:12.5/stable [amd64])
Conf libfoo (1.0-1 Debian:12.5/stable [amd64])
Conf foo (1.2-1 Vendor:stable [amd64])
Conf hello (2.10-3 Debian:12.5/stable [amd64])
";

    #[test]
    fn test_parse_package_files() {
        let files = parse_package_files(POLICY_FILES);
        let debian = &files["http://deb.debian.org/debian bookworm/main amd64 Packages"];
        assert_eq!(debian.origin, "Debian");
        assert_eq!(debian.archive, "stable");
        assert_eq!(debian.codename, "bookworm");
        assert_eq!(debian.component, "main");
        assert_eq!(files["/var/lib/dpkg/status"].archive, "now");
    }

    #[test]
    fn test_parse_policy() {
        let entries = parse_policy(POLICY_PACKAGES);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "hello");
        assert_eq!(entries[0].installed.as_deref(), Some("2.10-2"));
        assert_eq!(entries[0].candidate.as_deref(), Some("2.10-3"));
        assert_eq!(entries[0].versions[0].0, "2.10-3");
        assert_eq!(
            entries[0].versions[0].1,
            vec!["http://deb.debian.org/debian bookworm/main amd64 Packages"]
        );
        assert_eq!(entries[0].versions[1].1, vec!["/var/lib/dpkg/status"]);
        assert_eq!(entries[1].installed, None);
    }

    #[test]
    fn test_parse_simulation() {
        let sim = parse_simulation(SIMULATION).unwrap();
        assert_eq!(sim.changes.install, vec!["foo=1.2-1", "libfoo=1.0-1"]);
        assert_eq!(sim.changes.upgrade, vec!["hello=2.10-3"]);
        assert_eq!(sim.changes.purge, vec!["oldpkg=0.9"]);
        assert_eq!(sim.changes.kept, vec!["held"]);
        assert_eq!(sim.unauthenticated, vec!["foo"]);
        assert_eq!(sim.download, 1_234_000);
        assert_eq!(sim.space, 5_500_000);
    }

    #[test]
    fn test_parse_simulation_errors() {
        let unmet = "\
Some packages could not be installed.
The following packages have unmet dependencies:
 baz : Depends: qux (>= 3) but 1.0 is to be installed
E: Unable to correct problems, you have held broken packages.
";
        let err = parse_simulation(unmet).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DepResolutionFailed);
        assert!(err.details().contains("baz : Depends: qux (>= 3)"));

        let missing = parse_simulation("E: Unable to locate package nope\n").unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NoPackage);

        let version = parse_simulation("E: Version '9.9' for 'bar' was not found\n").unwrap_err();
        assert_eq!(version.kind(), ErrorKind::NoPackage);

        let essential = parse_simulation(
            "WARNING: The following essential packages will be removed.\n\
             This should NOT be done unless you know exactly what you are doing!\n  base-files\n",
        )
        .unwrap_err();
        assert_eq!(essential.kind(), ErrorKind::NotRemoveEssentialPackage);
    }

    #[test]
    fn test_freed_space_is_negative() {
        let sim = parse_simulation(
            "Remv foo [1.0]\nAfter this operation, 12.3 MB disk space will be freed.\n",
        )
        .unwrap();
        assert_eq!(sim.space, -12_300_000);
        assert_eq!(sim.changes.remove, vec!["foo=1.0"]);
    }

    #[test]
    fn test_resolve_args() {
        let marks = vec![
            Mark::Install {
                name: "foo".into(),
                version: None,
            },
            Mark::Install {
                name: "bar".into(),
                version: Some("1.2".into()),
            },
            Mark::Remove {
                name: "old".into(),
                purge: true,
            },
            Mark::Downgrade {
                name: "lib".into(),
                version: "0.9".into(),
            },
        ];
        let args = resolve_args(
            &marks,
            ResolveOptions {
                remove_obsoleted: true,
            },
        );
        assert_eq!(
            args,
            vec![
                "install",
                "--purge",
                "--allow-downgrades",
                "--auto-remove",
                "foo",
                "bar=1.2",
                "old-",
                "lib=0.9"
            ]
        );
        assert_eq!(
            resolve_args(&[Mark::UpgradeAll { safe_mode: false }], ResolveOptions::default()),
            vec!["dist-upgrade"]
        );
    }

    #[test]
    fn test_commit_args() {
        let changes = Dependencies {
            install: vec!["foo=1.2-1".into()],
            upgrade: vec!["hello=2.10-3".into()],
            purge: vec!["oldpkg=0.9".into()],
            ..Default::default()
        };
        assert_eq!(
            commit_args(&changes, true),
            vec![
                "install",
                "-o",
                "APT::Get::Purge=true",
                "--allow-unauthenticated",
                "foo=1.2-1",
                "hello=2.10-3",
                "oldpkg-"
            ]
        );
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("0 B of archives"), Some(0));
        assert_eq!(parse_size("1,234 kB of archives."), Some(1_234_000));
        assert_eq!(parse_size("2.5 GB"), Some(2_500_000_000));
        assert_eq!(parse_size("nothing"), None);
    }
}
