// src/runner/mod.rs

//! Running package manager children under a pseudo terminal
//!
//! Every apt-get, dpkg or dpkg-reconfigure invocation goes through
//! [`ChildRunner`]. The child:
//!
//! - runs in its own session with a fresh pty as controlling terminal and stdio
//! - gets a pipe on fd 3 (configurable) for machine-readable status lines
//! - inherits the transaction's locale, proxy and debconf environment
//!
//! The parent multiplexes the status pipe, the pty output (appended to the
//! transaction's output log with escapes removed), keystrokes from an
//! attached client terminal, and the child's exit. A child that is silent
//! for longer than the liveness timeout is killed.
//!
//! Configuration file prompts and medium requests pause the transaction until
//! the client answers, then the runner types the answer into the pty.
//!
//! A cancel request stops the child at once while the transaction is
//! cancellable. A deferred request is honoured at the next status line,
//! unless dpkg has started: from then on it waits for the child to exit.

mod status;
mod terminal;

pub use status::{parse_apt_status, parse_dpkg_status, StatusEvent, StatusProtocol};
pub use terminal::{strip_ansi, RawModeGuard};

use crate::enums::{ConflictAnswer, ErrorKind, Status};
use crate::error::{Error, Result};
use crate::transaction::Transaction;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::net::unix::pipe;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long to keep reading leftovers after the child exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// A program to run for a transaction
#[derive(Debug, Clone)]
pub struct ChildCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub protocol: StatusProtocol,
}

impl ChildCommand {
    pub fn new(program: impl Into<PathBuf>, protocol: StatusProtocol) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            protocol,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn display(&self) -> String {
        self.program.display().to_string()
    }
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Descriptor number the child writes status lines to
    pub status_fd: RawFd,
    /// Kill the child after this long without status or output
    pub liveness: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            status_fd: 3,
            liveness: Duration::from_secs(600),
        }
    }
}

/// How a child ended
#[derive(Debug)]
pub struct ChildOutcome {
    pub status: ExitStatus,
    /// Error lines reported on the status descriptor
    pub errors: Vec<String>,
}

impl ChildOutcome {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

enum Step {
    Status(io::Result<Option<String>>),
    Output(io::Result<usize>),
    Input(io::Result<usize>),
    Exited(io::Result<ExitStatus>),
    Cancelled,
    Stalled,
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

nix::ioctl_write_int_bad!(set_controlling_tty, libc::TIOCSCTTY);

/// Runs between fork and exec: new session, pty as controlling terminal,
/// status pipe on `target`
fn child_setup(status_fd: RawFd, target: RawFd) -> io::Result<()> {
    nix::unistd::setsid()?;
    // SAFETY: stdin is the pty slave the child was given
    unsafe { set_controlling_tty(0, 0) }?;
    if status_fd == target {
        fcntl(target, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        nix::unistd::dup2(status_fd, target)?;
    }
    Ok(())
}

async fn read_fd(fd: &AsyncFd<File>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| {
            let mut file: &File = inner.get_ref();
            file.read(buf)
        }) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

async fn read_optional(fd: Option<&AsyncFd<File>>, buf: &mut [u8]) -> io::Result<usize> {
    match fd {
        Some(fd) => read_fd(fd, buf).await,
        None => std::future::pending().await,
    }
}

async fn write_all_fd(fd: &AsyncFd<File>, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        let mut guard = fd.writable().await?;
        match guard.try_io(|inner| {
            let mut file: &File = inner.get_ref();
            file.write(data)
        }) {
            Ok(Ok(n)) => data = &data[n..],
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

fn open_terminal(path: &str) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)
}

/// Drives one child process on behalf of a transaction
pub struct ChildRunner<'a> {
    trans: &'a Transaction,
    options: RunnerOptions,
}

impl<'a> ChildRunner<'a> {
    pub fn new(trans: &'a Transaction, options: RunnerOptions) -> Self {
        Self { trans, options }
    }

    /// Run `command` to completion, feeding every status line to `handler`
    ///
    /// Returns `Err(Cancelled)` if the transaction was cancelled while
    /// cancellable (the child is killed), and a PACKAGE_MANAGER_FAILED error
    /// if the child could not be started or stopped responding. A non-zero
    /// exit is not an error here; callers classify it.
    pub async fn run(
        &self,
        command: ChildCommand,
        handler: &mut (dyn FnMut(&StatusEvent) + Send),
    ) -> Result<ChildOutcome> {
        let trans = self.trans;
        let name = command.display();

        let terminal = match trans.terminal() {
            Some(path) => match open_terminal(&path) {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!("{}: cannot attach terminal {}: {}", trans.tid(), path, e);
                    None
                }
            },
            None => None,
        };
        let winsize = terminal.as_ref().and_then(terminal::window_size);
        let pty = nix::pty::openpty(winsize.as_ref(), None::<&nix::sys::termios::Termios>)?;
        set_cloexec(pty.master.as_raw_fd())?;
        set_cloexec(pty.slave.as_raw_fd())?;
        let (status_rx, status_tx) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;

        let slave: OwnedFd = pty.slave;
        let stdin = slave.try_clone()?;
        let stdout = slave.try_clone()?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(trans.child_env())
            .envs(command.env.iter().cloned())
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(slave))
            .kill_on_drop(true);
        let status_raw = status_tx.as_raw_fd();
        let target = self.options.status_fd;
        // SAFETY: child_setup only makes async-signal-safe calls
        unsafe {
            cmd.pre_exec(move || child_setup(status_raw, target));
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::failed(
                ErrorKind::PackageManagerFailed,
                format!("Failed to run {}: {}", name, e),
            )
        })?;
        drop(cmd);
        drop(status_tx);
        info!(
            "{}: started {} {} (pid {})",
            trans.tid(),
            name,
            command.args.join(" "),
            child.id().unwrap_or_default()
        );

        set_nonblocking(pty.master.as_raw_fd())?;
        let duplex = Interest::READABLE | Interest::WRITABLE;
        let master = AsyncFd::with_interest(File::from(pty.master), duplex)?;
        let mut status_lines = BufReader::new(pipe::Receiver::from_owned_fd(status_rx)?).lines();

        let terminal = match terminal {
            Some(file) => {
                set_nonblocking(file.as_raw_fd())?;
                Some(AsyncFd::with_interest(file, duplex)?)
            }
            None => None,
        };
        let _raw_mode = terminal
            .as_ref()
            .and_then(|t| RawModeGuard::new(t.get_ref()).ok());
        if terminal.is_some() {
            trans.set_terminal_attached(true);
        }

        let liveness = self.options.liveness;
        let mut deadline = Instant::now() + liveness;
        let mut status_open = true;
        let mut master_open = true;
        let mut terminal_open = terminal.is_some();
        let mut output = vec![0u8; 4096];
        let mut input = vec![0u8; 1024];
        let mut errors = Vec::new();
        let mut dpkg_phase = command.protocol == StatusProtocol::Dpkg;

        let result: Result<ExitStatus> = loop {
            let step = tokio::select! {
                line = status_lines.next_line(), if status_open => Step::Status(line),
                n = read_fd(&master, &mut output), if master_open => Step::Output(n),
                n = read_optional(terminal.as_ref(), &mut input), if terminal_open => Step::Input(n),
                status = child.wait() => Step::Exited(status),
                _ = trans.wait_for(|s| s.cancelled && s.cancellable) => Step::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Step::Stalled,
            };

            match step {
                Step::Status(Ok(Some(line))) => {
                    deadline = Instant::now() + liveness;
                    if let Err(e) = self
                        .on_status_line(
                            &line,
                            command.protocol,
                            &master,
                            handler,
                            &mut errors,
                            &mut dpkg_phase,
                        )
                        .await
                    {
                        break Err(e);
                    }
                }
                Step::Status(_) => status_open = false,
                Step::Output(Ok(0)) | Step::Output(Err(_)) => master_open = false,
                Step::Output(Ok(n)) => {
                    deadline = Instant::now() + liveness;
                    self.record_output(&output[..n]);
                    if let Some(ref t) = terminal {
                        let _ = write_all_fd(t, &output[..n]).await;
                    }
                }
                Step::Input(Ok(n)) if n > 0 => {
                    let _ = write_all_fd(&master, &input[..n]).await;
                }
                Step::Input(_) => terminal_open = false,
                Step::Exited(status) => break status.map_err(Error::from),
                Step::Cancelled => {
                    info!("{}: cancelling {}", trans.tid(), name);
                    trans.set_status(Status::Cancelling);
                    break Err(Error::Cancelled);
                }
                Step::Stalled => {
                    warn!(
                        "{}: {} produced nothing for {:?}, killing it",
                        trans.tid(),
                        name,
                        liveness
                    );
                    break Err(Error::failed(
                        ErrorKind::PackageManagerFailed,
                        format!("{} stopped responding", name),
                    ));
                }
            }
        };

        let status = match result {
            Ok(status) => status,
            Err(e) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                if terminal.is_some() {
                    trans.set_terminal_attached(false);
                }
                return Err(e);
            }
        };

        // Leftovers written just before exit
        while status_open {
            match tokio::time::timeout(DRAIN_TIMEOUT, status_lines.next_line()).await {
                Ok(Ok(Some(line))) => {
                    if let Some(event) = command.protocol.parse(&line) {
                        Self::collect_error(&event, &mut errors);
                        handler(&event);
                    }
                }
                _ => status_open = false,
            }
        }
        while master_open {
            match tokio::time::timeout(DRAIN_TIMEOUT, read_fd(&master, &mut output)).await {
                Ok(Ok(n)) if n > 0 => self.record_output(&output[..n]),
                _ => master_open = false,
            }
        }
        if terminal.is_some() {
            trans.set_terminal_attached(false);
        }

        debug!("{}: {} exited with {}", trans.tid(), name, status);
        Ok(ChildOutcome { status, errors })
    }

    fn record_output(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        self.trans.append_output(&strip_ansi(&text));
    }

    fn collect_error(event: &StatusEvent, errors: &mut Vec<String>) {
        match event {
            StatusEvent::PackageError { package, message }
            | StatusEvent::DpkgError { package, message } => {
                errors.push(format!("{}: {}", package, message));
            }
            _ => {}
        }
    }

    async fn on_status_line(
        &self,
        line: &str,
        protocol: StatusProtocol,
        master: &AsyncFd<File>,
        handler: &mut (dyn FnMut(&StatusEvent) + Send),
        errors: &mut Vec<String>,
        dpkg_phase: &mut bool,
    ) -> Result<()> {
        let Some(event) = protocol.parse(line) else {
            debug!("{}: unparsed status line: {}", self.trans.tid(), line);
            return Ok(());
        };

        match &event {
            StatusEvent::ConfigFileConflict { old, new } => {
                self.answer_config_file(master, old, new).await?;
            }
            StatusEvent::MediaChange { label, drive } => {
                self.wait_for_medium(master, label, drive).await?;
            }
            StatusEvent::PackageError { package, message }
            | StatusEvent::DpkgError { package, message } => {
                warn!("{}: {}: {}", self.trans.tid(), package, message);
            }
            _ => {}
        }
        if matches!(
            event,
            StatusEvent::Package { .. }
                | StatusEvent::PackageError { .. }
                | StatusEvent::ConfigFileConflict { .. }
        ) {
            *dpkg_phase = true;
        }
        Self::collect_error(&event, errors);
        handler(&event);

        // Status lines are safe points, except for a deferred cancel once
        // dpkg is running
        let phase = *dpkg_phase;
        if self
            .trans
            .with_state(|s| s.cancelled && (s.cancellable || !phase))
        {
            self.trans.set_status(Status::Cancelling);
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    async fn answer_config_file(&self, master: &AsyncFd<File>, old: &str, new: &str) -> Result<()> {
        let trans = self.trans;
        let resume = match trans.status() {
            Status::WaitingConfigFilePrompt | Status::WaitingMedium => Status::Committing,
            other => other,
        };
        info!("{}: asking about configuration file {}", trans.tid(), old);
        trans.request_config_file_answer(old, new);
        trans.wait_for(|s| !s.paused || s.cancelled).await;

        // dpkg cannot be stopped halfway, so a cancel keeps the old file and
        // lets it finish
        let answer = trans.finish_config_file_prompt(resume);
        let reply: &[u8] = match answer {
            Some(ConflictAnswer::Replace) => b"y\n",
            Some(ConflictAnswer::Keep) => b"n\n",
            None if trans.cancelled() => {
                info!("{}: cancelled at {}, keeping it", trans.tid(), old);
                b"n\n"
            }
            None => {
                warn!("{}: no answer for {}, keeping it", trans.tid(), old);
                b"n\n"
            }
        };
        write_all_fd(master, reply).await?;
        Ok(())
    }

    async fn wait_for_medium(&self, master: &AsyncFd<File>, label: &str, drive: &str) -> Result<()> {
        let trans = self.trans;
        let resume = trans.status();
        info!("{}: waiting for medium '{}' in {}", trans.tid(), label, drive);
        trans.request_medium(label, drive);
        trans.wait_for(|s| !s.paused || s.cancelled).await;
        if trans.cancelled() {
            trans.clear_required_medium(Status::Cancelling);
            return Err(Error::Cancelled);
        }
        trans.clear_required_medium(resume);
        write_all_fd(master, b"\n").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::Role;
    use crate::transaction::{Caller, PackageSets, RoleArgs};
    use std::sync::Arc;

    fn trans() -> Arc<Transaction> {
        let trans = Transaction::new(
            Role::InstallPackages,
            Caller::new(1, 1000, 1000),
            PackageSets::install(vec!["foo".into()]),
            RoleArgs::None,
        );
        Arc::new(trans)
    }

    fn sh(script: &str) -> ChildCommand {
        ChildCommand::new("/bin/sh", StatusProtocol::Apt).args(["-c", script])
    }

    fn options(liveness: Duration) -> RunnerOptions {
        RunnerOptions {
            status_fd: 3,
            liveness,
        }
    }

    #[tokio::test]
    async fn test_status_lines_and_output() {
        let trans = trans();
        let script = r#"
echo "pmstatus:foo:25.0:Unpacking foo" >&3
echo "Setting up foo"
echo "pmerror:foo:50:something broke" >&3
exit 3
"#;
        let mut seen = Vec::new();
        let outcome = ChildRunner::new(&trans, options(Duration::from_secs(30)))
            .run(sh(script), &mut |event: &StatusEvent| seen.push(event.clone()))
            .await
            .unwrap();
        assert_eq!(outcome.status.code(), Some(3));
        assert_eq!(outcome.errors, vec!["foo: something broke"]);
        assert!(seen.contains(&StatusEvent::Package {
            package: "foo".into(),
            percent: 25.0,
            message: "Unpacking foo".into(),
        }));
        assert!(trans.output().contains("Setting up foo"));
    }

    #[tokio::test]
    async fn test_child_env_passed() {
        let trans = trans();
        trans.set_locale("de_DE.UTF-8").unwrap();
        let script = r#"echo "lang=$LANG frontend=$DEBIAN_FRONTEND custom=$CUSTOM""#;
        let cmd = sh(script).env("CUSTOM", "yes");
        ChildRunner::new(&trans, options(Duration::from_secs(30)))
            .run(cmd, &mut |_: &StatusEvent| {})
            .await
            .unwrap();
        assert!(trans
            .output()
            .contains("lang=de_DE.UTF-8 frontend=noninteractive custom=yes"));
    }

    #[tokio::test]
    async fn test_config_file_prompt_keeps_on_answer() {
        let trans = trans();
        trans.set_status(Status::Committing);
        trans.set_cancellable(false);
        let script = r#"
echo "pmstatus:foo:40:Configuring foo" >&3
echo "pmconffile:/etc/foo.conf:40: '/etc/foo.conf' '/etc/foo.conf.dpkg-new' 1 1" >&3
read answer
echo "answer=$answer"
echo "pmstatus:foo:90:Installed foo" >&3
"#;
        let runner_trans = trans.clone();
        let run = tokio::spawn(async move {
            ChildRunner::new(&runner_trans, options(Duration::from_secs(30)))
                .run(sh(script), &mut |_: &StatusEvent| {})
                .await
        });

        trans
            .wait_for(|s| s.status == Status::WaitingConfigFilePrompt)
            .await;
        assert!(trans.paused());
        let conflict = trans.snapshot().config_file_conflict.unwrap();
        assert_eq!(conflict.old, "/etc/foo.conf");
        assert_eq!(conflict.new, "/etc/foo.conf.dpkg-new");

        trans
            .resolve_config_file_conflict("/etc/foo.conf", ConflictAnswer::Keep)
            .unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(outcome.success());
        assert!(trans.output().contains("answer=n"));
        assert_eq!(trans.status(), Status::Committing);
        assert!(!trans.paused());
    }

    #[tokio::test]
    async fn test_config_file_prompt_replace() {
        let trans = trans();
        trans.set_status(Status::Committing);
        let script = r#"
echo "pmconffile:/etc/bar.conf:10: '/etc/bar.conf' '/etc/bar.conf.dpkg-new' 1 1" >&3
read answer
echo "answer=$answer"
"#;
        let runner_trans = trans.clone();
        let run = tokio::spawn(async move {
            ChildRunner::new(&runner_trans, options(Duration::from_secs(30)))
                .run(sh(script), &mut |_: &StatusEvent| {})
                .await
        });
        trans
            .wait_for(|s| s.status == Status::WaitingConfigFilePrompt)
            .await;
        trans
            .resolve_config_file_conflict("/etc/bar.conf", ConflictAnswer::Replace)
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(trans.output().contains("answer=y"));
    }

    #[tokio::test]
    async fn test_cancel_during_config_file_prompt_keeps_file() {
        let trans = trans();
        trans.set_status(Status::Committing);
        trans.set_cancellable(false);
        let script = r#"
echo "pmconffile:/etc/foo.conf:40: '/etc/foo.conf' '/etc/foo.conf.dpkg-new' 1 1" >&3
read answer
echo "answer=$answer"
"#;
        let runner_trans = trans.clone();
        let run = tokio::spawn(async move {
            ChildRunner::new(&runner_trans, options(Duration::from_secs(2)))
                .run(sh(script), &mut |_: &StatusEvent| {})
                .await
        });
        trans
            .wait_for(|s| s.status == Status::WaitingConfigFilePrompt)
            .await;
        assert_eq!(
            trans.request_cancel(),
            crate::transaction::CancelRequest::Deferred
        );

        let outcome = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(outcome.success());
        assert!(trans.output().contains("answer=n"));
        assert!(!trans.paused());
        assert!(trans.cancelled());
        assert_eq!(trans.status(), Status::Committing);
        assert!(trans.snapshot().config_file_conflict.is_none());
    }

    #[tokio::test]
    async fn test_cancel_kills_cancellable_child() {
        let trans = trans();
        trans.set_status(Status::Downloading);
        let script = r#"
i=0
while true; do
  i=$((i+1))
  echo "dlstatus:$i:1:Retrieving file $i" >&3
  sleep 0.05
done
"#;
        let runner_trans = trans.clone();
        let run = tokio::spawn(async move {
            ChildRunner::new(&runner_trans, options(Duration::from_secs(30)))
                .run(sh(script), &mut |_: &StatusEvent| {})
                .await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        trans.request_cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(trans.status(), Status::Cancelling);
    }

    #[tokio::test]
    async fn test_deferred_cancel_honoured_at_download_line() {
        let trans = trans();
        trans.set_cancellable(false);
        assert_eq!(trans.request_cancel(), crate::transaction::CancelRequest::Deferred);
        assert_eq!(trans.exit(), crate::enums::ExitState::Unfinished);

        let script = r#"
echo "dlstatus:1:5:Retrieving file 1" >&3
sleep 5
"#;
        let result = ChildRunner::new(&trans, options(Duration::from_secs(30)))
            .run(sh(script), &mut |_: &StatusEvent| {})
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(trans.status(), Status::Cancelling);
    }

    #[tokio::test]
    async fn test_deferred_cancel_waits_for_dpkg() {
        let trans = trans();
        trans.set_cancellable(false);
        trans.request_cancel();
        let script = r#"
echo "pmstatus:foo:10:Unpacking foo" >&3
echo "pmstatus:foo:90:Setting up foo" >&3
"#;
        let outcome = ChildRunner::new(&trans, options(Duration::from_secs(30)))
            .run(sh(script), &mut |_: &StatusEvent| {})
            .await
            .unwrap();
        assert!(outcome.success());
        assert!(trans.cancelled());
    }

    #[tokio::test]
    async fn test_silent_child_is_killed() {
        let trans = trans();
        let result = ChildRunner::new(&trans, options(Duration::from_millis(300)))
            .run(sh("sleep 30"), &mut |_: &StatusEvent| {})
            .await;
        match result {
            Err(Error::Failed { kind, .. }) => assert_eq!(kind, ErrorKind::PackageManagerFailed),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let trans = trans();
        let cmd = ChildCommand::new("/nonexistent/apt-get", StatusProtocol::Apt);
        let result = ChildRunner::new(&trans, RunnerOptions::default())
            .run(cmd, &mut |_: &StatusEvent| {})
            .await;
        assert!(matches!(
            result,
            Err(Error::Failed {
                kind: ErrorKind::PackageManagerFailed,
                ..
            })
        ));
    }
}
