// src/lock.rs

//! The four package-system locks
//!
//! apt and dpkg coordinate through `fcntl` record locks on four files:
//!
//! - **frontend**: `/var/lib/dpkg/lock-frontend`, taken by any frontend
//! - **status**: `/var/lib/dpkg/lock`, the dpkg database
//! - **archives**: `/var/cache/apt/archives/lock`, the download cache
//! - **lists**: `/var/lib/apt/lists/lock`, the package lists
//!
//! They are always taken in that order. A failure part way through releases
//! whatever the same call already took. The worker releases the status lock
//! and the two apt locks around children that run apt or dpkg themselves, and
//! exports `DPKG_FRONTEND_LOCKED` so they skip the frontend lock we hold.
//!
//! Locks are open-file-description locks: they conflict with dpkg's classic
//! POSIX locks and also with a second descriptor inside this process.

use crate::config::SystemPaths;
use crate::enums::{ErrorKind, Status};
use crate::error::{Error, Result};
use crate::transaction::Transaction;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum_macros::{Display, EnumIter};
use tracing::{debug, info, warn};

/// Which of the four locks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum LockKind {
    Frontend,
    Status,
    Archives,
    Lists,
}

impl LockKind {
    /// Acquisition order
    pub const ORDER: [LockKind; 4] = [
        LockKind::Frontend,
        LockKind::Status,
        LockKind::Archives,
        LockKind::Lists,
    ];

    fn path(self, paths: &SystemPaths) -> PathBuf {
        match self {
            LockKind::Frontend => paths.lock_frontend.clone(),
            LockKind::Status => paths.lock_status.clone(),
            LockKind::Archives => paths.lock_archives.clone(),
            LockKind::Lists => paths.lock_lists.clone(),
        }
    }
}

/// Why a lock could not be taken
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockFailure {
    /// Someone else holds it; the holder's process name if known
    Held {
        kind: LockKind,
        holder: Option<String>,
    },
    /// The lock file could not be opened or locked for another reason
    Failed { kind: LockKind, reason: String },
}

impl LockFailure {
    pub fn kind(&self) -> LockKind {
        match self {
            LockFailure::Held { kind, .. } | LockFailure::Failed { kind, .. } => *kind,
        }
    }

    pub fn into_error(self) -> Error {
        match self {
            LockFailure::Held { kind, holder } => Error::failed(
                ErrorKind::NoLock,
                format!(
                    "The {} lock is held by {}",
                    kind,
                    holder.as_deref().unwrap_or("another process")
                ),
            ),
            LockFailure::Failed { kind, reason } => Error::failed(
                ErrorKind::NoLock,
                format!("Failed to lock the {} lock: {}", kind, reason),
            ),
        }
    }
}

fn whole_file(lock_type: libc::c_int) -> libc::flock {
    libc::flock {
        l_type: lock_type as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    }
}

/// Take or drop a lock on the whole file without blocking
fn set_lock(file: &File, lock_type: libc::c_int) -> nix::Result<()> {
    let fl = whole_file(lock_type);
    #[cfg(target_os = "linux")]
    let arg = FcntlArg::F_OFD_SETLK(&fl);
    #[cfg(not(target_os = "linux"))]
    let arg = FcntlArg::F_SETLK(&fl);
    fcntl(file.as_raw_fd(), arg)?;
    Ok(())
}

fn conflicting_lock(file: &File) -> nix::Result<libc::flock> {
    let mut fl = whole_file(libc::F_WRLCK);
    fcntl(file.as_raw_fd(), FcntlArg::F_GETLK(&mut fl))?;
    Ok(fl)
}

/// Process name of whoever holds a lock on `path`, if anyone
pub fn lock_holder(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let fl = conflicting_lock(&file).ok()?;
    if fl.l_type == libc::F_UNLCK as libc::c_short {
        return None;
    }
    if fl.l_pid <= 0 {
        return Some("another process".to_string());
    }
    let name = fs::read_to_string(format!("/proc/{}/comm", fl.l_pid))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| format!("process {}", fl.l_pid));
    Some(name)
}

/// One lock file, held while `file` is Some
#[derive(Debug)]
struct LockFile {
    kind: LockKind,
    path: PathBuf,
    file: Option<File>,
}

impl LockFile {
    fn try_acquire(&mut self) -> std::result::Result<(), LockFailure> {
        if self.file.is_some() {
            return Ok(());
        }
        let kind = self.kind;
        let failed = |reason: String| LockFailure::Failed { kind, reason };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| failed(e.to_string()))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o640)
            .open(&self.path)
            .map_err(|e| failed(format!("{}: {}", self.path.display(), e)))?;

        match set_lock(&file, libc::F_WRLCK) {
            Ok(_) => {
                debug!("Acquired {} lock at {:?}", self.kind, self.path);
                self.file = Some(file);
                Ok(())
            }
            Err(Errno::EAGAIN | Errno::EACCES) => {
                Err(LockFailure::Held {
                    kind: self.kind,
                    holder: lock_holder(&self.path),
                })
            }
            Err(e) => Err(failed(e.to_string())),
        }
    }

    fn release(&mut self) {
        if let Some(file) = self.file.take() {
            // Closing the descriptor drops the lock; unlock explicitly anyway
            let _ = set_lock(&file, libc::F_UNLCK);
            debug!("Released {} lock at {:?}", self.kind, self.path);
        }
    }
}

/// The four locks, acquired and released as a unit
#[derive(Debug)]
pub struct LockSet {
    locks: Vec<LockFile>,
}

impl LockSet {
    pub fn new(paths: &SystemPaths) -> Self {
        let locks = LockKind::ORDER
            .iter()
            .map(|kind| LockFile {
                kind: *kind,
                path: kind.path(paths),
                file: None,
            })
            .collect();
        Self { locks }
    }

    fn lock_mut(&mut self, kind: LockKind) -> &mut LockFile {
        let idx = LockKind::ORDER
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_default();
        &mut self.locks[idx]
    }

    pub fn is_held(&self, kind: LockKind) -> bool {
        self.locks
            .iter()
            .any(|lock| lock.kind == kind && lock.file.is_some())
    }

    pub fn all_held(&self) -> bool {
        self.locks.iter().all(|lock| lock.file.is_some())
    }

    /// Take all four locks in order
    ///
    /// If one fails, the locks this call took are released again; locks that
    /// were already held before the call stay held.
    pub fn acquire(&mut self) -> std::result::Result<(), LockFailure> {
        let mut taken = Vec::new();
        for idx in 0..self.locks.len() {
            if self.locks[idx].file.is_some() {
                continue;
            }
            if let Err(failure) = self.locks[idx].try_acquire() {
                for taken_idx in taken {
                    let lock: &mut LockFile = &mut self.locks[taken_idx];
                    lock.release();
                }
                return Err(failure);
            }
            taken.push(idx);
        }
        Ok(())
    }

    /// Release every lock
    pub fn release(&mut self) {
        for lock in self.locks.iter_mut().rev() {
            lock.release();
        }
    }

    /// Drop every lock but the frontend one so an apt or dpkg child can
    /// take them itself
    pub fn release_inner(&mut self) {
        for kind in [LockKind::Lists, LockKind::Archives, LockKind::Status] {
            self.lock_mut(kind).release();
        }
    }

    /// Take the inner locks back after the child exited
    pub fn reacquire_inner(&mut self) -> std::result::Result<(), LockFailure> {
        for kind in [LockKind::Status, LockKind::Archives, LockKind::Lists] {
            let lock = self.lock_mut(kind);
            if lock.file.is_none() {
                lock.try_acquire()?;
            }
        }
        Ok(())
    }

    /// Acquire all locks, waiting while another package manager holds one
    ///
    /// While blocked the transaction shows `status-waiting-lock` with the
    /// holder's name and is paused. A cancel request ends the wait with
    /// `Error::Cancelled`; any failure other than contention is returned as
    /// a NO_LOCK error.
    pub async fn wait_for_lock(&mut self, trans: &Transaction, poll: Duration) -> Result<()> {
        let previous = trans.status();
        let mut waited = false;
        loop {
            match self.acquire() {
                Ok(()) => {
                    if waited {
                        info!("{}: acquired package system locks", trans.tid());
                        trans.set_paused(false);
                        trans.set_status_details("");
                        trans.set_status(previous);
                    }
                    return Ok(());
                }
                Err(LockFailure::Held { kind, holder }) => {
                    trans.check_cancelled()?;
                    if !waited {
                        warn!(
                            "{}: {} lock is held by {}, waiting",
                            trans.tid(),
                            kind,
                            holder.as_deref().unwrap_or("unknown")
                        );
                        waited = true;
                    }
                    trans.set_status(Status::WaitingLock);
                    trans.set_paused(true);
                    trans.set_status_details(format!(
                        "Waiting for {} to exit",
                        holder.as_deref().unwrap_or("another package manager")
                    ));
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = trans.wait_for(|s| s.cancelled) => {}
                    }
                }
                Err(failure) => return Err(failure.into_error()),
            }
        }
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.release();
    }
}
