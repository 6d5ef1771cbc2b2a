// src/runner/terminal.rs

//! Terminal helpers: escape stripping for the output log and raw mode for an
//! attached client terminal

use nix::sys::termios::{self, SetArg, Termios};
use regex::Regex;
use std::fs::File;
use std::os::fd::AsFd;
use std::sync::LazyLock;
use tracing::warn;

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(\[[0-9;?]*[ -/]*[@-~]|\][^\x07\x1b]*(\x07|\x1b\\)|[()][A-Za-z0-9]|[=>78cDEHM])")
        .expect("valid regex")
});

/// Remove terminal control sequences and carriage returns
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").replace('\r', "")
}

/// Puts a terminal into raw mode and restores the saved settings on drop
pub struct RawModeGuard<'a> {
    terminal: &'a File,
    saved: Termios,
}

impl<'a> RawModeGuard<'a> {
    pub fn new(terminal: &'a File) -> nix::Result<Self> {
        let saved = termios::tcgetattr(terminal.as_fd())?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(terminal.as_fd(), SetArg::TCSANOW, &raw)?;
        Ok(Self { terminal, saved })
    }
}

impl Drop for RawModeGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = termios::tcsetattr(self.terminal.as_fd(), SetArg::TCSADRAIN, &self.saved) {
            warn!("Failed to restore terminal settings: {}", e);
        }
    }
}

/// Window size of `terminal`, used to size the child's pty
pub fn window_size(terminal: &File) -> Option<libc::winsize> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: winsize is plain old data
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    // SAFETY: valid fd and a writable winsize
    let rc = unsafe { libc::ioctl(terminal.as_raw_fd(), libc::TIOCGWINSZ as _, &mut ws as *mut libc::winsize) };
    (rc == 0 && ws.ws_col > 0).then_some(ws)
}
