// src/daemon/systemd.rs

//! Systemd integration for aptd
//!
//! Provides:
//! - Notification protocol (`READY=1`, `STATUS=`, `STOPPING=1`)
//! - Watchdog keep-alive pings
//! - Idle tracking for the inactivity shutdown
//!
//! aptd is bus activated. Once started it stays up while transactions are
//! queued or running, and exits after the configured inactivity window so
//! the next bus call starts a fresh instance.

use sd_notify::NotifyState;
use std::time::{Duration, Instant};
use tracing::debug;

/// Main loop period when no watchdog asks for a shorter one
const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Send notifications to systemd
///
/// Returns true if they were delivered.
fn notify(states: &[NotifyState<'_>]) -> bool {
    match sd_notify::notify(false, states) {
        Ok(()) => true,
        Err(e) => {
            debug!("sd_notify failed: {}", e);
            false
        }
    }
}

pub fn notify_ready() -> bool {
    notify(&[NotifyState::Ready])
}

pub fn notify_status(message: &str) -> bool {
    notify(&[NotifyState::Status(message)])
}

pub fn notify_watchdog() -> bool {
    notify(&[NotifyState::Watchdog])
}

pub fn notify_stopping() -> bool {
    notify(&[NotifyState::Stopping])
}

/// Watchdog timeout configured for the unit, if any
pub fn watchdog_timeout() -> Option<Duration> {
    std::env::var("WATCHDOG_USEC")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_micros)
}

/// Sends watchdog pings at a fixed interval
pub struct WatchdogTask {
    interval: Duration,
    last_ping: Instant,
}

impl WatchdogTask {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_ping: Instant::now(),
        }
    }

    /// Ping at half the configured timeout; `None` without a watchdog
    pub fn from_env() -> Option<Self> {
        watchdog_timeout().map(|timeout| Self::new(timeout / 2))
    }

    /// Send a ping if one is due; returns true if it was sent
    pub fn tick(&mut self) -> bool {
        if self.last_ping.elapsed() >= self.interval {
            self.last_ping = Instant::now();
            notify_watchdog()
        } else {
            false
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Tracks the time since the daemon last did something
#[derive(Debug)]
pub struct IdleTracker {
    timeout: Duration,
    last_activity: Instant,
}

impl IdleTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_activity: Instant::now(),
        }
    }

    /// Reset the idle timer
    pub fn activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_expired(&self) -> bool {
        self.last_activity.elapsed() >= self.timeout
    }

    pub fn time_until_timeout(&self) -> Duration {
        self.timeout.saturating_sub(self.last_activity.elapsed())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Notifications and watchdog of the running service
pub struct SystemdManager {
    watchdog: Option<WatchdogTask>,
    is_systemd: bool,
}

impl SystemdManager {
    pub fn new() -> Self {
        Self {
            watchdog: WatchdogTask::from_env(),
            is_systemd: std::env::var_os("NOTIFY_SOCKET").is_some(),
        }
    }

    pub fn is_systemd(&self) -> bool {
        self.is_systemd
    }

    pub fn notify_ready(&self, status: Option<&str>) {
        if self.is_systemd {
            notify_ready();
            if let Some(msg) = status {
                notify_status(msg);
            }
        }
    }

    pub fn notify_status(&self, message: &str) {
        if self.is_systemd {
            notify_status(message);
        }
    }

    pub fn notify_stopping(&self) {
        if self.is_systemd {
            notify_stopping();
        }
    }

    pub fn watchdog_tick(&mut self) {
        if let Some(ref mut wd) = self.watchdog {
            wd.tick();
        }
    }

    /// Period of the main loop: the watchdog interval, at most one second
    pub fn tick_interval(&self) -> Duration {
        self.watchdog
            .as_ref()
            .map(|wd| wd.interval().min(DEFAULT_TICK))
            .unwrap_or(DEFAULT_TICK)
            .max(Duration::from_millis(10))
    }
}

impl Default for SystemdManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_task() {
        let mut wd = WatchdogTask::new(Duration::from_secs(3600));
        assert_eq!(wd.interval(), Duration::from_secs(3600));
        // not due yet
        assert!(!wd.tick());
    }

    #[test]
    fn test_idle_tracker() {
        let mut tracker = IdleTracker::new(Duration::from_secs(60));
        assert!(!tracker.is_expired());
        tracker.activity();
        assert!(tracker.time_until_timeout() > Duration::ZERO);
        assert_eq!(tracker.timeout(), Duration::from_secs(60));

        let tracker = IdleTracker::new(Duration::ZERO);
        assert!(tracker.is_expired());
        assert_eq!(tracker.time_until_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_tick_interval_is_bounded() {
        let manager = SystemdManager::new();
        let interval = manager.tick_interval();
        assert!(interval > Duration::ZERO);
        assert!(interval <= DEFAULT_TICK);
    }
}
