// tests/common/mod.rs

//! Shared fixtures for the daemon integration tests.

#![allow(dead_code)]

use aptd::auth::StaticAuthority;
use aptd::config::{BackendKind, DaemonConfig, Timeouts};
use aptd::daemon::DaemonState;
use aptd::worker::memory::{MemorySystem, Universe};
use aptd::worker::Worker;
use aptd::{Caller, ExitState, Transaction, TransactionEvent};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::sync::broadcast;

/// A daemon over the in-memory package system, rooted in a temp dir
///
/// Keep it alive for the whole test; dropping it removes the root.
pub struct TestDaemon {
    pub dir: TempDir,
    pub system: Arc<MemorySystem>,
    pub authority: Arc<StaticAuthority>,
    pub state: Arc<DaemonState>,
}

pub struct Builder {
    universe: Universe,
    authority: StaticAuthority,
    timeouts: Timeouts,
    gate: Option<Arc<Semaphore>>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            universe: Universe::demo(),
            authority: StaticAuthority::allow_all(),
            timeouts: Timeouts::default(),
            gate: None,
        }
    }

    pub fn universe(mut self, universe: Universe) -> Self {
        self.universe = universe;
        self
    }

    pub fn authority(mut self, authority: StaticAuthority) -> Self {
        self.authority = authority;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Every installed package takes one permit from `gate`
    pub fn gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn start(self) -> TestDaemon {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::default()
            .with_root(dir.path())
            .with_backend(BackendKind::Memory)
            .with_timeouts(self.timeouts);
        let mut system =
            MemorySystem::new(self.universe).with_journal_dir(config.paths.dpkg_updates.clone());
        if let Some(gate) = self.gate {
            system = system.with_install_gate(gate);
        }
        let system = Arc::new(system);
        let worker = Worker::new(Arc::new(config), system.clone());
        let authority = Arc::new(self.authority);
        let state = DaemonState::start(worker, authority.clone());
        TestDaemon {
            dir,
            system,
            authority,
            state,
        }
    }
}

pub fn daemon() -> TestDaemon {
    Builder::new().start()
}

pub fn user() -> Caller {
    Caller::new(4242, 1000, 1000)
}

pub fn other_user() -> Caller {
    Caller::new(4343, 1001, 1001)
}

pub async fn finish(trans: &Transaction) -> ExitState {
    tokio::time::timeout(Duration::from_secs(10), trans.wait_until_finished())
        .await
        .expect("transaction did not finish")
}

pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition never held");
}

/// Everything emitted so far, without waiting
pub fn drain(rx: &mut broadcast::Receiver<TransactionEvent>) -> Vec<TransactionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
