// src/lib.rs

//! aptd: a transaction daemon for APT
//!
//! Unprivileged clients ask the daemon over D-Bus to install, remove or
//! upgrade packages, refresh the package lists or edit the software sources.
//! Every request becomes a [`Transaction`] that is simulated, authorized via
//! PolicyKit, queued, and finally executed by the single worker while it
//! holds the dpkg and apt locks.
//!
//! # Architecture
//!
//! - [`daemon`]: request validation, transaction registry, idle shutdown
//! - [`dbus`]: the `org.debian.apt` objects, a thin layer over the daemon
//! - [`queue`]: limbo, FIFO order, one running transaction, chaining
//! - [`auth`]: PolicyKit actions and the authorization gate
//! - [`worker`]: simulation and execution against apt-get/dpkg or an
//!   in-memory package model
//! - [`runner`]: package manager children on a pty with a status pipe
//! - [`lock`]: the four dpkg/apt lock files

pub mod auth;
pub mod config;
pub mod crash;
pub mod daemon;
pub mod dbus;
pub mod enums;
mod error;
pub mod lock;
pub mod queue;
pub mod runner;
pub mod transaction;
pub mod version;
pub mod worker;

pub use enums::{ConflictAnswer, ErrorKind, ExitState, Role, Status};
pub use error::{Error, Result};
pub use transaction::{Caller, PackageSets, Transaction, TransactionEvent};
