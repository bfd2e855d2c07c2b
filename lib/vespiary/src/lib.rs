// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! vespiary: a driver that realizes declarative virtual-machine
//! instance descriptions as running QEMU processes with a controlled
//! lifecycle.
//!
//! The driver coordinates five concerns:
//!
//! - expanding config keys, profiles, and device maps into a QEMU
//!   machine configuration and command line ([`config`], [`qconf`]);
//! - driving the live QMP control channel for hotplug, migration and
//!   introspection (the `qmp` crate, consumed by [`hotplug`] and
//!   [`migrate`]);
//! - maintaining a durable, operation-locked lifecycle state machine
//!   ([`instance`], [`oplock`]);
//! - orchestrating live QEMU-to-QEMU migration with concurrent storage
//!   transfer ([`migrate`]);
//! - unwinding partial failure through an all-or-nothing reverter
//!   discipline ([`revert`]).
//!
//! External collaborators (storage drivers, network device drivers,
//! the volatile-key database, security sandboxing, the in-guest agent
//! channel) appear only as traits in [`storage`], [`device`] and
//! [`instance`]; this crate defines the contracts it consumes but no
//! implementations of them.

use thiserror::Error;

pub mod config;
pub mod console;
pub mod device;
pub mod hotplug;
pub mod instance;
pub mod migrate;
pub mod oplock;
pub mod qconf;
pub mod revert;
pub mod storage;
pub mod supervisor;
pub mod vsock;

/// Top-level driver error. The variants follow the operational
/// taxonomy: preconditions surface directly with no side effects,
/// resource conflicts are retryable, protocol and storage failures have
/// run the reverter by the time they surface.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no root disk device (path \"/\") in expanded devices")]
    MissingRootDisk,

    #[error("unsupported architecture {0:?}")]
    UnsupportedArchitecture(String),

    #[error("KVM is not available on this host")]
    KvmMissing,

    #[error(transparent)]
    Oplock(#[from] oplock::LockError),

    #[error("no free vsock context ID could be acquired")]
    VsockExhausted,

    #[error(transparent)]
    Qmp(#[from] qmp::Error),

    #[error(
        "instance is in an error state (QEMU process {pid} is alive but \
         unresponsive); only a forced stop is permitted"
    )]
    ErrorState { pid: i32 },

    #[error(transparent)]
    Storage(#[from] storage::StorageError),

    #[error(transparent)]
    Migrate(#[from] migrate::MigrateError),

    #[error("instance is not running")]
    NotRunning,

    #[error("instance is already running")]
    AlreadyRunning,

    #[error("instance agent is not currently running")]
    AgentOffline,

    #[error("device {device}: {source}")]
    Device {
        device: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
