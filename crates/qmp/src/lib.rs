// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A typed client for the QEMU Machine Protocol (QMP).
//!
//! QMP is a JSON-over-UNIX-socket control channel exposed by a running
//! QEMU process. The protocol is request/response with interleaved
//! asynchronous events:
//!
//! ```text
//!  client                                    QEMU
//!    |  <----------- greeting ----------------|
//!    |  ----------- qmp_capabilities -------->|
//!    |  <----------- {"return": {}} ----------|
//!    |  ----------- {"execute": ..., "id"} -->|
//!    |  <----------- {"event": ...} ----------|   (any time)
//!    |  <----------- {"return"/"error", "id"}-|
//! ```
//!
//! A [`Monitor`] owns the socket through a single reader task that
//! demultiplexes responses (correlated by a monotonic request ID) and
//! events (forwarded to a channel supplied at connect time). Any number
//! of callers may issue commands concurrently; each caller suspends on
//! a oneshot until the reader delivers its reply.

use serde_json::Value;
use thiserror::Error;

mod messages;
mod monitor;

pub use messages::{ChardevChange, Event, FdsetInfo, QmpError};
pub use monitor::{Monitor, MonitorConfig};

/// The QMP event emitted when the VM shuts down.
pub const EVENT_SHUTDOWN: &str = "SHUTDOWN";

/// The QMP event emitted when the in-guest agent opens its vsock port.
pub const EVENT_AGENT_STARTED: &str = "GUEST_AGENT_STARTED";

/// The QMP event emitted when the guest changes the RTC offset.
pub const EVENT_RTC_CHANGE: &str = "RTC_CHANGE";

/// Shutdown reason synthesized by the monitor itself when the control
/// socket disconnects rather than QEMU reporting a guest shutdown.
pub const SHUTDOWN_REASON_DISCONNECT: &str = "host-signal";

/// Shutdown reason reported by QEMU when the guest requested a reset.
pub const SHUTDOWN_REASON_GUEST_RESET: &str = "guest-reset";

/// Errors surfaced by the QMP client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error on monitor socket: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode or decode a QMP message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out connecting to the monitor socket")]
    ConnectTimeout,

    #[error("monitor is disconnected")]
    Disconnected,

    #[error("command {command} timed out after {timeout:?}")]
    CommandTimeout {
        command: &'static str,
        timeout: std::time::Duration,
    },

    #[error("QEMU rejected {command}: {error}")]
    Command { command: &'static str, error: QmpError },

    #[error("unexpected response payload for {command}: {response}")]
    UnexpectedResponse { command: &'static str, response: Value },

    #[error("chardev {0} is not a ring buffer")]
    NotARingbuf(String),

    #[error("migration entered state {0:?} while waiting for {1:?}")]
    MigrationFailed(String, String),
}

impl Error {
    /// True if this error represents the monitor socket going away, as
    /// opposed to QEMU rejecting a command.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::Disconnected)
    }

    /// True if QEMU refused the command because the node is still held
    /// by another user (e.g. a block job that has not released it yet).
    /// Callers retry `blockdev-del` on this.
    pub fn is_locked(&self) -> bool {
        match self {
            Error::Command { error, .. } => {
                error.desc.to_lowercase().contains("locked")
                    || error.desc.contains("in use")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
