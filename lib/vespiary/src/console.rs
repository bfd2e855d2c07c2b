// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Console plumbing.
//!
//! The guest console normally feeds a QEMU-internal ring buffer which
//! is drained into a persistent `console.log` on retrieval. An
//! interactive attach swaps the chardev backend to a listening UNIX
//! socket and back again afterwards; swapping wipes the ring buffer,
//! so it is always drained to the log file first.

use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use qmp::{ChardevChange, Monitor};
use tokio::net::UnixListener;

use crate::Result;

/// The chardev ID of the guest console.
pub const CONSOLE_CHARDEV: &str = "console";

/// Drains the console ring buffer, appends any new output to the
/// persistent log file, and returns the complete accumulated log.
///
/// A console whose chardev is currently a socket (attached session)
/// has nothing to drain; the persistent file alone is returned.
pub async fn console_log(
    monitor: &Monitor,
    log_path: &Path,
) -> Result<String> {
    match monitor.ringbuf_read(CONSOLE_CHARDEV).await {
        Ok(output) if !output.is_empty() => {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?;
            file.write_all(output.as_bytes())?;
        }
        Ok(_) => {}
        Err(qmp::Error::NotARingbuf(_)) => {}
        Err(e) => return Err(e.into()),
    }

    match std::fs::read_to_string(log_path) {
        Ok(full) => Ok(full),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(String::new())
        }
        Err(e) => Err(e.into()),
    }
}

/// Swaps the console to a socket backend for an interactive session.
/// Returns the listener the caller connects through; keep it alive for
/// the duration of the session.
pub async fn swap_ringbuf_with_socket(
    monitor: &Arc<Monitor>,
    console_path: &Path,
    log_path: &Path,
) -> Result<UnixListener> {
    // The swap discards ring buffer contents; preserve them first.
    console_log(monitor, log_path).await?;

    let _ = std::fs::remove_file(console_path);
    let listener = UnixListener::bind(console_path)?;

    monitor
        .chardev_change(
            CONSOLE_CHARDEV,
            ChardevChange::Socket { fd_name: "consoleSocket".to_string() },
            Some(listener.as_raw_fd()),
        )
        .await?;

    Ok(listener)
}

/// Swaps the console back to the ring buffer backend and removes the
/// session socket.
pub async fn swap_socket_with_ringbuf(
    monitor: &Arc<Monitor>,
    console_path: &Path,
) -> Result<()> {
    monitor
        .chardev_change(CONSOLE_CHARDEV, ChardevChange::Ringbuf, None)
        .await?;
    let _ = std::fs::remove_file(console_path);
    Ok(())
}
