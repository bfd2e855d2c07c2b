// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-instance filesystem layout.
//!
//! Three roots: the instance directory on its storage volume (durable
//! state: NVRAM, config drive, agent material, saved state), the run
//! directory (sockets and the PID file), and the log directory.

use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct InstancePaths {
    instance_dir: PathBuf,
    run_dir: PathBuf,
    log_dir: PathBuf,
}

impl InstancePaths {
    pub fn new(
        instance_dir: impl Into<PathBuf>,
        run_dir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            instance_dir: instance_dir.into(),
            run_dir: run_dir.into(),
            log_dir: log_dir.into(),
        }
    }

    pub fn instance_dir(&self) -> &Path {
        &self.instance_dir
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// The active EFI vars symlink.
    pub fn nvram(&self) -> PathBuf {
        self.instance_dir.join("qemu.nvram")
    }

    /// The 9p/virtiofs-shared drive with agent binary and configs.
    pub fn config_drive(&self) -> PathBuf {
        self.instance_dir.join("config")
    }

    /// Saved VM state for stateful stop and stateful snapshots.
    pub fn state_file(&self) -> PathBuf {
        self.instance_dir.join("state")
    }

    /// CoW overlay receiving guest writes during live migration.
    pub fn migration_snapshot(&self) -> PathBuf {
        self.instance_dir.join("migration_snapshot.qcow2")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.run_dir.join("qemu.pid")
    }

    pub fn monitor_socket(&self) -> PathBuf {
        self.run_dir.join("qemu.monitor")
    }

    pub fn console_socket(&self) -> PathBuf {
        self.run_dir.join("qemu.console")
    }

    pub fn spice_socket(&self) -> PathBuf {
        self.run_dir.join("qemu.spice")
    }

    pub fn qemu_conf(&self) -> PathBuf {
        self.run_dir.join("qemu.conf")
    }

    pub fn qemu_log(&self) -> PathBuf {
        self.log_dir.join("qemu.log")
    }

    /// Output captured before QEMU's own logging starts.
    pub fn early_log(&self) -> PathBuf {
        self.log_dir.join("qemu.early.log")
    }

    pub fn qmp_log(&self) -> PathBuf {
        self.log_dir.join("qemu.qmp.log")
    }

    /// Persistent drain of the console ring buffer.
    pub fn console_log(&self) -> PathBuf {
        self.log_dir.join("console.log")
    }
}
