// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device driver contract and the run configuration a started
//! device hands back to the instance.
//!
//! Device drivers (bridged NICs, disk volumes, USB and PCI passthrough,
//! TPM, shared filesystems) live outside this crate. The instance
//! driver starts them in sorted order, folds their run configurations
//! into the QEMU machine config or into post-QMP monitor hooks, and
//! stops them in reverse order. A stop run configuration's post-hooks
//! run regardless of whether the VM is still alive.

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::DeviceConfig;

/// What a started device asks the instance to wire up.
#[derive(Default)]
pub struct RunConfig {
    pub entries: Vec<RunEntry>,
    /// Actions to run after the device's QEMU wiring is complete (on
    /// start) or after detach (on stop, regardless of VM state).
    pub post_hooks: Vec<PostHook>,
}

/// A deferred device action. Failures are logged by the caller; a
/// post-hook cannot veto the operation it trails.
pub type PostHook = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// One wiring instruction within a [`RunConfig`]. Each variant carries
/// exactly the fields its device kind needs.
pub enum RunEntry {
    Mount(MountEntry),
    Network(NetworkEntry),
    Usb(UsbEntry),
    Pci(PciEntry),
    Gpu(GpuEntry),
    Tpm(TpmEntry),
}

/// Where a disk's bytes come from.
pub enum DiskSource {
    /// A path QEMU may open itself (block device or image file).
    Path(PathBuf),
    /// An already-open descriptor passed to QEMU, with the original
    /// path retained for I/O mode probing.
    Fd { fd: OwnedFd, path: PathBuf },
}

impl DiskSource {
    /// The probe path for filesystem/blockdev detection.
    pub fn probe_path(&self) -> &PathBuf {
        match self {
            DiskSource::Path(p) => p,
            DiskSource::Fd { path, .. } => path,
        }
    }
}

/// A disk or shared-filesystem mount.
pub struct MountEntry {
    pub dev_name: String,
    pub source: DiskSource,
    /// Guest path; `/` marks the root disk.
    pub target_path: String,
    /// Filesystem type for media selection (`iso9660` becomes a
    /// cdrom) and shares (`9p`/`virtiofs`).
    pub fs_type: Option<String>,
    /// Free-form options: `io.uring`, `direct`, `unsafe`, `bus=<...>`,
    /// `cache=<...>`, `wwn=<...>`, `readonly`.
    pub opts: Vec<String>,
    /// Listening socket of an external virtiofsd for this share.
    pub virtiofsd_fd: Option<OwnedFd>,
    /// Boot priority; higher boots earlier.
    pub boot_priority: Option<u32>,
}

/// A network interface backed by tap/vhost descriptors.
pub struct NetworkEntry {
    pub dev_name: String,
    /// Host-side interface name.
    pub host_name: String,
    pub hwaddr: String,
    pub mtu: u32,
    /// One tap descriptor per queue.
    pub tap_fds: Vec<OwnedFd>,
    /// vhost-net descriptors, one per queue, when acceleration is on.
    pub vhost_fds: Vec<OwnedFd>,
    pub boot_priority: Option<u32>,
}

/// A host USB device forwarded to the guest.
pub struct UsbEntry {
    pub dev_name: String,
    pub host_bus: u32,
    pub host_addr: u32,
}

/// A host PCI device forwarded via VFIO.
pub struct PciEntry {
    pub dev_name: String,
    /// Host PCI address, e.g. `0000:03:00.0`.
    pub pci_slot_name: String,
}

/// A GPU: PCI passthrough plus display wiring.
pub struct GpuEntry {
    pub dev_name: String,
    pub pci_slot_name: String,
    /// Present the device as the primary VGA adapter.
    pub vga: bool,
}

/// A TPM emulator reachable over a UNIX socket.
pub struct TpmEntry {
    pub dev_name: String,
    pub socket_path: PathBuf,
}

/// The contract implemented by external device drivers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Device: Send + Sync {
    /// The device's name within the instance's device map.
    fn name(&self) -> &str;

    /// Whether this device can be attached to / detached from a
    /// running instance.
    fn can_hot_plug(&self) -> bool;

    /// Fields that may change on a running device without a
    /// remove+add cycle.
    fn update_fields(&self) -> Vec<String>;

    /// Validates host-side preconditions before the instance starts.
    async fn pre_start_check(&self) -> anyhow::Result<()>;

    /// Applies a hot-updatable field change to a (possibly running)
    /// device. Only called for diffs confined to
    /// [`update_fields`](Self::update_fields).
    async fn update(&self, instance_running: bool) -> anyhow::Result<()>;

    /// Starts the device, returning what to wire into QEMU.
    async fn start(&self, instance_running: bool)
        -> anyhow::Result<RunConfig>;

    /// Stops the device. The returned post-hooks run even when the VM
    /// is already gone.
    async fn stop(&self, instance_running: bool)
        -> anyhow::Result<RunConfig>;
}

/// Loads device drivers from device configs. Implemented by the
/// embedding daemon, which owns the driver registry.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceProvider: Send + Sync {
    fn load(
        &self,
        instance_project: &str,
        instance_name: &str,
        device_name: &str,
        config: &DeviceConfig,
    ) -> anyhow::Result<Box<dyn Device>>;
}

/// Per-NIC config handed to the in-guest agent for stable interface
/// naming, written as `nic-config/<dev>.json` in the config drive.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct NicConfigEntry {
    pub device: String,
    pub hwaddr: String,
    pub mtu: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}
