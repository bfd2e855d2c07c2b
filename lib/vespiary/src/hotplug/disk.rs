// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disk and shared-filesystem plumbing: I/O mode selection, boot-time
//! blockdev hooks, and live attach/detach.
//!
//! Disks attach in two steps, `blockdev-add` then `device_add`. The
//! aio and cache modes come from what actually backs the bytes: image
//! files on ZFS or btrfs misbehave under O_DIRECT (lockups and
//! checksum failures have both been observed), io_uring needs a recent
//! enough kernel, and raw block devices get native async I/O with the
//! host cache bypassed.

use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use qmp::Monitor;
use serde_json::{json, Value};
use slog::{warn, Logger};

use crate::device::{DiskSource, MountEntry};
use crate::qconf::{
    block_node_name, escape_name, QemuFeatures, Version, DEVICE_ID_PREFIX,
    ROOT_DISK_NODE,
};
use crate::Result;

use super::{free_pci_port, wait_device_gone};

/// io_uring misbehaves on kernels before this version.
const IO_URING_MIN_KERNEL: Version = Version(5, 13, 0);

/// What was learned about a disk source by probing the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct SourceProbe {
    pub is_block_device: bool,
    pub on_zfs_or_btrfs: bool,
    pub direct_io_supported: bool,
}

impl SourceProbe {
    /// Stats the source path and checks the backing filesystem and
    /// O_DIRECT support.
    pub fn detect(path: &Path) -> std::io::Result<Self> {
        use std::os::unix::fs::FileTypeExt;

        let meta = std::fs::metadata(path)?;
        let is_block_device = meta.file_type().is_block_device();

        let mut probe = Self {
            is_block_device,
            on_zfs_or_btrfs: false,
            direct_io_supported: true,
        };

        if !is_block_device {
            probe.on_zfs_or_btrfs = on_zfs_or_btrfs(path)?;
            probe.direct_io_supported = direct_io_supported(path);
        }

        Ok(probe)
    }
}

const BTRFS_SUPER_MAGIC: i64 = 0x9123_683E;
const ZFS_SUPER_MAGIC: i64 = 0x2FC1_2FC1;

fn on_zfs_or_btrfs(path: &Path) -> std::io::Result<bool> {
    use std::os::unix::ffi::OsStrExt;

    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    // SAFETY: statfs writes into the zeroed buffer it is handed.
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statfs(cpath.as_ptr(), &mut stat) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let magic = stat.f_type as i64;
    Ok(magic == BTRFS_SUPER_MAGIC || magic == ZFS_SUPER_MAGIC)
}

fn direct_io_supported(path: &Path) -> bool {
    use std::os::unix::fs::OpenOptionsExt;

    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECT)
        .open(path)
        .is_ok()
}

/// The chosen aio and cache modes for a blockdev.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IoProfile {
    pub aio: &'static str,
    pub cache_direct: bool,
    pub cache_no_flush: bool,
}

/// Selects the I/O profile for a disk.
pub fn io_profile(
    probe: SourceProbe,
    opts: &[String],
    features: &QemuFeatures,
    dev_name: &str,
    log: &Logger,
) -> IoProfile {
    // Native kernel AIO with O_DIRECT unless something objects.
    let mut aio = "native";
    let mut cache = "none";

    if opts.iter().any(|o| o == "io.uring")
        && features.io_uring
        && features.kernel_version >= IO_URING_MIN_KERNEL
    {
        aio = "io_uring";
    }

    if probe.is_block_device {
        if opts.iter().any(|o| o == "unsafe") {
            warn!(log, "using unsafe cache I/O"; "device" => dev_name);
            aio = "threads";
            cache = "unsafe";
        }
    } else if probe.on_zfs_or_btrfs {
        aio = "threads";
        cache = "writeback";
    } else if !probe.direct_io_supported {
        // The filesystem refused O_DIRECT; the io_uring request (if
        // any) survives but rides the host page cache.
        cache = "writeback";
    }

    // Explicit user override wins.
    if let Some(over) = opts
        .iter()
        .find_map(|o| o.strip_prefix("cache="))
    {
        cache = match over {
            "none" => "none",
            "writeback" => "writeback",
            "unsafe" => "unsafe",
            _ => cache,
        };
    }

    let profile = match cache {
        "unsafe" => IoProfile {
            aio: "threads",
            cache_direct: false,
            cache_no_flush: true,
        },
        "writeback" => IoProfile {
            aio: "threads",
            cache_direct: false,
            cache_no_flush: false,
        },
        _ => IoProfile { aio, cache_direct: true, cache_no_flush: false },
    };

    if !profile.cache_direct && !probe.is_block_device {
        warn!(log, "using writeback cache I/O"; "device" => dev_name);
    }

    profile
}

/// Builds the `blockdev-add` arguments for a mount entry, passing a
/// descriptor-backed source through an fdset.
async fn blockdev_options(
    monitor: &Monitor,
    entry: &MountEntry,
    node_name: &str,
    profile: &IoProfile,
    probe: SourceProbe,
) -> Result<Value> {
    let read_only = entry.opts.iter().any(|o| o == "readonly")
        || entry.fs_type.as_deref() == Some("iso9660");

    let (driver, filename) = match &entry.source {
        DiskSource::Path(path) => {
            let driver =
                if probe.is_block_device { "host_device" } else { "file" };
            (driver, path.display().to_string())
        }
        DiskSource::Fd { fd, .. } => {
            let info = monitor
                .add_fd_to_fdset(node_name, fd.as_raw_fd())
                .await?;
            ("file", format!("/dev/fdset/{}", info.fdset_id))
        }
    };

    Ok(json!({
        "node-name": node_name,
        "driver": driver,
        "filename": filename,
        "aio": profile.aio,
        "cache": {
            "direct": profile.cache_direct,
            "no-flush": profile.cache_no_flush,
        },
        "discard": "unmap",
        "read-only": read_only,
    }))
}

fn scsi_device(
    entry: &MountEntry,
    node_name: &str,
    boot_index: Option<u32>,
) -> Value {
    let cdrom = entry.fs_type.as_deref() == Some("iso9660");
    let mut device = json!({
        "driver": if cdrom { "scsi-cd" } else { "scsi-hd" },
        "id": format!("{DEVICE_ID_PREFIX}{}", escape_name(&entry.dev_name)),
        "bus": "qemu_scsi.0",
        "drive": node_name,
    });
    if let Some(wwn) = entry.opts.iter().find_map(|o| o.strip_prefix("wwn="))
    {
        device["wwn"] = json!(wwn);
    }
    if let Some(index) = boot_index {
        device["bootindex"] = json!(index);
    }
    device
}

/// Completes a boot-time drive after QMP connects: the monitor-hook
/// half of the config builder's work.
pub async fn attach_at_boot(
    monitor: &Arc<Monitor>,
    entry: MountEntry,
    boot_index: Option<u32>,
    root: bool,
    features: &QemuFeatures,
    log: &Logger,
) -> Result<()> {
    let node_name = if root {
        ROOT_DISK_NODE.to_string()
    } else {
        block_node_name(&entry.dev_name)
    };

    let probe = SourceProbe::detect(entry.source.probe_path())?;
    let profile =
        io_profile(probe, &entry.opts, features, &entry.dev_name, log);
    let blockdev =
        blockdev_options(monitor, &entry, &node_name, &profile, probe)
            .await?;

    monitor.add_blockdev(blockdev).await?;
    monitor
        .add_device(scsi_device(&entry, &node_name, boot_index))
        .await?;
    Ok(())
}

/// Live-attaches a disk to a running VM. An `io_bus` of `nvme` or
/// `virtio-blk` claims a free PCIe port; the default rides the SCSI
/// controller.
pub async fn attach(
    monitor: &Arc<Monitor>,
    entry: MountEntry,
    features: &QemuFeatures,
    log: &Logger,
) -> Result<()> {
    let node_name = block_node_name(&entry.dev_name);
    let probe = SourceProbe::detect(entry.source.probe_path())?;
    let profile =
        io_profile(probe, &entry.opts, features, &entry.dev_name, log);
    let blockdev =
        blockdev_options(monitor, &entry, &node_name, &profile, probe)
            .await?;
    monitor.add_blockdev(blockdev).await?;

    let io_bus = entry
        .opts
        .iter()
        .find_map(|o| o.strip_prefix("bus="))
        .unwrap_or("virtio-scsi");

    let result = match io_bus {
        "nvme" | "virtio-blk" => {
            let port = free_pci_port(monitor).await?;
            let driver =
                if io_bus == "nvme" { "nvme" } else { "virtio-blk-pci" };
            let mut device = json!({
                "driver": driver,
                "id": format!(
                    "{DEVICE_ID_PREFIX}{}",
                    escape_name(&entry.dev_name)
                ),
                "bus": port,
                "addr": "00.0",
                "drive": node_name,
            });
            if driver == "nvme" {
                device["serial"] = json!(entry.dev_name);
            }
            monitor.add_device(device).await
        }
        "usb" => {
            let device = json!({
                "driver": "usb-storage",
                "id": format!(
                    "{DEVICE_ID_PREFIX}{}",
                    escape_name(&entry.dev_name)
                ),
                "bus": "qemu_usb.0",
                "drive": node_name,
            });
            monitor.add_device(device).await
        }
        _ => monitor.add_device(scsi_device(&entry, &node_name, None)).await,
    };

    if let Err(e) = result {
        // Device add failed; do not leak the node.
        let _ = monitor.remove_blockdev(&node_name).await;
        return Err(e.into());
    }

    Ok(())
}

/// Live-detaches a disk: delete the device, wait for it to actually
/// vanish, then delete the backing node (which retries while block
/// jobs drain).
pub async fn detach(
    monitor: &Arc<Monitor>,
    dev_name: &str,
) -> Result<()> {
    let device_id = format!("{DEVICE_ID_PREFIX}{}", escape_name(dev_name));
    let node_name = block_node_name(dev_name);

    monitor.remove_device(&device_id).await?;
    wait_device_gone(monitor, &device_id).await?;
    monitor.remove_blockdev(&node_name).await?;
    let _ = monitor.remove_fdset(&node_name).await;
    Ok(())
}

/// Live-attaches a virtiofs share backed by an external virtiofsd
/// socket.
pub async fn attach_share(
    monitor: &Arc<Monitor>,
    dev_name: &str,
    virtiofsd_fd: std::os::fd::OwnedFd,
) -> Result<()> {
    let escaped = escape_name(dev_name);
    let chardev_id = format!("{DEVICE_ID_PREFIX}{escaped}_fs");
    let fd_name = format!("{chardev_id}.sock");

    monitor.send_fd(&fd_name, virtiofsd_fd.as_raw_fd()).await?;
    monitor
        .chardev_add(json!({
            "id": chardev_id,
            "backend": {
                "type": "socket",
                "data": {
                    "addr": { "type": "fd", "data": { "str": fd_name } },
                },
            },
        }))
        .await?;

    let port = free_pci_port(monitor).await?;
    let device = json!({
        "driver": "vhost-user-fs-pci",
        "id": format!("{DEVICE_ID_PREFIX}{escaped}"),
        "bus": port,
        "addr": "00.0",
        "tag": dev_name,
        "chardev": chardev_id,
    });

    if let Err(e) = monitor.add_device(device).await {
        let _ = monitor.chardev_remove(&chardev_id).await;
        return Err(e.into());
    }

    Ok(())
}

/// Detaches a virtiofs share.
pub async fn detach_share(
    monitor: &Arc<Monitor>,
    dev_name: &str,
) -> Result<()> {
    let escaped = escape_name(dev_name);
    let device_id = format!("{DEVICE_ID_PREFIX}{escaped}");

    monitor.remove_device(&device_id).await?;
    wait_device_gone(monitor, &device_id).await?;
    monitor
        .chardev_remove(&format!("{DEVICE_ID_PREFIX}{escaped}_fs"))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::o;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn features(io_uring: bool, kernel: Version) -> QemuFeatures {
        QemuFeatures {
            io_uring,
            kernel_version: kernel,
            ..Default::default()
        }
    }

    const FILE_ON_EXT4: SourceProbe = SourceProbe {
        is_block_device: false,
        on_zfs_or_btrfs: false,
        direct_io_supported: true,
    };

    #[test]
    fn block_devices_default_to_native_direct() {
        let probe = SourceProbe {
            is_block_device: true,
            on_zfs_or_btrfs: false,
            direct_io_supported: true,
        };
        let profile = io_profile(
            probe,
            &[],
            &features(true, Version(6, 1, 0)),
            "disk",
            &test_logger(),
        );
        assert_eq!(
            profile,
            IoProfile { aio: "native", cache_direct: true, cache_no_flush: false }
        );
    }

    #[test]
    fn io_uring_requires_request_feature_and_kernel() {
        let f_new = features(true, Version(6, 1, 0));
        let f_old = features(true, Version(5, 4, 0));
        let opts = vec!["io.uring".to_string()];

        let with = io_profile(FILE_ON_EXT4, &opts, &f_new, "d", &test_logger());
        assert_eq!(with.aio, "io_uring");

        let old_kernel =
            io_profile(FILE_ON_EXT4, &opts, &f_old, "d", &test_logger());
        assert_eq!(old_kernel.aio, "native");

        let unrequested =
            io_profile(FILE_ON_EXT4, &[], &f_new, "d", &test_logger());
        assert_eq!(unrequested.aio, "native");
    }

    #[test]
    fn zfs_and_btrfs_files_avoid_direct_io() {
        let probe = SourceProbe {
            is_block_device: false,
            on_zfs_or_btrfs: true,
            direct_io_supported: true,
        };
        let profile = io_profile(
            probe,
            &[],
            &features(false, Version(6, 1, 0)),
            "d",
            &test_logger(),
        );
        assert_eq!(
            profile,
            IoProfile {
                aio: "threads",
                cache_direct: false,
                cache_no_flush: false,
            }
        );
    }

    #[test]
    fn rejected_o_direct_falls_back_to_writeback_even_with_io_uring() {
        let probe = SourceProbe {
            is_block_device: false,
            on_zfs_or_btrfs: false,
            direct_io_supported: false,
        };
        let opts = vec!["io.uring".to_string()];
        let profile = io_profile(
            probe,
            &opts,
            &features(true, Version(6, 1, 0)),
            "d",
            &test_logger(),
        );
        // The combination is logged but not prevented.
        assert!(!profile.cache_direct);
    }

    #[test]
    fn unsafe_is_opt_in_only() {
        let probe = SourceProbe {
            is_block_device: true,
            on_zfs_or_btrfs: false,
            direct_io_supported: true,
        };
        let plain = io_profile(
            probe,
            &[],
            &features(false, Version(6, 1, 0)),
            "d",
            &test_logger(),
        );
        assert!(!plain.cache_no_flush);

        let opted = io_profile(
            probe,
            &["unsafe".to_string()],
            &features(false, Version(6, 1, 0)),
            "d",
            &test_logger(),
        );
        assert_eq!(
            opted,
            IoProfile {
                aio: "threads",
                cache_direct: false,
                cache_no_flush: true,
            }
        );
    }
}
