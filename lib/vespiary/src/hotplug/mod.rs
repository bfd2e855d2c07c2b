// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live attach and detach of devices against a running VM, all driven
//! over QMP.
//!
//! Hotplugged PCI functions land on the spare PCIe root ports the
//! config builder provisioned at boot; an attach first scans
//! `query-pci` for an empty port. Detach is asynchronous on the QEMU
//! side, so removals poll for the device to actually disappear before
//! releasing backend objects.

use std::time::Duration;

use qmp::Monitor;
use serde_json::Value;

use crate::{Error, Result};

pub mod cpu;
pub mod disk;
pub mod memory;
pub mod nic;
pub mod pci;
pub mod usb;

/// How long a detach waits for the device to leave `query-pci`.
const DETACH_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for a detach.
const DETACH_POLL: Duration = Duration::from_secs(2);

/// Finds an empty hotplug-capable PCIe root port.
pub async fn free_pci_port(monitor: &Monitor) -> Result<String> {
    let devices = monitor.query_pci().await?;
    for dev in devices {
        // Built-ins and the IOMMU carry no usable port.
        if dev.qdev_id.is_empty() || dev.qdev_id == "qemu_iommu" {
            continue;
        }

        let Some(bridge) = &dev.bridge else { continue };
        if bridge.devices.is_empty() {
            return Ok(dev.qdev_id);
        }
    }

    Err(Error::internal(
        "no available PCI hotplug slots could be found".to_string(),
    ))
}

fn pci_tree_contains(devices: &[Value], qdev_id: &str) -> bool {
    devices.iter().any(|d| {
        if d.get("qdev_id").and_then(Value::as_str) == Some(qdev_id) {
            return true;
        }
        d.get("pci_bridge")
            .and_then(|b| b.get("devices"))
            .and_then(Value::as_array)
            .map(|children| pci_tree_contains(children, qdev_id))
            .unwrap_or(false)
    })
}

/// Waits for a deleted device to drop out of the PCI tree. QEMU
/// reports removal lazily, so this polls.
pub async fn wait_device_gone(
    monitor: &Monitor,
    device_id: &str,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + DETACH_TIMEOUT;
    loop {
        let devices = monitor.query_pci().await?;
        let present = devices.iter().any(|d| d.qdev_id == device_id)
            || devices.iter().any(|d| {
                d.bridge
                    .as_ref()
                    .map(|b| pci_tree_contains(&b.devices, device_id))
                    .unwrap_or(false)
            });

        if !present {
            return Ok(());
        }

        if tokio::time::Instant::now() > deadline {
            return Err(Error::internal(format!(
                "device {device_id} still present after detach"
            )));
        }

        tokio::time::sleep(DETACH_POLL).await;
    }
}
