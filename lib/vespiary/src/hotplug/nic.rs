// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live NIC attach and detach.

use std::os::fd::AsRawFd;
use std::sync::Arc;

use qmp::Monitor;
use serde_json::json;
use slog::{debug, Logger};

use crate::device::NetworkEntry;
use crate::qconf::{escape_name, DEVICE_ID_PREFIX, NETDEV_ID_PREFIX};
use crate::Result;

use super::{free_pci_port, wait_device_gone};

/// Attaches a NIC to a running VM on a free PCIe port. Unlike at boot,
/// there is no pre-reserved low slot; hotplugged NICs take whatever
/// port is free, and guests see them appear at that address.
pub async fn attach(
    monitor: &Arc<Monitor>,
    nic: NetworkEntry,
    log: &Logger,
) -> Result<()> {
    let escaped = escape_name(&nic.dev_name);
    let netdev_id = format!("{NETDEV_ID_PREFIX}{escaped}");
    let device_id = format!("{DEVICE_ID_PREFIX}{escaped}");

    let mut tap_names = Vec::new();
    for (i, fd) in nic.tap_fds.iter().enumerate() {
        let name = format!("{netdev_id}.tap.{i}");
        monitor.send_fd(&name, fd.as_raw_fd()).await?;
        tap_names.push(name);
    }

    let mut vhost_names = Vec::new();
    for (i, fd) in nic.vhost_fds.iter().enumerate() {
        let name = format!("{netdev_id}.vhost.{i}");
        monitor.send_fd(&name, fd.as_raw_fd()).await?;
        vhost_names.push(name);
    }

    let mut netdev = json!({
        "type": "tap",
        "id": netdev_id,
        "fds": tap_names.join(":"),
    });
    if !vhost_names.is_empty() {
        netdev["vhost"] = json!(true);
        netdev["vhostfds"] = json!(vhost_names.join(":"));
    }
    monitor.execute("netdev_add", Some(netdev)).await?;

    let port = free_pci_port(monitor).await?;
    let mut device = json!({
        "driver": "virtio-net-pci",
        "id": device_id,
        "netdev": format!("{NETDEV_ID_PREFIX}{escaped}"),
        "mac": nic.hwaddr,
        "bus": port,
        "addr": "00.0",
    });
    if nic.mtu > 0 {
        device["host_mtu"] = json!(nic.mtu);
    }
    if nic.tap_fds.len() > 1 {
        device["mq"] = json!(true);
        device["vectors"] = json!(2 * nic.tap_fds.len() as u32 + 2);
    }

    debug!(log, "hotplugging NIC"; "device" => &nic.dev_name);
    if let Err(e) = monitor.add_device(device).await {
        let _ = monitor
            .execute(
                "netdev_del",
                Some(json!({
                    "id": format!("{NETDEV_ID_PREFIX}{escaped}")
                })),
            )
            .await;
        return Err(e.into());
    }

    Ok(())
}

/// Detaches a NIC: delete the guest device, wait for it to vanish,
/// then delete the host-side netdev.
pub async fn detach(monitor: &Arc<Monitor>, dev_name: &str) -> Result<()> {
    let escaped = escape_name(dev_name);
    let device_id = format!("{DEVICE_ID_PREFIX}{escaped}");

    monitor.remove_device(&device_id).await?;
    wait_device_gone(monitor, &device_id).await?;
    monitor
        .execute(
            "netdev_del",
            Some(json!({ "id": format!("{NETDEV_ID_PREFIX}{escaped}") })),
        )
        .await?;
    Ok(())
}
