// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live VFIO PCI passthrough.

use std::sync::Arc;

use qmp::Monitor;
use serde_json::json;

use crate::device::PciEntry;
use crate::qconf::{escape_name, DEVICE_ID_PREFIX};
use crate::Result;

use super::{free_pci_port, wait_device_gone};

pub async fn attach(monitor: &Arc<Monitor>, entry: &PciEntry) -> Result<()> {
    let port = free_pci_port(monitor).await?;
    monitor
        .add_device(json!({
            "driver": "vfio-pci",
            "id": format!(
                "{DEVICE_ID_PREFIX}{}",
                escape_name(&entry.dev_name)
            ),
            "bus": port,
            "addr": "00.0",
            "host": entry.pci_slot_name,
        }))
        .await?;
    Ok(())
}

pub async fn detach(monitor: &Arc<Monitor>, entry: &PciEntry) -> Result<()> {
    let device_id =
        format!("{DEVICE_ID_PREFIX}{}", escape_name(&entry.dev_name));
    monitor.remove_device(&device_id).await?;
    wait_device_gone(monitor, &device_id).await?;
    Ok(())
}
