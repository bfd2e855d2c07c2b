// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live USB passthrough against the sparse ports on the XHCI
//! controller.

use std::sync::Arc;

use qmp::Monitor;
use serde_json::json;

use crate::device::UsbEntry;
use crate::qconf::{escape_name, DEVICE_ID_PREFIX};
use crate::Result;

fn device_id(entry: &UsbEntry) -> String {
    format!(
        "{DEVICE_ID_PREFIX}{}-{}-{}",
        escape_name(&entry.dev_name),
        entry.host_bus,
        entry.host_addr
    )
}

pub async fn attach(monitor: &Arc<Monitor>, entry: &UsbEntry) -> Result<()> {
    monitor
        .add_device(json!({
            "driver": "usb-host",
            "id": device_id(entry),
            "bus": "qemu_usb.0",
            "hostbus": entry.host_bus,
            "hostaddr": entry.host_addr,
        }))
        .await?;
    Ok(())
}

pub async fn detach(monitor: &Arc<Monitor>, entry: &UsbEntry) -> Result<()> {
    match monitor.remove_device(&device_id(entry)).await {
        Ok(()) => Ok(()),
        // Unplugging the physical device first makes QEMU forget the
        // guest device on its own.
        Err(e) if matches!(&e, qmp::Error::Command { error, .. }
            if error.class == "DeviceNotFound") =>
        {
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
