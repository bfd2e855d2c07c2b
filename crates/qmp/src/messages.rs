// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire envelope types and typed response payloads.
//!
//! QMP frames every message as a single JSON object terminated by a
//! newline. The envelope discriminates on which top-level key is
//! present (`QMP`, `return`, `error`, or `event`); the payloads of the
//! commands the driver consumes are modeled as serde structs so that
//! callers never touch raw maps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The server greeting sent when a client connects.
#[derive(Debug, Deserialize)]
pub(crate) struct Greeting {
    #[serde(rename = "QMP")]
    pub qmp: Value,
}

/// A response to a command, correlated by `id`.
#[derive(Debug, Deserialize)]
pub(crate) struct Response {
    pub id: Option<u64>,
    #[serde(rename = "return")]
    pub ret: Option<Value>,
    pub error: Option<QmpError>,
}

/// The error payload QEMU attaches to a rejected command.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QmpError {
    pub class: String,
    pub desc: String,
}

impl std::fmt::Display for QmpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.desc)
    }
}

/// An asynchronous event emitted by QEMU, or synthesized by the monitor
/// on disconnect.
#[derive(Clone, Debug, Deserialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Value,
}

impl Event {
    /// The `reason` field carried by `SHUTDOWN` events.
    pub fn reason(&self) -> Option<&str> {
        self.data.get("reason").and_then(Value::as_str)
    }
}

/// A command envelope on its way out.
#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    pub id: u64,
}

/// `query-status` response.
#[derive(Debug, Deserialize)]
pub struct StatusInfo {
    pub status: String,
    #[serde(default)]
    pub running: bool,
}

/// One entry of a `query-cpus-fast` response.
#[derive(Debug, Deserialize)]
pub struct CpuInfoFast {
    #[serde(rename = "cpu-index")]
    pub cpu_index: u32,
    #[serde(rename = "qom-path")]
    pub qom_path: String,
    #[serde(rename = "thread-id")]
    pub thread_id: i32,
    #[serde(default)]
    pub props: CpuInstanceProps,
}

/// One entry of a `query-hotpluggable-cpus` response.
#[derive(Debug, Deserialize)]
pub struct HotpluggableCpu {
    #[serde(rename = "type")]
    pub driver: String,
    #[serde(rename = "vcpus-count")]
    pub vcpus_count: u32,
    pub props: CpuInstanceProps,
    /// Present when the slot is occupied.
    #[serde(rename = "qom-path", default)]
    pub qom_path: Option<String>,
}

/// Topology coordinates of a (hotpluggable) vCPU.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CpuInstanceProps {
    #[serde(rename = "socket-id", default)]
    pub socket_id: Option<u32>,
    #[serde(rename = "core-id", default)]
    pub core_id: Option<u32>,
    #[serde(rename = "thread-id", default)]
    pub thread_id: Option<u32>,
    #[serde(rename = "node-id", default)]
    pub node_id: Option<u32>,
}

/// `query-balloon` response.
#[derive(Debug, Deserialize)]
pub struct BalloonInfo {
    pub actual: u64,
}

/// `query-memory-size-summary` response.
#[derive(Debug, Deserialize)]
pub struct MemorySizeSummary {
    #[serde(rename = "base-memory")]
    pub base_memory: u64,
    #[serde(rename = "plugged-memory", default)]
    pub plugged_memory: u64,
}

/// One device of a `query-pci` response, flattened across buses.
#[derive(Debug, Deserialize)]
pub struct PciDeviceInfo {
    pub bus: u32,
    pub slot: u32,
    pub function: u32,
    #[serde(rename = "qdev_id", default)]
    pub qdev_id: String,
    #[serde(rename = "pci_bridge", default)]
    pub bridge: Option<PciBridgeInfo>,
}

/// The bridge sub-object carried by PCI(e) root ports.
#[derive(Debug, Default, Deserialize)]
pub struct PciBridgeInfo {
    #[serde(default)]
    pub devices: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PciBusInfo {
    pub devices: Vec<PciDeviceInfo>,
}

/// `query-migrate` response.
#[derive(Debug, Default, Deserialize)]
pub struct MigrationStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ram: Option<MigrationRam>,
    #[serde(rename = "cpu-throttle-percentage", default)]
    pub cpu_throttle_percentage: u32,
}

/// RAM progress counters within [`MigrationStatus`].
#[derive(Debug, Default, Deserialize)]
pub struct MigrationRam {
    pub transferred: u64,
    pub remaining: u64,
    pub total: u64,
    #[serde(default)]
    pub mbps: f64,
}

/// `add-fd` response: the fdset the descriptor landed in.
#[derive(Debug, Deserialize)]
pub struct FdsetInfo {
    #[serde(rename = "fdset-id")]
    pub fdset_id: i64,
    #[serde(default)]
    pub fd: i64,
}

/// Arguments to `chardev-change` describing the replacement backend.
#[derive(Debug)]
pub enum ChardevChange {
    /// Swap the chardev for a UNIX socket backend whose listening FD is
    /// passed to QEMU under the given fd name.
    Socket { fd_name: String },
    /// Swap the chardev for an in-memory ring buffer.
    Ringbuf,
}

/// `query-sev-capabilities` response.
#[derive(Debug, Deserialize)]
pub struct SevCapabilities {
    pub pdh: String,
    #[serde(rename = "cert-chain")]
    pub cert_chain: String,
    #[serde(rename = "cbitpos")]
    pub cbit_pos: u32,
    #[serde(rename = "reduced-phys-bits")]
    pub reduced_phys_bits: u32,
}

/// `query-cpu-model-expansion` response model.
#[derive(Debug, Deserialize)]
pub struct CpuModelExpansion {
    pub model: CpuModel,
}

#[derive(Debug, Deserialize)]
pub struct CpuModel {
    pub name: String,
    #[serde(default)]
    pub props: BTreeMap<String, Value>,
}
