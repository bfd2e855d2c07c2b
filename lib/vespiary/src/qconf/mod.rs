// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! QEMU machine configuration assembly.
//!
//! The builder turns expanded devices into two artifacts: a sectioned
//! config file QEMU reads at boot, and a list of *monitor hooks*, run
//! after the QMP channel connects but before the guest starts, that add
//! block devices and NICs dynamically so their file descriptors can be
//! passed at runtime.
//!
//! Bus slots are allocated strictly in the fixed-device sequence
//! (balloon, rng, keyboard, tablet, vsock, serial, USB controller,
//! SCSI controller, 9p config drive, agent share) followed by user NICs
//! and only then other port-hungry devices. See [`bus`] for why that
//! ordering is load-bearing.

use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use slog::{o, Logger};

use crate::config::{is_true, ConfigMap};
use crate::device::{MountEntry, NetworkEntry, TpmEntry};
use crate::{Error, Result};

pub mod bus;
pub mod cpu;
pub mod firmware;
pub mod memory;

pub use bus::{Bus, BusAllocation, BusType};

/// Prefix for QEMU device IDs derived from user device names.
pub const DEVICE_ID_PREFIX: &str = "dev-vespiary_";

/// Prefix for netdev IDs derived from user device names.
pub const NETDEV_ID_PREFIX: &str = "vespiary_";

/// Block node name of the root disk.
pub const ROOT_DISK_NODE: &str = "vespiary_root";

/// Sparse USB ports configured on the XHCI controller: four reserved,
/// four free for arbitrary hotplug.
const SPARSE_USB_PORTS: u32 = 8;

/// Guest architectures the driver can realize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    Aarch64,
    Ppc64le,
    S390x,
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Architecture {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "x86_64" => Ok(Self::X86_64),
            "aarch64" => Ok(Self::Aarch64),
            "ppc64le" => Ok(Self::Ppc64le),
            "s390x" => Ok(Self::S390x),
            other => Err(Error::UnsupportedArchitecture(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
            Self::Ppc64le => "ppc64le",
            Self::S390x => "s390x",
        }
    }

    pub fn qemu_binary(&self) -> &'static str {
        match self {
            Self::X86_64 => "qemu-system-x86_64",
            Self::Aarch64 => "qemu-system-aarch64",
            Self::Ppc64le => "qemu-system-ppc64",
            Self::S390x => "qemu-system-s390x",
        }
    }

    /// Default machine type, recorded in `volatile.vm.definition` on
    /// first start and reused forever after.
    pub fn machine_type(&self) -> &'static str {
        match self {
            Self::X86_64 => "q35",
            Self::Aarch64 => "virt",
            Self::Ppc64le => "pseries",
            Self::S390x => "s390-ccw-virtio",
        }
    }

    pub fn bus_type(&self) -> BusType {
        match self {
            Self::X86_64 | Self::Aarch64 => BusType::Pcie,
            Self::Ppc64le => BusType::Pci,
            Self::S390x => BusType::Ccw,
        }
    }

    pub fn supports_uefi(&self) -> bool {
        matches!(self, Self::X86_64 | Self::Aarch64)
    }
}

/// A dotted version (QEMU or kernel).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32, pub u32, pub u32);

impl Version {
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s
            .trim()
            .split(|c: char| !c.is_ascii_digit())
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<u32>().unwrap_or(0));
        let major = parts
            .next()
            .ok_or_else(|| Error::Config(format!("bad version {s:?}")))?;
        Ok(Self(major, parts.next().unwrap_or(0), parts.next().unwrap_or(0)))
    }
}

/// Host SEV parameters discovered at probe time.
#[derive(Clone, Copy, Debug)]
pub struct SevGuestInfo {
    pub cbitpos: u32,
    pub reduced_phys_bits: u32,
    pub es_supported: bool,
}

/// Results of the one-time QEMU/host feature probe.
#[derive(Clone, Debug)]
pub struct QemuFeatures {
    pub qemu_version: Version,
    pub kernel_version: Version,
    pub io_uring: bool,
    pub cpu_hotplug: bool,
    pub vhost_net: bool,
    pub sev: Option<SevGuestInfo>,
}

impl Default for QemuFeatures {
    fn default() -> Self {
        Self {
            qemu_version: Version(8, 0, 0),
            kernel_version: Version(6, 1, 0),
            io_uring: false,
            cpu_hotplug: false,
            vhost_net: true,
            sev: None,
        }
    }
}

/// One section of the QEMU readconfig file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub comment: String,
    /// Entries in emission order; keys may repeat (NUMA host-node
    /// lists use that).
    pub entries: Vec<(String, String)>,
}

impl Section {
    fn new(name: impl Into<String>, comment: impl Into<String>) -> Self {
        Self { name: name.into(), comment: comment.into(), entries: Vec::new() }
    }

    fn entry(mut self, key: &str, value: impl Into<String>) -> Self {
        self.entries.push((key.to_string(), value.into()));
        self
    }

    fn entry_opt(self, key: &str, value: &str) -> Self {
        if value.is_empty() {
            return self;
        }
        self.entry(key, value)
    }
}

/// Renders sections in QEMU's -readconfig format.
pub fn render_sections(sections: &[Section]) -> String {
    let mut out = String::new();
    for section in sections {
        if !section.comment.is_empty() {
            out.push_str(&format!("# {}\n", section.comment));
        }
        out.push_str(&format!("[{}]\n", section.name));
        for (k, v) in &section.entries {
            out.push_str(&format!("{k} = \"{v}\"\n"));
        }
        out.push('\n');
    }
    out
}

/// Applies `raw.qemu.conf` style overrides: `[section]` headers scope
/// subsequent `key = value` lines; an empty value deletes the key, and
/// a bare `[section]` with no entries deletes the section.
pub fn apply_raw_overrides(sections: &mut Vec<Section>, raw: &str) {
    let mut current: Option<String> = None;
    let mut touched: Vec<String> = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[') {
            let name = name.trim_end_matches(']').trim_matches('"').to_string();
            if !sections.iter().any(|s| s.name == name) {
                sections.push(Section::new(name.clone(), ""));
            }
            touched.push(name.clone());
            current = Some(name);
            continue;
        }

        let Some(section_name) = &current else { continue };
        let Some((key, value)) = line.split_once('=') else { continue };
        let key = key.trim();
        let value = value.trim().trim_matches('"');

        let section = sections
            .iter_mut()
            .find(|s| &s.name == section_name)
            .expect("section inserted above");
        section.entries.retain(|(k, _)| k != key);
        if !value.is_empty() {
            section.entries.push((key.to_string(), value.to_string()));
        }
    }

    // Sections named in the override but left with no entries at all
    // are dropped entirely.
    sections.retain(|s| {
        !(touched.contains(&s.name) && s.entries.is_empty())
    });
}

/// File descriptors passed to QEMU, mapped to fd numbers from 3 up in
/// insertion order.
#[derive(Default)]
pub struct FdManifest {
    files: Vec<OwnedFd>,
}

impl FdManifest {
    /// First fd number QEMU sees for passed descriptors.
    pub const FIRST_FD: i32 = 3;

    pub fn add(&mut self, fd: OwnedFd) -> i32 {
        let qemu_fd = Self::FIRST_FD + self.files.len() as i32;
        self.files.push(fd);
        qemu_fd
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn into_files(self) -> Vec<OwnedFd> {
        self.files
    }
}

/// A closure run after QMP connects, completing a device whose wiring
/// needs runtime descriptor passing.
pub type MonitorHook = Box<
    dyn FnOnce(Arc<qmp::Monitor>) -> BoxFuture<'static, Result<()>> + Send,
>;

/// Encodes a device name for use inside QEMU identifiers.
pub fn escape_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// QEMU block node names are capped at 31 characters; longer device
/// names collapse to a stable hash.
pub fn block_node_name(name: &str) -> String {
    let escaped = escape_name(name);
    let full = format!("{NETDEV_ID_PREFIX}{escaped}");
    if full.len() <= 31 {
        return full;
    }

    format!("{NETDEV_ID_PREFIX}{:016x}", fnv1a64(name.as_bytes()))
}

fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in data {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Maps devices to QEMU boot indexes: higher `boot.priority` boots
/// earlier, ties break by name for determinism.
pub fn boot_indexes(
    priorities: &[(String, Option<u32>)],
) -> BTreeMap<String, u32> {
    let mut ordered: Vec<_> = priorities.to_vec();
    ordered.sort_by(|(an, ap), (bn, bp)| {
        bp.unwrap_or(0).cmp(&ap.unwrap_or(0)).then_with(|| an.cmp(bn))
    });

    ordered
        .into_iter()
        .enumerate()
        .map(|(index, (name, _))| (name, index as u32 + 1))
        .collect()
}

/// The finished build: config sections, post-connect hooks, and the
/// descriptors to pass at spawn.
pub struct BuiltConfig {
    pub sections: Vec<Section>,
    pub hooks: Vec<MonitorHook>,
    pub fds: FdManifest,
}

/// Assembles the machine config for one start attempt. Methods must be
/// called in the documented order; slot allocation is the reason.
pub struct ConfigBuilder {
    arch: Architecture,
    windows: bool,
    features: QemuFeatures,
    sections: Vec<Section>,
    bus: Bus,
    fds: FdManifest,
    hooks: Vec<MonitorHook>,
    log: Logger,
}

/// The multi-function group shared by the small fixed devices.
const GROUP_GENERIC: &str = "generic";

/// The multi-function group shared by the 9p/virtiofs config shares.
const GROUP_9P: &str = "9p";

impl ConfigBuilder {
    pub fn new(
        arch: Architecture,
        windows: bool,
        features: QemuFeatures,
        log: &Logger,
    ) -> Self {
        Self {
            arch,
            windows,
            features,
            sections: Vec::new(),
            bus: Bus::new(arch.bus_type()),
            fds: FdManifest::default(),
            hooks: Vec::new(),
            log: log.new(o!("component" => "qconf")),
        }
    }

    fn driver(&self, base: &str) -> String {
        match self.arch.bus_type() {
            BusType::Ccw => format!("{base}-ccw"),
            _ => format!("{base}-pci"),
        }
    }

    fn device_section(
        &mut self,
        id: &str,
        comment: &str,
        driver: String,
        alloc: &BusAllocation,
    ) -> Section {
        let mut section =
            Section::new(format!("device \"{id}\""), comment.to_string())
                .entry("driver", driver)
                .entry_opt("bus", &alloc.bus)
                .entry_opt("addr", &alloc.addr);
        if alloc.multifunction {
            section = section.entry("multifunction", "on");
        }
        section
    }

    /// Machine type, accelerator, and control sockets.
    pub fn add_machine(
        &mut self,
        machine_definition: &str,
        monitor_path: &Path,
    ) {
        let machine = Section::new("machine", "Machine")
            .entry("graphics", "off")
            .entry("type", machine_definition)
            .entry("accel", "kvm")
            .entry("usb", "off");
        self.sections.push(machine);

        self.sections.push(
            Section::new("boot-opts", "")
                .entry("strict", "on"),
        );

        self.sections.push(
            Section::new("chardev \"monitor\"", "QMP control socket")
                .entry("backend", "socket")
                .entry("path", monitor_path.display().to_string())
                .entry("server", "on")
                .entry("wait", "off"),
        );
        self.sections.push(
            Section::new("mon", "")
                .entry("chardev", "monitor")
                .entry("mode", "control"),
        );
    }

    /// UEFI firmware pflash pair. The vars path is the instance's
    /// `qemu.nvram` symlink.
    pub fn add_firmware(&mut self, code: &Path, nvram: &Path) {
        self.sections.push(
            Section::new("drive", "Firmware (read only)")
                .entry("file", code.display().to_string())
                .entry("if", "pflash")
                .entry("format", "raw")
                .entry("unit", "0")
                .entry("readonly", "on"),
        );
        self.sections.push(
            Section::new("drive", "Firmware settings (writable)")
                .entry("file", nvram.display().to_string())
                .entry("if", "pflash")
                .entry("format", "raw")
                .entry("unit", "1"),
        );
    }

    /// Base and hotplug-maximum memory.
    pub fn add_memory(&mut self, base_bytes: u64, max_bytes: u64) {
        let mut section = Section::new("memory", "Memory")
            .entry("size", format!("{}M", base_bytes >> 20));
        if max_bytes > base_bytes {
            section = section
                .entry("maxmem", format!("{}M", max_bytes >> 20))
                .entry("slots", "16");
        }
        self.sections.push(section);
    }

    /// SMP shape, NUMA nodes, and their memory backends.
    pub fn add_cpu(&mut self, topo: &cpu::CpuTopology, mem_bytes: u64) {
        let section = Section::new("smp-opts", "CPU")
            .entry("cpus", topo.vcpu_count().to_string())
            .entry("sockets", topo.sockets.to_string())
            .entry("cores", topo.cores.to_string())
            .entry("threads", topo.threads.to_string());
        self.sections.push(section);

        let Some(nodes) = &topo.nodes else {
            return;
        };
        if nodes.is_empty() {
            return;
        }

        // Guest memory splits evenly across the involved host nodes;
        // QEMU 6.0 renamed the host-node list syntax.
        let indexed = self.features.qemu_version >= Version(6, 0, 0);
        let share = mem_bytes / nodes.len() as u64;
        for (index, (host_node, vcpus)) in nodes.iter().enumerate() {
            let mut object = Section::new(
                format!("object \"mem{index}\""),
                "",
            )
            .entry("qom-type", "memory-backend-memfd")
            .entry("size", format!("{}M", share >> 20));
            if indexed {
                object = object
                    .entry("host-nodes.0", host_node.to_string())
                    .entry("policy", "bind");
            } else {
                object = object
                    .entry("host-nodes", host_node.to_string())
                    .entry("policy", "bind");
            }
            self.sections.push(object);

            let mut numa = Section::new("numa", "")
                .entry("type", "node")
                .entry("nodeid", index.to_string())
                .entry("memdev", format!("mem{index}"));
            for vcpu in vcpus {
                numa = numa.entry("cpus", vcpu.to_string());
            }
            self.sections.push(numa);
        }
    }

    /// The fixed internal devices, in their bus-ABI order. `vsock`
    /// carries the context ID and the `/dev/vhost-vsock` descriptor;
    /// it is skipped for Windows guests which have no vsock driver.
    pub fn add_fixed_devices(&mut self, vsock: Option<(u32, OwnedFd)>) {
        let alloc = self.bus.allocate(Some(GROUP_GENERIC));
        let driver = self.driver("virtio-balloon");
        let section =
            self.device_section("qemu_balloon", "Balloon", driver, &alloc);
        self.sections.push(section);

        self.sections.push(
            Section::new("object \"qemu_rng\"", "Random number generator")
                .entry("qom-type", "rng-random")
                .entry("filename", "/dev/urandom"),
        );
        let alloc = self.bus.allocate(Some(GROUP_GENERIC));
        let driver = self.driver("virtio-rng");
        let section = self
            .device_section("dev-qemu_rng", "", driver, &alloc)
            .entry("rng", "qemu_rng");
        self.sections.push(section);

        let alloc = self.bus.allocate(Some(GROUP_GENERIC));
        let driver = self.driver("virtio-keyboard");
        let section =
            self.device_section("qemu_keyboard", "Input", driver, &alloc);
        self.sections.push(section);

        let alloc = self.bus.allocate(Some(GROUP_GENERIC));
        let driver = self.driver("virtio-tablet");
        let section =
            self.device_section("qemu_tablet", "", driver, &alloc);
        self.sections.push(section);

        if let Some((cid, fd)) = vsock {
            if !self.windows {
                let qemu_fd = self.fds.add(fd);
                let alloc = self.bus.allocate(Some(GROUP_GENERIC));
                let driver = self.driver("vhost-vsock");
                let section = self
                    .device_section("qemu_vsock", "Vsock", driver, &alloc)
                    .entry("guest-cid", cid.to_string())
                    .entry("vhostfd", qemu_fd.to_string());
                self.sections.push(section);
            }
        }

        // Serial: a virtio-serial controller with the console ring
        // buffer behind it.
        let alloc = self.bus.allocate(Some(GROUP_GENERIC));
        let driver = self.driver("virtio-serial");
        let section =
            self.device_section("dev-qemu_serial", "Serial", driver, &alloc);
        self.sections.push(section);
        self.sections.push(
            Section::new("chardev \"console\"", "Console ring buffer")
                .entry("backend", "ringbuf")
                .entry("size", "1048576"),
        );
        self.sections.push(
            Section::new("device \"qemu_console\"", "")
                .entry("driver", "virtconsole")
                .entry("chardev", "console"),
        );

        if self.arch.bus_type() != BusType::Ccw {
            let alloc = self.bus.allocate(None);
            let section = self
                .device_section(
                    "qemu_usb",
                    "USB controller",
                    "qemu-xhci".to_string(),
                    &alloc,
                )
                .entry("p2", SPARSE_USB_PORTS.to_string())
                .entry("p3", SPARSE_USB_PORTS.to_string());
            self.sections.push(section);
        }

        let alloc = self.bus.allocate(None);
        let driver = self.driver("virtio-scsi");
        let section =
            self.device_section("qemu_scsi", "SCSI controller", driver, &alloc);
        self.sections.push(section);
    }

    /// The 9p (and optional virtiofs) share carrying the config drive.
    pub fn add_config_drive(
        &mut self,
        config_drive_path: &Path,
        virtiofsd_fd: Option<OwnedFd>,
    ) {
        self.sections.push(
            Section::new("fsdev \"qemu_config\"", "Config drive (9p)")
                .entry("fsdriver", "local")
                .entry("security_model", "none")
                .entry("readonly", "on")
                .entry("path", config_drive_path.display().to_string()),
        );
        let alloc = self.bus.allocate(Some(GROUP_9P));
        let driver = self.driver("virtio-9p");
        let section = self
            .device_section("dev-qemu_config", "", driver, &alloc)
            .entry("mount_tag", "config")
            .entry("fsdev", "qemu_config");
        self.sections.push(section);

        if let Some(fd) = virtiofsd_fd {
            let qemu_fd = self.fds.add(fd);
            self.sections.push(
                Section::new(
                    "chardev \"qemu_config_virtiofs\"",
                    "Config drive (virtio-fs)",
                )
                .entry("backend", "socket")
                .entry("fd", qemu_fd.to_string()),
            );
            let alloc = self.bus.allocate(Some(GROUP_9P));
            let driver = self.driver("vhost-user-fs");
            let section = self
                .device_section("dev-qemu_config_fs", "", driver, &alloc)
                .entry("tag", "config")
                .entry("chardev", "qemu_config_virtiofs");
            self.sections.push(section);
        }
    }

    /// A user filesystem share, wired through both backends where
    /// possible: the guest prefers virtiofs when its kernel can, and
    /// falls back to 9p otherwise. Both carry the same mount tag.
    pub fn add_share(
        &mut self,
        dev_name: &str,
        source_path: &Path,
        virtiofsd_fd: Option<OwnedFd>,
    ) {
        let escaped = escape_name(dev_name);
        self.sections.push(
            Section::new(
                format!("fsdev \"{NETDEV_ID_PREFIX}{escaped}\""),
                "Filesystem share (9p)",
            )
            .entry("fsdriver", "local")
            .entry("security_model", "none")
            .entry("path", source_path.display().to_string()),
        );
        let alloc = self.bus.allocate(Some(GROUP_9P));
        let driver = self.driver("virtio-9p");
        let section = self
            .device_section(
                &format!("{DEVICE_ID_PREFIX}{escaped}-9p"),
                "",
                driver,
                &alloc,
            )
            .entry("mount_tag", dev_name)
            .entry("fsdev", format!("{NETDEV_ID_PREFIX}{escaped}"));
        self.sections.push(section);

        if let Some(fd) = virtiofsd_fd {
            let qemu_fd = self.fds.add(fd);
            self.sections.push(
                Section::new(
                    format!("chardev \"{NETDEV_ID_PREFIX}{escaped}_fs\""),
                    "Filesystem share (virtio-fs)",
                )
                .entry("backend", "socket")
                .entry("fd", qemu_fd.to_string()),
            );
            let alloc = self.bus.allocate(Some(GROUP_9P));
            let driver = self.driver("vhost-user-fs");
            let section = self
                .device_section(
                    &format!("{DEVICE_ID_PREFIX}{escaped}"),
                    "",
                    driver,
                    &alloc,
                )
                .entry("tag", dev_name)
                .entry("chardev", format!("{NETDEV_ID_PREFIX}{escaped}_fs"));
            self.sections.push(section);
        }
    }

    /// Reserves the NIC's bus slot and queues the monitor hook that
    /// passes its tap/vhost descriptors and adds the device. NICs must
    /// be added before any other user device touches the bus.
    pub fn add_nic(&mut self, nic: NetworkEntry, boot_index: Option<u32>) {
        let alloc = self.bus.allocate(None);
        let vhost = self.features.vhost_net && !nic.vhost_fds.is_empty();
        let driver = self.driver("virtio-net");
        let log = self.log.clone();

        self.hooks.push(Box::new(move |monitor| {
            Box::pin(async move {
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
                if vhost {
                    for (i, fd) in nic.vhost_fds.iter().enumerate() {
                        let name = format!("{netdev_id}.vhost.{i}");
                        monitor.send_fd(&name, fd.as_raw_fd()).await?;
                        vhost_names.push(name);
                    }
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

                let mut device = json!({
                    "driver": driver,
                    "id": device_id,
                    "netdev": format!("{NETDEV_ID_PREFIX}{escaped}"),
                    "mac": nic.hwaddr,
                });
                if nic.mtu > 0 {
                    device["host_mtu"] = json!(nic.mtu);
                }
                if !alloc.bus.is_empty() {
                    device["bus"] = json!(alloc.bus);
                    device["addr"] = json!(alloc.addr);
                }
                if let Some(index) = boot_index {
                    device["bootindex"] = json!(index);
                }
                if nic.tap_fds.len() > 1 {
                    device["mq"] = json!(true);
                    device["vectors"] =
                        json!(2 * nic.tap_fds.len() as u32 + 2);
                }

                slog::debug!(log, "adding NIC via monitor";
                             "device" => &nic.dev_name);
                monitor.add_device(device).await?;
                Ok(())
            })
        }));
    }

    /// Queues the monitor hook adding a disk behind the SCSI
    /// controller. Descriptor-backed sources ride the fdset machinery.
    pub fn add_drive(
        &mut self,
        entry: MountEntry,
        boot_index: Option<u32>,
        root: bool,
    ) {
        let features = self.features.clone();
        let log = self.log.clone();

        self.hooks.push(Box::new(move |monitor| {
            Box::pin(async move {
                crate::hotplug::disk::attach_at_boot(
                    &monitor,
                    entry,
                    boot_index,
                    root,
                    &features,
                    &log,
                )
                .await
            })
        }));
    }

    /// A generic VFIO PCI passthrough device.
    pub fn add_pci(&mut self, dev_name: &str, pci_slot_name: &str) {
        let alloc = self.bus.allocate(None);
        let id = format!("{DEVICE_ID_PREFIX}{}", escape_name(dev_name));
        let section = self
            .device_section(&id, "PCI passthrough", "vfio-pci".to_string(), &alloc)
            .entry("host", pci_slot_name);
        self.sections.push(section);
    }

    /// A GPU, optionally as primary VGA.
    pub fn add_gpu(&mut self, dev_name: &str, pci_slot_name: &str, vga: bool) {
        let alloc = self.bus.allocate(None);
        let id = format!("{DEVICE_ID_PREFIX}{}", escape_name(dev_name));
        let mut section = self
            .device_section(&id, "GPU passthrough", "vfio-pci".to_string(), &alloc)
            .entry("host", pci_slot_name);
        if vga {
            section = section.entry("x-vga", "on");
        }
        self.sections.push(section);
    }

    /// A TPM behind an external emulator socket.
    pub fn add_tpm(&mut self, entry: &TpmEntry) {
        let escaped = escape_name(&entry.dev_name);
        self.sections.push(
            Section::new(format!("chardev \"{escaped}_chr\""), "TPM")
                .entry("backend", "socket")
                .entry("path", entry.socket_path.display().to_string()),
        );
        self.sections.push(
            Section::new(format!("tpmdev \"{escaped}_dev\""), "")
                .entry("type", "emulator")
                .entry("chardev", format!("{escaped}_chr")),
        );
        let driver = match self.arch {
            Architecture::Aarch64 => "tpm-tis-device",
            _ => "tpm-crb",
        };
        self.sections.push(
            Section::new(
                format!("device \"{DEVICE_ID_PREFIX}{escaped}\""),
                "",
            )
            .entry("driver", driver)
            .entry("tpmdev", format!("{escaped}_dev")),
        );
    }

    /// AMD SEV memory encryption. Certificate and session blobs ride
    /// the fd manifest and are referenced through `/proc/self/fd`.
    pub fn add_sev(
        &mut self,
        sev: SevGuestInfo,
        policy: u32,
        dh_cert_fd: Option<OwnedFd>,
        session_fd: Option<OwnedFd>,
    ) {
        let mut section = Section::new("object \"sev0\"", "AMD SEV")
            .entry("qom-type", "sev-guest")
            .entry("cbitpos", sev.cbitpos.to_string())
            .entry("reduced-phys-bits", sev.reduced_phys_bits.to_string())
            .entry("policy", format!("{policy:#x}"));

        if let Some(fd) = dh_cert_fd {
            let qemu_fd = self.fds.add(fd);
            section = section
                .entry("dh-cert-file", format!("/proc/self/fd/{qemu_fd}"));
        }
        if let Some(fd) = session_fd {
            let qemu_fd = self.fds.add(fd);
            section = section
                .entry("session-file", format!("/proc/self/fd/{qemu_fd}"));
        }
        self.sections.push(section);

        if let Some(machine) =
            self.sections.iter_mut().find(|s| s.name == "machine")
        {
            machine
                .entries
                .push(("memory-encryption".to_string(), "sev0".to_string()));
        }
    }

    /// SMBIOS type-11 strings passed through from `smbios11.*` keys.
    pub fn add_smbios(&mut self, config: &ConfigMap) {
        let entries: Vec<_> = config
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("smbios11.").map(|name| (name, v))
            })
            .collect();
        if entries.is_empty() {
            return;
        }

        let mut section =
            Section::new("smbios", "SMBIOS type 11 strings")
                .entry("type", "11");
        for (name, value) in entries {
            section = section.entry("value", format!("{name}={value}"));
        }
        self.sections.push(section);
    }

    /// Adds an fd to the pass-through manifest directly (SEV blobs,
    /// migration state files).
    pub fn add_fd(&mut self, fd: OwnedFd) -> i32 {
        self.fds.add(fd)
    }

    /// Queues an arbitrary post-connect hook (boot-time USB attach,
    /// operator QMP stages).
    pub fn push_hook(&mut self, hook: MonitorHook) {
        self.hooks.push(hook);
    }

    /// Emits the PCIe root ports backing every allocated slot and
    /// returns the finished artifacts.
    pub fn finish(mut self, config: &ConfigMap) -> BuiltConfig {
        if self.bus.kind() == BusType::Pcie {
            let mut ports = Vec::new();
            for index in 0..self.bus.slot_count() {
                let section = Section::new(
                    format!("device \"qemu_pcie{index}\""),
                    if index == 0 { "PCIe root ports" } else { "" },
                )
                .entry("driver", "pcie-root-port")
                .entry("bus", "pcie.0")
                // Eight ports share each slot on the root complex.
                .entry("addr", format!("{:x}.{}", index / 8 + 1, index % 8))
                .entry("chassis", index.to_string());
                let section = if index % 8 == 0 {
                    section.entry("multifunction", "on")
                } else {
                    section
                };
                ports.push(section);
            }
            self.sections.extend(ports);
        }

        if let Some(raw) = config.get("raw.qemu.conf") {
            apply_raw_overrides(&mut self.sections, raw);
        }

        BuiltConfig {
            sections: self.sections,
            hooks: self.hooks,
            fds: self.fds,
        }
    }
}

/// Splits a `raw.qemu` argument string on whitespace, honoring single
/// and double quotes.
pub fn split_raw_args(raw: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut pending = false;

    for c in raw.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    pending = true;
                }
                c if c.is_whitespace() => {
                    if pending || !current.is_empty() {
                        args.push(std::mem::take(&mut current));
                        pending = false;
                    }
                }
                c => current.push(c),
            },
        }
    }

    if quote.is_some() {
        return Err(Error::Config(format!(
            "unbalanced quote in raw.qemu value {raw:?}"
        )));
    }

    if pending || !current.is_empty() {
        args.push(current);
    }

    Ok(args)
}

/// Base QEMU command line; everything interesting lives in the config
/// file. The process starts paused (`-S`) so monitor hooks finish
/// before the guest runs.
pub fn qemu_args(
    name: &str,
    uuid: &str,
    conf_path: &Path,
    pid_path: &Path,
    log_path: &Path,
    config: &ConfigMap,
    incoming: bool,
) -> Result<Vec<String>> {
    let mut args = vec![
        "-S".to_string(),
        "-name".to_string(),
        name.to_string(),
        "-uuid".to_string(),
        uuid.to_string(),
        "-daemonize".to_string(),
        "-cpu".to_string(),
        "host".to_string(),
        "-nographic".to_string(),
        "-serial".to_string(),
        "chardev:console".to_string(),
        "-nodefaults".to_string(),
        "-no-user-config".to_string(),
        "-readconfig".to_string(),
        conf_path.display().to_string(),
        "-pidfile".to_string(),
        pid_path.display().to_string(),
        "-D".to_string(),
        log_path.display().to_string(),
    ];

    if incoming {
        args.push("-incoming".to_string());
        args.push("defer".to_string());
    }

    if is_true(config.get("security.iommu").map(String::as_str)) {
        args.push("-device".to_string());
        args.push("intel-iommu,intremap=on".to_string());
    }

    if let Some(raw) = config.get("raw.qemu") {
        args.extend(split_raw_args(raw)?);
    }

    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::o;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn test_builder() -> ConfigBuilder {
        ConfigBuilder::new(
            Architecture::X86_64,
            false,
            QemuFeatures::default(),
            &test_logger(),
        )
    }

    fn fake_nic(name: &str) -> NetworkEntry {
        NetworkEntry {
            dev_name: name.to_string(),
            host_name: format!("tap-{name}"),
            hwaddr: "00:16:3e:aa:bb:cc".to_string(),
            mtu: 1500,
            tap_fds: Vec::new(),
            vhost_fds: Vec::new(),
            boot_priority: None,
        }
    }

    #[test]
    fn first_nic_lands_on_the_fifth_slot() {
        let mut builder = test_builder();
        builder.add_fixed_devices(None);
        builder.add_config_drive(Path::new("/tmp/config"), None);

        // Fixed devices packed four slots: generic group, USB, SCSI,
        // 9p. The first user NIC must take slot index 4, i.e. the
        // fifth allocated slot, whatever else is attached afterwards.
        assert_eq!(builder.bus.slot_count(), 4);
        builder.add_nic(fake_nic("eth0"), None);
        builder.add_pci("accel", "0000:03:00.0");
        assert_eq!(builder.bus.slot_count(), 6);

        let pci = builder
            .sections
            .iter()
            .find(|s| s.name.contains("dev-vespiary_accel"))
            .unwrap();
        let bus_entry = pci
            .entries
            .iter()
            .find(|(k, _)| k == "bus")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(bus_entry, "qemu_pcie5");
    }

    #[test]
    fn windows_guests_skip_the_vsock_slot() {
        let mut builder = ConfigBuilder::new(
            Architecture::X86_64,
            true,
            QemuFeatures::default(),
            &test_logger(),
        );
        let null = std::fs::File::open("/dev/null").unwrap();
        builder.add_fixed_devices(Some((42, OwnedFd::from(null))));
        assert!(!builder
            .sections
            .iter()
            .any(|s| s.name.contains("qemu_vsock")));
    }

    #[test]
    fn ccw_skips_the_usb_controller() {
        let mut builder = ConfigBuilder::new(
            Architecture::S390x,
            false,
            QemuFeatures::default(),
            &test_logger(),
        );
        builder.add_fixed_devices(None);
        assert!(!builder.sections.iter().any(|s| s.name.contains("qemu_usb")));
        // CCW devices carry no bus addressing at all.
        assert!(builder
            .sections
            .iter()
            .filter(|s| s.name.starts_with("device"))
            .all(|s| !s.entries.iter().any(|(k, _)| k == "bus")));
    }

    #[test]
    fn render_quotes_values_and_repeats_keys() {
        let sections = vec![Section::new("numa", "NUMA")
            .entry("type", "node")
            .entry("cpus", "0")
            .entry("cpus", "1")];
        let text = render_sections(&sections);
        assert!(text.contains("# NUMA\n[numa]\n"));
        assert_eq!(text.matches("cpus = ").count(), 2);
    }

    #[test]
    fn raw_conf_overrides_replace_delete_and_append() {
        let mut sections = vec![Section::new("machine", "")
            .entry("type", "q35")
            .entry("accel", "kvm")];

        apply_raw_overrides(
            &mut sections,
            "[machine]\ntype = \"pc\"\naccel =\n[fw_cfg]\nname = \"opt/x\"\n",
        );

        let machine =
            sections.iter().find(|s| s.name == "machine").unwrap();
        assert_eq!(
            machine.entries,
            vec![("type".to_string(), "pc".to_string())]
        );
        assert!(sections.iter().any(|s| s.name == "fw_cfg"));
    }

    #[test]
    fn numa_layout_switches_on_qemu_six() {
        let topo = cpu::CpuTopology {
            sockets: 1,
            cores: 2,
            threads: 1,
            vcpus: Some([(0, 0), (1, 1)].into()),
            nodes: Some([(0u32, vec![0u32]), (1, vec![1])].into()),
        };

        let mut old = ConfigBuilder::new(
            Architecture::X86_64,
            false,
            QemuFeatures {
                qemu_version: Version(5, 2, 0),
                ..Default::default()
            },
            &test_logger(),
        );
        old.add_cpu(&topo, 2 << 30);
        let old_mem = old
            .sections
            .iter()
            .find(|s| s.name.starts_with("object"))
            .unwrap();
        assert!(old_mem.entries.iter().any(|(k, _)| k == "host-nodes"));

        let mut new = test_builder();
        new.add_cpu(&topo, 2 << 30);
        let new_mem = new
            .sections
            .iter()
            .find(|s| s.name.starts_with("object"))
            .unwrap();
        assert!(new_mem.entries.iter().any(|(k, _)| k == "host-nodes.0"));
    }

    #[test]
    fn boot_priority_orders_boot_indexes() {
        let indexes = boot_indexes(&[
            ("root".to_string(), Some(10)),
            ("cdrom".to_string(), Some(20)),
            ("eth0".to_string(), None),
        ]);
        assert_eq!(indexes["cdrom"], 1);
        assert_eq!(indexes["root"], 2);
        assert_eq!(indexes["eth0"], 3);
    }

    #[test]
    fn block_node_names_are_capped_and_stable() {
        assert_eq!(block_node_name("root"), "vespiary_root");
        let long = "a-device-name-well-past-the-qemu-limit";
        let hashed = block_node_name(long);
        assert!(hashed.len() <= 31);
        assert_eq!(hashed, block_node_name(long));
        assert_ne!(hashed, block_node_name("another-name-past-the-limit!"));
    }

    #[test]
    fn raw_args_split_honors_quotes() {
        let args =
            split_raw_args("-device 'virtio-net,mac=00:11' -snapshot")
                .unwrap();
        assert_eq!(args, ["-device", "virtio-net,mac=00:11", "-snapshot"]);
        assert!(split_raw_args("-device 'oops").is_err());
    }

    #[test]
    fn version_ordering() {
        assert!(Version::parse("9.1.0").unwrap() >= Version(9, 1, 0));
        assert!(Version::parse("5.13").unwrap() >= Version(5, 13, 0));
        assert!(Version::parse("4.19.0").unwrap() < Version(5, 13, 0));
    }
}
