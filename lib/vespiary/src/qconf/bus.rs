// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest bus slot allocation.
//!
//! The allocator hands out addresses on the architecture's device bus:
//! PCIe root ports on x86_64/aarch64, plain PCI slots on ppc64le, and
//! nothing at all on s390x where CCW devices are auto-numbered.
//!
//! Devices may share a slot by naming a multi-function group: the first
//! member claims the slot with the multifunction flag raised, later
//! members land on successive function numbers. The fixed internal
//! devices are packed into four slots this way, so the first
//! user-visible NIC always lands on the fifth slot. Guest operating
//! systems derive stable interface names from that address; moving it
//! breaks every guest across an upgrade.

use std::fmt;

/// Bus flavor, selected by architecture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusType {
    Pcie,
    Pci,
    Ccw,
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusType::Pcie => write!(f, "pcie"),
            BusType::Pci => write!(f, "pci"),
            BusType::Ccw => write!(f, "ccw"),
        }
    }
}

/// A handed-out device address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusAllocation {
    /// Bus to attach to (`qemu_pcie3`, `pci.0`, or empty for CCW).
    pub bus: String,
    /// Device address on that bus (`00.2`), empty for CCW.
    pub addr: String,
    /// True for the first function of a shared slot.
    pub multifunction: bool,
}

/// Maximum functions per PCI slot.
const FUNCTIONS_PER_SLOT: usize = 8;

struct Slot {
    group: Option<String>,
    functions: usize,
}

pub struct Bus {
    kind: BusType,
    slots: Vec<Slot>,
}

impl Bus {
    pub fn new(kind: BusType) -> Self {
        Self { kind, slots: Vec::new() }
    }

    pub fn kind(&self) -> BusType {
        self.kind
    }

    /// Allocates an address. `group` packs devices into a shared
    /// multi-function slot; `None` always claims a fresh slot.
    pub fn allocate(&mut self, group: Option<&str>) -> BusAllocation {
        if self.kind == BusType::Ccw {
            return BusAllocation {
                bus: String::new(),
                addr: String::new(),
                multifunction: false,
            };
        }

        if let Some(group) = group {
            let found = self.slots.iter().position(|s| {
                s.group.as_deref() == Some(group)
                    && s.functions < FUNCTIONS_PER_SLOT
            });
            if let Some(index) = found {
                let function = self.slots[index].functions;
                self.slots[index].functions += 1;
                return self.address(index, function, false);
            }
        }

        let index = self.slots.len();
        self.slots.push(Slot {
            group: group.map(str::to_string),
            functions: 1,
        });
        // The multifunction flag is only meaningful when the slot will
        // host more than one function; raising it on a dedicated slot
        // is harmless, so it tracks whether a group was requested.
        self.address(index, 0, group.is_some())
    }

    fn address(
        &self,
        slot: usize,
        function: usize,
        multifunction: bool,
    ) -> BusAllocation {
        match self.kind {
            BusType::Pcie => BusAllocation {
                bus: format!("qemu_pcie{slot}"),
                addr: format!("00.{function}"),
                multifunction,
            },
            BusType::Pci => BusAllocation {
                // Slot 0 on pci.0 belongs to the host bridge.
                bus: "pci.0".to_string(),
                addr: format!("{:x}.{}", slot + 1, function),
                multifunction,
            },
            BusType::Ccw => unreachable!(),
        }
    }

    /// Number of slots handed out so far. On PCIe each one needs a
    /// root port in the machine config.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouped_devices_share_a_slot() {
        let mut bus = Bus::new(BusType::Pcie);

        let first = bus.allocate(Some("generic"));
        let second = bus.allocate(Some("generic"));
        let third = bus.allocate(None);

        assert_eq!(first.bus, "qemu_pcie0");
        assert_eq!(first.addr, "00.0");
        assert!(first.multifunction);

        assert_eq!(second.bus, "qemu_pcie0");
        assert_eq!(second.addr, "00.1");
        assert!(!second.multifunction);

        assert_eq!(third.bus, "qemu_pcie1");
        assert_eq!(bus.slot_count(), 2);
    }

    #[test]
    fn full_group_slots_overflow_to_a_new_slot() {
        let mut bus = Bus::new(BusType::Pcie);
        for i in 0..FUNCTIONS_PER_SLOT {
            let alloc = bus.allocate(Some("generic"));
            assert_eq!(alloc.addr, format!("00.{i}"));
            assert_eq!(alloc.bus, "qemu_pcie0");
        }

        let overflow = bus.allocate(Some("generic"));
        assert_eq!(overflow.bus, "qemu_pcie1");
        assert_eq!(overflow.addr, "00.0");
    }

    #[test]
    fn ccw_hands_out_empty_addresses() {
        let mut bus = Bus::new(BusType::Ccw);
        let alloc = bus.allocate(Some("generic"));
        assert_eq!(alloc.bus, "");
        assert_eq!(alloc.addr, "");
        assert!(!alloc.multifunction);
    }

    #[test]
    fn pci_slots_start_past_the_host_bridge() {
        let mut bus = Bus::new(BusType::Pci);
        let first = bus.allocate(None);
        assert_eq!(first.bus, "pci.0");
        assert_eq!(first.addr, "1.0");
    }
}
