// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest memory sizing.

use crate::config::{is_true, units, ConfigMap};
use crate::{Error, Result};

/// Default guest memory when `limits.memory` is unset.
const DEFAULT_MEMORY: u64 = 1024 * 1024 * 1024;

/// Hotplug headroom never exceeds this, whatever the host address
/// space claims.
const MAX_HOTPLUG_MEMORY: u64 = 1 << 40;

/// Host facts needed for memory sizing. Detected from procfs in
/// production, constructed directly in tests.
#[derive(Clone, Copy, Debug)]
pub struct HostMemory {
    pub total_bytes: u64,
    pub phys_address_bits: u32,
}

impl HostMemory {
    /// Reads `MemTotal` from `/proc/meminfo` and the physical address
    /// width from `/proc/cpuinfo`.
    pub fn detect() -> std::io::Result<Self> {
        let meminfo = std::fs::read_to_string("/proc/meminfo")?;
        let total_bytes = meminfo
            .lines()
            .find_map(|line| {
                let rest = line.strip_prefix("MemTotal:")?;
                let kib: u64 =
                    rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
                Some(kib * 1024)
            })
            .unwrap_or(0);

        let cpuinfo = std::fs::read_to_string("/proc/cpuinfo")?;
        let phys_address_bits = cpuinfo
            .lines()
            .find_map(|line| {
                let rest = line.strip_prefix("address sizes")?;
                let bits = rest.split(':').nth(1)?.trim();
                bits.split_whitespace().next()?.parse().ok()
            })
            .unwrap_or(40);

        Ok(Self { total_bytes, phys_address_bits })
    }
}

/// Base guest memory from `limits.memory`.
pub fn base_memory(config: &ConfigMap) -> Result<u64> {
    match config.get("limits.memory") {
        Some(v) => units::parse_byte_size(v),
        None => Ok(DEFAULT_MEMORY),
    }
}

/// Maximum memory reachable through hotplug.
///
/// `limits.memory.hotplug` may be a size, or a boolean requesting the
/// ceiling be derived from the host physical address width (capped at
/// 1 TiB, and at host RAM on standalone hosts where the guest cannot
/// migrate somewhere larger). Unset means no hotplug headroom.
pub fn max_memory(
    config: &ConfigMap,
    host: HostMemory,
    clustered: bool,
) -> Result<u64> {
    let base = base_memory(config)?;
    let key = config.get("limits.memory.hotplug").map(String::as_str);

    let max = match key {
        None => return Ok(base),
        Some(v) if is_true(Some(v)) => {
            let derived = 1u64
                .checked_shl(host.phys_address_bits)
                .unwrap_or(MAX_HOTPLUG_MEMORY)
                .min(MAX_HOTPLUG_MEMORY);
            if clustered {
                derived
            } else {
                derived.min(host.total_bytes)
            }
        }
        Some(v) => units::parse_byte_size(v)?,
    };

    if max < base {
        return Err(Error::Config(format!(
            "limits.memory.hotplug ({max} bytes) is below limits.memory \
             ({base} bytes)"
        )));
    }

    Ok(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(entries: &[(&str, &str)]) -> ConfigMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const HOST: HostMemory =
        HostMemory { total_bytes: 64 << 30, phys_address_bits: 39 };

    #[test]
    fn base_defaults_to_one_gib() {
        assert_eq!(base_memory(&config(&[])).unwrap(), 1 << 30);
        assert_eq!(
            base_memory(&config(&[("limits.memory", "512MiB")])).unwrap(),
            512 << 20
        );
    }

    #[test]
    fn no_hotplug_key_means_no_headroom() {
        let cfg = config(&[("limits.memory", "2GiB")]);
        assert_eq!(max_memory(&cfg, HOST, false).unwrap(), 2 << 30);
    }

    #[test]
    fn derived_ceiling_is_capped_by_host_ram_when_standalone() {
        let cfg = config(&[
            ("limits.memory", "2GiB"),
            ("limits.memory.hotplug", "true"),
        ]);
        // 2^39 = 512 GiB, above the 64 GiB host.
        assert_eq!(max_memory(&cfg, HOST, false).unwrap(), 64 << 30);
        assert_eq!(max_memory(&cfg, HOST, true).unwrap(), 512 << 30);
    }

    #[test]
    fn derived_ceiling_never_exceeds_one_tib() {
        let big = HostMemory { total_bytes: 4 << 40, phys_address_bits: 46 };
        let cfg = config(&[
            ("limits.memory", "2GiB"),
            ("limits.memory.hotplug", "true"),
        ]);
        assert_eq!(max_memory(&cfg, big, true).unwrap(), 1 << 40);
    }

    #[test]
    fn explicit_ceiling_below_base_is_rejected() {
        let cfg = config(&[
            ("limits.memory", "4GiB"),
            ("limits.memory.hotplug", "2GiB"),
        ]);
        assert!(max_memory(&cfg, HOST, false).is_err());
    }
}
