// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Config and device expansion.
//!
//! An instance's effective configuration is the ordered merge of its
//! profile chain with local keys layered on top: profile\[0\],
//! profile\[1\], ..., local. Devices merge the same way, except that
//! identically-named devices merge key-by-key, so a later profile can
//! override a single field of a device declared earlier.
//!
//! The expanded result is the authoritative description consumed by the
//! QEMU config builder, and the unit of diffing on update.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub mod units;

/// Flat string-keyed instance configuration.
pub type ConfigMap = BTreeMap<String, String>;

/// A single device's configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig(pub BTreeMap<String, String>);

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The device's `type` key (`disk`, `nic`, `usb`, `gpu`, `pci`,
    /// `tpm`, ...).
    pub fn dev_type(&self) -> &str {
        self.get("type").unwrap_or("")
    }

    /// True for the disk device mounted at the guest root.
    pub fn is_root_disk(&self) -> bool {
        self.dev_type() == "disk" && self.get("path") == Some("/")
    }
}

impl<const N: usize> From<[(&str, &str); N]> for DeviceConfig {
    fn from(entries: [(&str, &str); N]) -> Self {
        Self(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// Named devices, keyed by device name.
pub type DeviceMap = BTreeMap<String, DeviceConfig>;

/// One profile in an instance's profile chain. Order matters: later
/// profiles override earlier ones.
#[derive(Clone, Debug, Default)]
pub struct Profile {
    pub name: String,
    pub config: ConfigMap,
    pub devices: DeviceMap,
}

/// Merges profile config in order with local config on top.
pub fn expand_config(profiles: &[Profile], local: &ConfigMap) -> ConfigMap {
    let mut expanded = ConfigMap::new();
    for profile in profiles {
        for (k, v) in &profile.config {
            expanded.insert(k.clone(), v.clone());
        }
    }

    for (k, v) in local {
        expanded.insert(k.clone(), v.clone());
    }

    expanded
}

/// Merges profile devices in order with local devices on top.
/// Identically-named devices merge key-by-key.
pub fn expand_devices(profiles: &[Profile], local: &DeviceMap) -> DeviceMap {
    let mut expanded = DeviceMap::new();
    for profile in profiles {
        for (name, dev) in &profile.devices {
            let entry = expanded.entry(name.clone()).or_default();
            for (k, v) in &dev.0 {
                entry.0.insert(k.clone(), v.clone());
            }
        }
    }

    for (name, dev) in local {
        let entry = expanded.entry(name.clone()).or_default();
        for (k, v) in &dev.0 {
            entry.0.insert(k.clone(), v.clone());
        }
    }

    expanded
}

/// Validates an expanded device set. The only hard structural
/// requirement is a root disk.
pub fn validate_devices(expanded: &DeviceMap) -> Result<()> {
    if !expanded.values().any(DeviceConfig::is_root_disk) {
        return Err(Error::MissingRootDisk);
    }

    Ok(())
}

/// Sort rank used for deterministic device processing. Disks come
/// before NICs in the run-config sequence; the bus allocator
/// compensates by reserving NIC slots first (see `qconf`).
fn sort_rank(dev: &DeviceConfig) -> u8 {
    if dev.is_root_disk() {
        return 0;
    }

    match dev.dev_type() {
        "disk" => 1,
        "nic" => 2,
        _ => 3,
    }
}

/// Devices in their stable processing order: root disk, other disks,
/// NICs, everything else, alphabetical within class. Stop order is the
/// exact reverse.
pub fn sorted_devices(devices: &DeviceMap) -> Vec<(String, DeviceConfig)> {
    let mut entries: Vec<_> = devices
        .iter()
        .map(|(name, dev)| (name.clone(), dev.clone()))
        .collect();
    entries.sort_by(|(an, a), (bn, b)| {
        sort_rank(a).cmp(&sort_rank(b)).then_with(|| an.cmp(bn))
    });
    entries
}

/// The three-way outcome of diffing expanded device sets on update.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DeviceDiff {
    /// Devices present before but not after.
    pub removed: Vec<String>,
    /// Devices present after but not before.
    pub added: Vec<String>,
    /// Devices whose changed fields are all hot-updatable.
    pub updated: Vec<String>,
}

/// Computes the device diff. `updatable_fields` is the per-device
/// contract naming the fields that may change without a remove+add
/// cycle; a difference in any other field demotes the device to the
/// removed *and* added sets.
pub fn diff_devices<F>(
    old: &DeviceMap,
    new: &DeviceMap,
    updatable_fields: F,
) -> DeviceDiff
where
    F: Fn(&str, &DeviceConfig) -> Vec<String>,
{
    let mut diff = DeviceDiff::default();

    let old_names: BTreeSet<_> = old.keys().collect();
    let new_names: BTreeSet<_> = new.keys().collect();

    for name in old_names.difference(&new_names) {
        diff.removed.push((*name).clone());
    }

    for name in new_names.difference(&old_names) {
        diff.added.push((*name).clone());
    }

    for name in old_names.intersection(&new_names) {
        let before = &old[*name];
        let after = &new[*name];
        if before == after {
            continue;
        }

        let updatable = updatable_fields(name, after);
        let keys: BTreeSet<_> = before.0.keys().chain(after.0.keys()).collect();
        let hot = keys.into_iter().all(|key| {
            if before.0.get(key.as_str()) == after.0.get(key.as_str()) {
                return true;
            }

            updatable.iter().any(|f| f == key.as_str())
                || key.starts_with("volatile.")
        });

        if hot {
            diff.updated.push((*name).clone());
        } else {
            diff.removed.push((*name).clone());
            diff.added.push((*name).clone());
        }
    }

    diff
}

/// Rejects modification of `initial.*` keys, which may be set at
/// creation but are immutable afterwards.
pub fn validate_initial_keys(
    old: &ConfigMap,
    new: &ConfigMap,
) -> Result<()> {
    let keys: BTreeSet<_> = old
        .keys()
        .chain(new.keys())
        .filter(|k| k.starts_with("initial."))
        .collect();

    for key in keys {
        if old.get(key.as_str()) != new.get(key.as_str()) {
            return Err(Error::Config(format!(
                "{key} may not be changed after creation"
            )));
        }
    }

    Ok(())
}

/// True for the truthy spellings accepted in config values.
pub fn is_true(value: Option<&str>) -> bool {
    matches!(
        value.map(str::to_lowercase).as_deref(),
        Some("true") | Some("1") | Some("yes") | Some("on")
    )
}

/// True when the key is unset or set to a truthy value.
pub fn is_true_or_unset(value: Option<&str>) -> bool {
    value.is_none() || is_true(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, config: &[(&str, &str)]) -> Profile {
        Profile {
            name: name.to_string(),
            config: config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            devices: DeviceMap::new(),
        }
    }

    #[test]
    fn later_profiles_override_earlier_and_local_overrides_all() {
        let profiles = vec![
            profile("base", &[("limits.cpu", "1"), ("limits.memory", "1GiB")]),
            profile("big", &[("limits.cpu", "4")]),
        ];
        let local: ConfigMap =
            [("limits.memory".to_string(), "8GiB".to_string())].into();

        let expanded = expand_config(&profiles, &local);
        assert_eq!(expanded["limits.cpu"], "4");
        assert_eq!(expanded["limits.memory"], "8GiB");
    }

    #[test]
    fn device_merge_is_key_by_key() {
        let mut base = profile("base", &[]);
        base.devices.insert(
            "eth0".to_string(),
            DeviceConfig::from([
                ("type", "nic"),
                ("network", "br0"),
                ("mtu", "1500"),
            ]),
        );

        let mut tuned = profile("tuned", &[]);
        tuned.devices.insert(
            "eth0".to_string(),
            DeviceConfig::from([("type", "nic"), ("mtu", "9000")]),
        );

        let expanded =
            expand_devices(&[base, tuned], &DeviceMap::new());
        let eth0 = &expanded["eth0"];
        assert_eq!(eth0.get("network"), Some("br0"));
        assert_eq!(eth0.get("mtu"), Some("9000"));
    }

    #[test]
    fn missing_root_disk_is_a_hard_error() {
        let mut devices = DeviceMap::new();
        devices.insert(
            "eth0".to_string(),
            DeviceConfig::from([("type", "nic")]),
        );
        assert!(matches!(
            validate_devices(&devices),
            Err(Error::MissingRootDisk)
        ));

        devices.insert(
            "root".to_string(),
            DeviceConfig::from([("type", "disk"), ("path", "/")]),
        );
        assert!(validate_devices(&devices).is_ok());
    }

    #[test]
    fn sort_order_is_root_disks_nics_rest() {
        let mut devices = DeviceMap::new();
        devices.insert(
            "zgpu".to_string(),
            DeviceConfig::from([("type", "gpu")]),
        );
        devices.insert(
            "eth0".to_string(),
            DeviceConfig::from([("type", "nic")]),
        );
        devices.insert(
            "data".to_string(),
            DeviceConfig::from([("type", "disk"), ("path", "/data")]),
        );
        devices.insert(
            "root".to_string(),
            DeviceConfig::from([("type", "disk"), ("path", "/")]),
        );

        let names: Vec<_> = sorted_devices(&devices)
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, ["root", "data", "eth0", "zgpu"]);
    }

    #[test]
    fn diff_classifies_hot_and_cold_changes() {
        let mut old = DeviceMap::new();
        old.insert(
            "eth0".to_string(),
            DeviceConfig::from([
                ("type", "nic"),
                ("network", "br0"),
                ("limits.ingress", "10Mbit"),
            ]),
        );
        old.insert(
            "data".to_string(),
            DeviceConfig::from([
                ("type", "disk"),
                ("path", "/data"),
                ("pool", "default"),
            ]),
        );
        old.insert(
            "gone".to_string(),
            DeviceConfig::from([("type", "usb")]),
        );

        let mut new = DeviceMap::new();
        // Hot-updatable field changed.
        new.insert(
            "eth0".to_string(),
            DeviceConfig::from([
                ("type", "nic"),
                ("network", "br0"),
                ("limits.ingress", "20Mbit"),
            ]),
        );
        // Cold field changed: forces remove+add.
        new.insert(
            "data".to_string(),
            DeviceConfig::from([
                ("type", "disk"),
                ("path", "/data"),
                ("pool", "fast"),
            ]),
        );
        new.insert(
            "fresh".to_string(),
            DeviceConfig::from([("type", "tpm")]),
        );

        let diff = diff_devices(&old, &new, |_, dev| {
            if dev.dev_type() == "nic" {
                vec!["limits.ingress".to_string()]
            } else {
                Vec::new()
            }
        });

        assert_eq!(diff.updated, ["eth0"]);
        assert!(diff.added.contains(&"fresh".to_string()));
        assert!(diff.added.contains(&"data".to_string()));
        assert!(diff.removed.contains(&"gone".to_string()));
        assert!(diff.removed.contains(&"data".to_string()));
    }

    #[test]
    fn initial_keys_are_immutable() {
        let old: ConfigMap =
            [("initial.vm.uuid".to_string(), "abc".to_string())].into();
        let mut new = old.clone();
        assert!(validate_initial_keys(&old, &new).is_ok());

        new.insert("initial.vm.uuid".to_string(), "def".to_string());
        assert!(validate_initial_keys(&old, &new).is_err());

        let removed: ConfigMap = ConfigMap::new();
        assert!(validate_initial_keys(&old, &removed).is_err());
    }
}
