// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UEFI firmware selection.
//!
//! Firmware comes in (code, vars) pairs indexed by architecture and
//! usage. The vars template is copied once into the instance path and
//! exposed to QEMU through a `qemu.nvram` symlink, so the firmware
//! build can change underneath without invalidating existing guests;
//! `volatile.apply_nvram` forces a fresh copy on next start.

use std::path::{Path, PathBuf};

use crate::config::{is_true, is_true_or_unset, ConfigMap};
use crate::qconf::Architecture;
use crate::{Error, Result};

/// Which firmware flavor the instance's security config selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirmwareUsage {
    Generic,
    SecureBoot,
    Csm,
}

/// A matched (code, vars) firmware pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FirmwarePair {
    pub code: &'static str,
    pub vars: &'static str,
}

/// Candidate firmware pairs per (architecture, usage), first match
/// wins. Paths are relative to the firmware directory.
const FIRMWARE_TABLE: &[(Architecture, FirmwareUsage, FirmwarePair)] = &[
    (
        Architecture::X86_64,
        FirmwareUsage::Generic,
        FirmwarePair { code: "OVMF_CODE.4MB.fd", vars: "OVMF_VARS.4MB.fd" },
    ),
    (
        Architecture::X86_64,
        FirmwareUsage::SecureBoot,
        FirmwarePair {
            code: "OVMF_CODE.4MB.fd",
            vars: "OVMF_VARS.4MB.ms.fd",
        },
    ),
    (
        Architecture::X86_64,
        FirmwareUsage::Csm,
        FirmwarePair {
            code: "OVMF_CODE.4MB.CSM.fd",
            vars: "OVMF_VARS.4MB.CSM.fd",
        },
    ),
    (
        Architecture::Aarch64,
        FirmwareUsage::Generic,
        FirmwarePair { code: "AAVMF_CODE.fd", vars: "AAVMF_VARS.fd" },
    ),
    (
        Architecture::Aarch64,
        FirmwareUsage::SecureBoot,
        FirmwarePair { code: "AAVMF_CODE.ms.fd", vars: "AAVMF_VARS.ms.fd" },
    ),
];

/// Derives the firmware usage from instance config: CSM when
/// explicitly requested, otherwise secure boot unless disabled.
pub fn usage_from_config(config: &ConfigMap) -> FirmwareUsage {
    if is_true(config.get("security.csm").map(String::as_str)) {
        return FirmwareUsage::Csm;
    }

    if is_true_or_unset(config.get("security.secureboot").map(String::as_str))
    {
        return FirmwareUsage::SecureBoot;
    }

    FirmwareUsage::Generic
}

/// Selects the firmware pair for an architecture and usage.
pub fn select(
    arch: Architecture,
    usage: FirmwareUsage,
) -> Result<FirmwarePair> {
    FIRMWARE_TABLE
        .iter()
        .find(|(a, u, _)| *a == arch && *u == usage)
        .map(|(_, _, pair)| *pair)
        .ok_or_else(|| {
            Error::Config(format!(
                "no {usage:?} firmware available on {arch}"
            ))
        })
}

/// The name of the NVRAM symlink inside the instance path.
pub const NVRAM_LINK: &str = "qemu.nvram";

/// Copies the vars template into the instance path (unless already
/// present and regeneration was not requested) and points `qemu.nvram`
/// at it. Returns the symlink path for QEMU.
pub fn setup_nvram(
    instance_path: &Path,
    firmware_dir: &Path,
    pair: FirmwarePair,
    regenerate: bool,
) -> Result<PathBuf> {
    let vars_name = pair.vars;
    let target = instance_path.join(vars_name);
    let link = instance_path.join(NVRAM_LINK);

    if regenerate && target.exists() {
        std::fs::remove_file(&target)?;
    }

    if !target.exists() {
        std::fs::copy(firmware_dir.join(vars_name), &target)?;
    }

    match std::fs::read_link(&link) {
        Ok(existing) if existing == PathBuf::from(vars_name) => {}
        Ok(_) | Err(_) => {
            let _ = std::fs::remove_file(&link);
            std::os::unix::fs::symlink(vars_name, &link)?;
        }
    }

    Ok(link)
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

    #[test]
    fn secure_boot_is_the_default() {
        assert_eq!(
            usage_from_config(&config(&[])),
            FirmwareUsage::SecureBoot
        );
        assert_eq!(
            usage_from_config(&config(&[("security.secureboot", "true")])),
            FirmwareUsage::SecureBoot
        );
        assert_eq!(
            usage_from_config(&config(&[("security.secureboot", "false")])),
            FirmwareUsage::Generic
        );
        assert_eq!(
            usage_from_config(&config(&[("security.csm", "true")])),
            FirmwareUsage::Csm
        );
    }

    #[test]
    fn table_lookup_by_arch_and_usage() {
        let pair =
            select(Architecture::X86_64, FirmwareUsage::SecureBoot).unwrap();
        assert_eq!(pair.vars, "OVMF_VARS.4MB.ms.fd");

        assert!(select(Architecture::Aarch64, FirmwareUsage::Csm).is_err());
    }

    #[test]
    fn nvram_copy_and_symlink() {
        let dir = std::env::temp_dir().join(format!(
            "vespiary-nvram-{}",
            std::process::id()
        ));
        let firmware = dir.join("firmware");
        let instance = dir.join("instance");
        std::fs::create_dir_all(&firmware).unwrap();
        std::fs::create_dir_all(&instance).unwrap();
        std::fs::write(firmware.join("OVMF_VARS.4MB.ms.fd"), b"template")
            .unwrap();

        let pair =
            select(Architecture::X86_64, FirmwareUsage::SecureBoot).unwrap();
        let link = setup_nvram(&instance, &firmware, pair, false).unwrap();
        assert_eq!(std::fs::read(&link).unwrap(), b"template");

        // Guest mutates its vars; a plain restart must keep them.
        std::fs::write(instance.join("OVMF_VARS.4MB.ms.fd"), b"mutated")
            .unwrap();
        setup_nvram(&instance, &firmware, pair, false).unwrap();
        assert_eq!(std::fs::read(&link).unwrap(), b"mutated");

        // Regeneration goes back to the template.
        setup_nvram(&instance, &firmware, pair, true).unwrap();
        assert_eq!(std::fs::read(&link).unwrap(), b"template");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
