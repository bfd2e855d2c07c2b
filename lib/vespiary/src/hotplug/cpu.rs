// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! vCPU hotplug.
//!
//! The hotpluggable CPU list from QEMU names every potential vCPU
//! slot; entries with a `qom-path` are occupied. Growing plugs the
//! difference into free slots, shrinking unplugs previously hotplugged
//! ones in reverse. QEMU removes vCPU threads lazily, so a shrink
//! settles for a second before the thread list is trusted again, and
//! any change re-applies pinning to the new thread set.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use qmp::Monitor;
use serde_json::json;
use slog::{warn, Logger};

use crate::revert::Reverter;
use crate::{Error, Result};

/// Sets the active vCPU count on a running VM.
pub async fn set_cpus(
    monitor: &Arc<Monitor>,
    count: u32,
    ccw: bool,
    log: &Logger,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }

    let cpus = monitor.query_hotpluggable_cpus().await?;

    let available: Vec<_> =
        cpus.iter().filter(|c| c.qom_path.is_none()).collect();
    let hotplugged: Vec<_> = cpus
        .iter()
        .filter(|c| {
            c.qom_path
                .as_deref()
                .map(|p| p.starts_with("/machine/peripheral"))
                .unwrap_or(false)
        })
        .collect();

    // Fixed boot CPUs plus previously hotplugged ones.
    let reserved = hotplugged.len() as u32 + 1;
    if count == reserved {
        return Ok(());
    }

    let mut reverter = Reverter::new();
    let count_usize = count as usize;

    if count > reserved {
        if count_usize > cpus.len() {
            return Err(Error::Config(
                "cannot allocate more CPUs than available".to_string(),
            ));
        }

        let needed = (count - reserved) as usize;
        if needed > available.len() {
            return Err(Error::internal(
                "not enough hotpluggable CPUs available".to_string(),
            ));
        }

        for cpu in available.iter().take(needed) {
            let socket = cpu.props.socket_id.unwrap_or(0);
            let core = cpu.props.core_id.unwrap_or(0);
            let thread = cpu.props.thread_id.unwrap_or(0);
            let dev_id = format!("cpu{socket}{core}{thread}");

            let mut device = json!({
                "id": dev_id.clone(),
                "driver": cpu.driver,
                "core-id": core,
            });
            // No such thing as sockets and threads on s390x.
            if !ccw {
                device["socket-id"] = json!(socket);
                device["thread-id"] = json!(thread);
            }

            if let Err(e) = monitor.add_device(device).await {
                reverter.fail().await;
                return Err(e.into());
            }

            let monitor = monitor.clone();
            let log = log.clone();
            reverter.add(move || async move {
                if let Err(e) = monitor.remove_device(&dev_id).await {
                    warn!(log, "failed to remove CPU device";
                          "err" => %e);
                }
            });
        }
    } else {
        let excess = (reserved - count) as usize;
        if excess > hotplugged.len() {
            return Err(Error::internal(
                "not enough hotplugged CPUs to remove".to_string(),
            ));
        }

        for cpu in hotplugged.iter().take(excess) {
            let qom_path = cpu.qom_path.clone().unwrap();
            let dev_id = qom_path
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();

            if let Err(e) = monitor.remove_device(&dev_id).await {
                reverter.fail().await;
                return Err(e.into());
            }

            let monitor = monitor.clone();
            let log = log.clone();
            let driver = cpu.driver.clone();
            let socket = cpu.props.socket_id.unwrap_or(0);
            let core = cpu.props.core_id.unwrap_or(0);
            let thread = cpu.props.thread_id.unwrap_or(0);
            reverter.add(move || async move {
                let device = json!({
                    "id": dev_id,
                    "driver": driver,
                    "socket-id": socket,
                    "core-id": core,
                    "thread-id": thread,
                });
                if let Err(e) = monitor.add_device(device).await {
                    warn!(log, "failed to re-add CPU device";
                          "err" => %e);
                }
            });
        }

        // QEMU reports vCPU removal lazily; give the threads a moment
        // to exit before anyone reads the thread list.
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    reverter.success();
    Ok(())
}

/// Re-applies host CPU pinning to every vCPU thread. Must run after
/// any hotplug change, which spawns or destroys threads.
pub async fn apply_vcpu_affinity(
    monitor: &Arc<Monitor>,
    pins: Option<&BTreeMap<u32, u32>>,
    log: &Logger,
) -> Result<()> {
    let Some(pins) = pins else {
        return Ok(());
    };

    let cpus = monitor.query_cpus_fast().await?;
    for cpu in &cpus {
        let Some(host_cpu) = pins.get(&cpu.cpu_index) else {
            continue;
        };

        if let Err(e) = set_thread_affinity(cpu.thread_id, *host_cpu) {
            warn!(log, "failed to pin vCPU thread";
                  "vcpu" => cpu.cpu_index,
                  "thread" => cpu.thread_id,
                  "err" => %e);
        }
    }

    Ok(())
}

/// Confines every vCPU thread to a set of host CPUs (balanced NUMA
/// placement pins to a whole node rather than 1:1).
pub async fn apply_node_affinity(
    monitor: &Arc<Monitor>,
    host_cpus: &[u32],
    log: &Logger,
) -> Result<()> {
    if host_cpus.is_empty() {
        return Ok(());
    }

    let cpus = monitor.query_cpus_fast().await?;
    for cpu in &cpus {
        if let Err(e) = set_thread_affinity_set(cpu.thread_id, host_cpus) {
            warn!(log, "failed to confine vCPU thread to NUMA node";
                  "thread" => cpu.thread_id, "err" => %e);
        }
    }

    Ok(())
}

fn set_thread_affinity_set(
    tid: i32,
    host_cpus: &[u32],
) -> std::io::Result<()> {
    // SAFETY: cpu_set_t is plain data; sched_setaffinity reads it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in host_cpus {
            libc::CPU_SET(*cpu as usize, &mut set);
        }
        let rc = libc::sched_setaffinity(
            tid,
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    Ok(())
}

fn set_thread_affinity(tid: i32, host_cpu: u32) -> std::io::Result<()> {
    // SAFETY: cpu_set_t is plain data; sched_setaffinity reads it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(host_cpu as usize, &mut set);
        let rc = libc::sched_setaffinity(
            tid,
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    Ok(())
}
