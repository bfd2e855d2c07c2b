// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest CPU topology derivation.
//!
//! `limits.cpu` is either a plain count (one socket of N cores, no
//! pinning) or a host CPU set like `0,2-4,7`. A pinned set that maps
//! onto a symmetric slice of the host topology is reported to the
//! guest truthfully (sockets × cores × threads); anything irregular
//! degrades to one socket of N cores so the guest never sees an
//! impossible topology.

use std::collections::{BTreeMap, BTreeSet};

use slog::{warn, Logger};

use crate::{Error, Result};

/// One host CPU thread's coordinates.
#[derive(Clone, Copy, Debug)]
pub struct HostThread {
    pub cpu: u32,
    pub socket: u32,
    pub core: u32,
    pub numa_node: u32,
}

/// The host's CPU layout. Detected from sysfs in production,
/// constructed directly in tests.
#[derive(Clone, Debug, Default)]
pub struct HostLayout {
    pub threads: Vec<HostThread>,
}

impl HostLayout {
    pub fn detect() -> std::io::Result<Self> {
        let mut threads = Vec::new();
        let base = std::path::Path::new("/sys/devices/system/cpu");
        for entry in std::fs::read_dir(base)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(cpu) = name
                .strip_prefix("cpu")
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            let topo = entry.path().join("topology");
            let read_u32 = |p: &std::path::Path| -> u32 {
                std::fs::read_to_string(p)
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(0)
            };
            let socket = read_u32(&topo.join("physical_package_id"));
            let core = read_u32(&topo.join("core_id"));

            let numa_node = std::fs::read_dir(entry.path())
                .ok()
                .and_then(|dir| {
                    dir.flatten().find_map(|e| {
                        e.file_name()
                            .to_string_lossy()
                            .strip_prefix("node")
                            .and_then(|n| n.parse().ok())
                    })
                })
                .unwrap_or(0);

            threads.push(HostThread { cpu, socket, core, numa_node });
        }

        threads.sort_by_key(|t| t.cpu);
        Ok(Self { threads })
    }

    fn find(&self, cpu: u32) -> Option<&HostThread> {
        self.threads.iter().find(|t| t.cpu == cpu)
    }

    /// The NUMA node IDs present on this host, ascending.
    pub fn numa_nodes(&self) -> Vec<u32> {
        let mut nodes: Vec<u32> =
            self.threads.iter().map(|t| t.numa_node).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// All CPUs on one NUMA node.
    pub fn node_cpus(&self, node: u32) -> Vec<u32> {
        self.threads
            .iter()
            .filter(|t| t.numa_node == node)
            .map(|t| t.cpu)
            .collect()
    }
}

/// The derived guest topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuTopology {
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
    /// vCPU index to pinned host CPU, when pinning is requested.
    pub vcpus: Option<BTreeMap<u32, u32>>,
    /// Host NUMA node to the vCPUs pinned on it.
    pub nodes: Option<BTreeMap<u32, Vec<u32>>>,
}

impl CpuTopology {
    pub fn vcpu_count(&self) -> u32 {
        self.sockets * self.cores * self.threads
    }

    pub fn pinned(&self) -> bool {
        self.vcpus.is_some()
    }

    fn unpinned(count: u32) -> Self {
        Self {
            sockets: 1,
            cores: count,
            threads: 1,
            vcpus: None,
            nodes: None,
        }
    }
}

/// Parses a CPU set expression (`0,2-4,7`) into an ordered list.
pub fn parse_cpuset(set: &str) -> Result<Vec<u32>> {
    let mut cpus = BTreeSet::new();
    for part in set.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(|_| {
                    Error::Config(format!("invalid CPU range {part:?}"))
                })?;
                let hi: u32 = hi.trim().parse().map_err(|_| {
                    Error::Config(format!("invalid CPU range {part:?}"))
                })?;
                if hi < lo {
                    return Err(Error::Config(format!(
                        "invalid CPU range {part:?}"
                    )));
                }
                cpus.extend(lo..=hi);
            }
            None => {
                cpus.insert(part.parse().map_err(|_| {
                    Error::Config(format!("invalid CPU number {part:?}"))
                })?);
            }
        }
    }

    if cpus.is_empty() {
        return Err(Error::Config(format!("empty CPU set {set:?}")));
    }

    Ok(cpus.into_iter().collect())
}

/// Derives the guest topology from `limits.cpu`.
pub fn cpu_topology(
    limit: &str,
    host: &HostLayout,
    log: &Logger,
) -> Result<CpuTopology> {
    let limit = limit.trim();
    if limit.is_empty() {
        return Ok(CpuTopology::unpinned(1));
    }

    if let Ok(count) = limit.parse::<u32>() {
        if count == 0 {
            return Err(Error::Config(
                "limits.cpu must be at least 1".to_string(),
            ));
        }
        return Ok(CpuTopology::unpinned(count));
    }

    let pins = parse_cpuset(limit)?;
    let mut pinned_threads = Vec::with_capacity(pins.len());
    for cpu in &pins {
        match host.find(*cpu) {
            Some(t) => pinned_threads.push(*t),
            None => {
                return Err(Error::Config(format!(
                    "pinned CPU {cpu} does not exist on this host"
                )))
            }
        }
    }

    let vcpus: BTreeMap<u32, u32> = pins
        .iter()
        .enumerate()
        .map(|(vcpu, cpu)| (vcpu as u32, *cpu))
        .collect();

    let mut nodes: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for (vcpu, thread) in pinned_threads.iter().enumerate() {
        nodes.entry(thread.numa_node).or_default().push(vcpu as u32);
    }

    // Count threads per (socket, core) and cores per socket; the set is
    // symmetric when both are uniform and account for every pin.
    let mut per_core: BTreeMap<(u32, u32), u32> = BTreeMap::new();
    for t in &pinned_threads {
        *per_core.entry((t.socket, t.core)).or_default() += 1;
    }

    let mut per_socket: BTreeMap<u32, u32> = BTreeMap::new();
    for (socket, _) in per_core.keys() {
        *per_socket.entry(*socket).or_default() += 1;
    }

    let thread_counts: BTreeSet<u32> = per_core.values().copied().collect();
    let core_counts: BTreeSet<u32> = per_socket.values().copied().collect();

    if thread_counts.len() == 1 && core_counts.len() == 1 {
        let sockets = per_socket.len() as u32;
        let cores = *core_counts.iter().next().unwrap();
        let threads = *thread_counts.iter().next().unwrap();
        if sockets * cores * threads == pins.len() as u32 {
            return Ok(CpuTopology {
                sockets,
                cores,
                threads,
                vcpus: Some(vcpus),
                nodes: Some(nodes),
            });
        }
    }

    warn!(
        log,
        "pinned CPU set is not a symmetric host sub-topology, \
         presenting a flat topology to the guest";
        "cpuset" => limit,
    );

    Ok(CpuTopology {
        sockets: 1,
        cores: pins.len() as u32,
        threads: 1,
        vcpus: Some(vcpus),
        nodes: Some(nodes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::o;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    /// A 2-socket host, 4 cores per socket, 2 threads per core,
    /// sockets on separate NUMA nodes. CPU numbering: socket-major.
    fn host() -> HostLayout {
        let mut threads = Vec::new();
        for socket in 0..2u32 {
            for core in 0..4u32 {
                for thread in 0..2u32 {
                    let cpu = socket * 8 + core * 2 + thread;
                    threads.push(HostThread {
                        cpu,
                        socket,
                        core,
                        numa_node: socket,
                    });
                }
            }
        }
        HostLayout { threads }
    }

    #[test]
    fn plain_count_is_one_socket_no_pinning() {
        let topo = cpu_topology("2", &host(), &test_logger()).unwrap();
        assert_eq!((topo.sockets, topo.cores, topo.threads), (1, 2, 1));
        assert!(!topo.pinned());
    }

    #[test]
    fn cpuset_parsing() {
        assert_eq!(parse_cpuset("0,2-4,7").unwrap(), vec![0, 2, 3, 4, 7]);
        assert!(parse_cpuset("4-2").is_err());
        assert!(parse_cpuset("").is_err());
        assert!(parse_cpuset("a,b").is_err());
    }

    #[test]
    fn symmetric_pin_set_reports_true_topology() {
        // Both threads of cores 0 and 1 on both sockets: 2s x 2c x 2t.
        let topo = cpu_topology(
            "0-3,8-11",
            &host(),
            &test_logger(),
        )
        .unwrap();
        assert_eq!((topo.sockets, topo.cores, topo.threads), (2, 2, 2));
        assert!(topo.pinned());

        let nodes = topo.nodes.unwrap();
        assert_eq!(nodes[&0], vec![0, 1, 2, 3]);
        assert_eq!(nodes[&1], vec![4, 5, 6, 7]);
    }

    #[test]
    fn asymmetric_pin_set_degrades_to_flat_topology() {
        // Three threads on socket 0, one on socket 1.
        let topo =
            cpu_topology("0,1,2,8", &host(), &test_logger()).unwrap();
        assert_eq!((topo.sockets, topo.cores, topo.threads), (1, 4, 1));
        assert!(topo.pinned());
    }

    #[test]
    fn pinning_a_missing_cpu_is_an_error() {
        assert!(cpu_topology("0,64", &host(), &test_logger()).is_err());
    }

    #[test]
    fn vcpus_map_in_pin_order() {
        let topo = cpu_topology("7,2", &host(), &test_logger()).unwrap();
        let vcpus = topo.vcpus.unwrap();
        // CPU sets are ordered; vCPU 0 takes the lowest host CPU.
        assert_eq!(vcpus[&0], 2);
        assert_eq!(vcpus[&1], 7);
    }
}
