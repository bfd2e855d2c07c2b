// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory hotplug and ballooning.
//!
//! Growth above the boot size plugs pc-dimm devices whose memory
//! backends mirror the instance's NUMA layout; shrinking asks the
//! balloon to reclaim pages and polls for convergence, since the guest
//! is free to be slow (or unwilling) about releasing memory.

use std::sync::Arc;
use std::time::Duration;

use qmp::Monitor;
use serde_json::json;
use slog::{debug, Logger};

use crate::revert::Reverter;
use crate::{Error, Result};

/// Balloon convergence window.
const BALLOON_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepted relative error on balloon convergence: 1%.
const BALLOON_TOLERANCE: f64 = 0.01;

/// Adjusts a running VM's effective memory to `target` bytes.
pub async fn set_memory(
    monitor: &Arc<Monitor>,
    target: u64,
    numa_nodes: usize,
    log: &Logger,
) -> Result<()> {
    let summary = monitor.query_memory_size_summary().await?;
    let current = summary.base_memory + summary.plugged_memory;

    if target == current {
        return Ok(());
    }

    if target > current {
        grow(monitor, target - current, numa_nodes.max(1), log).await
    } else {
        shrink(monitor, target).await
    }
}

async fn grow(
    monitor: &Arc<Monitor>,
    delta: u64,
    numa_nodes: usize,
    log: &Logger,
) -> Result<()> {
    let share = delta / numa_nodes as u64;
    if share == 0 {
        return Ok(());
    }

    let mut reverter = Reverter::new();
    let mut index = 0usize;

    for node in 0..numa_nodes {
        // Backend IDs from earlier hotplugs are still taken; walk past
        // duplicate-ID rejections to the first free index.
        let mem_id = loop {
            if index >= 256 {
                reverter.fail().await;
                return Err(Error::internal(
                    "no free memory backend index".to_string(),
                ));
            }

            let candidate = format!("mem{index}");
            index += 1;
            match monitor
                .add_object(json!({
                    "qom-type": "memory-backend-ram",
                    "id": candidate,
                    "size": share,
                }))
                .await
            {
                Ok(()) => break format!("mem{}", index - 1),
                Err(e) if is_duplicate_id(&e) => continue,
                Err(e) => {
                    reverter.fail().await;
                    return Err(e.into());
                }
            }
        };

        let dimm_id = mem_id.replace("mem", "dimm");
        debug!(log, "plugging memory";
               "node" => node, "bytes" => share, "memdev" => &mem_id);

        {
            let monitor = monitor.clone();
            let mem_id = mem_id.clone();
            reverter.add(move || async move {
                let _ = monitor.remove_object(&mem_id).await;
            });
        }

        if let Err(e) = monitor
            .add_device(json!({
                "driver": "pc-dimm",
                "id": dimm_id,
                "memdev": mem_id,
                "node": node,
            }))
            .await
        {
            reverter.fail().await;
            return Err(e.into());
        }
    }

    reverter.success();
    Ok(())
}

fn is_duplicate_id(err: &qmp::Error) -> bool {
    matches!(err, qmp::Error::Command { error, .. }
        if error.desc.contains("uplicate")
            || error.desc.contains("already"))
}

async fn shrink(monitor: &Arc<Monitor>, target: u64) -> Result<()> {
    monitor.balloon(target).await?;

    let deadline = tokio::time::Instant::now() + BALLOON_TIMEOUT;
    loop {
        let actual = monitor.query_balloon().await?.actual;
        let error = (actual as f64 - target as f64).abs() / target as f64;
        if error <= BALLOON_TOLERANCE {
            return Ok(());
        }

        if tokio::time::Instant::now() > deadline {
            return Err(Error::internal(format!(
                "balloon did not converge: target {target}, actual {actual}"
            )));
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
