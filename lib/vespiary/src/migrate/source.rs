// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sending side of a migration.
//!
//! The live path redirects guest writes into a CoW snapshot overlay,
//! transfers the root volume underneath it, mirrors the overlay into
//! the receiver's NBD export, and finally pipes the QEMU state stream
//! across. If anything fails after the snapshot is taken, the reverter
//! resumes the guest and commits the overlay back onto the root disk,
//! so no guest write is ever lost to a failed migration.

use std::os::fd::AsRawFd;
use std::sync::Arc;

use serde_json::json;
use slog::{debug, warn};

use crate::instance::Instance;
use crate::revert::Reverter;
use crate::storage::{MigrationStream, VolumeSourceArgs};
use crate::{Error, Result};

use super::{
    bind_abstract, protocol::OfferResponse, recv_message, send_message,
    MigrateError, OfferHeader, NBD_EXPORT_NAME, NBD_TARGET_NODE,
    ROOT_SNAPSHOT_NODE,
};
use crate::qconf::ROOT_DISK_NODE;

/// A progress sample from `query-migrate`, forwarded to the embedding
/// daemon's operation metadata once a second.
#[derive(Clone, Copy, Debug)]
pub struct MigrationProgress {
    pub transferred: u64,
    pub remaining: u64,
    pub total: u64,
    pub bytes_per_second: u64,
    pub cpu_throttle_percentage: u32,
}

pub type ProgressFn = Arc<dyn Fn(MigrationProgress) + Send + Sync>;

pub struct MigrateSendArgs {
    /// Header negotiation channel.
    pub control: Box<dyn MigrationStream>,
    /// Storage transfer channel, reused for the NBD root sync on the
    /// live path.
    pub filesystem: Option<Box<dyn MigrationStream>>,
    /// QEMU state channel, present when live transfer is possible.
    pub state: Option<Box<dyn MigrationStream>>,
    /// The caller requests a live migration.
    pub live: bool,
    /// Set on an intra-cluster move: the instance keeps its name and
    /// the receiver has already taken over its database records.
    pub cluster_move_source_name: Option<String>,
    pub progress: Option<ProgressFn>,
}

/// Runs the sending side: offer, response, then either the live path
/// or the stateful-stop fallback.
pub async fn send(
    instance: &Arc<Instance>,
    mut args: MigrateSendArgs,
) -> Result<()> {
    let pool = instance.pool();
    let project = instance.project().to_string();
    let name = instance.name().to_string();
    let log = instance.logger().clone();

    let running = instance.is_running().await;
    let live = args.live
        && running
        && instance.is_stateful_migration_allowed()
        && args.state.is_some();

    let snapshots = pool.volume_snapshots(&project, &name).await?;
    let volume_size = pool.volume_size(&project, &name).await?;
    let offer = OfferHeader {
        types: pool.migration_types(false),
        volume_size,
        snapshots,
        live,
    };
    send_message(&mut args.control, &offer).await?;

    let response: OfferResponse = recv_message(&mut args.control).await?;
    if !pool
        .migration_types(response.refresh)
        .contains(&response.migration_type)
    {
        return Err(MigrateError::Incompatible(vec![
            response.migration_type,
        ])
        .into());
    }

    debug!(log, "migration negotiated";
           "type" => format!("{:?}", response.migration_type),
           "live" => live && response.live);

    if live && response.live {
        return send_live(instance, volume_size, response, &mut args).await;
    }

    // Fallback: park the VM (capturing state when possible), copy
    // storage cold, and bring it back up if it stays here.
    let stateful = running && instance.is_stateful_migration_allowed();
    if running {
        instance.stop(stateful, false).await?;
    }

    let mut filesystem = args
        .filesystem
        .take()
        .ok_or(MigrateError::UnexpectedMessage)?;
    let source_args = VolumeSourceArgs {
        migration_type: response.migration_type,
        snapshots: response.snapshots,
        allow_inconsistent: false,
        cluster_move: args.cluster_move_source_name.is_some(),
    };
    pool.migrate_instance(&project, &name, &mut *filesystem, &source_args)
        .await?;

    if running && args.cluster_move_source_name.is_none() {
        instance.start(stateful).await?;
    }

    Ok(())
}

async fn send_live(
    instance: &Arc<Instance>,
    root_disk_size: u64,
    response: OfferResponse,
    args: &mut MigrateSendArgs,
) -> Result<()> {
    let pool = instance.pool();
    let project = instance.project().to_string();
    let name = instance.name().to_string();
    let log = instance.logger().clone();
    let monitor = instance.qmp_connect().await?;

    let cluster_move = args.cluster_move_source_name.is_some();
    // An intra-cluster move on shared storage sees the same volume on
    // both members; the root disk needs no sync at all.
    let same_shared_storage = cluster_move && pool.is_remote();

    let mut reverter = Reverter::new();
    let result: Result<()> = async {
        if same_shared_storage {
            monitor
                .migrate_set_capabilities(&[("auto-converge", true)])
                .await?;
        } else {
            monitor
                .migrate_set_capabilities(&[
                    // Throttle the guest down so RAM transfer converges.
                    ("auto-converge", true),
                    // Pause between block-device release and state
                    // serialization, closing the race between migration
                    // completion and the mirror job.
                    ("pause-before-switchover", true),
                    // Encode zero blocks efficiently during storage sync.
                    ("zero-blocks", true),
                ])
                .await?;
        }

        monitor
            .migrate_set_parameters(json!({
                "cpu-throttle-initial": 50,
                "throttle-trigger-threshold": 20,
            }))
            .await?;

        if !same_shared_storage {
            // A qcow2 overlay sized to the root disk catches all guest
            // writes while the storage driver copies underneath.
            let snapshot_path = instance.paths().migration_snapshot();
            let _ = std::fs::remove_file(&snapshot_path);
            let status = tokio::process::Command::new("qemu-img")
                .arg("create")
                .arg("-f")
                .arg("qcow2")
                .arg(&snapshot_path)
                .arg(root_disk_size.to_string())
                .status()
                .await?;
            if !status.success() {
                return Err(Error::internal(format!(
                    "qemu-img failed creating migration snapshot \
                     ({status})"
                )));
            }

            let snap_file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&snapshot_path)?;
            // The descriptor keeps the overlay alive; nothing on disk
            // should survive or be synced to the target.
            std::fs::remove_file(&snapshot_path)?;

            let info = monitor
                .add_fd_to_fdset(ROOT_SNAPSHOT_NODE, snap_file.as_raw_fd())
                .await?;
            drop(snap_file);

            monitor
                .add_blockdev(json!({
                    "driver": "qcow2",
                    "node-name": ROOT_SNAPSHOT_NODE,
                    "read-only": false,
                    "file": {
                        "driver": "file",
                        "filename": format!("/dev/fdset/{}", info.fdset_id),
                    },
                }))
                .await?;

            monitor
                .blockdev_snapshot(ROOT_DISK_NODE, ROOT_SNAPSHOT_NODE)
                .await?;

            // From here on, guest writes live only in the overlay: any
            // failure must resume the guest and merge them back.
            {
                let monitor = monitor.clone();
                let log = log.clone();
                reverter.add(move || async move {
                    if let Err(e) = monitor.resume().await {
                        warn!(log, "failed resuming instance";
                              "err" => %e);
                    }
                    if let Err(e) =
                        monitor.block_commit(ROOT_SNAPSHOT_NODE).await
                    {
                        slog::error!(log,
                            "failed merging migration storage snapshot";
                            "err" => %e);
                    }
                    let _ = monitor
                        .remove_blockdev(ROOT_SNAPSHOT_NODE)
                        .await;
                    let _ =
                        monitor.remove_fdset(ROOT_SNAPSHOT_NODE).await;
                });
            }

            debug!(log, "temporary migration storage snapshot ready");
        }

        // Storage transfer while the guest keeps running. Inconsistency
        // is fine: the overlay above is the consistency boundary.
        let source_args = VolumeSourceArgs {
            migration_type: response.migration_type,
            snapshots: response.snapshots.clone(),
            allow_inconsistent: true,
            cluster_move,
        };
        let mut filesystem = args
            .filesystem
            .take()
            .ok_or(MigrateError::UnexpectedMessage)?;
        pool.migrate_instance(
            &project,
            &name,
            &mut *filesystem,
            &source_args,
        )
        .await?;

        if !same_shared_storage {
            // Bridge QEMU's NBD client to the receiver through the
            // filesystem channel: an abstract socket on this side,
            // proxied byte-for-byte.
            let (listener, addr) = bind_abstract()?;
            listener.set_nonblocking(true)?;
            let listener =
                tokio::net::UnixListener::from_std(listener)?;

            {
                let log = log.clone();
                tokio::spawn(async move {
                    let (mut conn, _) = match listener.accept().await {
                        Ok(c) => c,
                        Err(e) => {
                            slog::error!(log,
                                "NBD listener accept failed";
                                "err" => %e);
                            return;
                        }
                    };
                    debug!(log, "NBD connection on source started");
                    let _ = tokio::io::copy_bidirectional(
                        &mut conn,
                        &mut *filesystem,
                    )
                    .await;
                    debug!(log, "NBD connection on source finished");
                });
            }

            debug!(log, "connecting to migration NBD storage target");
            monitor
                .add_blockdev(json!({
                    "node-name": NBD_TARGET_NODE,
                    "driver": "raw",
                    "file": {
                        "driver": "nbd",
                        "export": NBD_EXPORT_NAME,
                        "server": {
                            "type": "unix",
                            "abstract": true,
                            "path": addr,
                        },
                    },
                }))
                .await?;

            {
                let monitor = monitor.clone();
                let log = log.clone();
                reverter.add(move || async move {
                    // Give QEMU a moment to release the node.
                    tokio::time::sleep(
                        std::time::Duration::from_secs(1),
                    )
                    .await;
                    if let Err(e) =
                        monitor.remove_blockdev(NBD_TARGET_NODE).await
                    {
                        warn!(log,
                              "failed removing NBD target device";
                              "err" => %e);
                    }
                });
            }

            // Sync the overlay's accumulated writes into the target
            // root disk; returns once the mirror reaches steady state.
            debug!(log, "migration storage snapshot transfer started");
            monitor
                .blockdev_mirror(ROOT_SNAPSHOT_NODE, NBD_TARGET_NODE)
                .await?;
            {
                let monitor = monitor.clone();
                let log = log.clone();
                reverter.add(move || async move {
                    if let Err(e) =
                        monitor.block_job_cancel(ROOT_SNAPSHOT_NODE).await
                    {
                        slog::error!(log, "failed cancelling block job";
                                     "err" => %e);
                    }
                });
            }
            debug!(log, "migration storage snapshot transfer finished");
        }

        debug!(log, "stateful migration checkpoint send starting");

        // QEMU writes its state into a pipe we drain into the state
        // channel.
        let (pipe_tx, pipe_rx) = tokio::net::unix::pipe::pipe()?;
        monitor.migrate_to_fd(pipe_tx.as_raw_fd()).await?;
        // QEMU holds its own duplicate; dropping ours lets the reader
        // see EOF when the checkpoint completes.
        drop(pipe_tx);

        let mut state = args
            .state
            .take()
            .ok_or(MigrateError::UnexpectedMessage)?;
        let state_copy = tokio::spawn(async move {
            let mut pipe_rx = pipe_rx;
            let _ = tokio::io::copy(&mut pipe_rx, &mut *state).await;
        });

        let progress_task = args.progress.clone().map(|callback| {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(std::time::Duration::from_secs(1))
                        .await;
                    let Ok(status) = monitor.query_migrate().await else {
                        return;
                    };
                    if let Some(ram) = status.ram {
                        callback(MigrationProgress {
                            transferred: ram.transferred,
                            remaining: ram.remaining,
                            total: ram.total,
                            bytes_per_second: (ram.mbps * 1024.0
                                * 1024.0
                                / 8.0)
                                as u64,
                            cpu_throttle_percentage: status
                                .cpu_throttle_percentage,
                        });
                    }
                }
            })
        });

        if !same_shared_storage {
            // The guest pauses once RAM converges; finish the mirror
            // while it is quiescent, then let the state finalize.
            monitor.migrate_wait("pre-switchover").await?;
            debug!(log, "checkpoint reached pre-switchover phase");

            monitor.block_job_cancel(ROOT_SNAPSHOT_NODE).await?;
            debug!(log, "snapshot transfer commit finished");

            monitor.migrate_continue("pre-switchover").await?;
        }

        monitor.migrate_wait("completed").await?;
        if let Some(task) = progress_task {
            task.abort();
        }
        let _ = state_copy.await;

        debug!(log, "stateful migration checkpoint send finished");

        if cluster_move {
            // The receiver has already written its volatile keys for
            // this name; keep ours out of the database from here on.
            instance.suspend_volatile_persistence();
            instance.stop(false, false).await?;
        } else {
            // The instance stays here: reconnect its writes to the
            // root disk and let it keep running.
            if let Err(e) = monitor.remove_blockdev(NBD_TARGET_NODE).await
            {
                warn!(log, "failed removing NBD target device";
                      "err" => %e);
            }

            monitor.resume().await?;
            debug!(log, "resumed instance");

            monitor.block_commit(ROOT_SNAPSHOT_NODE).await?;
            let _ = monitor.remove_blockdev(ROOT_SNAPSHOT_NODE).await;
            let _ = monitor.remove_fdset(ROOT_SNAPSHOT_NODE).await;
            debug!(log, "merged migration storage snapshot on source");
        }

        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            reverter.success();
            Ok(())
        }
        Err(e) => {
            slog::error!(log, "live migration failed, reverting";
                         "err" => %e);
            reverter.fail().await;
            Err(e)
        }
    }
}
