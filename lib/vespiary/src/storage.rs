// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The storage-pool contract.
//!
//! Pool drivers (dir, zfs, btrfs, ceph, ...) are external; the instance
//! driver consumes them through this trait for config-volume mounting,
//! snapshot bookkeeping, and filesystem-level migration transfer.

use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::migrate::MigrationType;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The volume is referenced by another user; unmount attempts see
    /// this during concurrent operations and treat it as non-fatal.
    #[error("volume is in use")]
    InUse,

    #[error(transparent)]
    Driver(#[from] anyhow::Error),
}

/// Result of mounting an instance's config volume.
#[derive(Clone, Debug)]
pub struct MountInfo {
    /// Root disk image file or block device path.
    pub disk_path: PathBuf,
}

/// A point-in-time volume snapshot as reported by the pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    pub name: String,
    pub created: SystemTime,
    pub size: u64,
}

/// Sender-side arguments to a filesystem migration transfer.
#[derive(Debug)]
pub struct VolumeSourceArgs {
    pub migration_type: MigrationType,
    /// Snapshot subset requested by the receiver.
    pub snapshots: Vec<String>,
    /// Transfer the volume while the VM may still be writing. Only set
    /// on the live path, where the migration snapshot provides the
    /// consistency boundary.
    pub allow_inconsistent: bool,
    /// Intra-cluster member move of the same instance.
    pub cluster_move: bool,
}

/// Receiver-side arguments to a filesystem migration transfer.
#[derive(Debug)]
pub struct VolumeTargetArgs {
    pub migration_type: MigrationType,
    pub snapshots: Vec<String>,
    /// Refresh an existing volume instead of creating from scratch.
    pub refresh: bool,
    pub volume_size: u64,
    pub live: bool,
}

/// Both directions of a migration data channel.
pub trait MigrationStream:
    tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin
{
}

impl<T> MigrationStream for T where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin
{
}

/// The pool driver surface the instance driver depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoragePool: Send + Sync {
    fn name(&self) -> &str;

    /// True for shared (remote) pools where both cluster members see
    /// the same volume and root-disk sync can be skipped.
    fn is_remote(&self) -> bool;

    /// Transfer protocols the driver offers, most preferred first.
    fn migration_types(&self, refresh: bool) -> Vec<MigrationType>;

    /// Mounts the instance's volume, reference-counted.
    async fn mount_instance(
        &self,
        project: &str,
        name: &str,
    ) -> Result<MountInfo, StorageError>;

    /// Drops one mount reference; [`StorageError::InUse`] when other
    /// references remain.
    async fn unmount_instance(
        &self,
        project: &str,
        name: &str,
    ) -> Result<(), StorageError>;

    async fn volume_size(
        &self,
        project: &str,
        name: &str,
    ) -> Result<u64, StorageError>;

    async fn volume_snapshots(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Vec<VolumeSnapshot>, StorageError>;

    async fn create_snapshot(
        &self,
        project: &str,
        name: &str,
        snapshot: &str,
    ) -> Result<(), StorageError>;

    async fn delete_snapshot(
        &self,
        project: &str,
        name: &str,
        snapshot: &str,
    ) -> Result<(), StorageError>;

    async fn restore_snapshot(
        &self,
        project: &str,
        name: &str,
        snapshot: &str,
    ) -> Result<(), StorageError>;

    async fn rename_instance(
        &self,
        project: &str,
        name: &str,
        new_name: &str,
    ) -> Result<(), StorageError>;

    async fn delete_instance(
        &self,
        project: &str,
        name: &str,
    ) -> Result<(), StorageError>;

    /// Streams the instance volume (and requested snapshots) to a
    /// migration receiver.
    async fn migrate_instance(
        &self,
        project: &str,
        name: &str,
        conn: &mut (dyn MigrationStream + '_),
        args: &VolumeSourceArgs,
    ) -> Result<(), StorageError>;

    /// Creates (or refreshes) the instance volume from a migration
    /// sender's stream.
    async fn create_instance_from_migration(
        &self,
        project: &str,
        name: &str,
        conn: &mut (dyn MigrationStream + '_),
        args: &VolumeTargetArgs,
    ) -> Result<(), StorageError>;
}
