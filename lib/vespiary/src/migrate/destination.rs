// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The receiving side of a migration.
//!
//! The receiver answers the sender's offer, prunes divergent local
//! snapshots when refreshing, creates (or refreshes) the volume from
//! the filesystem stream, and on the live path hands the remaining
//! streams to a stateful start: QEMU comes up with `-incoming defer`,
//! exposes the root disk over NBD for the sender's mirror, and replays
//! the state stream.

use std::sync::Arc;

use slog::debug;

use crate::instance::Instance;
use crate::storage::{MigrationStream, VolumeTargetArgs};
use crate::Result;

use super::{
    negotiate, protocol::OfferResponse, recv_message, refresh_plan,
    send_message, MigrateError, OfferHeader,
};

pub struct MigrateReceiveArgs {
    /// Header negotiation channel.
    pub control: Box<dyn MigrationStream>,
    /// Storage transfer channel, kept for the NBD root sync on the
    /// live path.
    pub filesystem: Option<Box<dyn MigrationStream>>,
    /// QEMU state channel; its presence is this side's live
    /// capability.
    pub state: Option<Box<dyn MigrationStream>>,
    /// Refresh an existing local copy instead of a fresh create.
    pub refresh: bool,
}

/// Runs the receiving side of the handshake and transfer.
pub async fn receive(
    instance: &Arc<Instance>,
    mut args: MigrateReceiveArgs,
) -> Result<()> {
    let pool = instance.pool();
    let project = instance.project().to_string();
    let name = instance.name().to_string();
    let log = instance.logger().clone();

    let offer: OfferHeader = recv_message(&mut args.control).await?;

    let supported = pool.migration_types(args.refresh);
    let chosen = negotiate(&offer.types, &supported)
        .ok_or_else(|| MigrateError::Incompatible(offer.types.clone()))?;

    // A refresh only wants the snapshots it is missing, and must drop
    // local snapshots whose history diverged from the source.
    let (snapshots, refresh) = if args.refresh {
        let local = pool.volume_snapshots(&project, &name).await?;
        let plan = refresh_plan(&local, &offer.snapshots);
        for snapshot in &plan.delete_local {
            debug!(log, "deleting divergent local snapshot";
                   "snapshot" => snapshot.as_str());
            pool.delete_snapshot(&project, &name, snapshot).await?;
        }
        (plan.request, true)
    } else {
        (
            offer.snapshots.iter().map(|s| s.name.clone()).collect(),
            false,
        )
    };

    let live = offer.live && args.state.is_some();
    send_message(
        &mut args.control,
        &OfferResponse {
            migration_type: chosen,
            snapshots: snapshots.clone(),
            refresh,
            live,
        },
    )
    .await?;

    debug!(log, "migration response sent";
           "type" => format!("{chosen:?}"), "live" => live);

    let mut filesystem = args
        .filesystem
        .take()
        .ok_or(MigrateError::UnexpectedMessage)?;
    let target_args = VolumeTargetArgs {
        migration_type: chosen,
        snapshots,
        refresh,
        volume_size: offer.volume_size,
        live,
    };
    pool.create_instance_from_migration(
        &project,
        &name,
        &mut *filesystem,
        &target_args,
    )
    .await?;

    if live {
        // The stateful start consumes both streams: the filesystem
        // channel becomes the NBD sync path, the state channel feeds
        // `migrate-incoming`.
        let state = args
            .state
            .take()
            .ok_or(MigrateError::UnexpectedMessage)?;
        instance
            .set_migration_streams(state, Some(filesystem))
            .await;
        instance.start(true).await?;
    }

    Ok(())
}
