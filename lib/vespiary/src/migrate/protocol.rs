// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The migration offer/response header and the negotiation rules.

use serde::{Deserialize, Serialize};
use strum::EnumIter;

use crate::storage::VolumeSnapshot;

/// Filesystem-level transfer protocols, in the order pool drivers
/// usually prefer them (native send streams beat generic file
/// transfer).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumIter,
)]
pub enum MigrationType {
    #[serde(rename = "zfs-send")]
    ZfsSend,
    #[serde(rename = "btrfs-send")]
    BtrfsSend,
    #[serde(rename = "block+rsync")]
    BlockAndRsync,
    #[serde(rename = "rsync")]
    Rsync,
}

/// First message, sender to receiver.
#[derive(Debug, Serialize, Deserialize)]
pub struct OfferHeader {
    /// Transfer types the sender's pool supports, most preferred
    /// first.
    pub types: Vec<MigrationType>,
    /// Size of the root volume in bytes.
    pub volume_size: u64,
    /// All snapshots the sender has, for refresh intersection.
    pub snapshots: Vec<VolumeSnapshot>,
    /// Whether a live QEMU-to-QEMU state transfer is offered.
    pub live: bool,
}

/// Second message, receiver to sender.
#[derive(Debug, Serialize, Deserialize)]
pub struct OfferResponse {
    /// The transfer type the receiver picked from the offer.
    pub migration_type: MigrationType,
    /// Snapshots the receiver wants transferred (a subset of the
    /// offer when refreshing).
    pub snapshots: Vec<String>,
    /// The receiver is refreshing an existing volume.
    pub refresh: bool,
    /// The receiver accepts the live state transfer.
    pub live: bool,
}

/// Picks the first offered type the receiver also supports, honoring
/// the sender's preference order.
pub fn negotiate(
    offered: &[MigrationType],
    supported: &[MigrationType],
) -> Option<MigrationType> {
    offered.iter().copied().find(|t| supported.contains(t))
}

/// What a refreshing receiver must do to its local snapshots before
/// the transfer.
#[derive(Debug, Default, PartialEq)]
pub struct RefreshPlan {
    /// Local snapshots to delete: absent from the source, or same
    /// name but a different creation time (divergent history).
    pub delete_local: Vec<String>,
    /// Offered snapshots to request, in offer order.
    pub request: Vec<String>,
}

/// Compares local snapshots against the sender's offer by name and
/// creation timestamp.
pub fn refresh_plan(
    local: &[VolumeSnapshot],
    offered: &[VolumeSnapshot],
) -> RefreshPlan {
    let mut plan = RefreshPlan::default();

    for snap in local {
        match offered.iter().find(|o| o.name == snap.name) {
            None => plan.delete_local.push(snap.name.clone()),
            Some(o) if o.created != snap.created => {
                plan.delete_local.push(snap.name.clone());
            }
            Some(_) => {}
        }
    }

    for snap in offered {
        let matching = local
            .iter()
            .find(|l| l.name == snap.name && l.created == snap.created);
        if matching.is_none() {
            plan.request.push(snap.name.clone());
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn snap(name: &str, secs: u64) -> VolumeSnapshot {
        VolumeSnapshot {
            name: name.to_string(),
            created: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
            size: 1 << 20,
        }
    }

    #[test]
    fn negotiation_honors_sender_preference() {
        let offered =
            [MigrationType::ZfsSend, MigrationType::Rsync];
        let supported =
            [MigrationType::Rsync, MigrationType::ZfsSend];
        assert_eq!(
            negotiate(&offered, &supported),
            Some(MigrationType::ZfsSend)
        );

        assert_eq!(
            negotiate(&offered, &[MigrationType::BtrfsSend]),
            None
        );
    }

    #[test]
    fn wire_names_match_the_protocol() {
        assert_eq!(
            serde_json::to_string(&MigrationType::BlockAndRsync).unwrap(),
            "\"block+rsync\""
        );
        assert_eq!(
            serde_json::from_str::<MigrationType>("\"zfs-send\"").unwrap(),
            MigrationType::ZfsSend
        );
    }

    #[test]
    fn refresh_requests_only_missing_snapshots() {
        let local = [snap("a", 100), snap("b", 200)];
        let offered = [snap("a", 100), snap("b", 200), snap("c", 300)];

        let plan = refresh_plan(&local, &offered);
        assert!(plan.delete_local.is_empty());
        assert_eq!(plan.request, ["c"]);
    }

    #[test]
    fn refresh_deletes_divergent_and_extra_snapshots() {
        // "b" diverged (same name, different timestamp), "z" does not
        // exist on the source.
        let local = [snap("a", 100), snap("b", 250), snap("z", 400)];
        let offered = [snap("a", 100), snap("b", 200)];

        let plan = refresh_plan(&local, &offered);
        assert_eq!(plan.delete_local, ["b", "z"]);
        assert_eq!(plan.request, ["b"]);
    }
}
