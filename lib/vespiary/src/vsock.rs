// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Vsock context-ID allocation.
//!
//! Every VM gets one 32-bit vsock context ID, acquired by opening
//! `/dev/vhost-vsock` and claiming the CID with an ioctl; the kernel
//! reports `EADDRINUSE` on collision. Candidates come from a PRNG
//! seeded with the instance UUID, so a host that lost its database can
//! recover the same ID for a still-running VM, and the ID in
//! `volatile.vsock_id` is re-acquired verbatim across restarts.
//! CIDs 0 through 2 are reserved by the kernel.

use std::os::fd::OwnedFd;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::{Error, Result};

/// CIDs reserved by the vsock address family.
const RESERVED_MAX: u32 = 2;

/// How long to probe for a free CID before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard cap on candidate probes, so a pathological collision pattern
/// cannot spin the full timeout busily.
const MAX_CANDIDATES: u32 = 256;

/// `VHOST_VSOCK_SET_GUEST_CID`: `_IOW(0xAF, 0x60, __u64)`.
const IOCTL_SET_GUEST_CID: libc::c_ulong = 0x4008_AF60;

pub fn is_reserved(cid: u32) -> bool {
    cid <= RESERVED_MAX
}

/// Claims `cid` on the host. `Ok(None)` means the ID is taken.
pub fn try_acquire(cid: u32) -> std::io::Result<Option<OwnedFd>> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/vhost-vsock")?;
    let fd = OwnedFd::from(file);

    let cid64: u64 = cid.into();
    // SAFETY: the ioctl reads a u64 from the supplied pointer and does
    // not retain it.
    let rc = unsafe {
        libc::ioctl(
            std::os::fd::AsRawFd::as_raw_fd(&fd),
            IOCTL_SET_GUEST_CID,
            &cid64 as *const u64,
        )
    };

    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EADDRINUSE) {
            return Ok(None);
        }
        return Err(err);
    }

    Ok(Some(fd))
}

/// The deterministic candidate stream for an instance.
fn candidate_rng(instance_uuid: &Uuid) -> StdRng {
    let bytes = instance_uuid.as_bytes();
    let seed = u64::from_le_bytes(bytes[..8].try_into().unwrap());
    StdRng::seed_from_u64(seed)
}

/// Acquires a context ID for the instance: the previous `existing` ID
/// when it is still (or again) free, otherwise the first free candidate
/// from the UUID-seeded stream. Returns the ID and the vhost descriptor
/// that holds the claim (passed to QEMU).
pub fn next_context_id<F>(
    instance_uuid: &Uuid,
    existing: Option<u32>,
    mut acquire: F,
) -> Result<(u32, OwnedFd)>
where
    F: FnMut(u32) -> std::io::Result<Option<OwnedFd>>,
{
    if let Some(cid) = existing {
        if !is_reserved(cid) {
            if let Some(fd) = acquire(cid)? {
                return Ok((cid, fd));
            }
        }
    }

    let mut rng = candidate_rng(instance_uuid);
    let deadline = Instant::now() + ACQUIRE_TIMEOUT;
    for _ in 0..MAX_CANDIDATES {
        if Instant::now() > deadline {
            break;
        }

        let candidate: u32 = rng.gen();
        if is_reserved(candidate) {
            continue;
        }

        if let Some(fd) = acquire(candidate)? {
            return Ok((candidate, fd));
        }
    }

    Err(Error::VsockExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn dummy_fd() -> OwnedFd {
        OwnedFd::from(std::fs::File::open("/dev/null").unwrap())
    }

    #[test]
    fn existing_id_is_preferred() {
        let uuid = Uuid::new_v4();
        let (cid, _fd) =
            next_context_id(&uuid, Some(12345), |cid| {
                assert_eq!(cid, 12345);
                Ok(Some(dummy_fd()))
            })
            .unwrap();
        assert_eq!(cid, 12345);
    }

    #[test]
    fn candidates_are_deterministic_per_uuid() {
        let uuid = Uuid::new_v4();

        let mut first_run = Vec::new();
        let _ = next_context_id(&uuid, None, |cid| {
            first_run.push(cid);
            if first_run.len() < 4 {
                Ok(None)
            } else {
                Ok(Some(dummy_fd()))
            }
        })
        .unwrap();

        let mut second_run = Vec::new();
        let _ = next_context_id(&uuid, None, |cid| {
            second_run.push(cid);
            if second_run.len() < 4 {
                Ok(None)
            } else {
                Ok(Some(dummy_fd()))
            }
        })
        .unwrap();

        assert_eq!(first_run, second_run);

        // A different instance probes a different sequence.
        let mut other_run = Vec::new();
        let _ = next_context_id(&Uuid::new_v4(), None, |cid| {
            other_run.push(cid);
            Ok(Some(dummy_fd()))
        })
        .unwrap();
        assert_ne!(first_run.first(), other_run.first());
    }

    #[test]
    fn reserved_ids_are_never_returned() {
        let uuid = Uuid::new_v4();
        let mut seen = HashSet::new();
        let (cid, _fd) = next_context_id(&uuid, Some(2), |cid| {
            assert!(!is_reserved(cid));
            seen.insert(cid);
            Ok(Some(dummy_fd()))
        })
        .unwrap();
        assert!(cid > 2);
    }

    #[test]
    fn exhaustion_is_reported() {
        let uuid = Uuid::new_v4();
        let err = next_context_id(&uuid, None, |_| Ok(None)).unwrap_err();
        assert!(matches!(err, Error::VsockExhausted));
    }
}
