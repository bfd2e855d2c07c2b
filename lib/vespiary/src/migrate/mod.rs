// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instance migration between hosts.
//!
//! Migration runs over streams handed in by the embedding daemon (the
//! transport is its business): a control channel for the offer and
//! response headers, a filesystem channel for the storage transfer
//! (reused as the NBD root-disk sync channel on the live path), and a
//! state channel for the QEMU-to-QEMU checkpoint.
//!
//! The sender leads a three-way handshake: it offers the transfer
//! types its pool supports, its volume size and snapshot list, and
//! whether it can transfer live state; the receiver intersects, picks,
//! and answers; the sender then runs either the live path or the
//! stateful-stop fallback. See [`source`] and [`destination`].

use std::os::fd::{FromRawFd, RawFd};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub mod destination;
pub mod protocol;
pub mod source;

pub use destination::MigrateReceiveArgs;
pub use protocol::{
    negotiate, refresh_plan, MigrationType, OfferHeader, OfferResponse,
    RefreshPlan,
};
pub use source::{MigrateSendArgs, MigrationProgress, ProgressFn};

/// Name of the root-disk export on the receiver's NBD server.
pub const NBD_EXPORT_NAME: &str = "vespiary_root";

/// Node name of the sender's CoW migration snapshot.
pub const ROOT_SNAPSHOT_NODE: &str = "vespiary_root_snapshot";

/// Node name of the sender's NBD client device.
pub const NBD_TARGET_NODE: &str = "vespiary_root_nbd";

/// Upper bound on a single control message.
const MAX_MESSAGE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("I/O error on migration channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode or decode a migration message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("migration message exceeds the size limit")]
    Oversized,

    #[error("no mutually supported migration type in offer {0:?}")]
    Incompatible(Vec<MigrationType>),

    #[error("received unexpected migration message")]
    UnexpectedMessage,
}

/// Writes one length-prefixed JSON message.
pub(crate) async fn send_message<S, T>(
    stream: &mut S,
    message: &T,
) -> Result<(), MigrateError>
where
    S: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() as u32 > MAX_MESSAGE {
        return Err(MigrateError::Oversized);
    }

    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one length-prefixed JSON message.
pub(crate) async fn recv_message<S, T>(
    stream: &mut S,
) -> Result<T, MigrateError>
where
    S: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len);
    if len > MAX_MESSAGE {
        return Err(MigrateError::Oversized);
    }

    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Binds an autobind (kernel-named) abstract UNIX listener. Returns
/// the listener and the abstract name (without the leading NUL).
pub(crate) fn bind_abstract(
) -> std::io::Result<(std::os::unix::net::UnixListener, String)> {
    // SAFETY: standard socket/bind/listen sequence; the autobind
    // address is produced by the kernel when bind is called with only
    // the family in the address.
    unsafe {
        let fd: RawFd = libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let addr: libc::sockaddr_un = std::mem::zeroed();
        let mut addr = addr;
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let rc = libc::bind(
            fd,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            std::mem::size_of::<libc::sa_family_t>() as libc::socklen_t,
        );
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, 1) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let mut bound: libc::sockaddr_un = std::mem::zeroed();
        let mut len =
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        let rc = libc::getsockname(
            fd,
            &mut bound as *mut libc::sockaddr_un as *mut libc::sockaddr,
            &mut len,
        );
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let path_len = len as usize
            - std::mem::size_of::<libc::sa_family_t>();
        // Abstract names start with a NUL byte; the printable name
        // follows.
        let name: String = bound.sun_path[1..path_len]
            .iter()
            .map(|&c| c as u8 as char)
            .collect();

        let listener = std::os::unix::net::UnixListener::from_raw_fd(fd);
        Ok((listener, name))
    }
}

/// Connects to an abstract UNIX socket by name (without the leading
/// NUL) and returns a tokio stream.
pub(crate) async fn connect_abstract(
    name: &str,
) -> std::io::Result<tokio::net::UnixStream> {
    // SAFETY: standard socket/connect sequence with an abstract
    // address built in place.
    let std_stream = unsafe {
        let fd: RawFd = libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_un = std::mem::zeroed();
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = name.as_bytes();
        if bytes.len() + 1 > addr.sun_path.len() {
            libc::close(fd);
            return Err(std::io::Error::from(
                std::io::ErrorKind::InvalidInput,
            ));
        }
        for (i, b) in bytes.iter().enumerate() {
            addr.sun_path[i + 1] = *b as libc::c_char;
        }

        let len = (std::mem::size_of::<libc::sa_family_t>()
            + 1
            + bytes.len()) as libc::socklen_t;
        let rc = libc::connect(
            fd,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        );
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        std::os::unix::net::UnixStream::from_raw_fd(fd)
    };

    std_stream.set_nonblocking(true)?;
    tokio::net::UnixStream::from_std(std_stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn length_prefixed_messages_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let offer = OfferHeader {
            types: vec![MigrationType::ZfsSend, MigrationType::Rsync],
            volume_size: 10 << 30,
            snapshots: Vec::new(),
            live: true,
        };

        send_message(&mut a, &offer).await.unwrap();
        let received: OfferHeader = recv_message(&mut b).await.unwrap();
        assert_eq!(received.types, offer.types);
        assert_eq!(received.volume_size, offer.volume_size);
        assert!(received.live);
    }

    #[tokio::test]
    async fn oversized_messages_are_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = a.write_all(&u32::MAX.to_be_bytes()).await;
        });

        let err = recv_message::<_, OfferHeader>(&mut b)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Oversized));
    }

    #[tokio::test]
    async fn abstract_sockets_connect_by_name() {
        let (listener, name) = bind_abstract().unwrap();
        assert!(!name.is_empty());

        listener.set_nonblocking(true).unwrap();
        let listener =
            tokio::net::UnixListener::from_std(listener).unwrap();

        let accept = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut client = connect_abstract(&name).await.unwrap();
        client.write_all(b"sync").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"sync");
    }
}
