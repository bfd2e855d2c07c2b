// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! QEMU process supervision: spawning with descriptor passing and
//! privilege dropping, PID-file discipline, and forced termination.
//!
//! QEMU daemonizes itself and writes its PID file; the PID is only
//! trusted when `/proc/<pid>/cmdline` still names both a
//! `qemu-system` binary and the instance UUID, which protects against
//! PID reuse after a host daemon restart.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use slog::{debug, error, Logger};

use crate::qconf::{FdManifest, Version};
use crate::{Error, Result};

/// How often the PID file is polled while waiting for exit.
const PID_WAIT_INTERVAL: Duration = Duration::from_millis(250);

/// How long a SIGKILL is given to take effect.
const KILL_TIMEOUT: Duration = Duration::from_secs(30);

/// Security sandboxing contract (AppArmor on typical hosts). Profile
/// generation is external; the supervisor only sequences load and
/// unload around the QEMU process lifetime.
pub trait Sandbox: Send + Sync {
    fn load_profile(
        &self,
        project: &str,
        name: &str,
        qemu_path: &Path,
    ) -> anyhow::Result<()>;

    fn unload_profile(&self, project: &str, name: &str)
        -> anyhow::Result<()>;
}

/// No-op sandbox for hosts without an LSM.
pub struct NullSandbox;

impl Sandbox for NullSandbox {
    fn load_profile(
        &self,
        _project: &str,
        _name: &str,
        _qemu_path: &Path,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn unload_profile(
        &self,
        _project: &str,
        _name: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Everything needed to launch one QEMU process.
pub struct SpawnArgs {
    pub qemu_path: PathBuf,
    pub args: Vec<String>,
    /// Descriptors mapped to fd 3 and up, in order.
    pub fds: FdManifest,
    /// Unprivileged user to drop to, when configured.
    pub run_as: Option<String>,
    /// Raise RLIMIT_MEMLOCK for PCI passthrough DMA pinning.
    pub raise_memlock: bool,
    pub early_log_path: PathBuf,
}

/// The privilege-drop arguments for a QEMU version: `-run-with user=`
/// replaced `-runas` in 9.1.
pub fn privilege_args(version: Version, user: &str) -> Vec<String> {
    if version >= Version(9, 1, 0) {
        vec!["-run-with".to_string(), format!("user={user}")]
    } else {
        vec!["-runas".to_string(), user.to_string()]
    }
}

/// Spawns QEMU and waits for the daemonizing parent to exit. Passed
/// descriptors are renumbered to 3..N in the child before exec.
pub async fn spawn_qemu(spawn: SpawnArgs, log: &Logger) -> Result<()> {
    let mut command = tokio::process::Command::new(&spawn.qemu_path);
    command.args(&spawn.args);

    if let Some(user) = &spawn.run_as {
        debug!(log, "dropping QEMU privileges"; "user" => user);
    }

    let early_log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spawn.early_log_path)?;
    command.stdout(early_log.try_clone()?);
    command.stderr(early_log);

    // The owners must stay alive until the child has been forked;
    // dropped only after the daemonizing parent exits below.
    let files: Vec<OwnedFd> = spawn.fds.into_files();
    let raw_fds: Vec<i32> = files.iter().map(AsRawFd::as_raw_fd).collect();

    let raise_memlock = spawn.raise_memlock;
    let fd_count = raw_fds.len() as i32;

    // SAFETY: pre_exec runs between fork and exec; only async-signal-
    // safe calls (dup2, fcntl, close, setrlimit) are made.
    unsafe {
        command.pre_exec(move || {
            // Park sources above the target range first so a source
            // numerically inside 3..3+N cannot be clobbered before it
            // is copied.
            let base = FdManifest::FIRST_FD + fd_count;
            let mut parked = Vec::with_capacity(raw_fds.len());
            for fd in &raw_fds {
                let parked_fd = libc::fcntl(*fd, libc::F_DUPFD, base);
                if parked_fd < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                parked.push(parked_fd);
            }

            for (i, parked_fd) in parked.iter().enumerate() {
                let target = FdManifest::FIRST_FD + i as i32;
                if libc::dup2(*parked_fd, target) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::close(*parked_fd);
            }

            if raise_memlock {
                let unlimited = libc::rlimit {
                    rlim_cur: libc::RLIM_INFINITY,
                    rlim_max: libc::RLIM_INFINITY,
                };
                if libc::setrlimit(libc::RLIMIT_MEMLOCK, &unlimited) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    let status = command.status().await?;
    drop(files);
    if !status.success() {
        return Err(Error::internal(format!(
            "QEMU failed to start (status {status})"
        )));
    }

    Ok(())
}

/// Resolves an unprivileged user to (uid, gid) for the pre-spawn
/// ownership fixups QEMU's privilege drop requires.
pub fn resolve_user(name: &str) -> Option<(u32, u32)> {
    let cname = std::ffi::CString::new(name).ok()?;
    // SAFETY: getpwnam returns a pointer into static storage valid
    // until the next passwd lookup on this thread.
    unsafe {
        let pw = libc::getpwnam(cname.as_ptr());
        if pw.is_null() {
            None
        } else {
            Some(((*pw).pw_uid, (*pw).pw_gid))
        }
    }
}

/// Changes ownership of a path (non-recursive).
pub fn chown_path(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // SAFETY: plain chown(2) on a NUL-terminated path.
    let rc = unsafe { libc::chown(cpath.as_ptr(), uid, gid) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Reads the PID file and validates the process is still our QEMU.
///
/// `Ok(None)` when the PID file or process is gone; `Err` when the PID
/// names a process that is not this instance's QEMU (PID reuse).
pub fn pid(pid_file: &Path, instance_uuid: &str) -> Result<Option<i32>> {
    let contents = match std::fs::read_to_string(pid_file) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(None)
        }
        Err(e) => return Err(e.into()),
    };

    let pid: i32 = contents.trim().parse().map_err(|_| {
        Error::internal(format!(
            "unparseable PID file {}",
            pid_file.display()
        ))
    })?;

    let cmdline =
        match std::fs::read(format!("/proc/{pid}/cmdline")) {
            Ok(c) => c,
            Err(_) => return Ok(None),
        };

    let haystack = String::from_utf8_lossy(&cmdline);
    if !haystack.contains("qemu-system")
        || !haystack.contains(instance_uuid)
    {
        return Err(Error::internal(
            "PID file does not match the running process".to_string(),
        ));
    }

    Ok(Some(pid))
}

/// Best-effort live PID, swallowing mismatch errors.
pub fn pid_live(pid_file: &Path, instance_uuid: &str) -> Option<i32> {
    pid(pid_file, instance_uuid).ok().flatten()
}

/// Polls until the QEMU process exits. True on exit, false on timeout.
pub async fn pid_wait(
    pid_file: &Path,
    instance_uuid: &str,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if pid_live(pid_file, instance_uuid).is_none() {
            return true;
        }

        if tokio::time::Instant::now() > deadline {
            return false;
        }

        tokio::time::sleep(PID_WAIT_INTERVAL).await;
    }
}

/// SIGKILLs the process and waits for it to disappear.
pub async fn kill_process(pid: i32, log: &Logger) -> Result<()> {
    // SAFETY: plain kill(2).
    let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err.into());
    }

    let deadline = tokio::time::Instant::now() + KILL_TIMEOUT;
    loop {
        if !Path::new(&format!("/proc/{pid}")).exists() {
            return Ok(());
        }

        if tokio::time::Instant::now() > deadline {
            error!(log, "QEMU process survived SIGKILL"; "pid" => pid);
            return Err(Error::internal(format!(
                "process {pid} did not exit after SIGKILL"
            )));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_pid_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "vespiary-pid-{}-{name}",
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn missing_pid_file_means_stopped() {
        let path = std::env::temp_dir().join("vespiary-no-such-pidfile");
        assert!(pid(&path, "uuid").unwrap().is_none());
    }

    #[test]
    fn dead_process_means_stopped() {
        // PID 1 exists but is never qemu-system; an absurd PID is gone.
        let path = temp_pid_file("dead", "999999999");
        assert!(pid(&path, "uuid").unwrap().is_none());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn reused_pid_is_rejected() {
        // Our own PID is alive but certainly not a qemu-system process
        // carrying the instance UUID.
        let path =
            temp_pid_file("reused", &std::process::id().to_string());
        assert!(pid(&path, "49a430e5").is_err());
        assert!(pid_live(&path, "49a430e5").is_none());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn privilege_flags_switch_at_nine_one() {
        assert_eq!(
            privilege_args(Version(8, 2, 0), "vmuser"),
            vec!["-runas", "vmuser"]
        );
        assert_eq!(
            privilege_args(Version(9, 1, 0), "vmuser"),
            vec!["-run-with", "user=vmuser"]
        );
    }

    #[tokio::test]
    async fn pid_wait_returns_quickly_when_gone() {
        let path = std::env::temp_dir().join("vespiary-waitgone");
        let _ = std::fs::remove_file(&path);
        assert!(pid_wait(&path, "uuid", Duration::from_secs(1)).await);
    }
}
