// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The monitor client: connection management, request correlation and
//! the high-level command surface the instance driver consumes.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use slog::{debug, o, warn, Logger};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::messages::{
    BalloonInfo, ChardevChange, CpuInfoFast, CpuModelExpansion, Event,
    FdsetInfo, Greeting, HotpluggableCpu, MemorySizeSummary, MigrationStatus,
    PciBusInfo, PciDeviceInfo, Request, Response, SevCapabilities, StatusInfo,
};
use crate::{Error, Result};

/// Interval between connection attempts while the socket is not yet
/// accepting.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Ring buffer size requested when swapping a console chardev back to a
/// ring buffer backend.
const CONSOLE_RINGBUF_SIZE: usize = 1024 * 1024;

/// How long `blockdev-del` keeps retrying while the node is still held
/// by a draining block job.
const BLOCKDEV_DEL_RETRY: Duration = Duration::from_secs(10);

/// Tunables for a monitor connection.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Total time to keep retrying the initial socket dial.
    pub connect_timeout: Duration,

    /// Default per-command reply timeout.
    pub command_timeout: Duration,

    /// Append a transcript of all traffic to this file when set.
    pub log_file: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            log_file: None,
        }
    }
}

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// A live QMP connection.
///
/// Cheap to share: all methods take `&self` and any number of callers
/// may issue commands concurrently.
pub struct Monitor {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// Raw fd of the socket, used for SCM_RIGHTS ancillary sends.
    sock_fd: RawFd,
    pending: Pending,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    on_disconnect_event: Arc<AtomicBool>,
    events: broadcast::Sender<Event>,
    cfg: MonitorConfig,
    traffic: Option<Arc<StdMutex<std::fs::File>>>,
    log: Logger,
}

impl Monitor {
    /// Dials the monitor socket, retrying every 50 ms until either the
    /// dial succeeds or `cfg.connect_timeout` elapses, then performs
    /// the capabilities handshake.
    ///
    /// Events (and the synthetic disconnect shutdown event, when
    /// enabled) are forwarded to `event_tx`.
    pub async fn connect(
        path: &Path,
        event_tx: mpsc::UnboundedSender<Event>,
        cfg: MonitorConfig,
        log: &Logger,
    ) -> Result<Arc<Self>> {
        let log = log.new(o!("component" => "qmp"));

        let deadline = tokio::time::Instant::now() + cfg.connect_timeout;
        let stream = loop {
            match UnixStream::connect(path).await {
                Ok(s) => break s,
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(_) => return Err(Error::ConnectTimeout),
            }
        };

        let sock_fd = stream.as_raw_fd();
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let traffic = match &cfg.log_file {
            Some(p) => Some(Arc::new(StdMutex::new(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(p)?,
            ))),
            None => None,
        };

        // The greeting arrives before anything else; consume it here so
        // the reader task only ever sees responses and events.
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let _: Greeting = serde_json::from_str(&line)?;

        let (broadcast_tx, _) = broadcast::channel(64);
        let monitor = Arc::new(Self {
            writer: tokio::sync::Mutex::new(write_half),
            sock_fd,
            pending: Arc::new(StdMutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            connected: Arc::new(AtomicBool::new(true)),
            on_disconnect_event: Arc::new(AtomicBool::new(false)),
            events: broadcast_tx,
            cfg,
            traffic,
            log,
        });

        tokio::spawn(Self::run_reader(
            reader,
            monitor.pending.clone(),
            monitor.events.clone(),
            event_tx,
            monitor.connected.clone(),
            monitor.on_disconnect_event.clone(),
            monitor.traffic.clone(),
            monitor.log.clone(),
        ));

        monitor.execute("qmp_capabilities", None).await?;
        Ok(monitor)
    }

    /// Controls whether a monitor disconnect is reported to the event
    /// channel as a synthetic `SHUTDOWN` event. Off during startup so
    /// a mid-start failure does not trigger stop cleanup; on once the
    /// instance is fully started.
    pub fn set_on_disconnect_event(&self, enabled: bool) {
        self.on_disconnect_event.store(enabled, Ordering::SeqCst);
    }

    /// True while the reader task still holds a live socket.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Shuts the connection down without treating it as a VM shutdown.
    pub async fn disconnect(&self) {
        self.on_disconnect_event.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_reader(
        mut reader: BufReader<OwnedReadHalf>,
        pending: Pending,
        broadcast_tx: broadcast::Sender<Event>,
        event_tx: mpsc::UnboundedSender<Event>,
        connected: Arc<AtomicBool>,
        on_disconnect_event: Arc<AtomicBool>,
        traffic: Option<Arc<StdMutex<std::fs::File>>>,
        log: Logger,
    ) {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }

            if let Some(t) = &traffic {
                log_traffic(t, "<-", line.trim_end());
            }

            if let Ok(event) = serde_json::from_str::<Event>(&line) {
                debug!(log, "event received"; "event" => &event.name);
                let _ = broadcast_tx.send(event.clone());
                let _ = event_tx.send(event);
                continue;
            }

            let resp: Response = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!(log, "undecodable monitor message";
                          "err" => %e, "line" => line.trim_end());
                    continue;
                }
            };

            let Some(id) = resp.id else {
                continue;
            };

            let waiter = pending.lock().unwrap().remove(&id);
            if let Some(tx) = waiter {
                let result = match resp.error {
                    // The command name is filled in by the waiting
                    // caller, which knows what it asked for.
                    Some(error) => {
                        Err(Error::Command { command: "", error })
                    }
                    None => Ok(resp.ret.unwrap_or(Value::Null)),
                };
                let _ = tx.send(result);
            }
        }

        connected.store(false, Ordering::SeqCst);

        // Everyone still waiting sees the disconnect rather than a
        // timeout.
        let waiters: Vec<_> =
            pending.lock().unwrap().drain().map(|(_, tx)| tx).collect();
        for tx in waiters {
            let _ = tx.send(Err(Error::Disconnected));
        }

        if on_disconnect_event.load(Ordering::SeqCst) {
            debug!(log, "monitor disconnected, synthesizing shutdown event");
            let event = Event {
                name: crate::EVENT_SHUTDOWN.to_string(),
                data: json!({ "reason": crate::SHUTDOWN_REASON_DISCONNECT }),
                timestamp: Value::Null,
            };
            let _ = event_tx.send(event);
        } else {
            debug!(log, "monitor disconnected");
        }
    }

    /// Issues a command and waits for its correlated reply, bounded by
    /// the default command timeout.
    pub async fn execute(
        &self,
        command: &'static str,
        arguments: Option<Value>,
    ) -> Result<Value> {
        self.execute_inner(
            command,
            command,
            arguments,
            None,
            self.cfg.command_timeout,
        )
        .await
    }

    /// As [`execute`](Self::execute) with an explicit timeout.
    pub async fn execute_timeout(
        &self,
        command: &'static str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.execute_inner(command, command, arguments, None, timeout)
            .await
    }

    /// Issues a command whose name is only known at runtime (operator
    /// supplied QMP hook stages). Errors carry a generic label.
    pub async fn execute_raw(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Value> {
        self.execute_inner(
            command,
            "raw",
            arguments,
            None,
            self.cfg.command_timeout,
        )
        .await
    }

    /// Issues a command whose message carries a file descriptor as
    /// SCM_RIGHTS ancillary data (`getfd`, `add-fd`).
    pub async fn execute_with_fd(
        &self,
        command: &'static str,
        arguments: Option<Value>,
        fd: RawFd,
    ) -> Result<Value> {
        self.execute_inner(
            command,
            command,
            arguments,
            Some(fd),
            self.cfg.command_timeout,
        )
        .await
    }

    async fn execute_inner(
        &self,
        command: &str,
        label: &'static str,
        arguments: Option<Value>,
        fd: Option<RawFd>,
        timeout: Duration,
    ) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut buf = serde_json::to_vec(&Request {
            execute: command,
            arguments,
            id,
        })?;
        buf.push(b'\n');

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        {
            let mut writer = self.writer.lock().await;
            if let Some(t) = &self.traffic {
                log_traffic(t, "->", String::from_utf8_lossy(&buf).trim_end());
            }

            let res = match fd {
                Some(fd) => {
                    send_with_fd(self.sock_fd, &buf, fd, &mut writer)
                        .await
                }
                None => {
                    writer.write_all(&buf).await.map_err(Error::from)
                }
            };
            if let Err(e) = res {
                self.pending.lock().unwrap().remove(&id);
                return Err(e);
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result.map_err(|e| match e {
                // Stamp the command name onto errors produced by the
                // reader, which doesn't know it.
                Error::Command { error, .. } => {
                    Error::Command { command: label, error }
                }
                other => other,
            }),
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(Error::CommandTimeout { command: label, timeout })
            }
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(
        command: &'static str,
        value: Value,
    ) -> Result<T> {
        serde_json::from_value(value.clone()).map_err(|_| {
            Error::UnexpectedResponse { command, response: value }
        })
    }

    /// Waits for the next event matching `pred`, bounded by `timeout`.
    async fn wait_event<F>(&self, timeout: Duration, pred: F) -> Result<Event>
    where
        F: Fn(&Event) -> bool,
    {
        let mut rx = self.events.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let now = tokio::time::Instant::now();
            let remaining = if deadline > now {
                deadline - now
            } else {
                Duration::ZERO
            };
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(ev)) if pred(&ev) => return Ok(ev),
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(_)) => return Err(Error::Disconnected),
                Err(_) => {
                    return Err(Error::CommandTimeout {
                        command: "event-wait",
                        timeout,
                    })
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Run state
    // ------------------------------------------------------------------

    /// `query-status`.
    pub async fn status(&self) -> Result<StatusInfo> {
        let v = self.execute("query-status", None).await?;
        Self::decode("query-status", v)
    }

    /// `system_powerdown`: ask the guest to shut down via ACPI.
    pub async fn powerdown(&self) -> Result<()> {
        self.execute("system_powerdown", None).await.map(|_| ())
    }

    /// `system_reset`: hard-reset the machine.
    pub async fn system_reset(&self) -> Result<()> {
        self.execute("system_reset", None).await.map(|_| ())
    }

    /// `quit`: terminate the QEMU process. QEMU may exit before the
    /// reply makes it out, so a disconnect is success here.
    pub async fn quit(&self) -> Result<()> {
        match self.execute("quit", None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_disconnect() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// `stop`: pause guest execution.
    pub async fn pause(&self) -> Result<()> {
        self.execute("stop", None).await.map(|_| ())
    }

    /// `cont`: resume guest execution.
    pub async fn resume(&self) -> Result<()> {
        self.execute("cont", None).await.map(|_| ())
    }

    /// `set-action`: configure QEMU's reaction to guest events, e.g.
    /// `{"shutdown": "pause"}` while a stateful stop is in progress.
    pub async fn set_action(&self, actions: Value) -> Result<()> {
        self.execute("set-action", Some(actions)).await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // CPU, memory, PCI introspection
    // ------------------------------------------------------------------

    /// `query-cpus-fast`.
    pub async fn query_cpus_fast(&self) -> Result<Vec<CpuInfoFast>> {
        let v = self.execute("query-cpus-fast", None).await?;
        Self::decode("query-cpus-fast", v)
    }

    /// `query-hotpluggable-cpus`.
    pub async fn query_hotpluggable_cpus(
        &self,
    ) -> Result<Vec<HotpluggableCpu>> {
        let v = self.execute("query-hotpluggable-cpus", None).await?;
        Self::decode("query-hotpluggable-cpus", v)
    }

    /// `query-memory-size-summary`.
    pub async fn query_memory_size_summary(
        &self,
    ) -> Result<MemorySizeSummary> {
        let v = self.execute("query-memory-size-summary", None).await?;
        Self::decode("query-memory-size-summary", v)
    }

    /// `query-balloon`.
    pub async fn query_balloon(&self) -> Result<BalloonInfo> {
        let v = self.execute("query-balloon", None).await?;
        Self::decode("query-balloon", v)
    }

    /// `balloon`: set the balloon target in bytes.
    pub async fn balloon(&self, target: u64) -> Result<()> {
        self.execute("balloon", Some(json!({ "value": target })))
            .await
            .map(|_| ())
    }

    /// `query-pci`, flattened to a single device list across buses.
    pub async fn query_pci(&self) -> Result<Vec<PciDeviceInfo>> {
        let v = self.execute("query-pci", None).await?;
        let buses: Vec<PciBusInfo> = Self::decode("query-pci", v)?;
        Ok(buses.into_iter().flat_map(|b| b.devices).collect())
    }

    // ------------------------------------------------------------------
    // Device and object plumbing
    // ------------------------------------------------------------------

    /// `device_add`.
    pub async fn add_device(&self, device: Value) -> Result<()> {
        self.execute("device_add", Some(device)).await.map(|_| ())
    }

    /// `device_del`.
    pub async fn remove_device(&self, id: &str) -> Result<()> {
        self.execute("device_del", Some(json!({ "id": id })))
            .await
            .map(|_| ())
    }

    /// `object-add`.
    pub async fn add_object(&self, object: Value) -> Result<()> {
        self.execute("object-add", Some(object)).await.map(|_| ())
    }

    /// `object-del`.
    pub async fn remove_object(&self, id: &str) -> Result<()> {
        self.execute("object-del", Some(json!({ "id": id })))
            .await
            .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Block devices
    // ------------------------------------------------------------------

    /// `blockdev-add`.
    pub async fn add_blockdev(&self, blockdev: Value) -> Result<()> {
        self.execute("blockdev-add", Some(blockdev)).await.map(|_| ())
    }

    /// `blockdev-del`, retried while the node is still locked by a
    /// not-yet-drained block job.
    pub async fn remove_blockdev(&self, node_name: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + BLOCKDEV_DEL_RETRY;
        loop {
            let res = self
                .execute(
                    "blockdev-del",
                    Some(json!({ "node-name": node_name })),
                )
                .await;
            match res {
                Ok(_) => return Ok(()),
                Err(e)
                    if e.is_locked()
                        && tokio::time::Instant::now() < deadline =>
                {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `blockdev-snapshot`: redirect writes from `node` into `overlay`.
    pub async fn blockdev_snapshot(
        &self,
        node: &str,
        overlay: &str,
    ) -> Result<()> {
        self.execute(
            "blockdev-snapshot",
            Some(json!({ "node": node, "overlay": overlay })),
        )
        .await
        .map(|_| ())
    }

    /// `block-commit`: merge `node` back into its backing file, waiting
    /// for the commit job to drain and complete.
    pub async fn block_commit(&self, node: &str) -> Result<()> {
        let job_id = format!("commit-{node}");
        self.execute(
            "block-commit",
            Some(json!({ "device": node, "job-id": &job_id })),
        )
        .await?;

        let ready = |ev: &Event| {
            ev.name == "BLOCK_JOB_READY"
                && ev.data.get("device").and_then(Value::as_str)
                    == Some(job_id.as_str())
        };
        self.wait_event(self.cfg.command_timeout, ready).await?;

        self.execute(
            "block-job-complete",
            Some(json!({ "device": &job_id })),
        )
        .await?;

        let completed = |ev: &Event| {
            ev.name == "BLOCK_JOB_COMPLETED"
                && ev.data.get("device").and_then(Value::as_str)
                    == Some(job_id.as_str())
        };
        self.wait_event(self.cfg.command_timeout, completed).await?;
        Ok(())
    }

    /// `blockdev-mirror` from `node` to `target`, returning once the
    /// mirror reaches the ready (synchronized) state.
    pub async fn blockdev_mirror(
        &self,
        node: &str,
        target: &str,
    ) -> Result<()> {
        let job_id = format!("mirror-{node}");
        self.execute(
            "blockdev-mirror",
            Some(json!({
                "device": node,
                "target": target,
                "sync": "full",
                "job-id": &job_id,
                // Guest writes outrunning the mirror stall the guest
                // rather than failing the job.
                "copy-mode": "write-blocking",
            })),
        )
        .await?;

        let ready = |ev: &Event| {
            ev.name == "BLOCK_JOB_READY"
                && ev.data.get("device").and_then(Value::as_str)
                    == Some(job_id.as_str())
        };
        // Mirror duration is bounded by disk size, not command latency.
        self.wait_event(Duration::from_secs(3600), ready).await?;
        Ok(())
    }

    /// `block-job-cancel` for the job started on `node`, waiting for
    /// QEMU to acknowledge completion of the cancellation.
    pub async fn block_job_cancel(&self, node: &str) -> Result<()> {
        let job_id = format!("mirror-{node}");
        self.execute(
            "block-job-cancel",
            Some(json!({ "device": &job_id })),
        )
        .await?;

        let gone = |ev: &Event| {
            matches!(
                ev.name.as_str(),
                "BLOCK_JOB_CANCELLED" | "BLOCK_JOB_COMPLETED"
            ) && ev.data.get("device").and_then(Value::as_str)
                == Some(job_id.as_str())
        };
        self.wait_event(self.cfg.command_timeout, gone).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Migration
    // ------------------------------------------------------------------

    /// `migrate-set-capabilities`.
    pub async fn migrate_set_capabilities(
        &self,
        capabilities: &[(&str, bool)],
    ) -> Result<()> {
        let caps: Vec<Value> = capabilities
            .iter()
            .map(|(name, on)| json!({ "capability": name, "state": on }))
            .collect();
        self.execute(
            "migrate-set-capabilities",
            Some(json!({ "capabilities": caps })),
        )
        .await
        .map(|_| ())
    }

    /// `migrate-set-parameters`.
    pub async fn migrate_set_parameters(&self, params: Value) -> Result<()> {
        self.execute("migrate-set-parameters", Some(params))
            .await
            .map(|_| ())
    }

    /// `migrate` towards a file descriptor previously passed with
    /// `getfd`.
    pub async fn migrate_to_fd(&self, fd: RawFd) -> Result<()> {
        self.send_fd("migration", fd).await?;
        self.execute("migrate", Some(json!({ "uri": "fd:migration" })))
            .await
            .map(|_| ())
    }

    /// `migrate-incoming` from a file descriptor previously passed with
    /// `getfd`. The VM must have been launched with `-incoming defer`.
    pub async fn migrate_incoming_fd(&self, fd: RawFd) -> Result<()> {
        self.send_fd("migration", fd).await?;
        self.execute(
            "migrate-incoming",
            Some(json!({ "uri": "fd:migration" })),
        )
        .await
        .map(|_| ())
    }

    /// `migrate-continue` out of the named paused state.
    pub async fn migrate_continue(&self, state: &str) -> Result<()> {
        self.execute("migrate-continue", Some(json!({ "state": state })))
            .await
            .map(|_| ())
    }

    /// `query-migrate`.
    pub async fn query_migrate(&self) -> Result<MigrationStatus> {
        let v = self.execute("query-migrate", None).await?;
        Self::decode("query-migrate", v)
    }

    /// Polls `query-migrate` once a second until the named state is
    /// reached. A `failed` or `cancelled` status is an error.
    pub async fn migrate_wait(&self, target: &str) -> Result<()> {
        loop {
            let status = self.query_migrate().await?;
            let state = status.status.as_deref().unwrap_or("");
            if state == target {
                return Ok(());
            }

            if matches!(state, "failed" | "cancelled") {
                return Err(Error::MigrationFailed(
                    state.to_string(),
                    target.to_string(),
                ));
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    // ------------------------------------------------------------------
    // File descriptor passing
    // ------------------------------------------------------------------

    /// `getfd`: hand QEMU a descriptor under a name usable in `fd:`
    /// URIs and chardev definitions.
    pub async fn send_fd(&self, name: &str, fd: RawFd) -> Result<()> {
        self.execute_with_fd("getfd", Some(json!({ "fdname": name })), fd)
            .await
            .map(|_| ())
    }

    /// `closefd`.
    pub async fn close_fd(&self, name: &str) -> Result<()> {
        self.execute("closefd", Some(json!({ "fdname": name })))
            .await
            .map(|_| ())
    }

    /// `add-fd`: place a descriptor into a new fdset tagged with
    /// `opaque`, for use as `/dev/fdset/<id>` paths in block devices.
    pub async fn add_fd_to_fdset(
        &self,
        opaque: &str,
        fd: RawFd,
    ) -> Result<FdsetInfo> {
        let v = self
            .execute_with_fd("add-fd", Some(json!({ "opaque": opaque })), fd)
            .await?;
        Self::decode("add-fd", v)
    }

    /// Removes every fdset whose members carry the given opaque tag.
    pub async fn remove_fdset(&self, opaque: &str) -> Result<()> {
        let v = self.execute("query-fdsets", None).await?;
        let fdsets: Vec<Value> = Self::decode("query-fdsets", v)?;
        for fdset in fdsets {
            let tagged = fdset
                .get("fds")
                .and_then(Value::as_array)
                .map(|fds| {
                    fds.iter().any(|fd| {
                        fd.get("opaque").and_then(Value::as_str)
                            == Some(opaque)
                    })
                })
                .unwrap_or(false);
            if !tagged {
                continue;
            }

            if let Some(id) = fdset.get("fdset-id").and_then(Value::as_i64) {
                self.execute(
                    "remove-fd",
                    Some(json!({ "fdset-id": id })),
                )
                .await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Chardevs and the console
    // ------------------------------------------------------------------

    /// `chardev-add`.
    pub async fn chardev_add(&self, chardev: Value) -> Result<()> {
        self.execute("chardev-add", Some(chardev)).await.map(|_| ())
    }

    /// `chardev-remove`.
    pub async fn chardev_remove(&self, id: &str) -> Result<()> {
        self.execute("chardev-remove", Some(json!({ "id": id })))
            .await
            .map(|_| ())
    }

    /// `chardev-change`: swap the backend of an existing chardev,
    /// either to a listening socket whose FD is passed along or back to
    /// a ring buffer.
    pub async fn chardev_change(
        &self,
        id: &str,
        change: ChardevChange,
        fd: Option<RawFd>,
    ) -> Result<()> {
        let backend = match change {
            ChardevChange::Socket { fd_name } => {
                let fd = fd.ok_or(Error::UnexpectedResponse {
                    command: "chardev-change",
                    response: Value::Null,
                })?;
                self.send_fd(&fd_name, fd).await?;
                json!({
                    "type": "socket",
                    "data": {
                        "addr": {
                            "type": "fd",
                            "data": { "str": fd_name },
                        },
                        "server": true,
                        "wait": false,
                    },
                })
            }
            ChardevChange::Ringbuf => json!({
                "type": "ringbuf",
                "data": { "size": CONSOLE_RINGBUF_SIZE },
            }),
        };

        self.execute(
            "chardev-change",
            Some(json!({ "id": id, "backend": backend })),
        )
        .await
        .map(|_| ())
    }

    /// `ringbuf-read`: drain the named ring buffer chardev.
    pub async fn ringbuf_read(&self, device: &str) -> Result<String> {
        let res = self
            .execute(
                "ringbuf-read",
                Some(json!({
                    "device": device,
                    "size": CONSOLE_RINGBUF_SIZE,
                    "format": "utf8",
                })),
            )
            .await;

        match res {
            Ok(v) => match v.as_str() {
                Some(s) => Ok(s.to_string()),
                None => Err(Error::UnexpectedResponse {
                    command: "ringbuf-read",
                    response: v,
                }),
            },
            Err(Error::Command { error, .. })
                if error.desc.contains("ring buffer")
                    || error.desc.contains("ringbuf") =>
            {
                Err(Error::NotARingbuf(device.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// `ringbuf-write`.
    pub async fn ringbuf_write(&self, device: &str, data: &str) -> Result<()> {
        self.execute(
            "ringbuf-write",
            Some(json!({
                "device": device,
                "data": data,
                "format": "utf8",
            })),
        )
        .await
        .map(|_| ())
    }

    /// `screendump` of the primary display to a file path.
    pub async fn screendump(&self, filename: &str) -> Result<()> {
        self.execute("screendump", Some(json!({ "filename": filename })))
            .await
            .map(|_| ())
    }

    /// `dump-guest-memory` towards a passed descriptor.
    pub async fn dump_guest_memory(
        &self,
        fd: RawFd,
        format: &str,
    ) -> Result<()> {
        self.send_fd("dump", fd).await?;
        self.execute_timeout(
            "dump-guest-memory",
            Some(json!({
                "paging": false,
                "protocol": "fd:dump",
                "format": format,
            })),
            Duration::from_secs(3600),
        )
        .await
        .map(|_| ())
    }

    // ------------------------------------------------------------------
    // NBD export (migration receiver side)
    // ------------------------------------------------------------------

    /// `nbd-server-start` listening on a passed socket descriptor.
    pub async fn nbd_server_start(&self, fd: RawFd) -> Result<()> {
        self.send_fd("nbd-listener", fd).await?;
        self.execute(
            "nbd-server-start",
            Some(json!({
                "addr": {
                    "type": "fd",
                    "data": { "str": "nbd-listener" },
                },
            })),
        )
        .await
        .map(|_| ())
    }

    /// `block-export-add` of a node as a writable NBD export.
    pub async fn block_export_add(
        &self,
        export: &str,
        node_name: &str,
    ) -> Result<()> {
        self.execute(
            "block-export-add",
            Some(json!({
                "type": "nbd",
                "id": export,
                "node-name": node_name,
                "name": export,
                "writable": true,
            })),
        )
        .await
        .map(|_| ())
    }

    /// `nbd-server-stop`.
    pub async fn nbd_server_stop(&self) -> Result<()> {
        self.execute("nbd-server-stop", None).await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Feature probes
    // ------------------------------------------------------------------

    /// `query-sev-capabilities`.
    pub async fn query_sev_capabilities(&self) -> Result<SevCapabilities> {
        let v = self.execute("query-sev-capabilities", None).await?;
        Self::decode("query-sev-capabilities", v)
    }

    /// `query-cpu-model-expansion` of the named model.
    pub async fn query_cpu_model_expansion(
        &self,
        model: &str,
    ) -> Result<CpuModelExpansion> {
        let v = self
            .execute(
                "query-cpu-model-expansion",
                Some(json!({
                    "type": "full",
                    "model": { "name": model },
                })),
            )
            .await?;
        Self::decode("query-cpu-model-expansion", v)
    }
}

fn log_traffic(
    file: &Arc<StdMutex<std::fs::File>>,
    direction: &str,
    line: &str,
) {
    use std::io::Write;
    if let Ok(mut f) = file.lock() {
        let _ = writeln!(f, "{direction} {line}");
    }
}

/// Writes `buf` to the socket with `pass_fd` attached as SCM_RIGHTS
/// ancillary data. The descriptor rides along with the first byte; any
/// remainder is written through the regular async path.
async fn send_with_fd(
    sock_fd: RawFd,
    buf: &[u8],
    pass_fd: RawFd,
    writer: &mut tokio::sync::MutexGuard<'_, OwnedWriteHalf>,
) -> Result<()> {
    let writer: &mut OwnedWriteHalf = writer;
    let sent = loop {
        match sendmsg_fd(sock_fd, buf, pass_fd) {
            Ok(n) => break n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => return Err(e.into()),
        }
    };

    if sent < buf.len() {
        writer.write_all(&buf[sent..]).await?;
    }
    Ok(())
}

fn sendmsg_fd(
    sock_fd: RawFd,
    buf: &[u8],
    pass_fd: RawFd,
) -> std::io::Result<usize> {
    // SAFETY: all pointers handed to sendmsg(2) reference storage that
    // outlives the call.
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        let cmsg_space = libc::CMSG_SPACE(
            std::mem::size_of::<RawFd>() as libc::c_uint,
        ) as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len =
            libc::CMSG_LEN(std::mem::size_of::<RawFd>() as libc::c_uint)
                as _;
        std::ptr::copy_nonoverlapping(
            &pass_fd as *const RawFd as *const u8,
            libc::CMSG_DATA(cmsg),
            std::mem::size_of::<RawFd>(),
        );

        let n = libc::sendmsg(sock_fd, &msg, libc::MSG_NOSIGNAL);
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    /// A scripted QMP endpoint: sends the greeting, answers
    /// qmp_capabilities, then runs the supplied handler over raw
    /// request lines.
    async fn fake_qmp_server<F>(
        listener: UnixListener,
        handler: F,
    ) where
        F: Fn(Value) -> Option<Value> + Send + 'static,
    {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();

        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = match sock.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);

            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let req: Value = serde_json::from_slice(&line).unwrap();
                let id = req["id"].clone();
                let reply = match req["execute"].as_str().unwrap() {
                    "qmp_capabilities" => json!({ "return": {}, "id": id }),
                    _ => match handler(req.clone()) {
                        Some(mut r) => {
                            r["id"] = id;
                            r
                        }
                        None => return,
                    },
                };
                let mut out = serde_json::to_vec(&reply).unwrap();
                out.push(b'\n');
                if sock.write_all(&out).await.is_err() {
                    return;
                }
            }
        }
    }

    fn sock_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("qmp-test-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[tokio::test]
    async fn connect_and_query_status() {
        let path = sock_path("status");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_qmp_server(listener, |req| {
            assert_eq!(req["execute"], "query-status");
            Some(json!({
                "return": { "status": "running", "running": true },
            }))
        }));

        let (tx, _rx) = mpsc::unbounded_channel();
        let monitor = Monitor::connect(
            &path,
            tx,
            MonitorConfig::default(),
            &test_logger(),
        )
        .await
        .unwrap();

        let status = monitor.status().await.unwrap();
        assert_eq!(status.status, "running");
        assert!(status.running);
    }

    #[tokio::test]
    async fn command_error_is_typed() {
        let path = sock_path("error");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_qmp_server(listener, |_| {
            Some(json!({
                "error": {
                    "class": "DeviceNotFound",
                    "desc": "no such device",
                },
            }))
        }));

        let (tx, _rx) = mpsc::unbounded_channel();
        let monitor = Monitor::connect(
            &path,
            tx,
            MonitorConfig::default(),
            &test_logger(),
        )
        .await
        .unwrap();

        let err = monitor.remove_device("nope").await.unwrap_err();
        match err {
            Error::Command { command, error } => {
                assert_eq!(command, "device_del");
                assert_eq!(error.class, "DeviceNotFound");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn concurrent_commands_correlate() {
        let path = sock_path("concurrent");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_qmp_server(listener, |req| {
            // Echo the balloon target back so each caller can check it
            // got its own answer.
            assert_eq!(req["execute"], "query-balloon");
            Some(json!({ "return": { "actual": 4096 } }))
        }));

        let (tx, _rx) = mpsc::unbounded_channel();
        let monitor = Monitor::connect(
            &path,
            tx,
            MonitorConfig::default(),
            &test_logger(),
        )
        .await
        .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let m = monitor.clone();
            tasks.push(tokio::spawn(async move {
                m.query_balloon().await.unwrap().actual
            }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap(), 4096);
        }
    }

    #[tokio::test]
    async fn disconnect_synthesizes_shutdown_event_when_enabled() {
        let path = sock_path("disconnect");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_qmp_server(listener, |_| None));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = Monitor::connect(
            &path,
            tx,
            MonitorConfig::default(),
            &test_logger(),
        )
        .await
        .unwrap();

        monitor.set_on_disconnect_event(true);
        // The fake server hangs up on the first non-capabilities
        // command.
        let err = monitor.powerdown().await.unwrap_err();
        assert!(err.is_disconnect() || matches!(err, Error::Io(_)));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, crate::EVENT_SHUTDOWN);
        assert_eq!(event.reason(), Some(crate::SHUTDOWN_REASON_DISCONNECT));
    }

    #[tokio::test]
    async fn startup_disconnect_stays_silent() {
        let path = sock_path("silent");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_qmp_server(listener, |_| None));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = Monitor::connect(
            &path,
            tx,
            MonitorConfig::default(),
            &test_logger(),
        )
        .await
        .unwrap();

        // Default is off: a disconnect during startup is not a VM stop.
        let _ = monitor.powerdown().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_times_out_when_nothing_listens() {
        let path = sock_path("timeout");
        let (tx, _rx) = mpsc::unbounded_channel();
        let cfg = MonitorConfig {
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let err = Monitor::connect(&path, tx, cfg, &test_logger())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConnectTimeout));
    }
}
