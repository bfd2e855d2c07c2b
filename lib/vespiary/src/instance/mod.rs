// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The virtual-machine instance and its lifecycle state machine.
//!
//! An [`Instance`] realizes a declarative description (config keys,
//! profiles, expanded devices, a storage pool) as a QEMU process. The
//! observable states:
//!
//! ```text
//!   Stopped <------------------+----------------+
//!      |                       |                |
//!      | start                 | onStop         |
//!      v                       |                |
//!   Running <---> Frozen       |             Error
//!      |    pause/resume       |                ^
//!      | guest signals Ready   |                |
//!      v                       |   QMP dead,    |
//!    Ready --------------------+   PID alive ---+
//! ```
//!
//! Every mutating operation runs under the instance's operation lock
//! (see [`crate::oplock`]); the inheritance sets below encode which
//! in-flight operations an action may attach to instead of waiting.
//! Any failure during start unwinds through a [`Reverter`] so that a
//! failed start is indistinguishable from no start: no process, no
//! PID file, no mounted config volume, no loaded security profile.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use qmp::{Event, Monitor, MonitorConfig};
use slog::{debug, error, info, o, warn, Logger};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{
    self, is_true, ConfigMap, DeviceConfig, DeviceMap, Profile,
};
use crate::device::{
    Device, DeviceProvider, MountEntry, NetworkEntry, RunConfig, RunEntry,
};
use crate::oplock::{Action, LockError, Locks, Operation};
use crate::qconf::{
    self, boot_indexes, cpu, firmware, memory, Architecture, ConfigBuilder,
    QemuFeatures,
};
use crate::revert::Reverter;
use crate::storage::{MigrationStream, StorageError, StoragePool};
use crate::supervisor::{self, Sandbox, SpawnArgs};
use crate::{console, hotplug, migrate, vsock, Error, Result};

pub mod paths;

pub use paths::InstancePaths;

/// Inheritance sets for the operation lock, one per caller action.
const INHERIT_STOP: &[Action] =
    &[Action::Restart, Action::Restore, Action::Migrate];
const INHERIT_SHUTDOWN: &[Action] = &[Action::Restart];
const INHERIT_START: &[Action] = &[Action::Restart, Action::Restore];
const INHERIT_UPDATE: &[Action] = &[Action::Restart, Action::Restore];
const INHERIT_CONSOLE: &[Action] =
    &[Action::Restart, Action::Restore, Action::Migrate];

/// How long a stop waits for onStop cleanup before escalating to a
/// forced kill.
const STOP_ESCALATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long onStop waits for the QEMU process to flush and exit.
const ONSTOP_PID_WAIT: Duration = Duration::from_secs(300);

/// Power states recorded in `volatile.last_state.power`.
const POWER_RUNNING: &str = "RUNNING";
const POWER_STOPPED: &str = "STOPPED";

/// Vsock port the in-guest agent listens on.
const AGENT_VSOCK_PORT: u32 = 8443;

/// Externally visible instance status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Running,
    Frozen,
    /// Running, and the guest agent has signaled readiness.
    Ready,
    /// A QEMU process exists but no longer answers QMP; only a forced
    /// stop is permitted.
    Error,
}

impl Status {
    pub fn is_running(&self) -> bool {
        matches!(self, Status::Running | Status::Ready | Status::Frozen)
    }
}

/// Persists volatile keys. The database layer is an external
/// collaborator; during intra-cluster same-name moves persistence is
/// suspended so the receiver's freshly written keys survive the
/// source's stop path.
pub trait VolatileStore: Send + Sync {
    fn set(
        &self,
        project: &str,
        name: &str,
        values: &ConfigMap,
    ) -> anyhow::Result<()>;
}

/// Host-to-guest agent channel (vsock). External collaborator.
pub trait AgentChannel: Send + Sync {
    /// Tells the in-guest agent where to reach the host.
    fn advertise_vsock(
        &self,
        project: &str,
        name: &str,
        cid: u32,
        port: u32,
    ) -> anyhow::Result<()>;
}

/// Collaborators and host facts handed to every instance.
pub struct Deps {
    pub pool: Arc<dyn StoragePool>,
    pub devices: Arc<dyn DeviceProvider>,
    pub volatile: Arc<dyn VolatileStore>,
    pub sandbox: Arc<dyn Sandbox>,
    pub agent: Arc<dyn AgentChannel>,
    pub locks: Arc<Locks>,
    pub features: QemuFeatures,
    /// Directory holding the UEFI firmware builds.
    pub firmware_dir: PathBuf,
    /// Unprivileged user QEMU drops to, when configured.
    pub qemu_user: Option<String>,
    /// Member of a cluster (affects memory hotplug ceilings).
    pub clustered: bool,
    /// QMP connect timeout; the 5 s default in production.
    pub connect_timeout: Duration,
}

/// Construction-time description of an instance.
pub struct InstanceArgs {
    pub project: String,
    pub name: String,
    pub id: i64,
    pub architecture: Architecture,
    pub ephemeral: bool,
    pub local_config: ConfigMap,
    pub local_devices: DeviceMap,
    pub profiles: Vec<Profile>,
}

/// New config handed to [`Instance::update`].
pub struct UpdateArgs {
    pub local_config: ConfigMap,
    pub local_devices: DeviceMap,
    pub profiles: Vec<Profile>,
    pub user_requested: bool,
}

struct ConfigState {
    local_config: ConfigMap,
    expanded_config: ConfigMap,
    local_devices: DeviceMap,
    expanded_devices: DeviceMap,
    profiles: Vec<Profile>,
}

impl ConfigState {
    fn expand(
        local_config: ConfigMap,
        local_devices: DeviceMap,
        profiles: Vec<Profile>,
    ) -> Self {
        let expanded_config = config::expand_config(&profiles, &local_config);
        let expanded_devices =
            config::expand_devices(&profiles, &local_devices);
        Self {
            local_config,
            expanded_config,
            local_devices,
            expanded_devices,
            profiles,
        }
    }
}

pub struct Instance {
    project: String,
    name: String,
    id: i64,
    arch: Architecture,
    ephemeral: bool,
    paths: InstancePaths,
    deps: Deps,
    state: StdMutex<ConfigState>,
    /// Set while an intra-cluster move wants volatile writes kept out
    /// of the database.
    volatile_suspended: AtomicBool,
    /// Guards against the real SHUTDOWN event and the synthetic
    /// disconnect event racing two onStop runs.
    stopping: AtomicBool,
    monitor: tokio::sync::Mutex<Option<Arc<Monitor>>>,
    current_op: StdMutex<Option<Arc<Operation>>>,
    /// Live console session listener, when attached.
    console_session: tokio::sync::Mutex<Option<tokio::net::UnixListener>>,
    /// Incoming live-migration state stream, set by the receiver just
    /// before the stateful start consumes it.
    migration_state_stream:
        tokio::sync::Mutex<Option<Box<dyn MigrationStream>>>,
    /// Incoming live-migration filesystem stream, bridged to the NBD
    /// server exporting the root disk during the state transfer.
    migration_fs_stream:
        tokio::sync::Mutex<Option<Box<dyn MigrationStream>>>,
    log: Logger,
}

impl Instance {
    pub fn new(
        args: InstanceArgs,
        paths: InstancePaths,
        deps: Deps,
        log: &Logger,
    ) -> Arc<Self> {
        let log = log.new(o!(
            "project" => args.project.clone(),
            "instance" => args.name.clone(),
        ));

        Arc::new(Self {
            project: args.project,
            name: args.name,
            id: args.id,
            arch: args.architecture,
            ephemeral: args.ephemeral,
            paths,
            deps,
            state: StdMutex::new(ConfigState::expand(
                args.local_config,
                args.local_devices,
                args.profiles,
            )),
            volatile_suspended: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            monitor: tokio::sync::Mutex::new(None),
            current_op: StdMutex::new(None),
            console_session: tokio::sync::Mutex::new(None),
            migration_state_stream: tokio::sync::Mutex::new(None),
            migration_fs_stream: tokio::sync::Mutex::new(None),
            log,
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    pub fn paths(&self) -> &InstancePaths {
        &self.paths
    }

    pub(crate) fn pool(&self) -> Arc<dyn StoragePool> {
        self.deps.pool.clone()
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.log
    }

    pub fn expanded_config(&self) -> ConfigMap {
        self.state.lock().unwrap().expanded_config.clone()
    }

    pub fn expanded_devices(&self) -> DeviceMap {
        self.state.lock().unwrap().expanded_devices.clone()
    }

    pub fn local_config(&self) -> ConfigMap {
        self.state.lock().unwrap().local_config.clone()
    }

    pub(crate) fn config_get(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().expanded_config.get(key).cloned()
    }

    pub(crate) fn is_windows(&self) -> bool {
        self.config_get("image.os")
            .map(|os| os.to_lowercase().contains("windows"))
            .unwrap_or(false)
    }

    pub(crate) fn is_stateful_migration_allowed(&self) -> bool {
        is_true(self.config_get("migration.stateful").as_deref())
    }

    fn should_auto_restart(&self) -> bool {
        is_true(self.config_get("boot.autorestart").as_deref())
    }

    // ------------------------------------------------------------------
    // Volatile keys
    // ------------------------------------------------------------------

    pub(crate) fn volatile_get(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().local_config.get(key).cloned()
    }

    /// Writes volatile keys to the in-memory config and, unless
    /// suspended, to the database.
    pub(crate) fn volatile_set(&self, values: ConfigMap) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            for (k, v) in &values {
                if v.is_empty() {
                    state.local_config.remove(k);
                    state.expanded_config.remove(k);
                } else {
                    state.local_config.insert(k.clone(), v.clone());
                    state.expanded_config.insert(k.clone(), v.clone());
                }
            }
        }

        if self.volatile_suspended.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.deps
            .volatile
            .set(&self.project, &self.name, &values)
            .map_err(|e| Error::Internal(e.to_string()))
    }

    /// Keeps subsequent volatile writes out of the database. Used by
    /// the migration source during an intra-cluster same-name move so
    /// the keys the receiver has already written are not clobbered by
    /// this side's stop path.
    pub(crate) fn suspend_volatile_persistence(&self) {
        self.volatile_suspended.store(true, Ordering::SeqCst);
    }

    /// Ensures the stable identity keys exist: `volatile.uuid` is
    /// minted exactly once per instance lifetime, the generation UUID
    /// refreshes when requested.
    pub(crate) fn ensure_volatile_identity(&self) -> Result<Uuid> {
        let existing = self.volatile_get("volatile.uuid");
        let instance_uuid = match existing {
            Some(raw) => Uuid::parse_str(&raw).map_err(|_| {
                Error::Config(format!("unparseable volatile.uuid {raw:?}"))
            })?,
            None => {
                let fresh = Uuid::new_v4();
                let mut values = ConfigMap::new();
                values.insert(
                    "volatile.uuid".to_string(),
                    fresh.to_string(),
                );
                values.insert(
                    "volatile.uuid.generation".to_string(),
                    fresh.to_string(),
                );
                self.volatile_set(values)?;
                fresh
            }
        };

        Ok(instance_uuid)
    }

    fn uuid_string(&self) -> String {
        self.volatile_get("volatile.uuid").unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Operation bookkeeping
    // ------------------------------------------------------------------

    fn set_current_op(&self, op: &Arc<Operation>) {
        *self.current_op.lock().unwrap() = Some(op.clone());
    }

    fn clear_current_op(&self) {
        *self.current_op.lock().unwrap() = None;
    }

    fn current_op(&self) -> Option<Arc<Operation>> {
        self.current_op.lock().unwrap().clone()
    }

    async fn acquire_op(
        &self,
        action: Action,
        inheritable: &[Action],
        reuse: bool,
    ) -> std::result::Result<Arc<Operation>, LockError> {
        let parent = self.current_op();
        let op = self
            .deps
            .locks
            .create_wait_get(
                &self.project,
                &self.name,
                parent.as_ref(),
                action,
                inheritable,
                reuse,
            )
            .await?;
        self.set_current_op(&op);
        Ok(op)
    }

    // ------------------------------------------------------------------
    // Monitor plumbing
    // ------------------------------------------------------------------

    /// Connects to (or returns the cached connection to) the VM's QMP
    /// socket, spawning the event pump on a fresh connection.
    pub(crate) fn qmp_connect(
        self: &Arc<Self>,
    ) -> BoxFuture<'_, Result<Arc<Monitor>>> {
        Box::pin(async move {
            let mut cached = self.monitor.lock().await;
            if let Some(monitor) = cached.as_ref() {
                if monitor.is_connected() {
                    return Ok(monitor.clone());
                }
            }

            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let cfg = MonitorConfig {
                connect_timeout: self.deps.connect_timeout,
                log_file: Some(self.paths.qmp_log()),
                ..Default::default()
            };
            let monitor = Monitor::connect(
                &self.paths.monitor_socket(),
                event_tx,
                cfg,
                &self.log,
            )
            .await?;

            // The pump holds only a weak reference plus the identity it
            // needs for logging; the instance is re-upgraded per event.
            let weak = Arc::downgrade(self);
            tokio::spawn(event_pump(weak, event_rx));

            *cached = Some(monitor.clone());
            Ok(monitor.clone())
        })
    }

    async fn drop_monitor(&self) {
        let mut cached = self.monitor.lock().await;
        if let Some(monitor) = cached.take() {
            monitor.disconnect().await;
        }
    }

    async fn handle_monitor_event(self: &Arc<Self>, event: Event) {
        match event.name.as_str() {
            qmp::EVENT_SHUTDOWN => {
                let reason = event.reason().unwrap_or("");
                let target = if reason == qmp::SHUTDOWN_REASON_GUEST_RESET {
                    "reboot"
                } else {
                    "stop"
                };

                if reason == qmp::SHUTDOWN_REASON_DISCONNECT {
                    warn!(self.log, "instance stopped";
                          "target" => target, "reason" => reason);
                } else {
                    debug!(self.log, "instance stopped";
                           "target" => target, "reason" => reason);
                }

                if let Err(e) = self.on_stop(target).await {
                    error!(self.log, "failed to cleanly stop instance";
                           "err" => %e);
                }
            }
            qmp::EVENT_AGENT_STARTED => {
                debug!(self.log, "instance agent started");
                if let Err(e) = self.advertise_vsock_address() {
                    warn!(self.log,
                          "failed to advertise vsock address to agent";
                          "err" => %e);
                }
            }
            qmp::EVENT_RTC_CHANGE => {
                let Some(offset) =
                    event.data.get("offset").and_then(|v| v.as_i64())
                else {
                    debug!(self.log, "RTC_CHANGE without offset");
                    return;
                };
                if let Err(e) = self.on_rtc_change(offset) {
                    error!(self.log, "failed to apply rtc change";
                           "offset" => offset, "err" => %e);
                }
            }
            _ => {}
        }
    }

    fn advertise_vsock_address(&self) -> Result<()> {
        let cid = self
            .volatile_get("volatile.vsock_id")
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| {
                Error::internal("volatile.vsock_id is not set".to_string())
            })?;

        self.deps
            .agent
            .advertise_vsock(&self.project, &self.name, cid, AGENT_VSOCK_PORT)
            .map_err(|e| Error::Internal(e.to_string()))
    }

    fn on_rtc_change(&self, offset: i64) -> Result<()> {
        let mut values = ConfigMap::new();
        values.insert(
            "volatile.vm.rtc_offset".to_string(),
            offset.to_string(),
        );
        self.volatile_set(values)
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    fn last_state_ready(&self) -> bool {
        is_true(self.volatile_get("volatile.last_state.ready").as_deref())
    }

    fn pid_live(&self) -> Option<i32> {
        supervisor::pid_live(&self.paths.pid_file(), &self.uuid_string())
    }

    /// Derives the externally visible status. Mid-operation, the lock
    /// action answers without touching QMP.
    pub async fn status(self: &Arc<Self>) -> Status {
        if let Some(op) = self.deps.locks.get(&self.project, &self.name) {
            match op.action() {
                Action::Start => return Status::Stopped,
                Action::Stop => {
                    return if self.last_state_ready() {
                        Status::Ready
                    } else {
                        Status::Running
                    }
                }
                _ => {}
            }
        }

        let monitor = match self.qmp_connect().await {
            Ok(m) => m,
            Err(_) => {
                // QMP unreachable: an alive PID means a wedged QEMU.
                return match self.pid_live() {
                    Some(_) => Status::Error,
                    None => Status::Stopped,
                };
            }
        };

        let status = match monitor.status().await {
            Ok(s) => s,
            Err(e) if e.is_disconnect() => {
                return match self.pid_live() {
                    Some(_) => Status::Error,
                    None => Status::Stopped,
                };
            }
            Err(_) => return Status::Error,
        };

        match status.status.as_str() {
            "running" if self.last_state_ready() => Status::Ready,
            "running" | "prelaunch" => Status::Running,
            "inmigrate" | "postmigrate" | "finish-migrate" | "save-vm"
            | "suspended" | "paused" => Status::Frozen,
            _ => Status::Error,
        }
    }

    pub async fn is_running(self: &Arc<Self>) -> bool {
        self.status().await.is_running()
    }

    // ------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------

    pub async fn start(self: &Arc<Self>, stateful: bool) -> Result<()> {
        debug!(self.log, "start started"; "stateful" => stateful);

        let op = match self
            .acquire_op(Action::Start, INHERIT_START, false)
            .await
        {
            Ok(op) => op,
            Err(LockError::AlreadySucceeded) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let result = self.start_locked(stateful).await;
        match &result {
            Ok(()) => op.done(None),
            Err(e) => op.done(Some(e.to_string())),
        }
        self.clear_current_op();

        debug!(self.log, "start finished"; "stateful" => stateful);
        result
    }

    async fn start_locked(self: &Arc<Self>, stateful: bool) -> Result<()> {
        // Refuse before doing anything when the VM is live, wedged, or
        // described inconsistently.
        let status = self.status().await;
        if status == Status::Error {
            return Err(Error::ErrorState {
                pid: self.pid_live().unwrap_or(-1),
            });
        }
        if status.is_running() {
            return Err(Error::AlreadyRunning);
        }

        let expanded_devices = self.expanded_devices();
        config::validate_devices(&expanded_devices)?;

        if !stateful {
            // A checkpoint from an earlier stateful stop stops matching
            // the disk the moment the guest runs without it; never
            // leave one behind to be restored later.
            let state_file = self.paths.state_file();
            if state_file.exists() {
                std::fs::remove_file(&state_file)?;
            }
        }

        if !PathBuf::from("/dev/kvm").exists() {
            return Err(Error::KvmMissing);
        }

        if stateful && !self.is_stateful_migration_allowed() {
            return Err(Error::Config(
                "stateful start requires migration.stateful".to_string(),
            ));
        }

        let cfg = self.expanded_config();
        let mut reverter = Reverter::new();

        // Mount the config volume.
        let mount_info = self
            .deps
            .pool
            .mount_instance(&self.project, &self.name)
            .await?;
        {
            let pool = self.deps.pool.clone();
            let project = self.project.clone();
            let name = self.name.clone();
            let log = self.log.clone();
            reverter.add(move || async move {
                match pool.unmount_instance(&project, &name).await {
                    Ok(()) | Err(StorageError::InUse) => {}
                    Err(e) => warn!(log, "revert unmount failed";
                                    "err" => %e),
                }
            });
        }

        let result = self
            .start_after_mount(stateful, &cfg, &expanded_devices, mount_info, &mut reverter)
            .await;

        match result {
            Ok(()) => {
                reverter.success();
                Ok(())
            }
            Err(e) => {
                error!(self.log, "start failed, reverting"; "err" => %e);
                reverter.fail().await;
                self.drop_monitor().await;
                Err(e)
            }
        }
    }

    async fn start_after_mount(
        self: &Arc<Self>,
        stateful: bool,
        cfg: &ConfigMap,
        expanded_devices: &DeviceMap,
        mount_info: crate::storage::MountInfo,
        reverter: &mut Reverter,
    ) -> Result<()> {
        std::fs::create_dir_all(self.paths.instance_dir())?;
        let instance_uuid = self.ensure_volatile_identity()?;

        // The machine type is pinned at first start; a guest installed
        // on one machine definition must never wake up on another.
        let machine_definition =
            match self.volatile_get("volatile.vm.definition") {
                Some(def) => def,
                None => {
                    let def = self.arch.machine_type().to_string();
                    let mut values = ConfigMap::new();
                    values.insert(
                        "volatile.vm.definition".to_string(),
                        def.clone(),
                    );
                    self.volatile_set(values)?;
                    def
                }
            };

        // Firmware / NVRAM.
        let mut nvram_path = None;
        let mut firmware_code = None;
        if self.arch.supports_uefi() {
            let usage = firmware::usage_from_config(cfg);
            let pair = firmware::select(self.arch, usage)?;
            let regenerate =
                is_true(self.volatile_get("volatile.apply_nvram").as_deref());
            let link = firmware::setup_nvram(
                self.paths.instance_dir(),
                &self.deps.firmware_dir,
                pair,
                regenerate,
            )?;
            nvram_path = Some(link);
            firmware_code = Some(self.deps.firmware_dir.join(pair.code));
        }

        // Vsock context ID: reuse the granted one when possible.
        let existing_cid = self
            .volatile_get("volatile.vsock_id")
            .and_then(|v| v.parse::<u32>().ok());
        let (cid, vsock_fd) = vsock::next_context_id(
            &instance_uuid,
            existing_cid,
            vsock::try_acquire,
        )?;
        self.volatile_set(
            [("volatile.vsock_id".to_string(), cid.to_string())].into(),
        )?;

        // Start devices in sorted order, collecting run configs. Every
        // started device registers its own stop on the reverter.
        let sorted = config::sorted_devices(expanded_devices);
        let mut mounts: Vec<(String, MountEntry, Option<u32>)> = Vec::new();
        let mut nics: Vec<(NetworkEntry, Option<u32>)> = Vec::new();
        let mut run_configs: Vec<RunConfig> = Vec::new();

        let priorities: Vec<(String, Option<u32>)> = sorted
            .iter()
            .map(|(name, dev)| {
                (
                    name.clone(),
                    dev.get("boot.priority")
                        .and_then(|p| p.parse().ok()),
                )
            })
            .collect();
        let boot_idx = boot_indexes(&priorities);

        for (dev_name, dev_config) in &sorted {
            let device = self
                .deps
                .devices
                .load(&self.project, &self.name, dev_name, dev_config)
                .map_err(|e| Error::Device {
                    device: dev_name.clone(),
                    source: e,
                })?;

            device.pre_start_check().await.map_err(|e| Error::Device {
                device: dev_name.clone(),
                source: e,
            })?;

            let run = device.start(false).await.map_err(|e| {
                Error::Device { device: dev_name.clone(), source: e }
            })?;

            {
                let device: Arc<dyn Device> = Arc::from(device);
                let log = self.log.clone();
                let name = dev_name.clone();
                reverter.add(move || async move {
                    match device.stop(false).await {
                        Ok(stop_run) => {
                            for hook in stop_run.post_hooks {
                                if let Err(e) = hook() {
                                    warn!(log, "device stop hook failed";
                                          "device" => &name, "err" => %e);
                                }
                            }
                        }
                        Err(e) => warn!(log, "device revert stop failed";
                                        "device" => &name, "err" => %e),
                    }
                });
            }

            let index = boot_idx.get(dev_name).copied();
            let mut leftovers = RunConfig::default();
            for entry in run.entries {
                match entry {
                    RunEntry::Mount(m) => {
                        mounts.push((dev_name.clone(), m, index))
                    }
                    RunEntry::Network(n) => {
                        self.volatile_set(
                            [
                                (
                                    format!("volatile.{dev_name}.hwaddr"),
                                    n.hwaddr.clone(),
                                ),
                                (
                                    format!(
                                        "volatile.{dev_name}.host_name"
                                    ),
                                    n.host_name.clone(),
                                ),
                            ]
                            .into(),
                        )?;
                        nics.push((n, index));
                    }
                    other => leftovers.entries.push(other),
                }
            }
            leftovers.post_hooks = run.post_hooks;
            run_configs.push(leftovers);
        }

        // Topology and sizing.
        let host_layout = cpu::HostLayout::detect()?;
        let topo = cpu::cpu_topology(
            cfg.get("limits.cpu").map(String::as_str).unwrap_or(""),
            &host_layout,
            &self.log,
        )?;

        // Balanced NUMA placement: without explicit pinning, confine
        // the VM to one host node, sticky across restarts.
        let mut node_affinity: Option<Vec<u32>> = None;
        if !topo.pinned() && cfg.get("limits.cpu.nodes").is_some() {
            let nodes = host_layout.numa_nodes();
            if !nodes.is_empty() {
                let chosen = self
                    .volatile_get("volatile.cpu.nodes")
                    .and_then(|v| v.parse().ok())
                    .filter(|n| nodes.contains(n))
                    .unwrap_or(nodes[self.id as usize % nodes.len()]);
                self.volatile_set(
                    [(
                        "volatile.cpu.nodes".to_string(),
                        chosen.to_string(),
                    )]
                    .into(),
                )?;
                node_affinity = Some(host_layout.node_cpus(chosen));
            }
        }
        let host_memory = memory::HostMemory::detect()?;
        let mem_bytes = memory::base_memory(cfg)?;
        let max_mem_bytes =
            memory::max_memory(cfg, host_memory, self.deps.clustered)?;

        // Assemble the machine config.
        let windows = self.is_windows();
        let mut builder = ConfigBuilder::new(
            self.arch,
            windows,
            self.deps.features.clone(),
            &self.log,
        );
        builder.add_machine(&machine_definition, &self.paths.monitor_socket());
        if let (Some(code), Some(nvram)) = (&firmware_code, &nvram_path) {
            builder.add_firmware(code, nvram);
        }
        builder.add_memory(mem_bytes, max_mem_bytes);
        builder.add_cpu(&topo, mem_bytes);
        builder.add_fixed_devices(Some((cid, vsock_fd)));
        self.generate_config_drive(cid, &nics)?;
        builder.add_config_drive(&self.paths.config_drive(), None);
        builder.add_smbios(cfg);

        if is_true(cfg.get("security.sev").map(String::as_str)) {
            let Some(sev) = self.deps.features.sev else {
                return Err(Error::Config(
                    "SEV is not supported on this host".to_string(),
                ));
            };

            let mut policy: u32 = 0x1;
            if is_true(
                cfg.get("security.sev.policy.es").map(String::as_str),
            ) {
                if !sev.es_supported {
                    return Err(Error::Config(
                        "SEV-ES is not supported on this host"
                            .to_string(),
                    ));
                }
                policy |= 0x4;
            }

            let dh_fd = self.sev_blob_fd(
                cfg,
                "security.sev.session.dh",
                "sev.dh",
            )?;
            let session_fd = self.sev_blob_fd(
                cfg,
                "security.sev.session.data",
                "sev.session",
            )?;
            builder.add_sev(sev, policy, dh_fd, session_fd);
        }

        // NICs claim their bus slots before anything else user-visible.
        for (nic, index) in nics {
            builder.add_nic(nic, index);
        }

        let mut needs_memlock = false;
        for run in &mut run_configs {
            for entry in std::mem::take(&mut run.entries) {
                match entry {
                    RunEntry::Pci(p) => {
                        needs_memlock = true;
                        builder.add_pci(&p.dev_name, &p.pci_slot_name);
                    }
                    RunEntry::Gpu(g) => {
                        needs_memlock = true;
                        builder.add_gpu(&g.dev_name, &g.pci_slot_name, g.vga);
                    }
                    RunEntry::Tpm(t) => builder.add_tpm(&t),
                    RunEntry::Usb(u) => {
                        // USB devices attach after QMP connect like
                        // any hotplug.
                        builder_usb_hook(&mut builder, u);
                    }
                    other => drop(other),
                }
            }
        }

        for (_, entry, index) in mounts {
            let share = entry.virtiofsd_fd.is_some()
                || matches!(
                    entry.fs_type.as_deref(),
                    Some("9p") | Some("virtiofs")
                );
            if share {
                let dev_name = entry.dev_name.clone();
                let path = entry.source.probe_path().clone();
                builder.add_share(&dev_name, &path, entry.virtiofsd_fd);
            } else {
                let root = entry.target_path == "/";
                let entry = if root {
                    MountEntry {
                        source: crate::device::DiskSource::Path(
                            mount_info.disk_path.clone(),
                        ),
                        ..entry
                    }
                } else {
                    entry
                };
                builder.add_drive(entry, index, root);
            }
        }

        let built = builder.finish(cfg);

        std::fs::create_dir_all(self.paths.run_dir())?;
        std::fs::create_dir_all(self.paths.log_dir())?;
        std::fs::write(
            self.paths.qemu_conf(),
            qconf::render_sections(&built.sections),
        )?;

        // Ownership fixups for the privilege drop.
        if let Some(user) = &self.deps.qemu_user {
            if let Some((uid, gid)) = supervisor::resolve_user(user) {
                if let Some(nvram) = &nvram_path {
                    let _ = supervisor::chown_path(nvram, uid, gid);
                }
                let _ = supervisor::chown_path(
                    &self.paths.config_drive(),
                    uid,
                    gid,
                );
            }
        }

        // Security profile.
        let qemu_path = PathBuf::from(self.arch.qemu_binary());
        self.deps
            .sandbox
            .load_profile(&self.project, &self.name, &qemu_path)
            .map_err(|e| Error::Internal(e.to_string()))?;
        {
            let sandbox = self.deps.sandbox.clone();
            let project = self.project.clone();
            let name = self.name.clone();
            let log = self.log.clone();
            reverter.add(move || async move {
                if let Err(e) = sandbox.unload_profile(&project, &name) {
                    warn!(log, "revert profile unload failed"; "err" => %e);
                }
            });
        }

        // Spawn, paused.
        let incoming = stateful;
        let mut args = qconf::qemu_args(
            &self.name,
            &instance_uuid.to_string(),
            &self.paths.qemu_conf(),
            &self.paths.pid_file(),
            &self.paths.qemu_log(),
            cfg,
            incoming,
        )?;
        if let Some(user) = &self.deps.qemu_user {
            args.extend(supervisor::privilege_args(
                self.deps.features.qemu_version,
                user,
            ));
        }
        args.extend(self.startup_rtc_args()?);

        supervisor::spawn_qemu(
            SpawnArgs {
                qemu_path,
                args,
                fds: built.fds,
                run_as: self.deps.qemu_user.clone(),
                raise_memlock: needs_memlock,
                early_log_path: self.paths.early_log(),
            },
            &self.log,
        )
        .await?;
        {
            let pid_file = self.paths.pid_file();
            let uuid = instance_uuid.to_string();
            let log = self.log.clone();
            reverter.add(move || async move {
                if let Some(pid) = supervisor::pid_live(&pid_file, &uuid) {
                    let _ = supervisor::kill_process(pid, &log).await;
                }
                let _ = std::fs::remove_file(&pid_file);
            });
        }

        // Control channel. Disconnects stay silent until startup has
        // fully succeeded.
        let monitor = self.qmp_connect().await?;
        monitor.set_on_disconnect_event(false);

        self.run_qmp_stage(&monitor, cfg, "early").await?;

        for hook in built.hooks {
            hook(monitor.clone()).await?;
        }

        for run in run_configs {
            for hook in run.post_hooks {
                hook().map_err(|e| Error::Internal(e.to_string()))?;
            }
        }

        self.run_qmp_stage(&monitor, cfg, "pre-start").await?;

        if let Some(pins) = &topo.vcpus {
            hotplug::cpu::apply_vcpu_affinity(
                &monitor,
                Some(pins),
                &self.log,
            )
            .await?;
        } else if let Some(cpus) = &node_affinity {
            hotplug::cpu::apply_node_affinity(&monitor, cpus, &self.log)
                .await?;
        }

        // Replay state or release the guest.
        if stateful {
            self.setup_migration_nbd(&monitor).await?;
            self.restore_state(&monitor).await?;
        }
        monitor.resume().await?;

        self.run_qmp_stage(&monitor, cfg, "post-start").await?;

        monitor.set_on_disconnect_event(true);
        self.volatile_set(
            [
                (
                    "volatile.last_state.power".to_string(),
                    POWER_RUNNING.to_string(),
                ),
                ("volatile.last_state.ready".to_string(), String::new()),
                ("volatile.apply_nvram".to_string(), String::new()),
            ]
            .into(),
        )?;

        info!(self.log, "instance started"; "stateful" => stateful);
        Ok(())
    }

    /// Decodes a base64 SEV blob from config into the instance path
    /// and returns an open descriptor for QEMU.
    fn sev_blob_fd(
        &self,
        cfg: &ConfigMap,
        key: &str,
        filename: &str,
    ) -> Result<Option<std::os::fd::OwnedFd>> {
        use base64::Engine;

        let Some(encoded) = cfg.get(key) else {
            return Ok(None);
        };

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| {
                Error::Config(format!("invalid base64 in {key}: {e}"))
            })?;

        let path = self.paths.instance_dir().join(filename);
        std::fs::write(&path, bytes)?;
        Ok(Some(std::os::fd::OwnedFd::from(std::fs::File::open(path)?)))
    }

    /// RTC arguments for this start. The guest's accumulated offset
    /// (from RTC_CHANGE events) folds into a persistent adjustment so
    /// the clock survives restarts. The RTC base is always pinned to a
    /// concrete timestamp shifted by that adjustment; Windows guests
    /// expect it in host local time, everyone else gets UTC.
    fn startup_rtc_args(&self) -> Result<Vec<String>> {
        let offset: i64 = self
            .volatile_get("volatile.vm.rtc_offset")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let adjustment: i64 = self
            .volatile_get("volatile.vm.rtc_adjustment")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let total = offset + adjustment;
        if offset != 0 {
            self.volatile_set(
                [
                    (
                        "volatile.vm.rtc_adjustment".to_string(),
                        total.to_string(),
                    ),
                    ("volatile.vm.rtc_offset".to_string(), String::new()),
                ]
                .into(),
            )?;
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let base = now + total;
        let formatted = if self.is_windows() {
            format_rtc_base_local(base)
        } else {
            format_rtc_base(base)
        };

        Ok(vec!["-rtc".to_string(), format!("base={formatted}")])
    }

    /// Runs operator-supplied QMP commands for a startup stage
    /// (`raw.qemu.qmp.<stage>`: a JSON array of command objects).
    async fn run_qmp_stage(
        &self,
        monitor: &Arc<Monitor>,
        cfg: &ConfigMap,
        stage: &str,
    ) -> Result<()> {
        let Some(raw) = cfg.get(&format!("raw.qemu.qmp.{stage}")) else {
            return Ok(());
        };

        let commands: Vec<serde_json::Value> = serde_json::from_str(raw)
            .map_err(|e| {
                Error::Config(format!(
                    "invalid raw.qemu.qmp.{stage} value: {e}"
                ))
            })?;

        for command in commands {
            let Some(execute) =
                command.get("execute").and_then(|v| v.as_str())
            else {
                return Err(Error::Config(format!(
                    "raw.qemu.qmp.{stage} entry without execute"
                )));
            };
            let arguments = command.get("arguments").cloned();
            monitor.execute_raw(execute, arguments).await?;
        }

        Ok(())
    }

    /// Writes the agent connection info and per-NIC configs into the
    /// config drive.
    fn generate_config_drive(
        &self,
        cid: u32,
        nics: &[(NetworkEntry, Option<u32>)],
    ) -> Result<()> {
        let drive = self.paths.config_drive();
        std::fs::create_dir_all(drive.join("nic-config"))?;

        let agent_conf = serde_json::json!({
            "cid": cid,
            "port": AGENT_VSOCK_PORT,
        });
        std::fs::write(
            drive.join("agent.conf"),
            serde_json::to_vec_pretty(&agent_conf)
                .map_err(|e| Error::Internal(e.to_string()))?,
        )?;

        if !is_true(self.config_get("agent.nic_config").as_deref()) {
            return Ok(());
        }

        for (nic, _) in nics {
            let entry = crate::device::NicConfigEntry {
                device: nic.dev_name.clone(),
                hwaddr: nic.hwaddr.clone(),
                mtu: nic.mtu,
                extra: BTreeMap::new(),
            };
            std::fs::write(
                drive.join("nic-config").join(format!(
                    "{}.json",
                    qconf::escape_name(&nic.dev_name)
                )),
                serde_json::to_vec_pretty(&entry)
                    .map_err(|e| Error::Internal(e.to_string()))?,
            )?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Stateful save / restore
    // ------------------------------------------------------------------

    /// Streams VM state into the instance's state file. The guest is
    /// paused by QEMU as the final dirty pages drain.
    pub(crate) async fn save_state(
        &self,
        monitor: &Arc<Monitor>,
    ) -> Result<()> {
        let path = self.paths.state_file();
        let _ = std::fs::remove_file(&path);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;

        monitor
            .migrate_to_fd(std::os::fd::AsRawFd::as_raw_fd(&file))
            .await?;
        monitor.migrate_wait("completed").await?;
        Ok(())
    }

    /// Replays state either from the incoming migration stream (live
    /// receive) or from the state file (stateful start). The VM must
    /// have been launched with `-incoming defer`.
    async fn restore_state(
        self: &Arc<Self>,
        monitor: &Arc<Monitor>,
    ) -> Result<()> {
        let stream = self.migration_state_stream.lock().await.take();
        match stream {
            Some(mut stream) => {
                // Bridge the stream into QEMU through a pipe.
                let (tx, rx) = tokio::net::unix::pipe::pipe()?;
                monitor
                    .migrate_incoming_fd(std::os::fd::AsRawFd::as_raw_fd(
                        &rx,
                    ))
                    .await?;
                drop(rx);

                let mut tx = tx;
                tokio::io::copy(&mut stream, &mut tx).await?;
                drop(tx);
            }
            None => {
                let path = self.paths.state_file();
                let file = std::fs::File::open(&path)?;
                monitor
                    .migrate_incoming_fd(
                        std::os::fd::AsRawFd::as_raw_fd(&file),
                    )
                    .await?;
                // The descriptor was handed over; QEMU reads to EOF.
                drop(file);
            }
        }

        monitor.migrate_wait("completed").await?;
        let _ = std::fs::remove_file(self.paths.state_file());
        Ok(())
    }

    /// Hands the receiver's live streams to the next stateful start.
    pub(crate) async fn set_migration_streams(
        &self,
        state: Box<dyn MigrationStream>,
        filesystem: Option<Box<dyn MigrationStream>>,
    ) {
        *self.migration_state_stream.lock().await = Some(state);
        *self.migration_fs_stream.lock().await = filesystem;
    }

    /// On a live receive, exports the root disk over NBD and bridges
    /// the sender's mirror through the filesystem stream. Must run
    /// before the state transfer starts.
    async fn setup_migration_nbd(
        &self,
        monitor: &Arc<Monitor>,
    ) -> Result<()> {
        let Some(mut filesystem) =
            self.migration_fs_stream.lock().await.take()
        else {
            return Ok(());
        };

        let (listener, addr) = migrate::bind_abstract()?;
        monitor
            .nbd_server_start(std::os::fd::AsRawFd::as_raw_fd(&listener))
            .await?;
        monitor
            .block_export_add(
                migrate::NBD_EXPORT_NAME,
                qconf::ROOT_DISK_NODE,
            )
            .await?;

        // QEMU accepts on its own duplicate of the listener; this side
        // dials the export and splices it onto the sender's stream.
        let conn = migrate::connect_abstract(&addr).await?;
        drop(listener);

        let log = self.log.clone();
        tokio::spawn(async move {
            let mut conn = conn;
            debug!(log, "NBD bridge on target started");
            let _ = tokio::io::copy_bidirectional(
                &mut conn,
                &mut *filesystem,
            )
            .await;
            debug!(log, "NBD bridge on target finished");
        });

        Ok(())
    }

    // ------------------------------------------------------------------
    // Stop / shutdown / restart
    // ------------------------------------------------------------------

    /// Stops the VM. `stateful` saves state for a later stateful
    /// start; `force` kills the process without asking QEMU.
    pub async fn stop(
        self: &Arc<Self>,
        stateful: bool,
        force: bool,
    ) -> Result<()> {
        debug!(self.log, "stop started";
               "stateful" => stateful, "force" => force);

        let status = self.status().await;
        if status == Status::Stopped {
            return Err(Error::NotRunning);
        }

        if status == Status::Error && !force {
            return Err(Error::ErrorState {
                pid: self.pid_live().unwrap_or(-1),
            });
        }

        let op = match self
            .acquire_op(Action::Stop, INHERIT_STOP, true)
            .await
        {
            Ok(op) => op,
            Err(LockError::AlreadySucceeded) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let monitor = match self.qmp_connect().await {
            Ok(m) => m,
            Err(_) => {
                // Wedged QEMU: kill and clean up directly.
                if let Some(pid) = self.pid_live() {
                    if let Err(e) =
                        supervisor::kill_process(pid, &self.log).await
                    {
                        op.done(Some(e.to_string()));
                        return Err(e);
                    }
                }
                let result = self.on_stop("stop").await;
                if let Err(e) = &result {
                    op.done(Some(e.to_string()));
                } else {
                    op.done(None);
                }
                return result;
            }
        };

        if stateful {
            if !self.is_stateful_migration_allowed() {
                let e = Error::Config(
                    "stateful stop requires migration.stateful".to_string(),
                );
                op.done(Some(e.to_string()));
                return Err(e);
            }
            if let Err(e) = self.save_state(&monitor).await {
                op.done(Some(e.to_string()));
                return Err(e);
            }
            self.volatile_set(
                [(
                    "volatile.last_state.power".to_string(),
                    POWER_STOPPED.to_string(),
                )]
                .into(),
            )?;
        } else if self.paths.state_file().exists() {
            // Stopping without a checkpoint invalidates any previous
            // one; the disk moves on from here.
            if let Err(e) = std::fs::remove_file(self.paths.state_file()) {
                let e = Error::from(e);
                op.done(Some(e.to_string()));
                return Err(e);
            }
        }

        if force {
            if let Some(pid) = self.pid_live() {
                let _ = supervisor::kill_process(pid, &self.log).await;
            }
            let result = self.on_stop("stop").await;
            match &result {
                Ok(()) => op.done(None),
                Err(e) => op.done(Some(e.to_string())),
            }
            return result;
        }

        // Ask QEMU to exit; the shutdown event drives onStop, which
        // completes the operation.
        match monitor.quit().await {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {}
            Err(e) => {
                op.done(Some(e.to_string()));
                return Err(e.into());
            }
        }

        match op.wait_done_timeout(STOP_ESCALATION_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(LockError::WaitTimeout) => {
                warn!(self.log,
                      "graceful stop timed out, escalating to kill");
                if let Some(pid) = self.pid_live() {
                    let _ = supervisor::kill_process(pid, &self.log).await;
                }
                self.on_stop("stop").await
            }
            Err(LockError::Failed(msg)) => Err(Error::Internal(msg)),
            Err(e) => Err(e.into()),
        }
    }

    /// Asks the guest to power down, escalating to a forced stop when
    /// it ignores the request past `timeout`.
    pub async fn shutdown(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<()> {
        debug!(self.log, "shutdown started"; "timeout" => ?timeout);

        // Both must run before taking the operation lock: the status
        // shortcut consults the lock table, and the console save takes
        // its own (inheriting) lock.
        let status = self.status().await;
        if status == Status::Error {
            return Err(Error::ErrorState {
                pid: self.pid_live().unwrap_or(-1),
            });
        }
        if !status.is_running() {
            return Err(Error::NotRunning);
        }

        let _ = self.console_log().await;

        let op = match self
            .acquire_op(Action::Stop, INHERIT_SHUTDOWN, true)
            .await
        {
            Ok(op) => op,
            Err(LockError::AlreadySucceeded) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if status == Status::Frozen {
            self.unfreeze().await?;
        }

        let monitor = match self.qmp_connect().await {
            Ok(m) => m,
            Err(e) => {
                op.done(Some(e.to_string()));
                return Err(e);
            }
        };

        // Guest-requested shutdown: feeds the auto-restart policy.
        op.set_instance_initiated(true);

        match monitor.powerdown().await {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {
                op.done(None);
                return Ok(());
            }
            Err(e) => {
                op.done(Some(e.to_string()));
                return Err(e.into());
            }
        }

        // Some guests (Windows) only honor the second request, sent
        // after the first has been delivered.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = monitor.powerdown().await;

        debug!(self.log, "shutdown request sent to instance");

        match op.wait_done_timeout(timeout).await {
            Ok(()) => {}
            Err(LockError::WaitTimeout) => {
                warn!(self.log, "graceful shutdown timed out, forcing stop";
                      "timeout" => ?timeout);
                if let Some(pid) = self.pid_live() {
                    let _ = supervisor::kill_process(pid, &self.log).await;
                }
                // The kill may race a guest that finally obeyed; onStop
                // sorts out durable state either way.
                return self.on_stop("stop").await;
            }
            Err(LockError::Failed(msg)) => {
                return Err(Error::Internal(msg))
            }
            Err(e) => return Err(e.into()),
        }

        let status = self.status().await;
        if status != Status::Stopped {
            return Err(Error::internal(format!(
                "failed shutting down instance, status is {status:?}"
            )));
        }

        Ok(())
    }

    pub async fn restart(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<()> {
        let op = self.acquire_op(Action::Restart, &[], false).await?;

        let result = async {
            if self.is_running().await {
                self.shutdown(timeout).await?;
            }
            self.start(false).await
        }
        .await;

        match &result {
            Ok(()) => op.done(None),
            Err(e) => op.done(Some(e.to_string())),
        }
        self.clear_current_op();
        result
    }

    /// Cleanup hook shared by every path out of the running state:
    /// graceful stop, forced stop, guest-initiated poweroff, reboot,
    /// and abnormal termination.
    pub(crate) async fn on_stop(self: &Arc<Self>, target: &str) -> Result<()> {
        if self
            .stopping
            .compare_exchange(
                false,
                true,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            debug!(self.log, "onStop already running"; "target" => target);
            return Ok(());
        }

        debug!(self.log, "onStop hook started"; "target" => target);
        let result = self.on_stop_inner(target).await;
        self.stopping.store(false, Ordering::SeqCst);
        debug!(self.log, "onStop hook finished"; "target" => target);
        result
    }

    async fn on_stop_inner(self: &Arc<Self>, target: &str) -> Result<()> {
        // Pick up the live operation (stop/restart/restore/migrate) or
        // create one for an instance-initiated state change. A reboot
        // gets a restart-tagged lock so status derivation does not
        // mistake the relaunch window for a running VM.
        let op = match self.current_op() {
            Some(op)
                if matches!(
                    op.action(),
                    Action::Stop
                        | Action::Restart
                        | Action::Restore
                        | Action::Migrate
                ) =>
            {
                op
            }
            _ => {
                let action = if target == "reboot" {
                    Action::Restart
                } else {
                    Action::Stop
                };
                let op = self
                    .acquire_op(action, INHERIT_STOP, true)
                    .await?;
                op.set_instance_initiated(true);
                op
            }
        };

        self.drop_monitor().await;

        // Wait for the process to flush and exit before touching its
        // resources; racing a restarting QEMU corrupts state.
        debug!(self.log, "waiting for VM process to finish");
        if supervisor::pid_wait(
            &self.paths.pid_file(),
            &self.uuid_string(),
            ONSTOP_PID_WAIT,
        )
        .await
        {
            debug!(self.log, "VM process finished");
        } else {
            error!(self.log, "VM process failed to stop";
                   "timeout" => ?ONSTOP_PID_WAIT);
        }

        // Record power state; cleanup continues even if the store is
        // unavailable.
        if let Err(e) = self.volatile_set(
            [
                (
                    "volatile.last_state.power".to_string(),
                    POWER_STOPPED.to_string(),
                ),
                ("volatile.last_state.ready".to_string(), String::new()),
            ]
            .into(),
        ) {
            error!(self.log, "failed recording last power state";
                   "err" => %e);
        }

        // Device cleanup precedes unmount.
        self.cleanup_devices().await;
        let _ = std::fs::remove_file(self.paths.pid_file());
        let _ = std::fs::remove_file(self.paths.monitor_socket());
        let _ = std::fs::remove_file(self.paths.spice_socket());

        match self
            .deps
            .pool
            .unmount_instance(&self.project, &self.name)
            .await
        {
            Ok(()) => {}
            Err(StorageError::InUse) => {
                debug!(self.log, "config volume still in use, leaving \
                                  mounted");
            }
            Err(e) => {
                let err = Error::from(e);
                op.done(Some(err.to_string()));
                return Err(err);
            }
        }

        if let Err(e) =
            self.deps.sandbox.unload_profile(&self.project, &self.name)
        {
            let err = Error::Internal(e.to_string());
            op.done(Some(err.to_string()));
            return Err(err);
        }

        // Instance-initiated shutdown may roll straight into a
        // restart when policy says so.
        let mut op = op;
        let mut auto_restart = false;
        if target != "reboot"
            && op.instance_initiated()
            && self.should_auto_restart()
        {
            auto_restart = true;
            op.done(None);
            match self
                .acquire_op(Action::Restart, &[], false)
                .await
            {
                Ok(restart_op) => op = restart_op,
                Err(e) => {
                    error!(self.log,
                           "failed to set up auto-restart operation";
                           "err" => %e);
                }
            }
        }

        if target == "reboot" || auto_restart {
            let result = self.start(false).await;
            if let Err(e) = result {
                op.done(Some(e.to_string()));
                return Err(e);
            }
        } else if self.ephemeral {
            // Ephemeral instances do not outlive their stop.
            let result = self.delete_internal(true).await;
            if let Err(e) = result {
                op.done(Some(e.to_string()));
                return Err(e);
            }
        }

        op.done(None);
        self.clear_current_op();
        Ok(())
    }

    async fn cleanup_devices(self: &Arc<Self>) {
        let sorted = config::sorted_devices(&self.expanded_devices());
        for (dev_name, dev_config) in sorted.iter().rev() {
            let device = match self.deps.devices.load(
                &self.project,
                &self.name,
                dev_name,
                dev_config,
            ) {
                Ok(d) => d,
                Err(e) => {
                    warn!(self.log, "failed to load device for cleanup";
                          "device" => dev_name.as_str(), "err" => %e);
                    continue;
                }
            };

            match device.stop(false).await {
                Ok(run) => {
                    // Stop post-hooks run regardless of VM state.
                    for hook in run.post_hooks {
                        if let Err(e) = hook() {
                            warn!(self.log, "device stop hook failed";
                                  "device" => dev_name.as_str(),
                                  "err" => %e);
                        }
                    }
                }
                Err(e) => {
                    warn!(self.log, "failed to stop device";
                          "device" => dev_name.as_str(), "err" => %e);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Freeze / unfreeze
    // ------------------------------------------------------------------

    pub async fn freeze(self: &Arc<Self>) -> Result<()> {
        let monitor = self.qmp_connect().await?;
        monitor.pause().await?;
        Ok(())
    }

    pub async fn unfreeze(self: &Arc<Self>) -> Result<()> {
        let monitor = self.qmp_connect().await?;
        monitor.resume().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshot / restore
    // ------------------------------------------------------------------

    /// Takes a snapshot; `stateful` additionally captures VM state,
    /// pausing the guest briefly while it drains.
    pub async fn snapshot(
        self: &Arc<Self>,
        snapshot_name: &str,
        stateful: bool,
    ) -> Result<()> {
        let op = self.acquire_op(Action::Snapshot, &[], false).await?;

        let result = async {
            let running = self.is_running().await;
            if stateful {
                if !self.is_stateful_migration_allowed() {
                    return Err(Error::Config(
                        "stateful snapshot requires migration.stateful"
                            .to_string(),
                    ));
                }
                if running {
                    let monitor = self.qmp_connect().await?;
                    self.save_state(&monitor).await?;
                }
            }

            self.deps
                .pool
                .create_snapshot(&self.project, &self.name, snapshot_name)
                .await?;

            if stateful && running {
                // State capture leaves the guest paused.
                let monitor = self.qmp_connect().await?;
                monitor.resume().await?;
            }

            Ok(())
        }
        .await;

        match &result {
            Ok(()) => op.done(None),
            Err(e) => op.done(Some(e.to_string())),
        }
        self.clear_current_op();
        result
    }

    /// Restores a snapshot, stopping a running instance first and
    /// starting it back up statefully when the snapshot carries state.
    pub async fn restore(
        self: &Arc<Self>,
        snapshot_name: &str,
        stateful: bool,
    ) -> Result<()> {
        let op = self.acquire_op(Action::Restore, &[], false).await?;

        let result: Result<()> = async {
            let was_running = self.is_running().await;
            if was_running {
                // Inherits the restore operation.
                self.stop(false, false).await?;
            }

            self.deps
                .pool
                .restore_snapshot(&self.project, &self.name, snapshot_name)
                .await?;

            if stateful || was_running {
                self.start(stateful).await?;
            }

            Ok(())
        }
        .await;

        match &result {
            Ok(()) => op.done(None),
            Err(e) => op.done(Some(e.to_string())),
        }
        self.clear_current_op();
        result
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Applies new config: validates immutability rules, diffs
    /// devices, and hot-applies what a running VM supports.
    pub async fn update(
        self: &Arc<Self>,
        args: UpdateArgs,
    ) -> Result<()> {
        let op = self
            .acquire_op(Action::Update, INHERIT_UPDATE, false)
            .await?;

        let result = self.update_locked(args).await;
        match &result {
            Ok(()) => op.done(None),
            Err(e) => op.done(Some(e.to_string())),
        }
        self.clear_current_op();
        result
    }

    async fn update_locked(self: &Arc<Self>, args: UpdateArgs) -> Result<()> {
        let old_expanded_config = self.expanded_config();
        let old_devices = self.expanded_devices();

        let new_state = ConfigState::expand(
            args.local_config,
            args.local_devices,
            args.profiles,
        );

        if args.user_requested {
            config::validate_initial_keys(
                &old_expanded_config,
                &new_state.expanded_config,
            )?;
        }
        config::validate_devices(&new_state.expanded_devices)?;

        let running = self.is_running().await;

        let diff = config::diff_devices(
            &old_devices,
            &new_state.expanded_devices,
            |name, dev| {
                self.deps
                    .devices
                    .load(&self.project, &self.name, name, dev)
                    .map(|d| d.update_fields())
                    .unwrap_or_default()
            },
        );

        if running {
            for name in &diff.removed {
                let dev_config = &old_devices[name];
                self.hot_remove_device(name, dev_config).await?;
            }

            for name in &diff.added {
                let dev_config = &new_state.expanded_devices[name];
                self.hot_add_device(name, dev_config).await?;
            }
        }

        for name in &diff.updated {
            let device = self
                .deps
                .devices
                .load(
                    &self.project,
                    &self.name,
                    name,
                    &new_state.expanded_devices[name],
                )
                .map_err(|e| Error::Device {
                    device: name.clone(),
                    source: e,
                })?;
            device.update(running).await.map_err(|e| Error::Device {
                device: name.clone(),
                source: e,
            })?;
        }

        // Config-driven hotplug.
        if running {
            let old_cpu = old_expanded_config.get("limits.cpu");
            let new_cpu = new_state.expanded_config.get("limits.cpu");
            if old_cpu != new_cpu {
                self.update_cpu_limit(
                    new_cpu.map(String::as_str).unwrap_or(""),
                )
                .await?;
            }

            let old_mem = old_expanded_config.get("limits.memory");
            let new_mem = new_state.expanded_config.get("limits.memory");
            if old_mem != new_mem {
                let target =
                    memory::base_memory(&new_state.expanded_config)?;
                let monitor = self.qmp_connect().await?;
                let nodes = self
                    .numa_node_count(&new_state.expanded_config)
                    .unwrap_or(1);
                hotplug::memory::set_memory(
                    &monitor, target, nodes, &self.log,
                )
                .await?;
            }
        }

        *self.state.lock().unwrap() = new_state;
        Ok(())
    }

    fn numa_node_count(&self, cfg: &ConfigMap) -> Option<usize> {
        let layout = cpu::HostLayout::detect().ok()?;
        let topo = cpu::cpu_topology(
            cfg.get("limits.cpu").map(String::as_str).unwrap_or(""),
            &layout,
            &self.log,
        )
        .ok()?;
        topo.nodes.map(|n| n.len())
    }

    async fn update_cpu_limit(self: &Arc<Self>, limit: &str) -> Result<()> {
        if !self.deps.features.cpu_hotplug {
            return Err(Error::Config(
                "CPU count changes on a running VM require the \
                 cpu_hotplug feature"
                    .to_string(),
            ));
        }

        let count: u32 = limit.trim().parse().map_err(|_| {
            Error::Config(
                "live CPU updates only support plain counts".to_string(),
            )
        })?;

        let monitor = self.qmp_connect().await?;
        hotplug::cpu::set_cpus(
            &monitor,
            count,
            self.arch == Architecture::S390x,
            &self.log,
        )
        .await?;

        // Thread set changed; re-pin.
        let layout = cpu::HostLayout::detect()?;
        let topo = cpu::cpu_topology(limit, &layout, &self.log)?;
        hotplug::cpu::apply_vcpu_affinity(
            &monitor,
            topo.vcpus.as_ref(),
            &self.log,
        )
        .await?;
        Ok(())
    }

    async fn hot_add_device(
        self: &Arc<Self>,
        name: &str,
        dev_config: &DeviceConfig,
    ) -> Result<()> {
        let device = self
            .deps
            .devices
            .load(&self.project, &self.name, name, dev_config)
            .map_err(|e| Error::Device {
                device: name.to_string(),
                source: e,
            })?;

        if !device.can_hot_plug() {
            return Err(Error::Config(format!(
                "device {name} cannot be added to a running instance"
            )));
        }

        device.pre_start_check().await.map_err(|e| Error::Device {
            device: name.to_string(),
            source: e,
        })?;
        let run = device.start(true).await.map_err(|e| Error::Device {
            device: name.to_string(),
            source: e,
        })?;

        let monitor = self.qmp_connect().await?;
        for entry in run.entries {
            match entry {
                RunEntry::Mount(m) => {
                    if m.virtiofsd_fd.is_some() {
                        let MountEntry {
                            dev_name, virtiofsd_fd, ..
                        } = m;
                        hotplug::disk::attach_share(
                            &monitor,
                            &dev_name,
                            virtiofsd_fd.unwrap(),
                        )
                        .await?;
                    } else {
                        hotplug::disk::attach(
                            &monitor,
                            m,
                            &self.deps.features,
                            &self.log,
                        )
                        .await?;
                    }
                }
                RunEntry::Network(n) => {
                    self.volatile_set(
                        [
                            (
                                format!("volatile.{name}.hwaddr"),
                                n.hwaddr.clone(),
                            ),
                            (
                                format!("volatile.{name}.host_name"),
                                n.host_name.clone(),
                            ),
                        ]
                        .into(),
                    )?;
                    hotplug::nic::attach(&monitor, n, &self.log).await?;
                }
                RunEntry::Usb(u) => {
                    hotplug::usb::attach(&monitor, &u).await?;
                }
                RunEntry::Pci(p) => {
                    hotplug::pci::attach(&monitor, &p).await?;
                }
                RunEntry::Gpu(_) | RunEntry::Tpm(_) => {
                    return Err(Error::Config(format!(
                        "device {name} cannot be added to a running \
                         instance"
                    )));
                }
            }
        }

        for hook in run.post_hooks {
            hook().map_err(|e| Error::Internal(e.to_string()))?;
        }

        Ok(())
    }

    async fn hot_remove_device(
        self: &Arc<Self>,
        name: &str,
        dev_config: &DeviceConfig,
    ) -> Result<()> {
        let device = self
            .deps
            .devices
            .load(&self.project, &self.name, name, dev_config)
            .map_err(|e| Error::Device {
                device: name.to_string(),
                source: e,
            })?;

        if !device.can_hot_plug() {
            return Err(Error::Config(format!(
                "device {name} cannot be removed from a running instance"
            )));
        }

        let monitor = self.qmp_connect().await?;
        match dev_config.dev_type() {
            "disk" => {
                if matches!(
                    dev_config.get("path"),
                    Some(p) if p != "/" && dev_config.get("source").is_some()
                        && dev_config.get("pool").is_none()
                ) {
                    hotplug::disk::detach_share(&monitor, name).await?;
                } else {
                    hotplug::disk::detach(&monitor, name).await?;
                }
            }
            "nic" => hotplug::nic::detach(&monitor, name).await?,
            "usb" => {
                let entry = crate::device::UsbEntry {
                    dev_name: name.to_string(),
                    host_bus: dev_config
                        .get("busnum")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                    host_addr: dev_config
                        .get("devnum")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                };
                hotplug::usb::detach(&monitor, &entry).await?;
            }
            "pci" | "gpu" => {
                let entry = crate::device::PciEntry {
                    dev_name: name.to_string(),
                    pci_slot_name: dev_config
                        .get("address")
                        .unwrap_or("")
                        .to_string(),
                };
                hotplug::pci::detach(&monitor, &entry).await?;
            }
            other => {
                return Err(Error::Config(format!(
                    "device type {other} does not support hot removal"
                )))
            }
        }

        // Host-side teardown after the guest side is gone.
        let run = device.stop(true).await.map_err(|e| Error::Device {
            device: name.to_string(),
            source: e,
        })?;
        for hook in run.post_hooks {
            if let Err(e) = hook() {
                warn!(self.log, "device stop hook failed";
                      "device" => name, "err" => %e);
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Rename / delete
    // ------------------------------------------------------------------

    /// Renames a stopped instance's storage volume. The caller reloads
    /// the instance under its new identity.
    pub async fn rename(self: &Arc<Self>, new_name: &str) -> Result<()> {
        if self.is_running().await {
            return Err(Error::AlreadyRunning);
        }

        self.deps
            .pool
            .rename_instance(&self.project, &self.name, new_name)
            .await?;
        Ok(())
    }

    pub async fn delete(self: &Arc<Self>, force: bool) -> Result<()> {
        let op = self.acquire_op(Action::Delete, &[], false).await?;
        let result = self.delete_locked(force).await;
        match &result {
            Ok(()) => op.done(None),
            Err(e) => op.done(Some(e.to_string())),
        }
        self.clear_current_op();
        result
    }

    async fn delete_locked(self: &Arc<Self>, force: bool) -> Result<()> {
        if self.is_running().await {
            if !force {
                return Err(Error::AlreadyRunning);
            }
            self.stop(false, true).await?;
        }

        self.delete_internal(force).await
    }

    async fn delete_internal(self: &Arc<Self>, _force: bool) -> Result<()> {
        self.deps
            .pool
            .delete_instance(&self.project, &self.name)
            .await?;
        let _ = std::fs::remove_dir_all(self.paths.run_dir());
        info!(self.log, "instance deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Console
    // ------------------------------------------------------------------

    /// Drains the console ring buffer into the persistent log and
    /// returns the accumulated contents.
    pub async fn console_log(self: &Arc<Self>) -> Result<String> {
        let op = match self
            .acquire_op(Action::ConsoleRetrieve, INHERIT_CONSOLE, true)
            .await
        {
            Ok(op) => op,
            Err(LockError::AlreadySucceeded) => {
                return Ok(String::new())
            }
            Err(e) => return Err(e.into()),
        };

        let result = async {
            let monitor = self.qmp_connect().await?;
            console::console_log(&monitor, &self.paths.console_log()).await
        }
        .await;

        // Only complete the operation when console retrieval is the
        // primary action; an inherited restart/restore/migrate lock
        // belongs to its owner.
        if op.action() == Action::ConsoleRetrieve {
            op.done(None);
        }

        result
    }

    /// Swaps the console to a socket for an interactive session and
    /// returns nothing; the listener is held until
    /// [`console_detach`](Self::console_detach).
    pub async fn console_attach(self: &Arc<Self>) -> Result<()> {
        let monitor = self.qmp_connect().await?;
        let listener = console::swap_ringbuf_with_socket(
            &monitor,
            &self.paths.console_socket(),
            &self.paths.console_log(),
        )
        .await?;
        *self.console_session.lock().await = Some(listener);
        Ok(())
    }

    pub async fn console_detach(self: &Arc<Self>) -> Result<()> {
        let monitor = self.qmp_connect().await?;
        console::swap_socket_with_ringbuf(
            &monitor,
            &self.paths.console_socket(),
        )
        .await?;
        *self.console_session.lock().await = None;
        Ok(())
    }

    /// VGA screenshot into the given file path (PNG).
    pub async fn console_screenshot(
        self: &Arc<Self>,
        path: &std::path::Path,
    ) -> Result<()> {
        if !self.is_running().await {
            return Err(Error::NotRunning);
        }

        let monitor = self.qmp_connect().await?;
        monitor.screendump(&path.display().to_string()).await?;
        Ok(())
    }

    /// Dumps guest memory in the requested format into an open file.
    pub async fn dump_guest_memory(
        self: &Arc<Self>,
        file: &std::fs::File,
        format: &str,
    ) -> Result<()> {
        if !self.is_running().await {
            return Err(Error::NotRunning);
        }

        let monitor = self.qmp_connect().await?;
        monitor
            .dump_guest_memory(
                std::os::fd::AsRawFd::as_raw_fd(file),
                format,
            )
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Export
    // ------------------------------------------------------------------

    /// Streams the instance to a backup target: a metadata header
    /// describing name, architecture, config, and snapshots, followed
    /// by the volume contents in the generic transfer format.
    pub async fn export(
        self: &Arc<Self>,
        target: &mut dyn MigrationStream,
    ) -> Result<()> {
        if self.is_running().await {
            return Err(Error::AlreadyRunning);
        }

        let snapshots = self
            .deps
            .pool
            .volume_snapshots(&self.project, &self.name)
            .await?;

        let header = serde_json::json!({
            "name": self.name,
            "architecture": self.arch.name(),
            "config": self.local_config(),
            "devices": self.state.lock().unwrap().local_devices.clone(),
            "snapshots": snapshots,
        });
        let mut target = target;
        migrate::send_message(&mut target, &header).await?;

        let args = crate::storage::VolumeSourceArgs {
            migration_type: migrate::MigrationType::Rsync,
            snapshots: snapshots.iter().map(|s| s.name.clone()).collect(),
            allow_inconsistent: false,
            cluster_move: false,
        };
        self.deps
            .pool
            .migrate_instance(&self.project, &self.name, target, &args)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Migration
    // ------------------------------------------------------------------

    pub async fn migrate_send(
        self: &Arc<Self>,
        args: migrate::MigrateSendArgs,
    ) -> Result<()> {
        let op = self.acquire_op(Action::Migrate, &[], false).await?;
        let result = migrate::source::send(self, args).await;
        match &result {
            Ok(()) => op.done(None),
            Err(e) => op.done(Some(e.to_string())),
        }
        self.clear_current_op();
        result
    }

    pub async fn migrate_receive(
        self: &Arc<Self>,
        args: migrate::MigrateReceiveArgs,
    ) -> Result<()> {
        let op = self.acquire_op(Action::Migrate, &[], false).await?;
        let result = migrate::destination::receive(self, args).await;
        match &result {
            Ok(()) => op.done(None),
            Err(e) => op.done(Some(e.to_string())),
        }
        self.clear_current_op();
        result
    }
}

/// Forwards monitor events to the instance without keeping it alive.
async fn event_pump(
    instance: Weak<Instance>,
    mut events: mpsc::UnboundedReceiver<Event>,
) {
    while let Some(event) = events.recv().await {
        let Some(instance) = instance.upgrade() else {
            return;
        };
        instance.handle_monitor_event(event).await;
    }
}

/// Formats a UNIX timestamp in the `YYYY-MM-DDTHH:MM:SS` form QEMU's
/// `-rtc base=` option accepts (UTC, proleptic Gregorian).
fn format_rtc_base(unix_secs: i64) -> String {
    let days = unix_secs.div_euclid(86_400);
    let secs = unix_secs.rem_euclid(86_400);

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
        year,
        month,
        day,
        secs / 3_600,
        (secs / 60) % 60,
        secs % 60
    )
}

/// As [`format_rtc_base`] but in the host's local time zone, which is
/// what Windows guests keep in their RTC.
fn format_rtc_base_local(unix_secs: i64) -> String {
    let time: libc::time_t = unix_secs as libc::time_t;
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    // SAFETY: localtime_r fills the supplied buffer and returns null
    // on failure without retaining either pointer.
    let res = unsafe { libc::localtime_r(&time, &mut tm) };
    if res.is_null() {
        return format_rtc_base(unix_secs);
    }

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
        i64::from(tm.tm_year) + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}

fn builder_usb_hook(builder: &mut ConfigBuilder, entry: crate::device::UsbEntry) {
    builder.push_hook(Box::new(move |monitor| {
        Box::pin(async move {
            hotplug::usb::attach(&monitor, &entry).await
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDeviceProvider;
    use crate::storage::MockStoragePool;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    struct FakeVolatile {
        written: StdMutex<ConfigMap>,
    }

    impl VolatileStore for FakeVolatile {
        fn set(
            &self,
            _project: &str,
            _name: &str,
            values: &ConfigMap,
        ) -> anyhow::Result<()> {
            let mut written = self.written.lock().unwrap();
            for (k, v) in values {
                written.insert(k.clone(), v.clone());
            }
            Ok(())
        }
    }

    struct FakeAgent;

    impl AgentChannel for FakeAgent {
        fn advertise_vsock(
            &self,
            _project: &str,
            _name: &str,
            _cid: u32,
            _port: u32,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_instance_with(
        local_config: &[(&str, &str)],
        devices: &[(&str, &[(&str, &str)])],
        pool: MockStoragePool,
        provider: MockDeviceProvider,
    ) -> (Arc<Instance>, Arc<FakeVolatile>) {
        let volatile = Arc::new(FakeVolatile {
            written: StdMutex::new(ConfigMap::new()),
        });

        let mut local_devices = DeviceMap::new();
        for (name, entries) in devices {
            let mut dev = DeviceConfig::new();
            for (k, v) in *entries {
                dev.0.insert(k.to_string(), v.to_string());
            }
            local_devices.insert(name.to_string(), dev);
        }

        let dir = std::env::temp_dir().join(format!(
            "vespiary-inst-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        let paths = InstancePaths::new(
            dir.join("instance"),
            dir.join("run"),
            dir.join("log"),
        );

        let deps = Deps {
            pool: Arc::new(pool),
            devices: Arc::new(provider),
            volatile: volatile.clone(),
            sandbox: Arc::new(crate::supervisor::NullSandbox),
            agent: Arc::new(FakeAgent),
            locks: Locks::new(&test_logger()),
            features: QemuFeatures::default(),
            firmware_dir: PathBuf::from("/usr/share/OVMF"),
            qemu_user: None,
            clustered: false,
            connect_timeout: Duration::from_millis(100),
        };

        let instance = Instance::new(
            InstanceArgs {
                project: "default".to_string(),
                name: "vm1".to_string(),
                id: 7,
                architecture: Architecture::X86_64,
                ephemeral: false,
                local_config: local_config
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                local_devices,
                profiles: Vec::new(),
            },
            paths,
            deps,
            &test_logger(),
        );

        (instance, volatile)
    }

    fn test_instance(
        local_config: &[(&str, &str)],
        devices: &[(&str, &[(&str, &str)])],
    ) -> (Arc<Instance>, Arc<FakeVolatile>) {
        test_instance_with(
            local_config,
            devices,
            MockStoragePool::new(),
            MockDeviceProvider::new(),
        )
    }

    /// A scripted QMP endpoint behind the instance's monitor socket.
    async fn fake_qmp_server(listener: tokio::net::UnixListener) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(
            b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n",
        )
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
                let req: serde_json::Value =
                    serde_json::from_slice(&line).unwrap();
                let id = req["id"].clone();
                let reply = match req["execute"].as_str().unwrap() {
                    "query-status" => serde_json::json!({
                        "return": { "status": "running", "running": true },
                        "id": id,
                    }),
                    "ringbuf-read" => {
                        serde_json::json!({ "return": "", "id": id })
                    }
                    // The simulated guest ignores powerdown entirely.
                    _ => serde_json::json!({ "return": {}, "id": id }),
                };
                let mut out = serde_json::to_vec(&reply).unwrap();
                out.push(b'\n');
                if sock.write_all(&out).await.is_err() {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn shutdown_escalates_when_the_guest_ignores_powerdown() {
        let mut pool = MockStoragePool::new();
        pool.expect_unmount_instance()
            .times(1)
            .returning(|_, _| Ok(()));

        let mut provider = MockDeviceProvider::new();
        provider.expect_load().returning(|_, _, _, _| {
            let mut device = crate::device::MockDevice::new();
            device
                .expect_stop()
                .returning(|_| Ok(crate::device::RunConfig::default()));
            Ok(Box::new(device))
        });

        let (instance, volatile) = test_instance_with(
            &[],
            &[("root", &[("type", "disk"), ("path", "/")])],
            pool,
            provider,
        );

        std::fs::create_dir_all(instance.paths.run_dir()).unwrap();
        std::fs::create_dir_all(instance.paths.log_dir()).unwrap();
        let listener = tokio::net::UnixListener::bind(
            instance.paths.monitor_socket(),
        )
        .unwrap();
        tokio::spawn(fake_qmp_server(listener));

        // The simulated guest never acts on powerdown; after the
        // timeout the escalation kills (nothing to kill here) and runs
        // the onStop cleanup inline.
        instance.shutdown(Duration::from_millis(300)).await.unwrap();

        let written = volatile.written.lock().unwrap();
        assert_eq!(written["volatile.last_state.power"], "STOPPED");
        assert_eq!(written["volatile.last_state.ready"], "");
        drop(written);

        // The operation lock is released again.
        assert!(instance.deps.locks.get("default", "vm1").is_none());
    }

    #[tokio::test]
    async fn uuid_is_minted_once_and_stable() {
        let (instance, volatile) = test_instance(&[], &[]);

        let first = instance.ensure_volatile_identity().unwrap();
        let second = instance.ensure_volatile_identity().unwrap();
        assert_eq!(first, second);

        let written = volatile.written.lock().unwrap();
        assert_eq!(written["volatile.uuid"], first.to_string());
        assert_eq!(
            written["volatile.uuid.generation"],
            first.to_string()
        );
    }

    #[tokio::test]
    async fn start_without_root_disk_fails_before_side_effects() {
        let (instance, _) = test_instance(
            &[("limits.cpu", "2")],
            &[("eth0", &[("type", "nic")])],
        );

        // The mock pool panics on unexpected calls, so reaching the
        // mount step would fail the test differently.
        let err = instance.start(false).await.unwrap_err();
        assert!(matches!(err, Error::MissingRootDisk));

        // And the lock must be released again.
        assert!(instance
            .deps
            .locks
            .get("default", "vm1")
            .is_none());
    }

    #[tokio::test]
    async fn stateless_start_discards_a_stale_checkpoint() {
        // The mount step rejects so the start never gets further; the
        // checkpoint left by an earlier stateful stop must be gone
        // regardless of how far the start proceeds.
        let mut pool = MockStoragePool::new();
        pool.expect_mount_instance().returning(|_, _| {
            Err(crate::storage::StorageError::Driver(anyhow::anyhow!(
                "no pool in this test"
            )))
        });

        let (instance, _) = test_instance_with(
            &[],
            &[("root", &[("type", "disk"), ("path", "/")])],
            pool,
            MockDeviceProvider::new(),
        );

        std::fs::create_dir_all(instance.paths.instance_dir()).unwrap();
        std::fs::write(instance.paths.state_file(), b"stale checkpoint")
            .unwrap();

        let _ = instance.start(false).await.unwrap_err();
        assert!(!instance.paths.state_file().exists());
    }

    #[tokio::test]
    async fn status_shortcut_hides_qmp_during_start_and_stop() {
        let (instance, _) = test_instance(&[], &[]);

        let op = instance
            .deps
            .locks
            .try_create("default", "vm1", Action::Start, false)
            .unwrap();
        assert_eq!(instance.status().await, Status::Stopped);
        op.done(None);

        let op = instance
            .deps
            .locks
            .try_create("default", "vm1", Action::Stop, false)
            .unwrap();
        assert_eq!(instance.status().await, Status::Running);
        op.done(None);

        // Ready state surfaces through the stop shortcut too.
        instance
            .volatile_set(
                [(
                    "volatile.last_state.ready".to_string(),
                    "true".to_string(),
                )]
                .into(),
            )
            .unwrap();
        let op = instance
            .deps
            .locks
            .try_create("default", "vm1", Action::Stop, false)
            .unwrap();
        assert_eq!(instance.status().await, Status::Ready);
        op.done(None);
    }

    #[tokio::test]
    async fn stopped_without_pid_or_socket() {
        let (instance, _) = test_instance(&[], &[]);
        assert_eq!(instance.status().await, Status::Stopped);
    }

    #[tokio::test]
    async fn volatile_suspension_keeps_writes_in_memory() {
        let (instance, volatile) = test_instance(&[], &[]);

        instance.suspend_volatile_persistence();
        instance
            .volatile_set(
                [("volatile.vsock_id".to_string(), "77".to_string())]
                    .into(),
            )
            .unwrap();

        assert_eq!(
            instance.volatile_get("volatile.vsock_id").as_deref(),
            Some("77")
        );
        assert!(volatile
            .written
            .lock()
            .unwrap()
            .get("volatile.vsock_id")
            .is_none());
    }

    #[tokio::test]
    async fn update_rejects_initial_key_changes() {
        let (instance, _) = test_instance(
            &[("initial.vm.flavor", "small")],
            &[("root", &[("type", "disk"), ("path", "/")])],
        );

        let err = instance
            .update(UpdateArgs {
                local_config: [(
                    "initial.vm.flavor".to_string(),
                    "large".to_string(),
                )]
                .into(),
                local_devices: instance
                    .state
                    .lock()
                    .unwrap()
                    .local_devices
                    .clone(),
                profiles: Vec::new(),
                user_requested: true,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn windows_detection_is_case_insensitive() {
        let (instance, _) =
            test_instance(&[("image.os", "Windows11")], &[]);
        assert!(instance.is_windows());

        let (instance, _) = test_instance(&[("image.os", "Ubuntu")], &[]);
        assert!(!instance.is_windows());
    }

    #[test]
    fn rtc_base_formatting() {
        assert_eq!(format_rtc_base(0), "1970-01-01T00:00:00");
        assert_eq!(format_rtc_base(951_782_400), "2000-02-29T00:00:00");
        assert_eq!(format_rtc_base(1_700_000_000), "2023-11-14T22:13:20");
        // Negative offsets land before the epoch.
        assert_eq!(format_rtc_base(-1), "1969-12-31T23:59:59");
    }

    #[test]
    fn local_rtc_formatting_is_a_concrete_timestamp() {
        // The wall-clock value depends on the host zone; the shape is
        // what matters.
        let formatted = format_rtc_base_local(1_700_000_000);
        assert_eq!(formatted.len(), 19);
        assert_eq!(&formatted[4..5], "-");
        assert_eq!(&formatted[10..11], "T");
    }

    #[tokio::test]
    async fn rtc_offset_folds_into_adjustment_at_start() {
        let (instance, volatile) = test_instance(&[], &[]);
        instance
            .volatile_set(
                [
                    (
                        "volatile.vm.rtc_offset".to_string(),
                        "30".to_string(),
                    ),
                    (
                        "volatile.vm.rtc_adjustment".to_string(),
                        "-10".to_string(),
                    ),
                ]
                .into(),
            )
            .unwrap();

        let args = instance.startup_rtc_args().unwrap();
        assert_eq!(args[0], "-rtc");
        assert!(args[1].starts_with("base="));

        let written = volatile.written.lock().unwrap();
        assert_eq!(written["volatile.vm.rtc_adjustment"], "20");
        assert_eq!(written["volatile.vm.rtc_offset"], "");
    }

    #[tokio::test]
    async fn rtc_base_is_pinned_even_without_adjustment() {
        let (instance, _) = test_instance(&[], &[]);
        let args = instance.startup_rtc_args().unwrap();
        assert_eq!(args[0], "-rtc");
        // Always a concrete snapshot timestamp, never the
        // continuous-tracking keyword and never omitted.
        assert!(args[1].starts_with("base="));
        assert_ne!(args[1], "base=localtime");
        assert_eq!(args[1].len(), "base=".len() + 19);
    }

    #[tokio::test]
    async fn windows_rtc_base_is_a_shifted_local_timestamp() {
        let (instance, _) =
            test_instance(&[("image.os", "Windows11")], &[]);
        instance
            .volatile_set(
                [(
                    "volatile.vm.rtc_adjustment".to_string(),
                    "3600".to_string(),
                )]
                .into(),
            )
            .unwrap();

        let args = instance.startup_rtc_args().unwrap();
        assert_eq!(args[0], "-rtc");
        assert!(args[1].starts_with("base="));
        assert_ne!(args[1], "base=localtime");
        assert_eq!(args[1].len(), "base=".len() + 19);
    }

    #[tokio::test]
    async fn rtc_change_is_recorded() {
        let (instance, volatile) = test_instance(&[], &[]);
        instance.on_rtc_change(-42).unwrap();
        assert_eq!(
            volatile.written.lock().unwrap()["volatile.vm.rtc_offset"],
            "-42"
        );
    }
}
