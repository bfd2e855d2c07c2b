// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-instance operation locks.
//!
//! Every mutating instance action (start, stop, restart, update,
//! migrate, restore, delete, snapshot, console retrieval) runs under
//! the single lock for its (project, name). An incoming action finding
//! the lock held may *inherit* the live operation when its action is in
//! the caller's inheritance set (e.g. the stop issued internally by a
//! restart attaches to the restart operation instead of failing), or
//! *reuse* it when both sides agree the action is reusable (concurrent
//! shutdown requests piggyback on one another). Anything else waits for
//! the holder to finish and then acquires fresh.
//!
//! Waiters observe the outcome of the operation they waited on: a
//! non-reusable operation of the same action that completed
//! successfully while being waited on yields the
//! [`LockError::AlreadySucceeded`] sentinel so the caller can treat its
//! own request as satisfied.
//!
//! The lock registry is an explicitly-owned object handed to each
//! instance rather than process-global state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use slog::{debug, o, Logger};
use thiserror::Error;
use tokio::sync::watch;

/// The actions an operation lock can be tagged with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Restart,
    Restore,
    Update,
    Delete,
    Snapshot,
    Migrate,
    ConsoleRetrieve,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Restart => "restart",
            Action::Restore => "restore",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Snapshot => "snapshot",
            Action::Migrate => "migrate",
            Action::ConsoleRetrieve => "console-retrieve",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("instance is busy running a {0} operation")]
    Busy(Action),

    #[error("a matching operation has already completed successfully")]
    AlreadySucceeded,

    #[error("operation failed: {0}")]
    Failed(String),

    #[error("timed out waiting for the current operation to complete")]
    WaitTimeout,
}

type Key = (String, String);
type Registry = Mutex<HashMap<Key, Arc<Operation>>>;

/// The lock registry, one per driver.
pub struct Locks {
    inner: Arc<Registry>,
    log: Logger,
}

/// A live (or completed) operation on one instance.
#[derive(Debug)]
pub struct Operation {
    key: Key,
    action: Action,
    reusable: bool,
    created: Instant,
    instance_initiated: AtomicBool,
    /// Completion outcome; `None` while the operation is live.
    result: Mutex<Option<Result<(), String>>>,
    done_tx: watch::Sender<bool>,
    registry: Weak<Registry>,
}

impl Locks {
    pub fn new(log: &Logger) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            log: log.new(o!("component" => "oplock")),
        })
    }

    /// Returns the live operation for an instance, if any. Used by
    /// status derivation to avoid hitting QMP mid-operation.
    pub fn get(&self, project: &str, name: &str) -> Option<Arc<Operation>> {
        self.inner
            .lock()
            .unwrap()
            .get(&(project.to_string(), name.to_string()))
            .cloned()
    }

    /// Acquires the instance lock for `action`.
    ///
    /// If an operation is already live: the caller's own parent
    /// operation or one whose action is listed in `inheritable` is
    /// returned as-is; a reusable operation of the same action is
    /// returned when `reuse` is set; otherwise the caller suspends
    /// until the holder completes, then acquisition is retried. See the
    /// module comment for the `AlreadySucceeded` sentinel.
    pub async fn create_wait_get(
        &self,
        project: &str,
        name: &str,
        parent: Option<&Arc<Operation>>,
        action: Action,
        inheritable: &[Action],
        reuse: bool,
    ) -> Result<Arc<Operation>, LockError> {
        loop {
            let existing = {
                let mut map = self.inner.lock().unwrap();
                let key = (project.to_string(), name.to_string());
                match map.get(&key) {
                    Some(op) => Some(op.clone()),
                    None => {
                        let op = self.new_operation(key, action, reuse);
                        map.insert(op.key.clone(), op.clone());
                        return Ok(op);
                    }
                }
            };

            let existing = existing.unwrap();

            if let Some(parent) = parent {
                if Arc::ptr_eq(parent, &existing) {
                    return Ok(existing);
                }
            }

            if inheritable.contains(&existing.action) {
                debug!(self.log, "inheriting operation";
                       "instance" => name,
                       "holder" => %existing.action,
                       "action" => %action);
                return Ok(existing);
            }

            if reuse && existing.reusable && existing.action == action {
                debug!(self.log, "reusing operation";
                       "instance" => name, "action" => %action);
                return Ok(existing);
            }

            let outcome = existing.wait_done().await;
            if outcome.is_ok()
                && existing.action == action
                && !existing.reusable
            {
                return Err(LockError::AlreadySucceeded);
            }
            // The holder is gone either way; retry acquisition.
        }
    }

    /// Acquires the lock only if no operation is live.
    pub fn try_create(
        &self,
        project: &str,
        name: &str,
        action: Action,
        reusable: bool,
    ) -> Result<Arc<Operation>, LockError> {
        let mut map = self.inner.lock().unwrap();
        let key = (project.to_string(), name.to_string());
        if let Some(existing) = map.get(&key) {
            return Err(LockError::Busy(existing.action));
        }

        let op = self.new_operation(key, action, reusable);
        map.insert(op.key.clone(), op.clone());
        Ok(op)
    }

    fn new_operation(
        &self,
        key: Key,
        action: Action,
        reusable: bool,
    ) -> Arc<Operation> {
        debug!(self.log, "operation created";
               "instance" => &key.1, "action" => %action);
        let (done_tx, _) = watch::channel(false);
        Arc::new(Operation {
            key,
            action,
            reusable,
            created: Instant::now(),
            instance_initiated: AtomicBool::new(false),
            result: Mutex::new(None),
            done_tx,
            registry: Arc::downgrade(&self.inner),
        })
    }
}

impl Operation {
    pub fn action(&self) -> Action {
        self.action
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Marks whether the state change was initiated from inside the
    /// guest (e.g. `poweroff`), which feeds the auto-restart policy.
    pub fn set_instance_initiated(&self, value: bool) {
        self.instance_initiated.store(value, Ordering::SeqCst);
    }

    pub fn instance_initiated(&self) -> bool {
        self.instance_initiated.load(Ordering::SeqCst)
    }

    /// Completes the operation, releasing the lock and waking every
    /// waiter with the outcome. Only the first completion takes effect.
    pub fn done(&self, err: Option<String>) {
        {
            let mut result = self.result.lock().unwrap();
            if result.is_some() {
                return;
            }

            *result = Some(match err {
                Some(e) => Err(e),
                None => Ok(()),
            });
        }

        if let Some(registry) = self.registry.upgrade() {
            let mut map = registry.lock().unwrap();
            // Only remove ourselves; a successor operation may already
            // occupy the slot.
            if let Some(current) = map.get(&self.key) {
                if std::ptr::eq(Arc::as_ptr(current), self) {
                    map.remove(&self.key);
                }
            }
        }

        let _ = self.done_tx.send(true);
    }

    /// True once the operation has completed.
    pub fn is_done(&self) -> bool {
        self.result.lock().unwrap().is_some()
    }

    /// Suspends until the operation completes, returning its outcome.
    pub async fn wait_done(&self) -> Result<(), LockError> {
        let mut rx = self.done_tx.subscribe();
        loop {
            if let Some(result) = self.result.lock().unwrap().clone() {
                return result.map_err(LockError::Failed);
            }

            if rx.changed().await.is_err() {
                // Sender dropped without completion; treat as released.
                return Ok(());
            }
        }
    }

    /// As [`wait_done`](Self::wait_done) with an upper bound.
    pub async fn wait_done_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<(), LockError> {
        tokio::time::timeout(timeout, self.wait_done())
            .await
            .map_err(|_| LockError::WaitTimeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_locks() -> Arc<Locks> {
        Locks::new(&Logger::root(slog::Discard, o!()))
    }

    #[tokio::test]
    async fn exclusive_actions_wait_for_the_holder() {
        let locks = test_locks();
        let first = locks
            .create_wait_get("default", "vm1", None, Action::Update, &[], false)
            .await
            .unwrap();

        // A second update must not complete while the first is live.
        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            locks2
                .create_wait_get(
                    "default",
                    "vm1",
                    None,
                    Action::Update,
                    &[],
                    false,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        first.done(None);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.action(), Action::Update);
        second.done(None);
    }

    #[tokio::test]
    async fn stop_inherits_restart() {
        let locks = test_locks();
        let restart = locks
            .create_wait_get(
                "default",
                "vm1",
                None,
                Action::Restart,
                &[],
                false,
            )
            .await
            .unwrap();

        let stop = locks
            .create_wait_get(
                "default",
                "vm1",
                None,
                Action::Stop,
                &[Action::Restart, Action::Restore, Action::Migrate],
                true,
            )
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&restart, &stop));
        assert_eq!(stop.action(), Action::Restart);
        restart.done(None);
    }

    #[tokio::test]
    async fn reusable_shutdown_piggybacks() {
        let locks = test_locks();
        let first = locks
            .create_wait_get("default", "vm1", None, Action::Stop, &[], true)
            .await
            .unwrap();

        let second = locks
            .create_wait_get("default", "vm1", None, Action::Stop, &[], true)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        first.done(None);
    }

    #[tokio::test]
    async fn waiting_on_a_succeeded_matching_op_returns_sentinel() {
        let locks = test_locks();
        // Non-reusable stop in flight.
        let first = locks
            .create_wait_get("default", "vm1", None, Action::Stop, &[], false)
            .await
            .unwrap();

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            locks2
                .create_wait_get(
                    "default",
                    "vm1",
                    None,
                    Action::Stop,
                    &[],
                    false,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        first.done(None);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, LockError::AlreadySucceeded));
    }

    #[tokio::test]
    async fn failed_holder_lets_waiter_acquire_fresh() {
        let locks = test_locks();
        let first = locks
            .create_wait_get("default", "vm1", None, Action::Stop, &[], false)
            .await
            .unwrap();

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            locks2
                .create_wait_get(
                    "default",
                    "vm1",
                    None,
                    Action::Stop,
                    &[],
                    false,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        first.done(Some("qemu exploded".to_string()));

        // The waiter's own stop gets a fresh lock, not the sentinel.
        let second = waiter.await.unwrap().unwrap();
        assert!(!second.is_done());
        second.done(None);
    }

    #[tokio::test]
    async fn waiters_observe_the_operation_error() {
        let locks = test_locks();
        let op = locks
            .create_wait_get("default", "vm1", None, Action::Start, &[], false)
            .await
            .unwrap();

        let op2 = op.clone();
        let waiter = tokio::spawn(async move { op2.wait_done().await });

        op.done(Some("boom".to_string()));
        match waiter.await.unwrap() {
            Err(LockError::Failed(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn done_releases_the_registry_slot() {
        let locks = test_locks();
        let op = locks
            .try_create("default", "vm1", Action::Delete, false)
            .unwrap();
        assert!(locks.get("default", "vm1").is_some());

        op.done(None);
        assert!(locks.get("default", "vm1").is_none());
    }

    #[tokio::test]
    async fn try_create_reports_busy() {
        let locks = test_locks();
        let _op = locks
            .try_create("default", "vm1", Action::Migrate, false)
            .unwrap();
        let err = locks
            .try_create("default", "vm1", Action::Start, false)
            .unwrap_err();
        assert!(matches!(err, LockError::Busy(Action::Migrate)));
    }
}
