// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A LIFO stack of compensating actions.
//!
//! Multi-step operations push one closure per acquired resource, in the
//! same scope that acquired it. On success the operation consumes the
//! stack with [`Reverter::success`]; if the operation unwinds first,
//! [`Reverter::fail`] runs the closures in reverse acquisition order.
//! A failed start is thereby externally indistinguishable from a start
//! that never happened.
//!
//! Hooks run on the async runtime; a hook that needs to take further
//! revertible actions creates its own nested `Reverter`.

use futures::future::BoxFuture;

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
pub struct Reverter {
    hooks: Vec<Hook>,
}

impl Reverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a compensating action for the most recent acquisition.
    pub fn add<F, Fut>(&mut self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.hooks.push(Box::new(move || Box::pin(hook())));
    }

    /// Commits the operation: all registered actions are dropped
    /// without running.
    pub fn success(&mut self) {
        self.hooks.clear();
    }

    /// Unwinds the operation, running every registered action in
    /// reverse order. Actions cannot themselves fail the unwind; they
    /// log internally and continue.
    pub async fn fail(&mut self) {
        while let Some(hook) = self.hooks.pop() {
            hook().await;
        }
    }

    /// Number of pending compensating actions.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn fail_runs_hooks_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut reverter = Reverter::new();

        for i in 0..3 {
            let order = order.clone();
            reverter.add(move || async move {
                order.lock().unwrap().push(i);
            });
        }

        reverter.fail().await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert!(reverter.is_empty());
    }

    #[tokio::test]
    async fn success_drops_hooks() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut reverter = Reverter::new();

        let c = count.clone();
        reverter.add(move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });

        reverter.success();
        reverter.fail().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hooks_added_after_success_still_run_on_fail() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut reverter = Reverter::new();
        reverter.success();

        let c = count.clone();
        reverter.add(move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });

        reverter.fail().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
