use std::{fmt::Display, pin::pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{future::join_all, StreamExt};
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, Resource, ResourceExt,
};
use log::{error, info, warn};
use serde::de::DeserializeOwned;

use crate::workqueue::WorkQueue;

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// What to do with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// wait for the next watch event
    AwaitChange,
    Requeue(Duration),
}

impl Action {
    pub fn await_change() -> Self {
        Action::AwaitChange
    }

    pub fn requeue(after: Duration) -> Self {
        Action::Requeue(after)
    }
}

#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    type Error: Display + Send;

    /// resource kind, for logs
    fn kind(&self) -> &'static str;

    async fn reconcile(&self, key: &str) -> Result<Action, Self::Error>;
}

/// Drains a [`WorkQueue`] with a fixed number of workers.
///
/// Failed keys are requeued with backoff until they fail more than
/// `max_retries` times in a row, then they're dropped until the next watch
/// event brings them back.
pub struct Runner<R> {
    reconciler: R,
    queue: WorkQueue<String>,
    workers: usize,
    max_retries: u32,
}

impl<R: Reconcile> Runner<R> {
    pub fn new(reconciler: R, queue: WorkQueue<String>, workers: usize, max_retries: u32) -> Self {
        Self {
            reconciler,
            queue,
            workers: workers.max(1),
            max_retries,
        }
    }

    /// Handles one key, returns `false` once the queue is shut down.
    pub async fn process_next(&self) -> bool {
        let key = match self.queue.get().await {
            Some(key) => key,
            None => return false,
        };
        let kind = self.reconciler.kind();

        match self.reconciler.reconcile(&key).await {
            Ok(action) => {
                info!("Reconciled {} '{key}'. Next action: {action:?}", kind.to_lowercase());

                self.queue.forget(&key);
                if let Action::Requeue(after) = action {
                    self.queue.add_after(key.clone(), after);
                }
            }
            Err(err) if self.queue.num_requeues(&key) < self.max_retries => {
                warn!("{kind} reconciliation failed for '{key}', retrying! Reason: {err}");

                self.queue.add_rate_limited(key.clone());
            }
            Err(err) => {
                error!(
                    "{kind} reconciliation failed for '{key}' {} times, dropping it! Reason: {err}",
                    self.max_retries.saturating_add(1)
                );

                self.queue.forget(&key);
            }
        }

        self.queue.done(&key);

        true
    }

    pub async fn run(self) {
        let runner = Arc::new(self);
        let workers = (0..runner.workers).map(|_| {
            let runner = runner.clone();
            tokio::spawn(async move { while runner.process_next().await {} })
        });

        for result in join_all(workers).await {
            if let Err(err) = result {
                error!("{} worker has crashed! {err:?}", runner.reconciler.kind());
            }
        }
    }
}

/// Enqueues the name of every object the watch reports as applied.
pub async fn feed_queue<K>(api: Api<K>, queue: WorkQueue<String>)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    let mut events = pin!(watcher::watcher(api, watcher::Config::default()).applied_objects());

    while let Some(event) = events.next().await {
        match event {
            Ok(object) => queue.add(object.name_any()),
            Err(err) => {
                warn!("Watcher has failed, retrying in {WATCH_RETRY_DELAY:?}! {err}");
                tokio::time::sleep(WATCH_RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };

    use super::*;

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        calls: Mutex<u32>,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Reconcile for Arc<Flaky> {
        type Error = String;

        fn kind(&self) -> &'static str {
            "Test"
        }

        async fn reconcile(&self, _key: &str) -> Result<Action, String> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;

            match *calls <= self.failures {
                true => Err("boom".to_owned()),
                false => Ok(Action::await_change()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_retried_with_backoff() {
        let reconciler = Arc::new(Flaky::new(2));
        let queue = WorkQueue::default();
        let runner = Runner::new(reconciler.clone(), queue.clone(), 1, 15);

        queue.add("a".to_owned());
        assert!(runner.process_next().await);
        assert_eq!(queue.num_requeues(&"a".to_owned()), 1);
        assert!(queue.is_empty());

        assert!(runner.process_next().await);
        assert!(runner.process_next().await);

        assert_eq!(reconciler.calls(), 3);
        assert_eq!(queue.num_requeues(&"a".to_owned()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_dropped_after_max_retries() {
        let reconciler = Arc::new(Flaky::new(u32::MAX));
        let queue = WorkQueue::default();
        let runner = Runner::new(reconciler.clone(), queue.clone(), 1, 2);

        queue.add("a".to_owned());
        for _ in 0..3 {
            assert!(runner.process_next().await);
        }

        assert_eq!(reconciler.calls(), 3);
        assert_eq!(queue.num_requeues(&"a".to_owned()), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconcile_can_requeue() {
        struct Periodic;

        #[async_trait]
        impl Reconcile for Periodic {
            type Error = String;

            fn kind(&self) -> &'static str {
                "Test"
            }

            async fn reconcile(&self, _key: &str) -> Result<Action, String> {
                Ok(Action::requeue(Duration::from_secs(300)))
            }
        }

        let queue = WorkQueue::default();
        let runner = Runner::new(Periodic, queue.clone(), 1, 15);

        queue.add("a".to_owned());
        assert!(runner.process_next().await);
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(queue.len(), 1);
    }

    #[derive(Default)]
    struct Resyncing {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Reconcile for Arc<Resyncing> {
        type Error = String;

        fn kind(&self) -> &'static str {
            "Test"
        }

        async fn reconcile(&self, _key: &str) -> Result<Action, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            Ok(Action::requeue(Duration::from_secs(300)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn watch_events_share_one_resync_timer() {
        let reconciler = Arc::new(Resyncing::default());
        let queue = WorkQueue::default();
        let worker = tokio::spawn(Runner::new(reconciler.clone(), queue.clone(), 1, 15).run());

        for _ in 0..5 {
            queue.add("a".to_owned());
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        let after_events = reconciler.calls.load(Ordering::SeqCst);
        assert_eq!(after_events, 5);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        let resyncs = reconciler.calls.load(Ordering::SeqCst) - after_events;
        assert!((11..=13).contains(&resyncs), "{resyncs} resyncs in an hour");

        queue.shutdown();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn run_stops_after_shutdown() {
        let reconciler = Arc::new(Flaky::new(0));
        let queue = WorkQueue::default();
        let runner = Runner::new(reconciler.clone(), queue.clone(), 3, 15);

        queue.add("a".to_owned());
        queue.add("b".to_owned());
        queue.shutdown();
        runner.run().await;

        assert_eq!(reconciler.calls(), 2);
    }
}
