//! Deduplicating FIFO of object keys with delayed and rate limited requeues.
//!
//! A key is handed to at most one worker at a time: adding a key that is
//! being processed marks it dirty, and it's queued again once the worker
//! calls [`WorkQueue::done`]. A key waits on at most one delayed add, the
//! one due first.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};

use self::rate_limiter::ExponentialBackoff;

pub mod rate_limiter;

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

struct WorkQueueInner<T> {
    state: Mutex<QueueState<T>>,
    backoff: Mutex<ExponentialBackoff<T>>,
    /// deadline of the pending delayed add of each key
    waiting: Mutex<HashMap<T, Instant>>,
    notify: Notify,
}

#[derive(Clone)]
pub struct WorkQueue<T> {
    inner: Arc<WorkQueueInner<T>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Debug + Send + 'static,
{
    pub fn new(backoff: ExponentialBackoff<T>) -> Self {
        Self {
            inner: Arc::new(WorkQueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                backoff: Mutex::new(backoff),
                waiting: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn add(&self, item: T) {
        let mut state = lock(&self.inner.state);
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }

        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }

        state.queue.push_back(item);
        drop(state);

        self.inner.notify.notify_one();
    }

    /// Waits for the next key, `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();

            {
                let mut state = lock(&self.inner.state);
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }

                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Must follow every successful [`WorkQueue::get`] exactly once.
    pub fn done(&self, item: &T) {
        let mut state = lock(&self.inner.state);
        state.processing.remove(item);

        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);

            self.inner.notify.notify_one();
        }
    }

    /// Adds `item` once `delay` passes, unless it's already due sooner.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }

        let deadline = Instant::now() + delay;
        {
            let mut waiting = lock(&self.inner.waiting);
            if matches!(waiting.get(&item), Some(pending) if *pending <= deadline) {
                return;
            }
            waiting.insert(item.clone(), deadline);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            queue.add_if_due(item, deadline);
        });
    }

    /// Timers overtaken by an earlier deadline find someone else's entry.
    fn add_if_due(&self, item: T, deadline: Instant) {
        {
            let mut waiting = lock(&self.inner.waiting);
            if waiting.get(&item) != Some(&deadline) {
                return;
            }
            waiting.remove(&item);
        }

        self.add(item);
    }

    pub fn add_rate_limited(&self, item: T) {
        let delay = lock(&self.inner.backoff).when(&item);

        self.add_after(item, delay);
    }

    /// Clears the failure history of `item`.
    pub fn forget(&self, item: &T) {
        lock(&self.inner.backoff).forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        lock(&self.inner.backoff).num_requeues(item)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        lock(&self.inner.state).shutting_down = true;

        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<String> {
        WorkQueue::default()
    }

    #[tokio::test]
    async fn keys_are_deduplicated() {
        let queue = queue();

        queue.add("a".to_owned());
        queue.add("b".to_owned());
        queue.add("a".to_owned());

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn key_in_flight_is_redelivered_after_done() {
        let queue = queue();
        queue.add("a".to_owned());

        let item = queue.get().await.unwrap();
        queue.add("a".to_owned());
        queue.add("a".to_owned());
        assert!(queue.is_empty());

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn done_without_readd_leaves_queue_empty() {
        let queue = queue();
        queue.add("a".to_owned());

        let item = queue.get().await.unwrap();
        queue.done(&item);

        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn get_wakes_up_on_add() {
        let queue = queue();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.add("late".to_owned());

        assert_eq!(consumer.await.unwrap().as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_workers() {
        let queue = queue();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.shutdown();
        queue.add("ignored".to_owned());

        assert_eq!(consumer.await.unwrap(), None);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_waits_for_the_delay() {
        let queue = queue();

        queue.add_after("a".to_owned(), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_add_after_schedules_one_add() {
        let queue = queue();
        let key = "a".to_owned();

        for _ in 0..3 {
            queue.add_after(key.clone(), Duration::from_secs(10));
        }
        queue.add_after(key.clone(), Duration::from_secs(20));
        assert_eq!(lock(&queue.inner.waiting).len(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(queue.len(), 1);
        let item = queue.get().await.unwrap();
        queue.done(&item);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(queue.is_empty());
        assert!(lock(&queue.inner.waiting).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_deadline_replaces_pending_one() {
        let queue = queue();
        let key = "a".to_owned();

        queue.add_after(key.clone(), Duration::from_secs(300));
        queue.add_rate_limited(key.clone());

        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(queue.len(), 1);
        let item = queue.get().await.unwrap();
        queue.done(&item);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off() {
        let queue = queue();
        let key = "a".to_owned();

        queue.add_rate_limited(key.clone());
        queue.add_rate_limited(key.clone());
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.num_requeues(&key), 3);

        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(queue.len(), 1);

        queue.forget(&key);
        assert_eq!(queue.num_requeues(&key), 0);
    }
}
