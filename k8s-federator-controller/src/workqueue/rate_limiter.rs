use std::{collections::HashMap, hash::Hash, time::Duration};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-item exponential backoff: the n-th consecutive failure waits
/// `base * 2^(n-1)`, never more than `max`.
#[derive(Debug)]
pub struct ExponentialBackoff<T> {
    base: Duration,
    max: Duration,
    failures: HashMap<T, u32>,
}

impl<T: Eq + Hash + Clone> Default for ExponentialBackoff<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<T: Eq + Hash + Clone> ExponentialBackoff<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Records a failure of `item` and returns how long it should wait.
    pub fn when(&mut self, item: &T) -> Duration {
        let failures = self.failures.entry(item.clone()).or_insert(0);
        let exponent = *failures;
        *failures = failures.saturating_add(1);

        self.base
            .saturating_mul(2u32.pow(exponent.min(31)))
            .min(self.max)
    }

    pub fn forget(&mut self, item: &T) {
        self.failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_failure() {
        let mut backoff = ExponentialBackoff::default();
        let key = "cluster".to_owned();

        assert_eq!(backoff.when(&key), Duration::from_millis(5));
        assert_eq!(backoff.when(&key), Duration::from_millis(10));
        assert_eq!(backoff.when(&key), Duration::from_millis(20));
        assert_eq!(backoff.num_requeues(&key), 3);
    }

    #[test]
    fn delay_is_capped() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let key = 1u8;

        let delays: Vec<Duration> = (0..40).map(|_| backoff.when(&key)).collect();

        assert_eq!(delays[3], Duration::from_secs(8));
        assert!(delays[4..].iter().all(|delay| *delay == Duration::from_secs(10)));
    }

    #[test]
    fn forget_resets_the_counter() {
        let mut backoff = ExponentialBackoff::default();
        let key = "cluster";

        backoff.when(&key);
        backoff.when(&key);
        backoff.forget(&key);

        assert_eq!(backoff.num_requeues(&key), 0);
        assert_eq!(backoff.when(&key), DEFAULT_BASE_DELAY);
    }
}
