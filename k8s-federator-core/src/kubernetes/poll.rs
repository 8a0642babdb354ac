use std::{
    fmt::{Debug, Display},
    future::Future,
    time::Duration,
};

use thiserror::Error;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSettings {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

#[derive(Debug, Error)]
pub enum PollError<E: Debug + Display> {
    #[error("Gave up waiting after {:?}!", .0)]
    Timeout(Duration),
    #[error("Polling aborted! Reason: {}", .0)]
    Aborted(E),
}

/// Runs `probe` every `interval` until it yields a value or `timeout` passes.
///
/// The probe returns `Ok(Some(_))` when done, `Ok(None)` to keep waiting and
/// `Err(_)` to abort right away. The first probe runs immediately.
pub async fn poll_until<T, E, F, Fut>(
    settings: PollSettings,
    mut probe: F,
) -> Result<T, PollError<E>>
where
    E: Debug + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + settings.timeout;

    loop {
        if let Some(value) = probe().await.map_err(PollError::Aborted)? {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout(settings.timeout));
        }

        sleep(settings.interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    const SETTINGS: PollSettings =
        PollSettings::new(Duration::from_secs(1), Duration::from_secs(5));

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_probe_is_satisfied() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<u32, PollError<&str>> = poll_until(SETTINGS, move || async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((call == 3).then_some(call))
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_probe_never_succeeds() {
        let started = Instant::now();

        let result: Result<(), PollError<&str>> = poll_until(SETTINGS, || async { Ok(None) }).await;

        assert!(matches!(result, Err(PollError::Timeout(timeout)) if timeout == SETTINGS.timeout));
        assert!(started.elapsed() >= SETTINGS.timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn aborts_on_probe_error() {
        let result: Result<(), PollError<&str>> =
            poll_until(SETTINGS, || async { Err("boom") }).await;

        assert!(matches!(result, Err(PollError::Aborted("boom"))));
    }

    #[test]
    fn errors_describe_the_cause() {
        assert_eq!(
            PollError::Aborted("boom").to_string(),
            "Polling aborted! Reason: boom"
        );
        assert_eq!(
            PollError::<&str>::Timeout(Duration::from_secs(5)).to_string(),
            "Gave up waiting after 5s!"
        );
    }
}
