//! Pacing of periodic jobs with retries and optional initial jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;

/// Runs a job repeatedly with configured pacing.
///
/// Each round attempts the job once and, on failure, up to `retries` more
/// times with `retry_delay` between attempts; rounds are `delay_loop`
/// apart. An optional initial delay, uniform in `[0, delay_loop)`, spreads
/// a fleet of schedulers over the loop period so probes do not fire in
/// lockstep.
#[derive(Debug)]
pub struct Scheduler {
    delay_loop: Duration,
    retries: u32,
    retry_delay: Duration,
    init_delay: Duration,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Scheduler {
            delay_loop: config.delay_loop(),
            retries: config.retries(),
            retry_delay: config.retry_delay(),
            init_delay: Duration::ZERO,
        }
    }

    /// Applies a random initial delay in `[0, delay_loop)`.
    pub fn with_initial_delay(mut self) -> Self {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        self.init_delay = self.delay_loop.mul_f64(jitter);
        self
    }

    /// The initial delay this scheduler starts with.
    pub fn initial_delay(&self) -> Duration {
        self.init_delay
    }

    /// Runs `job` until `cancel` fires. Every sleep is cancellation-aware,
    /// so cancellation interrupts the loop at the next suspension point.
    pub async fn run<F, Fut, E>(&self, cancel: &CancellationToken, mut job: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        if !sleep_or_cancel(self.init_delay, cancel).await {
            return;
        }

        loop {
            for attempt in 0..=self.retries {
                if cancel.is_cancelled() {
                    return;
                }
                if job().await.is_ok() {
                    break;
                }
                if attempt == self.retries {
                    break;
                }
                if !sleep_or_cancel(self.retry_delay, cancel).await {
                    return;
                }
            }

            if !sleep_or_cancel(self.delay_loop, cancel).await {
                return;
            }
        }
    }
}

/// Sleeps for `duration` unless cancelled first; returns whether the sleep
/// ran to completion.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn config(delay_loop: f64, retries: u32, retry_delay: f64) -> SchedulerConfig {
        SchedulerConfig {
            delay_loop: Some(delay_loop),
            retries: Some(retries),
            retry_delay: Some(retry_delay),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_job_each_loop() {
        let scheduler = Scheduler::new(&config(10.0, 0, 1.0));
        let cancel = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let cancel = cancel.clone();
            let runs = runs.clone();
            async move {
                scheduler
                    .run(&cancel, || {
                        let runs = runs.clone();
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            Ok::<(), ()>(())
                        }
                    })
                    .await;
            }
        });

        // Three loop periods: the job runs on entry and then once per loop.
        tokio::time::sleep(Duration::from_secs(25)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_on_failure() {
        let scheduler = Scheduler::new(&config(100.0, 2, 1.0));
        let cancel = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let cancel = cancel.clone();
            let runs = runs.clone();
            async move {
                scheduler
                    .run(&cancel, || {
                        let runs = runs.clone();
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            Err::<(), ()>(())
                        }
                    })
                    .await;
            }
        });

        // One round: the initial attempt plus two retries, then the loop
        // delay far in the future.
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_stops_retrying() {
        let scheduler = Scheduler::new(&config(100.0, 5, 1.0));
        let cancel = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let cancel = cancel.clone();
            let runs = runs.clone();
            async move {
                scheduler
                    .run(&cancel, || {
                        let runs = runs.clone();
                        async move {
                            // Fail once, then succeed.
                            if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                                Err::<(), ()>(())
                            } else {
                                Ok(())
                            }
                        }
                    })
                    .await;
            }
        });

        tokio::time::sleep(Duration::from_secs(50)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_unblocks_initial_delay() {
        let scheduler = Scheduler::new(&config(1000.0, 0, 1.0)).with_initial_delay();
        let cancel = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let cancel = cancel.clone();
            let runs = runs.clone();
            async move {
                scheduler
                    .run(&cancel, || {
                        let runs = runs.clone();
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            Ok::<(), ()>(())
                        }
                    })
                    .await;
            }
        });

        // Cancel during (or before) the initial delay; no run may happen
        // afterwards.
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_initial_delay_is_bounded_by_loop_delay() {
        for _ in 0..32 {
            let scheduler = Scheduler::new(&config(10.0, 0, 1.0)).with_initial_delay();
            assert!(scheduler.initial_delay() < Duration::from_secs_f64(10.0));
        }
    }
}
