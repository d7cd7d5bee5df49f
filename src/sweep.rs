//! Periodic expiry sweeps for the in-memory caches.
//!
//! Each cache owns its map and exposes a synchronous `sweep()`; this module
//! only schedules it. The timer task holds a `Weak` reference, so a dropped
//! cache ends its sweeper and an idle sweeper never keeps anything alive.

use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};

/// Handle to a running sweep timer. Stops the timer when dropped.
pub struct SweepHandle {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SweepHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepHandle")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SweepHandle {
    /// Run `sweep` against `target` every `every`, starting one interval from now.
    ///
    /// `sweep` returns how many entries it removed.
    pub fn spawn<T, F>(name: &'static str, target: &Arc<T>, every: Duration, sweep: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&T) -> usize + Send + 'static,
    {
        let target: Weak<T> = Arc::downgrade(target);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(target) = target.upgrade() else {
                    tracing::debug!(sweeper = name, "sweep target dropped, stopping timer");
                    break;
                };

                let removed = sweep(&target);
                if removed > 0 {
                    tracing::debug!(sweeper = name, removed, "swept expired entries");
                }
            }
        });

        tracing::debug!(sweeper = name, interval_ms = every.as_millis() as u64, "sweeper started");

        Self {
            name,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the timer. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!(sweeper = self.name, "sweeper stopped");
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        sweeps: AtomicUsize,
    }

    impl Counter {
        fn sweep(&self) -> usize {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_each_interval() {
        let counter = Arc::new(Counter::default());
        let _handle = SweepHandle::spawn("test", &counter, Duration::from_secs(10), Counter::sweep);

        tokio::time::sleep(Duration::from_millis(9_000)).await;
        assert_eq!(counter.sweeps.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(counter.sweeps.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(counter.sweeps.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_sweeps() {
        let counter = Arc::new(Counter::default());
        let mut handle = SweepHandle::spawn("test", &counter, Duration::from_secs(10), Counter::sweep);

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(counter.sweeps.load(Ordering::SeqCst), 1);

        handle.stop();
        handle.stop();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.sweeps.load(Ordering::SeqCst), 1);
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_target_ends_timer() {
        let counter = Arc::new(Counter::default());
        let handle = SweepHandle::spawn("test", &counter, Duration::from_secs(1), Counter::sweep);
        drop(counter);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!handle.is_running());
    }
}
