//! Timer-driven background loops with explicit start/stop.

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// When a loop first runs and how often it repeats afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSchedule {
    pub interval: Duration,
    pub warmup: Duration,
    /// Upper bound of a random delay added to `warmup` so a fleet of workers
    /// started together does not poll in lockstep.
    pub jitter: Duration,
}

impl LoopSchedule {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            warmup: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_warmup(mut self, warmup: Duration, jitter: Duration) -> Self {
        self.warmup = warmup;
        self.jitter = jitter;
        self
    }

    fn initial_delay(&self) -> Duration {
        let max_jitter = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::rng().random_range(0..=max_jitter)
        };
        self.warmup + Duration::from_millis(jitter)
    }
}

/// Spawns `tick` on `schedule` until `token` is cancelled. A tick in flight
/// when cancellation arrives is allowed to finish. `tick` handles its own
/// errors so one bad cycle never ends the loop.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    schedule: LoopSchedule,
    token: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let initial_delay = schedule.initial_delay();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {
                info!(task = name, "loop cancelled during warm-up");
                return;
            }
            _ = tokio::time::sleep(initial_delay) => {}
        }

        info!(task = name, interval_ms = schedule.interval.as_millis() as u64, "loop started");
        let mut ticker = interval(schedule.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => tick().await,
            }
        }
        info!(task = name, "loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[tokio::test]
    async fn loop_runs_until_cancelled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let counter = Arc::clone(&ticks);
        let handle = spawn_periodic(
            "test",
            LoopSchedule::every(Duration::from_millis(5)),
            token.clone(),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
        handle.await.unwrap();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {seen}");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn cancel_during_warmup_skips_every_tick() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let counter = Arc::clone(&ticks);
        let schedule = LoopSchedule::every(Duration::from_millis(5))
            .with_warmup(Duration::from_secs(30), Duration::ZERO);
        let handle = spawn_periodic("test", schedule, token.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        token.cancel();
        handle.await.unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
