use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A single recurring fetch timer. Whether it should run is decided by the
/// owner; the scheduler only arms and disarms.
pub struct PollScheduler {
    interval: Duration,
    armed: Option<CancellationToken>,
}

impl PollScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            armed: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Arm the timer if it is not armed. The first tick fires one full
    /// interval from now. Returning `Break` from `on_tick` stops the timer.
    pub fn enable<F, Fut>(&mut self, on_tick: F) -> bool
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        if self.armed.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = self.interval;
        debug!(interval_secs = period.as_secs(), "poll timer armed");

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        trace!("poll tick");
                        if on_tick().await.is_break() {
                            break;
                        }
                    }
                }
            }
        });

        self.armed = Some(cancel);
        true
    }

    /// Disarm the timer. A tick already running is allowed to finish.
    pub fn disable(&mut self) -> bool {
        match self.armed.take() {
            Some(cancel) => {
                cancel.cancel();
                debug!("poll timer disarmed");
                true
            }
            None => false,
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        if let Some(cancel) = self.armed.take() {
            cancel.cancel();
        }
    }
}
