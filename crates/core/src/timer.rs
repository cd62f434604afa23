//! Cancellable repeating timer
//!
//! Used for signaling keep-alives and periodic key-frame requests. The timer
//! task is aborted when the handle is cancelled or dropped, so a torn-down
//! session never leaves a tick running.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct RepeatingTimer {
    handle: JoinHandle<()>,
}

impl RepeatingTimer {
    /// Call `tick` every `period`, starting one period from now.
    ///
    /// The timer ends on its own when `tick` resolves to `false`.
    pub fn start<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !tick().await {
                    break;
                }
            }
        });
        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
