use std::time::Duration;

use anyhow::Result;
use tracing::info;

use super::{Retry, SleeperRegistry, WakeReason};
use crate::config::SchedulerConfig;

/// Geometric growth factor between consecutive delays.
const GROWTH: f64 = 1.618;

/// Progressive backoff for an operation that keeps failing.
///
/// Delays start at `start` seconds, grow by [`GROWTH`] per attempt and cap
/// at `max`. Waits go through the sleeper registry under the owner's name,
/// so they stay interruptible like every other delay in the system.
pub struct Waiter {
    title: String,
    start: f64,
    max: f64,
    max_tries: u32,
    next: f64,
    tries: u32,
}

impl Waiter {
    pub fn new(title: impl Into<String>, start: f64, max: f64, max_tries: u32) -> Self {
        Self {
            title: title.into(),
            start,
            max,
            max_tries,
            next: start,
            tries: 0,
        }
    }

    pub fn from_config(title: impl Into<String>, cfg: &SchedulerConfig) -> Self {
        Self::new(title, cfg.waiter_start, cfg.waiter_max, cfg.waiter_max_tries)
    }

    /// Restart the counter and the delay progression.
    pub fn reset(&mut self) {
        self.tries = 0;
        self.next = self.start;
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    /// The delay the next `wait()` will pay.
    pub fn next_wait(&self) -> Duration {
        Duration::from_secs_f64(self.next.max(0.0))
    }

    pub fn gave_up(&self) -> bool {
        self.tries >= self.max_tries
    }

    /// Pay the current delay and advance the progression, regardless of
    /// how many attempts have been made.
    pub async fn wait(&mut self, sleepers: &SleeperRegistry, name: &str) -> Result<WakeReason> {
        info!(
            "{}: attempt {}; waiting {:.2}s",
            self.title,
            self.tries + 1,
            self.next
        );
        self.advance(sleepers, name).await
    }

    /// Like [`wait`](Waiter::wait), but raises [`Retry`] once the attempt
    /// budget is exhausted instead of waiting again.
    pub async fn wait_or_retry(
        &mut self,
        sleepers: &SleeperRegistry,
        name: &str,
    ) -> Result<WakeReason> {
        if self.gave_up() {
            return Err(Retry::new(format!(
                "{}: gave up after {} attempts",
                self.title, self.tries
            ))
            .into());
        }
        info!(
            "{}: attempt {}/{}; waiting {:.2}s",
            self.title,
            self.tries + 1,
            self.max_tries,
            self.next
        );
        self.advance(sleepers, name).await
    }

    async fn advance(&mut self, sleepers: &SleeperRegistry, name: &str) -> Result<WakeReason> {
        let reason = sleepers
            .sleep(Duration::from_secs_f64(self.next.max(0.0)), Some(name))
            .await?;
        self.next = (self.next * GROWTH).min(self.max);
        self.tries += 1;
        Ok(reason)
    }
}
