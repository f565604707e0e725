mod waiter;

pub use waiter::Waiter;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::debug;

/// Recoverable "try again later" signal.
///
/// Raised by a [`Waiter`] that exhausted its attempt budget and by
/// reconciliation-cycle work that should be re-run after a delay rather
/// than crash the service. Task command routines do not use this type;
/// they report retries through their outcome value.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct Retry {
    pub reason: String,
    /// Suggested wait before the next attempt; caller default when `None`.
    pub after: Option<Duration>,
}

impl Retry {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            after: None,
        }
    }

    pub fn after(reason: impl Into<String>, after: Duration) -> Self {
        Self {
            reason: reason.into(),
            after: Some(after),
        }
    }
}

/// How a sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The full wait elapsed.
    TimedOut,
    /// Woken by name or globally before the deadline.
    Woken,
}

struct Sleeper {
    notify: Notify,
}

/// Registry of named in-flight waits.
///
/// Every delay in the system (idle polling, backoff, shutdown grace)
/// goes through [`sleep`](SleeperRegistry::sleep) so that it can be cut
/// short by name ([`wake_up`](SleeperRegistry::wake_up)) or globally
/// ([`wake_all`](SleeperRegistry::wake_all)). A sleeper exists only while
/// its wait is in flight; names must be unique among concurrent sleepers.
#[derive(Default)]
pub struct SleeperRegistry {
    sleepers: Mutex<HashMap<String, Arc<Sleeper>>>,
}

impl SleeperRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block for up to `waittime`, returning early when woken.
    ///
    /// `name` must not collide with another active sleeper; pass `None`
    /// for a generated one-off name. The registry entry is removed however
    /// the wait ends, including the future being dropped.
    pub async fn sleep(&self, waittime: Duration, name: Option<&str>) -> Result<WakeReason> {
        let name = match name {
            Some(n) => n.to_string(),
            None => format!("sleeper-{}", uuid::Uuid::new_v4()),
        };

        let sleeper = Arc::new(Sleeper {
            notify: Notify::new(),
        });
        {
            let mut map = self.sleepers.lock().unwrap();
            if map.contains_key(&name) {
                anyhow::bail!("sleeper '{name}' already exists");
            }
            map.insert(name.clone(), sleeper.clone());
        }
        let _guard = SleeperGuard {
            registry: self,
            name: &name,
        };

        debug!("sleeper '{}' down for {:.3}s", name, waittime.as_secs_f64());
        let reason = match tokio::time::timeout(waittime, sleeper.notify.notified()).await {
            Ok(()) => WakeReason::Woken,
            Err(_) => WakeReason::TimedOut,
        };
        debug!("sleeper '{}' up ({:?})", name, reason);
        Ok(reason)
    }

    /// Unified small wait, usually before retrying something that just
    /// went wrong.
    pub async fn wait_a_bit(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    /// Wake one named sleeper. Returns whether such a sleeper was active.
    pub fn wake_up(&self, name: &str) -> bool {
        match self.sleepers.lock().unwrap().get(name) {
            Some(sleeper) => {
                sleeper.notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Wake every active sleeper.
    pub fn wake_all(&self) {
        for sleeper in self.sleepers.lock().unwrap().values() {
            sleeper.notify.notify_one();
        }
    }

    pub fn active_names(&self) -> Vec<String> {
        self.sleepers.lock().unwrap().keys().cloned().collect()
    }
}

struct SleeperGuard<'a> {
    registry: &'a SleeperRegistry,
    name: &'a str,
}

impl Drop for SleeperGuard<'_> {
    fn drop(&mut self) {
        self.registry.sleepers.lock().unwrap().remove(self.name);
    }
}
