use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::info;

/// Scheduler and runtime tuning knobs. Constructed once and passed by
/// reference into the scheduler and each worker; there is no process-wide
/// mutable configuration.
///
/// All durations are plain seconds so they line up with the float epoch
/// timestamps stored in the task table.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between agent reconciliation cycles.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: f64,

    /// Seconds a worker sleeps when its agent has no runnable tasks.
    #[serde(default = "default_no_tasks_interval")]
    pub no_tasks_interval: f64,

    /// Default delay for retry outcomes that carry no suggested wait.
    #[serde(default = "default_retry_wait")]
    pub retry_wait: f64,

    /// First backoff delay of a worker's waiter (seconds).
    #[serde(default = "default_waiter_start")]
    pub waiter_start: f64,

    /// Backoff ceiling of a worker's waiter (seconds).
    #[serde(default = "default_waiter_max")]
    pub waiter_max: f64,

    /// Attempt budget before a waiter gives up.
    #[serde(default = "default_waiter_max_tries")]
    pub waiter_max_tries: u32,

    /// Cancel workers whose agentname no longer has runnable tasks.
    /// Off by default: an idle worker parks cheaply on its sleeper and
    /// picks new work up without a respawn.
    #[serde(default)]
    pub retire_idle_agents: bool,

    /// Grace period between waking all sleepers and cancelling loops on
    /// shutdown, giving in-flight work a chance to reach a checkpoint.
    #[serde(default = "default_stop_grace")]
    pub stop_grace: f64,
}

fn default_reconcile_interval() -> f64 {
    15.0
}
fn default_no_tasks_interval() -> f64 {
    5.0
}
fn default_retry_wait() -> f64 {
    30.0
}
fn default_waiter_start() -> f64 {
    0.5
}
fn default_waiter_max() -> f64 {
    60.0
}
fn default_waiter_max_tries() -> u32 {
    10
}
fn default_stop_grace() -> f64 {
    0.1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: default_reconcile_interval(),
            no_tasks_interval: default_no_tasks_interval(),
            retry_wait: default_retry_wait(),
            waiter_start: default_waiter_start(),
            waiter_max: default_waiter_max(),
            waiter_max_tries: default_waiter_max_tries(),
            retire_idle_agents: false,
            stop_grace: default_stop_grace(),
        }
    }
}

impl SchedulerConfig {
    /// Load `cadence.toml` from a directory, falling back to defaults when
    /// the file does not exist.
    pub async fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let config_path = dir.as_ref().join("cadence.toml");
        if !config_path.exists() {
            info!("No cadence.toml found, using default scheduler config.");
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        let config: SchedulerConfig = toml::from_str(&content)?;
        info!(
            "Loaded scheduler config: reconcile={}s, no_tasks={}s, retry_wait={}s",
            config.reconcile_interval, config.no_tasks_interval, config.retry_wait
        );
        Ok(config)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs_f64(self.reconcile_interval.max(0.0))
    }

    pub fn no_tasks_interval(&self) -> Duration {
        Duration::from_secs_f64(self.no_tasks_interval.max(0.0))
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs_f64(self.retry_wait.max(0.0))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs_f64(self.stop_grace.max(0.0))
    }
}
