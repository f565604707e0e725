//! The agent scheduler: a reconciliation loop that keeps one worker
//! alive per agent name with runnable tasks, and the per-worker loop
//! that drives those tasks through the execution envelope.

mod commands;
mod envelope;
mod provider;

pub use commands::CommandRegistry;
pub use provider::{CommandOutcome, CommandTable, CommandsFactory, TaskCommands};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::scheduler::envelope::RunVerdict;
use crate::sleep::{Retry, SleeperRegistry, Waiter};
use crate::store::{TaskState, TaskStore, unix_now};
use crate::supervisor::Supervisor;

/// Sleeper name of the reconciliation loop, wakeable to force an early
/// review of the worker pool.
pub(crate) const RECONCILE_SLEEPER: &str = "reconcile";

struct AgentHandle {
    cancel: CancellationToken,
    join: JoinHandle<Result<()>>,
}

/// Keeps the set of running per-agent workers in sync with the task
/// table. Register it on a [`Supervisor`] with [`attach`](Self::attach);
/// the control surface in [`CommandRegistry`] talks to the same instance.
pub struct AgentScheduler {
    cfg: SchedulerConfig,
    store: TaskStore,
    factory: CommandsFactory,
    sleepers: Arc<SleeperRegistry>,
    agents: Mutex<HashMap<String, AgentHandle>>,
}

impl AgentScheduler {
    pub fn new(
        cfg: SchedulerConfig,
        store: TaskStore,
        factory: CommandsFactory,
        sleepers: Arc<SleeperRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            store,
            factory,
            sleepers,
            agents: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Register the reconciliation loop on a supervisor. The supervisor
    /// must share this scheduler's sleeper registry, otherwise wake-ups
    /// from the control surface go nowhere.
    pub fn attach(self: Arc<Self>, sup: &mut Supervisor) {
        sup.register("reconcile_loop", move |ctx| self.reconcile_loop(ctx));
    }

    async fn reconcile_loop(self: Arc<Self>, ctx: crate::supervisor::LoopCtx) -> Result<()> {
        info!("reconcile loop starting");
        loop {
            match self.clone().review_agents(ctx.cancel_token()).await {
                Ok(()) => {
                    if ctx
                        .interruptible_sleep(self.cfg.reconcile_interval(), RECONCILE_SLEEPER)
                        .await?
                    {
                        break;
                    }
                }
                Err(e) => match e.downcast::<Retry>() {
                    Ok(retry) => {
                        let wait = retry.after.unwrap_or_else(|| self.cfg.reconcile_interval());
                        warn!(
                            "transient scheduler trouble, reviewing again in {:.1}s: {retry}",
                            wait.as_secs_f64()
                        );
                        if ctx.interruptible_sleep(wait, RECONCILE_SLEEPER).await? {
                            break;
                        }
                    }
                    Err(e) => {
                        self.shutdown_workers().await;
                        return Err(e);
                    }
                },
            }
        }
        self.shutdown_workers().await;
        info!("reconcile loop stopped");
        Ok(())
    }

    /// One reconciliation round: reap finished workers, spawn workers
    /// for agent names with runnable tasks, and (policy permitting)
    /// retire workers whose agents have none left.
    async fn review_agents(self: Arc<Self>, parent: &CancellationToken) -> Result<()> {
        let mut agents = self.agents.lock().await;

        let finished: Vec<String> = agents
            .iter()
            .filter(|(_, handle)| handle.join.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        for name in finished {
            if let Some(handle) = agents.remove(&name) {
                match handle.join.await {
                    Ok(Ok(())) => debug!("agent '{name}' wound down"),
                    Ok(Err(e)) => {
                        return Err(e.context(format!("agent '{name}' crashed")));
                    }
                    Err(e) if e.is_cancelled() => debug!("agent '{name}' was cancelled"),
                    Err(e) => bail!("agent '{name}' panicked: {e}"),
                }
            }
        }

        let desired = self.store.agent_names_with_idle_tasks().await?;
        for name in &desired {
            if !agents.contains_key(name) {
                info!("spawning worker for agent '{name}'");
                let cancel = parent.child_token();
                let join = tokio::spawn(Self::agent_life(
                    self.clone(),
                    name.clone(),
                    cancel.clone(),
                ));
                agents.insert(name.clone(), AgentHandle { cancel, join });
            }
        }

        if self.cfg.retire_idle_agents {
            let desired: HashSet<&String> = desired.iter().collect();
            for (name, handle) in agents.iter() {
                if !desired.contains(name) {
                    info!("retiring idle worker for agent '{name}'");
                    handle.cancel.cancel();
                    self.sleepers.wake_up(name);
                }
            }
        }
        Ok(())
    }

    /// Cancel every worker and wait for each to finish. Worker errors
    /// during shutdown are logged, not propagated.
    async fn shutdown_workers(&self) {
        let mut agents = self.agents.lock().await;
        for (name, handle) in agents.iter() {
            handle.cancel.cancel();
            self.sleepers.wake_up(name);
        }
        for (name, handle) in agents.drain() {
            match handle.join.await {
                Ok(Ok(())) => debug!("agent '{name}' stopped"),
                Ok(Err(e)) => warn!("agent '{name}' failed during shutdown: {e:#}"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("agent '{name}' panicked during shutdown: {e}"),
            }
        }
    }

    /// Full lifetime of one worker: own store connection, own commands
    /// instance, then the task loop until cancelled.
    async fn agent_life(self: Arc<Self>, name: String, cancel: CancellationToken) -> Result<()> {
        info!("agent '{name}': starting");
        let store = self.store.reopen()?;
        let mut commands = (self.factory)();
        commands
            .initialize()
            .await
            .with_context(|| format!("agent '{name}': initialize failed"))?;

        let run = self.agent_run(&name, &store, commands.as_mut(), &cancel).await;

        if let Err(e) = commands.close().await {
            warn!("agent '{name}': close failed: {e:#}");
        }
        info!("agent '{name}': stopped");
        run
    }

    async fn agent_run(
        &self,
        name: &str,
        store: &TaskStore,
        commands: &mut dyn TaskCommands,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut waiter = Waiter::from_config(format!("agent '{name}'"), &self.cfg);
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let ids = store.idle_task_ids(name).await?;
            if ids.is_empty() {
                if self
                    .worker_sleep(name, self.cfg.no_tasks_interval(), cancel)
                    .await?
                {
                    return Ok(());
                }
                continue;
            }

            for id in ids {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let Some(task) = store.get_task(id).await? else {
                    continue;
                };
                if task.state != TaskState::Idle || !task.is_due(unix_now()) {
                    continue;
                }
                match envelope::run_task(&self.cfg, store, commands, cancel, id).await? {
                    RunVerdict::Stopped => return Ok(()),
                    // A retry carries its own delay in nexttime; the
                    // backoff waiter only tracks hard failures.
                    RunVerdict::Skipped | RunVerdict::Retrying => {}
                    RunVerdict::Succeeded => waiter.reset(),
                    RunVerdict::Failed => {
                        // Back off before touching the next task; a woken
                        // sleeper cuts the wait short.
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            res = waiter.wait_or_retry(&self.sleepers, name) => {
                                res?;
                            }
                        }
                    }
                }
            }

            let wait = match store.min_idle_nexttime(name).await? {
                Some(next) => Duration::from_secs_f64((next - unix_now()).max(0.0)),
                None => self.cfg.no_tasks_interval(),
            };
            if self.worker_sleep(name, wait, cancel).await? {
                return Ok(());
            }
        }
    }

    /// Interruptible sleep under the agent's own name, so `run_asap` can
    /// wake exactly this worker. Returns `true` on cancellation.
    async fn worker_sleep(
        &self,
        name: &str,
        waittime: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(true),
            res = self.sleepers.sleep(waittime, Some(name)) => {
                res?;
                Ok(cancel.is_cancelled())
            }
        }
    }

}
