//! The execution envelope around a single task run: state transitions,
//! scheduling of the next occurrence and error capture all live here so
//! command routines only ever see a [`crate::store::Task`] and return an outcome.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::scheduler::provider::{CommandOutcome, TaskCommands};
use crate::store::{TaskResult, TaskState, TaskStore, unix_now};

/// How one pass over a task id ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunVerdict {
    /// Row gone or no longer idle; nothing happened.
    Skipped,
    /// The command finished and the row moved to its next occurrence
    /// (or retired, for a one-shot).
    Succeeded,
    /// Transient failure; the row stays idle with a delayed nexttime.
    Retrying,
    /// The command failed for real and the row was suspended.
    Failed,
    /// Cancellation arrived mid-run; the task went back to idle.
    Stopped,
}

/// Run one task start to finish. Store errors propagate and crash the
/// worker; command failures are absorbed into the row.
pub(crate) async fn run_task(
    cfg: &SchedulerConfig,
    store: &TaskStore,
    commands: &mut dyn TaskCommands,
    cancel: &CancellationToken,
    id: i64,
) -> Result<RunVerdict> {
    let Some(mut task) = store.get_task(id).await? else {
        debug!("task #{id} vanished before running");
        return Ok(RunVerdict::Skipped);
    };
    if task.state != TaskState::Idle {
        return Ok(RunVerdict::Skipped);
    }

    if !commands.has_command(&task.command) {
        warn!("task #{id}: no command '{}' registered, suspending", task.command);
        task.state = TaskState::Suspended;
        task.result = TaskResult::Fail;
        task.nexttime = 0.0;
        task.lasterror = Some(format!("unknown command '{}'", task.command));
        store.save_execution(&task).await?;
        return Ok(RunVerdict::Failed);
    }

    let started = unix_now();
    task.lasttime = Some(started);
    task.lasterror = None;
    task.result = TaskResult::None;
    task.state = TaskState::InProgress;
    store.save_execution(&task).await?;
    info!("task #{id} ({}): running '{}'", task.agentname, task.command);

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            // Put the row back the way the next run expects to find it.
            task.state = TaskState::Idle;
            task.nexttime = 0.0;
            store.save_execution(&task).await?;
            info!("task #{id}: stopped mid-run, back to idle");
            return Ok(RunVerdict::Stopped);
        }
        outcome = commands.run(&task.command, &task) => outcome,
    };

    let finished = unix_now();
    let verdict = match outcome {
        CommandOutcome::Success => {
            task.result = TaskResult::Success;
            match task.compute_nexttime(finished) {
                Ok(Some(next)) => {
                    task.state = TaskState::Idle;
                    task.nexttime = next;
                    debug!("task #{id}: done, next run at {next:.0}");
                    RunVerdict::Succeeded
                }
                Ok(None) => {
                    // One-shot: keep the successful result but retire the row.
                    task.state = TaskState::Suspended;
                    task.nexttime = 0.0;
                    info!("task #{id}: one-shot done, suspended");
                    RunVerdict::Succeeded
                }
                Err(e) => {
                    task.state = TaskState::Suspended;
                    task.result = TaskResult::Fail;
                    task.nexttime = 0.0;
                    task.lasterror = Some(format!("bad schedule: {e:#}"));
                    warn!("task #{id}: unschedulable, suspending: {e:#}");
                    RunVerdict::Failed
                }
            }
        }
        CommandOutcome::Retry { after, reason } => {
            let wait = after.unwrap_or_else(|| cfg.retry_wait());
            task.state = TaskState::Idle;
            task.result = TaskResult::Fail;
            task.nexttime = finished + wait.as_secs_f64();
            task.lasterror = Some(reason.clone());
            info!(
                "task #{id}: retry in {:.1}s ({reason})",
                wait.as_secs_f64()
            );
            RunVerdict::Retrying
        }
        CommandOutcome::Fail(reason) => {
            task.state = TaskState::Suspended;
            task.result = TaskResult::Fail;
            task.nexttime = 0.0;
            task.lasterror = Some(reason.clone());
            warn!("task #{id}: failed, suspending: {reason}");
            RunVerdict::Failed
        }
    };
    store.save_execution(&task).await?;
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::provider::CommandTable;
    use crate::store::NewTask;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn cfg() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    async fn seeded(new: NewTask) -> (TaskStore, i64) {
        let store = TaskStore::open_in_memory().unwrap();
        let id = store.insert_task(&new).await.unwrap();
        (store, id)
    }

    fn interval_task(seconds: i64) -> NewTask {
        NewTask {
            agentname: "a".to_string(),
            command: "go".to_string(),
            interval: Some(seconds),
            ..Default::default()
        }
    }

    fn one_shot() -> NewTask {
        NewTask {
            agentname: "a".to_string(),
            command: "go".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn success_reschedules_interval_task() {
        let (store, id) = seeded(interval_task(300)).await;
        let mut commands =
            CommandTable::new().register("go", |_t| async { CommandOutcome::Success });
        let token = CancellationToken::new();

        let verdict = run_task(&cfg(), &store, &mut commands, &token, id)
            .await
            .unwrap();
        assert_eq!(verdict, RunVerdict::Succeeded);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Idle);
        assert_eq!(task.result, TaskResult::Success);
        assert!(task.lasterror.is_none());
        let lasttime = task.lasttime.unwrap();
        assert!((task.nexttime - (lasttime + 300.0)).abs() < 2.0);
    }

    #[tokio::test]
    async fn one_shot_success_retires_the_task() {
        let (store, id) = seeded(one_shot()).await;
        let mut commands =
            CommandTable::new().register("go", |_t| async { CommandOutcome::Success });
        let token = CancellationToken::new();

        let verdict = run_task(&cfg(), &store, &mut commands, &token, id)
            .await
            .unwrap();
        assert_eq!(verdict, RunVerdict::Succeeded);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Suspended);
        assert_eq!(task.result, TaskResult::Success);
        assert_eq!(task.nexttime, 0.0);
    }

    #[tokio::test]
    async fn retry_goes_back_to_idle_with_a_delay() {
        let (store, id) = seeded(one_shot()).await;
        let mut commands = CommandTable::new().register("go", |_t| async {
            CommandOutcome::retry_after(Duration::from_secs(90), "backend busy")
        });
        let token = CancellationToken::new();

        let verdict = run_task(&cfg(), &store, &mut commands, &token, id)
            .await
            .unwrap();
        assert_eq!(verdict, RunVerdict::Retrying);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Idle);
        assert_eq!(task.result, TaskResult::Fail);
        assert_eq!(task.lasterror.as_deref(), Some("backend busy"));
        assert!((task.nexttime - (unix_now() + 90.0)).abs() < 2.0);
    }

    #[tokio::test]
    async fn retry_without_delay_uses_configured_wait() {
        let (store, id) = seeded(one_shot()).await;
        let mut commands = CommandTable::new()
            .register("go", |_t| async { CommandOutcome::retry("flaky") });
        let token = CancellationToken::new();

        run_task(&cfg(), &store, &mut commands, &token, id)
            .await
            .unwrap();

        let task = store.get_task(id).await.unwrap().unwrap();
        let expected = unix_now() + cfg().retry_wait().as_secs_f64();
        assert!((task.nexttime - expected).abs() < 2.0);
    }

    #[tokio::test]
    async fn fail_suspends_with_the_error() {
        let (store, id) = seeded(interval_task(60)).await;
        let mut commands = CommandTable::new()
            .register("go", |_t| async { CommandOutcome::Fail("boom".to_string()) });
        let token = CancellationToken::new();

        let verdict = run_task(&cfg(), &store, &mut commands, &token, id)
            .await
            .unwrap();
        assert_eq!(verdict, RunVerdict::Failed);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Suspended);
        assert_eq!(task.result, TaskResult::Fail);
        assert_eq!(task.lasterror.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn unknown_command_suspends_without_running() {
        let (store, id) = seeded(one_shot()).await;
        let mut commands = CommandTable::new();
        let token = CancellationToken::new();

        let verdict = run_task(&cfg(), &store, &mut commands, &token, id)
            .await
            .unwrap();
        assert_eq!(verdict, RunVerdict::Failed);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Suspended);
        assert!(task.lasttime.is_none());
        assert!(task.lasterror.unwrap().contains("unknown command"));
    }

    #[tokio::test]
    async fn non_idle_rows_are_skipped() {
        let (store, id) = seeded(one_shot()).await;
        let mut changes = serde_json::Map::new();
        changes.insert("state".into(), serde_json::json!("suspended"));
        store.update_task(id, &changes).await.unwrap();

        let mut commands =
            CommandTable::new().register("go", |_t| async { CommandOutcome::Success });
        let token = CancellationToken::new();
        let verdict = run_task(&cfg(), &store, &mut commands, &token, id)
            .await
            .unwrap();
        assert_eq!(verdict, RunVerdict::Skipped);
    }

    #[tokio::test]
    async fn cancellation_mid_run_restores_idle() {
        let (store, id) = seeded(interval_task(60)).await;
        let gate = Arc::new(Notify::new());
        let entered = gate.clone();
        let mut commands = CommandTable::new().register("go", move |_t| {
            let entered = entered.clone();
            async move {
                entered.notify_one();
                // Never finishes on its own.
                std::future::pending::<()>().await;
                CommandOutcome::Success
            }
        });
        let token = CancellationToken::new();

        let canceller = token.clone();
        let waiter = gate.clone();
        tokio::spawn(async move {
            waiter.notified().await;
            canceller.cancel();
        });

        let verdict = tokio::time::timeout(
            Duration::from_secs(5),
            run_task(&cfg(), &store, &mut commands, &token, id),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(verdict, RunVerdict::Stopped);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Idle);
        assert_eq!(task.nexttime, 0.0);
        assert!(task.lasttime.is_some());
    }
}
