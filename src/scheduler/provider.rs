use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::store::Task;

/// What one command execution amounted to.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Success,
    /// Transient trouble. The task goes back into rotation, due again
    /// after `after` (or the configured retry wait when absent).
    Retry {
        after: Option<Duration>,
        reason: String,
    },
    /// The task itself is broken; take it out of rotation.
    Fail(String),
}

impl CommandOutcome {
    pub fn retry(reason: impl Into<String>) -> Self {
        CommandOutcome::Retry {
            after: None,
            reason: reason.into(),
        }
    }

    pub fn retry_after(after: Duration, reason: impl Into<String>) -> Self {
        CommandOutcome::Retry {
            after: Some(after),
            reason: reason.into(),
        }
    }
}

/// The commands one worker can execute. Each worker gets its own
/// instance from a [`CommandsFactory`], so implementations may hold
/// connections or other non-shareable state across calls.
#[async_trait]
pub trait TaskCommands: Send {
    /// Called once when the worker starts, before any task runs.
    async fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once when the worker winds down.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn has_command(&self, name: &str) -> bool;

    async fn run(&mut self, name: &str, task: &Task) -> CommandOutcome;
}

/// Builds a fresh [`TaskCommands`] per worker.
pub type CommandsFactory = Arc<dyn Fn() -> Box<dyn TaskCommands> + Send + Sync>;

type Routine =
    Arc<dyn Fn(Task) -> Pin<Box<dyn Future<Output = CommandOutcome> + Send>> + Send + Sync>;

/// Name → routine table, the plain way to wire commands in. Register
/// each routine explicitly; unknown names fail the task rather than
/// falling through to anything implicit.
#[derive(Default, Clone)]
pub struct CommandTable {
    routines: HashMap<String, Routine>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(mut self, name: impl Into<String>, routine: F) -> Self
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CommandOutcome> + Send + 'static,
    {
        self.routines
            .insert(name.into(), Arc::new(move |task| Box::pin(routine(task))));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.routines.keys().map(String::as_str).collect()
    }
}

#[async_trait]
impl TaskCommands for CommandTable {
    fn has_command(&self, name: &str) -> bool {
        self.routines.contains_key(name)
    }

    async fn run(&mut self, name: &str, task: &Task) -> CommandOutcome {
        match self.routines.get(name) {
            Some(routine) => routine(task.clone()).await,
            None => CommandOutcome::Fail(format!("unknown command '{name}'")),
        }
    }
}
