//! Control surface over a running [`AgentScheduler`]: the typed methods
//! plus [`CommandRegistry`], a name → JSON handler table any interface
//! (CLI, socket, test) can dispatch into.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{debug, info};

use crate::scheduler::{AgentScheduler, RECONCILE_SLEEPER};
use crate::store::{NewTask, RunSelector, Task, TaskState};

impl AgentScheduler {
    /// Names of the currently live workers. Agent names that only exist
    /// as table rows show up once a reconcile round spawns their worker.
    pub async fn agent_names(&self) -> Result<Vec<String>> {
        let agents = self.agents.lock().await;
        let mut names: Vec<String> = agents.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Take every non-running task out of rotation; workers drain on
    /// their own once no idle tasks remain.
    pub async fn suspend_all(&self) -> Result<usize> {
        let suspended = self.store.suspend_all().await?;
        info!("suspended {suspended} tasks");
        Ok(suspended)
    }

    /// Reactivate the selected tasks and make their workers look right
    /// away. Returns how many rows went back to idle.
    pub async fn run_asap(&self, selector: RunSelector) -> Result<usize> {
        let names = self.store.agent_names_for(selector).await?;
        let changed = self.store.reactivate(selector).await?;
        info!("run_asap {selector}: {changed} tasks reactivated");

        let mut missed = false;
        for name in &names {
            if !self.sleepers.wake_up(name) {
                missed = true;
            }
        }
        if missed {
            // No worker awake under that name yet; an early reconcile
            // round will spawn or nudge it.
            self.sleepers.wake_up(RECONCILE_SLEEPER);
        }
        Ok(changed)
    }

    pub async fn list_tasks(&self, filter: Option<TaskState>) -> Result<Vec<Task>> {
        self.store.list_tasks(filter).await
    }

    pub async fn insert_task(&self, new: &NewTask) -> Result<i64> {
        let id = self.store.insert_task(new).await?;
        debug!("inserted task #{id} for agent '{}'", new.agentname);
        // New agent names only get a worker on the next reconcile round.
        self.sleepers.wake_up(RECONCILE_SLEEPER);
        self.sleepers.wake_up(&new.agentname);
        Ok(id)
    }

    pub async fn update_task(
        &self,
        id: i64,
        changes: &serde_json::Map<String, Value>,
    ) -> Result<bool> {
        let updated = self.store.update_task(id, changes).await?;
        if updated {
            self.sleepers.wake_up(RECONCILE_SLEEPER);
        }
        Ok(updated)
    }

    pub async fn delete_task(&self, id: i64) -> Result<bool> {
        self.store.delete_task(id).await
    }
}

type Handler = Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// JSON-in, JSON-out command table over a scheduler. Built once at
/// startup with every supported command registered explicitly.
pub struct CommandRegistry {
    handlers: HashMap<&'static str, Handler>,
}

impl CommandRegistry {
    pub fn new(scheduler: Arc<AgentScheduler>) -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };

        let s = scheduler.clone();
        reg.add("get_agent_names", move |_args| {
            let s = s.clone();
            async move { Ok(serde_json::to_value(s.agent_names().await?)?) }
        });

        let s = scheduler.clone();
        reg.add("suspend_all", move |_args| {
            let s = s.clone();
            async move { Ok(serde_json::json!({ "suspended": s.suspend_all().await? })) }
        });

        let s = scheduler.clone();
        reg.add("run_asap", move |args| {
            let s = s.clone();
            async move {
                let selector = parse_selector(&args)?;
                Ok(serde_json::json!({ "reactivated": s.run_asap(selector).await? }))
            }
        });

        let s = scheduler.clone();
        reg.add("list_tasks", move |args| {
            let s = s.clone();
            async move {
                let filter = match args.get("state") {
                    Some(Value::String(state)) => Some(state.parse::<TaskState>()?),
                    Some(other) => bail!("state must be a string, got {other}"),
                    None => None,
                };
                Ok(serde_json::to_value(s.list_tasks(filter).await?)?)
            }
        });

        let s = scheduler.clone();
        reg.add("insert_task", move |args| {
            let s = s.clone();
            async move {
                let new: NewTask =
                    serde_json::from_value(args).context("invalid insert_task arguments")?;
                Ok(serde_json::json!({ "id": s.insert_task(&new).await? }))
            }
        });

        let s = scheduler.clone();
        reg.add("update_task", move |args| {
            let s = s.clone();
            async move {
                let id = required_id(&args)?;
                let changes = match args.get("changes") {
                    Some(Value::Object(map)) => map.clone(),
                    _ => bail!("update_task needs a 'changes' object"),
                };
                Ok(serde_json::json!({ "updated": s.update_task(id, &changes).await? }))
            }
        });

        let s = scheduler;
        reg.add("delete_task", move |args| {
            let s = s.clone();
            async move {
                let id = required_id(&args)?;
                Ok(serde_json::json!({ "deleted": s.delete_task(id).await? }))
            }
        });

        reg
    }

    fn add<F, Fut>(&mut self, name: &'static str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers
            .insert(name, Arc::new(move |args| Box::pin(handler(args))));
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub async fn dispatch(&self, name: &str, args: Value) -> Result<Value> {
        let Some(handler) = self.handlers.get(name) else {
            bail!("unknown control command '{name}'");
        };
        debug!("dispatching control command '{name}'");
        handler(args).await
    }
}

fn required_id(args: &Value) -> Result<i64> {
    args.get("id")
        .and_then(Value::as_i64)
        .context("an integer 'id' is required")
}

/// Accepts `{"selector": ...}` or a bare string/number.
fn parse_selector(args: &Value) -> Result<RunSelector> {
    let raw = args.get("selector").unwrap_or(args);
    match raw {
        Value::String(s) => s.parse(),
        Value::Number(n) => {
            let id = n.as_i64().context("selector id must be an integer")?;
            Ok(RunSelector::Id(id))
        }
        other => bail!("selector must be a string or task id, got {other}"),
    }
}
