mod task;

pub use task::{Task, TaskResult, TaskState, unix_now};

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

/// Columns the control surface is allowed to change through
/// [`TaskStore::update_task`]. `id` is deliberately absent.
const UPDATABLE_COLUMNS: &[&str] = &[
    "agentname",
    "command",
    "time_of_day",
    "interval",
    "lasttime",
    "nexttime",
    "state",
    "result",
    "lasterror",
];

/// Fields for [`TaskStore::insert_task`]; everything else takes the
/// schema defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTask {
    pub agentname: String,
    pub command: String,
    #[serde(default)]
    pub time_of_day: Option<String>,
    #[serde(default)]
    pub interval: Option<i64>,
    /// First due time (float epoch seconds); immediately due when omitted.
    #[serde(default)]
    pub nexttime: f64,
}

/// Which tasks a bulk reactivation applies to. Rows currently
/// `in_progress` are never touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSelector {
    Id(i64),
    All,
    Idle,
    Suspended,
    /// Tasks out of rotation or whose last attempt failed.
    Inactive,
}

impl FromStr for RunSelector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(RunSelector::All),
            "idle" => Ok(RunSelector::Idle),
            "suspended" => Ok(RunSelector::Suspended),
            "inactive" => Ok(RunSelector::Inactive),
            other => match other.parse::<i64>() {
                Ok(id) => Ok(RunSelector::Id(id)),
                Err(_) => bail!("invalid selector '{other}' (task id or all|idle|suspended|inactive)"),
            },
        }
    }
}

impl fmt::Display for RunSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunSelector::Id(id) => write!(f, "#{id}"),
            RunSelector::All => f.write_str("all"),
            RunSelector::Idle => f.write_str("idle"),
            RunSelector::Suspended => f.write_str("suspended"),
            RunSelector::Inactive => f.write_str("inactive"),
        }
    }
}

/// SQLite-backed task table.
///
/// The scheduler core only ever touches the store through these methods;
/// every statement is parameterized and state names are bound from the
/// [`TaskState`]/[`TaskResult`] vocabulary.
pub struct TaskStore {
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl TaskStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .with_context(|| format!("opening task store at {}", path.display()))?;
        Self::init(conn, Some(path))
    }

    /// Test-friendly store without a backing file. `reopen` shares the
    /// handle since a second connection would see a different database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS task (
                id INTEGER PRIMARY KEY,
                agentname TEXT NOT NULL,
                command TEXT NOT NULL,
                time_of_day TEXT,
                interval INTEGER,
                lasttime REAL,
                nexttime REAL NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'idle',
                result TEXT NOT NULL DEFAULT '',
                lasterror TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_nexttime ON task (nexttime)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_agentname ON task (agentname)",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Fresh connection against the same database, so each worker owns
    /// its connection exclusively.
    pub fn reopen(&self) -> Result<TaskStore> {
        match &self.path {
            Some(path) => TaskStore::open(path),
            None => Ok(TaskStore {
                db: self.db.clone(),
                path: None,
            }),
        }
    }

    /// Distinct agent names that currently have runnable work.
    pub async fn agent_names_with_idle_tasks(&self) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT DISTINCT agentname FROM task WHERE state = ?1")?;
        let rows = stmt.query_map(params![TaskState::Idle.as_str()], |row| row.get(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// Ids of runnable tasks for one agent, in insertion order.
    pub async fn idle_task_ids(&self, agentname: &str) -> Result<Vec<i64>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT id FROM task WHERE agentname = ?1 AND state = ?2 ORDER BY id")?;
        let rows = stmt.query_map(params![agentname, TaskState::Idle.as_str()], |row| {
            row.get(0)
        })?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let db = self.db.lock().await;
        let task = db
            .query_row("SELECT * FROM task WHERE id = ?1", params![id], row_to_task)
            .optional()?;
        Ok(task)
    }

    /// Earliest trigger among an agent's runnable tasks.
    pub async fn min_idle_nexttime(&self, agentname: &str) -> Result<Option<f64>> {
        let db = self.db.lock().await;
        let min: Option<f64> = db.query_row(
            "SELECT MIN(nexttime) FROM task WHERE agentname = ?1 AND state = ?2",
            params![agentname, TaskState::Idle.as_str()],
            |row| row.get(0),
        )?;
        Ok(min)
    }

    /// Persist the execution-relevant slice of one row, committed
    /// immediately so a crash mid-execution stays observable.
    pub async fn save_execution(&self, task: &Task) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE task SET lasttime = ?1, nexttime = ?2, lasterror = ?3, state = ?4, result = ?5
             WHERE id = ?6",
            params![
                task.lasttime,
                task.nexttime,
                task.lasterror,
                task.state.as_str(),
                task.result.as_str(),
                task.id
            ],
        )?;
        Ok(())
    }

    pub async fn insert_task(&self, new: &NewTask) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO task (agentname, command, time_of_day, interval, nexttime)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                new.agentname,
                new.command,
                new.time_of_day,
                new.interval,
                new.nexttime
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Apply a column → value patch to one row. Only the columns in
    /// [`UPDATABLE_COLUMNS`] are accepted, and `state`/`result` values
    /// must belong to their vocabulary.
    pub async fn update_task(
        &self,
        id: i64,
        changes: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool> {
        if changes.is_empty() {
            return Ok(false);
        }
        let mut sets = Vec::new();
        // Owned values, so the statement can be bound after the lock
        // without holding non-Send trait objects across the await.
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        for (column, value) in changes {
            if !UPDATABLE_COLUMNS.contains(&column.as_str()) {
                bail!("column '{column}' cannot be updated");
            }
            if column == "state" {
                value
                    .as_str()
                    .context("state must be a string")?
                    .parse::<TaskState>()?;
            }
            if column == "result" {
                value
                    .as_str()
                    .context("result must be a string")?
                    .parse::<TaskResult>()?;
            }
            sets.push(format!("{} = ?{}", column, values.len() + 1));
            values.push(json_to_sql(value)?);
        }
        let sql = format!(
            "UPDATE task SET {} WHERE id = ?{}",
            sets.join(", "),
            values.len() + 1
        );
        values.push(rusqlite::types::Value::Integer(id));

        let db = self.db.lock().await;
        let changed = db.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(changed > 0)
    }

    pub async fn delete_task(&self, id: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let deleted = db.execute("DELETE FROM task WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub async fn list_tasks(&self, filter: Option<TaskState>) -> Result<Vec<Task>> {
        let db = self.db.lock().await;
        let mut out = Vec::new();
        match filter {
            Some(state) => {
                let mut stmt = db.prepare("SELECT * FROM task WHERE state = ?1 ORDER BY id")?;
                let rows = stmt.query_map(params![state.as_str()], row_to_task)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = db.prepare("SELECT * FROM task ORDER BY id")?;
                let rows = stmt.query_map([], row_to_task)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Take every non-running task out of rotation.
    pub async fn suspend_all(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE task SET state = ?1, nexttime = 0 WHERE state != ?2",
            params![
                TaskState::Suspended.as_str(),
                TaskState::InProgress.as_str()
            ],
        )?;
        debug!("suspend_all: {changed} tasks suspended");
        Ok(changed)
    }

    /// Make the selected non-running tasks immediately runnable again.
    pub async fn reactivate(&self, selector: RunSelector) -> Result<usize> {
        let db = self.db.lock().await;
        let idle = TaskState::Idle.as_str();
        let in_progress = TaskState::InProgress.as_str();
        let changed = match selector {
            RunSelector::Id(id) => db.execute(
                "UPDATE task SET state = ?1, nexttime = 0 WHERE state != ?2 AND id = ?3",
                params![idle, in_progress, id],
            )?,
            RunSelector::All => db.execute(
                "UPDATE task SET state = ?1, nexttime = 0 WHERE state != ?2",
                params![idle, in_progress],
            )?,
            RunSelector::Idle => db.execute(
                "UPDATE task SET state = ?1, nexttime = 0 WHERE state = ?2",
                params![idle, idle],
            )?,
            RunSelector::Suspended => db.execute(
                "UPDATE task SET state = ?1, nexttime = 0 WHERE state = ?2",
                params![idle, TaskState::Suspended.as_str()],
            )?,
            RunSelector::Inactive => db.execute(
                "UPDATE task SET state = ?1, nexttime = 0
                 WHERE state != ?2 AND (state = ?3 OR result = ?4)",
                params![
                    idle,
                    in_progress,
                    TaskState::Suspended.as_str(),
                    TaskResult::Fail.as_str()
                ],
            )?,
        };
        debug!("reactivate {selector}: {changed} tasks back to idle");
        Ok(changed)
    }

    /// Agent names the selector touches; used to wake the right workers.
    pub async fn agent_names_for(&self, selector: RunSelector) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let in_progress = TaskState::InProgress.as_str();
        match selector {
            RunSelector::Id(id) => {
                let mut stmt = db.prepare(
                    "SELECT DISTINCT agentname FROM task WHERE state != ?1 AND id = ?2",
                )?;
                collect_names(&mut stmt, &[&in_progress, &id])
            }
            RunSelector::All => {
                let mut stmt =
                    db.prepare("SELECT DISTINCT agentname FROM task WHERE state != ?1")?;
                collect_names(&mut stmt, &[&in_progress])
            }
            RunSelector::Idle => {
                let mut stmt =
                    db.prepare("SELECT DISTINCT agentname FROM task WHERE state = ?1")?;
                collect_names(&mut stmt, &[&TaskState::Idle.as_str()])
            }
            RunSelector::Suspended => {
                let mut stmt =
                    db.prepare("SELECT DISTINCT agentname FROM task WHERE state = ?1")?;
                collect_names(&mut stmt, &[&TaskState::Suspended.as_str()])
            }
            RunSelector::Inactive => {
                let mut stmt = db.prepare(
                    "SELECT DISTINCT agentname FROM task
                     WHERE state != ?1 AND (state = ?2 OR result = ?3)",
                )?;
                collect_names(
                    &mut stmt,
                    &[
                        &in_progress,
                        &TaskState::Suspended.as_str(),
                        &TaskResult::Fail.as_str(),
                    ],
                )
            }
        }
    }
}

fn collect_names(
    stmt: &mut rusqlite::Statement<'_>,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<String>> {
    let rows = stmt.query_map(params, |row| row.get(0))?;
    let mut names = Vec::new();
    for row in rows {
        names.push(row?);
    }
    Ok(names)
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let state: String = row.get("state")?;
    let result: String = row.get("result")?;
    Ok(Task {
        id: row.get("id")?,
        agentname: row.get("agentname")?,
        command: row.get("command")?,
        time_of_day: row.get("time_of_day")?,
        interval: row.get("interval")?,
        lasttime: row.get("lasttime")?,
        nexttime: row.get("nexttime")?,
        state: state.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?,
        result: result.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?,
        lasterror: row.get("lasterror")?,
    })
}

fn json_to_sql(value: &serde_json::Value) -> Result<rusqlite::types::Value> {
    use rusqlite::types::Value as Sql;
    use serde_json::Value;
    Ok(match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().context("unrepresentable number")?)
            }
        }
        Value::String(s) => Sql::Text(s.clone()),
        other => bail!("unsupported value type for column update: {other}"),
    })
}
