use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use chrono::{Days, Local, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};

/// Current float epoch seconds, the timestamp unit of the task table.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Lifecycle state of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    InProgress,
    Suspended,
}

impl TaskState {
    /// The string persisted in the `state` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::InProgress => "in_progress",
            TaskState::Suspended => "suspended",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(TaskState::Idle),
            "in_progress" => Ok(TaskState::InProgress),
            "suspended" => Ok(TaskState::Suspended),
            other => bail!("unknown task state '{other}'"),
        }
    }
}

/// Outcome recorded by the last execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    None,
    Success,
    Fail,
}

impl TaskResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskResult::None => "none",
            TaskResult::Success => "success",
            TaskResult::Fail => "fail",
        }
    }
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskResult {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            // The column defaults to an empty string before the first run.
            "" | "none" => Ok(TaskResult::None),
            "success" => Ok(TaskResult::Success),
            "fail" => Ok(TaskResult::Fail),
            other => bail!("unknown task result '{other}'"),
        }
    }
}

/// One persisted schedulable unit of work.
///
/// All tasks sharing an `agentname` are executed sequentially by one
/// worker. `time_of_day` ("HH:MM:SS") schedules a once-per-day trigger,
/// `interval` (seconds) a recurring one relative to `lasttime`; a task may
/// carry both, either, or neither.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub agentname: String,
    pub command: String,
    pub time_of_day: Option<String>,
    pub interval: Option<i64>,
    pub lasttime: Option<f64>,
    pub nexttime: f64,
    pub state: TaskState,
    pub result: TaskResult,
    pub lasterror: Option<String>,
}

impl Task {
    pub fn is_due(&self, now: f64) -> bool {
        self.nexttime <= now
    }

    /// Next trigger timestamp after a run that started at `now`:
    /// the earlier of the next `time_of_day` occurrence and
    /// `lasttime + interval`, each skipped when its field is unset.
    ///
    /// `None` means the task has no schedule at all: it is one-shot and
    /// leaves the rotation after a successful run.
    pub fn compute_nexttime(&self, now: f64) -> Result<Option<f64>> {
        let mut next = f64::INFINITY;
        if let Some(tod) = self.time_of_day.as_deref() {
            next = next.min(next_occurrence(tod, now)?);
        }
        if let Some(interval) = self.interval {
            let base = self.lasttime.unwrap_or(now);
            next = next.min(base + interval as f64);
        }
        if next.is_finite() {
            Ok(Some(next))
        } else {
            Ok(None)
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task #{} [{}] '{}' ({})",
            self.id, self.agentname, self.command, self.state
        )
    }
}

/// Timestamp of the next wall-clock occurrence of `time_of_day` (local
/// time): today if still ahead of `now`, otherwise tomorrow.
fn next_occurrence(time_of_day: &str, now: f64) -> Result<f64> {
    let tod = NaiveTime::parse_from_str(time_of_day, "%H:%M:%S")
        .with_context(|| format!("invalid time_of_day '{time_of_day}'"))?;
    let today = Local
        .timestamp_opt(now as i64, 0)
        .single()
        .context("timestamp out of range")?
        .date_naive();
    for day in 0..=1u64 {
        let date = today
            .checked_add_days(Days::new(day))
            .context("date out of range")?;
        // `earliest` skips local times that do not exist (DST gap).
        if let Some(dt) = Local.from_local_datetime(&date.and_time(tod)).earliest() {
            let ts = dt.timestamp() as f64;
            if ts >= now {
                return Ok(ts);
            }
        }
    }
    bail!("could not resolve next occurrence of '{time_of_day}'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn task() -> Task {
        Task {
            id: 1,
            agentname: "a".to_string(),
            command: "ping".to_string(),
            time_of_day: None,
            interval: None,
            lasttime: None,
            nexttime: 0.0,
            state: TaskState::Idle,
            result: TaskResult::None,
            lasterror: None,
        }
    }

    #[test]
    fn state_strings_round_trip() {
        for state in [TaskState::Idle, TaskState::InProgress, TaskState::Suspended] {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert!("bogus".parse::<TaskState>().is_err());
    }

    #[test]
    fn result_strings_round_trip_and_accept_empty() {
        for result in [TaskResult::None, TaskResult::Success, TaskResult::Fail] {
            assert_eq!(result.as_str().parse::<TaskResult>().unwrap(), result);
        }
        assert_eq!("".parse::<TaskResult>().unwrap(), TaskResult::None);
    }

    #[test]
    fn interval_schedules_relative_to_lasttime() {
        let mut t = task();
        t.interval = Some(5);
        t.lasttime = Some(1000.0);
        assert_eq!(t.compute_nexttime(1000.0).unwrap(), Some(1005.0));
    }

    #[test]
    fn interval_without_lasttime_uses_now() {
        let mut t = task();
        t.interval = Some(5);
        assert_eq!(t.compute_nexttime(2000.0).unwrap(), Some(2005.0));
    }

    #[test]
    fn no_schedule_fields_means_one_shot() {
        let t = task();
        assert_eq!(t.compute_nexttime(1000.0).unwrap(), None);
    }

    #[test]
    fn recompute_is_idempotent() {
        let mut t = task();
        t.interval = Some(60);
        t.lasttime = Some(5000.0);
        let a = t.compute_nexttime(5000.0).unwrap();
        let b = t.compute_nexttime(5000.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn time_of_day_lands_within_a_day() {
        let now = unix_now();
        let mut t = task();
        // One hour from now, so the next occurrence is today.
        let soon = Local::now() + chrono::Duration::hours(1);
        t.time_of_day = Some(format!(
            "{:02}:{:02}:{:02}",
            soon.hour(),
            soon.minute(),
            soon.second()
        ));
        let next = t.compute_nexttime(now).unwrap().unwrap();
        assert!(next >= now);
        assert!(next - now < 24.0 * 3600.0 + 60.0);
    }

    #[test]
    fn past_time_of_day_rolls_to_tomorrow() {
        let now = unix_now();
        let mut t = task();
        let earlier = Local::now() - chrono::Duration::hours(1);
        t.time_of_day = Some(format!(
            "{:02}:{:02}:{:02}",
            earlier.hour(),
            earlier.minute(),
            earlier.second()
        ));
        let next = t.compute_nexttime(now).unwrap().unwrap();
        assert!(next > now + 12.0 * 3600.0);
        assert!(next < now + 25.0 * 3600.0);
    }

    #[test]
    fn formula_takes_the_earlier_trigger() {
        let now = unix_now();
        let mut t = task();
        t.interval = Some(10);
        t.lasttime = Some(now);
        let soon = Local::now() + chrono::Duration::hours(2);
        t.time_of_day = Some(format!(
            "{:02}:{:02}:{:02}",
            soon.hour(),
            soon.minute(),
            soon.second()
        ));
        // Ten seconds beats two hours.
        let next = t.compute_nexttime(now).unwrap().unwrap();
        assert!((next - (now + 10.0)).abs() < 1.0);
    }

    #[test]
    fn invalid_time_of_day_is_reported() {
        let mut t = task();
        t.time_of_day = Some("25:99:00".to_string());
        assert!(t.compute_nexttime(unix_now()).is_err());
    }

    #[test]
    fn due_comparison() {
        let mut t = task();
        t.nexttime = 100.0;
        assert!(t.is_due(100.0));
        assert!(t.is_due(101.0));
        assert!(!t.is_due(99.0));
    }
}
