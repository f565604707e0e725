//! Cadence: a supervised async loop runtime plus an agent task scheduler.
//!
//! The runtime half ([`supervisor`], [`sleep`]) runs a service's independent
//! logical loops concurrently under a fail-fast policy, with every delay in
//! the system going through named, interruptible sleeps instead of raw
//! timers. The scheduler half ([`scheduler`], [`store`]) keeps a pool of
//! per-agent workers in sync with a persisted task table and drives each due
//! task through a small idle / in-progress / suspended state machine.

pub mod config;
pub mod scheduler;
pub mod sleep;
pub mod store;
pub mod supervisor;

pub use config::SchedulerConfig;
pub use scheduler::{
    AgentScheduler, CommandOutcome, CommandRegistry, CommandTable, CommandsFactory, TaskCommands,
};
pub use sleep::{Retry, SleeperRegistry, Waiter, WakeReason};
pub use store::{NewTask, RunSelector, Task, TaskResult, TaskState, TaskStore};
pub use supervisor::{LoopCtx, StopHandle, Supervisor};
