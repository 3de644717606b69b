//! Cron-style recurring work: the hourly import over every configured target
//! and the daily retention sweep.
//!
//! [`Scheduler`] is a table of named tasks. Starting, stopping and
//! [`Scheduler::due_tasks`] are pure operations on that table given a
//! [`Clock`]; [`Scheduler::tick`] runs whatever is due and [`Scheduler::run`]
//! calls it on an interval until cancelled.

pub mod cleanup;
pub mod cron;
pub mod targets;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::cron::Schedule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;

pub use cleanup::RetentionCleanup;
pub use targets::{ImportTarget, TargetRunner};

pub const HOURLY_IMPORT: &str = "hourly-import";
pub const DAILY_CLEANUP: &str = "daily-cleanup";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
pub trait ScheduledAction: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}

struct Entry {
    expression: String,
    schedule: Schedule,
    action: Arc<dyn ScheduledAction>,
    running: bool,
    last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub schedule: String,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    tasks: Mutex<BTreeMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Entry>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add or replace a task. New tasks start stopped.
    pub fn register(
        &self,
        name: &str,
        expression: &str,
        action: Arc<dyn ScheduledAction>,
    ) -> Result<(), SchedulerError> {
        let schedule = cron::parse_schedule(expression)?;
        self.lock().insert(
            name.to_string(),
            Entry {
                expression: expression.trim().to_string(),
                schedule,
                action,
                running: false,
                last_run: None,
            },
        );
        Ok(())
    }

    /// Start a task. Ticks before now are not replayed.
    pub fn start(&self, name: &str) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        let mut tasks = self.lock();
        let entry = tasks
            .get_mut(name)
            .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))?;
        if !entry.running {
            entry.running = true;
            entry.last_run = Some(entry.last_run.map_or(now, |last| last.max(now)));
        }
        Ok(())
    }

    pub fn stop(&self, name: &str) -> Result<(), SchedulerError> {
        let mut tasks = self.lock();
        let entry = tasks
            .get_mut(name)
            .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))?;
        entry.running = false;
        Ok(())
    }

    pub fn start_all(&self) {
        let names: Vec<String> = self.lock().keys().cloned().collect();
        for name in names {
            // Names come from the table itself.
            let _ = self.start(&name);
        }
        tracing::info!("All scheduled tasks started");
    }

    pub fn status(&self) -> Vec<TaskStatus> {
        let now = self.clock.now();
        self.lock()
            .iter()
            .map(|(name, entry)| TaskStatus {
                name: name.clone(),
                schedule: entry.expression.clone(),
                running: entry.running,
                last_run: entry.last_run,
                next_run: entry
                    .running
                    .then(|| entry.schedule.after(&now).next())
                    .flatten(),
            })
            .collect()
    }

    /// Names of running tasks with a tick in `(last_run, now]`.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, e)| e.running && cron::is_cron_due(&e.schedule, now, e.last_run))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Run every due task once, in name order. Returns how many ran.
    pub async fn tick(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<(String, Arc<dyn ScheduledAction>)> = {
            let mut tasks = self.lock();
            tasks
                .iter_mut()
                .filter(|(_, e)| e.running && cron::is_cron_due(&e.schedule, now, e.last_run))
                .map(|(name, e)| {
                    e.last_run = Some(now);
                    (name.clone(), e.action.clone())
                })
                .collect()
        };

        for (name, action) in &due {
            tracing::info!(task = %name, "Running scheduled task");
            match action.run().await {
                Ok(()) => tracing::info!(task = %name, "Scheduled task finished"),
                Err(e) => tracing::error!(task = %name, "Scheduled task failed: {e:#}"),
            }
        }
        due.len()
    }

    /// Tick every `poll_interval` until `cancel` fires.
    pub async fn run(&self, poll_interval: Duration, cancel: CancellationToken) {
        tracing::info!("Scheduler started, polling every {poll_interval:?}");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.tick() => {}
            }
        }
        tracing::info!("Scheduler stopped");
    }
}
