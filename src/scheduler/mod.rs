//! Named periodic tasks.
//!
//! Schedules are cron-like strings, but only the four shapes the system
//! uses are accepted: `*/N * * * *` (every N minutes), `0 * * * *`
//! (hourly), `0 */N * * *` (every N hours), and `0 0 * * *` (daily).
//! Anything else is a parse error; this is not a general cron engine.
//!
//! Each task runs on its own tokio loop. A run that is still going when
//! the next tick fires is skipped, never overlapped.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub type TaskHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    EveryMinutes(u32),
    Hourly,
    EveryHours(u32),
    Daily,
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::InvalidSchedule(expr.to_string()));
        }

        let parse_step = |field: &str, max: u32| -> Option<u32> {
            let n: u32 = field.strip_prefix("*/")?.parse().ok()?;
            (n >= 1 && n <= max).then_some(n)
        };

        match (fields[0], fields[1], fields[2], fields[3], fields[4]) {
            (minute, "*", "*", "*", "*") if minute.starts_with("*/") => parse_step(minute, 59)
                .map(Schedule::EveryMinutes)
                .ok_or_else(|| Error::InvalidSchedule(expr.to_string())),
            ("0", "*", "*", "*", "*") => Ok(Schedule::Hourly),
            ("0", hour, "*", "*", "*") if hour.starts_with("*/") => parse_step(hour, 23)
                .map(Schedule::EveryHours)
                .ok_or_else(|| Error::InvalidSchedule(expr.to_string())),
            ("0", "0", "*", "*", "*") => Ok(Schedule::Daily),
            _ => Err(Error::InvalidSchedule(expr.to_string())),
        }
    }

    pub fn period(&self) -> Duration {
        match self {
            Schedule::EveryMinutes(n) => Duration::from_secs(u64::from(*n) * 60),
            Schedule::Hourly => Duration::from_secs(3600),
            Schedule::EveryHours(n) => Duration::from_secs(u64::from(*n) * 3600),
            Schedule::Daily => Duration::from_secs(86_400),
        }
    }
}

struct Task {
    name: String,
    raw_schedule: String,
    schedule: Schedule,
    handler: TaskHandler,
    enabled: AtomicBool,
    running: tokio::sync::Mutex<()>,
    last_run: parking_lot::Mutex<Option<DateTime<Utc>>>,
    next_run: parking_lot::Mutex<Option<DateTime<Utc>>>,
    last_error: parking_lot::Mutex<Option<String>>,
}

impl Task {
    async fn run(&self) -> Result<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        let Ok(_guard) = self.running.try_lock() else {
            debug!(task = %self.name, "Previous run still in progress, skipping");
            return Ok(());
        };

        *self.last_run.lock() = Some(Utc::now());
        debug!(task = %self.name, "Task starting");
        let result = (self.handler)().await;
        match &result {
            Ok(()) => {
                *self.last_error.lock() = None;
            },
            Err(e) => {
                warn!(task = %self.name, "Task failed: {e}");
                *self.last_error.lock() = Some(e.to_string());
            },
        }
        result
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct Scheduler {
    tasks: DashMap<String, Arc<Task>>,
    shutdown: tokio::sync::broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = tokio::sync::broadcast::channel(1);
        Self {
            tasks: DashMap::new(),
            shutdown,
        }
    }

    /// Register a named task. The schedule must be one of the four
    /// accepted patterns.
    pub fn register(&self, name: &str, schedule: &str, handler: TaskHandler) -> Result<()> {
        let parsed = Schedule::parse(schedule)?;
        let task = Arc::new(Task {
            name: name.to_string(),
            raw_schedule: schedule.to_string(),
            schedule: parsed,
            handler,
            enabled: AtomicBool::new(true),
            running: tokio::sync::Mutex::new(()),
            last_run: parking_lot::Mutex::new(None),
            next_run: parking_lot::Mutex::new(None),
            last_error: parking_lot::Mutex::new(None),
        });
        self.tasks.insert(name.to_string(), task);
        info!(task = name, schedule, "Task registered");
        Ok(())
    }

    /// Spawn the per-task loops. The first firing is one full period out.
    pub fn start(&self) {
        for entry in self.tasks.iter() {
            let task = entry.value().clone();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                let period = task.schedule.period();
                let chrono_period = chrono::Duration::from_std(period)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
                let mut ticker = tokio::time::interval_at(
                    tokio::time::Instant::now() + period,
                    period,
                );
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                *task.next_run.lock() = Some(Utc::now() + chrono_period);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let _ = task.run().await;
                            *task.next_run.lock() = Some(Utc::now() + chrono_period);
                        },
                        _ = shutdown.recv() => {
                            debug!(task = %task.name, "Task loop stopped");
                            break;
                        },
                    }
                }
            });
        }
        info!(tasks = self.tasks.len(), "Scheduler started");
    }

    /// Enable or disable a task. Returns false for unknown names.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.tasks.get(name) {
            Some(task) => {
                task.enabled.store(enabled, Ordering::Relaxed);
                true
            },
            None => false,
        }
    }

    /// Run a task immediately, outside its schedule.
    pub async fn trigger_now(&self, name: &str) -> Result<()> {
        let task = self
            .tasks
            .get(name)
            .map(|t| t.clone())
            .ok_or_else(|| Error::Server(format!("unknown task: {name}")))?;
        task.run().await
    }

    pub fn status(&self) -> Vec<TaskStatus> {
        let mut statuses: Vec<TaskStatus> = self
            .tasks
            .iter()
            .map(|entry| {
                let task = entry.value();
                TaskStatus {
                    name: task.name.clone(),
                    schedule: task.raw_schedule.clone(),
                    enabled: task.enabled.load(Ordering::Relaxed),
                    running: task.running.try_lock().is_err(),
                    last_run: *task.last_run.lock(),
                    next_run: *task.next_run.lock(),
                    last_error: task.last_error.lock().clone(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Signal task loops to stop. In-flight runs are not interrupted;
    /// they detach and finish on their own.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn parses_the_four_accepted_patterns() {
        assert_eq!(Schedule::parse("*/5 * * * *").unwrap(), Schedule::EveryMinutes(5));
        assert_eq!(Schedule::parse("0 * * * *").unwrap(), Schedule::Hourly);
        assert_eq!(Schedule::parse("0 */12 * * *").unwrap(), Schedule::EveryHours(12));
        assert_eq!(Schedule::parse("0 0 * * *").unwrap(), Schedule::Daily);
    }

    #[test]
    fn rejects_everything_else() {
        for expr in [
            "* * * * *",
            "15 3 * * *",
            "*/0 * * * *",
            "*/70 * * * *",
            "0 */25 * * *",
            "0 0 1 * *",
            "0 0 * * 1",
            "not a cron",
            "*/5 * * *",
        ] {
            assert!(
                matches!(Schedule::parse(expr), Err(Error::InvalidSchedule(_))),
                "{expr} should be rejected"
            );
        }
    }

    #[test]
    fn periods() {
        assert_eq!(Schedule::EveryMinutes(5).period(), Duration::from_secs(300));
        assert_eq!(Schedule::Hourly.period(), Duration::from_secs(3600));
        assert_eq!(Schedule::EveryHours(12).period(), Duration::from_secs(43_200));
        assert_eq!(Schedule::Daily.period(), Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn trigger_now_runs_handler() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        scheduler
            .register(
                "touch",
                "0 * * * *",
                Arc::new(move || {
                    let c = c.clone();
                    Box::pin(async move {
                        c.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    })
                }),
            )
            .unwrap();

        scheduler.trigger_now("touch").await.unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert!(scheduler.trigger_now("missing").await.is_err());
    }

    #[tokio::test]
    async fn disabled_task_does_not_run() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        scheduler
            .register(
                "idle",
                "0 * * * *",
                Arc::new(move || {
                    let c = c.clone();
                    Box::pin(async move {
                        c.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    })
                }),
            )
            .unwrap();

        assert!(scheduler.set_enabled("idle", false));
        scheduler.trigger_now("idle").await.unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 0);

        assert!(!scheduler.set_enabled("missing", false));
    }

    #[tokio::test]
    async fn status_reports_registration() {
        let scheduler = Scheduler::new();
        scheduler
            .register("a-task", "*/5 * * * *", Arc::new(|| Box::pin(async { Ok(()) })))
            .unwrap();

        let status = scheduler.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].name, "a-task");
        assert_eq!(status[0].schedule, "*/5 * * * *");
        assert!(status[0].enabled);
        assert!(!status[0].running);
        assert!(status[0].last_run.is_none());
    }

    #[tokio::test]
    async fn failing_handler_records_error() {
        let scheduler = Scheduler::new();
        scheduler
            .register(
                "broken",
                "0 * * * *",
                Arc::new(|| Box::pin(async { Err(Error::Server("boom".to_string())) })),
            )
            .unwrap();

        assert!(scheduler.trigger_now("broken").await.is_err());
        let status = scheduler.status();
        assert!(status[0].last_error.as_deref().unwrap_or("").contains("boom"));
    }
}
