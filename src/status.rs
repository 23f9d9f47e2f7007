//! Status Aggregator (C8): tracks readiness, per-crontab load state, and
//! per-task execution history, and feeds the [`Metrics`](crate::metrics::Metrics)
//! registry as tasks load and run.

use crate::metrics::Metrics;
use crate::task::Task;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

/// Readiness state exposed on `/readyz`. Monotonic: once `Terminating`,
/// never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Loading,
    Ready,
    Terminating,
}

impl Readiness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Readiness::Loading => "loading",
            Readiness::Ready => "ok",
            Readiness::Terminating => "terminating",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub exit_code: i32,
    pub log: String,
}

#[derive(Debug, Clone, Default)]
struct CrontabStatus {
    running: u64,
    tasks: Vec<Task>,
}

#[derive(Debug, Clone)]
pub struct TaskWithStatus {
    pub task: Task,
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub path: String,
    pub tasks: Vec<TaskWithStatus>,
}

struct Inner {
    crontab: HashMap<String, CrontabStatus>,
    task: HashMap<u64, TaskStatus>,
    ready: Readiness,
}

/// Shared handle: cloning shares the same underlying state (an `Arc<Mutex<_>>`
/// internally) so every collector, watcher, and HTTP handler observes one
/// long-lived aggregator.
#[derive(Clone)]
pub struct StatusAggregator {
    inner: Arc<Mutex<Inner>>,
    metrics: Arc<Metrics>,
}

/// Returned by [`StatusAggregator::start_task`]: call with the process exit
/// code (or a negative sentinel on spawn failure) once the task is done.
pub struct TaskFinisher {
    agg: StatusAggregator,
    task: Task,
    started_at: DateTime<Utc>,
}

impl TaskFinisher {
    pub fn finish(self, exit_code: i32, log: String) {
        self.agg.finish_task(&self.task, self.started_at, exit_code, log);
    }
}

impl StatusAggregator {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        StatusAggregator {
            inner: Arc::new(Mutex::new(Inner {
                crontab: HashMap::new(),
                task: HashMap::new(),
                ready: Readiness::Loading,
            })),
            metrics,
        }
    }

    pub fn readiness(&self) -> Readiness {
        self.inner.lock().unwrap().ready
    }

    pub fn finish_first_load(&self) {
        self.inner.lock().unwrap().ready = Readiness::Ready;
    }

    pub fn start_terminating(&self) {
        self.inner.lock().unwrap().ready = Readiness::Terminating;
    }

    /// Replaces (or clears, if `loaded` is `None`) the crontab status for
    /// `path`, dropping per-task status for every non-`@reboot` task that
    /// is no longer present.
    fn set_crontab_status(&self, path: &str, loaded: Option<Vec<Task>>) -> Option<CrontabStatus> {
        let mut inner = self.inner.lock().unwrap();
        let previous = inner.crontab.remove(path);
        if let Some(prev) = &previous {
            for t in &prev.tasks {
                if !t.is_reboot || loaded.is_none() {
                    inner.task.remove(&t.id);
                }
            }
        }
        if let Some(tasks) = loaded {
            inner.crontab.insert(path.to_string(), CrontabStatus { running: 0, tasks });
        }
        previous
    }

    /// Call before parsing `path`; returns a closure to call with the
    /// parse result once it's known. Owns a clone of the aggregator, so it
    /// can be held across an `.await` without borrowing the caller.
    pub fn start_load(&self, path: String) -> impl FnOnce(Result<Vec<Task>, String>) + 'static {
        let start = std::time::Instant::now();
        let this = self.clone();
        move |result: Result<Vec<Task>, String>| {
            let duration = start.elapsed();
            match result {
                Ok(tasks) => {
                    let mut counts: HashMap<String, f64> = HashMap::new();
                    for t in &tasks {
                        *counts.entry(t.user.clone()).or_default() += 1.0;
                    }
                    for (user, count) in &counts {
                        this.metrics
                            .loaded_tasks
                            .with_label_values(&[&path, user])
                            .set(*count);
                    }
                    info!(path = %path, duration_ms = duration.as_millis(), tasks = tasks.len(), "loaded");
                    this.set_crontab_status(&path, Some(tasks));
                    this.metrics
                        .crontab_load
                        .with_label_values(&[&path, "success"])
                        .inc();
                    this.metrics
                        .crontab_load_duration
                        .with_label_values(&[&path, "success"])
                        .observe(duration.as_secs_f64());
                }
                Err(e) => {
                    error!(path = %path, duration_ms = duration.as_millis(), error = %e, "failed to load");
                    this.metrics
                        .crontab_load
                        .with_label_values(&[&path, "failure"])
                        .inc();
                    this.metrics
                        .crontab_load_duration
                        .with_label_values(&[&path, "failure"])
                        .observe(duration.as_secs_f64());
                }
            }
        }
    }

    pub fn unloaded(&self, path: &str) {
        let deleted = self.set_crontab_status(path, None);
        let n = deleted.map(|d| d.tasks.len()).unwrap_or(0);
        info!(path = %path, tasks = n, "unloaded");
    }

    /// Call when a task begins executing. Returns a [`TaskFinisher`] to
    /// report completion.
    pub fn start_task(&self, task: &Task) -> TaskFinisher {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(s) = inner.crontab.get_mut(&task.source) {
                s.running += 1;
                self.metrics
                    .running_tasks
                    .with_label_values(&[&task.source, &task.user])
                    .inc();
            }
        }

        self.metrics
            .task_started
            .with_label_values(&[&task.source, &task.spec, &task.user, &task.command, &task.stdin])
            .inc();

        info!(
            source = %task.source,
            schedule = %task.spec,
            user = %task.user,
            command = %task.command,
            "start"
        );

        TaskFinisher {
            agg: self.clone(),
            task: task.clone(),
            started_at: Utc::now(),
        }
    }

    fn finish_task(&self, task: &Task, started_at: DateTime<Utc>, exit_code: i32, log: String) {
        let duration = (Utc::now() - started_at).to_std().unwrap_or(Duration::ZERO);
        let exit_code_label = exit_code.to_string();

        self.metrics
            .task_finished
            .with_label_values(&[
                &task.source,
                &task.spec,
                &task.user,
                &task.command,
                &task.stdin,
                &exit_code_label,
            ])
            .inc();
        self.metrics
            .task_duration
            .with_label_values(&[
                &task.source,
                &task.spec,
                &task.user,
                &task.command,
                &task.stdin,
                &exit_code_label,
            ])
            .observe(duration.as_secs_f64());
        self.metrics
            .task_last_exit_code
            .with_label_values(&[&task.source, &task.spec, &task.user, &task.command, &task.stdin])
            .set(exit_code as f64);

        if exit_code == 0 {
            info!(source = %task.source, command = %task.command, exit_code, duration_ms = duration.as_millis(), "finish");
        } else {
            error!(source = %task.source, command = %task.command, exit_code, duration_ms = duration.as_millis(), "finish");
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.crontab.get_mut(&task.source) {
            if s.running > 0 {
                s.running -= 1;
                self.metrics
                    .running_tasks
                    .with_label_values(&[&task.source, &task.user])
                    .dec();
            }
        }
        inner.task.insert(
            task.id,
            TaskStatus { timestamp: started_at, duration, exit_code, log },
        );
    }

    /// A point-in-time snapshot of every loaded crontab and its tasks,
    /// sorted by path and then by canonical task line, for rendering on
    /// the status page.
    pub fn snapshot(&self) -> Vec<StatusSnapshot> {
        let inner = self.inner.lock().unwrap();
        let mut snapshots: Vec<StatusSnapshot> = inner
            .crontab
            .iter()
            .map(|(path, cs)| {
                let mut tasks: Vec<TaskWithStatus> = cs
                    .tasks
                    .iter()
                    .map(|t| TaskWithStatus {
                        task: t.clone(),
                        status: inner.task.get(&t.id).cloned(),
                    })
                    .collect();
                tasks.sort_by(|a, b| a.task.string().cmp(&b.task.string()));
                StatusSnapshot { path: path.clone(), tasks }
            })
            .collect();
        snapshots.sort_by(|a, b| a.path.cmp(&b.path));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Environ;

    fn sample_task(source: &str) -> Task {
        Task::parse(source, "@daily echo hi", Environ::new()).unwrap()
    }

    #[test]
    fn readiness_starts_loading_and_is_monotonic() {
        let agg = StatusAggregator::new(Arc::new(Metrics::new("0", "x")));
        assert_eq!(agg.readiness(), Readiness::Loading);
        agg.finish_first_load();
        assert_eq!(agg.readiness(), Readiness::Ready);
        agg.start_terminating();
        assert_eq!(agg.readiness(), Readiness::Terminating);
    }

    #[test]
    fn load_then_snapshot_contains_task() {
        let agg = StatusAggregator::new(Arc::new(Metrics::new("0", "x")));
        let t = sample_task("crontab-a");
        (agg.start_load("crontab-a".to_string()))(Ok(vec![t.clone()]));
        let snap = agg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].tasks.len(), 1);
        assert_eq!(snap[0].tasks[0].task.id, t.id);
        assert!(snap[0].tasks[0].status.is_none());
    }

    #[test]
    fn start_and_finish_task_records_status() {
        let agg = StatusAggregator::new(Arc::new(Metrics::new("0", "x")));
        let t = sample_task("crontab-a");
        (agg.start_load("crontab-a".to_string()))(Ok(vec![t.clone()]));

        let finisher = agg.start_task(&t);
        finisher.finish(0, "ok\n".to_string());

        let snap = agg.snapshot();
        let status = snap[0].tasks[0].status.as_ref().unwrap();
        assert_eq!(status.exit_code, 0);
        assert_eq!(status.log, "ok\n");
    }

    #[test]
    fn unloaded_drops_reboot_task_status_too() {
        let agg = StatusAggregator::new(Arc::new(Metrics::new("0", "x")));
        let mut env = Environ::new();
        env.set("ENABLE_USER_COLUMN=yes");
        let reboot = Task::parse("crontab-a", "@reboot root echo hi", env).unwrap();
        (agg.start_load("crontab-a".to_string()))(Ok(vec![reboot.clone()]));
        agg.unloaded("crontab-a");
        assert!(agg.snapshot().is_empty());
    }

    #[test]
    fn in_place_reload_preserves_reboot_task_status() {
        let agg = StatusAggregator::new(Arc::new(Metrics::new("0", "x")));
        let mut env = Environ::new();
        env.set("ENABLE_USER_COLUMN=yes");
        let reboot = Task::parse("crontab-a", "@reboot root echo hi", env).unwrap();
        (agg.start_load("crontab-a".to_string()))(Ok(vec![reboot.clone()]));
        agg.start_task(&reboot).finish(0, "hi\n".to_string());

        // Reloading with the same (still-present) reboot task must not drop
        // its recorded status.
        (agg.start_load("crontab-a".to_string()))(Ok(vec![reboot.clone()]));
        let snap = agg.snapshot();
        assert!(snap[0].tasks[0].status.is_some());
    }
}
