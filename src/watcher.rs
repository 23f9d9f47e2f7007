//! Watcher (C6): one per observed crontab file. Loads it, registers its
//! tasks with the Dispatcher, and re-polls its mtime on every Reload tick
//! to pick up edits.

use crate::crontab::parse_crontab;
use crate::dispatcher::{Action, DispatcherHandle, EntryId};
use crate::env::Environ;
use crate::executor;
use crate::schedule::ReloadSchedule;
use crate::status::StatusAggregator;
use crate::task::Task;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::error;

pub struct Watcher {
    path: String,
    dispatcher: DispatcherHandle,
    status: StatusAggregator,
    cancel: CancellationToken,
    state: Mutex<State>,
}

struct State {
    entries: Vec<EntryId>,
    observe_entry: Option<EntryId>,
    modtime: Option<SystemTime>,
}

impl Watcher {
    /// Constructs a watcher and performs its initial load. `on_reboot`
    /// controls whether `@reboot` tasks found in this first load fire.
    pub async fn new(
        path: String,
        dispatcher: DispatcherHandle,
        status: StatusAggregator,
        cancel: CancellationToken,
        on_reboot: bool,
    ) -> Arc<Watcher> {
        let watcher = Arc::new(Watcher {
            path,
            dispatcher,
            status,
            cancel,
            state: Mutex::new(State { entries: Vec::new(), observe_entry: None, modtime: None }),
        });
        watcher.load(on_reboot).await;
        watcher
    }

    async fn read_crontab(&self) -> Result<(Vec<Task>, SystemTime), String> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| e.to_string())?;
        let metadata = tokio::fs::metadata(&self.path).await.map_err(|e| e.to_string())?;
        let modified = metadata.modified().map_err(|e| e.to_string())?;
        let ct = parse_crontab(&self.path, &content, Environ::for_execution())
            .map_err(|e| format!("{}:{e}", self.path))?;
        Ok((ct.tasks, modified))
    }

    /// Reloads the file: read-and-parse, swap registered entries, notify
    /// the Aggregator. A read/parse failure leaves previously registered
    /// entries untouched — only a successful parse replaces them.
    async fn load(&self, on_reboot: bool) {
        let mut state = self.state.lock().await;
        let finish = self.status.start_load(self.path.clone());

        match self.read_crontab().await {
            Ok((tasks, modtime)) => {
                for id in state.entries.drain(..) {
                    self.dispatcher.remove(id);
                }

                let mut new_entries = Vec::with_capacity(tasks.len());
                for task in &tasks {
                    if task.is_reboot {
                        if on_reboot {
                            let t = task.clone();
                            let status = self.status.clone();
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                executor::run(&t, &status, &cancel).await;
                            });
                        }
                        continue;
                    }

                    let schedule = task
                        .schedule
                        .clone()
                        .expect("non-reboot task always carries a compiled schedule");
                    let action = make_action(task.clone(), self.status.clone(), self.cancel.clone());
                    if let Some(id) = self.dispatcher.add(schedule, action).await {
                        new_entries.push(id);
                    }
                }

                state.entries = new_entries;
                state.modtime = Some(modtime);
                drop(state);
                finish(Ok(tasks));
            }
            Err(e) => {
                drop(state);
                finish(Err(e));
            }
        }
    }

    /// Registers this watcher's own observation entry on the Reload
    /// schedule. Must be called once, after construction.
    pub async fn register(self: &Arc<Self>) {
        let watcher = self.clone();
        let action: Action = Arc::new(move || {
            let watcher = watcher.clone();
            Box::pin(async move {
                watcher.observe_tick().await;
            })
        });
        let id = self.dispatcher.add(ReloadSchedule, action).await;
        self.state.lock().await.observe_entry = id;
    }

    async fn observe_tick(self: &Arc<Self>) {
        match tokio::fs::metadata(&self.path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.close().await;
            }
            Err(e) => {
                error!(path = %self.path, error = %e, "failed to check crontab");
            }
            Ok(meta) => {
                let Ok(modified) = meta.modified() else { return };
                let stored = self.state.lock().await.modtime;
                if stored.map(|m| modified > m).unwrap_or(true) {
                    self.load(false).await;
                }
            }
        }
    }

    /// Unregisters every entry this watcher owns (including its own
    /// observation entry) and marks the Aggregator unloaded. Idempotent.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        for id in state.entries.drain(..) {
            self.dispatcher.remove(id);
        }
        if let Some(id) = state.observe_entry.take() {
            self.dispatcher.remove(id);
        }
        drop(state);
        self.status.unloaded(&self.path);
    }
}

fn make_action(task: Task, status: StatusAggregator, cancel: CancellationToken) -> Action {
    Arc::new(move || {
        let task = task.clone();
        let status = status.clone();
        let cancel = cancel.clone();
        Box::pin(async move {
            executor::run(&task, &status, &cancel).await;
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::metrics::Metrics;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_crontab(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[tokio::test]
    async fn loads_file_and_registers_tasks() {
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.handle();
        let join = tokio::spawn(dispatcher.run());

        let status = StatusAggregator::new(Arc::new(Metrics::new("0", "x")));
        let file = write_crontab("@hourly echo hi\n");
        let path = file.path().to_str().unwrap().to_string();

        let watcher =
            Watcher::new(path.clone(), handle.clone(), status.clone(), CancellationToken::new(), true).await;
        watcher.register().await;

        let snap = status.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].tasks.len(), 1);

        watcher.close().await;
        handle.stop().await;
        join.await.unwrap();

        assert!(status.snapshot().is_empty());
    }

    #[tokio::test]
    async fn reboot_task_fires_only_on_first_load() {
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.handle();
        let join = tokio::spawn(dispatcher.run());

        let status = StatusAggregator::new(Arc::new(Metrics::new("0", "x")));
        let mut env_line = String::from("ENABLE_USER_COLUMN=yes\n");
        env_line.push_str("@reboot root echo booted\n");
        let file = write_crontab(&env_line);
        let path = file.path().to_str().unwrap().to_string();

        let watcher =
            Watcher::new(path, handle.clone(), status.clone(), CancellationToken::new(), false).await;
        watcher.close().await;
        handle.stop().await;
        join.await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_reports_load_failure_without_panicking() {
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.handle();
        let join = tokio::spawn(dispatcher.run());

        let status = StatusAggregator::new(Arc::new(Metrics::new("0", "x")));
        let watcher = Watcher::new(
            "/nonexistent/path/to/crontab".to_string(),
            handle.clone(),
            status.clone(),
            CancellationToken::new(),
            true,
        )
        .await;
        assert!(status.snapshot().is_empty());

        watcher.close().await;
        handle.stop().await;
        join.await.unwrap();
    }
}
