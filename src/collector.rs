//! Collector (C5): walks configured candidate paths for crontab files and
//! spins up a [`Watcher`] for every file it hasn't seen before. Removal and
//! modification of already-observed files is the Watcher's job, not ours.

use crate::dispatcher::{Action, DispatcherHandle};
use crate::schedule::ReloadSchedule;
use crate::status::StatusAggregator;
use crate::watcher::Watcher;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Collector {
    paths: Vec<String>,
    dispatcher: DispatcherHandle,
    status: StatusAggregator,
    cancel: CancellationToken,
    watchers: Mutex<HashMap<String, Arc<Watcher>>>,
}

impl Collector {
    /// Performs the initial search-and-load pass (firing `@reboot` tasks
    /// in any crontab found) and marks the Aggregator ready once it's
    /// complete. `cancel` is the root shutdown token, handed down to every
    /// task execution so a running job is killed rather than outliving
    /// shutdown.
    pub async fn new(
        paths: Vec<String>,
        dispatcher: DispatcherHandle,
        status: StatusAggregator,
        cancel: CancellationToken,
    ) -> Arc<Collector> {
        let paths: Vec<String> = paths.iter().map(|p| clean(p)).collect();
        info!(?paths, "search crontab");

        let collector = Arc::new(Collector {
            paths,
            dispatcher,
            status: status.clone(),
            cancel,
            watchers: Mutex::new(HashMap::new()),
        });
        collector.search_and_load(true).await;
        status.finish_first_load();
        collector
    }

    async fn search_and_load(&self, on_reboot: bool) {
        for path in self.paths.clone() {
            self.check_recursive(&path, on_reboot).await;
        }
    }

    async fn check_recursive(&self, path: &str, on_reboot: bool) {
        let meta = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(_) => return,
        };

        if !meta.is_dir() {
            self.check_file(path, on_reboot).await;
            return;
        }

        let root = path.to_string();
        let files = tokio::task::spawn_blocking(move || walk_files(&root))
            .await
            .unwrap_or_else(|_| Vec::new());

        for file in files {
            self.check_file(&file, on_reboot).await;
        }
    }

    async fn check_file(&self, path: &str, on_reboot: bool) {
        {
            let watchers = self.watchers.lock().await;
            if watchers.contains_key(path) {
                return;
            }
        }

        let watcher = Watcher::new(
            path.to_string(),
            self.dispatcher.clone(),
            self.status.clone(),
            self.cancel.clone(),
            on_reboot,
        )
        .await;
        watcher.register().await;

        let mut watchers = self.watchers.lock().await;
        if watchers.contains_key(path) {
            watcher.close().await;
            return;
        }
        watchers.insert(path.to_string(), watcher);
    }

    /// Registers the collector's own periodic search on the Reload
    /// schedule. Must be called once, after construction.
    pub async fn register(self: &Arc<Self>) {
        let collector = self.clone();
        let action: Action = Arc::new(move || {
            let collector = collector.clone();
            Box::pin(async move {
                collector.search_and_load(false).await;
            })
        });
        self.dispatcher.add(ReloadSchedule, action).await;
    }
}

/// Lexically normalizes a path the way `filepath.Clean` does: collapses
/// repeated separators and resolves `.`/`..` components without touching
/// the filesystem.
fn clean(p: &str) -> String {
    let path = Path::new(p);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(out.components().next_back(), Some(Component::RootDir) | None) {
                    out.pop();
                } else if out.as_os_str().is_empty() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        ".".to_string()
    } else {
        out.to_string_lossy().into_owned()
    }
}

/// Recursively lists every regular file under `root` (or `root` itself if
/// it's a file). Best-effort: unreadable subdirectories are skipped with a
/// warning rather than failing the whole walk.
fn walk_files(root: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut stack = vec![PathBuf::from(root)];

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "search crontab");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => stack.push(path),
                Ok(ft) if ft.is_file() => found.push(path.to_string_lossy().into_owned()),
                _ => {}
            }
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::metrics::Metrics;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn clean_collapses_and_resolves() {
        assert_eq!(clean("/etc//cron.d/../crontab"), "/etc/crontab");
        assert_eq!(clean("./foo/./bar"), "foo/bar");
    }

    #[tokio::test]
    async fn finds_nested_crontab_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.crontab"), "@hourly echo a\n").unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("b.crontab"), "@daily echo b\n").unwrap();

        let dispatcher = Dispatcher::new();
        let handle = dispatcher.handle();
        let join = tokio::spawn(dispatcher.run());

        let status = StatusAggregator::new(Arc::new(Metrics::new("0", "x")));
        let collector = Collector::new(
            vec![dir.path().to_str().unwrap().to_string()],
            handle.clone(),
            status.clone(),
            CancellationToken::new(),
        )
        .await;
        collector.register().await;

        let snap = status.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].tasks.len() + snap[1].tasks.len(), 2);

        handle.stop().await;
        join.await.unwrap();
    }

    #[tokio::test]
    async fn missing_path_is_skipped_without_error() {
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.handle();
        let join = tokio::spawn(dispatcher.run());

        let status = StatusAggregator::new(Arc::new(Metrics::new("0", "x")));
        let collector = Collector::new(
            vec!["/nonexistent/path".to_string()],
            handle.clone(),
            status.clone(),
            CancellationToken::new(),
        )
        .await;
        collector.register().await;

        assert!(status.snapshot().is_empty());
        handle.stop().await;
        join.await.unwrap();
    }
}
