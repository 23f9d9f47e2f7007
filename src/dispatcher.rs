//! Dispatcher (C4): a single cooperative loop that fires due entries at
//! their scheduled instants and reschedules them, with add/remove/stop
//! accepted concurrently via a command channel.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::debug;

use crate::schedule::{ReloadSchedule, Schedule};

/// Opaque handle identifying a registered entry. Stable across reschedules;
/// only changes when the entry is removed and re-added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl EntryId {
    fn next() -> Self {
        EntryId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Anything the Dispatcher can compute a next-fire instant for. Implemented
/// for both real cron [`Schedule`]s and the minute-boundary
/// [`ReloadSchedule`] — a tagged enum rather than a trait object would work
/// too, but this keeps the Dispatcher decoupled from schedule internals.
pub trait DueSchedule: Send + Sync {
    fn next(&self, now: DateTime<Utc>) -> DateTime<Utc>;
}

impl DueSchedule for Schedule {
    fn next(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        Schedule::next(self, now)
    }
}

impl DueSchedule for ReloadSchedule {
    fn next(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        ReloadSchedule::next(self, now)
    }
}

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type Action = Arc<dyn Fn() -> BoxFuture + Send + Sync>;

struct Entry {
    id: EntryId,
    schedule: Box<dyn DueSchedule>,
    next_fire: DateTime<Utc>,
    action: Action,
}

enum Command {
    Add {
        schedule: Box<dyn DueSchedule>,
        action: Action,
        reply: oneshot::Sender<EntryId>,
    },
    Remove(EntryId),
    Stop(oneshot::Sender<()>),
}

/// A cloneable handle used to register/unregister entries and to stop the
/// dispatcher. The actual loop runs in `Dispatcher::run`.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl DispatcherHandle {
    /// Registers a new entry. Safe to call whether or not `run()` has
    /// started or has already stopped — in the latter case the entry is
    /// simply dropped (the command channel is closed).
    pub async fn add(&self, schedule: impl DueSchedule + 'static, action: Action) -> Option<EntryId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = Command::Add {
            schedule: Box::new(schedule),
            action,
            reply: reply_tx,
        };
        if self.tx.send(cmd).is_err() {
            return None;
        }
        reply_rx.await.ok()
    }

    /// Idempotent: removing an unknown or already-removed id is a no-op.
    pub fn remove(&self, id: EntryId) {
        let _ = self.tx.send(Command::Remove(id));
    }

    /// Signals the dispatcher to stop. The returned future resolves once
    /// every in-flight fired action has completed.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Stop(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

/// Owns the entry set and the cooperative firing loop. Create with `new`,
/// obtain a [`DispatcherHandle`] via `handle()`, then drive the loop with
/// `run().await` on its own task.
pub struct Dispatcher {
    entries: Vec<Entry>,
    rx: mpsc::UnboundedReceiver<Command>,
    handle: DispatcherHandle,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Dispatcher {
            entries: Vec::new(),
            rx,
            handle: DispatcherHandle { tx },
        }
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Runs the dispatch loop until `stop()` is called on a handle.
    /// Blocks (asynchronously) for the lifetime of the supervisor.
    pub async fn run(mut self) {
        let mut inflight = JoinSet::new();
        let mut stop_reply: Option<oneshot::Sender<()>> = None;

        loop {
            let sleep_until = self.earliest_fire();

            tokio::select! {
                _ = sleep_until_or_forever(sleep_until) => {
                    self.fire_due(&mut inflight);
                }
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(Command::Add { schedule, action, reply }) => {
                            let now = Utc::now();
                            let next_fire = schedule.next(now);
                            let id = EntryId::next();
                            self.entries.push(Entry { id, schedule, next_fire, action });
                            let _ = reply.send(id);
                        }
                        Some(Command::Remove(id)) => {
                            self.entries.retain(|e| e.id != id);
                        }
                        Some(Command::Stop(reply)) => {
                            stop_reply = Some(reply);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        debug!(inflight = inflight.len(), "dispatcher stopping, draining in-flight actions");
        while inflight.join_next().await.is_some() {}

        if let Some(reply) = stop_reply {
            let _ = reply.send(());
        }
    }

    fn earliest_fire(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().map(|e| e.next_fire).min()
    }

    fn fire_due(&mut self, inflight: &mut JoinSet<()>) {
        let now = Utc::now();
        let due: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.next_fire <= now)
            .map(|(i, _)| i)
            .collect();

        for i in due {
            let action = self.entries[i].action.clone();
            inflight.spawn(async move {
                action().await;
            });
            let fire_time = self.entries[i].next_fire;
            self.entries[i].next_fire = self.entries[i].schedule.next(fire_time);
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn sleep_until_or_forever(at: Option<DateTime<Utc>>) {
    match at {
        Some(at) => {
            let now = Utc::now();
            let dur = (at - now).to_std().unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(dur).await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    #[derive(Clone)]
    struct Immediate;
    impl DueSchedule for Immediate {
        fn next(&self, now: DateTime<Utc>) -> DateTime<Utc> {
            now + chrono::Duration::milliseconds(20)
        }
    }

    #[tokio::test]
    async fn fires_and_reschedules() {
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.handle();
        let join = tokio::spawn(dispatcher.run());

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let action: Action = Arc::new(move || {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
        });

        let id = handle.add(Immediate, action).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(120)).await;
        handle.remove(id);
        handle.stop().await;
        join.await.unwrap();

        assert!(counter.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn stop_waits_for_inflight() {
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.handle();
        let join = tokio::spawn(dispatcher.run());

        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        let action: Action = Arc::new(move || {
            let d = d.clone();
            Box::pin(async move {
                tokio::time::sleep(StdDuration::from_millis(50)).await;
                d.fetch_add(1, Ordering::SeqCst);
            })
        });
        handle.add(Immediate, action).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        handle.stop().await;
        join.await.unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.handle();
        let join = tokio::spawn(dispatcher.run());

        handle.remove(EntryId(9999));
        handle.remove(EntryId(9999));
        handle.stop().await;
        join.await.unwrap();
    }
}
