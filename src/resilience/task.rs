//! Background tasks for async and deadline-bound dispatch.
//!
//! # Design Decisions
//! - One OS thread per offloaded request, capped by the tracker's limit; the
//!   spawner never joins it
//! - Every task holds a tracker guard, so completion is observable even when
//!   nobody waits for the result
//! - Cancellation is a flag checked between handler invocations
//! - A failed or refused spawn hands the payload back instead of losing it
//! - The deadline handoff is a zero-capacity channel: a value either reaches
//!   the waiter or comes back to the task, never both and never neither

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, SendError, Sender};

use crate::observability::metrics;

#[derive(Default)]
struct TrackerInner {
    in_flight: AtomicUsize,
    /// 0 means unbounded.
    limit: usize,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

/// Counts background tasks that have been spawned but not yet finished.
#[derive(Clone, Default)]
pub struct TaskTracker {
    inner: Arc<TrackerInner>,
}

impl TaskTracker {
    /// A tracker without a ceiling.
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker that refuses new tasks once `limit` are in flight.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                limit,
                ..TrackerInner::default()
            }),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> Option<usize> {
        (self.inner.limit > 0).then_some(self.inner.limit)
    }

    /// Block until no task is in flight or `timeout` passes.
    /// Returns whether the tracker went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.idle_lock.lock().expect("task tracker mutex poisoned");
        while self.in_flight() > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = self
                .inner
                .idle
                .wait_timeout(guard, deadline - now)
                .expect("task tracker mutex poisoned")
                .0;
        }
        true
    }

    fn try_enter(&self) -> Option<TaskGuard> {
        let limit = self.inner.limit;
        let previous = self
            .inner
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (limit == 0 || n < limit).then_some(n + 1)
            })
            .ok()?;
        metrics::set_async_tasks_in_flight(previous + 1);
        Some(TaskGuard {
            inner: Arc::clone(&self.inner),
        })
    }
}

impl std::fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTracker")
            .field("in_flight", &self.in_flight())
            .field("limit", &self.limit())
            .finish()
    }
}

/// Decrements the in-flight count when the task ends, however it ends.
struct TaskGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let remaining = self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::set_async_tasks_in_flight(remaining);
        if remaining == 0 {
            // Taking the lock orders this wake after a waiter's count check.
            let _guard = self.inner.idle_lock.lock().expect("task tracker mutex poisoned");
            self.inner.idle.notify_all();
        }
    }
}

/// Cooperative cancellation flag shared between spawner and task.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle to a spawned background task.
#[derive(Debug)]
pub struct AsyncTask {
    cancel: CancelFlag,
}

impl AsyncTask {
    /// Ask the task to stop before its next handler and drop its result.
    pub fn detach(self) {
        self.cancel.cancel();
    }
}

/// Create a one-shot rendezvous between a background task and a
/// deadline-bound waiter.
///
/// Whichever side loses the race keeps the value: a delivery after the
/// waiter gave up is handed back to the task.
pub fn handoff<T>() -> (Handoff<T>, HandoffWaiter<T>) {
    let (tx, rx) = crossbeam_channel::bounded(0);
    (Handoff { tx }, HandoffWaiter { rx })
}

/// Delivering side of [`handoff`].
pub struct Handoff<T> {
    tx: Sender<T>,
}

impl<T> Handoff<T> {
    /// Deliver `value`, blocking until the waiter takes it. Returns it back
    /// if the waiter already gave up.
    pub fn deliver(self, value: T) -> Result<(), T> {
        self.tx.send(value).map_err(|SendError(value)| value)
    }
}

/// Waiting side of [`handoff`].
pub struct HandoffWaiter<T> {
    rx: Receiver<T>,
}

impl<T> HandoffWaiter<T> {
    /// Wait for a delivery until `deadline`; on expiry the handoff is
    /// abandoned and `None` is returned.
    pub fn wait_until(self, deadline: Instant) -> Option<T> {
        self.rx.recv_deadline(deadline).ok()
    }
}

/// Spawning failed or was refused; the payload is returned untouched.
#[derive(Debug)]
pub struct SpawnError<T> {
    pub payload: T,
    pub source: io::Error,
}

/// Run `work(payload, cancel)` on a new thread tracked by `tracker`.
pub fn spawn<T, F>(tracker: &TaskTracker, payload: T, work: F) -> Result<AsyncTask, SpawnError<T>>
where
    T: Send + 'static,
    F: FnOnce(T, CancelFlag) + Send + 'static,
{
    let Some(guard) = tracker.try_enter() else {
        return Err(SpawnError {
            payload,
            source: io::Error::new(io::ErrorKind::WouldBlock, "background task limit reached"),
        });
    };

    let cancel = CancelFlag::default();
    let slot = Arc::new(Mutex::new(Some(payload)));
    let task_slot = Arc::clone(&slot);
    let task_cancel = cancel.clone();
    let spawned = thread::Builder::new()
        .name("stackserve-task".to_string())
        .spawn(move || {
            let _guard = guard;
            let payload = task_slot.lock().expect("task slot mutex poisoned").take();
            if let Some(payload) = payload {
                work(payload, task_cancel);
            }
        });

    match spawned {
        Ok(_) => Ok(AsyncTask { cancel }),
        Err(source) => {
            // The closure (and its guard) was dropped, so the slot is untouched.
            match slot.lock().expect("task slot mutex poisoned").take() {
                Some(payload) => Err(SpawnError { payload, source }),
                None => Ok(AsyncTask { cancel }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn tracker_follows_task_lifetime() {
        let tracker = TaskTracker::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let task = spawn(&tracker, release_rx, |rx, _cancel| {
            let _ = rx.recv();
        })
        .unwrap();
        assert_eq!(tracker.in_flight(), 1);
        assert!(!tracker.wait_idle(Duration::from_millis(20)));

        release_tx.send(()).unwrap();
        assert!(tracker.wait_idle(Duration::from_secs(5)));
        assert_eq!(tracker.in_flight(), 0);
        drop(task);
    }

    #[test]
    fn limit_refuses_and_returns_the_payload() {
        let tracker = TaskTracker::with_limit(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let _task = spawn(&tracker, release_rx, |rx, _cancel| {
            let _ = rx.recv();
        })
        .unwrap();

        let refused = spawn(&tracker, "payload", |_, _| {}).unwrap_err();
        assert_eq!(refused.payload, "payload");
        assert_eq!(refused.source.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(tracker.in_flight(), 1);

        release_tx.send(()).unwrap();
        assert!(tracker.wait_idle(Duration::from_secs(5)));
        assert!(spawn(&tracker, (), |_, _| {}).is_ok(), "slot frees up");
        assert!(tracker.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn detach_sets_the_cancel_flag() {
        let tracker = TaskTracker::new();
        let (seen_tx, seen_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();

        let task = spawn(&tracker, (), move |(), cancel| {
            let _ = go_rx.recv();
            let _ = seen_tx.send(cancel.is_cancelled());
        })
        .unwrap();

        task.detach();
        go_tx.send(()).unwrap();
        assert!(seen_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(tracker.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn handoff_delivers_before_deadline() {
        let (sender, waiter) = handoff();
        let worker = thread::spawn(move || sender.deliver(7));

        let value = waiter.wait_until(Instant::now() + Duration::from_secs(5));
        assert_eq!(value, Some(7));
        assert!(worker.join().unwrap().is_ok());
    }

    #[test]
    fn early_delivery_waits_for_the_waiter() {
        let (sender, waiter) = handoff();
        let worker = thread::spawn(move || sender.deliver("early"));

        thread::sleep(Duration::from_millis(20));
        let value = waiter.wait_until(Instant::now() + Duration::from_secs(5));
        assert_eq!(value, Some("early"));
        assert!(worker.join().unwrap().is_ok());
    }

    #[test]
    fn late_delivery_is_handed_back() {
        let (sender, waiter) = handoff();
        assert_eq!(waiter.wait_until(Instant::now()), None);
        assert_eq!(sender.deliver("late"), Err("late"));
    }

    #[test]
    fn panicking_task_still_leaves_the_tracker() {
        let tracker = TaskTracker::new();
        spawn(&tracker, (), |(), _| panic!("task failure")).unwrap();
        assert!(tracker.wait_idle(Duration::from_secs(5)));
    }
}
