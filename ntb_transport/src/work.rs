//! Delayed work scheduler.
//!
//! Link announcements and link event notifications run as keyed delayed
//! work items on one thread per transport device. At most one item per key
//! is pending at a time: scheduling a key that is already pending does
//! nothing, the way a delayed work item in a kernel workqueue behaves.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::error::Result;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Pending {
    deadline: Instant,
    job: Job,
}

struct State<K> {
    pending: BTreeMap<K, Pending>,
    running: Option<K>,
    shutdown: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    cond: Condvar,
}

/// Runs keyed jobs after a delay on a dedicated thread.
pub struct Scheduler<K> {
    inner: Arc<Inner<K>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl<K> Scheduler<K>
where
    K: Ord + Copy + std::fmt::Debug + Send + 'static,
{
    /// Start the scheduler thread.
    pub fn new(name: &str) -> Result<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                pending: BTreeMap::new(),
                running: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let worker = inner.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&worker))?;
        let thread_id = handle.thread().id();

        Ok(Self {
            inner,
            thread: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    /// Run `job` after `delay` unless `key` is already pending.
    ///
    /// Returns false if the key was already pending.
    pub fn schedule<F>(&self, key: K, delay: Duration, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.shutdown || state.pending.contains_key(&key) {
            return false;
        }
        trace!("work {:?} scheduled in {:?}", key, delay);
        state.pending.insert(
            key,
            Pending {
                deadline: Instant::now() + delay,
                job: Box::new(job),
            },
        );
        self.inner.cond.notify_all();
        true
    }

    /// Run `job` after `delay`, replacing a pending item with the same key.
    pub fn reschedule<F>(&self, key: K, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return;
        }
        state.pending.insert(
            key,
            Pending {
                deadline: Instant::now() + delay,
                job: Box::new(job),
            },
        );
        self.inner.cond.notify_all();
    }

    /// Drop a pending item and wait for a running one with the same key.
    ///
    /// From a job on the scheduler thread itself the running item is not
    /// waited for.
    pub fn cancel_sync(&self, key: K) {
        let mut state = self.inner.state.lock();
        state.pending.remove(&key);
        if thread::current().id() == self.thread_id {
            return;
        }
        while state.running == Some(key) {
            self.inner.cond.wait(&mut state);
        }
    }

    /// Drop every pending item matching `pred` and wait for a running one.
    pub fn cancel_matching_sync(&self, pred: impl Fn(&K) -> bool) {
        let mut state = self.inner.state.lock();
        state.pending.retain(|key, _| !pred(key));
        if thread::current().id() == self.thread_id {
            return;
        }
        while state.running.as_ref().is_some_and(&pred) {
            self.inner.cond.wait(&mut state);
        }
    }

    /// Drop all pending items and stop the thread.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            self.inner.cond.notify_all();
            std::mem::take(&mut state.pending)
        };
        // Jobs may own handles whose drop takes other locks.
        drop(dropped);

        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<K> Drop for Scheduler<K> {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            self.inner.cond.notify_all();
        }
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.thread.get_mut().take() {
            let _ = handle.join();
        }
    }
}

fn run<K: Ord + Copy>(inner: &Inner<K>) {
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            break;
        }

        let next = state
            .pending
            .iter()
            .min_by_key(|(_, pending)| pending.deadline)
            .map(|(key, pending)| (*key, pending.deadline));

        let Some((key, deadline)) = next else {
            inner.cond.wait(&mut state);
            continue;
        };
        if deadline > Instant::now() {
            inner.cond.wait_until(&mut state, deadline);
            continue;
        }

        let Some(pending) = state.pending.remove(&key) else {
            continue;
        };
        state.running = Some(key);
        drop(state);

        (pending.job)();

        state = inner.state.lock();
        state.running = None;
        inner.cond.notify_all();
    }
    state.pending.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wait_for(pred: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_runs_after_delay() {
        let scheduler = Scheduler::new("test-work").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let start = Instant::now();
        assert!(scheduler.schedule(1u32, Duration::from_millis(20), move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_schedule_is_noop_while_pending() {
        let scheduler = Scheduler::new("test-work").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = hits.clone();
            scheduler.schedule(7u32, Duration::from_millis(30), move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(wait_for(|| hits.load(Ordering::SeqCst) >= 1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reschedule_replaces() {
        let scheduler = Scheduler::new("test-work").unwrap();
        let value = Arc::new(AtomicUsize::new(0));
        let v = value.clone();
        scheduler.schedule(1u32, Duration::from_secs(60), move || {
            v.store(1, Ordering::SeqCst);
        });
        let v = value.clone();
        scheduler.reschedule(1u32, Duration::ZERO, move || {
            v.store(2, Ordering::SeqCst);
        });
        assert!(wait_for(|| value.load(Ordering::SeqCst) == 2));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(value.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_pending() {
        let scheduler = Scheduler::new("test-work").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        scheduler.schedule(3u32, Duration::from_millis(20), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.cancel_sync(3);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_waits_for_running_job() {
        let scheduler = Scheduler::new("test-work").unwrap();
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (s, f) = (started.clone(), finished.clone());
        scheduler.schedule(9u32, Duration::ZERO, move || {
            s.store(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            f.store(1, Ordering::SeqCst);
        });
        assert!(wait_for(|| started.load(Ordering::SeqCst) == 1));
        scheduler.cancel_sync(9);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_matching() {
        let scheduler = Scheduler::new("test-work").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for key in [(0usize, 0u8), (0, 1), (1, 0)] {
            let h = hits.clone();
            scheduler.schedule(key, Duration::from_millis(20), move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        scheduler.cancel_matching_sync(|&(queue, _)| queue == 0);
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_drops_pending() {
        let scheduler = Scheduler::new("test-work").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        scheduler.schedule(1u32, Duration::from_millis(10), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.shutdown();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!scheduler.schedule(1u32, Duration::ZERO, || {}));
    }
}
