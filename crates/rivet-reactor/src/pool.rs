//! Pool of worker threads, each hosting exactly one event loop.
//!
//! The pool never owns the base loop; it only hands out handles. With zero
//! workers every consumer lands back on the base loop, which keeps
//! single-threaded deployments free of extra machinery.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use rivet_core::{Error, Result};

use crate::event_loop::{EventLoop, LoopHandle};

/// Callback run on each worker thread before its loop starts.
pub type LoopInit = Arc<dyn Fn(&EventLoop) + Send + Sync>;

struct PoolInner {
    workers: Vec<LoopHandle>,
    threads: Vec<JoinHandle<()>>,
}

/// N worker threads, one event loop each, plus round-robin distribution.
pub struct EventLoopPool {
    base: LoopHandle,
    name: String,
    inner: Mutex<PoolInner>,
    next: AtomicUsize,
    started: AtomicBool,
}

impl EventLoopPool {
    /// Creates an empty pool that falls back to `base` until started.
    pub fn new(base: LoopHandle, name: impl Into<String>) -> Self {
        EventLoopPool {
            base,
            name: name.into(),
            inner: Mutex::new(PoolInner { workers: Vec::new(), threads: Vec::new() }),
            next: AtomicUsize::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns `n` worker threads. Each constructs its own loop, runs
    /// `init` if given, signals readiness, and enters the loop.
    pub fn start(&self, n: usize, init: Option<LoopInit>) -> Result<()> {
        assert!(!self.started.swap(true, Ordering::AcqRel), "pool already started");
        let mut inner = self.inner.lock();
        for i in 0..n {
            let ready: Arc<(Mutex<Option<Result<LoopHandle>>>, Condvar)> =
                Arc::new((Mutex::new(None), Condvar::new()));
            let signal = Arc::clone(&ready);
            let init = init.clone();
            let thread_name = format!("{}-loop-{}", self.name, i);
            let join = thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    let lp = match EventLoop::new() {
                        Ok(lp) => lp,
                        Err(e) => {
                            *signal.0.lock() = Some(Err(e));
                            signal.1.notify_one();
                            return;
                        }
                    };
                    if let Some(init) = &init {
                        init(&lp);
                    }
                    {
                        *signal.0.lock() = Some(Ok(lp.handle()));
                        signal.1.notify_one();
                    }
                    lp.run();
                })
                .map_err(Error::Io)?;

            let mut slot = ready.0.lock();
            while slot.is_none() {
                ready.1.wait(&mut slot);
            }
            match slot.take() {
                Some(Ok(handle)) => {
                    inner.workers.push(handle);
                    inner.threads.push(join);
                }
                Some(Err(e)) => return Err(e),
                None => unreachable!(),
            }
        }
        info!("pool {} started with {} workers", self.name, n);
        Ok(())
    }

    /// Next loop, round-robin over the workers; the base loop when empty.
    pub fn next_loop(&self) -> LoopHandle {
        let inner = self.inner.lock();
        if inner.workers.is_empty() {
            return self.base.clone();
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % inner.workers.len();
        inner.workers[idx].clone()
    }

    /// Stable mapping from a hash to a worker loop; the base loop when empty.
    pub fn loop_for_hash(&self, hash: usize) -> LoopHandle {
        let inner = self.inner.lock();
        if inner.workers.is_empty() {
            return self.base.clone();
        }
        inner.workers[hash % inner.workers.len()].clone()
    }

    /// The base loop handle.
    pub fn base_loop(&self) -> LoopHandle {
        self.base.clone()
    }

    /// Number of worker loops.
    pub fn worker_count(&self) -> usize {
        self.inner.lock().workers.len()
    }
}

impl Drop for EventLoopPool {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        for worker in &inner.workers {
            worker.quit();
        }
        for join in inner.threads.drain(..) {
            let _ = join.join();
        }
        debug!("pool {} torn down", self.name);
    }
}

impl std::fmt::Debug for EventLoopPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopPool")
            .field("name", &self.name)
            .field("workers", &self.worker_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread::ThreadId;
    use std::time::Duration;

    fn worker_thread_of(handle: &LoopHandle) -> ThreadId {
        let (tx, rx) = crossbeam_channel::bounded(1);
        handle.queue_in_loop(move |_| {
            tx.send(thread::current().id()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_empty_pool_falls_back_to_base() {
        let (htx, hrx) = crossbeam_channel::bounded(1);
        let owner = thread::spawn(move || {
            let lp = EventLoop::new().unwrap();
            htx.send(lp.handle()).unwrap();
            lp.run();
        });
        let base: LoopHandle = hrx.recv().unwrap();
        let pool = EventLoopPool::new(base.clone(), "test");
        pool.start(0, None).unwrap();
        let base_thread = worker_thread_of(&base);
        assert_eq!(worker_thread_of(&pool.next_loop()), base_thread);
        assert_eq!(worker_thread_of(&pool.loop_for_hash(7)), base_thread);
        base.quit();
        owner.join().unwrap();
    }

    #[test]
    fn test_round_robin_over_distinct_threads() {
        let (htx, hrx) = crossbeam_channel::bounded(1);
        let owner = thread::spawn(move || {
            let lp = EventLoop::new().unwrap();
            htx.send(lp.handle()).unwrap();
            lp.run();
        });
        let base: LoopHandle = hrx.recv().unwrap();
        {
            let pool = EventLoopPool::new(base.clone(), "rr");
            pool.start(3, None).unwrap();

            let mut seen = HashSet::new();
            let first_round: Vec<ThreadId> =
                (0..3).map(|_| worker_thread_of(&pool.next_loop())).collect();
            for id in &first_round {
                seen.insert(*id);
            }
            assert_eq!(seen.len(), 3, "three workers must be three threads");
            // The fourth pick wraps around to the first worker.
            assert_eq!(worker_thread_of(&pool.next_loop()), first_round[0]);

            // Hash selection is stable.
            let a = worker_thread_of(&pool.loop_for_hash(42));
            let b = worker_thread_of(&pool.loop_for_hash(42));
            assert_eq!(a, b);
        }
        base.quit();
        owner.join().unwrap();
    }

    #[test]
    fn test_init_callback_runs_on_each_worker() {
        let (htx, hrx) = crossbeam_channel::bounded(1);
        let owner = thread::spawn(move || {
            let lp = EventLoop::new().unwrap();
            htx.send(lp.handle()).unwrap();
            lp.run();
        });
        let base: LoopHandle = hrx.recv().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        {
            let pool = EventLoopPool::new(base.clone(), "init");
            let init: LoopInit = Arc::new(move |_lp: &EventLoop| {
                tx.send(thread::current().id()).unwrap();
            });
            pool.start(2, Some(init)).unwrap();
            let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_ne!(first, second);
        }
        base.quit();
        owner.join().unwrap();
    }
}
