//! The per-thread event loop.
//!
//! One loop binds to the thread that created it, for the whole lifetime of
//! that thread; a thread-local enforces the one-loop-per-thread rule. The
//! loop repeats: poll with a bounded timeout, dispatch every ready channel,
//! run queued tasks. Other threads reach the loop through [`LoopHandle`],
//! which queues a task and, when necessary, kicks the poller awake through
//! an eventfd-backed waker.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use mio::Waker;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use rivet_core::Result;

use crate::channel::{Channel, ChannelRef};
use crate::poller::{Poller, WAKER_TOKEN};

/// Default poll timeout: the longest one iteration may block.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// A task posted to a loop. Receives the loop it runs on.
pub type Task = Box<dyn FnOnce(&EventLoop) + Send>;

thread_local! {
    static CURRENT: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

struct LoopCore {
    poller: Poller,
    active: Vec<ChannelRef>,
}

struct Shared {
    thread: ThreadId,
    waker: Waker,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending: AtomicBool,
    iteration: AtomicU64,
    poll_timeout_ms: AtomicU64,
    pending: Mutex<Vec<Task>>,
    context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Shared {
    fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    fn wakeup(&self) {
        if let Err(e) = self.waker.wake() {
            error!("loop wakeup failed: {}", e);
        }
    }

    fn queue(&self, task: Task) {
        self.pending.lock().push(task);
        // A wakeup is needed when the caller is off-thread, and also when the
        // loop is currently draining tasks: it would otherwise re-enter poll
        // before seeing this one.
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }
}

/// Cross-thread handle to an event loop.
///
/// Cheap to clone; `Send + Sync`. All mutation of loop-owned state funnels
/// through [`run_in_loop`](LoopHandle::run_in_loop) or
/// [`queue_in_loop`](LoopHandle::queue_in_loop).
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// True when called from the loop's own thread.
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Runs `task` inline when called on the loop thread, otherwise queues it.
    pub fn run_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        if self.is_in_loop_thread() {
            if let Some(lp) = EventLoop::current() {
                task(&lp);
                return;
            }
        }
        self.queue_in_loop(task);
    }

    /// Appends `task` to the pending list; it runs after the current poll
    /// iteration's channel dispatch, in FIFO order.
    pub fn queue_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        self.shared.queue(Box::new(task));
    }

    /// Posts `task` back to the loop after `delay`.
    pub fn run_after(&self, delay: Duration, task: impl FnOnce(&EventLoop) + Send + 'static) {
        let handle = self.clone();
        let spawned = thread::Builder::new().name("rivet-timer".into()).spawn(move || {
            thread::sleep(delay);
            handle.queue_in_loop(task);
        });
        if let Err(e) = spawned {
            error!("failed to spawn timer thread: {}", e);
        }
    }

    /// Asks the loop to stop after the current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.shared.wakeup();
        }
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle").field("thread", &self.shared.thread).finish()
    }
}

/// A readiness-driven event loop bound to the current thread.
///
/// Not `Send`: the loop and everything it owns stay on the thread that
/// created it. Use [`handle`](EventLoop::handle) to reach it from elsewhere.
#[derive(Clone)]
pub struct EventLoop {
    core: Rc<RefCell<LoopCore>>,
    shared: Arc<Shared>,
}

impl EventLoop {
    /// Creates the loop for the current thread and binds it there.
    ///
    /// # Panics
    ///
    /// Panics if this thread already hosts a loop.
    pub fn new() -> Result<EventLoop> {
        CURRENT.with(|c| {
            assert!(
                c.borrow().is_none(),
                "another EventLoop already exists on thread {:?}",
                thread::current().id()
            );
        });
        let poller = Poller::new()?;
        let waker = Waker::new(poller.registry(), WAKER_TOKEN)?;
        let lp = EventLoop {
            core: Rc::new(RefCell::new(LoopCore { poller, active: Vec::new() })),
            shared: Arc::new(Shared {
                thread: thread::current().id(),
                waker,
                looping: AtomicBool::new(false),
                quit: AtomicBool::new(false),
                event_handling: AtomicBool::new(false),
                calling_pending: AtomicBool::new(false),
                iteration: AtomicU64::new(0),
                poll_timeout_ms: AtomicU64::new(POLL_TIMEOUT.as_millis() as u64),
                pending: Mutex::new(Vec::new()),
                context: Mutex::new(None),
            }),
        };
        CURRENT.with(|c| *c.borrow_mut() = Some(lp.clone()));
        info!("event loop created on {:?}", thread::current().id());
        Ok(lp)
    }

    /// The loop bound to the current thread, if one exists.
    pub fn current() -> Option<EventLoop> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Cross-thread handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle { shared: Arc::clone(&self.shared) }
    }

    /// True when called from the loop's own thread.
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Asserts the caller is on the loop thread.
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "loop bound to {:?} touched from {:?}",
            self.shared.thread,
            thread::current().id()
        );
    }

    /// Number of completed poll iterations.
    pub fn iteration(&self) -> u64 {
        self.shared.iteration.load(Ordering::Relaxed)
    }

    /// Stores an opaque per-loop context (per-thread resources attached by
    /// the host, typically from the loop init callback).
    pub fn set_context(&self, ctx: Arc<dyn Any + Send + Sync>) {
        *self.shared.context.lock() = Some(ctx);
    }

    /// Fetches the per-loop context downcast to `T`.
    pub fn context<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.shared.context.lock().clone().and_then(|ctx| ctx.downcast::<T>().ok())
    }

    /// Overrides the poll timeout (mainly to tighten tests).
    pub fn set_poll_timeout(&self, timeout: Duration) {
        self.shared.poll_timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Runs the loop until [`quit`](EventLoop::quit) is called.
    ///
    /// Each iteration clears the active list, polls, dispatches every ready
    /// channel, then drains the pending-task list.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(!self.shared.looping.swap(true, Ordering::AcqRel), "loop already running");
        // The quit flag is not reset here: a quit() that raced ahead of
        // run() must still be honored.
        info!("event loop starts looping");

        while !self.shared.quit.load(Ordering::Acquire) {
            let timeout =
                Duration::from_millis(self.shared.poll_timeout_ms.load(Ordering::Relaxed));
            let active = {
                let mut core = self.core.borrow_mut();
                let LoopCore { poller, active } = &mut *core;
                active.clear();
                if let Err(e) = poller.poll(timeout, active) {
                    if e.kind() != io::ErrorKind::Interrupted {
                        error!("poll failed: {}", e);
                    }
                }
                active.clone()
            };
            self.shared.iteration.fetch_add(1, Ordering::Relaxed);

            self.shared.event_handling.store(true, Ordering::Release);
            for ch in &active {
                Channel::handle_event(ch);
            }
            self.shared.event_handling.store(false, Ordering::Release);

            self.do_pending_tasks();
        }

        info!("event loop stops looping after {} iterations", self.iteration());
        self.shared.looping.store(false, Ordering::Release);
    }

    /// Asks the loop to stop; from off-thread the poller is woken so the
    /// request is observed within one poll timeout at worst.
    pub fn quit(&self) {
        self.handle().quit();
    }

    /// See [`LoopHandle::run_in_loop`].
    pub fn run_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        if self.is_in_loop_thread() {
            task(self);
        } else {
            self.queue_in_loop(task);
        }
    }

    /// See [`LoopHandle::queue_in_loop`].
    pub fn queue_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        self.shared.queue(Box::new(task));
    }

    /// Reconciles a channel's interest with the poller. Loop thread only.
    pub fn update_channel(&self, ch: &ChannelRef) {
        self.assert_in_loop_thread();
        self.core.borrow_mut().poller.update_channel(ch);
    }

    /// Removes a channel from the poller map. Loop thread only.
    pub fn remove_channel(&self, ch: &ChannelRef) {
        self.assert_in_loop_thread();
        self.core.borrow_mut().poller.remove_channel(ch);
    }

    /// True when the poller map holds a channel for `fd`. Loop thread only.
    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.assert_in_loop_thread();
        self.core.borrow().poller.has_channel(fd)
    }

    /// Fetches the channel registered for `fd`. Loop thread only.
    pub fn channel_for(&self, fd: RawFd) -> Option<ChannelRef> {
        self.assert_in_loop_thread();
        self.core.borrow().poller.channel(fd)
    }

    fn do_pending_tasks(&self) {
        self.shared.calling_pending.store(true, Ordering::Release);
        // Swap the list out under the lock and run the local copy; tasks
        // queued while running land in the next iteration.
        let tasks = std::mem::take(&mut *self.shared.pending.lock());
        let n = tasks.len();
        for task in tasks {
            task(self);
        }
        if n > 0 {
            debug!("ran {} pending tasks", n);
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.shared.thread)
            .field("iteration", &self.iteration())
            .finish()
    }
}
