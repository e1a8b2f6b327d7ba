//! Single run-loop task queue drained by the host's `pump_events` calls.
//!
//! # Contract
//!
//! - [`TaskQueue::post`] is callable from any thread; tasks run in FIFO order,
//!   one at a time, inside [`TaskQueue::run_tasks`]
//! - the needs-run notification fires at most once per idle→non-empty
//!   transition; it is re-armed each time `run_tasks` starts
//! - [`TaskQueue::post_delayed`] schedules a timer; dropping the returned
//!   [`DelayedTaskTag`] cancels the task unless it already became ready
//! - [`TaskQueue::shutdown`] cancels timers, lets the next `run_tasks` drain
//!   the queue and then reports completion exactly once
//! - the active lock ([`ActiveTaskQueueLock`]) is exclusive and must be held
//!   while tasks run, so no task ever overlaps an API call
//!
//! Timers are driven by one background thread per queue that only moves
//! expired tasks into the ready queue; task bodies always run on the pumping
//! thread.

use log::{trace, warn};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Callbacks from the queue to its owner.
pub trait TaskQueueEventHandler: Send + Sync {
    /// Called from any thread when tasks are waiting; the owner should arrange
    /// for `run_tasks` to be called soon.
    fn on_task_queue_needs_run_tasks(&self);

    /// Called once, from within `run_tasks`, after shutdown drained the queue.
    fn on_task_queue_shutdown_complete(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Running,
    ShutdownPending,
    ShutdownComplete,
}

struct Inner {
    state: QueueState,
    tasks: VecDeque<Task>,
    /// Pending timers keyed by (deadline, id) so the earliest is first
    timers: BTreeMap<(Instant, u64), Task>,
    next_timer_id: u64,
    /// Set once the owner has been told to run tasks, cleared by run_tasks
    notified: bool,
    stop_timer_thread: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    timer_wakeup: Condvar,
    active: AtomicBool,
    handler: Weak<dyn TaskQueueEventHandler>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push a ready task; returns true if the owner must be notified.
    fn push_ready(inner: &mut Inner, task: Task) -> bool {
        inner.tasks.push_back(task);
        if inner.notified {
            false
        } else {
            inner.notified = true;
            true
        }
    }

    fn notify_needs_run(&self) {
        if let Some(handler) = self.handler.upgrade() {
            handler.on_task_queue_needs_run_tasks();
        }
    }

    /// Timer thread body: move expired timers to the ready queue.
    fn timer_loop(self: Arc<Self>) {
        trace!("Task queue timer thread started");
        let mut inner = self.lock();
        loop {
            if inner.stop_timer_thread {
                break;
            }

            let now = Instant::now();
            let mut notify = false;
            while let Some(entry) = inner.timers.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let task = entry.remove();
                notify |= Self::push_ready(&mut inner, task);
            }

            if notify {
                drop(inner);
                self.notify_needs_run();
                inner = self.lock();
                continue;
            }

            let next_deadline = inner.timers.keys().next().map(|(deadline, _)| *deadline);
            inner = match next_deadline {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(now);
                    self.timer_wakeup
                        .wait_timeout(inner, timeout)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
                None => self.timer_wakeup.wait(inner).unwrap_or_else(|e| e.into_inner()),
            };
        }
        trace!("Task queue timer thread stopped");
    }
}

/// Task queue owned by the plugin context.
pub struct TaskQueue {
    shared: Arc<Shared>,
    timer_thread: Option<thread::JoinHandle<()>>,
}

impl TaskQueue {
    pub fn new(handler: Weak<dyn TaskQueueEventHandler>) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: QueueState::Running,
                tasks: VecDeque::new(),
                timers: BTreeMap::new(),
                next_timer_id: 0,
                notified: false,
                stop_timer_thread: false,
            }),
            timer_wakeup: Condvar::new(),
            active: AtomicBool::new(false),
            handler,
        });

        let timer_shared = Arc::clone(&shared);
        let timer_thread = thread::Builder::new()
            .name("frameway-timer".to_string())
            .spawn(move || timer_shared.timer_loop());
        let timer_thread = match timer_thread {
            Ok(handle) => Some(handle),
            Err(e) => fatal!("Failed to spawn task queue timer thread: {}", e),
        };

        Self { shared, timer_thread }
    }

    /// Enqueue a task. Safe to call from any thread.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let notify = {
            let mut inner = self.shared.lock();
            if inner.state == QueueState::ShutdownComplete {
                warn!("Task posted to a task queue that has been shut down, dropping it");
                return;
            }
            Shared::push_ready(&mut inner, Box::new(task))
        };
        if notify {
            self.shared.notify_needs_run();
        }
    }

    /// Run `task` after `delay`, unless the returned tag is dropped first.
    pub fn post_delayed<F>(&self, delay: Duration, task: F) -> DelayedTaskTag
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.shared.lock();
        let id = inner.next_timer_id;
        inner.next_timer_id += 1;
        let key = (Instant::now() + delay, id);

        if inner.state == QueueState::Running {
            inner.timers.insert(key, Box::new(task));
            self.shared.timer_wakeup.notify_all();
        } else {
            trace!("Delayed task dropped, task queue is shutting down");
        }

        DelayedTaskTag {
            queue: Arc::downgrade(&self.shared),
            key,
        }
    }

    /// Take the exclusive active lock. Fatal if it is already held.
    pub fn lock_active(&self) -> ActiveTaskQueueLock {
        if self.shared.active.swap(true, Ordering::AcqRel) {
            fatal!("Task queue active lock is already held");
        }
        ActiveTaskQueueLock {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run every task queued at the time of the call. Requires the active lock.
    ///
    /// Tasks posted while running are left for the next call (and trigger a
    /// new notification). Completes a pending shutdown once nothing is left.
    pub fn run_tasks(&self) {
        if !self.shared.active.load(Ordering::Acquire) {
            fatal!("Running tasks without holding the task queue active lock");
        }

        let batch = {
            let mut inner = self.shared.lock();
            inner.notified = false;
            std::mem::take(&mut inner.tasks)
        };

        if !batch.is_empty() {
            trace!("Running {} queued tasks", batch.len());
        }
        for task in batch {
            task();
        }

        let completed = {
            let mut inner = self.shared.lock();
            if inner.state == QueueState::ShutdownPending && inner.tasks.is_empty() {
                inner.state = QueueState::ShutdownComplete;
                inner.stop_timer_thread = true;
                self.shared.timer_wakeup.notify_all();
                true
            } else {
                false
            }
        };

        if completed {
            trace!("Task queue shutdown complete");
            if let Some(handler) = self.shared.handler.upgrade() {
                handler.on_task_queue_shutdown_complete();
            }
        }
    }

    /// Start the shutdown handshake. Fatal if already requested.
    pub fn shutdown(&self) {
        let notify = {
            let mut inner = self.shared.lock();
            if inner.state != QueueState::Running {
                fatal!("Task queue shutdown requested twice");
            }
            inner.state = QueueState::ShutdownPending;

            let cancelled = inner.timers.len();
            inner.timers.clear();
            if cancelled > 0 {
                trace!("Task queue shutdown cancelled {} pending timers", cancelled);
            }

            // Completion is reported from run_tasks, so make sure it gets called
            if inner.notified {
                false
            } else {
                inner.notified = true;
                true
            }
        };
        if notify {
            self.shared.notify_needs_run();
        }
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.shared.lock().state == QueueState::ShutdownComplete
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.lock();
            inner.stop_timer_thread = true;
            inner.timers.clear();
        }
        self.shared.timer_wakeup.notify_all();

        if let Some(handle) = self.timer_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Exclusive "active" lock; released on drop.
pub struct ActiveTaskQueueLock {
    shared: Arc<Shared>,
}

impl Drop for ActiveTaskQueueLock {
    fn drop(&mut self) {
        self.shared.active.store(false, Ordering::Release);
    }
}

/// Handle of a pending delayed task; dropping it cancels the task.
pub struct DelayedTaskTag {
    queue: Weak<Shared>,
    key: (Instant, u64),
}

impl DelayedTaskTag {
    /// True while the task is still waiting for its deadline.
    pub fn is_pending(&self) -> bool {
        self.queue
            .upgrade()
            .is_some_and(|shared| shared.lock().timers.contains_key(&self.key))
    }
}

impl Drop for DelayedTaskTag {
    fn drop(&mut self) {
        if let Some(shared) = self.queue.upgrade() {
            // Take the task out before dropping it so its captures are not
            // released while the queue mutex is held
            let task = shared.lock().timers.remove(&self.key);
            drop(task);
        }
    }
}

impl std::fmt::Debug for DelayedTaskTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedTaskTag")
            .field("id", &self.key.1)
            .field("pending", &self.is_pending())
            .finish()
    }
}
