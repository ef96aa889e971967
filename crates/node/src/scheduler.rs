//! Cooperative task scheduler.
//!
//! One thread, no preemption. Tasks are plain callbacks with a due time; a
//! periodic task is pushed forward by its period each time it runs, a
//! one-shot task is dropped after running. Time comes from a [`Clock`] so
//! tests can step it by hand.
//!
//! ```text
//! run_pending():
//!   due = snapshot of tasks with due_ms <= now
//!   for each due task still present:
//!       periodic -> due_ms = now + period
//!       one-shot -> remove
//!       run callback (no borrow held, so it may schedule/remove tasks)
//! ```

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Clocks
// ---------------------------------------------------------------------------

/// Monotonic milliseconds since an arbitrary origin.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for deterministic tests and simulations.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by.as_millis() as u64);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

struct Task {
    handle: TaskHandle,
    due_ms: u64,
    period_ms: Option<u64>,
    callback: Rc<dyn Fn()>,
}

struct Queue {
    next_id: u64,
    tasks: Vec<Task>,
}

/// Shared handle to the task list. Clones refer to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    clock: Rc<dyn Clock>,
    queue: Rc<RefCell<Queue>>,
}

impl Scheduler {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            queue: Rc::new(RefCell::new(Queue {
                next_id: 0,
                tasks: Vec::new(),
            })),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Schedule `callback`. Without a period it runs once on the next pass;
    /// with one it first runs one period from now and then every period.
    pub fn schedule_task(
        &self,
        callback: impl Fn() + 'static,
        period: Option<Duration>,
    ) -> TaskHandle {
        let now = self.now_ms();
        let period_ms = period.map(|p| (p.as_millis() as u64).max(1));
        let mut queue = self.queue.borrow_mut();
        let handle = TaskHandle(queue.next_id);
        queue.next_id += 1;
        queue.tasks.push(Task {
            handle,
            due_ms: now + period_ms.unwrap_or(0),
            period_ms,
            callback: Rc::new(callback),
        });
        handle
    }

    /// Cancel a task. Unknown or already-finished handles are ignored.
    pub fn remove_task(&self, handle: TaskHandle) -> bool {
        let mut queue = self.queue.borrow_mut();
        let before = queue.tasks.len();
        queue.tasks.retain(|t| t.handle != handle);
        queue.tasks.len() != before
    }

    pub fn is_scheduled(&self, handle: TaskHandle) -> bool {
        self.queue.borrow().tasks.iter().any(|t| t.handle == handle)
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every task whose due time has passed. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let now = self.now_ms();
        let due: Vec<TaskHandle> = self
            .queue
            .borrow()
            .tasks
            .iter()
            .filter(|t| t.due_ms <= now)
            .map(|t| t.handle)
            .collect();

        let mut ran = 0;
        for handle in due {
            let callback = {
                let mut queue = self.queue.borrow_mut();
                let Some(pos) = queue.tasks.iter().position(|t| t.handle == handle) else {
                    // removed by an earlier callback in this pass
                    continue;
                };
                match queue.tasks[pos].period_ms {
                    Some(period) => {
                        queue.tasks[pos].due_ms = now + period;
                        Rc::clone(&queue.tasks[pos].callback)
                    }
                    None => queue.tasks.remove(pos).callback,
                }
            };
            callback();
            ran += 1;
        }
        ran
    }
}

// ===========================================================================
// Tests
// ===========================================================================
