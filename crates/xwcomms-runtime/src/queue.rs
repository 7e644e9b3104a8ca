//! Typed-priority task queue
//!
//! Every game's work funnels through one `TaskQueue`, consumed by a single
//! task, so the comms state it owns is never touched concurrently. Higher
//! priorities always run first; within a priority, tasks run in the order
//! they were posted. At most one `Draw` task is queued at a time: posting
//! another while one is waiting is a no-op.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::trace;

use crate::errors::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Blocking = 0,
    Ui = 1,
    Draw = 2,
    Network = 3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Blocking,
        Priority::Ui,
        Priority::Draw,
        Priority::Network,
    ];
}

struct Lanes<T> {
    lanes: [VecDeque<T>; 4],
    closed: bool,
}

impl<T> Lanes<T> {
    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}

/// Multi-producer, single-consumer priority queue. Clones share the queue.
pub struct TaskQueue<T> {
    inner: Arc<Mutex<Lanes<T>>>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            notify: Arc::clone(&self.notify),
            capacity: self.capacity,
        }
    }
}

impl<T> TaskQueue<T> {
    /// `capacity` bounds network work only; higher priorities are never refused
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Lanes {
                lanes: Default::default(),
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lanes<T>> {
        // A panicking consumer must not wedge every producer
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Post a task. Returns false if it was a `Draw` coalesced into one
    /// already waiting.
    pub fn push(&self, priority: Priority, task: T) -> Result<bool> {
        {
            let mut lanes = self.lock();
            if lanes.closed {
                return Err(RuntimeError::channel_closed("task queue"));
            }
            let lane = &mut lanes.lanes[priority as usize];
            if priority == Priority::Draw && !lane.is_empty() {
                trace!("draw already queued; coalescing");
                return Ok(false);
            }
            if priority == Priority::Network && lane.len() >= self.capacity {
                return Err(RuntimeError::Channel {
                    reason: format!("task queue full ({} network tasks)", self.capacity),
                });
            }
            lane.push_back(task);
        }
        self.notify.notify_one();
        Ok(true)
    }

    /// Highest-priority task, if any is waiting
    pub fn try_pop(&self) -> Option<(Priority, T)> {
        let mut lanes = self.lock();
        for priority in Priority::ALL {
            if let Some(task) = lanes.lanes[priority as usize].pop_front() {
                return Some((priority, task));
            }
        }
        None
    }

    /// Wait for the next task. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<(Priority, T)> {
        loop {
            if let Some(next) = self.try_pop() {
                return Some(next);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Refuse further tasks. Tasks already queued can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
