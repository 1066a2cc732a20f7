//! Deferred work queued onto the network thread from any thread.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::Callback;
use super::scheduler::Scheduler;

/// Owner tag of queued callbacks, used for bulk cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackTarget(u64);

impl CallbackTarget {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns a target no other call to `unique` returns.
    pub fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1 << 32);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

struct Entry<S> {
    target: CallbackTarget,
    callback: Callback<S>,
}

struct Queues<S> {
    interrupt: VecDeque<Entry<S>>,
    normal: VecDeque<Entry<S>>,
}

/// FIFO callback queue shared between the network thread and producers.
///
/// Pushing wakes the thread if it is waiting. Callbacks queued with
/// [`push_interrupt`](Self::push_interrupt) run before ordinary ones.
pub struct CallbackQueue<S> {
    queues: Arc<Mutex<Queues<S>>>,
    interrupt: Arc<Notify>,
}

impl<S> Clone for CallbackQueue<S> {
    fn clone(&self) -> Self {
        Self {
            queues: Arc::clone(&self.queues),
            interrupt: Arc::clone(&self.interrupt),
        }
    }
}

impl<S> CallbackQueue<S> {
    pub(crate) fn new(interrupt: Arc<Notify>) -> Self {
        Self {
            queues: Arc::new(Mutex::new(Queues {
                interrupt: VecDeque::new(),
                normal: VecDeque::new(),
            })),
            interrupt,
        }
    }

    pub fn push(
        &self,
        target: CallbackTarget,
        callback: impl FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static,
    ) {
        self.push_boxed(target, Box::new(callback));
    }

    /// Queues a callback ahead of all ordinary callbacks.
    pub fn push_interrupt(
        &self,
        target: CallbackTarget,
        callback: impl FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static,
    ) {
        self.queues.lock().interrupt.push_back(Entry {
            target,
            callback: Box::new(callback),
        });
        self.interrupt.notify_one();
    }

    pub(crate) fn push_boxed(&self, target: CallbackTarget, callback: Callback<S>) {
        self.queues
            .lock()
            .normal
            .push_back(Entry { target, callback });
        self.interrupt.notify_one();
    }

    /// Drops every pending callback of `target`. Returns how many.
    pub fn cancel(&self, target: CallbackTarget) -> usize {
        let mut queues = self.queues.lock();
        let before = queues.interrupt.len() + queues.normal.len();

        queues.interrupt.retain(|entry| entry.target != target);
        queues.normal.retain(|entry| entry.target != target);

        before - queues.interrupt.len() - queues.normal.len()
    }

    pub fn len(&self) -> usize {
        let queues = self.queues.lock();
        queues.interrupt.len() + queues.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs queued callbacks until the queue is empty, including ones
    /// pushed while processing. The lock is not held while a callback
    /// runs. Returns the number run.
    pub(crate) fn process(&self, host: &mut S, scheduler: &mut Scheduler<S>) -> usize {
        let mut processed = 0;

        loop {
            let next = {
                let mut queues = self.queues.lock();
                queues
                    .interrupt
                    .pop_front()
                    .or_else(|| queues.normal.pop_front())
            };

            let Some(entry) = next else {
                return processed;
            };

            (entry.callback)(host, scheduler);
            processed += 1;
        }
    }
}

impl<S> fmt::Debug for CallbackQueue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> CallbackQueue<Vec<u32>> {
        CallbackQueue::new(Arc::new(Notify::new()))
    }

    #[test]
    fn test_callbacks_run_in_enqueue_order() {
        let queue = queue();
        let target = CallbackTarget::unique();

        for value in 0..4 {
            queue.push(target, move |log: &mut Vec<u32>, _| log.push(value));
        }

        let mut log = Vec::new();
        assert_eq!(queue.process(&mut log, &mut Scheduler::new()), 4);
        assert_eq!(log, vec![0, 1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_interrupt_callbacks_run_first() {
        let queue = queue();
        let target = CallbackTarget::unique();

        queue.push(target, |log: &mut Vec<u32>, _| log.push(1));
        queue.push_interrupt(target, |log: &mut Vec<u32>, _| log.push(0));

        let mut log = Vec::new();
        queue.process(&mut log, &mut Scheduler::new());
        assert_eq!(log, vec![0, 1]);
    }

    #[test]
    fn test_cancel_only_removes_target() {
        let queue = queue();
        let kept = CallbackTarget::unique();
        let cancelled = CallbackTarget::unique();
        assert_ne!(kept, cancelled);

        queue.push(cancelled, |log: &mut Vec<u32>, _| log.push(1));
        queue.push(kept, |log: &mut Vec<u32>, _| log.push(2));
        queue.push_interrupt(cancelled, |log: &mut Vec<u32>, _| log.push(3));

        assert_eq!(queue.cancel(cancelled), 2);

        let mut log = Vec::new();
        queue.process(&mut log, &mut Scheduler::new());
        assert_eq!(log, vec![2]);
    }

    #[test]
    fn test_callbacks_pushed_while_processing_are_drained() {
        let queue = queue();
        let target = CallbackTarget::unique();
        let producer = queue.clone();

        queue.push(target, move |log: &mut Vec<u32>, _| {
            log.push(1);
            producer.push(target, |log: &mut Vec<u32>, _| log.push(2));
        });

        let mut log = Vec::new();
        assert_eq!(queue.process(&mut log, &mut Scheduler::new()), 2);
        assert_eq!(log, vec![1, 2]);
    }
}
