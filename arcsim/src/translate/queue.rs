//! Translation work queue
//!
//! Bounded multi-producer/multi-consumer FIFO between the dispatcher and
//! the worker pool. Producers never block: a unit is dropped when its page
//! already has a unit in flight under the same fingerprint (idempotence)
//! or when the queue is full. Workers block on `pop` and drain remaining
//! units after `close` so a shutdown publishes everything already queued.

use super::work_unit::TranslationWorkUnit;
use log::debug;
use sim_types::PageFrame;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

struct QueueInner {
    queue: VecDeque<Arc<TranslationWorkUnit>>,
    /// Keys of units between push and compile completion.
    in_flight: HashSet<(PageFrame, u64)>,
    closed: bool,
}

pub struct TranslateQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
    capacity: usize,
}

/// Outcome of a push attempt.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PushOutcome {
    Queued,
    /// Same page and fingerprint already queued or compiling.
    DroppedInFlight,
    DroppedFull,
    DroppedClosed,
}

impl TranslateQueue {
    pub fn new(capacity: usize) -> Self {
        TranslateQueue {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                in_flight: HashSet::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    pub fn push(&self, unit: TranslationWorkUnit) -> PushOutcome {
        let mut inner = self.inner.lock().expect("translate queue poisoned");
        if inner.closed {
            return PushOutcome::DroppedClosed;
        }
        let key = unit.key();
        if inner.in_flight.contains(&key) {
            return PushOutcome::DroppedInFlight;
        }
        if inner.queue.len() >= self.capacity {
            debug!("translate queue full, dropping unit for {}", unit.page);
            return PushOutcome::DroppedFull;
        }
        inner.in_flight.insert(key);
        inner.queue.push_back(Arc::new(unit));
        drop(inner);
        self.ready.notify_one();
        PushOutcome::Queued
    }

    /// Blocks until a unit is available. Returns `None` once the queue is
    /// closed and drained.
    pub fn pop(&self) -> Option<Arc<TranslationWorkUnit>> {
        let mut inner = self.inner.lock().expect("translate queue poisoned");
        loop {
            if let Some(unit) = inner.queue.pop_front() {
                return Some(unit);
            }
            if inner.closed {
                return None;
            }
            inner = self.ready.wait(inner).expect("translate queue poisoned");
        }
    }

    /// Releases a unit's idempotence key once its compile attempt is over.
    pub fn finish(&self, unit: &TranslationWorkUnit) {
        let mut inner = self.inner.lock().expect("translate queue poisoned");
        inner.in_flight.remove(&unit.key());
    }

    /// Closes the queue; queued units are still handed out.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("translate queue poisoned");
        inner.closed = true;
        drop(inner);
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("translate queue poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_types::{page_frame, OptionFingerprint};

    fn unit(page: u32, fingerprint: u64) -> TranslationWorkUnit {
        TranslationWorkUnit::new(
            page_frame(page),
            OptionFingerprint::from_raw(fingerprint),
            0,
            Vec::new(),
        )
    }

    #[test]
    fn test_fifo_order() {
        let queue = TranslateQueue::new(4);
        assert_eq!(queue.push(unit(0x0000, 1)), PushOutcome::Queued);
        assert_eq!(queue.push(unit(0x2000, 1)), PushOutcome::Queued);
        assert_eq!(queue.pop().unwrap().page, page_frame(0x0000));
        assert_eq!(queue.pop().unwrap().page, page_frame(0x2000));
    }

    #[test]
    fn test_duplicate_page_dropped_until_finished() {
        let queue = TranslateQueue::new(4);
        assert_eq!(queue.push(unit(0x0000, 1)), PushOutcome::Queued);
        assert_eq!(queue.push(unit(0x0000, 1)), PushOutcome::DroppedInFlight);

        // a different fingerprint is a different unit
        assert_eq!(queue.push(unit(0x0000, 2)), PushOutcome::Queued);

        let popped = queue.pop().unwrap();
        // still in flight while compiling
        assert_eq!(queue.push(unit(0x0000, 1)), PushOutcome::DroppedInFlight);
        queue.finish(&popped);
        assert_eq!(queue.push(unit(0x0000, 1)), PushOutcome::Queued);
    }

    #[test]
    fn test_capacity_bound() {
        let queue = TranslateQueue::new(2);
        assert_eq!(queue.push(unit(0x0000, 1)), PushOutcome::Queued);
        assert_eq!(queue.push(unit(0x2000, 1)), PushOutcome::Queued);
        assert_eq!(queue.push(unit(0x4000, 1)), PushOutcome::DroppedFull);
    }

    #[test]
    fn test_close_drains_then_stops() {
        let queue = TranslateQueue::new(4);
        queue.push(unit(0x0000, 1));
        queue.close();
        assert_eq!(queue.push(unit(0x2000, 1)), PushOutcome::DroppedClosed);
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(TranslateQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.pop().map(|u| u.page))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        queue.push(unit(0x6000, 1));
        assert_eq!(consumer.join().unwrap(), Some(page_frame(0x6000)));
    }
}
