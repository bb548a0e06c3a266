//! A single-threaded, thread-affine cooperative event loop.
//!
//! `rips::stack::StackInterfaceThread` spawns one OS thread per interface,
//! reading `StackInterfaceMsg`s off an `mpsc::Receiver` in a `run` loop and
//! reacting to each one (`UpdateArpTable`, `ArpRequest`, `Shutdown`).
//! Golden Gate needs that same "thread-affine mailbox" idea, but generalized
//! from one hard-coded message enum into an arbitrary queue of closures plus
//! a timer wheel: every element, timer and event callback in a stack runs on
//! the one loop thread that created it, with cross-thread work (e.g.
//! transport data arriving on a radio IRQ thread) marshaled in via
//! `invoke_async` the way `StackInterfaceThread::spawn` hands back a
//! `Sender` for other threads to post to.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::warn;

use crate::errors::{GgError, GgResult};

type Job = Box<dyn FnOnce() + Send>;

/// Opaque handle to a scheduled timer, returned by `EventLoop::post_timer`
/// and accepted by `EventLoop::unschedule`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct ScheduledTimer {
    deadline: Instant,
    id: TimerId,
    callback: Option<Job>,
}

// BinaryHeap is a max-heap; wrap in Reverse so the earliest deadline sorts
// first. Ties broken by id so two timers firing at distinct moments that
// round to the same `Instant` in a fast test still pop in scheduling order.
struct HeapEntry(Reverse<(Instant, u64)>, ScheduledTimer);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

/// Thread-affine queue of async closures plus a min-heap of timers.
///
/// An `EventLoop` is created on, and every mutating method except
/// `invoke_async` must be called from, the thread that created it. This is
/// enforced by comparing `thread::current().id()` to the id captured at
/// construction.
pub struct EventLoop {
    owner: ThreadId,
    jobs_tx: Sender<Job>,
    jobs_rx: Receiver<Job>,
    timers: Mutex<BinaryHeap<HeapEntry>>,
    next_timer_id: Mutex<u64>,
}

// `jobs_rx` is only ever touched from `poll_once`, which asserts it is
// running on the owner thread; every other field is already `Sync`. The
// runtime check provides the exclusion that `Receiver`'s missing `Sync`
// impl would otherwise require the type system to prove.
unsafe impl Sync for EventLoop {}

impl EventLoop {
    pub fn new() -> EventLoop {
        let (jobs_tx, jobs_rx) = mpsc::channel();
        EventLoop {
            owner: thread::current().id(),
            jobs_tx,
            jobs_rx,
            timers: Mutex::new(BinaryHeap::new()),
            next_timer_id: Mutex::new(0),
        }
    }

    fn assert_on_owner_thread(&self) -> GgResult<()> {
        if thread::current().id() != self.owner {
            warn!("event loop: method called from non-owning thread {:?}", thread::current().id());
            return Err(GgError::InvalidState);
        }
        Ok(())
    }

    /// Enqueues `job` to run on the loop thread. Safe to call from any
    /// thread; this is the only method that is.
    pub fn invoke_async<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // A closed receiver means the loop has been torn down; dropping the
        // job silently is the right behavior, matching Element::destroy's
        // "must not be used after this call" contract.
        let _ = self.jobs_tx.send(Box::new(job));
    }

    /// Schedules `callback` to run after `delay` on the loop thread.
    pub fn post_timer<F>(&self, delay: Duration, callback: F) -> GgResult<TimerId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.assert_on_owner_thread()?;
        let mut next_id = self.next_timer_id.lock().expect("timer id lock poisoned");
        let id = TimerId(*next_id);
        *next_id += 1;
        let deadline = Instant::now() + delay;
        let entry = HeapEntry(
            Reverse((deadline, id.0)),
            ScheduledTimer {
                deadline,
                id,
                callback: Some(Box::new(callback)),
            },
        );
        self.timers
            .lock()
            .expect("timer heap lock poisoned")
            .push(entry);
        Ok(id)
    }

    /// Removes a previously scheduled timer, if it hasn't fired yet.
    pub fn unschedule(&self, id: TimerId) -> GgResult<()> {
        self.assert_on_owner_thread()?;
        let mut heap = self.timers.lock().expect("timer heap lock poisoned");
        let items: Vec<HeapEntry> = heap.drain().collect();
        for item in items {
            if item.1.id != id {
                heap.push(item);
            }
        }
        Ok(())
    }

    /// Drains any pending async jobs and runs every timer whose deadline has
    /// elapsed. Returns the number of callbacks executed.
    pub fn poll_once(&self) -> GgResult<usize> {
        self.assert_on_owner_thread()?;
        let mut ran = 0;
        while let Ok(job) = self.jobs_rx.try_recv() {
            job();
            ran += 1;
        }
        let now = Instant::now();
        loop {
            let due = {
                let heap = self.timers.lock().expect("timer heap lock poisoned");
                matches!(heap.peek(), Some(entry) if entry.1.deadline <= now)
            };
            if !due {
                break;
            }
            let mut entry = self
                .timers
                .lock()
                .expect("timer heap lock poisoned")
                .pop()
                .expect("checked non-empty above");
            if let Some(cb) = entry.1.callback.take() {
                cb();
                ran += 1;
            }
        }
        Ok(ran)
    }

    /// Repeatedly calls `poll_once` until no jobs or due timers remain,
    /// sleeping briefly between spins so timers armed just out of reach get
    /// a chance to become due. Intended for tests and simple run-to-completion
    /// callers; production hosts normally drive `poll_once` from their own
    /// outer loop/reactor instead.
    pub fn run_until_idle(&self, max_spins: usize) -> GgResult<()> {
        for _ in 0..max_spins {
            let ran = self.poll_once()?;
            if ran == 0 {
                return Ok(());
            }
        }
        Ok(())
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        EventLoop::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_invoked_jobs_on_poll() {
        let loop_ = EventLoop::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        loop_.invoke_async(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let ran = loop_.poll_once().unwrap();
        assert_eq!(ran, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timer_fires_only_after_delay() {
        let loop_ = EventLoop::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        loop_
            .post_timer(Duration::from_millis(20), move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(loop_.poll_once().unwrap(), 0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(loop_.poll_once().unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unschedule_prevents_firing() {
        let loop_ = EventLoop::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let id = loop_
            .post_timer(Duration::from_millis(10), move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        loop_.unschedule(id).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(loop_.poll_once().unwrap(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rejects_calls_from_other_thread() {
        let loop_ = Arc::new(EventLoop::new());
        let l = Arc::clone(&loop_);
        let handle = thread::spawn(move || l.poll_once());
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(GgError::InvalidState)));
    }
}
