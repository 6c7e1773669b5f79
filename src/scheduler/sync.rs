//! Sleeping synchronization primitives: counting semaphores, locks with
//! priority donation, and Mesa-style condition variables.
//!
//! Waiter bookkeeping lives next to the scheduler so that every waiter set
//! stays ordered by effective priority, and gets re-sorted at wake time
//! since priorities may have changed while a thread waited.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::thread::{Tid, PRI_MIN};
use super::{Scheduler, SchedPolicy, SCHEDULER};
use crate::interrupts;

/// Identity of a lock, for wait_on_lock chains and holder tracking.
pub type LockId = u64;

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

pub struct SemaInner {
    pub value: usize,
    /// Waiting tids, effective priority descending, FIFO among equals.
    pub waiters: Vec<Tid>,
}

impl SemaInner {
    /// Ordered insert before the first strictly lower-priority waiter.
    pub fn enqueue_ordered(&mut self, sched: &Scheduler, tid: Tid) {
        let p = sched.priority_of(tid);
        let pos = self
            .waiters
            .iter()
            .position(|&o| sched.priority_of(o) < p)
            .unwrap_or(self.waiters.len());
        self.waiters.insert(pos, tid);
    }

    /// Re-sort (donations may have changed priorities mid-wait) and pop
    /// the highest-priority waiter.
    pub fn take_highest(&mut self, sched: &Scheduler) -> Option<Tid> {
        if self.waiters.is_empty() {
            return None;
        }
        self.waiters
            .sort_by(|a, b| sched.priority_of(*b).cmp(&sched.priority_of(*a)));
        Some(self.waiters.remove(0))
    }

    /// Effective priority of the best waiter; PRI_MIN when empty.
    pub fn top_priority(&self, sched: &Scheduler) -> i32 {
        self.waiters
            .iter()
            .map(|&t| sched.priority_of(t))
            .max()
            .unwrap_or(PRI_MIN)
    }
}

/// A counting semaphore. down() may sleep; up() wakes the single
/// highest-priority waiter and tests for preemption.
pub struct Semaphore {
    inner: Mutex<SemaInner>,
}

impl Semaphore {
    pub fn new(value: usize) -> Self {
        Semaphore {
            inner: Mutex::new(SemaInner {
                value,
                waiters: Vec::new(),
            }),
        }
    }

    /// "P": wait until the value is positive, then decrement it.
    /// Must not be called from interrupt context.
    pub fn down(&self) {
        assert!(!interrupts::in_interrupt());
        loop {
            let acquired = interrupts::critical(|| {
                let mut inner = self.inner.lock();
                if inner.value > 0 {
                    inner.value -= 1;
                    return true;
                }
                {
                    let sched = SCHEDULER.lock();
                    let cur = sched.current.expect("sema down with no thread");
                    inner.enqueue_ordered(&sched, cur);
                }
                drop(inner);
                super::block_current();
                false
            });
            if acquired {
                return;
            }
        }
    }

    /// Non-blocking down. May be called from an interrupt handler.
    pub fn try_down(&self) -> bool {
        interrupts::critical(|| {
            let mut inner = self.inner.lock();
            if inner.value > 0 {
                inner.value -= 1;
                true
            } else {
                false
            }
        })
    }

    /// "V": wake the highest-priority waiter, if any, then increment.
    pub fn up(&self) {
        interrupts::critical(|| {
            let mut inner = self.inner.lock();
            let mut sched = SCHEDULER.lock();
            if let Some(t) = inner.take_highest(&sched) {
                sched.unblock(t);
            }
            inner.value += 1;
            drop(inner);
            drop(sched);
        });
        super::test_preemption();
    }

    pub fn value(&self) -> usize {
        interrupts::critical(|| self.inner.lock().value)
    }

    pub(crate) fn with_inner<T>(&self, f: impl FnOnce(&mut SemaInner) -> T) -> T {
        f(&mut self.inner.lock())
    }
}

/// A mutex owned by at most one thread, with priority donation. The lock
/// is a binary semaphore plus a holder; it is not recursive, and only the
/// holder may release it.
pub struct Lock {
    id: LockId,
    sema: Semaphore,
}

impl Lock {
    pub fn new() -> Self {
        Lock {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            sema: Semaphore::new(1),
        }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    /// Acquire, sleeping if the lock is held. While blocked, the caller
    /// donates its priority down the wait_on_lock chain (unless the MLFQ
    /// scheduler is active, which derives priorities itself).
    pub fn acquire(&self) {
        assert!(!interrupts::in_interrupt());
        assert!(!self.held_by_current(), "locks are not recursive");

        interrupts::critical(|| {
            let mut sched = SCHEDULER.lock();
            if sched.lock_holders.contains_key(&self.id) {
                let cur = sched.current.expect("lock acquire with no thread");
                sched.register_donation(cur, self.id);
                if sched.policy() != SchedPolicy::Mlfqs {
                    sched.donate_chain(cur);
                }
            }
        });

        self.sema.down();

        interrupts::critical(|| {
            let mut sched = SCHEDULER.lock();
            let cur = sched.current.expect("lock acquire with no thread");
            sched.clear_wait_on_lock(cur);
            sched.lock_holders.insert(self.id, cur);
        });
    }

    /// Non-blocking acquire.
    pub fn try_acquire(&self) -> bool {
        assert!(!self.held_by_current(), "locks are not recursive");
        if !self.sema.try_down() {
            return false;
        }
        interrupts::critical(|| {
            let mut sched = SCHEDULER.lock();
            let cur = sched.current.expect("lock acquire with no thread");
            sched.lock_holders.insert(self.id, cur);
        });
        true
    }

    /// Release. Returns donated priority first: donors waiting on this
    /// lock are dropped and the effective priority refreshed before the
    /// next holder is woken.
    pub fn release(&self) {
        interrupts::critical(|| {
            let mut sched = SCHEDULER.lock();
            let cur = sched.current.expect("lock release with no thread");
            let holder = sched.lock_holders.remove(&self.id);
            assert_eq!(holder, Some(cur), "released a lock held by another thread");
            if sched.policy() != SchedPolicy::Mlfqs {
                sched.remove_donations_for(cur, self.id);
                sched.refresh_priority(cur);
            }
        });
        self.sema.up();
    }

    pub fn held_by_current(&self) -> bool {
        interrupts::critical(|| {
            let sched = SCHEDULER.lock();
            match (sched.lock_holders.get(&self.id), sched.current) {
                (Some(&h), Some(cur)) => h == cur,
                _ => false,
            }
        })
    }
}

impl Default for Lock {
    fn default() -> Self {
        Lock::new()
    }
}

/// A Mesa-style condition variable: each waiter parks on its own
/// zero-initialized semaphore, and the waiter list is ordered by the
/// priority of the thread behind each semaphore.
pub struct Condition {
    waiters: Mutex<Vec<Arc<Semaphore>>>,
}

/// Rank of one condition waiter: the priority of the best thread waiting
/// on its semaphore.
fn waiter_rank(sched: &Scheduler, sema: &Semaphore) -> i32 {
    sema.with_inner(|inner| inner.top_priority(sched))
}

impl Condition {
    pub fn new() -> Self {
        Condition {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Atomically release LOCK and wait to be signaled, then reacquire.
    /// Mesa semantics: the caller must recheck its predicate.
    pub fn wait(&self, lock: &Lock) {
        assert!(!interrupts::in_interrupt());
        assert!(lock.held_by_current(), "cond wait without the lock");

        let waiter = Arc::new(Semaphore::new(0));
        interrupts::critical(|| {
            let mut waiters = self.waiters.lock();
            let sched = SCHEDULER.lock();
            // The new waiter's semaphore is still empty; rank it by the
            // thread that is about to park on it.
            let p = sched.priority_of(sched.current.expect("cond wait with no thread"));
            let pos = waiters
                .iter()
                .position(|w| waiter_rank(&sched, w) < p)
                .unwrap_or(waiters.len());
            waiters.insert(pos, waiter.clone());
        });

        lock.release();
        waiter.down();
        lock.acquire();
    }

    /// Wake the waiter whose thread currently has the highest priority.
    pub fn signal(&self, lock: &Lock) {
        assert!(!interrupts::in_interrupt());
        assert!(lock.held_by_current(), "cond signal without the lock");

        let woken = interrupts::critical(|| {
            let mut waiters = self.waiters.lock();
            if waiters.is_empty() {
                return None;
            }
            let sched = SCHEDULER.lock();
            waiters.sort_by(|a, b| waiter_rank(&sched, b).cmp(&waiter_rank(&sched, a)));
            Some(waiters.remove(0))
        });
        if let Some(w) = woken {
            w.up();
        }
    }

    /// Wake everyone.
    pub fn broadcast(&self, lock: &Lock) {
        loop {
            let empty = interrupts::critical(|| self.waiters.lock().is_empty());
            if empty {
                break;
            }
            self.signal(lock);
        }
    }
}

impl Default for Condition {
    fn default() -> Self {
        Condition::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::thread::Thread;
    use crate::scheduler::{SchedPolicy, Scheduler};

    fn noop(_arg: usize) {}

    fn mk(sched: &mut Scheduler, id: i64, priority: i32) -> Tid {
        sched.admit(Thread::new_kernel(Tid(id), "t", priority, noop, 0))
    }

    #[test]
    fn waiters_queue_in_priority_order_with_fifo_ties() {
        let mut s = Scheduler::new(SchedPolicy::RoundRobin);
        let a = mk(&mut s, 1, 20);
        let b = mk(&mut s, 2, 30);
        let c = mk(&mut s, 3, 20);
        let mut inner = SemaInner {
            value: 0,
            waiters: Vec::new(),
        };
        inner.enqueue_ordered(&s, a);
        inner.enqueue_ordered(&s, b);
        inner.enqueue_ordered(&s, c);
        assert_eq!(inner.waiters, alloc::vec![b, a, c]);
    }

    #[test]
    fn wake_picks_highest_priority_at_wake_time() {
        let mut s = Scheduler::new(SchedPolicy::RoundRobin);
        let a = mk(&mut s, 1, 20);
        let b = mk(&mut s, 2, 30);
        let mut inner = SemaInner {
            value: 0,
            waiters: Vec::new(),
        };
        inner.enqueue_ordered(&s, a);
        inner.enqueue_ordered(&s, b);

        // a is donated a higher priority while it waits; the re-sort at
        // wake time must notice.
        s.threads.get_mut(&a).unwrap().priority = 50;
        assert_eq!(inner.take_highest(&s), Some(a));
        assert_eq!(inner.take_highest(&s), Some(b));
        assert_eq!(inner.take_highest(&s), None);
    }

    #[test]
    fn try_down_never_blocks() {
        let sema = Semaphore::new(1);
        assert!(sema.try_down());
        assert!(!sema.try_down());
        assert_eq!(sema.value(), 0);
    }

    #[test]
    fn top_priority_of_empty_set_is_minimum() {
        let s = Scheduler::new(SchedPolicy::RoundRobin);
        let inner = SemaInner {
            value: 0,
            waiters: Vec::new(),
        };
        assert_eq!(inner.top_priority(&s), PRI_MIN);
    }

    #[test]
    fn lock_ids_are_unique() {
        let a = Lock::new();
        let b = Lock::new();
        assert_ne!(a.id(), b.id());
    }
}
