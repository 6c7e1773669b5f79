pub mod context;
pub mod mlfqs;
pub mod sync;
pub mod thread;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use crate::interrupts;
use crate::memory::paging;
use context::{switch_context, Context};
use mlfqs::Fixed;
pub use sync::{Condition, Lock, Semaphore};
pub use thread::{Thread, ThreadStatus, Tid, PRI_DEFAULT, PRI_MAX, PRI_MIN, TID_ERROR};

/// Ticks each thread gets before the tick handler requests a yield.
pub const TIME_SLICE: u32 = 4;

/// Longest wait_on_lock -> holder chain the donation walk follows.
pub const DONATION_DEPTH_MAX: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Priority scheduling with round-robin among equals (default).
    RoundRobin,
    /// 4BSD multilevel feedback queue; priorities are derived, donation off.
    Mlfqs,
}

/// The global scheduler state: every live thread, the ready and sleep
/// queues, and which thread holds which lock (for donation chains).
pub struct Scheduler {
    pub(crate) threads: BTreeMap<Tid, Box<Thread>>,
    /// Ready tids, effective priority descending, FIFO among equals.
    pub(crate) ready: Vec<Tid>,
    /// Sleeping tids; wakeup_tick lives on the TCB.
    pub(crate) sleepers: Vec<Tid>,
    /// LockId -> current holder, maintained by Lock acquire/release.
    pub(crate) lock_holders: BTreeMap<sync::LockId, Tid>,
    pub(crate) current: Option<Tid>,
    pub(crate) idle: Option<Tid>,
    pub(crate) policy: SchedPolicy,
    pub(crate) load_avg: Fixed,
    /// Ticks consumed by the current thread's slice.
    pub(crate) slice: u32,
    /// Dying threads whose TCBs are freed at a later schedule() entry.
    reap: Vec<Tid>,
}

impl Scheduler {
    pub fn new(policy: SchedPolicy) -> Self {
        Scheduler {
            threads: BTreeMap::new(),
            ready: Vec::new(),
            sleepers: Vec::new(),
            lock_holders: BTreeMap::new(),
            current: None,
            idle: None,
            policy,
            load_avg: Fixed::ZERO,
            slice: 0,
            reap: Vec::new(),
        }
    }

    pub fn policy(&self) -> SchedPolicy {
        self.policy
    }

    pub fn current(&self) -> Option<Tid> {
        self.current
    }

    pub fn thread(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(&tid).map(|b| &**b)
    }

    pub fn thread_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.get_mut(&tid).map(|b| &mut **b)
    }

    /// Effective priority of a thread; PRI_MIN for the idle thread or a
    /// tid that already died.
    pub fn priority_of(&self, tid: Tid) -> i32 {
        self.threads.get(&tid).map_or(PRI_MIN, |t| t.priority)
    }

    /// Take ownership of a fresh TCB. Ready threads enter the ready queue
    /// in priority order.
    pub fn admit(&mut self, t: Thread) -> Tid {
        let tid = t.tid;
        let ready = t.status == ThreadStatus::Ready;
        self.threads.insert(tid, Box::new(t));
        if ready {
            self.insert_ready(tid);
        }
        tid
    }

    /// Ordered insert: before the first strictly lower priority, so equal
    /// priorities keep FIFO order.
    fn insert_ready(&mut self, tid: Tid) {
        debug_assert!(Some(tid) != self.idle);
        let p = self.priority_of(tid);
        let pos = self
            .ready
            .iter()
            .position(|&o| self.priority_of(o) < p)
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, tid);
    }

    /// BLOCKED -> READY. Does not preempt; callers that need preemption
    /// run a preemption test afterwards.
    pub fn unblock(&mut self, tid: Tid) {
        let t = self.threads.get_mut(&tid).expect("unblocking unknown thread");
        assert_eq!(t.status, ThreadStatus::Blocked);
        t.status = ThreadStatus::Ready;
        if Some(tid) != self.idle {
            self.insert_ready(tid);
        }
    }

    /// Whether the front of the ready queue outranks the running thread.
    pub fn should_preempt(&self) -> bool {
        match (self.current, self.ready.first()) {
            (Some(cur), Some(&front)) => self.priority_of(front) > self.priority_of(cur),
            _ => false,
        }
    }

    fn pick_next(&mut self) -> Option<Tid> {
        if self.ready.is_empty() {
            self.idle
        } else {
            Some(self.ready.remove(0))
        }
    }

    /// Move every sleeper whose wakeup tick has arrived to the ready queue.
    pub fn wake_due(&mut self, now: i64) -> usize {
        let due: Vec<Tid> = self
            .sleepers
            .iter()
            .copied()
            .filter(|t| self.threads.get(t).map_or(true, |t| t.wakeup_tick <= now))
            .collect();
        self.sleepers.retain(|t| !due.contains(t));
        for &t in &due {
            if self.threads.contains_key(&t) {
                self.unblock(t);
            }
        }
        due.len()
    }

    /// Re-place TID in the ready queue after its priority changed.
    fn reposition_ready(&mut self, tid: Tid) {
        if let Some(pos) = self.ready.iter().position(|&t| t == tid) {
            self.ready.remove(pos);
            self.insert_ready(tid);
        }
    }

    // ── Priority donation bookkeeping ────────────────────────────────

    /// Record that WAITER is blocked acquiring LOCK and lend its priority
    /// to the holder's donation list (ordered, highest first).
    pub fn register_donation(&mut self, waiter: Tid, lock: sync::LockId) {
        let holder = match self.lock_holders.get(&lock) {
            Some(&h) => h,
            None => return,
        };
        if let Some(w) = self.threads.get_mut(&waiter) {
            w.wait_on_lock = Some(lock);
        }
        let wp = self.priority_of(waiter);
        let idx = {
            let dons = &self.threads[&holder].donations;
            dons.iter()
                .position(|&d| self.priority_of(d) < wp)
                .unwrap_or(dons.len())
        };
        self.threads
            .get_mut(&holder)
            .expect("lock holder vanished")
            .donations
            .insert(idx, waiter);
    }

    /// Walk wait_on_lock -> holder from START, lifting each holder to the
    /// highest donor priority seen. Bounded at DONATION_DEPTH_MAX hops.
    pub fn donate_chain(&mut self, start: Tid) {
        let mut cur = start;
        for _ in 0..DONATION_DEPTH_MAX {
            let lock = match self.threads.get(&cur).and_then(|t| t.wait_on_lock) {
                Some(l) => l,
                None => break,
            };
            let holder = match self.lock_holders.get(&lock) {
                Some(&h) => h,
                None => break,
            };
            let p = self.priority_of(cur);
            if self.priority_of(holder) < p {
                self.threads.get_mut(&holder).unwrap().priority = p;
                self.reposition_ready(holder);
            }
            cur = holder;
        }
    }

    /// Drop every donor of HOLDER that is waiting on LOCK (called when
    /// HOLDER releases it).
    pub fn remove_donations_for(&mut self, holder: Tid, lock: sync::LockId) {
        let keep: Vec<Tid> = self.threads[&holder]
            .donations
            .iter()
            .copied()
            .filter(|d| {
                self.threads.get(d).and_then(|t| t.wait_on_lock) != Some(lock)
            })
            .collect();
        self.threads.get_mut(&holder).unwrap().donations = keep;
    }

    /// Recompute TID's effective priority: its base, or the best remaining
    /// donation if that is higher. Donations are re-sorted first since
    /// donor priorities may have changed while they waited.
    pub fn refresh_priority(&mut self, tid: Tid) {
        let base = self.threads[&tid].init_priority;
        let mut dons = core::mem::take(&mut self.threads.get_mut(&tid).unwrap().donations);
        dons.sort_by(|a, b| self.priority_of(*b).cmp(&self.priority_of(*a)));
        let mut p = base;
        if let Some(&front) = dons.first() {
            p = p.max(self.priority_of(front));
        }
        let t = self.threads.get_mut(&tid).unwrap();
        t.donations = dons;
        t.priority = p;
        self.reposition_ready(tid);
    }

    pub fn clear_wait_on_lock(&mut self, tid: Tid) {
        if let Some(t) = self.threads.get_mut(&tid) {
            t.wait_on_lock = None;
        }
    }

    // ── 4BSD bookkeeping ─────────────────────────────────────────────

    /// Runnable threads for the load average: ready queue plus the
    /// running thread unless that is the idle thread.
    fn ready_thread_count(&self) -> i32 {
        let running = match self.current {
            Some(cur) if Some(cur) != self.idle => 1,
            _ => 0,
        };
        self.ready.len() as i32 + running
    }

    /// Per-tick MLFQ work: charge the running thread, then the periodic
    /// load_avg / recent_cpu / priority recomputations.
    pub fn mlfqs_tick(&mut self, now: i64) {
        if let Some(cur) = self.current {
            if Some(cur) != self.idle {
                let t = self.threads.get_mut(&cur).unwrap();
                t.recent_cpu = t.recent_cpu.add_int(1);
            }
        }

        if now % crate::timer::TIMER_FREQ == 0 {
            self.load_avg = mlfqs::next_load_avg(self.load_avg, self.ready_thread_count());
            let load_avg = self.load_avg;
            let idle = self.idle;
            for (tid, t) in self.threads.iter_mut() {
                if Some(*tid) == idle {
                    continue;
                }
                t.recent_cpu = mlfqs::decayed_recent_cpu(t.recent_cpu, load_avg, t.nice);
            }
        }

        if now % mlfqs::PRIORITY_RECALC_TICKS == 0 {
            let idle = self.idle;
            for (tid, t) in self.threads.iter_mut() {
                if Some(*tid) == idle {
                    continue;
                }
                t.priority = mlfqs::priority_for(t.recent_cpu, t.nice);
                t.init_priority = t.priority;
            }
            let mut ready = core::mem::take(&mut self.ready);
            ready.sort_by(|a, b| self.priority_of(*b).cmp(&self.priority_of(*a)));
            self.ready = ready;
        }
    }

    /// Free TCBs queued for destruction on an earlier switch. Runs at
    /// schedule() entry, from a different thread's stack.
    fn reap_dead(&mut self) {
        while let Some(tid) = self.reap.pop() {
            debug_assert!(Some(tid) != self.current);
            self.threads.remove(&tid);
        }
    }
}

lazy_static! {
    pub static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new(SchedPolicy::RoundRobin));
}

static NEXT_TID: Mutex<i64> = Mutex::new(2);
static YIELD_PENDING: AtomicBool = AtomicBool::new(false);

lazy_static! {
    static ref TID_LOCK: Lock = Lock::new();
}

/// Run F against the locked scheduler with interrupts off.
pub fn with_scheduler<T>(f: impl FnOnce(&mut Scheduler) -> T) -> T {
    interrupts::critical(|| f(&mut SCHEDULER.lock()))
}

/// Set up the scheduler and adopt the boot CPU context as thread "main".
pub fn init(policy: SchedPolicy) {
    interrupts::critical(|| {
        let mut sched = SCHEDULER.lock();
        sched.policy = policy;
        let main = Thread::bootstrap(Tid(1), "main");
        sched.threads.insert(Tid(1), Box::new(main));
        sched.current = Some(Tid(1));
    });
    log::info!("Scheduler initialized ({:?} policy).", policy);
}

/// Spawn the idle thread and enable preemptive scheduling.
pub fn start() {
    let tid = allocate_tid();
    let mut idle = Thread::new_kernel(tid, "idle", PRI_MIN, idle_entry, 0);
    idle.status = ThreadStatus::Blocked;
    interrupts::critical(|| {
        let mut sched = SCHEDULER.lock();
        sched.admit(idle);
        sched.idle = Some(tid);
    });
    x86_64::instructions::interrupts::enable();
    log::info!("Preemptive scheduling enabled.");
}

fn idle_entry(_arg: usize) {
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

/// Grab a tid from the monotonic counter.
pub fn allocate_tid() -> Tid {
    TID_LOCK.acquire();
    let tid = {
        let mut next = NEXT_TID.lock();
        let t = *next;
        *next += 1;
        Tid(t)
    };
    TID_LOCK.release();
    tid
}

/// Create a kernel thread running `entry(arg)` and enqueue it. The new
/// thread may preempt the caller immediately if it outranks it.
pub fn spawn(name: &str, priority: i32, entry: fn(usize), arg: usize) -> Tid {
    let tid = allocate_tid();
    let mut t = Thread::new_kernel(tid, name, priority, entry, arg);
    interrupts::critical(|| {
        let mut sched = SCHEDULER.lock();
        if sched.policy == SchedPolicy::Mlfqs {
            t.priority = mlfqs::priority_for(t.recent_cpu, t.nice);
            t.init_priority = t.priority;
        }
        if let Some(cur) = sched.current {
            t.parent = Some(cur);
            sched.threads.get_mut(&cur).unwrap().children.push(tid);
        }
        sched.admit(t);
    });
    test_preemption();
    tid
}

pub fn current_tid() -> Tid {
    interrupts::critical(|| SCHEDULER.lock().current.expect("no running thread"))
}

pub fn current_name() -> String {
    with_scheduler(|s| {
        let cur = s.current.expect("no running thread");
        s.threads[&cur].name.clone()
    })
}

/// RUNNING -> BLOCKED; schedules away. Returns once another thread
/// unblocks us. Interrupts must not be relied upon to stay enabled.
pub fn block_current() {
    interrupts::critical(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current.expect("block with no running thread");
        sched.threads.get_mut(&cur).unwrap().status = ThreadStatus::Blocked;
        schedule_locked(sched);
    });
}

/// BLOCKED -> READY for TID, without preempting the caller.
pub fn unblock(tid: Tid) {
    with_scheduler(|s| s.unblock(tid));
}

/// Give up the CPU; the current thread goes back into the ready queue
/// behind its priority peers.
pub fn yield_now() {
    interrupts::critical(|| {
        let mut sched = SCHEDULER.lock();
        let cur = match sched.current {
            Some(c) => c,
            None => return,
        };
        if sched.ready.is_empty() {
            return;
        }
        sched.threads.get_mut(&cur).unwrap().status = ThreadStatus::Ready;
        if Some(cur) != sched.idle {
            sched.insert_ready(cur);
        }
        schedule_locked(sched);
    });
}

/// Sleep until ticks() >= TICK.
pub fn sleep_until(tick: i64) {
    interrupts::critical(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current.expect("sleep with no running thread");
        assert!(Some(cur) != sched.idle, "the idle thread cannot sleep");
        {
            let t = sched.threads.get_mut(&cur).unwrap();
            t.wakeup_tick = tick;
            t.status = ThreadStatus::Blocked;
        }
        sched.sleepers.push(cur);
        schedule_locked(sched);
    });
}

/// Kill the current thread. The TCB is reaped after the next switch so we
/// never free the stack we are running on.
pub fn exit() -> ! {
    interrupts::critical(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current.expect("exit with no running thread");
        sched.threads.get_mut(&cur).unwrap().status = ThreadStatus::Dying;
        schedule_locked(sched);
    });
    unreachable!("a dying thread was rescheduled");
}

/// Entered when a thread's entry function returns.
pub extern "C" fn thread_exit_on_return() -> ! {
    exit()
}

/// Timer tick hook: wake due sleepers, run MLFQ bookkeeping, and request
/// a yield when the slice expires or a higher-priority thread became ready.
pub fn on_tick(now: i64) {
    let mut sched = SCHEDULER.lock();
    sched.wake_due(now);
    if sched.policy == SchedPolicy::Mlfqs {
        sched.mlfqs_tick(now);
    }
    sched.slice += 1;
    let preempt = sched.slice >= TIME_SLICE || sched.should_preempt();
    drop(sched);
    if preempt {
        YIELD_PENDING.store(true, Ordering::SeqCst);
    }
}

/// Called by the interrupt stubs just before iretq.
pub fn yield_if_pending() {
    if YIELD_PENDING.swap(false, Ordering::SeqCst) {
        yield_now();
    }
}

/// Yield when a higher-priority thread is ready; from interrupt context,
/// defer to interrupt return.
pub fn test_preemption() {
    let preempt = interrupts::critical(|| SCHEDULER.lock().should_preempt());
    if preempt {
        if interrupts::in_interrupt() {
            YIELD_PENDING.store(true, Ordering::SeqCst);
        } else {
            yield_now();
        }
    }
}

/// Set the current thread's base priority. A no-op under MLFQ, where
/// priorities are derived.
pub fn set_priority(new_priority: i32) {
    let changed = interrupts::critical(|| {
        let mut sched = SCHEDULER.lock();
        if sched.policy == SchedPolicy::Mlfqs {
            return false;
        }
        let cur = sched.current.expect("no running thread");
        sched.threads.get_mut(&cur).unwrap().init_priority = new_priority;
        sched.refresh_priority(cur);
        true
    });
    if changed {
        test_preemption();
    }
}

pub fn get_priority() -> i32 {
    with_scheduler(|s| {
        let cur = s.current.expect("no running thread");
        s.priority_of(cur)
    })
}

pub fn set_nice(nice: i32) {
    let nice = nice.clamp(thread::NICE_MIN, thread::NICE_MAX);
    interrupts::critical(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current.expect("no running thread");
        let t = sched.threads.get_mut(&cur).unwrap();
        t.nice = nice;
        if sched.policy == SchedPolicy::Mlfqs {
            let t = sched.threads.get_mut(&cur).unwrap();
            t.priority = mlfqs::priority_for(t.recent_cpu, t.nice);
            t.init_priority = t.priority;
        }
    });
    test_preemption();
}

pub fn get_nice() -> i32 {
    with_scheduler(|s| s.threads[&s.current.unwrap()].nice)
}

/// 100x the system load average, rounded to nearest.
pub fn get_load_avg() -> i32 {
    with_scheduler(|s| mlfqs::hundredths(s.load_avg))
}

/// 100x the current thread's recent_cpu, rounded to nearest.
pub fn get_recent_cpu() -> i32 {
    with_scheduler(|s| mlfqs::hundredths(s.threads[&s.current.unwrap()].recent_cpu))
}

/// Pick the next thread and switch to it. Consumes the guard: the lock is
/// dropped before the actual context switch.
fn schedule_locked(mut sched: spin::MutexGuard<'_, Scheduler>) {
    sched.reap_dead();

    let cur = sched.current.expect("schedule with no current thread");
    let next = match sched.pick_next() {
        Some(n) if n != cur => n,
        Some(_) => {
            // Only ourselves to run.
            sched.threads.get_mut(&cur).unwrap().status = ThreadStatus::Running;
            return;
        }
        None => {
            let status = sched.threads[&cur].status;
            assert_eq!(
                status,
                ThreadStatus::Ready,
                "no runnable thread and the current one cannot continue"
            );
            sched.threads.get_mut(&cur).unwrap().status = ThreadStatus::Running;
            return;
        }
    };

    sched.slice = 0;
    sched.threads.get_mut(&next).unwrap().status = ThreadStatus::Running;
    sched.current = Some(next);

    // Activate the incoming address space and kernel stack before resuming.
    let root = sched.threads[&next]
        .address_space
        .unwrap_or(paging::KERNEL_ROOT);
    paging::ROOTS.lock().activate(root);
    crate::interrupts::gdt::set_tss_rsp0(sched.threads[&next].kernel_stack_top());

    if sched.threads[&cur].status == ThreadStatus::Dying {
        sched.reap.push(cur);
    }

    let old_ctx = &mut sched.threads.get_mut(&cur).unwrap().context as *mut Context;
    let new_ctx = &sched.threads[&next].context as *const Context;

    // The TCBs are boxed, so these pointers stay valid after the guard
    // drops; nothing may touch the scheduler lock across the switch.
    drop(sched);
    unsafe { switch_context(old_ctx, new_ctx) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_arg: usize) {}

    fn mk(sched: &mut Scheduler, id: i64, priority: i32) -> Tid {
        sched.admit(Thread::new_kernel(Tid(id), "t", priority, noop, 0))
    }

    fn running(sched: &mut Scheduler, id: i64, priority: i32) -> Tid {
        let tid = mk(sched, id, priority);
        sched.ready.retain(|&t| t != tid);
        sched.threads.get_mut(&tid).unwrap().status = ThreadStatus::Running;
        sched.current = Some(tid);
        tid
    }

    #[test]
    fn ready_queue_orders_by_priority() {
        let mut s = Scheduler::new(SchedPolicy::RoundRobin);
        let low = mk(&mut s, 1, 10);
        let high = mk(&mut s, 2, 30);
        let mid = mk(&mut s, 3, 20);
        assert_eq!(s.ready, alloc::vec![high, mid, low]);
    }

    #[test]
    fn equal_priorities_run_fifo() {
        let mut s = Scheduler::new(SchedPolicy::RoundRobin);
        let a = mk(&mut s, 1, 20);
        let b = mk(&mut s, 2, 20);
        let c = mk(&mut s, 3, 20);
        assert_eq!(s.ready, alloc::vec![a, b, c]);
        assert_eq!(s.pick_next(), Some(a));
        assert_eq!(s.pick_next(), Some(b));
        assert_eq!(s.pick_next(), Some(c));
    }

    #[test]
    fn dispatch_order_follows_creation_priorities() {
        // Threads created with priorities 30, 20, 10 run in that order.
        let mut s = Scheduler::new(SchedPolicy::RoundRobin);
        let t30 = mk(&mut s, 1, 30);
        let t20 = mk(&mut s, 2, 20);
        let t10 = mk(&mut s, 3, 10);
        assert_eq!(s.pick_next(), Some(t30));
        assert_eq!(s.pick_next(), Some(t20));
        assert_eq!(s.pick_next(), Some(t10));
        assert_eq!(s.pick_next(), None);
    }

    #[test]
    fn idle_runs_only_when_ready_is_empty() {
        let mut s = Scheduler::new(SchedPolicy::RoundRobin);
        let idle = mk(&mut s, 9, PRI_MIN);
        s.ready.retain(|&t| t != idle);
        s.threads.get_mut(&idle).unwrap().status = ThreadStatus::Blocked;
        s.idle = Some(idle);

        let a = mk(&mut s, 1, 5);
        assert_eq!(s.pick_next(), Some(a));
        assert_eq!(s.pick_next(), Some(idle));
        assert!(!s.ready.contains(&idle));
    }

    #[test]
    fn sleepers_wake_when_due_and_not_before() {
        let mut s = Scheduler::new(SchedPolicy::RoundRobin);
        let a = mk(&mut s, 1, 20);
        let b = mk(&mut s, 2, 25);
        for &(tid, tick) in &[(a, 100i64), (b, 200i64)] {
            s.ready.retain(|&t| t != tid);
            let t = s.threads.get_mut(&tid).unwrap();
            t.status = ThreadStatus::Blocked;
            t.wakeup_tick = tick;
            s.sleepers.push(tid);
        }

        assert_eq!(s.wake_due(99), 0);
        assert!(s.ready.is_empty());

        assert_eq!(s.wake_due(100), 1);
        assert_eq!(s.ready, alloc::vec![a]);
        assert_eq!(s.threads[&a].status, ThreadStatus::Ready);

        assert_eq!(s.wake_due(500), 1);
        assert_eq!(s.ready, alloc::vec![b, a]);
        assert!(s.sleepers.is_empty());
    }

    #[test]
    fn preemption_check_compares_against_front() {
        let mut s = Scheduler::new(SchedPolicy::RoundRobin);
        let _cur = running(&mut s, 1, 20);
        mk(&mut s, 2, 10);
        assert!(!s.should_preempt());
        mk(&mut s, 3, 25);
        assert!(s.should_preempt());
    }

    #[test]
    fn donation_lifts_holder_and_release_restores() {
        // Holder at 10; waiters at 20 then 30 donate; release drops to 10.
        let mut s = Scheduler::new(SchedPolicy::RoundRobin);
        let l = running(&mut s, 1, 10);
        let m = mk(&mut s, 2, 20);
        let h = mk(&mut s, 3, 30);
        let lock_id = 7;
        s.lock_holders.insert(lock_id, l);

        s.register_donation(m, lock_id);
        s.donate_chain(m);
        assert_eq!(s.priority_of(l), 20);

        s.register_donation(h, lock_id);
        s.donate_chain(h);
        assert_eq!(s.priority_of(l), 30);
        assert_eq!(s.threads[&l].donations, alloc::vec![h, m]);

        s.lock_holders.remove(&lock_id);
        s.remove_donations_for(l, lock_id);
        s.refresh_priority(l);
        assert_eq!(s.priority_of(l), 10);
        assert!(s.threads[&l].donations.is_empty());
    }

    #[test]
    fn release_keeps_donations_from_other_locks() {
        let mut s = Scheduler::new(SchedPolicy::RoundRobin);
        let holder = running(&mut s, 1, 10);
        let w1 = mk(&mut s, 2, 25);
        let w2 = mk(&mut s, 3, 35);
        s.lock_holders.insert(1, holder);
        s.lock_holders.insert(2, holder);
        s.register_donation(w1, 1);
        s.donate_chain(w1);
        s.register_donation(w2, 2);
        s.donate_chain(w2);
        assert_eq!(s.priority_of(holder), 35);

        // Releasing lock 2 keeps w1's donation on lock 1 active.
        s.lock_holders.remove(&2);
        s.remove_donations_for(holder, 2);
        s.refresh_priority(holder);
        assert_eq!(s.priority_of(holder), 25);
    }

    #[test]
    fn nested_donation_reaches_the_chain_bottom() {
        // a (30) waits on lock1 held by b (20), which waits on lock2 held
        // by c (10). Both intermediates end up at 30.
        let mut s = Scheduler::new(SchedPolicy::RoundRobin);
        let c = running(&mut s, 3, 10);
        let b = mk(&mut s, 2, 20);
        let a = mk(&mut s, 1, 30);
        s.lock_holders.insert(2, c);
        s.register_donation(b, 2);
        s.donate_chain(b);
        assert_eq!(s.priority_of(c), 20);

        s.lock_holders.insert(1, b);
        s.register_donation(a, 1);
        s.donate_chain(a);
        assert_eq!(s.priority_of(b), 30);
        assert_eq!(s.priority_of(c), 30);
    }

    #[test]
    fn donation_chain_stops_after_eight_hops() {
        let mut s = Scheduler::new(SchedPolicy::RoundRobin);
        // Ten threads: thread i waits on lock i held by thread i+1.
        let tids: Vec<Tid> = (1..=10).map(|i| mk(&mut s, i, 10)).collect();
        for i in 0..9 {
            let lock_id = (i + 1) as u64;
            s.lock_holders.insert(lock_id, tids[i + 1]);
            s.threads.get_mut(&tids[i]).unwrap().wait_on_lock = Some(lock_id);
        }
        s.threads.get_mut(&tids[0]).unwrap().priority = 60;
        s.donate_chain(tids[0]);

        // Eight holders lifted; the ninth hop is past the depth bound.
        for t in &tids[1..9] {
            assert_eq!(s.priority_of(*t), 60);
        }
        assert_eq!(s.priority_of(tids[9]), 10);
    }

    #[test]
    fn refresh_resorts_stale_donations() {
        let mut s = Scheduler::new(SchedPolicy::RoundRobin);
        let holder = running(&mut s, 1, 5);
        let d1 = mk(&mut s, 2, 20);
        let d2 = mk(&mut s, 3, 10);
        s.lock_holders.insert(1, holder);
        s.register_donation(d1, 1);
        s.register_donation(d2, 1);
        assert_eq!(s.threads[&holder].donations, alloc::vec![d1, d2]);

        // d2's priority rises while it waits; refresh must notice.
        s.threads.get_mut(&d2).unwrap().priority = 40;
        s.refresh_priority(holder);
        assert_eq!(s.priority_of(holder), 40);
        assert_eq!(s.threads[&holder].donations, alloc::vec![d2, d1]);
    }

    #[test]
    fn mlfqs_tick_charges_and_recomputes() {
        let mut s = Scheduler::new(SchedPolicy::Mlfqs);
        let cur = running(&mut s, 1, PRI_MAX);
        let other = mk(&mut s, 2, PRI_MAX);

        // Four ticks: recent_cpu grows, priorities recomputed on tick 4.
        for now in 1..=4 {
            s.mlfqs_tick(now);
        }
        assert_eq!(s.threads[&cur].recent_cpu.to_int(), 4);
        assert_eq!(s.threads[&cur].priority, PRI_MAX - 1);
        assert_eq!(s.threads[&other].priority, PRI_MAX);
        assert!(s.should_preempt());
    }

    #[test]
    fn mlfqs_second_boundary_updates_load_avg() {
        let mut s = Scheduler::new(SchedPolicy::Mlfqs);
        let _cur = running(&mut s, 1, PRI_MAX);
        mk(&mut s, 2, PRI_MAX);
        s.mlfqs_tick(crate::timer::TIMER_FREQ);
        // Two runnable threads: load_avg = 2/60.
        assert_eq!(mlfqs::hundredths(s.load_avg), 3);
    }

    #[test]
    fn idle_is_excluded_from_mlfqs() {
        let mut s = Scheduler::new(SchedPolicy::Mlfqs);
        let idle = mk(&mut s, 9, PRI_MIN);
        s.ready.retain(|&t| t != idle);
        s.threads.get_mut(&idle).unwrap().status = ThreadStatus::Running;
        s.idle = Some(idle);
        s.current = Some(idle);

        s.mlfqs_tick(4);
        assert_eq!(s.threads[&idle].recent_cpu, Fixed::ZERO);
        assert_eq!(s.threads[&idle].priority, PRI_MIN);
    }
}
