use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::context::{Context, IntrFrame};
use super::mlfqs::Fixed;
use super::sync::{LockId, Semaphore};
use crate::memory::paging::RootId;
use crate::process::fd_table::FdTable;

/// Unique thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tid(pub i64);

/// Returned when a thread cannot be created or a child lookup fails.
pub const TID_ERROR: Tid = Tid(-1);

pub const PRI_MIN: i32 = 0;
pub const PRI_DEFAULT: i32 = 31;
pub const PRI_MAX: i32 = 63;

pub const NICE_MIN: i32 = -20;
pub const NICE_DEFAULT: i32 = 0;
pub const NICE_MAX: i32 = 20;

/// Size of each thread's kernel stack (16 KiB).
pub const THREAD_STACK_SIZE: usize = 4096 * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// A thread control block. User processes are threads that additionally own
/// an address space, a supplemental page table keyed by their tid, a file
/// descriptor table and the executable they were loaded from.
pub struct Thread {
    pub tid: Tid,
    pub name: String,
    pub status: ThreadStatus,

    /// Priority the thread was created with or last explicitly set to.
    pub init_priority: i32,
    /// Scheduling priority, possibly raised by donation.
    pub priority: i32,
    pub nice: i32,
    pub recent_cpu: Fixed,

    /// Tick at which a sleeping thread becomes due.
    pub wakeup_tick: i64,
    /// The lock this thread is blocked acquiring, if any.
    pub wait_on_lock: Option<LockId>,
    /// Threads that lent us their priority, highest effective first.
    pub donations: Vec<Tid>,

    pub parent: Option<Tid>,
    pub children: Vec<Tid>,

    pub context: Context,
    /// Owned kernel stack memory, kept alive as long as the thread exists.
    pub kernel_stack: Box<[u8]>,

    pub address_space: Option<RootId>,
    pub fd_table: Option<FdTable>,
    /// The executable image, held open with writes denied until exit.
    pub running_file: Option<Arc<spin::Mutex<crate::fs::file::File>>>,
    pub exit_status: i32,

    /// Upped by the child once fork either finished or failed.
    pub fork_done: Arc<Semaphore>,
    /// Upped by the exiting child to release a waiting parent.
    pub wait_done: Arc<Semaphore>,
    /// Upped by the parent once it has collected the exit status.
    pub exit_ack: Arc<Semaphore>,

    /// User-mode frame captured at the fork syscall, for the child to copy.
    pub parent_if: Option<IntrFrame>,
    /// Lowest mapped stack page, for growth bookkeeping.
    pub stack_bottom: u64,
    /// rsp from the last user-to-kernel transition.
    pub user_rsp: u64,
}

impl Thread {
    fn base(tid: Tid, name: &str, priority: i32, context: Context, stack: Box<[u8]>) -> Self {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        Thread {
            tid,
            name: String::from(name),
            status: ThreadStatus::Ready,
            init_priority: priority,
            priority,
            nice: NICE_DEFAULT,
            recent_cpu: Fixed::ZERO,
            wakeup_tick: 0,
            wait_on_lock: None,
            donations: Vec::new(),
            parent: None,
            children: Vec::new(),
            context,
            kernel_stack: stack,
            address_space: None,
            fd_table: None,
            running_file: None,
            exit_status: 0,
            fork_done: Arc::new(Semaphore::new(0)),
            wait_done: Arc::new(Semaphore::new(0)),
            exit_ack: Arc::new(Semaphore::new(0)),
            parent_if: None,
            stack_bottom: 0,
            user_rsp: 0,
        }
    }

    /// A fresh kernel thread that will run `entry(arg)` on first dispatch.
    pub fn new_kernel(tid: Tid, name: &str, priority: i32, entry: fn(usize), arg: usize) -> Self {
        let stack = vec![0u8; THREAD_STACK_SIZE].into_boxed_slice();
        let mut stack_top = stack.as_ptr() as u64 + THREAD_STACK_SIZE as u64;
        stack_top &= !0xF;
        let context = Context::new_kernel(entry, arg, stack_top);
        Thread::base(tid, name, priority, context, stack)
    }

    /// The already-running boot CPU context, adopted as a thread. Its
    /// context is filled in at the first switch away from it.
    pub fn bootstrap(tid: Tid, name: &str) -> Self {
        let mut t = Thread::base(tid, name, PRI_DEFAULT, Context::empty(), Vec::new().into_boxed_slice());
        t.status = ThreadStatus::Running;
        t
    }

    pub fn kernel_stack_top(&self) -> u64 {
        let mut top = self.kernel_stack.as_ptr() as u64 + self.kernel_stack.len() as u64;
        top &= !0xF;
        top
    }

    pub fn is_user_process(&self) -> bool {
        self.address_space.is_some()
    }
}
