//! User-process lifecycle: spawn the initial program, load ELF images
//! lazily, fork, exec, wait and exit, plus argument marshaling onto the
//! user stack.

pub mod fd_table;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::interrupts;
use crate::interrupts::usermode;
use crate::loader::elf::{self, ExecError};
use crate::memory::paging::{self, AddressSpace, ROOTS};
use crate::memory::{pg_round_up, PGMASK, PGSIZE, USER_STACK};
use crate::scheduler::context::IntrFrame;
use crate::scheduler::{self, Tid, PRI_DEFAULT, TID_ERROR};
use crate::vm::page::{SegmentInit, TargetKind};
use crate::vm::VM;
use fd_table::FdTable;

/// Launch the first user program. The command line is copied to a scratch
/// allocation and its first token names the thread.
pub fn spawn_initial(cmdline: &str) -> Result<Tid, ()> {
    let name = match cmdline.split_whitespace().next() {
        Some(n) => String::from(n),
        None => return Err(()),
    };
    let copy = Box::new(String::from(cmdline));
    let tid = scheduler::spawn(&name, PRI_DEFAULT, initd, Box::into_raw(copy) as usize);
    if tid == TID_ERROR {
        Err(())
    } else {
        Ok(tid)
    }
}

/// Entry of the initial process thread: become the user program.
fn initd(arg: usize) {
    let cmdline = unsafe { Box::from_raw(arg as *mut String) };
    if exec(&cmdline) < 0 {
        panic!("failed to launch initial process '{}'", cmdline);
    }
    unreachable!();
}

/// Replace the current process image. Tears down the old user memory,
/// loads the new executable and irets into it; returns -1 only when that
/// fails.
pub fn exec(cmdline: &str) -> i64 {
    let args: Vec<String> = cmdline.split_whitespace().map(String::from).collect();
    if args.is_empty() {
        return -1;
    }

    // The old image dies first; from here on failure cannot return to the
    // caller's user context.
    cleanup_current();

    let mut frame = IntrFrame::zeroed();
    match load(&args, &mut frame) {
        Ok(()) => unsafe { usermode::enter(&frame) },
        Err(e) => {
            log::error!("exec of '{}' failed: {}", args[0], e);
            -1
        }
    }
}

/// Load ARGS[0] into a fresh address space and fill FRAME with the user
/// entry context, arguments marshaled.
fn load(args: &[String], frame: &mut IntrFrame) -> Result<(), ExecError> {
    let cur = scheduler::current_tid();

    let root = interrupts::critical(|| ROOTS.lock().create());
    scheduler::with_scheduler(|s| {
        let t = s.thread_mut(cur).expect("loading with no thread");
        t.address_space = Some(root);
        t.name = args[0].clone();
        if t.fd_table.is_none() {
            t.fd_table = Some(FdTable::new());
        }
    });
    interrupts::critical(|| {
        ROOTS.lock().activate(root);
        VM.lock().create_spt(cur);
    });

    let file = crate::fs::open(&args[0]).map_err(|_| ExecError::FileNotFound)?;
    let file = Arc::new(Mutex::new(file));

    // Nobody writes an executable while it runs. The deny lasts until the
    // handle is closed at process exit, not until the load finishes.
    file.lock().deny_write();
    let image = elf::read_image(&file.lock())?;
    scheduler::with_scheduler(|s| {
        s.thread_mut(cur).unwrap().running_file = Some(file.clone());
    });

    for seg in &image.segments {
        register_segment(cur, &file, seg)?;
    }

    // The stack page is the one page not loaded lazily: argument
    // marshaling writes to it right now.
    let stack_page = USER_STACK - PGSIZE as u64;
    let stack_ready = interrupts::critical(|| {
        let mut vm = VM.lock();
        let mut roots = ROOTS.lock();
        vm.alloc_stack_page(cur, stack_page) && vm.claim_page(&mut roots, cur, root, stack_page)
    });
    if !stack_ready {
        return Err(ExecError::MemoryError);
    }
    scheduler::with_scheduler(|s| s.thread_mut(cur).unwrap().stack_bottom = stack_page);

    *frame = usermode::user_frame(image.entry, USER_STACK);

    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    let marshaled = interrupts::critical(|| {
        let mut roots = ROOTS.lock();
        let aspace = roots.get_mut(root).expect("fresh root vanished");
        setup_arguments(&arg_refs, frame, aspace)
    });
    if !marshaled {
        return Err(ExecError::MemoryError);
    }
    Ok(())
}

/// Register one PT_LOAD segment as a run of UNINIT pages, each carrying
/// the (file, offset, read_bytes) triple its first fault will need.
fn register_segment(
    tid: Tid,
    file: &Arc<Mutex<crate::fs::file::File>>,
    seg: &elf::Segment,
) -> Result<(), ExecError> {
    let page_offset = seg.vaddr & PGMASK;
    let mut read_bytes = if seg.filesz > 0 {
        (page_offset + seg.filesz) as usize
    } else {
        0
    };
    let mut zero_bytes = pg_round_up(page_offset + seg.memsz) as usize - read_bytes;
    let mut va = seg.vaddr & !PGMASK;
    let mut offset = (seg.offset & !PGMASK) as usize;

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = core::cmp::min(read_bytes, PGSIZE);
        let page_zero = PGSIZE - page_read;
        let init = if page_read > 0 {
            Some(SegmentInit {
                file: file.clone(),
                offset,
                read_bytes: page_read,
            })
        } else {
            None
        };
        let ok = interrupts::critical(|| {
            VM.lock()
                .alloc_page_with_initializer(tid, TargetKind::Anon, va, seg.writable, init)
        });
        if !ok {
            return Err(ExecError::MemoryError);
        }
        read_bytes -= page_read;
        zero_bytes -= page_zero;
        va += PGSIZE as u64;
        offset += page_read;
    }
    Ok(())
}

/// Marshal ARGS onto the user stack per the entry ABI: strings pushed in
/// reverse (each nul-terminated), rsp aligned down to 8, a null argv
/// terminator, the argv pointers in reverse, and a fake return address of
/// zero. rdi gets argc, rsi the address of argv[0].
pub fn setup_arguments(args: &[&str], frame: &mut IntrFrame, aspace: &mut AddressSpace) -> bool {
    let mut rsp = frame.rsp;
    let mut arg_addrs: Vec<u64> = Vec::with_capacity(args.len());

    for arg in args.iter().rev() {
        let bytes = arg.as_bytes();
        rsp -= bytes.len() as u64 + 1;
        if !paging::write_user(aspace, rsp, bytes) {
            return false;
        }
        if !paging::write_user(aspace, rsp + bytes.len() as u64, &[0]) {
            return false;
        }
        arg_addrs.push(rsp);
    }

    while rsp % 8 != 0 {
        rsp -= 1;
        if !paging::write_user(aspace, rsp, &[0]) {
            return false;
        }
    }

    // argv[argc] terminator, then the argument pointers, last first.
    rsp -= 8;
    if !paging::write_user(aspace, rsp, &0u64.to_le_bytes()) {
        return false;
    }
    for addr in &arg_addrs {
        rsp -= 8;
        if !paging::write_user(aspace, rsp, &addr.to_le_bytes()) {
            return false;
        }
    }

    rsp -= 8;
    if !paging::write_user(aspace, rsp, &0u64.to_le_bytes()) {
        return false;
    }

    frame.rsp = rsp;
    frame.rdi = args.len() as u64;
    frame.rsi = rsp + 8;
    true
}

/// Clone the current process. The parent gets the child's tid (or
/// TID_ERROR), the child resumes in user mode with rax = 0.
pub fn fork(frame: &IntrFrame) -> Tid {
    let parent = scheduler::current_tid();
    let name = scheduler::with_scheduler(|s| {
        let t = s.thread_mut(parent).expect("fork with no thread");
        t.parent_if = Some(*frame);
        t.name.clone()
    });

    let child = scheduler::spawn(&name, PRI_DEFAULT, fork_child_entry, parent.0 as usize);
    if child == TID_ERROR {
        return TID_ERROR;
    }

    // The child signals once its copy either finished or failed.
    let fork_done = match scheduler::with_scheduler(|s| s.thread(child).map(|t| t.fork_done.clone()))
    {
        Some(sema) => sema,
        None => return TID_ERROR,
    };
    fork_done.down();

    let failed =
        scheduler::with_scheduler(|s| s.thread(child).map_or(true, |t| t.exit_status == -1));
    if failed {
        return TID_ERROR;
    }
    child
}

fn fork_child_entry(arg: usize) {
    let parent = Tid(arg as i64);
    let me = scheduler::current_tid();

    match duplicate_process(parent, me) {
        Some(frame) => {
            let fork_done =
                scheduler::with_scheduler(|s| s.thread(me).unwrap().fork_done.clone());
            fork_done.up();
            unsafe { usermode::enter(&frame) }
        }
        None => {
            let fork_done = scheduler::with_scheduler(|s| {
                let t = s.thread_mut(me).unwrap();
                t.exit_status = -1;
                t.fork_done.clone()
            });
            fork_done.up();
            exit(-1);
        }
    }
}

/// Copy everything the child needs from the parent: the saved user frame
/// (with rax zeroed), the address space, and the descriptor table.
fn duplicate_process(parent: Tid, me: Tid) -> Option<IntrFrame> {
    let (mut frame, fdt, running, stack_bottom) = scheduler::with_scheduler(|s| {
        let p = s.thread(parent)?;
        let frame = p.parent_if?;
        let fdt = p.fd_table.as_ref().map(|f| f.duplicate());
        let running = p.running_file.clone();
        Some((frame, fdt, running, p.stack_bottom))
    })?;
    frame.rax = 0;

    let root = interrupts::critical(|| ROOTS.lock().create());
    scheduler::with_scheduler(|s| {
        s.thread_mut(me).unwrap().address_space = Some(root);
    });
    let copied = interrupts::critical(|| {
        let mut vm = VM.lock();
        let mut roots = ROOTS.lock();
        roots.activate(root);
        vm.copy_spt(&mut roots, parent, me, root)
    });
    if !copied {
        return None;
    }

    // The child holds its own deny on the executable.
    let running = running.map(|f| {
        let dup = f.lock().duplicate();
        Arc::new(Mutex::new(dup))
    });

    scheduler::with_scheduler(|s| {
        let t = s.thread_mut(me).unwrap();
        t.fd_table = fdt;
        t.running_file = running;
        t.stack_bottom = stack_bottom;
    });
    Some(frame)
}

/// Wait for CHILD to exit and collect its status. -1 if CHILD is not a
/// live child of the caller; a second wait for the same child also gets
/// -1, since the first wait unlinked it.
pub fn wait(child: Tid) -> i32 {
    let cur = scheduler::current_tid();
    let semas = scheduler::with_scheduler(|s| {
        let me = s.thread(cur)?;
        if !me.children.contains(&child) {
            return None;
        }
        let c = s.thread(child)?;
        Some((c.wait_done.clone(), c.exit_ack.clone()))
    });
    let (wait_done, exit_ack) = match semas {
        Some(x) => x,
        None => return -1,
    };

    wait_done.down();

    let status = scheduler::with_scheduler(|s| {
        let status = s.thread(child).map_or(-1, |t| t.exit_status);
        if let Some(me) = s.thread_mut(cur) {
            me.children.retain(|&c| c != child);
        }
        status
    });
    // The child may now free its TCB.
    exit_ack.up();
    status
}

/// Terminate the current process with STATUS. Never returns.
pub fn exit(status: i32) -> ! {
    let cur = scheduler::current_tid();

    let (name, is_user, wait_done, exit_ack, orphan_acks) = scheduler::with_scheduler(|s| {
        let children = s.thread(cur).map(|t| t.children.clone()).unwrap_or_default();
        // Children nobody will ever wait for must not block forever on
        // their exit handshake.
        let orphan_acks: Vec<_> = children
            .iter()
            .filter_map(|c| s.thread(*c).map(|t| t.exit_ack.clone()))
            .collect();
        let t = s.thread_mut(cur).expect("exit with no thread");
        t.exit_status = status;
        (
            t.name.clone(),
            t.is_user_process(),
            t.wait_done.clone(),
            t.exit_ack.clone(),
            orphan_acks,
        )
    });

    if is_user {
        crate::println!("{}: exit({})", name, status);
    }

    // Close every descriptor and the executable; dropping the last handle
    // on the image re-allows writes to it.
    scheduler::with_scheduler(|s| {
        let t = s.thread_mut(cur).unwrap();
        t.fd_table = None;
        t.running_file = None;
    });

    cleanup_current();

    for ack in orphan_acks {
        ack.up();
    }
    wait_done.up();
    exit_ack.down();
    scheduler::exit();
}

/// Free the current process's user memory. The ordering is load-bearing:
/// the thread's root reference is nulled, the kernel-only root activated,
/// and only then are the dying root's structures freed, so a timer tick
/// can never reactivate a freed root.
fn cleanup_current() {
    let cur = scheduler::current_tid();
    let root = scheduler::with_scheduler(|s| {
        let t = s.thread_mut(cur)?;
        t.running_file.take();
        t.address_space.take()
    });
    if let Some(root) = root {
        interrupts::critical(|| {
            let mut vm = VM.lock();
            let mut roots = ROOTS.lock();
            roots.activate(paging::KERNEL_ROOT);
            vm.kill_spt(&mut roots, cur, root);
            roots.destroy(root);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_alloc::FramePool;
    use crate::memory::paging::read_user;

    fn stack_aspace(pool: &mut FramePool) -> AddressSpace {
        let mut aspace = AddressSpace::new();
        let kva = pool.alloc_zeroed().unwrap();
        assert!(aspace.set_mapping(USER_STACK - PGSIZE as u64, kva, true));
        aspace
    }

    fn read_u64(aspace: &mut AddressSpace, addr: u64) -> u64 {
        let mut buf = [0u8; 8];
        assert!(read_user(aspace, addr, &mut buf));
        u64::from_le_bytes(buf)
    }

    fn read_cstr(aspace: &mut AddressSpace, addr: u64) -> String {
        let mut out = Vec::new();
        let mut a = addr;
        loop {
            let mut b = [0u8; 1];
            assert!(read_user(aspace, a, &mut b));
            if b[0] == 0 {
                break;
            }
            out.push(b[0]);
            a += 1;
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn argument_stack_layout_matches_the_entry_abi() {
        let mut pool = FramePool::new(1);
        let mut aspace = stack_aspace(&mut pool);
        let mut frame = IntrFrame::zeroed();
        frame.rsp = USER_STACK;

        assert!(setup_arguments(&["echo", "x", "y", "z"], &mut frame, &mut aspace));

        assert_eq!(frame.rdi, 4);
        assert_eq!(frame.rsi, frame.rsp + 8);
        assert_eq!(frame.rsp % 8, 0);

        // Upward from rsp: fake return address, argv[0..3], terminator.
        assert_eq!(read_u64(&mut aspace, frame.rsp), 0);
        let argv: Vec<u64> = (0..4)
            .map(|i| read_u64(&mut aspace, frame.rsp + 8 + i * 8))
            .collect();
        assert_eq!(read_u64(&mut aspace, frame.rsp + 8 + 4 * 8), 0);

        assert_eq!(read_cstr(&mut aspace, argv[0]), "echo");
        assert_eq!(read_cstr(&mut aspace, argv[1]), "x");
        assert_eq!(read_cstr(&mut aspace, argv[2]), "y");
        assert_eq!(read_cstr(&mut aspace, argv[3]), "z");

        // Strings sit above the pointer array, below the stack top.
        assert!(argv.iter().all(|&a| a > frame.rsp && a < USER_STACK));
    }

    #[test]
    fn single_argument_program_gets_argc_one() {
        let mut pool = FramePool::new(1);
        let mut aspace = stack_aspace(&mut pool);
        let mut frame = IntrFrame::zeroed();
        frame.rsp = USER_STACK;

        assert!(setup_arguments(&["prog"], &mut frame, &mut aspace));
        assert_eq!(frame.rdi, 1);
        assert_eq!(read_u64(&mut aspace, frame.rsi), read_u64(&mut aspace, frame.rsp + 8));
        let argv0_ptr = read_u64(&mut aspace, frame.rsi);
        assert_eq!(read_cstr(&mut aspace, argv0_ptr), "prog");
    }
}
