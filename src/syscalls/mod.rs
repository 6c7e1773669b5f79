//! System-call dispatch. Entered from the int 0x80 stub with the caller's
//! full register frame; the call number is in rax, arguments in rdi, rsi,
//! rdx, r10, r8, r9, and the result goes back through rax.
//!
//! Every pointer argument is validated against the caller's address
//! space; a bad pointer terminates the caller with status -1.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::fs::{self, FS_LOCK};
use crate::interrupts;
use crate::memory::is_user_vaddr;
use crate::memory::paging::{RootId, ROOTS};
use crate::process;
use crate::process::fd_table::FdEntry;
use crate::scheduler::context::IntrFrame;
use crate::scheduler::{self, Tid};
use crate::vm::VM;

pub const SYS_HALT: u64 = 0;
pub const SYS_EXIT: u64 = 1;
pub const SYS_FORK: u64 = 2;
pub const SYS_EXEC: u64 = 3;
pub const SYS_WAIT: u64 = 4;
pub const SYS_CREATE: u64 = 5;
pub const SYS_REMOVE: u64 = 6;
pub const SYS_OPEN: u64 = 7;
pub const SYS_FILESIZE: u64 = 8;
pub const SYS_READ: u64 = 9;
pub const SYS_WRITE: u64 = 10;
pub const SYS_SEEK: u64 = 11;
pub const SYS_TELL: u64 = 12;
pub const SYS_CLOSE: u64 = 13;
pub const SYS_DUP2: u64 = 14;

/// Largest single read/write the kernel will stage.
const IO_MAX: usize = 1024 * 1024;
/// Longest string argument (paths, command lines).
const STR_MAX: usize = crate::memory::PGSIZE;

pub fn init() {
    log::info!("System-call interface ready.");
}

/// Kill the caller for a protocol violation (bad pointer, bad number).
fn kill_caller() -> ! {
    process::exit(-1)
}

/// The caller's identity for user-memory access. Only user processes make
/// system calls.
fn caller() -> (Tid, RootId) {
    let ids = scheduler::with_scheduler(|s| {
        let cur = s.current()?;
        let root = s.thread(cur)?.address_space?;
        Some((cur, root))
    });
    match ids {
        Some(x) => x,
        None => kill_caller(),
    }
}

fn user_rsp() -> u64 {
    scheduler::with_scheduler(|s| {
        let cur = s.current().unwrap();
        s.thread(cur).map_or(0, |t| t.user_rsp)
    })
}

/// Copy LEN bytes in from user memory; terminates the caller on any
/// invalid address.
fn copy_in(uva: u64, len: usize) -> Vec<u8> {
    if len == 0 {
        return Vec::new();
    }
    if uva == 0 || !is_user_vaddr(uva) {
        kill_caller();
    }
    let (tid, root) = caller();
    let rsp = user_rsp();
    let mut buf = vec![0u8; len];
    let ok = interrupts::critical(|| {
        let mut vm = VM.lock();
        let mut roots = ROOTS.lock();
        vm.user_read(&mut roots, tid, root, uva, &mut buf, rsp)
    });
    if !ok {
        kill_caller();
    }
    buf
}

/// Copy BUF out to user memory; terminates the caller on any invalid
/// address.
fn copy_out(uva: u64, buf: &[u8]) {
    if buf.is_empty() {
        return;
    }
    if uva == 0 || !is_user_vaddr(uva) {
        kill_caller();
    }
    let (tid, root) = caller();
    let rsp = user_rsp();
    let ok = interrupts::critical(|| {
        let mut vm = VM.lock();
        let mut roots = ROOTS.lock();
        vm.user_write(&mut roots, tid, root, uva, buf, rsp)
    });
    if !ok {
        kill_caller();
    }
}

/// Copy a nul-terminated user string in, bounded at STR_MAX.
fn copy_in_cstr(uva: u64) -> String {
    if uva == 0 || !is_user_vaddr(uva) {
        kill_caller();
    }
    let (tid, root) = caller();
    let rsp = user_rsp();
    let mut out = Vec::new();
    for i in 0..STR_MAX as u64 {
        let mut byte = [0u8; 1];
        let ok = interrupts::critical(|| {
            let mut vm = VM.lock();
            let mut roots = ROOTS.lock();
            vm.user_read(&mut roots, tid, root, uva + i, &mut byte, rsp)
        });
        if !ok {
            kill_caller();
        }
        if byte[0] == 0 {
            return String::from_utf8(out).unwrap_or_else(|_| kill_caller());
        }
        out.push(byte[0]);
    }
    kill_caller()
}

fn fd_entry(fd: i32) -> Option<FdEntry> {
    scheduler::with_scheduler(|s| {
        let cur = s.current()?;
        s.thread(cur)?.fd_table.as_ref()?.get(fd)
    })
}

fn power_off() -> ! {
    use x86_64::instructions::port::Port;
    log::info!("Powering off.");
    unsafe { Port::<u16>::new(0x604).write(0x2000u16) };
    loop {
        x86_64::instructions::hlt();
    }
}

fn sys_open(name_uva: u64) -> i32 {
    let name = copy_in_cstr(name_uva);
    FS_LOCK.acquire();
    let opened = fs::open(&name);
    FS_LOCK.release();
    match opened {
        Ok(file) => {
            let file = Arc::new(Mutex::new(file));
            scheduler::with_scheduler(|s| {
                let cur = s.current().unwrap();
                s.thread_mut(cur)
                    .and_then(|t| t.fd_table.as_mut())
                    .map_or(-1, |fdt| fdt.add(file))
            })
        }
        Err(_) => -1,
    }
}

fn sys_read(fd: i32, buf_uva: u64, len: usize) -> i64 {
    if len > IO_MAX {
        return -1;
    }
    match fd_entry(fd) {
        Some(FdEntry::Stdin) => {
            let mut staged = Vec::with_capacity(len);
            for _ in 0..len {
                staged.push(crate::console::input_getc());
            }
            copy_out(buf_uva, &staged);
            staged.len() as i64
        }
        Some(FdEntry::File(file)) => {
            let mut staged = vec![0u8; len];
            FS_LOCK.acquire();
            let n = file.lock().read(&mut staged);
            FS_LOCK.release();
            copy_out(buf_uva, &staged[..n]);
            n as i64
        }
        _ => -1,
    }
}

fn sys_write(fd: i32, buf_uva: u64, len: usize) -> i64 {
    if len > IO_MAX {
        return -1;
    }
    let staged = copy_in(buf_uva, len);
    match fd_entry(fd) {
        Some(FdEntry::Stdout) | Some(FdEntry::Stderr) => {
            crate::console::putbuf(&staged);
            staged.len() as i64
        }
        Some(FdEntry::File(file)) => {
            FS_LOCK.acquire();
            let n = file.lock().write(&staged);
            FS_LOCK.release();
            n as i64
        }
        _ => -1,
    }
}

/// Central dispatcher, called with a pointer to the caller's saved frame.
pub extern "C" fn syscall_dispatch(frame: *mut IntrFrame) {
    let frame = unsafe { &mut *frame };

    // Remember where the user stack was; the VM engine needs it for
    // stack-growth decisions while we work on the caller's behalf.
    scheduler::with_scheduler(|s| {
        let cur = s.current().expect("syscall with no thread");
        if let Some(t) = s.thread_mut(cur) {
            t.user_rsp = frame.rsp;
        }
    });

    // The gate masked interrupts; system calls run preemptible.
    x86_64::instructions::interrupts::enable();

    let nr = frame.rax;
    frame.rax = match nr {
        SYS_HALT => power_off(),
        SYS_EXIT => process::exit(frame.rdi as i32),
        SYS_FORK => process::fork(frame).0 as u64,
        SYS_EXEC => {
            let cmdline = copy_in_cstr(frame.rdi);
            process::exec(&cmdline);
            // The old image is gone; there is no caller context to hand
            // -1 back to.
            kill_caller()
        }
        SYS_WAIT => process::wait(Tid(frame.rdi as i64)) as i64 as u64,
        SYS_CREATE => {
            let name = copy_in_cstr(frame.rdi);
            FS_LOCK.acquire();
            let ok = fs::create(&name, frame.rsi as usize);
            FS_LOCK.release();
            ok as u64
        }
        SYS_REMOVE => {
            let name = copy_in_cstr(frame.rdi);
            FS_LOCK.acquire();
            let ok = fs::remove(&name);
            FS_LOCK.release();
            ok as u64
        }
        SYS_OPEN => sys_open(frame.rdi) as i64 as u64,
        SYS_FILESIZE => match fd_entry(frame.rdi as i32) {
            Some(FdEntry::File(file)) => file.lock().length() as u64,
            _ => (-1i64) as u64,
        },
        SYS_READ => sys_read(frame.rdi as i32, frame.rsi, frame.rdx as usize) as u64,
        SYS_WRITE => sys_write(frame.rdi as i32, frame.rsi, frame.rdx as usize) as u64,
        SYS_SEEK => {
            if let Some(FdEntry::File(file)) = fd_entry(frame.rdi as i32) {
                file.lock().seek(frame.rsi as usize);
            }
            0
        }
        SYS_TELL => match fd_entry(frame.rdi as i32) {
            Some(FdEntry::File(file)) => file.lock().tell() as u64,
            _ => (-1i64) as u64,
        },
        SYS_CLOSE => {
            scheduler::with_scheduler(|s| {
                let cur = s.current().unwrap();
                s.thread_mut(cur)
                    .and_then(|t| t.fd_table.as_mut())
                    .map_or(false, |fdt| fdt.close(frame.rdi as i32))
            });
            0
        }
        SYS_DUP2 => scheduler::with_scheduler(|s| {
            let cur = s.current().unwrap();
            s.thread_mut(cur)
                .and_then(|t| t.fd_table.as_mut())
                .map_or(-1, |fdt| fdt.dup2(frame.rdi as i32, frame.rsi as i32))
        }) as i64 as u64,
        _ => {
            log::warn!("unknown system call {}", nr);
            kill_caller()
        }
    };
}
