//! Ring 3 support: the int 0x80 system-call entry and construction of the
//! iretq frames that carry a thread into user mode.

use core::arch::naked_asm;

use crate::scheduler::context::{do_iret, IntrFrame};

/// RFLAGS for user mode: IF set, reserved bit 1 always set.
const USER_RFLAGS: u64 = 0x202;

/// The int 0x80 handler, entered from ring 3. Pushes the full register
/// file so the dispatcher sees (and can rewrite) a complete IntrFrame:
/// fork needs every user register, and the result goes back through rax.
#[unsafe(naked)]
pub extern "C" fn syscall_entry() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        dispatch = sym crate::syscalls::syscall_dispatch,
    );
}

/// Build an iretq frame that starts user execution at RIP with stack RSP.
pub fn user_frame(rip: u64, rsp: u64) -> IntrFrame {
    let mut frame = IntrFrame::zeroed();
    frame.rip = rip;
    frame.rsp = rsp;
    frame.cs = super::gdt::user_code_selector().0 as u64;
    frame.ss = super::gdt::user_data_selector().0 as u64;
    frame.rflags = USER_RFLAGS;
    frame
}

/// Drop to ring 3 (or resume a forked child's user context). Never
/// returns.
///
/// # Safety
/// The frame must describe a valid user context in the active address
/// space.
pub unsafe fn enter(frame: &IntrFrame) -> ! {
    do_iret(frame as *const IntrFrame)
}
