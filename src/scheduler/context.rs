use core::arch::naked_asm;

/// CPU register context saved/restored during context switches.
/// All callee-saved registers on x86_64 System V ABI.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Context {
    /// Create an empty context (used for the boot thread).
    pub fn empty() -> Self {
        Context {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
        }
    }

    /// Context for a fresh kernel thread. The first dispatch enters the
    /// entry trampoline, which calls `entry(arg)` and exits the thread if
    /// that ever returns. Entry and arg travel in r12/r13.
    pub fn new_kernel(entry: fn(usize), arg: usize, stack_top: u64) -> Self {
        // Stack must be 16-byte aligned per System V ABI, minus 8 so the
        // first `call` inside the trampoline lands aligned.
        let aligned_sp = (stack_top - 8) & !0xF;

        Context {
            rsp: aligned_sp,
            rbp: 0,
            rbx: 0,
            r12: entry as usize as u64,
            r13: arg as u64,
            r14: 0,
            r15: 0,
            rip: thread_entry_trampoline as usize as u64,
        }
    }
}

/// First code a new thread runs. Interrupts come back on (the scheduler
/// switches with them off), then `entry(arg)` from r12/r13; a return from
/// the entry function terminates the thread.
#[unsafe(naked)]
pub extern "C" fn thread_entry_trampoline() {
    unsafe {
        naked_asm!(
            "sti",
            "mov rdi, r13",
            "call r12",
            "call {exit}",
            exit = sym crate::scheduler::thread_exit_on_return,
        );
    }
}

/// Switch context from `old` to `new`.
/// Saves callee-saved registers into `old`, restores from `new`.
///
/// # Safety
/// Both pointers must be valid Context structs with valid stack pointers,
/// and interrupts must be disabled.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old: *mut Context, new: *const Context) {
    naked_asm!(
        // Save callee-saved registers into `old` (rdi = old ptr)
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        // Save return address as RIP
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        // Restore callee-saved registers from `new` (rsi = new ptr)
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        // Jump to the new thread's RIP
        "jmp [rsi + 0x38]",
        // This is where we return when switched back to `old`
        "2:",
        "ret",
    );
}

/// Full CPU state captured at a user/kernel boundary crossing. The layout
/// matches what the interrupt stubs push: fifteen general-purpose registers
/// below the five-word frame the CPU pushes itself.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IntrFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    // Pushed automatically by the CPU.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl IntrFrame {
    /// A zeroed frame; the caller fills in segments, rip and rsp.
    pub fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

/// Launch the context in `frame` via iretq. Used to enter user mode for the
/// first time and to materialize a forked child's saved frame.
///
/// # Safety
/// The frame must describe a valid, resumable context.
#[unsafe(naked)]
pub unsafe extern "C" fn do_iret(frame: *const IntrFrame) -> ! {
    naked_asm!(
        "mov rsp, rdi",
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
    );
}
