use core::arch::naked_asm;

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::VirtAddr;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Keyboard = PIC_1_OFFSET + 1,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

/// Software interrupt vector for system calls.
pub const SYSCALL_VECTOR: usize = 0x80;

// The handlers are naked stubs installed by address: they push the full
// register file themselves, so no special function ABI is needed. Stack
// layout at the rust handlers, in qwords from rsp: 0..=14 the pushed
// registers (r15 first), then [error code,] rip, cs, rflags, rsp, ss.
lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        unsafe {
            idt.breakpoint
                .set_handler_addr(VirtAddr::new(breakpoint_stub as usize as u64));
            idt.double_fault
                .set_handler_addr(VirtAddr::new(double_fault_stub as usize as u64))
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
            idt.general_protection_fault
                .set_handler_addr(VirtAddr::new(general_protection_stub as usize as u64));
            idt.page_fault
                .set_handler_addr(VirtAddr::new(page_fault_stub as usize as u64));
            idt[InterruptIndex::Timer.as_usize()]
                .set_handler_addr(VirtAddr::new(timer_stub as usize as u64));
            idt[InterruptIndex::Keyboard.as_usize()]
                .set_handler_addr(VirtAddr::new(keyboard_stub as usize as u64));
            idt[SYSCALL_VECTOR]
                .set_handler_addr(VirtAddr::new(
                    super::usermode::syscall_entry as usize as u64,
                ))
                .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
}

/// Timer (IRQ 0). Ticks the kernel clock, then honors a pending yield
/// request on the way out, while still on the interrupted thread's stack.
#[unsafe(naked)]
pub extern "C" fn timer_stub() {
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
        "call {handler}",
        "call {yield_check}",
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
        handler = sym timer_handler,
        yield_check = sym yield_on_return,
    );
}

extern "C" fn timer_handler(_regs: *mut u64) {
    super::enter_isr();
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
    crate::timer::tick_isr();
    super::leave_isr();
}

extern "C" fn yield_on_return() {
    crate::scheduler::yield_if_pending();
}

/// Keyboard (IRQ 1): read the scancode and queue the decoded byte.
#[unsafe(naked)]
pub extern "C" fn keyboard_stub() {
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
        "call {handler}",
        "call {yield_check}",
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
        handler = sym keyboard_handler,
        yield_check = sym yield_on_return,
    );
}

extern "C" fn keyboard_handler(_regs: *mut u64) {
    use x86_64::instructions::port::Port;

    super::enter_isr();
    let scancode: u8 = unsafe { Port::new(0x60).read() };
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }
    let ascii = crate::console::scancode_to_ascii(scancode);
    if ascii != 0 {
        crate::console::push_input(ascii);
    }
    super::leave_isr();
}

#[unsafe(naked)]
pub extern "C" fn breakpoint_stub() {
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
        "call {handler}",
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
        handler = sym breakpoint_handler,
    );
}

extern "C" fn breakpoint_handler(regs: *const u64) {
    let rip = unsafe { *regs.add(15) };
    log::error!("EXCEPTION: BREAKPOINT at {:#x}", rip);
}

/// Double fault pushes an error code; nothing to do but die loudly.
#[unsafe(naked)]
pub extern "C" fn double_fault_stub() {
    naked_asm!(
        "mov rdi, [rsp]",
        "mov rsi, [rsp + 8]",
        "call {handler}",
        handler = sym double_fault_handler,
    );
}

extern "C" fn double_fault_handler(error_code: u64, rip: u64) -> ! {
    panic!(
        "EXCEPTION: DOUBLE FAULT (error {:#x}) at {:#x}",
        error_code, rip
    );
}

/// General protection fault: a user process did something illegal and is
/// killed; from the kernel it is fatal.
#[unsafe(naked)]
pub extern "C" fn general_protection_stub() {
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
        "mov rdi, [rsp + 15*8]",
        "mov rsi, rsp",
        "sub rsp, 8",
        "call {handler}",
        "add rsp, 8",
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
        "add rsp, 8",
        "iretq",
        handler = sym general_protection_handler,
    );
}

extern "C" fn general_protection_handler(error_code: u64, regs: *const u64) {
    let cs = unsafe { *regs.add(17) };
    if cs & 0x3 == 3 {
        log::error!(
            "general protection fault in user code (error {:#x})",
            error_code
        );
        crate::process::exit(-1);
    }
    let rip = unsafe { *regs.add(16) };
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT (error {:#x}) at {:#x}",
        error_code, rip
    );
}

/// Page fault: hand the address to the VM engine; unresolvable faults
/// kill the offending process (or panic if the kernel itself faulted).
#[unsafe(naked)]
pub extern "C" fn page_fault_stub() {
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
        "mov rdi, [rsp + 15*8]",
        "mov rsi, cr2",
        "mov rdx, rsp",
        "sub rsp, 8",
        "call {handler}",
        "add rsp, 8",
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
        "add rsp, 8",
        "iretq",
        handler = sym page_fault_handler,
    );
}

extern "C" fn page_fault_handler(error_code: u64, fault_addr: u64, regs: *const u64) {
    let not_present = error_code & 1 == 0;
    let write = error_code & 2 != 0;
    let user = error_code & 4 != 0;

    // For user faults the interrupted rsp sits in the iret frame; kernel
    // faults on user memory use the rsp saved at the last syscall entry.
    let fault_rsp = if user {
        unsafe { *regs.add(19) }
    } else {
        crate::scheduler::with_scheduler(|s| {
            s.current()
                .and_then(|c| s.thread(c))
                .map_or(0, |t| t.user_rsp)
        })
    };

    if crate::vm::page_fault(fault_addr, write, user, not_present, fault_rsp) {
        return;
    }

    if user {
        crate::process::exit(-1);
    }
    let rip = unsafe { *regs.add(16) };
    panic!(
        "EXCEPTION: PAGE FAULT at {:#x} (rip {:#x}, error {:#x})",
        fault_addr, rip, error_code
    );
}
