pub mod gdt;
pub mod idt;
pub mod usermode;

use core::sync::atomic::{AtomicUsize, Ordering};

/// Depth of nesting into external interrupt handlers.
static ISR_DEPTH: AtomicUsize = AtomicUsize::new(0);

pub fn init() {
    gdt::init();
    idt::init();
    unsafe { idt::PICS.lock().initialize() };
}

/// Run F with maskable interrupts disabled, restoring the previous state
/// afterwards. Every access to scheduler or VM registries goes through
/// here so the tick handler can never observe them mid-update.
#[cfg(not(test))]
pub fn critical<T>(f: impl FnOnce() -> T) -> T {
    x86_64::instructions::interrupts::without_interrupts(f)
}

#[cfg(test)]
pub fn critical<T>(f: impl FnOnce() -> T) -> T {
    f()
}

/// True while handling an external interrupt. Code that might sleep
/// asserts this is false; wake-ups from here defer preemption to the
/// interrupt return path.
pub fn in_interrupt() -> bool {
    ISR_DEPTH.load(Ordering::SeqCst) > 0
}

pub(crate) fn enter_isr() {
    ISR_DEPTH.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn leave_isr() {
    ISR_DEPTH.fetch_sub(1, Ordering::SeqCst);
}
