//! 8254 timer: the kernel's monotonic tick source. The ISR does two
//! things only: bump the counter and run the scheduler tick hook.

use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::interrupts;
use crate::scheduler;

/// Timer interrupts per second.
pub const TIMER_FREQ: i64 = 100;

static TICKS: Mutex<i64> = Mutex::new(0);

/// Program the PIT to fire TIMER_FREQ times per second.
pub fn init() {
    // 8254 input frequency divided by TIMER_FREQ, rounded to nearest.
    let count: u16 = ((1_193_180 + TIMER_FREQ as u32 / 2) / TIMER_FREQ as u32) as u16;
    unsafe {
        Port::<u8>::new(0x43).write(0x34u8); // counter 0, LSB then MSB, mode 2
        Port::<u8>::new(0x40).write((count & 0xff) as u8);
        Port::<u8>::new(0x40).write((count >> 8) as u8);
    }
    log::info!("8254 timer programmed at {} Hz.", TIMER_FREQ);
}

/// Ticks since boot. Read with interrupts off to avoid torn reads.
pub fn ticks() -> i64 {
    interrupts::critical(|| *TICKS.lock())
}

/// Ticks elapsed since THEN, a value previously returned by ticks().
pub fn elapsed(then: i64) -> i64 {
    ticks() - then
}

/// Suspend the caller for approximately DURATION ticks. No busy waiting;
/// the thread sleeps until its wakeup tick.
pub fn sleep(duration: i64) {
    if duration <= 0 {
        return;
    }
    let start = ticks();
    scheduler::sleep_until(start + duration);
}

/// Suspend the caller for approximately MS milliseconds.
pub fn msleep(ms: i64) {
    sleep(ms * TIMER_FREQ / 1000);
}

/// Timer interrupt body. Runs in external interrupt context.
pub fn tick_isr() {
    let now = {
        let mut t = TICKS.lock();
        *t += 1;
        *t
    };
    scheduler::on_tick(now);
}
