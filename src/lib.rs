#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod serial;
pub mod console;
pub mod interrupts;
pub mod memory;
pub mod timer;
pub mod scheduler;
pub mod fs;
pub mod loader;
pub mod vm;
pub mod process;
pub mod syscalls;

#[cfg(not(test))]
use core::panic::PanicInfo;

/// Kernel entry, jumped to from boot.asm with the Multiboot2 info pointer.
#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn _start(multiboot_info_addr: usize) -> ! {
    serial::init();
    interrupts::init();
    log::info!("EmberOS kernel started.");

    let cmdline = memory::init(multiboot_info_addr);

    let mlfqs = cmdline.as_deref().map_or(false, |c| c.contains("-o mlfqs"));
    scheduler::init(if mlfqs {
        scheduler::SchedPolicy::Mlfqs
    } else {
        scheduler::SchedPolicy::RoundRobin
    });

    timer::init();
    fs::init();
    vm::init();
    syscalls::init();

    // Idle thread comes up and preemptive scheduling begins here.
    scheduler::start();

    // Everything after "--" on the boot command line is the initial program.
    if let Some(cmd) = cmdline
        .as_deref()
        .and_then(|c| c.split_once("--"))
        .map(|(_, run)| run.trim())
    {
        if !cmd.is_empty() {
            match process::spawn_initial(cmd) {
                Ok(tid) => {
                    let status = process::wait(tid);
                    log::info!("initial process finished with status {}", status);
                }
                Err(_) => log::error!("could not launch initial process '{}'", cmd),
            }
        }
    }

    println!("EmberOS is up.");
    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("{}", info);
    log::error!("{}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
