pub mod frame_alloc;
pub mod paging;

use alloc::string::String;

/// Size of a page in bytes.
pub const PGSIZE: usize = 4096;
/// Bits of the page offset.
pub const PGBITS: usize = 12;
/// Page offset mask.
pub const PGMASK: u64 = (PGSIZE as u64) - 1;

/// First kernel virtual address. Everything below is user space.
pub const KERN_BASE: u64 = 0x8004_0000_0000;
/// Top of the user stack; the stack grows downward from here.
pub const USER_STACK: u64 = 0x4748_0000;
/// The stack may grow to at most 1 MiB.
pub const MAX_STACK: u64 = 1024 * 1024;

/// Number of pages in the user frame pool.
pub const USER_POOL_PAGES: usize = 1024;

#[inline]
pub fn pg_round_down(va: u64) -> u64 {
    va & !PGMASK
}

#[inline]
pub fn pg_round_up(va: u64) -> u64 {
    (va + PGMASK) & !PGMASK
}

#[inline]
pub fn pg_ofs(va: u64) -> u64 {
    va & PGMASK
}

#[inline]
pub fn is_user_vaddr(va: u64) -> bool {
    va < KERN_BASE
}

#[cfg(not(test))]
mod heap {
    use linked_list_allocator::LockedHeap;

    #[global_allocator]
    static ALLOCATOR: LockedHeap = LockedHeap::empty();

    const HEAP_SIZE: usize = 8 * 1024 * 1024;
    static mut HEAP_SPACE: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

    pub fn init() {
        unsafe {
            ALLOCATOR
                .lock()
                .init(&raw mut HEAP_SPACE as *mut u8, HEAP_SIZE);
        }
    }
}

/// Bring up the heap and read the boot command line out of the Multiboot2
/// info structure. Returns the command line, if the bootloader passed one.
#[cfg(not(test))]
pub fn init(multiboot_info_addr: usize) -> Option<String> {
    heap::init();
    log::info!("Kernel heap initialized.");

    let boot_info = unsafe {
        multiboot2::BootInformation::load(multiboot_info_addr as *const _)
            .expect("Failed to load Multiboot2 info!")
    };

    let cmdline = boot_info
        .command_line_tag()
        .and_then(|tag| tag.cmdline().ok())
        .map(String::from);

    if let Some(ref c) = cmdline {
        log::info!("Boot command line: {}", c);
    }
    cmdline
}

#[cfg(test)]
pub fn init(_multiboot_info_addr: usize) -> Option<String> {
    None
}
