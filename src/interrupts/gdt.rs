use lazy_static::lazy_static;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Kernel stack used for ring 3 -> ring 0 transitions until the scheduler
/// points rsp0 at the current thread's own stack.
const BOOT_KERNEL_STACK_SIZE: usize = 4096 * 5;
static mut BOOT_KERNEL_STACK: [u8; BOOT_KERNEL_STACK_SIZE] = [0; BOOT_KERNEL_STACK_SIZE];

/// Dedicated stack for the double-fault handler.
const DF_STACK_SIZE: usize = 4096 * 5;
static mut DF_STACK: [u8; DF_STACK_SIZE] = [0; DF_STACK_SIZE];

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            let stack_start = VirtAddr::from_ptr(unsafe { &raw const DF_STACK });
            stack_start + DF_STACK_SIZE as u64
        };

        tss.privilege_stack_table[0] = {
            let stack_start = VirtAddr::from_ptr(unsafe { &raw const BOOT_KERNEL_STACK });
            stack_start + BOOT_KERNEL_STACK_SIZE as u64
        };

        tss
    };
}

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
    pub tss: SegmentSelector,
}

lazy_static! {
    pub static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());
        let user_data = gdt.add_entry(Descriptor::user_data_segment());
        let user_code = gdt.add_entry(Descriptor::user_code_segment());
        let tss = gdt.add_entry(Descriptor::tss_segment(&TSS));
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                user_code,
                user_data,
                tss,
            },
        )
    };
}

pub fn init() {
    use x86_64::instructions::segmentation::{Segment, CS, DS, SS};
    use x86_64::instructions::tables::load_tss;

    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

/// User code segment selector with RPL=3.
pub fn user_code_selector() -> SegmentSelector {
    SegmentSelector::new(GDT.1.user_code.index(), x86_64::PrivilegeLevel::Ring3)
}

/// User data segment selector with RPL=3.
pub fn user_data_selector() -> SegmentSelector {
    SegmentSelector::new(GDT.1.user_data.index(), x86_64::PrivilegeLevel::Ring3)
}

/// Point the TSS rsp0 slot at the incoming thread's kernel stack so ring 3
/// traps land on it. Called on every context switch with interrupts off;
/// the CPU reads the TSS asynchronously, so a plain store is enough.
pub fn set_tss_rsp0(kernel_stack_top: u64) {
    unsafe {
        let tss_ptr = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(kernel_stack_top);
    }
}
