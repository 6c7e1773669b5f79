use alloc::sync::Arc;
use spin::Mutex;

use super::frame::SwapTable;
use crate::fs::file::File;
use crate::memory::PGSIZE;

/// Lazy initializer for a page backed by an executable segment: read
/// READ_BYTES from FILE at OFFSET, zero-fill the rest of the page.
#[derive(Clone)]
pub struct SegmentInit {
    pub file: Arc<Mutex<File>>,
    pub offset: usize,
    pub read_bytes: usize,
}

/// What an UNINIT page becomes once materialized.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Anon,
    File,
}

/// Per-variant payload. UNINIT pages carry their constructor; ANON pages
/// remember their swap slot while evicted; FILE pages keep their backing
/// range for write-back.
pub enum PageKind {
    Uninit {
        target: TargetKind,
        init: Option<SegmentInit>,
    },
    Anon {
        swap_slot: Option<usize>,
    },
    File {
        init: SegmentInit,
    },
}

/// One user virtual page and everything the kernel knows about it beyond
/// the hardware page table.
pub struct Page {
    pub va: u64,
    pub writable: bool,
    /// Stack pages are created by growth and pinned while a system call
    /// writes through them.
    pub stack: bool,
    /// Back-reference into the frame table while materialized.
    pub frame: Option<usize>,
    pub kind: PageKind,
}

impl Page {
    pub fn new_uninit(va: u64, writable: bool, target: TargetKind, init: Option<SegmentInit>) -> Page {
        Page {
            va,
            writable,
            stack: false,
            frame: None,
            kind: PageKind::Uninit { target, init },
        }
    }

    /// A stack page: anonymous, writable, stack-marked.
    pub fn new_anon_stack(va: u64) -> Page {
        Page {
            va,
            writable: true,
            stack: true,
            frame: None,
            kind: PageKind::Anon { swap_slot: None },
        }
    }

    pub fn is_uninit(&self) -> bool {
        matches!(self.kind, PageKind::Uninit { .. })
    }

    /// Clone for fork: UNINIT pages keep their constructor so laziness
    /// survives; materialized pages become empty shells the caller fills
    /// by bytewise copy.
    pub fn clone_for_fork(&self) -> Page {
        let kind = match &self.kind {
            PageKind::Uninit { target, init } => PageKind::Uninit {
                target: *target,
                init: init.clone(),
            },
            PageKind::Anon { .. } => PageKind::Anon { swap_slot: None },
            PageKind::File { init } => PageKind::File { init: init.clone() },
        };
        Page {
            va: self.va,
            writable: self.writable,
            stack: self.stack,
            frame: None,
            kind,
        }
    }

    /// Materialize contents into the freshly mapped (zeroed) frame at KVA.
    /// For UNINIT pages this runs the lazy constructor and commits the
    /// page to its target type.
    pub fn swap_in(&mut self, kva: u64, swap: &mut SwapTable) -> bool {
        match &mut self.kind {
            PageKind::Uninit { .. } => {}
            PageKind::Anon { swap_slot } => {
                if let Some(slot) = swap_slot.take() {
                    swap.load(slot, kva);
                }
                // Never swapped out: the zeroed frame is the content.
                return true;
            }
            PageKind::File { init } => return load_from_file(init, kva),
        }

        // First touch of an UNINIT page: run the constructor, then commit
        // to the target type.
        let (target, init) = match core::mem::replace(
            &mut self.kind,
            PageKind::Anon { swap_slot: None },
        ) {
            PageKind::Uninit { target, init } => (target, init),
            _ => unreachable!(),
        };
        if let Some(si) = init.as_ref() {
            if !load_from_file(si, kva) {
                self.kind = PageKind::Uninit { target, init };
                return false;
            }
        }
        self.kind = match target {
            TargetKind::Anon => PageKind::Anon { swap_slot: None },
            TargetKind::File => PageKind::File {
                init: init.expect("file-backed page without a backing range"),
            },
        };
        true
    }

    /// Save contents before the frame is stolen: anonymous pages go to a
    /// swap slot, file pages are written back when dirty.
    pub fn swap_out(&mut self, kva: u64, dirty: bool, swap: &mut SwapTable) {
        match &mut self.kind {
            PageKind::Anon { swap_slot } => {
                *swap_slot = Some(swap.store(kva));
            }
            PageKind::File { init } => {
                if dirty {
                    write_back(init, kva);
                }
            }
            PageKind::Uninit { .. } => unreachable!("uninit pages own no frame"),
        }
        self.frame = None;
    }

    /// Final teardown. KVA is the page's frame if still materialized.
    pub fn destroy(&mut self, kva: Option<u64>, dirty: bool, swap: &mut SwapTable) {
        match &mut self.kind {
            PageKind::File { init } => {
                if dirty {
                    if let Some(kva) = kva {
                        write_back(init, kva);
                    }
                }
            }
            PageKind::Anon { swap_slot } => {
                if let Some(slot) = swap_slot.take() {
                    swap.free(slot);
                }
            }
            PageKind::Uninit { .. } => {}
        }
    }
}

fn load_from_file(si: &SegmentInit, kva: u64) -> bool {
    debug_assert!(si.read_bytes <= PGSIZE);
    let buf = unsafe { core::slice::from_raw_parts_mut(kva as *mut u8, PGSIZE) };
    let read = si.file.lock().read_at(si.offset, &mut buf[..si.read_bytes]);
    if read != si.read_bytes {
        return false;
    }
    for b in &mut buf[si.read_bytes..] {
        *b = 0;
    }
    true
}

fn write_back(init: &SegmentInit, kva: u64) {
    let buf = unsafe { core::slice::from_raw_parts(kva as *const u8, PGSIZE) };
    init.file.lock().write_at(init.offset, &buf[..init.read_bytes]);
}
