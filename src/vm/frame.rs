use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::memory::frame_alloc::FramePool;
use crate::memory::paging::RootId;
use crate::memory::PGSIZE;
use crate::scheduler::Tid;

/// Which user page currently occupies a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOwner {
    pub tid: Tid,
    pub root: RootId,
    pub uva: u64,
}

/// A physical page usable for user memory, by kernel virtual address.
pub struct Frame {
    pub kva: u64,
    pub owner: Option<FrameOwner>,
    /// Pinned frames are skipped by the eviction clock (set while a
    /// system call copies through the page).
    pub pinned: bool,
}

/// The frame table: slot-stable records over a bounded page pool, in
/// allocation order so the eviction clock has a fixed circuit.
pub struct FrameTable {
    pool: FramePool,
    slots: Vec<Option<Frame>>,
    free_slots: Vec<usize>,
    hand: usize,
}

impl FrameTable {
    pub fn new(capacity: usize) -> Self {
        FrameTable {
            pool: FramePool::new(capacity),
            slots: Vec::new(),
            free_slots: Vec::new(),
            hand: 0,
        }
    }

    /// A zeroed, unowned frame; None when the pool is exhausted (the
    /// caller evicts and retries).
    pub fn alloc(&mut self) -> Option<usize> {
        let kva = self.pool.alloc_zeroed()?;
        let frame = Frame {
            kva,
            owner: None,
            pinned: false,
        };
        match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx] = Some(frame);
                Some(idx)
            }
            None => {
                self.slots.push(Some(frame));
                Some(self.slots.len() - 1)
            }
        }
    }

    /// Return IDX's page to the pool (its occupant is gone).
    pub fn release(&mut self, idx: usize) {
        let frame = self.slots[idx].take().expect("releasing a dead frame");
        self.pool.free(frame.kva);
        self.free_slots.push(idx);
    }

    pub fn get(&self, idx: usize) -> &Frame {
        self.slots[idx].as_ref().expect("dead frame index")
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Frame {
        self.slots[idx].as_mut().expect("dead frame index")
    }

    pub fn kva_of(&self, idx: usize) -> u64 {
        self.get(idx).kva
    }

    pub fn set_pinned(&mut self, idx: usize, pinned: bool) {
        self.get_mut(idx).pinned = pinned;
    }

    pub fn pages_in_use(&self) -> usize {
        self.pool.pages_in_use()
    }

    /// Advance the clock hand and return the next occupied, unpinned
    /// slot, or None after a full circuit.
    pub fn clock_next(&mut self) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        for _ in 0..self.slots.len() {
            let idx = self.hand;
            self.hand = (self.hand + 1) % self.slots.len();
            if let Some(frame) = &self.slots[idx] {
                if frame.owner.is_some() && !frame.pinned {
                    return Some(idx);
                }
            }
        }
        None
    }

    /// Zero IDX's page so it can be handed to a new occupant after
    /// eviction.
    pub fn scrub(&mut self, idx: usize) {
        let kva = self.kva_of(idx);
        unsafe { core::ptr::write_bytes(kva as *mut u8, 0, PGSIZE) };
    }
}

/// Swap device: numbered slots each holding one evicted page.
pub struct SwapTable {
    slots: Vec<Option<Box<[u8]>>>,
}

impl SwapTable {
    pub fn new() -> Self {
        SwapTable { slots: Vec::new() }
    }

    /// Copy the page at KVA into a free slot and return its number.
    pub fn store(&mut self, kva: u64) -> usize {
        let bytes = unsafe { core::slice::from_raw_parts(kva as *const u8, PGSIZE) };
        let copy: Box<[u8]> = Box::from(bytes);
        match self.slots.iter().position(|s| s.is_none()) {
            Some(idx) => {
                self.slots[idx] = Some(copy);
                idx
            }
            None => {
                self.slots.push(Some(copy));
                self.slots.len() - 1
            }
        }
    }

    /// Copy SLOT back into KVA and free the slot.
    pub fn load(&mut self, slot: usize, kva: u64) {
        let bytes = self.slots[slot].take().expect("reading a free swap slot");
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), kva as *mut u8, PGSIZE);
        }
    }

    /// Non-destructive copy of SLOT's contents.
    pub fn peek(&self, slot: usize) -> Option<Vec<u8>> {
        self.slots[slot].as_ref().map(|b| b.to_vec())
    }

    pub fn free(&mut self, slot: usize) {
        self.slots[slot] = None;
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::paging::KERNEL_ROOT;

    fn owner(uva: u64) -> FrameOwner {
        FrameOwner {
            tid: Tid(1),
            root: KERNEL_ROOT,
            uva,
        }
    }

    #[test]
    fn alloc_release_recycles_slots() {
        let mut ft = FrameTable::new(2);
        let a = ft.alloc().unwrap();
        let b = ft.alloc().unwrap();
        assert!(ft.alloc().is_none());
        ft.release(a);
        let c = ft.alloc().unwrap();
        assert_eq!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn clock_skips_pinned_and_free_frames() {
        let mut ft = FrameTable::new(3);
        let a = ft.alloc().unwrap();
        let b = ft.alloc().unwrap();
        let c = ft.alloc().unwrap();
        ft.get_mut(a).owner = Some(owner(0x1000));
        ft.get_mut(b).owner = Some(owner(0x2000));
        ft.get_mut(c).owner = Some(owner(0x3000));
        ft.set_pinned(b, true);
        ft.release(a);

        let first = ft.clock_next().unwrap();
        let second = ft.clock_next().unwrap();
        assert_eq!(first, c);
        assert_eq!(second, c);
    }

    #[test]
    fn swap_round_trip() {
        let mut pool = FramePool::new(1);
        let kva = pool.alloc_zeroed().unwrap();
        unsafe { core::ptr::write_bytes(kva as *mut u8, 0x5A, PGSIZE) };

        let mut swap = SwapTable::new();
        let slot = swap.store(kva);
        assert_eq!(swap.slots_in_use(), 1);

        unsafe { core::ptr::write_bytes(kva as *mut u8, 0, PGSIZE) };
        swap.load(slot, kva);
        let bytes = unsafe { core::slice::from_raw_parts(kva as *const u8, PGSIZE) };
        assert!(bytes.iter().all(|&b| b == 0x5A));
        assert_eq!(swap.slots_in_use(), 0);
    }
}
