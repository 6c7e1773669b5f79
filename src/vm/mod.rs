//! Demand-paged user memory: per-process supplemental page tables, frame
//! acquisition with eviction, the page-fault policy, and kernel access to
//! user buffers with fault-in.

pub mod frame;
pub mod page;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::interrupts;
use crate::memory::paging::{RootId, RootTable, ROOTS};
use crate::memory::{is_user_vaddr, pg_round_down, MAX_STACK, PGSIZE, USER_POOL_PAGES, USER_STACK};
use crate::scheduler::Tid;
use frame::{FrameOwner, FrameTable, SwapTable};
use page::{Page, PageKind, SegmentInit, TargetKind};

/// Map from user virtual page to its Page record.
pub struct SupplementalPageTable {
    pages: BTreeMap<u64, Page>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        SupplementalPageTable {
            pages: BTreeMap::new(),
        }
    }

    /// Insert PAGE; fails if the slot is occupied.
    pub fn insert(&mut self, page: Page) -> bool {
        debug_assert_eq!(page.va % PGSIZE as u64, 0);
        if self.pages.contains_key(&page.va) {
            return false;
        }
        self.pages.insert(page.va, page);
        true
    }

    pub fn find(&self, va: u64) -> Option<&Page> {
        self.pages.get(&va)
    }

    pub fn find_mut(&mut self, va: u64) -> Option<&mut Page> {
        self.pages.get_mut(&va)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Page)> {
        self.pages.iter()
    }
}

/// All VM engine state: every process's SPT, the frame table and swap.
pub struct VmState {
    spts: BTreeMap<Tid, SupplementalPageTable>,
    pub frames: FrameTable,
    pub swap: SwapTable,
}

impl VmState {
    pub fn new(frame_capacity: usize) -> Self {
        VmState {
            spts: BTreeMap::new(),
            frames: FrameTable::new(frame_capacity),
            swap: SwapTable::new(),
        }
    }

    pub fn create_spt(&mut self, tid: Tid) {
        self.spts.insert(tid, SupplementalPageTable::new());
    }

    pub fn spt(&self, tid: Tid) -> Option<&SupplementalPageTable> {
        self.spts.get(&tid)
    }

    /// Register a lazily initialized page. Fails if VA is already claimed
    /// by this process or the process has no SPT.
    pub fn alloc_page_with_initializer(
        &mut self,
        tid: Tid,
        target: TargetKind,
        va: u64,
        writable: bool,
        init: Option<SegmentInit>,
    ) -> bool {
        assert_eq!(va % PGSIZE as u64, 0);
        match self.spts.get_mut(&tid) {
            Some(spt) => spt.insert(Page::new_uninit(va, writable, target, init)),
            None => false,
        }
    }

    /// Register a stack page (anonymous, writable, stack-marked).
    pub fn alloc_stack_page(&mut self, tid: Tid, va: u64) -> bool {
        match self.spts.get_mut(&tid) {
            Some(spt) => spt.insert(Page::new_anon_stack(va)),
            None => false,
        }
    }

    /// A frame for OWNER: fresh from the pool, or stolen from a victim.
    fn acquire_frame(&mut self, roots: &mut RootTable, owner: FrameOwner) -> Option<usize> {
        let idx = match self.frames.alloc() {
            Some(idx) => idx,
            None => {
                let victim = self.pick_victim(roots)?;
                self.evict(roots, victim);
                victim
            }
        };
        self.frames.get_mut(idx).owner = Some(owner);
        Some(idx)
    }

    /// Clock second-chance: skip recently accessed frames once, take the
    /// first stale one.
    fn pick_victim(&mut self, roots: &mut RootTable) -> Option<usize> {
        for _ in 0..2 * self.frames.pages_in_use() + 1 {
            let idx = self.frames.clock_next()?;
            let owner = self.frames.get(idx).owner.expect("clock gave a free frame");
            let accessed = roots
                .get_mut(owner.root)
                .map_or(false, |a| a.take_accessed(owner.uva));
            if !accessed {
                return Some(idx);
            }
        }
        None
    }

    /// Push IDX's occupant out: save its contents, unmap it, and scrub
    /// the page for the next owner.
    fn evict(&mut self, roots: &mut RootTable, idx: usize) {
        let owner = self.frames.get_mut(idx).owner.take().expect("evicting a free frame");
        let kva = self.frames.kva_of(idx);

        let dirty = match roots.get_mut(owner.root) {
            Some(aspace) => {
                let dirty = aspace.is_dirty(owner.uva);
                aspace.clear_mapping(owner.uva);
                dirty
            }
            None => false,
        };

        let VmState { spts, swap, .. } = self;
        if let Some(page) = spts.get_mut(&owner.tid).and_then(|s| s.find_mut(owner.uva)) {
            page.swap_out(kva, dirty, swap);
        }
        self.frames.scrub(idx);
    }

    /// Materialize VA for TID: allocate a frame, install the mapping, and
    /// run the page's swap_in (which performs any lazy load).
    pub fn claim_page(&mut self, roots: &mut RootTable, tid: Tid, root: RootId, va: u64) -> bool {
        let writable = match self.spts.get(&tid).and_then(|s| s.find(va)) {
            Some(p) => {
                if p.frame.is_some() {
                    return true;
                }
                p.writable
            }
            None => return false,
        };

        let idx = match self.acquire_frame(roots, FrameOwner { tid, root, uva: va }) {
            Some(idx) => idx,
            None => return false,
        };
        let kva = self.frames.kva_of(idx);

        let aspace = match roots.get_mut(root) {
            Some(a) => a,
            None => {
                self.frames.get_mut(idx).owner = None;
                self.frames.release(idx);
                return false;
            }
        };
        if !aspace.set_mapping(va, kva, writable) {
            self.frames.get_mut(idx).owner = None;
            self.frames.release(idx);
            return false;
        }
        aspace.mark_accessed(va);

        let VmState { spts, swap, .. } = self;
        let page = spts
            .get_mut(&tid)
            .and_then(|s| s.find_mut(va))
            .expect("claimed page vanished");
        page.frame = Some(idx);
        if !page.swap_in(kva, swap) {
            page.frame = None;
            roots.get_mut(root).unwrap().clear_mapping(va);
            self.frames.get_mut(idx).owner = None;
            self.frames.release(idx);
            return false;
        }
        true
    }

    /// The fault policy. Returns true when the fault was resolved and the
    /// access can be retried; false means the access was illegal.
    pub fn handle_fault(
        &mut self,
        roots: &mut RootTable,
        tid: Tid,
        root: RootId,
        addr: u64,
        write: bool,
        _user: bool,
        not_present: bool,
        rsp: u64,
    ) -> bool {
        if addr == 0 || !is_user_vaddr(addr) {
            return false;
        }
        let va = pg_round_down(addr);

        if let Some(page) = self.spts.get(&tid).and_then(|s| s.find(va)) {
            if write && !page.writable {
                return false;
            }
            if !not_present {
                // Present and permitted: nothing for us to fix.
                return false;
            }
            if !self.claim_page(roots, tid, root, va) {
                return false;
            }
        } else {
            // Stack growth: within 1 MiB below the stack top, and no more
            // than 8 bytes below the saved user rsp.
            let in_window = addr < USER_STACK
                && addr >= USER_STACK - MAX_STACK
                && addr + 8 >= rsp;
            if !in_window {
                return false;
            }
            if !self.alloc_stack_page(tid, va) {
                return false;
            }
            if !self.claim_page(roots, tid, root, va) {
                return false;
            }
        }

        if write {
            if let Some(aspace) = roots.get_mut(root) {
                aspace.mark_dirty(va);
            }
        }
        true
    }

    /// Duplicate PARENT's user memory into CHILD for fork. UNINIT pages
    /// keep their lazy constructors; materialized pages are bytewise
    /// copied into freshly claimed frames, preserving writability.
    pub fn copy_spt(
        &mut self,
        roots: &mut RootTable,
        parent: Tid,
        child: Tid,
        child_root: RootId,
    ) -> bool {
        self.create_spt(child);

        let vas: Vec<u64> = match self.spts.get(&parent) {
            Some(spt) => spt.iter().map(|(&va, _)| va).collect(),
            None => return false,
        };

        for va in vas {
            // Snapshot the source before any child claim can evict it.
            let (shell, src_bytes) = {
                let src = self.spts[&parent].find(va).expect("page vanished mid-copy");
                let shell = src.clone_for_fork();
                let bytes: Option<Vec<u8>> = match (&src.kind, src.frame) {
                    (PageKind::Uninit { .. }, _) => None,
                    (_, Some(idx)) => {
                        let kva = self.frames.kva_of(idx);
                        Some(unsafe { core::slice::from_raw_parts(kva as *const u8, PGSIZE) }.to_vec())
                    }
                    (PageKind::Anon { swap_slot: Some(slot) }, None) => self.swap.peek(*slot),
                    _ => None,
                };
                (shell, bytes)
            };

            let lazy = shell.is_uninit();
            if !self.spts.get_mut(&child).unwrap().insert(shell) {
                return false;
            }
            if lazy {
                continue;
            }

            // Materialized in the parent: claim and fill the child copy.
            if !self.claim_page(roots, child, child_root, va) {
                return false;
            }
            if let Some(bytes) = src_bytes {
                let idx = self.spts[&child].find(va).unwrap().frame.unwrap();
                let kva = self.frames.kva_of(idx);
                unsafe {
                    core::ptr::copy_nonoverlapping(bytes.as_ptr(), kva as *mut u8, PGSIZE);
                }
            }
        }
        true
    }

    /// Tear down TID's user memory: write back dirty file pages, release
    /// frames and swap slots, drop the SPT. Page->frame links die first,
    /// then the frames themselves.
    pub fn kill_spt(&mut self, roots: &mut RootTable, tid: Tid, root: RootId) {
        let spt = match self.spts.remove(&tid) {
            Some(s) => s,
            None => return,
        };
        for (va, mut page) in spt.pages {
            match page.frame.take() {
                Some(idx) => {
                    let kva = self.frames.kva_of(idx);
                    let dirty = roots.get(root).map_or(false, |a| a.is_dirty(va));
                    if let Some(aspace) = roots.get_mut(root) {
                        aspace.clear_mapping(va);
                    }
                    page.destroy(Some(kva), dirty, &mut self.swap);
                    self.frames.get_mut(idx).owner = None;
                    self.frames.release(idx);
                }
                None => page.destroy(None, false, &mut self.swap),
            }
        }
    }

    /// Make the page holding ADDR present (claiming or growing the stack
    /// as the fault handler would) and return its frame index.
    fn ensure_present(
        &mut self,
        roots: &mut RootTable,
        tid: Tid,
        root: RootId,
        addr: u64,
        write: bool,
        rsp: u64,
    ) -> Option<usize> {
        let va = pg_round_down(addr);
        let framed = self
            .spts
            .get(&tid)
            .and_then(|s| s.find(va))
            .map(|p| (p.frame, p.writable));
        match framed {
            Some((Some(idx), writable)) => {
                if write && !writable {
                    return None;
                }
                Some(idx)
            }
            _ => {
                if !self.handle_fault(roots, tid, root, addr, write, false, true, rsp) {
                    return None;
                }
                self.spts.get(&tid).and_then(|s| s.find(va)).and_then(|p| p.frame)
            }
        }
    }

    /// Copy BUF into TID's user memory, claiming pages on demand. Frames
    /// are pinned while the copy runs so the clock cannot steal them.
    pub fn user_write(
        &mut self,
        roots: &mut RootTable,
        tid: Tid,
        root: RootId,
        uva: u64,
        buf: &[u8],
        rsp: u64,
    ) -> bool {
        let mut addr = uva;
        let mut off = 0usize;
        while off < buf.len() {
            let idx = match self.ensure_present(roots, tid, root, addr, true, rsp) {
                Some(idx) => idx,
                None => return false,
            };
            self.frames.set_pinned(idx, true);
            let page_va = pg_round_down(addr);
            let in_page = (addr - page_va) as usize;
            let chunk = core::cmp::min(PGSIZE - in_page, buf.len() - off);
            let ok = roots
                .get_mut(root)
                .map_or(false, |a| crate::memory::paging::write_user(a, addr, &buf[off..off + chunk]));
            self.frames.set_pinned(idx, false);
            if !ok {
                return false;
            }
            addr += chunk as u64;
            off += chunk;
        }
        true
    }

    /// Copy LEN bytes of TID's user memory into BUF, claiming pages on
    /// demand.
    pub fn user_read(
        &mut self,
        roots: &mut RootTable,
        tid: Tid,
        root: RootId,
        uva: u64,
        buf: &mut [u8],
        rsp: u64,
    ) -> bool {
        let mut addr = uva;
        let mut off = 0usize;
        while off < buf.len() {
            let idx = match self.ensure_present(roots, tid, root, addr, false, rsp) {
                Some(idx) => idx,
                None => return false,
            };
            self.frames.set_pinned(idx, true);
            let page_va = pg_round_down(addr);
            let in_page = (addr - page_va) as usize;
            let chunk = core::cmp::min(PGSIZE - in_page, buf.len() - off);
            let ok = roots
                .get_mut(root)
                .map_or(false, |a| {
                    crate::memory::paging::read_user(a, addr, &mut buf[off..off + chunk])
                });
            self.frames.set_pinned(idx, false);
            if !ok {
                return false;
            }
            addr += chunk as u64;
            off += chunk;
        }
        true
    }
}

lazy_static! {
    pub static ref VM: Mutex<VmState> = Mutex::new(VmState::new(USER_POOL_PAGES));
}

pub fn init() {
    let _ = VM.lock();
    log::info!("VM engine ready ({} user frames).", USER_POOL_PAGES);
}

/// Page-fault entry: resolve against the faulting thread's SPT.
pub fn page_fault(addr: u64, write: bool, user: bool, not_present: bool, rsp: u64) -> bool {
    let (tid, root) = crate::scheduler::with_scheduler(|s| {
        let cur = s.current()?;
        let root = s.thread(cur)?.address_space?;
        Some((cur, root))
    })
    .map_or((None, None), |(t, r)| (Some(t), Some(r)));

    let (tid, root) = match (tid, root) {
        (Some(t), Some(r)) => (t, r),
        _ => return false,
    };

    interrupts::critical(|| {
        let mut vm = VM.lock();
        let mut roots = ROOTS.lock();
        vm.handle_fault(&mut roots, tid, root, addr, write, user, not_present, rsp)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::file::{File, Node};
    use crate::memory::paging::RootTable;
    use alloc::sync::Arc;

    const T: Tid = Tid(7);

    fn setup(frames: usize) -> (VmState, RootTable, RootId) {
        let mut vm = VmState::new(frames);
        let mut roots = RootTable::new();
        let root = roots.create();
        vm.create_spt(T);
        (vm, roots, root)
    }

    fn seg_file(len: usize, fill: u8) -> Arc<spin::Mutex<File>> {
        let node = Node::new(0);
        node.lock().data = alloc::vec![fill; len];
        Arc::new(spin::Mutex::new(File::new(node)))
    }

    fn page_bytes(roots: &RootTable, root: RootId, va: u64) -> Vec<u8> {
        let kva = roots.get(root).unwrap().get_mapping(va).unwrap().kva;
        unsafe { core::slice::from_raw_parts(kva as *const u8, PGSIZE) }.to_vec()
    }

    #[test]
    fn registration_rejects_occupied_slots() {
        let (mut vm, _roots, _root) = setup(4);
        assert!(vm.alloc_page_with_initializer(T, TargetKind::Anon, 0x4000, true, None));
        assert!(!vm.alloc_page_with_initializer(T, TargetKind::Anon, 0x4000, true, None));
    }

    #[test]
    fn lazy_pages_stay_lazy_until_first_access() {
        let (mut vm, mut roots, root) = setup(4);
        let file = seg_file(3 * PGSIZE, 0xCD);
        for i in 0..3u64 {
            let init = SegmentInit {
                file: file.clone(),
                offset: i as usize * PGSIZE,
                read_bytes: if i == 2 { 100 } else { PGSIZE },
            };
            assert!(vm.alloc_page_with_initializer(
                T,
                TargetKind::Anon,
                0x40_0000 + i * PGSIZE as u64,
                true,
                Some(init),
            ));
        }
        assert_eq!(vm.spt(T).unwrap().len(), 3);
        assert_eq!(vm.frames.pages_in_use(), 0);

        // First access materializes exactly one page.
        assert!(vm.claim_page(&mut roots, T, root, 0x40_0000));
        assert_eq!(vm.frames.pages_in_use(), 1);
        assert!(!vm.spt(T).unwrap().find(0x40_0000).unwrap().is_uninit());
        assert!(vm.spt(T).unwrap().find(0x40_1000).unwrap().is_uninit());

        let bytes = page_bytes(&roots, root, 0x40_0000);
        assert!(bytes.iter().all(|&b| b == 0xCD));

        // Short segment tail is zero-filled.
        assert!(vm.claim_page(&mut roots, T, root, 0x40_2000));
        let tail = page_bytes(&roots, root, 0x40_2000);
        assert!(tail[..100].iter().all(|&b| b == 0xCD));
        assert!(tail[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn fault_on_readonly_write_is_fatal() {
        let (mut vm, mut roots, root) = setup(4);
        assert!(vm.alloc_page_with_initializer(T, TargetKind::Anon, 0x4000, false, None));
        assert!(!vm.handle_fault(&mut roots, T, root, 0x4000, true, true, true, 0));
        // A read of the same page is fine.
        assert!(vm.handle_fault(&mut roots, T, root, 0x4000, false, true, true, 0));
    }

    #[test]
    fn stack_grows_on_a_push_just_below_rsp() {
        let (mut vm, mut roots, root) = setup(8);
        let rsp = USER_STACK - 4096;
        assert!(vm.handle_fault(&mut roots, T, root, rsp - 8, true, true, true, rsp));
        let page = vm.spt(T).unwrap().find(pg_round_down(rsp - 8)).unwrap();
        assert!(page.stack && page.writable);
    }

    #[test]
    fn access_far_below_rsp_is_fatal() {
        let (mut vm, mut roots, root) = setup(8);
        let rsp = USER_STACK - 4096;
        assert!(!vm.handle_fault(
            &mut roots,
            T,
            root,
            rsp - 2 * PGSIZE as u64,
            true,
            true,
            true,
            rsp
        ));
    }

    #[test]
    fn stack_never_grows_past_one_mebibyte() {
        let (mut vm, mut roots, root) = setup(8);
        let deep = USER_STACK - MAX_STACK - 8;
        assert!(!vm.handle_fault(&mut roots, T, root, deep, true, true, true, deep));
    }

    #[test]
    fn absent_addresses_outside_the_stack_kill() {
        let (mut vm, mut roots, root) = setup(4);
        assert!(!vm.handle_fault(&mut roots, T, root, 0x1234_0000, false, true, true, USER_STACK));
        assert!(!vm.handle_fault(&mut roots, T, root, 0, false, true, true, USER_STACK));
        assert!(!vm.handle_fault(
            &mut roots,
            T,
            root,
            crate::memory::KERN_BASE + 0x1000,
            false,
            true,
            true,
            USER_STACK
        ));
    }

    #[test]
    fn fork_copy_keeps_uninit_and_separates_bytes() {
        let (mut vm, mut roots, root) = setup(8);
        let child = Tid(8);
        let child_root = roots.create();

        let file = seg_file(2 * PGSIZE, 0xEE);
        for i in 0..2u64 {
            let init = SegmentInit {
                file: file.clone(),
                offset: i as usize * PGSIZE,
                read_bytes: PGSIZE,
            };
            vm.alloc_page_with_initializer(T, TargetKind::Anon, 0x40_0000 + i * PGSIZE as u64, true, Some(init));
        }
        // Materialize one page in the parent and scribble on it.
        assert!(vm.claim_page(&mut roots, T, root, 0x40_0000));
        let kva = roots.get(root).unwrap().get_mapping(0x40_0000).unwrap().kva;
        unsafe { *(kva as *mut u8) = 0xAB };

        assert!(vm.copy_spt(&mut roots, T, child, child_root));

        // Lazy page stayed lazy in both; materialized page was copied
        // byte for byte.
        assert!(vm.spt(T).unwrap().find(0x40_1000).unwrap().is_uninit());
        assert!(vm.spt(child).unwrap().find(0x40_1000).unwrap().is_uninit());
        let child_kva = roots
            .get(child_root)
            .unwrap()
            .get_mapping(0x40_0000)
            .unwrap()
            .kva;
        assert_eq!(unsafe { *(child_kva as *const u8) }, 0xAB);
    }

    #[test]
    fn child_writes_are_invisible_to_the_parent() {
        let (mut vm, mut roots, root) = setup(8);
        let child = Tid(9);
        let child_root = roots.create();

        vm.alloc_page_with_initializer(T, TargetKind::Anon, 0x5000, true, None);
        assert!(vm.claim_page(&mut roots, T, root, 0x5000));
        let parent_kva = roots.get(root).unwrap().get_mapping(0x5000).unwrap().kva;
        unsafe { *(parent_kva as *mut u8) = 0x11 };

        assert!(vm.copy_spt(&mut roots, T, child, child_root));
        let child_kva = roots.get(child_root).unwrap().get_mapping(0x5000).unwrap().kva;
        assert_ne!(parent_kva, child_kva);
        assert_eq!(unsafe { *(child_kva as *const u8) }, 0x11);

        unsafe { *(child_kva as *mut u8) = 0xAB };
        assert_eq!(unsafe { *(parent_kva as *const u8) }, 0x11);
    }

    #[test]
    fn exhaustion_evicts_and_swap_restores() {
        let (mut vm, mut roots, root) = setup(2);
        for i in 0..3u64 {
            vm.alloc_page_with_initializer(T, TargetKind::Anon, 0x6000 + i * PGSIZE as u64, true, None);
        }
        assert!(vm.claim_page(&mut roots, T, root, 0x6000));
        let kva = roots.get(root).unwrap().get_mapping(0x6000).unwrap().kva;
        unsafe { core::ptr::write_bytes(kva as *mut u8, 0x77, PGSIZE) };
        roots.get_mut(root).unwrap().mark_dirty(0x6000);

        assert!(vm.claim_page(&mut roots, T, root, 0x7000));
        // Third claim must evict one of the first two.
        assert!(vm.claim_page(&mut roots, T, root, 0x8000));
        assert_eq!(vm.frames.pages_in_use(), 2);
        assert_eq!(vm.swap.slots_in_use(), 1);

        // Touch the evicted page again: contents come back from swap.
        let evicted_va = [0x6000u64, 0x7000]
            .into_iter()
            .find(|&va| vm.spt(T).unwrap().find(va).unwrap().frame.is_none())
            .unwrap();
        assert!(vm.claim_page(&mut roots, T, root, evicted_va));
        if evicted_va == 0x6000 {
            let bytes = page_bytes(&roots, root, 0x6000);
            assert!(bytes.iter().all(|&b| b == 0x77));
        }
    }

    #[test]
    fn dirty_file_pages_write_back_on_teardown() {
        let (mut vm, mut roots, root) = setup(4);
        let file = seg_file(PGSIZE, 0x20);
        let init = SegmentInit {
            file: file.clone(),
            offset: 0,
            read_bytes: PGSIZE,
        };
        assert!(vm.alloc_page_with_initializer(T, TargetKind::File, 0xA000, true, Some(init)));
        assert!(vm.claim_page(&mut roots, T, root, 0xA000));

        let kva = roots.get(root).unwrap().get_mapping(0xA000).unwrap().kva;
        unsafe { core::ptr::write_bytes(kva as *mut u8, 0x99, 16) };
        roots.get_mut(root).unwrap().mark_dirty(0xA000);

        vm.kill_spt(&mut roots, T, root);

        let mut back = [0u8; 32];
        assert_eq!(file.lock().read_at(0, &mut back), 32);
        assert!(back[..16].iter().all(|&b| b == 0x99));
        assert!(back[16..].iter().all(|&b| b == 0x20));
    }

    #[test]
    fn kill_spt_releases_every_frame() {
        let (mut vm, mut roots, root) = setup(4);
        for i in 0..3u64 {
            vm.alloc_page_with_initializer(T, TargetKind::Anon, 0x9000 + i * PGSIZE as u64, true, None);
            assert!(vm.claim_page(&mut roots, T, root, 0x9000 + i * PGSIZE as u64));
        }
        assert_eq!(vm.frames.pages_in_use(), 3);
        vm.kill_spt(&mut roots, T, root);
        assert_eq!(vm.frames.pages_in_use(), 0);
        assert!(vm.spt(T).is_none());
        assert_eq!(roots.get(root).unwrap().mapping_count(), 0);
    }

    #[test]
    fn user_copies_claim_lazily_and_grow_the_stack() {
        let (mut vm, mut roots, root) = setup(4);
        let rsp = USER_STACK;
        // Nothing mapped yet: a write just below the stack top grows it.
        let addr = USER_STACK - 16;
        assert!(vm.user_write(&mut roots, T, root, addr, b"0123456789ABCDEF", rsp - 16));
        let mut back = [0u8; 16];
        assert!(vm.user_read(&mut roots, T, root, addr, &mut back, rsp - 16));
        assert_eq!(&back, b"0123456789ABCDEF");
    }
}
