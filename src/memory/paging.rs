use alloc::collections::BTreeMap;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::memory::{pg_ofs, PGSIZE};

/// Handle to a per-process page-table root.
pub type RootId = u64;

/// Root 0 is the kernel-only address space; it maps no user pages and is
/// never destroyed.
pub const KERNEL_ROOT: RootId = 0;

/// One user mapping: which kernel page backs the user page, plus the
/// permission and usage bits the MMU would keep in the entry.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    pub kva: u64,
    pub writable: bool,
    pub accessed: bool,
    pub dirty: bool,
}

/// Kernel-side bookkeeping for one process address space: the set of user
/// mappings the MMU has been told about.
pub struct AddressSpace {
    entries: BTreeMap<u64, Mapping>,
}

impl AddressSpace {
    pub fn new() -> Self {
        AddressSpace {
            entries: BTreeMap::new(),
        }
    }

    /// Install UVA -> KVA. UVA must be page-aligned and not yet mapped.
    pub fn set_mapping(&mut self, uva: u64, kva: u64, writable: bool) -> bool {
        assert_eq!(pg_ofs(uva), 0);
        if self.entries.contains_key(&uva) {
            return false;
        }
        self.entries.insert(
            uva,
            Mapping {
                kva,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    pub fn get_mapping(&self, uva: u64) -> Option<&Mapping> {
        self.entries.get(&uva)
    }

    pub fn clear_mapping(&mut self, uva: u64) -> Option<Mapping> {
        self.entries.remove(&uva)
    }

    pub fn is_writable(&self, uva: u64) -> bool {
        self.entries.get(&uva).map_or(false, |m| m.writable)
    }

    pub fn mark_accessed(&mut self, uva: u64) {
        if let Some(m) = self.entries.get_mut(&uva) {
            m.accessed = true;
        }
    }

    /// Clears the accessed bit, returning the previous value. The eviction
    /// clock uses this as its second-chance test.
    pub fn take_accessed(&mut self, uva: u64) -> bool {
        match self.entries.get_mut(&uva) {
            Some(m) => core::mem::replace(&mut m.accessed, false),
            None => false,
        }
    }

    pub fn mark_dirty(&mut self, uva: u64) {
        if let Some(m) = self.entries.get_mut(&uva) {
            m.dirty = true;
        }
    }

    pub fn is_dirty(&self, uva: u64) -> bool {
        self.entries.get(&uva).map_or(false, |m| m.dirty)
    }

    pub fn mapping_count(&self) -> usize {
        self.entries.len()
    }
}

/// Registry of live page-table roots plus the active one.
pub struct RootTable {
    roots: BTreeMap<RootId, AddressSpace>,
    next: RootId,
    active: RootId,
}

impl RootTable {
    pub fn new() -> Self {
        let mut roots = BTreeMap::new();
        roots.insert(KERNEL_ROOT, AddressSpace::new());
        RootTable {
            roots,
            next: 1,
            active: KERNEL_ROOT,
        }
    }

    /// Allocate a fresh, empty address space.
    pub fn create(&mut self) -> RootId {
        let id = self.next;
        self.next += 1;
        self.roots.insert(id, AddressSpace::new());
        id
    }

    pub fn get(&self, root: RootId) -> Option<&AddressSpace> {
        self.roots.get(&root)
    }

    pub fn get_mut(&mut self, root: RootId) -> Option<&mut AddressSpace> {
        self.roots.get_mut(&root)
    }

    /// Make ROOT the address space the MMU translates through.
    pub fn activate(&mut self, root: RootId) {
        debug_assert!(self.roots.contains_key(&root));
        self.active = root;
    }

    pub fn active(&self) -> RootId {
        self.active
    }

    /// Free a dying root's page structures. The caller must have nulled its
    /// own reference and activated another root first; a tick arriving
    /// mid-teardown must never reactivate freed structures.
    pub fn destroy(&mut self, root: RootId) {
        assert_ne!(root, KERNEL_ROOT);
        assert_ne!(self.active, root, "destroying the active root");
        let aspace = self.roots.remove(&root);
        if let Some(a) = aspace {
            // Frames backing the mappings are reclaimed by the VM layer;
            // only the page structures die here.
            drop(a);
        }
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }
}

lazy_static! {
    pub static ref ROOTS: Mutex<RootTable> = Mutex::new(RootTable::new());
}

/// Copy BUF into user memory at UVA through ROOT's mappings. Every touched
/// page must already be mapped writable. Returns false on any hole.
pub fn write_user(aspace: &mut AddressSpace, uva: u64, buf: &[u8]) -> bool {
    let mut addr = uva;
    let mut off = 0usize;
    while off < buf.len() {
        let page = crate::memory::pg_round_down(addr);
        let in_page = (addr - page) as usize;
        let chunk = core::cmp::min(PGSIZE - in_page, buf.len() - off);
        let m = match aspace.get_mapping(page) {
            Some(m) if m.writable => *m,
            _ => return false,
        };
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf[off..].as_ptr(),
                (m.kva as *mut u8).add(in_page),
                chunk,
            );
        }
        aspace.mark_accessed(page);
        aspace.mark_dirty(page);
        addr += chunk as u64;
        off += chunk;
    }
    true
}

/// Copy LEN bytes of user memory at UVA into BUF. Returns false on any hole.
pub fn read_user(aspace: &mut AddressSpace, uva: u64, buf: &mut [u8]) -> bool {
    let mut addr = uva;
    let mut off = 0usize;
    while off < buf.len() {
        let page = crate::memory::pg_round_down(addr);
        let in_page = (addr - page) as usize;
        let chunk = core::cmp::min(PGSIZE - in_page, buf.len() - off);
        let m = match aspace.get_mapping(page) {
            Some(m) => *m,
            None => return false,
        };
        unsafe {
            core::ptr::copy_nonoverlapping(
                (m.kva as *const u8).add(in_page),
                buf[off..].as_mut_ptr(),
                chunk,
            );
        }
        aspace.mark_accessed(page);
        addr += chunk as u64;
        off += chunk;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_alloc::FramePool;

    #[test]
    fn mapping_is_exclusive() {
        let mut aspace = AddressSpace::new();
        assert!(aspace.set_mapping(0x1000, 0xdead_0000, true));
        assert!(!aspace.set_mapping(0x1000, 0xbeef_0000, true));
        assert_eq!(aspace.get_mapping(0x1000).unwrap().kva, 0xdead_0000);
    }

    #[test]
    fn destroy_requires_switching_away_first() {
        let mut roots = RootTable::new();
        let r = roots.create();
        roots.activate(r);
        roots.activate(KERNEL_ROOT);
        roots.destroy(r);
        assert!(roots.get(r).is_none());
        assert_eq!(roots.active(), KERNEL_ROOT);
    }

    #[test]
    #[should_panic]
    fn destroying_active_root_asserts() {
        let mut roots = RootTable::new();
        let r = roots.create();
        roots.activate(r);
        roots.destroy(r);
    }

    #[test]
    fn user_copies_cross_page_boundaries() {
        let mut pool = FramePool::new(2);
        let mut aspace = AddressSpace::new();
        let k0 = pool.alloc_zeroed().unwrap();
        let k1 = pool.alloc_zeroed().unwrap();
        assert!(aspace.set_mapping(0x4000, k0, true));
        assert!(aspace.set_mapping(0x5000, k1, true));

        let msg = b"spans the boundary";
        let uva = 0x5000 - 6;
        assert!(write_user(&mut aspace, uva, msg));
        let mut back = [0u8; 18];
        assert!(read_user(&mut aspace, uva, &mut back));
        assert_eq!(&back, msg);
        assert!(aspace.is_dirty(0x4000));
        assert!(aspace.is_dirty(0x5000));
    }

    #[test]
    fn read_only_mapping_rejects_writes() {
        let mut pool = FramePool::new(1);
        let mut aspace = AddressSpace::new();
        let k = pool.alloc_zeroed().unwrap();
        assert!(aspace.set_mapping(0x8000, k, false));
        assert!(!write_user(&mut aspace, 0x8000, b"no"));
        let mut buf = [0u8; 2];
        assert!(read_user(&mut aspace, 0x8000, &mut buf));
    }
}
