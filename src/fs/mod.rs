//! The kernel's face of the file system: a flat name -> node store with
//! open/create/remove, plus the kernel-wide lock that serializes file
//! operations from system calls.

pub mod file;

use alloc::collections::BTreeMap;
use alloc::string::String;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::scheduler::Lock;
use file::{File, Node, NodeRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
}

pub type FsResult<T> = Result<T, FsError>;

/// An in-memory disk: file names to nodes.
pub struct RamDisk {
    nodes: BTreeMap<String, NodeRef>,
}

impl RamDisk {
    pub fn new() -> Self {
        RamDisk {
            nodes: BTreeMap::new(),
        }
    }

    pub fn create(&mut self, name: &str, initial_size: usize) -> FsResult<()> {
        if name.is_empty() || self.nodes.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        self.nodes.insert(String::from(name), Node::new(initial_size));
        Ok(())
    }

    /// Unlink NAME. Handles already open on the node keep working.
    pub fn remove(&mut self, name: &str) -> FsResult<()> {
        self.nodes.remove(name).map(|_| ()).ok_or(FsError::NotFound)
    }

    pub fn open(&self, name: &str) -> FsResult<File> {
        self.nodes
            .get(name)
            .map(|node| File::new(node.clone()))
            .ok_or(FsError::NotFound)
    }

    /// Write raw bytes into a (new or existing) file. Used to seed boot
    /// images onto the disk.
    pub fn install(&mut self, name: &str, data: &[u8]) {
        let node = Node::new(0);
        node.lock().data.extend_from_slice(data);
        self.nodes.insert(String::from(name), node);
    }
}

lazy_static! {
    pub static ref FILESYS: Mutex<RamDisk> = Mutex::new(RamDisk::new());

    /// One kernel-wide mutex serializes file-system work done on behalf
    /// of user processes.
    pub static ref FS_LOCK: Lock = Lock::new();
}

pub fn init() {
    let _ = FILESYS.lock();
    log::info!("File system ready.");
}

pub fn create(name: &str, initial_size: usize) -> bool {
    FILESYS.lock().create(name, initial_size).is_ok()
}

pub fn remove(name: &str) -> bool {
    FILESYS.lock().remove(name).is_ok()
}

pub fn open(name: &str) -> FsResult<File> {
    FILESYS.lock().open(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_remove() {
        let mut disk = RamDisk::new();
        assert_eq!(disk.create("a.txt", 16), Ok(()));
        assert_eq!(disk.create("a.txt", 16), Err(FsError::AlreadyExists));
        assert!(disk.open("a.txt").is_ok());
        assert_eq!(disk.remove("a.txt"), Ok(()));
        assert_eq!(disk.remove("a.txt"), Err(FsError::NotFound));
        assert!(disk.open("a.txt").is_err());
    }

    #[test]
    fn open_handles_survive_removal() {
        let mut disk = RamDisk::new();
        disk.install("keep", b"payload");
        let f = disk.open("keep").unwrap();
        disk.remove("keep").unwrap();
        let mut buf = [0u8; 7];
        assert_eq!(f.read_at(0, &mut buf), 7);
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn empty_names_are_rejected() {
        let mut disk = RamDisk::new();
        assert!(disk.create("", 0).is_err());
    }
}
