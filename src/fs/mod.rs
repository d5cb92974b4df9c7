//! The file-system boundary. Only the file-object API is contractual to the
//! kernel cores; storage is a flat in-memory registry of named inodes.

pub mod fd;
pub mod file;
pub mod inode;

use crate::sync::Semaphore;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use file::File;
use inode::Inode;
use lazy_static::lazy_static;
use spin::Mutex;

/// Open files are shared behind a lock: FD tables, forked children, and the
/// VM core all hold handles into the same object.
pub type SharedFile = Arc<Mutex<File>>;

/// Global file-system semaphore. Every kernel call into the file layer is
/// serialized through this (the syscall layer and the VM core both take it
/// around file I/O).
pub static FILESYS_SEMA: Semaphore = Semaphore::new(1);

lazy_static! {
    static ref REGISTRY: Mutex<BTreeMap<String, Arc<Inode>>> = Mutex::new(BTreeMap::new());
    static ref NEXT_INODE_ID: Mutex<u64> = Mutex::new(1);
}

fn alloc_id() -> u64 {
    let mut id = NEXT_INODE_ID.lock();
    let val = *id;
    *id += 1;
    val
}

/// Create an empty file of `size` bytes. False if the name is taken.
pub fn create(name: &str, size: usize) -> bool {
    if name.is_empty() {
        return false;
    }
    let mut registry = REGISTRY.lock();
    if registry.contains_key(name) {
        return false;
    }
    registry.insert(String::from(name), Arc::new(Inode::new(alloc_id(), size)));
    true
}

/// Open a file by name. Each call returns an independent handle.
pub fn open(name: &str) -> Option<File> {
    let registry = REGISTRY.lock();
    registry.get(name).map(|inode| File::open(inode.clone()))
}

/// Unlink a file. Open handles keep the inode alive; the name is freed
/// immediately. False if no such file.
pub fn remove(name: &str) -> bool {
    REGISTRY.lock().remove(name).is_some()
}
