use super::inode::Inode;
use alloc::sync::Arc;

/// An open file: an inode plus a private position and write-deny mark.
/// Handles opened from the same inode never share their position.
pub struct File {
    inode: Arc<Inode>,
    pos: usize,
    deny_write: bool,
}

impl File {
    pub(super) fn open(inode: Arc<Inode>) -> File {
        File {
            inode,
            pos: 0,
            deny_write: false,
        }
    }

    /// A fresh handle on the same inode, position reset. The new handle's
    /// lifetime is independent of this one.
    pub fn reopen(&self) -> File {
        File::open(self.inode.clone())
    }

    /// Clone the handle including its attributes: same inode, same
    /// position, write-deny carried over. Used when forking FD tables.
    pub fn duplicate(&self) -> File {
        let mut file = File::open(self.inode.clone());
        file.pos = self.pos;
        if self.deny_write {
            file.deny_write();
        }
        file
    }

    pub fn length(&self) -> usize {
        self.inode.length()
    }

    /// Read from the current position, advancing it.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.inode.read_at(buf, self.pos);
        self.pos += n;
        n
    }

    /// Read at an explicit offset; the position is unaffected. The VM core
    /// loads pages through this so faults never move user-visible offsets.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        self.inode.read_at(buf, offset)
    }

    /// Write at the current position, advancing it by the bytes accepted.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let n = self.inode.write_at(buf, self.pos);
        self.pos += n;
        n
    }

    /// Write at an explicit offset; the position is unaffected.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        self.inode.write_at(buf, offset)
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Ban writes through any handle of this inode until this handle allows
    /// them again or is closed.
    pub fn deny_write(&mut self) {
        if !self.deny_write {
            self.deny_write = true;
            self.inode.deny_write();
        }
    }

    pub fn allow_write(&mut self) {
        if self.deny_write {
            self.deny_write = false;
            self.inode.allow_write();
        }
    }

    pub fn is_deny_write(&self) -> bool {
        self.deny_write
    }

    pub fn inode_id(&self) -> u64 {
        self.inode.id()
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
    }
}

#[cfg(test)]
mod tests {
    use super::super::{create, open, remove};

    #[test]
    fn independent_positions_shared_contents() {
        assert!(create("pos-test", 16));
        let mut a = open("pos-test").unwrap();
        let mut b = open("pos-test").unwrap();

        assert_eq!(a.write(b"hello"), 5);
        assert_eq!(a.tell(), 5);
        assert_eq!(b.tell(), 0, "handles must not share a position");

        let mut buf = [0u8; 5];
        assert_eq!(b.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        remove("pos-test");
    }

    #[test]
    fn duplicate_copies_position_and_inode() {
        assert!(create("dup-test", 16));
        let mut orig = open("dup-test").unwrap();
        orig.write(b"12345");

        let mut dup = orig.duplicate();
        assert_eq!(dup.tell(), 5);
        assert_eq!(dup.inode_id(), orig.inode_id());

        // Writes through the duplicate land in the shared inode.
        dup.write(b"678");
        let mut buf = [0u8; 8];
        assert_eq!(orig.read_at(&mut buf, 0), 8);
        assert_eq!(&buf, b"12345678");
        remove("dup-test");
    }

    #[test]
    fn deny_write_blocks_all_handles_until_closed() {
        assert!(create("deny-test", 8));
        let mut watched = open("deny-test").unwrap();
        watched.deny_write();

        let mut other = open("deny-test").unwrap();
        assert_eq!(other.write(b"x"), 0, "deny-write must cover every handle");

        drop(watched); // closing re-allows writes
        assert_eq!(other.write(b"x"), 1);
        remove("deny-test");
    }

    #[test]
    fn writes_do_not_grow_the_file() {
        assert!(create("grow-test", 4));
        let mut f = open("grow-test").unwrap();
        assert_eq!(f.write(b"abcdef"), 4);
        assert_eq!(f.length(), 4);
        remove("grow-test");
    }
}
