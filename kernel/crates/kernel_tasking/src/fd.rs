//! Per-process file-descriptor table.
//!
//! The VFS side of a descriptor is out of scope here; the table owns numbered
//! slots pointing at opaque open-file descriptions and hands out the lowest
//! free number, which is all the process model needs.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;

use kernel_abi::{EBADF, Errno};

pub type FdNum = i32;

/// An open file as the process sees it.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    num: FdNum,
    flags: u32,
    /// Path the descriptor was opened with; the VFS resolves it.
    description: Arc<String>,
}

impl FileDescriptor {
    #[must_use]
    pub fn num(&self) -> FdNum {
        self.num
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

#[derive(Debug, Default)]
pub struct FileDescriptorTable {
    entries: BTreeMap<FdNum, FileDescriptor>,
}

impl FileDescriptorTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a descriptor on the lowest free number.
    pub fn open(&mut self, description: impl Into<String>, flags: u32) -> FdNum {
        let num = (0..).find(|n| !self.entries.contains_key(n)).unwrap_or(0);
        self.entries.insert(
            num,
            FileDescriptor {
                num,
                flags,
                description: Arc::new(description.into()),
            },
        );
        num
    }

    pub fn close(&mut self, num: FdNum) -> Result<(), Errno> {
        self.entries.remove(&num).map(|_| ()).ok_or(EBADF)
    }

    #[must_use]
    pub fn get(&self, num: FdNum) -> Option<&FileDescriptor> {
        self.entries.get(&num)
    }

    pub fn dup(&mut self, num: FdNum) -> Result<FdNum, Errno> {
        let fd = self.entries.get(&num).ok_or(EBADF)?.clone();
        let new_num = (0..).find(|n| !self.entries.contains_key(n)).unwrap_or(0);
        self.entries.insert(
            new_num,
            FileDescriptor {
                num: new_num,
                ..fd
            },
        );
        Ok(new_num)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_take_the_lowest_free_number() {
        let mut table = FileDescriptorTable::new();
        assert_eq!(table.open("/dev/stdin", 0), 0);
        assert_eq!(table.open("/dev/stdout", 0), 1);
        assert_eq!(table.open("/dev/stderr", 0), 2);

        table.close(1).unwrap();
        assert_eq!(table.open("/tmp/file", 0), 1);
        assert_eq!(table.get(1).unwrap().description(), "/tmp/file");
    }

    #[test]
    fn close_of_unknown_descriptor_is_ebadf() {
        let mut table = FileDescriptorTable::new();
        assert_eq!(table.close(7), Err(EBADF));
    }

    #[test]
    fn dup_clones_the_description() {
        let mut table = FileDescriptorTable::new();
        let a = table.open("/dev/null", 0);
        let b = table.dup(a).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.get(b).unwrap().description(), "/dev/null");
    }
}
